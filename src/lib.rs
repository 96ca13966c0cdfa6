//! # AFDX-lite - TDMA gateway protocol core
//!
//! Deterministic, priority-aware channel access for field devices sharing a
//! broadcast medium, with an authenticated and encrypted packet protocol.
//!
//! ## Key Features
//!
//! - **TDMA Scheduling**: One slot per device, laid out by priority class (A/B/C)
//! - **Authenticated Packets**: ChaCha20-Poly1305 payloads, HMAC-SHA256 envelopes
//! - **Session Security**: Ed25519 challenge authentication, session keys, key rotation
//! - **Replay Protection**: Message age, sequence numbers and single-use nonces
//!
//! ## Quick Start
//!
//! ```rust
//! use afdx::{CodecConfig, Message, PacketCodec, PriorityClass, SchedulerConfig, SlotScheduler};
//! use afdx::protocol::HeartbeatPayload;
//!
//! // Give a device a slot and run one cycle
//! let mut scheduler = SlotScheduler::new(SchedulerConfig::default());
//! let slot = scheduler.add_device("D1", PriorityClass::A, 1000).unwrap();
//! scheduler.start(0);
//! scheduler.poll(0);
//! assert!(scheduler.is_slot_active(slot));
//!
//! // Frame a message and read it back with the same network key
//! let key = afdx::crypto::random_key();
//! let mut device = PacketCodec::new(CodecConfig::default(), key);
//! let mut gateway = PacketCodec::new(CodecConfig::default(), key);
//!
//! let message = Message::Heartbeat(HeartbeatPayload::default());
//! let packet = device.create_packet(&message, "D1", PriorityClass::A, 1_000).unwrap();
//! let parsed = gateway.parse_packet(&packet.to_bytes().unwrap(), 1_010).unwrap();
//! assert_eq!(parsed.message().unwrap(), message);
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire format, message types and payload schemas
//! - [`codec`]: Packet framing, sequence numbers, encryption and MAC
//! - [`security`]: Device keys, sessions, nonces and key rotation
//! - [`scheduler`]: Slot table and cycle timing
//! - [`timer`]: Cancellable deadline queue
//! - [`metrics`]: Codec statistics
//! - [`health`]: Health checks

// Modules
pub mod codec;
pub mod crypto;
pub mod error;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod scheduler;
pub mod security;
pub mod timer;

// Re-exports for convenient access
pub use codec::{CodecConfig, PacketCodec};
pub use error::{AfdxError, PacketError, Result, SchedulerError, SecurityError};
pub use health::{HealthCheck, HealthConfig, HealthMonitor, HealthStatus};
pub use metrics::{ProtocolMetrics, RejectReason};
pub use protocol::{
    now_millis, AckPayload, AckStatus, Message, MessageType, Packet, PacketHeader, PriorityClass,
    Severity, SlotEntry, SlotId, GATEWAY_ID,
};
pub use scheduler::{
    SchedulerConfig, SchedulerEvent, SchedulerStats, Slot, SlotScheduler, SlotStats,
};
pub use security::{
    RotationReport, SecurityConfig, Session, SessionGrant, SessionSecurityManager,
};
pub use timer::{TimerId, TimerQueue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version carried in every packet header
pub const PROTOCOL_VERSION: &str = "1.0";

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
