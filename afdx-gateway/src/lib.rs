// AFDX Gateway - TDMA gateway dispatcher and runtime
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # AFDX Gateway - TDMA gateway dispatcher and runtime
//!
//! This crate turns the `afdx` protocol core into a running gateway: it
//! admits field devices, hands out TDMA slots, broadcasts SYNC once per
//! cycle and routes every inbound packet through the device lifecycle.
//!
//! ## Features
//!
//! - **Device lifecycle**: JOIN, challenge authentication, HEARTBEAT, LEAVE, offline sweep
//! - **Slot enforcement**: DATA outside the device's active slot is dropped
//! - **Alert forwarding**: ALERTs are always acknowledged and forwarded
//! - **Fault isolation**: malformed or replayed datagrams never stop the loop
//! - **Pluggable edges**: [`Transport`] for the network, [`GatewayObserver`] for
//!   metrics, persistence and alerting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use afdx_gateway::{GatewayConfig, GatewayServer, NoopObserver};
//!
//! # async fn serve() -> afdx_gateway::Result<()> {
//! let config = GatewayConfig::load("gateway.json")?;
//! let server = GatewayServer::bind(config, NoopObserver).await?;
//! server.run(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   UDP datagram ──► GatewayServer (select! loop)
//!                         │
//!                         ▼
//!                     Gateway ──► PacketCodec (MAC, age, decrypt)
//!                         │
//!           ┌─────────────┼──────────────┐
//!           ▼             ▼              ▼
//!     SlotScheduler  SessionSecurity  DeviceTable
//!           │
//!           └─► CycleStarted ──► SYNC broadcast
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod gateway;
pub mod observer;
pub mod runtime;
pub mod transport;

pub use config::{
    DeviceSettings, GatewayConfig, NetworkSettings, PriorityQos, PriorityTable, QosSettings,
    SecuritySettings, TdmaSettings,
};
pub use devices::{DeviceRecord, DeviceState, DeviceTable};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayStats, GatewayStatus};
pub use observer::{
    AlertRecord, GatewayEvent, GatewayObserver, MemoryObserver, MessageRecord, NetworkMetric,
    NoopObserver, OperatorAlert, ProtocolMetric,
};
pub use runtime::{GatewayServer, Snapshot};
pub use transport::{
    Destination, MemoryTransport, SentDatagram, Transport, TransportMetrics, UdpTransport,
};
