//! Error types for AFDX-lite
//!
//! This module defines all error types used throughout the core library.
//! Messages carry identifiers and sizes only, never key material.

use thiserror::Error;

/// Result type alias for AFDX operations
pub type Result<T> = std::result::Result<T, AfdxError>;

/// Main error type for AFDX operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AfdxError {
    /// Slot scheduling error
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Packet framing or crypto error
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Key, session or nonce error
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),
}

impl AfdxError {
    /// Whether this error belongs to the replay class (stale timestamp,
    /// sequence regression or nonce reuse)
    pub fn is_replay(&self) -> bool {
        matches!(
            self,
            AfdxError::Packet(PacketError::Stale { .. })
                | AfdxError::Packet(PacketError::SequenceRegression { .. })
                | AfdxError::Security(SecurityError::NonceRejected { .. })
        )
    }
}

/// Errors raised by the slot scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Every slot id is taken
    #[error("No available slots: all {max_slots} slots are assigned")]
    CapacityExceeded { max_slots: usize },

    /// The device already owns a slot
    #[error("Device {device_id} already holds slot {slot_id}")]
    AlreadyScheduled { device_id: String, slot_id: u16 },
}

/// Errors raised while creating or parsing packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram is not a valid packet
    #[error("Malformed packet: {reason}")]
    Malformed { reason: String },

    /// MAC missing, unreadable or not matching
    #[error("MAC verification failed")]
    MacVerificationFailure,

    /// Header timestamp older than the accepted message age
    #[error("Stale packet: age {age_ms}ms exceeds maximum {max_age_ms}ms")]
    Stale { age_ms: u64, max_age_ms: u64 },

    /// Sequence number did not move forward
    #[error("Sequence regression from {device_id}: got {received}, last {last}")]
    SequenceRegression {
        device_id: String,
        received: u16,
        last: u16,
    },

    /// Encrypted blob failed authentication or could not be decoded
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Header type outside the seven protocol message types
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Payload does not match the schema of its message type
    #[error("Invalid {message_type} payload: {reason}")]
    InvalidPayload {
        message_type: String,
        reason: String,
    },
}

impl PacketError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        PacketError::Malformed {
            reason: reason.into(),
        }
    }
}

/// Errors raised by the session security manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Device has no key record
    #[error("Device not registered: {device_id}")]
    DeviceNotRegistered { device_id: String },

    /// Public key could not be decoded
    #[error("Invalid public key for device {device_id}")]
    InvalidPublicKey { device_id: String },

    /// Signature could not be decoded
    #[error("Invalid signature encoding for device {device_id}")]
    InvalidSignature { device_id: String },

    /// Signature did not verify against the registered key
    #[error("Authentication failed for device {device_id}")]
    AuthenticationFailure { device_id: String },

    /// No session with this id
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Session exists but its TTL has elapsed
    #[error("Session expired: {session_id}")]
    SessionExpired { session_id: String },

    /// Challenge nonce unknown, reused or expired
    #[error("Nonce rejected for device {device_id}")]
    NonceRejected { device_id: String },

    /// Sealing or opening a message failed
    #[error("Cryptographic operation failed: {0}")]
    CryptoFailure(String),
}
