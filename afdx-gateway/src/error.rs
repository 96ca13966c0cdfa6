// AFDX Gateway - TDMA gateway dispatcher and runtime
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for AFDX Gateway

use std::net::SocketAddr;

use afdx::{AfdxError, PacketError};
use thiserror::Error;

/// Main error type for Gateway operations
///
/// Only setup can fail this way; per-datagram problems never leave the
/// dispatcher.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file unreadable
    #[error("Cannot read configuration: {0}")]
    ConfigIo(#[source] std::io::Error),

    /// Configuration file is not valid JSON for the schema
    #[error("Cannot parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The UDP socket could not be bound
    #[error("Cannot bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket I/O error outside the receive loop
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the protocol core
    #[error("Protocol error: {0}")]
    Core(#[from] AfdxError),
}

/// Result type alias for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Why a datagram was dropped
#[derive(Error, Debug)]
pub(crate) enum DispatchError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("Device {device_id} transmitted outside slot {slot_id}")]
    SlotTimingViolation { device_id: String, slot_id: u16 },

    #[error("Device {0} holds no slot")]
    NoSlot(String),

    #[error("Unknown device {0}")]
    UnknownDevice(String),

    #[error("Datagram of {size} bytes exceeds {max}")]
    Oversized { size: usize, max: usize },
}

impl DispatchError {
    /// Stale timestamp or sequence regression
    pub(crate) fn is_replay(&self) -> bool {
        match self {
            DispatchError::Packet(err) => AfdxError::from(err.clone()).is_replay(),
            _ => false,
        }
    }
}
