// AFDX-lite - TDMA gateway protocol core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Packet codec
//!
//! Frames messages into [`Packet`]s and back:
//! - stamps time and per-sender sequence numbers
//! - encrypts the payload (ChaCha20-Poly1305, header as associated data)
//! - attaches and verifies an HMAC-SHA256 over header and body
//!
//! Parsing verifies the MAC before any other field is trusted, then checks
//! the message age, then decrypts.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::crypto::{self, KeyBytes};
use crate::error::PacketError;
use crate::metrics::ProtocolMetrics;
use crate::protocol::{Message, MessageType, Packet, PacketHeader, PriorityClass, WirePacket};

/// Codec configuration
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Encrypt payloads on creation
    pub enable_encryption: bool,
    /// Attach a MAC on creation and require one on parse
    pub enable_mac: bool,
    /// Maximum accepted age of an inbound packet (ms)
    pub max_message_age_ms: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            enable_encryption: true,
            enable_mac: true,
            max_message_age_ms: 30_000,
        }
    }
}

impl CodecConfig {
    /// Plain JSON packets, no encryption and no MAC
    pub fn plaintext() -> Self {
        Self {
            enable_encryption: false,
            enable_mac: false,
            ..Default::default()
        }
    }
}

/// Packet codec holding the network key and sequence counters
pub struct PacketCodec {
    config: CodecConfig,
    key: KeyBytes,
    /// Last sequence number issued per sender
    outbound: HashMap<String, u16>,
    /// Last sequence number accepted per sender
    inbound: HashMap<String, u16>,
    metrics: ProtocolMetrics,
}

impl fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketCodec")
            .field("config", &self.config)
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.len())
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl PacketCodec {
    /// Create a codec with a shared network key
    pub fn new(config: CodecConfig, key: KeyBytes) -> Self {
        Self {
            config,
            key,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            metrics: ProtocolMetrics::new(),
        }
    }

    /// Create a codec with a random key (useful when only this process
    /// talks to itself, e.g. tests)
    pub fn with_random_key(config: CodecConfig) -> Self {
        Self::new(config, crypto::random_key())
    }

    /// Get configuration
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Get statistics
    pub fn metrics(&self) -> &ProtocolMetrics {
        &self.metrics
    }

    /// Replace the network key
    pub fn set_key(&mut self, key: KeyBytes) {
        self.key = key;
    }

    /// Build a packet from a typed message
    pub fn create_packet(
        &mut self,
        message: &Message,
        device_id: &str,
        priority: PriorityClass,
        now_ms: u64,
    ) -> Result<Packet, PacketError> {
        let payload = message.to_value()?;
        self.create_raw(message.message_type(), device_id, payload, priority, now_ms)
    }

    /// Build a packet from an arbitrary JSON payload
    pub fn create_raw(
        &mut self,
        message_type: MessageType,
        device_id: &str,
        payload: Value,
        priority: PriorityClass,
        now_ms: u64,
    ) -> Result<Packet, PacketError> {
        let header = PacketHeader {
            version: crate::PROTOCOL_VERSION.to_string(),
            message_type,
            timestamp: now_ms,
            sequence: self.next_sequence(device_id),
            device_id: device_id.to_string(),
            priority,
        };
        let header_bytes = header.canonical_bytes()?;

        let mut packet = Packet {
            header,
            payload: Some(payload),
            encrypted: None,
            mac: None,
        };

        if self.config.enable_encryption {
            let plaintext = serde_json::to_vec(&packet.payload)
                .map_err(|e| PacketError::malformed(e.to_string()))?;
            let sealed = crypto::seal(&self.key, &plaintext, &header_bytes)
                .map_err(|e| PacketError::malformed(e.to_string()))?;
            packet.encrypted = Some(sealed);
            packet.payload = None;
        }

        if self.config.enable_mac {
            let body = packet.body_bytes()?;
            let tag = crypto::compute_mac(&self.key, &[&header_bytes, &body])
                .map_err(|e| PacketError::malformed(e.to_string()))?;
            packet.mac = Some(tag);
        }

        self.metrics.record_created();
        Ok(packet)
    }

    /// Parse and authenticate a datagram
    pub fn parse_packet(&mut self, raw: &[u8], now_ms: u64) -> Result<Packet, PacketError> {
        let result = serde_json::from_slice::<WirePacket>(raw)
            .map_err(|e| PacketError::malformed(e.to_string()))
            .and_then(|wire| self.open_packet(wire, now_ms));

        match &result {
            Ok(_) => self.metrics.record_parsed(raw.len()),
            Err(err) => {
                log::debug!("packet rejected: {}", err);
                self.metrics.record_rejection(err);
            }
        }
        result
    }

    fn open_packet(&self, wire: WirePacket, now_ms: u64) -> Result<Packet, PacketError> {
        let header_bytes = wire.header.canonical_bytes()?;
        let body = wire.body_bytes()?;

        match &wire.mac {
            Some(tag) => {
                if !crypto::verify_mac(&self.key, &[header_bytes.as_slice(), body], tag) {
                    return Err(PacketError::MacVerificationFailure);
                }
            }
            None if self.config.enable_mac => return Err(PacketError::MacVerificationFailure),
            None => {}
        }

        let age_ms = now_ms.saturating_sub(wire.header.timestamp);
        if age_ms > self.config.max_message_age_ms {
            return Err(PacketError::Stale {
                age_ms,
                max_age_ms: self.config.max_message_age_ms,
            });
        }

        let payload: Value = match &wire.encrypted {
            Some(blob) => {
                let plaintext = crypto::open(&self.key, blob, &header_bytes)
                    .map_err(|_| PacketError::DecryptionFailed)?;
                serde_json::from_slice(&plaintext).map_err(|_| PacketError::DecryptionFailed)?
            }
            None => serde_json::from_slice(body)
                .map_err(|e| PacketError::malformed(e.to_string()))?,
        };

        Ok(Packet {
            header: wire.header,
            payload: Some(payload),
            encrypted: None,
            mac: wire.mac,
        })
    }

    /// Advance and return the outbound sequence number for a sender
    ///
    /// Starts at 1 and wraps at 65536.
    pub fn next_sequence(&mut self, device_id: &str) -> u16 {
        let counter = self.outbound.entry(device_id.to_string()).or_insert(0);
        *counter = counter.wrapping_add(1);
        *counter
    }

    /// Check an inbound sequence number and record it when it moves forward
    ///
    /// Gaps are tolerated; duplicates and regressions (modulo 65536) are
    /// rejected.
    pub fn check_sequence(&mut self, device_id: &str, sequence: u16) -> Result<(), PacketError> {
        self.verify_sequence(device_id, sequence)?;
        self.commit_sequence(device_id, sequence);
        Ok(())
    }

    /// Check an inbound sequence number without recording it
    ///
    /// Pair with [`PacketCodec::commit_sequence`] once the packet has been
    /// acted on, so a packet refused later does not use up its number.
    pub fn verify_sequence(&mut self, device_id: &str, sequence: u16) -> Result<(), PacketError> {
        let Some(&last) = self.inbound.get(device_id) else {
            return Ok(());
        };
        let distance = sequence.wrapping_sub(last) as i16;
        if distance > 0 {
            return Ok(());
        }
        let err = PacketError::SequenceRegression {
            device_id: device_id.to_string(),
            received: sequence,
            last,
        };
        log::warn!("{}", err);
        self.metrics.record_rejection(&err);
        Err(err)
    }

    /// Record `sequence` as the last accepted from a sender
    pub fn commit_sequence(&mut self, device_id: &str, sequence: u16) {
        self.inbound.insert(device_id.to_string(), sequence);
    }

    /// Boolean form of [`PacketCodec::check_sequence`]
    pub fn validate_sequence(&mut self, device_id: &str, sequence: u16) -> bool {
        self.check_sequence(device_id, sequence).is_ok()
    }

    /// Forget the inbound sequence record of a sender
    pub fn reset_sequence(&mut self, device_id: &str) {
        self.inbound.remove(device_id);
    }
}
