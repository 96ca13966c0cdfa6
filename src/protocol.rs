// AFDX-lite - TDMA gateway protocol core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Protocol definitions for AFDX-lite
//!
//! This module defines the wire types of the protocol:
//! - Packet header and envelope (JSON, one packet per datagram)
//! - Message types and priority classes
//! - Typed payload schemas, one per message type
//!
//! ```text
//! {
//!   "header": { "version": "1.0", "type": "DATA", "timestamp": 1700000000000,
//!               "sequence": 42, "deviceId": "D1", "priority": "A" },
//!   "payload": { ... },          // iff encryption disabled
//!   "encrypted": "<iv>:<ct>",    // iff encryption enabled
//!   "mac": "<hex>"               // iff MAC enabled
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::error::PacketError;

/// Slot identifier, unique in `0..max_slots`
pub type SlotId = u16;

/// Device id the gateway uses in headers it emits
pub const GATEWAY_ID: &str = "GATEWAY";

/// Current wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Message types in the AFDX-lite protocol
///
/// Tags outside the seven known types are kept as [`MessageType::Other`] so
/// the dispatcher can log and ignore them instead of failing the parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Cycle synchronization broadcast
    Sync,
    /// Application data, only accepted inside the sender's slot
    Data,
    /// Safety-relevant alert, never subject to slot timing
    Alert,
    /// Acknowledgment
    Ack,
    /// Admission request
    Join,
    /// Graceful departure
    Leave,
    /// Keep-alive
    Heartbeat,
    /// Unrecognized tag
    Other(String),
}

impl MessageType {
    /// Wire tag of this type
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Sync => "SYNC",
            MessageType::Data => "DATA",
            MessageType::Alert => "ALERT",
            MessageType::Ack => "ACK",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Other(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "SYNC" => MessageType::Sync,
            "DATA" => MessageType::Data,
            "ALERT" => MessageType::Alert,
            "ACK" => MessageType::Ack,
            "JOIN" => MessageType::Join,
            "LEAVE" => MessageType::Leave,
            "HEARTBEAT" => MessageType::Heartbeat,
            _ => MessageType::Other(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(message_type: MessageType) -> Self {
        message_type.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority classes, ordered from most to least urgent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum PriorityClass {
    /// Critical
    A,
    /// Operational
    #[default]
    B,
    /// Background
    C,
}

impl PriorityClass {
    /// Numeric level, lower is more urgent
    pub fn level(&self) -> u8 {
        match self {
            PriorityClass::A => 0,
            PriorityClass::B => 1,
            PriorityClass::C => 2,
        }
    }

    /// Convert from a numeric level
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(PriorityClass::A),
            1 => Some(PriorityClass::B),
            2 => Some(PriorityClass::C),
            _ => None,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityClass::A => write!(f, "A"),
            PriorityClass::B => write!(f, "B"),
            PriorityClass::C => write!(f, "C"),
        }
    }
}

/// Severity of an alert
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Low importance
    Low,
    /// Medium importance
    Medium,
    /// High importance (default for device alerts)
    #[default]
    High,
    /// Critical event
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Packet header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketHeader {
    /// Protocol version string
    pub version: String,
    /// Message type tag
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Creation time, milliseconds since epoch
    pub timestamp: u64,
    /// Per-sender sequence number
    pub sequence: u16,
    /// Sender device id
    pub device_id: String,
    /// Priority class of the sender
    pub priority: PriorityClass,
}

impl PacketHeader {
    /// Canonical JSON of the header, the bytes covered by MAC and AEAD
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(|e| PacketError::malformed(e.to_string()))
    }
}

/// A packet as carried in one datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Header
    pub header: PacketHeader,
    /// Plain payload (encryption disabled, or after decryption)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// `<iv_hex>:<ciphertext_hex>` (encryption enabled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<String>,
    /// Hex HMAC over header and body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl Packet {
    /// Serialize to the datagram representation
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(|e| PacketError::malformed(e.to_string()))
    }

    /// Message type from the header
    pub fn message_type(&self) -> &MessageType {
        &self.header.message_type
    }

    /// Decode the payload into its typed message
    ///
    /// Fails on encrypted packets that have not been opened yet.
    pub fn message(&self) -> Result<Message, PacketError> {
        let payload = match (&self.payload, &self.encrypted) {
            (Some(payload), _) => payload.clone(),
            (None, Some(_)) => return Err(PacketError::malformed("payload still encrypted")),
            (None, None) => Value::Null,
        };
        Message::from_parts(&self.header.message_type, payload)
    }

    /// Bytes of the body as covered by the MAC
    pub(crate) fn body_bytes(&self) -> Result<Vec<u8>, PacketError> {
        let payload = self
            .payload
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| PacketError::malformed(e.to_string()))?;
        select_body(payload.as_deref(), self.encrypted.as_deref()).map(<[u8]>::to_vec)
    }
}

/// A packet as received, payload kept as its exact wire text
///
/// The MAC covers the body bytes the sender wrote, so they are checked
/// before the payload is decoded into a [`Value`].
#[derive(Debug, Deserialize)]
pub(crate) struct WirePacket {
    pub header: PacketHeader,
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
    #[serde(default)]
    pub encrypted: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

impl WirePacket {
    /// Received body bytes, as covered by the MAC
    pub(crate) fn body_bytes(&self) -> Result<&[u8], PacketError> {
        select_body(
            self.payload.as_deref().map(|raw| raw.get().as_bytes()),
            self.encrypted.as_deref(),
        )
    }
}

/// Exactly one of payload and encrypted blob
fn select_body<'a>(
    payload: Option<&'a [u8]>,
    encrypted: Option<&'a str>,
) -> Result<&'a [u8], PacketError> {
    match (payload, encrypted) {
        (Some(payload), None) => Ok(payload),
        (None, Some(blob)) => Ok(blob.as_bytes()),
        (Some(_), Some(_)) => Err(PacketError::malformed(
            "both payload and encrypted blob present",
        )),
        (None, None) => Err(PacketError::malformed("no payload")),
    }
}

/// One row of the slot table, as broadcast in SYNC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEntry {
    /// Device holding the slot
    pub device_id: String,
    /// Priority class of the device
    pub priority: PriorityClass,
    /// Slot length in milliseconds
    pub duration_ms: u64,
    /// Requested bandwidth in bps
    pub bandwidth: u32,
    /// Whether the slot is open right now
    pub active: bool,
}

/// SYNC payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    /// Gateway time at broadcast
    pub timestamp: u64,
    /// Cycle number
    pub cycle: u64,
    /// Full slot table
    pub slots: BTreeMap<SlotId, SlotEntry>,
    /// Frame size in milliseconds
    pub frame_size: u64,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// DATA payload: application fields plus the ack request flag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    /// Ask the gateway to acknowledge this message
    #[serde(default, skip_serializing_if = "is_false")]
    pub requires_ack: bool,
    /// Application fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DataPayload {
    /// Create a payload from application fields
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            requires_ack: false,
            fields,
        }
    }

    /// Request an acknowledgment
    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }
}

/// ALERT payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Human readable alert text
    pub message: String,
    /// Severity, HIGH when omitted
    #[serde(default)]
    pub severity: Severity,
    /// Optional measurement attached to the alert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Status carried by an ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    /// JOIN accepted
    Accepted,
    /// JOIN refused (bad request)
    Rejected,
    /// JOIN failed inside the gateway
    Error,
    /// LEAVE acknowledged
    Goodbye,
}

/// ACK payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Outcome of a JOIN or LEAVE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AckStatus>,
    /// Assigned slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
    /// Device key sealed under the gateway master key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
    /// Cycle length in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval: Option<u64>,
    /// Why a JOIN was refused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Sequence number of the acknowledged message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u16>,
    /// Single-use challenge for the authentication step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
}

impl AckPayload {
    /// JOIN accepted
    pub fn accepted(
        slot_id: SlotId,
        encrypted_key: String,
        sync_interval: u64,
        challenge: String,
    ) -> Self {
        Self {
            status: Some(AckStatus::Accepted),
            slot_id: Some(slot_id),
            encrypted_key: Some(encrypted_key),
            sync_interval: Some(sync_interval),
            challenge: Some(challenge),
            ..Default::default()
        }
    }

    /// JOIN refused
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: Some(AckStatus::Rejected),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// JOIN failed inside the gateway
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: Some(AckStatus::Error),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// LEAVE acknowledged
    pub fn goodbye() -> Self {
        Self {
            status: Some(AckStatus::Goodbye),
            ..Default::default()
        }
    }

    /// Acknowledge a DATA or ALERT by sequence number
    pub fn for_message(sequence: u16) -> Self {
        Self {
            message_id: Some(sequence),
            ..Default::default()
        }
    }
}

/// JOIN payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    /// Hex Ed25519 public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Requested priority class (B when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<PriorityClass>,
    /// Requested bandwidth in bps (1000 when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u32>,
}

/// LEAVE payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePayload {
    /// Optional reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Signed challenge sent by a device in a HEARTBEAT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProof {
    /// Challenge received in the JOIN ACK
    pub challenge: String,
    /// Hex Ed25519 signature over the challenge bytes
    pub signature: String,
}

/// Session granted after a successful authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    /// Session id
    pub session_id: String,
    /// Session key sealed under the device key
    pub session_key: String,
    /// Expiry, milliseconds since epoch
    pub expires_at: u64,
}

/// HEARTBEAT payload (both directions)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Sender time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Device to gateway: signed challenge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthProof>,
    /// Gateway to device: granted session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionTicket>,
}

/// Typed message, one variant per protocol message type
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// SYNC
    Sync(SyncPayload),
    /// DATA
    Data(DataPayload),
    /// ALERT
    Alert(AlertPayload),
    /// ACK
    Ack(AckPayload),
    /// JOIN
    Join(JoinPayload),
    /// LEAVE
    Leave(LeavePayload),
    /// HEARTBEAT
    Heartbeat(HeartbeatPayload),
}

impl Message {
    /// Message type tag of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Sync(_) => MessageType::Sync,
            Message::Data(_) => MessageType::Data,
            Message::Alert(_) => MessageType::Alert,
            Message::Ack(_) => MessageType::Ack,
            Message::Join(_) => MessageType::Join,
            Message::Leave(_) => MessageType::Leave,
            Message::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    /// Payload as a JSON value
    pub fn to_value(&self) -> Result<Value, PacketError> {
        let value = match self {
            Message::Sync(p) => serde_json::to_value(p),
            Message::Data(p) => serde_json::to_value(p),
            Message::Alert(p) => serde_json::to_value(p),
            Message::Ack(p) => serde_json::to_value(p),
            Message::Join(p) => serde_json::to_value(p),
            Message::Leave(p) => serde_json::to_value(p),
            Message::Heartbeat(p) => serde_json::to_value(p),
        };
        value.map_err(|e| PacketError::malformed(e.to_string()))
    }

    /// Decode a payload according to its header type
    pub fn from_parts(message_type: &MessageType, payload: Value) -> Result<Self, PacketError> {
        // Message types whose fields are all optional accept an absent body
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        match message_type {
            MessageType::Sync => decode(message_type, payload).map(Message::Sync),
            MessageType::Data => decode(message_type, payload).map(Message::Data),
            MessageType::Alert => decode(message_type, payload).map(Message::Alert),
            MessageType::Ack => decode(message_type, payload).map(Message::Ack),
            MessageType::Join => decode(message_type, payload).map(Message::Join),
            MessageType::Leave => decode(message_type, payload).map(Message::Leave),
            MessageType::Heartbeat => decode(message_type, payload).map(Message::Heartbeat),
            MessageType::Other(tag) => Err(PacketError::UnknownMessageType(tag.clone())),
        }
    }
}

fn decode<T: DeserializeOwned>(
    message_type: &MessageType,
    payload: Value,
) -> Result<T, PacketError> {
    serde_json::from_value(payload).map_err(|e| PacketError::InvalidPayload {
        message_type: message_type.to_string(),
        reason: e.to_string(),
    })
}
