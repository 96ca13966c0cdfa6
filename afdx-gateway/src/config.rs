// AFDX Gateway - TDMA gateway dispatcher and runtime
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for AFDX Gateway
//!
//! Loaded from a JSON file whose sections mirror the deployment defaults;
//! every field may be omitted.
//!
//! ```json
//! {
//!   "network": { "udpPort": 5005, "broadcastIp": "255.255.255.255" },
//!   "tdma": { "syncInterval": 1000, "maxSlots": 100 },
//!   "security": { "enableEncryption": true, "enableMac": true },
//!   "qos": { "priorities": { "A": { "maxLatency": 10, "retries": 5, "bufferSize": 1000 } } },
//!   "devices": { "offlineTimeout": 60000 }
//! }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use afdx::crypto::{self, KeyBytes};
use afdx::{CodecConfig, PriorityClass, SchedulerConfig, SecurityConfig};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Encryption algorithm the codec implements
pub const ENCRYPTION_ALGORITHM: &str = "chacha20-poly1305";

/// MAC algorithm the codec implements
pub const MAC_ALGORITHM: &str = "hmac-sha256";

/// Gateway-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub network: NetworkSettings,
    pub tdma: TdmaSettings,
    pub security: SecuritySettings,
    pub qos: QosSettings,
    pub devices: DeviceSettings,
}

/// Sockets and addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkSettings {
    /// UDP port the gateway listens on
    pub udp_port: u16,
    /// Local address to bind
    pub bind_address: IpAddr,
    /// Destination address of SYNC broadcasts
    #[serde(rename = "broadcastIp", alias = "broadcastIP")]
    pub broadcast_ip: IpAddr,
    /// Destination port of SYNC broadcasts
    pub broadcast_port: u16,
    /// HTTP port of the daemon endpoints
    pub http_port: u16,
    /// Largest accepted datagram (bytes)
    pub max_datagram_size: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            udp_port: 5005,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            broadcast_ip: IpAddr::from([255, 255, 255, 255]),
            broadcast_port: 5005,
            http_port: 3000,
            max_datagram_size: afdx::MAX_DATAGRAM_SIZE,
        }
    }
}

/// Cycle and slot timing (all durations in ms)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TdmaSettings {
    pub sync_interval: u64,
    pub slot_duration: u64,
    pub frame_size: u64,
    pub max_slots: usize,
    pub guard_time: u64,
    /// Samples in the per-slot latency mean
    pub latency_window: usize,
}

impl Default for TdmaSettings {
    fn default() -> Self {
        Self {
            sync_interval: 1000,
            slot_duration: 10,
            frame_size: 1000,
            max_slots: 100,
            guard_time: 1,
            latency_window: 16,
        }
    }
}

/// Packet protection and key lifetimes (durations in ms)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecuritySettings {
    pub enable_encryption: bool,
    pub encryption_algorithm: String,
    pub enable_mac: bool,
    pub mac_algorithm: String,
    pub key_rotation_interval: u64,
    pub max_message_age: u64,
    pub session_ttl: u64,
    pub nonce_ttl: u64,
    /// Devices used within this window are re-keyed on rotation
    pub activity_window: u64,
    /// Shared network key, 64 hex characters; random when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_key: Option<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            enable_encryption: true,
            encryption_algorithm: ENCRYPTION_ALGORITHM.to_string(),
            enable_mac: true,
            mac_algorithm: MAC_ALGORITHM.to_string(),
            key_rotation_interval: 3_600_000,
            max_message_age: 30_000,
            session_ttl: 1_800_000,
            nonce_ttl: 300_000,
            activity_window: 3_600_000,
            network_key: None,
        }
    }
}

/// Per-class quality of service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityQos {
    /// Tolerated slot activation latency (ms)
    pub max_latency: u64,
    pub retries: u32,
    pub buffer_size: usize,
}

/// QoS table keyed by class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityTable {
    #[serde(rename = "A")]
    pub a: PriorityQos,
    #[serde(rename = "B")]
    pub b: PriorityQos,
    #[serde(rename = "C")]
    pub c: PriorityQos,
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self {
            a: PriorityQos {
                max_latency: 10,
                retries: 5,
                buffer_size: 1000,
            },
            b: PriorityQos {
                max_latency: 50,
                retries: 3,
                buffer_size: 500,
            },
            c: PriorityQos {
                max_latency: 100,
                retries: 2,
                buffer_size: 200,
            },
        }
    }
}

/// QoS section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosSettings {
    pub priorities: PriorityTable,
}

/// Device table limits and liveness (durations in ms)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceSettings {
    pub max_devices: usize,
    pub health_check_interval: u64,
    pub offline_timeout: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            max_devices: 100,
            health_check_interval: 10_000,
            offline_timeout: 60_000,
        }
    }
}

impl GatewayConfig {
    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(GatewayError::ConfigIo)?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration listening on a specific UDP port
    pub fn with_udp_port(udp_port: u16) -> Self {
        let mut config = Self::default();
        config.network.udp_port = udp_port;
        config
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(GatewayError::InvalidConfig(msg)) };

        let intervals = [
            ("tdma.syncInterval", self.tdma.sync_interval),
            ("tdma.slotDuration", self.tdma.slot_duration),
            ("tdma.frameSize", self.tdma.frame_size),
            ("security.keyRotationInterval", self.security.key_rotation_interval),
            ("security.maxMessageAge", self.security.max_message_age),
            ("security.sessionTtl", self.security.session_ttl),
            ("security.nonceTtl", self.security.nonce_ttl),
            ("devices.healthCheckInterval", self.devices.health_check_interval),
            ("devices.offlineTimeout", self.devices.offline_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return invalid(format!("{} must be greater than zero", name));
        }

        if self.tdma.max_slots == 0 || self.tdma.max_slots > 65_536 {
            return invalid(format!(
                "tdma.maxSlots must be in 1..=65536, got {}",
                self.tdma.max_slots
            ));
        }
        if self.tdma.latency_window == 0 {
            return invalid("tdma.latencyWindow must be greater than zero".to_string());
        }
        if self.devices.max_devices == 0 {
            return invalid("devices.maxDevices must be greater than zero".to_string());
        }
        if self.network.max_datagram_size == 0 {
            return invalid("network.maxDatagramSize must be greater than zero".to_string());
        }

        if !self
            .security
            .encryption_algorithm
            .eq_ignore_ascii_case(ENCRYPTION_ALGORITHM)
        {
            return invalid(format!(
                "unsupported encryption algorithm {:?}, expected {:?}",
                self.security.encryption_algorithm, ENCRYPTION_ALGORITHM
            ));
        }
        if !self.security.mac_algorithm.eq_ignore_ascii_case(MAC_ALGORITHM) {
            return invalid(format!(
                "unsupported MAC algorithm {:?}, expected {:?}",
                self.security.mac_algorithm, MAC_ALGORITHM
            ));
        }
        if let Some(key) = &self.security.network_key {
            if crypto::key_from_hex(key).is_err() {
                return invalid("security.networkKey must be 64 hex characters".to_string());
            }
        }
        Ok(())
    }

    /// QoS entry of a class
    pub fn qos(&self, priority: PriorityClass) -> &PriorityQos {
        match priority {
            PriorityClass::A => &self.qos.priorities.a,
            PriorityClass::B => &self.qos.priorities.b,
            PriorityClass::C => &self.qos.priorities.c,
        }
    }

    /// Scheduler settings
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sync_interval_ms: self.tdma.sync_interval,
            slot_duration_ms: self.tdma.slot_duration,
            frame_size_ms: self.tdma.frame_size,
            max_slots: self.tdma.max_slots,
            guard_time_ms: self.tdma.guard_time,
            max_latency_ms: [
                self.qos(PriorityClass::A).max_latency,
                self.qos(PriorityClass::B).max_latency,
                self.qos(PriorityClass::C).max_latency,
            ],
            latency_window: self.tdma.latency_window,
        }
    }

    /// Codec settings
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            enable_encryption: self.security.enable_encryption,
            enable_mac: self.security.enable_mac,
            max_message_age_ms: self.security.max_message_age,
        }
    }

    /// Security manager settings
    pub fn security_config(&self) -> SecurityConfig {
        SecurityConfig {
            session_ttl_ms: self.security.session_ttl,
            nonce_ttl_ms: self.security.nonce_ttl,
            key_rotation_interval_ms: self.security.key_rotation_interval,
            activity_window_ms: self.security.activity_window,
        }
    }

    /// Shared network key, generated when not configured
    pub fn network_key(&self) -> Result<KeyBytes> {
        match &self.security.network_key {
            Some(key) => crypto::key_from_hex(key).map_err(|_| {
                GatewayError::InvalidConfig("security.networkKey must be 64 hex characters".into())
            }),
            None => Ok(crypto::random_key()),
        }
    }

    /// Local UDP address
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network.bind_address, self.network.udp_port)
    }

    /// SYNC broadcast destination
    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network.broadcast_ip, self.network.broadcast_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.network.udp_port, 5005);
        assert_eq!(config.tdma.sync_interval, 1000);
        assert_eq!(config.tdma.max_slots, 100);
        assert_eq!(config.security.key_rotation_interval, 3_600_000);
        assert_eq!(config.qos(PriorityClass::B).max_latency, 50);
        assert_eq!(config.devices.offline_timeout, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = GatewayConfig::from_json(
            r#"{ "network": { "udpPort": 6000, "broadcastIP": "10.0.0.255" },
                 "tdma": { "maxSlots": 8 },
                 "qos": { "priorities": {
                     "A": { "maxLatency": 5, "retries": 1, "bufferSize": 10 } } } }"#,
        )
        .unwrap();

        assert_eq!(config.network.udp_port, 6000);
        assert_eq!(config.broadcast_addr().to_string(), "10.0.0.255:5005");
        assert_eq!(config.tdma.max_slots, 8);
        assert_eq!(config.tdma.slot_duration, 10);
        assert_eq!(config.qos(PriorityClass::A).max_latency, 5);
        assert_eq!(config.qos(PriorityClass::C).max_latency, 100);
        assert_eq!(config.scheduler_config().max_latency_ms, [5, 50, 100]);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = GatewayConfig::default();
        config.tdma.sync_interval = 0;
        assert!(matches!(config.validate(), Err(GatewayError::InvalidConfig(_))));

        let mut config = GatewayConfig::default();
        config.tdma.max_slots = 70_000;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.security.encryption_algorithm = "aes-256-cbc".to_string();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.security.network_key = Some("abcd".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_key() {
        let mut config = GatewayConfig::default();
        config.security.network_key = Some("11".repeat(32));
        assert_eq!(config.network_key().unwrap(), [0x11; 32]);

        config.security.network_key = None;
        assert_ne!(config.network_key().unwrap(), config.network_key().unwrap());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "devices": {{ "maxDevices": 3 }} }}"#).unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.devices.max_devices, 3);

        assert!(matches!(
            GatewayConfig::load("/nonexistent/afdx.json"),
            Err(GatewayError::ConfigIo(_))
        ));
    }

    #[test]
    fn test_derived_core_configs() {
        let config = GatewayConfig::default();
        let codec = config.codec_config();
        assert!(codec.enable_encryption && codec.enable_mac);
        assert_eq!(codec.max_message_age_ms, 30_000);
        assert_eq!(config.security_config().session_ttl_ms, 1_800_000);
        assert_eq!(config.bind_addr().port(), 5005);
    }
}
