// AFDX Gateway - TDMA gateway dispatcher and runtime
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! External collaborators
//!
//! Monitoring, persistence and alerting live outside the gateway. The
//! dispatcher reports to them through [`GatewayObserver`]; every call is
//! fire-and-forget and must not block.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use afdx::{Severity, SlotId};
use serde::Serialize;
use serde_json::Value;

use crate::devices::DeviceRecord;

/// Network-level measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkMetric {
    /// Datagram received (value: bytes)
    PacketReceived,
    /// Datagram sent (value: bytes)
    PacketSent,
    /// Datagram dropped before dispatch (value: 1)
    PacketLost,
    /// Slot activation latency (value: ms)
    Latency,
}

impl NetworkMetric {
    /// Metric name
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMetric::PacketReceived => "packet_received",
            NetworkMetric::PacketSent => "packet_sent",
            NetworkMetric::PacketLost => "packet_lost",
            NetworkMetric::Latency => "latency",
        }
    }
}

/// Protocol-level counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMetric {
    DeviceConnected,
    DeviceDisconnected,
    SessionCreated,
    SyncSent,
    AlertReceived,
    Error,
    AuthenticationFailure,
    ReplayDetected,
    SlotTimingViolation,
    JoinRejected,
}

impl ProtocolMetric {
    /// Every counter, in a stable order
    pub const ALL: [ProtocolMetric; 10] = [
        ProtocolMetric::DeviceConnected,
        ProtocolMetric::DeviceDisconnected,
        ProtocolMetric::SessionCreated,
        ProtocolMetric::SyncSent,
        ProtocolMetric::AlertReceived,
        ProtocolMetric::Error,
        ProtocolMetric::AuthenticationFailure,
        ProtocolMetric::ReplayDetected,
        ProtocolMetric::SlotTimingViolation,
        ProtocolMetric::JoinRejected,
    ];

    /// Metric name
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolMetric::DeviceConnected => "device_connected",
            ProtocolMetric::DeviceDisconnected => "device_disconnected",
            ProtocolMetric::SessionCreated => "session_created",
            ProtocolMetric::SyncSent => "sync_sent",
            ProtocolMetric::AlertReceived => "alert_received",
            ProtocolMetric::Error => "error",
            ProtocolMetric::AuthenticationFailure => "authentication_failure",
            ProtocolMetric::ReplayDetected => "replay_detected",
            ProtocolMetric::SlotTimingViolation => "slot_timing_violation",
            ProtocolMetric::JoinRejected => "join_rejected",
        }
    }
}

/// Lifecycle events of the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Started {
        timestamp: u64,
    },
    Stopped {
        timestamp: u64,
    },
    DeviceConnected {
        device_id: String,
        slot_id: SlotId,
    },
    DeviceDisconnected {
        device_id: String,
        slot_id: SlotId,
    },
    /// Swept after `offlineTimeout` of silence
    DeviceTimeout {
        device_id: String,
        last_seen: u64,
    },
    SlotActivated {
        slot_id: SlotId,
        device_id: String,
        cycle: u64,
        latency: u64,
    },
    SyncBroadcast {
        cycle: u64,
        slots: usize,
    },
    DataReceived {
        device_id: String,
        sequence: u16,
    },
    AlertReceived {
        device_id: String,
        severity: Severity,
    },
    /// A datagram was dropped
    MessageError {
        from: SocketAddr,
        reason: String,
    },
    SessionEstablished {
        device_id: String,
        session_id: String,
    },
    KeysRotated {
        rekeyed_devices: usize,
    },
}

/// An accepted DATA message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub device_id: String,
    pub message_type: String,
    pub sequence: u16,
    pub timestamp: u64,
    pub received_at: u64,
    pub payload: Value,
}

/// A device alert, as forwarded to monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub device_id: String,
    pub message: String,
    pub severity: Severity,
    pub data: Option<Value>,
    pub received_at: u64,
}

/// Sink for everything the gateway reports outward
///
/// All methods default to no-ops so implementors pick what they need.
pub trait GatewayObserver: Send + Sync {
    fn record_network_metric(&self, _metric: NetworkMetric, _value: f64) {}

    fn record_protocol_metric(&self, _metric: ProtocolMetric) {}

    /// Raise an operator alert
    fn create_alert(&self, _kind: &str, _message: &str, _severity: Severity) {}

    fn persist_device(&self, _device: &DeviceRecord) {}

    fn persist_message(&self, _message: &MessageRecord) {}

    fn persist_alert(&self, _alert: &AlertRecord) {}

    fn on_event(&self, _event: &GatewayEvent) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl GatewayObserver for NoopObserver {}

/// An alert raised through [`GatewayObserver::create_alert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAlert {
    pub kind: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Default)]
struct ObserverLog {
    network: Vec<(NetworkMetric, f64)>,
    protocol: Vec<ProtocolMetric>,
    alerts: Vec<OperatorAlert>,
    devices: Vec<DeviceRecord>,
    messages: Vec<MessageRecord>,
    device_alerts: Vec<AlertRecord>,
    events: Vec<GatewayEvent>,
}

/// Observer that keeps every call in memory
///
/// Used by tests and local simulation.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    log: Mutex<ObserverLog>,
}

impl MemoryObserver {
    /// Create an empty observer
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, ObserverLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lifecycle events so far
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.log().events.clone()
    }

    /// How many times a protocol counter was bumped
    pub fn protocol_count(&self, metric: ProtocolMetric) -> usize {
        self.log().protocol.iter().filter(|m| **m == metric).count()
    }

    /// Sum of all values recorded for a network metric
    pub fn network_total(&self, metric: NetworkMetric) -> f64 {
        self.log()
            .network
            .iter()
            .filter(|(m, _)| *m == metric)
            .map(|(_, value)| value)
            .sum()
    }

    /// Operator alerts raised
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.log().alerts.clone()
    }

    /// Persisted device snapshots, oldest first
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.log().devices.clone()
    }

    /// Persisted DATA messages
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.log().messages.clone()
    }

    /// Persisted device alerts
    pub fn device_alerts(&self) -> Vec<AlertRecord> {
        self.log().device_alerts.clone()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        *self.log() = ObserverLog::default();
    }
}

impl GatewayObserver for MemoryObserver {
    fn record_network_metric(&self, metric: NetworkMetric, value: f64) {
        self.log().network.push((metric, value));
    }

    fn record_protocol_metric(&self, metric: ProtocolMetric) {
        self.log().protocol.push(metric);
    }

    fn create_alert(&self, kind: &str, message: &str, severity: Severity) {
        self.log().alerts.push(OperatorAlert {
            kind: kind.to_string(),
            message: message.to_string(),
            severity,
        });
    }

    fn persist_device(&self, device: &DeviceRecord) {
        self.log().devices.push(device.clone());
    }

    fn persist_message(&self, message: &MessageRecord) {
        self.log().messages.push(message.clone());
    }

    fn persist_alert(&self, alert: &AlertRecord) {
        self.log().device_alerts.push(alert.clone());
    }

    fn on_event(&self, event: &GatewayEvent) {
        self.log().events.push(event.clone());
    }
}

impl<O: GatewayObserver + ?Sized> GatewayObserver for std::sync::Arc<O> {
    fn record_network_metric(&self, metric: NetworkMetric, value: f64) {
        (**self).record_network_metric(metric, value)
    }

    fn record_protocol_metric(&self, metric: ProtocolMetric) {
        (**self).record_protocol_metric(metric)
    }

    fn create_alert(&self, kind: &str, message: &str, severity: Severity) {
        (**self).create_alert(kind, message, severity)
    }

    fn persist_device(&self, device: &DeviceRecord) {
        (**self).persist_device(device)
    }

    fn persist_message(&self, message: &MessageRecord) {
        (**self).persist_message(message)
    }

    fn persist_alert(&self, alert: &AlertRecord) {
        (**self).persist_alert(alert)
    }

    fn on_event(&self, event: &GatewayEvent) {
        (**self).on_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_memory_observer_records() {
        let observer = MemoryObserver::new();
        observer.record_network_metric(NetworkMetric::PacketReceived, 120.0);
        observer.record_network_metric(NetworkMetric::PacketReceived, 80.0);
        observer.record_protocol_metric(ProtocolMetric::SyncSent);
        observer.create_alert("authentication_failure", "bad signature", Severity::High);
        observer.on_event(&GatewayEvent::Started { timestamp: 1 });

        assert_relative_eq!(observer.network_total(NetworkMetric::PacketReceived), 200.0);
        assert_eq!(observer.protocol_count(ProtocolMetric::SyncSent), 1);
        assert_eq!(observer.protocol_count(ProtocolMetric::Error), 0);
        assert_eq!(observer.alerts()[0].kind, "authentication_failure");
        assert_eq!(observer.events(), vec![GatewayEvent::Started { timestamp: 1 }]);

        observer.clear();
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_shared_observer_forwards() {
        let observer = std::sync::Arc::new(MemoryObserver::new());
        let shared: std::sync::Arc<MemoryObserver> = observer.clone();
        shared.record_protocol_metric(ProtocolMetric::JoinRejected);
        assert_eq!(observer.protocol_count(ProtocolMetric::JoinRejected), 1);
    }

    #[test]
    fn test_metric_names_are_unique() {
        let mut names: Vec<&str> = ProtocolMetric::ALL.iter().map(|m| m.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ProtocolMetric::ALL.len());
    }
}
