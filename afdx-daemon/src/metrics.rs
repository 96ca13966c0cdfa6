// AFDX Daemon - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the gateway.
//!
//! [`PrometheusObserver`] receives the gateway's collaborator calls and
//! turns them into counters; [`PrometheusObserver::observe_snapshot`]
//! refreshes the gauges from published status snapshots.

use afdx::{HealthStatus, Severity};
use afdx_gateway::{
    AlertRecord, GatewayEvent, GatewayObserver, MessageRecord, NetworkMetric, ProtocolMetric,
    Snapshot,
};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    /// Registry served on `/metrics`
    pub static ref REGISTRY: Registry = Registry::new();
}

/// Slot activation latency buckets, milliseconds
const LATENCY_BUCKETS: &[f64] = &[0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0, 500.0];

/// Gateway observer backed by Prometheus metrics
#[derive(Clone)]
pub struct PrometheusObserver {
    packets_received: IntCounter,
    packets_sent: IntCounter,
    packets_lost: IntCounter,
    bytes_received: IntCounter,
    bytes_sent: IntCounter,
    slot_latency: Histogram,
    protocol_events: IntCounterVec,
    operator_alerts: IntCounterVec,
    device_alerts: IntCounterVec,
    data_messages: IntCounter,
    devices: IntGauge,
    online_devices: IntGauge,
    active_slots: IntGauge,
    sessions: IntGauge,
    slot_utilization: Gauge,
    current_cycle: IntGauge,
    health: IntGauge,
}

impl PrometheusObserver {
    /// Register every metric in the global [`REGISTRY`]
    pub fn new() -> prometheus::Result<Self> {
        Self::register(&REGISTRY)
    }

    /// Register every metric in `registry`
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let observer = Self {
            packets_received: IntCounter::new(
                "afdx_packets_received_total",
                "Datagrams received by the gateway",
            )?,
            packets_sent: IntCounter::new(
                "afdx_packets_sent_total",
                "Datagrams sent by the gateway",
            )?,
            packets_lost: IntCounter::new(
                "afdx_packets_dropped_total",
                "Datagrams dropped before or during dispatch",
            )?,
            bytes_received: IntCounter::new(
                "afdx_received_bytes_total",
                "Bytes received by the gateway",
            )?,
            bytes_sent: IntCounter::new("afdx_sent_bytes_total", "Bytes sent by the gateway")?,
            slot_latency: Histogram::with_opts(
                HistogramOpts::new(
                    "afdx_slot_latency_ms",
                    "Delay between scheduled and actual slot activation in milliseconds",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
            )?,
            protocol_events: IntCounterVec::new(
                Opts::new("afdx_protocol_events_total", "Protocol events by kind"),
                &["event"],
            )?,
            operator_alerts: IntCounterVec::new(
                Opts::new("afdx_operator_alerts_total", "Operator alerts raised"),
                &["kind", "severity"],
            )?,
            device_alerts: IntCounterVec::new(
                Opts::new("afdx_device_alerts_total", "ALERT messages from devices"),
                &["severity"],
            )?,
            data_messages: IntCounter::new(
                "afdx_data_messages_total",
                "DATA messages accepted inside their slot",
            )?,
            devices: IntGauge::new("afdx_devices", "Devices in the device table")?,
            online_devices: IntGauge::new("afdx_devices_online", "Devices currently online")?,
            active_slots: IntGauge::new("afdx_active_slots", "Slots currently open")?,
            sessions: IntGauge::new("afdx_sessions", "Authenticated sessions")?,
            slot_utilization: Gauge::new(
                "afdx_slot_utilization",
                "Share of the slot id space in use (0-1)",
            )?,
            current_cycle: IntGauge::new("afdx_current_cycle", "Current TDMA cycle number")?,
            health: IntGauge::new(
                "afdx_health",
                "Overall health (0=Healthy, 1=Degraded, 2=Unhealthy, 3=Unknown)",
            )?,
        };

        registry.register(Box::new(observer.packets_received.clone()))?;
        registry.register(Box::new(observer.packets_sent.clone()))?;
        registry.register(Box::new(observer.packets_lost.clone()))?;
        registry.register(Box::new(observer.bytes_received.clone()))?;
        registry.register(Box::new(observer.bytes_sent.clone()))?;
        registry.register(Box::new(observer.slot_latency.clone()))?;
        registry.register(Box::new(observer.protocol_events.clone()))?;
        registry.register(Box::new(observer.operator_alerts.clone()))?;
        registry.register(Box::new(observer.device_alerts.clone()))?;
        registry.register(Box::new(observer.data_messages.clone()))?;
        registry.register(Box::new(observer.devices.clone()))?;
        registry.register(Box::new(observer.online_devices.clone()))?;
        registry.register(Box::new(observer.active_slots.clone()))?;
        registry.register(Box::new(observer.sessions.clone()))?;
        registry.register(Box::new(observer.slot_utilization.clone()))?;
        registry.register(Box::new(observer.current_cycle.clone()))?;
        registry.register(Box::new(observer.health.clone()))?;

        // Export every event kind from the first scrape
        for metric in ProtocolMetric::ALL {
            observer
                .protocol_events
                .with_label_values(&[metric.as_str()]);
        }
        Ok(observer)
    }

    /// Refresh gauges from a status snapshot
    pub fn observe_snapshot(&self, snapshot: &Snapshot) {
        let status = &snapshot.status;
        self.devices.set(status.devices as i64);
        self.online_devices.set(status.online_devices as i64);
        self.active_slots.set(status.active_slots as i64);
        self.sessions.set(status.sessions as i64);
        self.slot_utilization.set(status.scheduler.utilization);
        self.current_cycle.set(status.scheduler.current_cycle as i64);
        self.health.set(health_code(snapshot.health));
    }
}

impl GatewayObserver for PrometheusObserver {
    fn record_network_metric(&self, metric: NetworkMetric, value: f64) {
        match metric {
            NetworkMetric::PacketReceived => {
                self.packets_received.inc();
                self.bytes_received.inc_by(value as u64);
            }
            NetworkMetric::PacketSent => {
                self.packets_sent.inc();
                self.bytes_sent.inc_by(value as u64);
            }
            NetworkMetric::PacketLost => self.packets_lost.inc(),
            NetworkMetric::Latency => self.slot_latency.observe(value),
        }
    }

    fn record_protocol_metric(&self, metric: ProtocolMetric) {
        self.protocol_events
            .with_label_values(&[metric.as_str()])
            .inc();
    }

    fn create_alert(&self, kind: &str, _message: &str, severity: Severity) {
        let severity = severity_label(severity);
        self.operator_alerts
            .with_label_values(&[kind, severity.as_str()])
            .inc();
    }

    fn persist_message(&self, _message: &MessageRecord) {
        self.data_messages.inc();
    }

    fn persist_alert(&self, alert: &AlertRecord) {
        let severity = severity_label(alert.severity);
        self.device_alerts
            .with_label_values(&[severity.as_str()])
            .inc();
    }

    fn on_event(&self, event: &GatewayEvent) {
        if let GatewayEvent::SyncBroadcast { cycle, .. } = event {
            self.current_cycle.set(*cycle as i64);
        }
    }
}

fn severity_label(severity: Severity) -> String {
    severity.to_string().to_lowercase()
}

fn health_code(status: HealthStatus) -> i64 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
        HealthStatus::Unknown => 3,
    }
}

/// Encode the global registry in Prometheus text format
pub fn encode_metrics() -> prometheus::Result<String> {
    encode(&REGISTRY)
}

fn encode(registry: &Registry) -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_code() {
        assert_eq!(health_code(HealthStatus::Healthy), 0);
        assert_eq!(health_code(HealthStatus::Unhealthy), 2);
    }

    #[test]
    fn test_severity_label() {
        assert_eq!(severity_label(Severity::Critical), "critical");
        assert_eq!(severity_label(Severity::Low), "low");
    }

    #[test]
    fn test_observer_updates_counters() {
        let registry = Registry::new();
        let observer = PrometheusObserver::register(&registry).unwrap();

        observer.record_network_metric(NetworkMetric::PacketReceived, 128.0);
        observer.record_network_metric(NetworkMetric::Latency, 3.0);
        observer.record_protocol_metric(ProtocolMetric::ReplayDetected);
        observer.create_alert("authentication_failure", "device D1", Severity::High);

        assert_eq!(observer.packets_received.get(), 1);
        assert_eq!(observer.bytes_received.get(), 128);
        assert_eq!(observer.slot_latency.get_sample_count(), 1);

        let output = encode(&registry).unwrap();
        assert!(output.contains("afdx_protocol_events_total{event=\"replay_detected\"} 1"));
        assert!(output.contains("afdx_protocol_events_total{event=\"sync_sent\"} 0"));
        assert!(output.contains("kind=\"authentication_failure\""));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        PrometheusObserver::register(&registry).unwrap();
        assert!(PrometheusObserver::register(&registry).is_err());
    }
}
