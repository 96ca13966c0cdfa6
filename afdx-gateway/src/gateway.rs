// AFDX Gateway - TDMA gateway dispatcher and runtime
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Gateway dispatcher
//!
//! The [`Gateway`] owns the scheduler, the security manager, the codec, the
//! device table and the transport. It is driven from outside: feed it
//! datagrams with [`Gateway::handle_datagram`] and call
//! [`Gateway::poll_timers`] at [`Gateway::next_deadline`]. Each call runs to
//! completion, so a slot-table read and the write that follows it are never
//! interleaved with a timer.
//!
//! # Example
//!
//! ```rust
//! use afdx_gateway::{Gateway, GatewayConfig, MemoryTransport, NoopObserver};
//!
//! let mut gateway = Gateway::new(
//!     GatewayConfig::default(),
//!     MemoryTransport::new(),
//!     NoopObserver,
//! ).unwrap();
//!
//! gateway.start(0);
//! gateway.poll_timers(0);
//! // One SYNC per cycle goes to the broadcast address
//! assert_eq!(gateway.transport().pending(), 1);
//! ```

use std::net::SocketAddr;

use afdx::protocol::{
    AlertPayload, AuthProof, DataPayload, HeartbeatPayload, JoinPayload, SessionTicket,
    SyncPayload,
};
use afdx::scheduler::BASELINE_BANDWIDTH;
use afdx::{
    AckPayload, HealthMonitor, Message, PacketCodec, PacketError, PacketHeader, PriorityClass,
    SchedulerEvent, SchedulerStats, SecurityError, SessionSecurityManager, Severity,
    SlotEntry, SlotId, SlotScheduler, GATEWAY_ID,
};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::GatewayConfig;
use crate::devices::{DeviceRecord, DeviceState, DeviceTable};
use crate::error::{DispatchError, Result};
use crate::observer::{
    AlertRecord, GatewayEvent, GatewayObserver, MessageRecord, NetworkMetric, ProtocolMetric,
};
use crate::transport::Transport;

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    /// Datagrams handed to the dispatcher
    pub messages_received: u64,
    /// Datagrams successfully sent
    pub messages_sent: u64,
    /// Datagrams that failed parsing, authentication or replay checks
    pub errors: u64,
    /// Datagrams dropped for any reason
    pub dropped: u64,
    /// When the gateway was last started
    pub started_at: Option<u64>,
}

/// Point-in-time view of the gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub running: bool,
    pub uptime_ms: u64,
    pub devices: usize,
    pub online_devices: usize,
    pub active_slots: usize,
    pub sessions: usize,
    pub stats: GatewayStats,
    pub scheduler: SchedulerStats,
}

/// TDMA gateway dispatcher
pub struct Gateway<T: Transport, O: GatewayObserver> {
    config: GatewayConfig,
    scheduler: SlotScheduler,
    security: SessionSecurityManager,
    codec: PacketCodec,
    devices: DeviceTable,
    transport: T,
    observer: O,
    stats: GatewayStats,
    running: bool,
    next_sweep: Option<u64>,
}

impl<T: Transport, O: GatewayObserver> Gateway<T, O> {
    /// Build a gateway from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: GatewayConfig, transport: T, observer: O) -> Result<Self> {
        config.validate()?;
        let key = config.network_key()?;
        Ok(Self {
            scheduler: SlotScheduler::new(config.scheduler_config()),
            security: SessionSecurityManager::new(config.security_config()),
            codec: PacketCodec::new(config.codec_config(), key),
            devices: DeviceTable::new(config.devices.max_devices),
            transport,
            observer,
            stats: GatewayStats::default(),
            running: false,
            next_sweep: None,
            config,
        })
    }

    /// Start cycling, key rotation and the offline sweep
    pub fn start(&mut self, now_ms: u64) {
        if self.running {
            return;
        }
        self.running = true;
        self.stats.started_at = Some(now_ms);
        self.scheduler.start(now_ms);
        self.security.start(now_ms);
        self.next_sweep = Some(now_ms + self.config.devices.health_check_interval);
        info!(
            udp_port = self.config.network.udp_port,
            sync_interval = self.config.tdma.sync_interval,
            "gateway started"
        );
        self.observer
            .on_event(&GatewayEvent::Started { timestamp: now_ms });
    }

    /// Stop every timer; devices and keys are kept
    pub fn stop(&mut self, now_ms: u64) {
        if !self.running {
            return;
        }
        self.running = false;
        self.scheduler.stop();
        self.security.stop();
        self.next_sweep = None;
        info!(devices = self.devices.len(), "gateway stopped");
        self.observer
            .on_event(&GatewayEvent::Stopped { timestamp: now_ms });
    }

    /// Whether the gateway is started
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Earliest time [`Gateway::poll_timers`] has work
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.scheduler.next_deadline(),
            self.security.next_deadline(),
            self.next_sweep,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run every timer due at `now_ms`
    pub fn poll_timers(&mut self, now_ms: u64) {
        for event in self.scheduler.poll(now_ms) {
            self.on_scheduler_event(event, now_ms);
        }

        if let Some(report) = self.security.poll(now_ms) {
            info!(
                rekeyed = report.rekeyed_devices,
                sessions_purged = report.sessions_purged,
                "keys rotated"
            );
            self.observer.on_event(&GatewayEvent::KeysRotated {
                rekeyed_devices: report.rekeyed_devices,
            });
        }

        if let Some(due) = self.next_sweep {
            if now_ms >= due {
                let interval = self.config.devices.health_check_interval;
                let next = due + interval;
                self.next_sweep = Some(if next <= now_ms { now_ms + interval } else { next });
                self.sweep_offline(now_ms);
            }
        }

        self.forward_slot_changes();
    }

    /// Evict devices silent for longer than `offlineTimeout`
    ///
    /// Returns the evicted ids.
    pub fn sweep_offline(&mut self, now_ms: u64) -> Vec<String> {
        let expired = self
            .devices
            .timed_out(now_ms, self.config.devices.offline_timeout);
        for device_id in &expired {
            if let Some(mut record) = self.evict(device_id) {
                record.status = DeviceState::Offline;
                info!(
                    device_id = %device_id,
                    last_seen = record.last_seen,
                    "device timed out"
                );
                self.observer.persist_device(&record);
                self.observer.on_event(&GatewayEvent::DeviceTimeout {
                    device_id: device_id.clone(),
                    last_seen: record.last_seen,
                });
            }
        }
        self.forward_slot_changes();
        expired
    }

    /// Remove a device and everything held for it
    pub fn remove_device(&mut self, device_id: &str) -> bool {
        let removed = self.evict(device_id).is_some();
        self.forward_slot_changes();
        removed
    }

    /// Handle one inbound datagram
    ///
    /// Never fails: problems become a response, a dropped datagram with a
    /// logged event, or both.
    pub fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr, now_ms: u64) {
        self.stats.messages_received += 1;
        self.observer
            .record_network_metric(NetworkMetric::PacketReceived, datagram.len() as f64);

        // Slot gating must see every activation already due
        self.poll_timers(now_ms);
        if let Err(err) = self.dispatch(datagram, from, now_ms) {
            self.drop_datagram(err, from);
        }
        self.forward_slot_changes();
    }

    fn dispatch(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) -> std::result::Result<(), DispatchError> {
        let max = self.config.network.max_datagram_size;
        if datagram.len() > max {
            return Err(DispatchError::Oversized {
                size: datagram.len(),
                max,
            });
        }

        let packet = self.codec.parse_packet(datagram, now_ms)?;
        let message = packet.message()?;
        let header = packet.header;
        trace!(
            device_id = %header.device_id,
            sequence = header.sequence,
            kind = %header.message_type,
            %from,
            "packet"
        );

        if let Some(record) = self.devices.get(&header.device_id) {
            // A restarted device rejoins with a fresh counter but a newer clock
            let restarted =
                matches!(message, Message::Join(_)) && header.timestamp > record.last_packet_at;
            if !restarted {
                self.codec
                    .verify_sequence(&header.device_id, header.sequence)?;
            }
        }

        match message {
            Message::Join(payload) => self.handle_join(&header, payload, from, now_ms)?,
            Message::Data(payload) => self.handle_data(&header, payload, from, now_ms)?,
            Message::Alert(payload) => self.handle_alert(&header, payload, from, now_ms)?,
            Message::Heartbeat(payload) => self.handle_heartbeat(&header, payload, from, now_ms),
            Message::Leave(_) => self.handle_leave(&header, from, now_ms),
            Message::Sync(_) | Message::Ack(_) => {
                debug!(
                    device_id = %header.device_id,
                    kind = %header.message_type,
                    "ignoring gateway-bound message type"
                );
                self.refresh(&header.device_id, from, now_ms);
            }
        }

        // Only packets acted on use up their sequence number
        if let Some(record) = self.devices.get_mut(&header.device_id) {
            record.last_packet_at = record.last_packet_at.max(header.timestamp);
            self.codec
                .commit_sequence(&header.device_id, header.sequence);
        }
        Ok(())
    }

    fn handle_join(
        &mut self,
        header: &PacketHeader,
        payload: JoinPayload,
        from: SocketAddr,
        now_ms: u64,
    ) -> std::result::Result<(), DispatchError> {
        let device_id = header.device_id.as_str();

        let Some(public_key) = payload.public_key.as_deref() else {
            self.refuse_join(device_id, from, now_ms, AckPayload::rejected("public key required"));
            return Ok(());
        };
        if self.devices.is_full() && !self.devices.contains(device_id) {
            self.refuse_join(
                device_id,
                from,
                now_ms,
                AckPayload::rejected(format!(
                    "device limit of {} reached",
                    self.config.devices.max_devices
                )),
            );
            return Ok(());
        }

        let encrypted_key = match self.security.register_device(device_id, public_key, now_ms) {
            Ok(sealed) => sealed,
            Err(err) => {
                self.refuse_join(device_id, from, now_ms, AckPayload::rejected(err.to_string()));
                return Ok(());
            }
        };

        let priority = payload.priority.unwrap_or_default();
        let bandwidth = payload.bandwidth.unwrap_or(BASELINE_BANDWIDTH);
        self.devices.begin_join(device_id, from, now_ms);
        if self.scheduler.remove_device(device_id) {
            debug!(device_id, "re-join releases previous slot");
        }

        let slot_id = match self.scheduler.add_device(device_id, priority, bandwidth) {
            Ok(slot_id) => slot_id,
            Err(err) => {
                warn!(device_id, error = %err, "slot allocation failed");
                self.security.revoke_device(device_id);
                self.devices.remove(device_id);
                self.codec.reset_sequence(device_id);
                self.stats.errors += 1;
                self.observer.record_protocol_metric(ProtocolMetric::Error);
                self.send_to(Message::Ack(AckPayload::error(err.to_string())), from, now_ms);
                return Ok(());
            }
        };

        let record = match self.devices.get_mut(device_id) {
            Some(record) => {
                record.status = DeviceState::Online;
                record.slot_id = Some(slot_id);
                record.priority = priority;
                record.bandwidth = bandwidth;
                record.connected_at = now_ms;
                record.total_messages += 1;
                record.clone()
            }
            None => return Err(DispatchError::UnknownDevice(device_id.to_string())),
        };

        let challenge = self.security.generate_nonce(device_id, now_ms);
        let ack = AckPayload::accepted(
            slot_id,
            encrypted_key,
            self.config.tdma.sync_interval,
            challenge,
        );
        self.send_to(Message::Ack(ack), from, now_ms);
        self.observer.persist_device(&record);
        info!(device_id, slot_id, %priority, bandwidth, %from, "device joined");
        Ok(())
    }

    fn refuse_join(&mut self, device_id: &str, from: SocketAddr, now_ms: u64, ack: AckPayload) {
        warn!(
            device_id,
            reason = ack.reason.as_deref().unwrap_or_default(),
            "join rejected"
        );
        self.observer
            .record_protocol_metric(ProtocolMetric::JoinRejected);
        self.send_to(Message::Ack(ack), from, now_ms);
    }

    fn handle_data(
        &mut self,
        header: &PacketHeader,
        payload: DataPayload,
        from: SocketAddr,
        now_ms: u64,
    ) -> std::result::Result<(), DispatchError> {
        let device_id = header.device_id.as_str();
        if !self.refresh(device_id, from, now_ms) {
            return Err(DispatchError::UnknownDevice(device_id.to_string()));
        }

        let slot_id = self
            .devices
            .get(device_id)
            .and_then(|record| record.slot_id)
            .ok_or_else(|| DispatchError::NoSlot(device_id.to_string()))?;
        if !self.scheduler.is_slot_active(slot_id) {
            return Err(DispatchError::SlotTimingViolation {
                device_id: device_id.to_string(),
                slot_id,
            });
        }

        debug!(device_id, slot_id, sequence = header.sequence, "data accepted");
        self.observer.persist_message(&MessageRecord {
            device_id: device_id.to_string(),
            message_type: header.message_type.to_string(),
            sequence: header.sequence,
            timestamp: header.timestamp,
            received_at: now_ms,
            payload: serde_json::Value::Object(payload.fields),
        });
        self.observer.on_event(&GatewayEvent::DataReceived {
            device_id: device_id.to_string(),
            sequence: header.sequence,
        });

        if payload.requires_ack {
            self.send_to(
                Message::Ack(AckPayload::for_message(header.sequence)),
                from,
                now_ms,
            );
        }
        Ok(())
    }

    fn handle_alert(
        &mut self,
        header: &PacketHeader,
        payload: AlertPayload,
        from: SocketAddr,
        now_ms: u64,
    ) -> std::result::Result<(), DispatchError> {
        let device_id = header.device_id.as_str();
        if self.refresh(device_id, from, now_ms) {
            if let Some(record) = self.devices.get_mut(device_id) {
                record.total_alerts += 1;
            }
        } else {
            debug!(device_id, "alert from unknown device");
        }

        warn!(
            device_id,
            severity = %payload.severity,
            message = %payload.message,
            "device alert"
        );
        self.observer
            .record_protocol_metric(ProtocolMetric::AlertReceived);
        self.observer.create_alert(
            "device_alert",
            &format!("{}: {}", device_id, payload.message),
            payload.severity,
        );
        self.observer.on_event(&GatewayEvent::AlertReceived {
            device_id: device_id.to_string(),
            severity: payload.severity,
        });
        self.observer.persist_alert(&AlertRecord {
            device_id: device_id.to_string(),
            message: payload.message,
            severity: payload.severity,
            data: payload.data,
            received_at: now_ms,
        });

        self.send_to(
            Message::Ack(AckPayload::for_message(header.sequence)),
            from,
            now_ms,
        );
        Ok(())
    }

    fn handle_heartbeat(
        &mut self,
        header: &PacketHeader,
        payload: HeartbeatPayload,
        from: SocketAddr,
        now_ms: u64,
    ) {
        let device_id = header.device_id.as_str();
        let known = self.refresh(device_id, from, now_ms);

        let session = match payload.auth {
            Some(proof) if known => self.authenticate(device_id, &proof, now_ms),
            Some(_) => {
                debug!(device_id, "ignoring credentials from unknown device");
                None
            }
            None => None,
        };

        let echo = HeartbeatPayload {
            timestamp: Some(now_ms),
            auth: None,
            session,
        };
        self.send_to(Message::Heartbeat(echo), from, now_ms);
    }

    fn authenticate(
        &mut self,
        device_id: &str,
        proof: &AuthProof,
        now_ms: u64,
    ) -> Option<SessionTicket> {
        let result = if self
            .security
            .validate_nonce(device_id, &proof.challenge, now_ms)
        {
            self.security
                .authenticate_device(device_id, &proof.challenge, &proof.signature, now_ms)
        } else {
            Err(SecurityError::NonceRejected {
                device_id: device_id.to_string(),
            })
        };

        match result {
            Ok(grant) => {
                info!(device_id, session_id = %grant.session_id, "session established");
                self.observer
                    .record_protocol_metric(ProtocolMetric::SessionCreated);
                self.observer.on_event(&GatewayEvent::SessionEstablished {
                    device_id: device_id.to_string(),
                    session_id: grant.session_id.clone(),
                });
                Some(SessionTicket {
                    session_id: grant.session_id,
                    session_key: grant.session_key,
                    expires_at: grant.expires_at,
                })
            }
            Err(err) => {
                warn!(device_id, error = %err, "authentication failed");
                self.observer
                    .record_protocol_metric(ProtocolMetric::AuthenticationFailure);
                self.observer
                    .create_alert("authentication_failure", &err.to_string(), Severity::High);
                None
            }
        }
    }

    fn handle_leave(&mut self, header: &PacketHeader, from: SocketAddr, now_ms: u64) {
        let device_id = header.device_id.as_str();
        if let Some(mut record) = self.evict(device_id) {
            record.status = DeviceState::Offline;
            record.last_seen = now_ms;
            info!(device_id, "device left");
            self.observer.persist_device(&record);
        }
        self.send_to(Message::Ack(AckPayload::goodbye()), from, now_ms);
    }

    /// Update the record of a known device; false when unknown
    fn refresh(&mut self, device_id: &str, from: SocketAddr, now_ms: u64) -> bool {
        if !self.devices.observe(device_id, from, now_ms) {
            return false;
        }
        self.security.touch(device_id, now_ms);
        true
    }

    fn evict(&mut self, device_id: &str) -> Option<DeviceRecord> {
        let record = self.devices.remove(device_id)?;
        self.scheduler.remove_device(device_id);
        self.security.revoke_device(device_id);
        self.codec.reset_sequence(device_id);
        Some(record)
    }

    fn on_scheduler_event(&mut self, event: SchedulerEvent, now_ms: u64) {
        match event {
            SchedulerEvent::CycleStarted {
                cycle,
                timestamp,
                slots,
            } => self.broadcast_sync(cycle, timestamp, slots, now_ms),
            SchedulerEvent::SlotActivated {
                slot,
                cycle,
                latency,
                ..
            } => {
                trace!(slot_id = slot.id, device_id = %slot.device_id, cycle, latency, "slot open");
                self.observer
                    .record_network_metric(NetworkMetric::Latency, latency as f64);
                self.observer.on_event(&GatewayEvent::SlotActivated {
                    slot_id: slot.id,
                    device_id: slot.device_id,
                    cycle,
                    latency,
                });
            }
            SchedulerEvent::SlotDeactivated { slot_id, device_id } => {
                trace!(slot_id, device_id = %device_id, "slot closed");
            }
            change @ (SchedulerEvent::DeviceAdded { .. }
            | SchedulerEvent::DeviceRemoved { .. }) => self.forward_slot_change(change),
        }
    }

    fn forward_slot_changes(&mut self) {
        for event in self.scheduler.drain_events() {
            self.forward_slot_change(event);
        }
    }

    fn forward_slot_change(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::DeviceAdded { device_id, slot_id } => {
                self.observer
                    .record_protocol_metric(ProtocolMetric::DeviceConnected);
                self.observer
                    .on_event(&GatewayEvent::DeviceConnected { device_id, slot_id });
            }
            SchedulerEvent::DeviceRemoved { device_id, slot_id } => {
                self.observer
                    .record_protocol_metric(ProtocolMetric::DeviceDisconnected);
                self.observer
                    .on_event(&GatewayEvent::DeviceDisconnected { device_id, slot_id });
            }
            _ => {}
        }
    }

    fn broadcast_sync(
        &mut self,
        cycle: u64,
        timestamp: u64,
        slots: std::collections::BTreeMap<SlotId, SlotEntry>,
        now_ms: u64,
    ) {
        let slot_count = slots.len();
        let sync = SyncPayload {
            timestamp,
            cycle,
            slots,
            frame_size: self.config.tdma.frame_size,
        };
        if self.send(Message::Sync(sync), None, PriorityClass::A, now_ms) {
            debug!(cycle, slots = slot_count, "sync broadcast");
            self.observer.record_protocol_metric(ProtocolMetric::SyncSent);
            self.observer.on_event(&GatewayEvent::SyncBroadcast {
                cycle,
                slots: slot_count,
            });
        }
    }

    fn send_to(&mut self, message: Message, to: SocketAddr, now_ms: u64) -> bool {
        self.send(message, Some(to), PriorityClass::A, now_ms)
    }

    /// Frame and transmit; `None` broadcasts
    fn send(
        &mut self,
        message: Message,
        to: Option<SocketAddr>,
        priority: PriorityClass,
        now_ms: u64,
    ) -> bool {
        let bytes = match self
            .codec
            .create_packet(&message, GATEWAY_ID, priority, now_ms)
            .and_then(|packet| packet.to_bytes())
        {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(kind = %message.message_type(), error = %err, "cannot frame response");
                return false;
            }
        };

        let sent = match to {
            Some(addr) => self.transport.send_to(&bytes, addr),
            None => self.transport.broadcast(&bytes),
        };
        match sent {
            Ok(()) => {
                self.stats.messages_sent += 1;
                self.observer
                    .record_network_metric(NetworkMetric::PacketSent, bytes.len() as f64);
                true
            }
            Err(err) => {
                warn!(kind = %message.message_type(), to = ?to, error = %err, "send failed");
                false
            }
        }
    }

    fn drop_datagram(&mut self, err: DispatchError, from: SocketAddr) {
        self.stats.dropped += 1;
        self.observer
            .record_network_metric(NetworkMetric::PacketLost, 1.0);

        let metric = if err.is_replay() {
            Some(ProtocolMetric::ReplayDetected)
        } else {
            match &err {
                DispatchError::SlotTimingViolation { .. } => {
                    Some(ProtocolMetric::SlotTimingViolation)
                }
                DispatchError::NoSlot(_) | DispatchError::UnknownDevice(_) => None,
                DispatchError::Packet(PacketError::UnknownMessageType(_)) => None,
                _ => Some(ProtocolMetric::Error),
            }
        };
        if matches!(
            metric,
            Some(ProtocolMetric::ReplayDetected) | Some(ProtocolMetric::Error)
        ) {
            self.stats.errors += 1;
        }
        if let Some(metric) = metric {
            self.observer.record_protocol_metric(metric);
        }

        match &err {
            DispatchError::Packet(PacketError::UnknownMessageType(kind)) => {
                debug!(%from, kind = %kind, "unknown message type")
            }
            DispatchError::UnknownDevice(_) | DispatchError::NoSlot(_) => {
                debug!(%from, reason = %err, "datagram dropped")
            }
            _ => warn!(%from, reason = %err, "datagram dropped"),
        }
        self.observer.on_event(&GatewayEvent::MessageError {
            from,
            reason: err.to_string(),
        });
    }

    /// Device record by id
    pub fn device(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }

    /// Device records sorted by id
    pub fn devices(&self) -> Vec<&DeviceRecord> {
        let mut devices: Vec<&DeviceRecord> = self.devices.iter().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Current slot table
    pub fn slot_table(&self) -> std::collections::BTreeMap<SlotId, SlotEntry> {
        self.scheduler.slot_table()
    }

    /// Get counters
    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Snapshot for status endpoints
    pub fn status(&self, now_ms: u64) -> GatewayStatus {
        let scheduler = self.scheduler.statistics();
        GatewayStatus {
            running: self.running,
            uptime_ms: match (self.running, self.stats.started_at) {
                (true, Some(started)) => now_ms.saturating_sub(started),
                _ => 0,
            },
            devices: self.devices.len(),
            online_devices: self
                .devices
                .iter()
                .filter(|record| record.status == DeviceState::Online)
                .count(),
            active_slots: scheduler.active_slots,
            sessions: self.security.session_count(),
            stats: self.stats.clone(),
            scheduler,
        }
    }

    /// Grade scheduler state, dispatch errors and send failures
    pub fn health(&self, now_ms: u64) -> HealthMonitor {
        let mut monitor = HealthMonitor::new();
        monitor.check_scheduler(
            self.scheduler.is_running(),
            &self.scheduler.statistics(),
            now_ms,
        );
        monitor.check_error_rate(
            "dispatcher",
            self.stats.errors,
            self.stats.messages_received,
            now_ms,
        );
        let transport = self.transport.metrics();
        monitor.check_error_rate(
            "transport",
            transport.send_errors,
            transport.unicasts_sent + transport.broadcasts_sent + transport.send_errors,
            now_ms,
        );
        monitor
    }

    /// Get configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Get the scheduler
    pub fn scheduler(&self) -> &SlotScheduler {
        &self.scheduler
    }

    /// Get the security manager
    pub fn security(&self) -> &SessionSecurityManager {
        &self.security
    }

    /// Get the codec
    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    /// Get the observer
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Get the transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the transport mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport, O: GatewayObserver> std::fmt::Debug for Gateway<T, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("running", &self.running)
            .field("devices", &self.devices.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::MemoryObserver;
    use crate::transport::{Destination, MemoryTransport};
    use afdx::crypto;
    use afdx::CodecConfig;
    use ed25519_dalek::{Signer, SigningKey};

    const NOW: u64 = 1_700_000_000_000;

    struct Device {
        id: &'static str,
        addr: SocketAddr,
        codec: PacketCodec,
        signing: SigningKey,
    }

    impl Device {
        fn new(id: &'static str, port: u16, key: crypto::KeyBytes) -> Self {
            Self {
                id,
                addr: SocketAddr::from(([10, 0, 0, 9], port)),
                codec: PacketCodec::new(CodecConfig::default(), key),
                signing: SigningKey::from_bytes(&[port as u8; 32]),
            }
        }

        fn packet(&mut self, message: Message, now: u64) -> Vec<u8> {
            self.codec
                .create_packet(&message, self.id, PriorityClass::B, now)
                .unwrap()
                .to_bytes()
                .unwrap()
        }

        fn join(&mut self, now: u64) -> Vec<u8> {
            let join = JoinPayload {
                public_key: Some(hex::encode(self.signing.verifying_key().to_bytes())),
                priority: Some(PriorityClass::A),
                bandwidth: Some(2000),
            };
            self.packet(Message::Join(join), now)
        }

        fn read(&mut self, bytes: &[u8], now: u64) -> Message {
            self.codec.parse_packet(bytes, now).unwrap().message().unwrap()
        }
    }

    fn setup() -> (Gateway<MemoryTransport, MemoryObserver>, crypto::KeyBytes) {
        let key = [3u8; 32];
        let mut config = GatewayConfig::default();
        config.security.network_key = Some(hex::encode(key));
        config.tdma.max_slots = 2;
        let gateway = Gateway::new(config, MemoryTransport::new(), MemoryObserver::new()).unwrap();
        (gateway, key)
    }

    fn last_ack(
        gateway: &mut Gateway<MemoryTransport, MemoryObserver>,
        device: &mut Device,
    ) -> AckPayload {
        let sent = gateway.transport_mut().take_sent();
        let last = sent.last().expect("a response");
        assert_eq!(last.to, Destination::Unicast(device.addr));
        match device.read(&last.bytes, NOW) {
            Message::Ack(ack) => ack,
            other => panic!("expected ACK, got {:?}", other),
        }
    }

    #[test]
    fn test_join_accepted() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);

        let ack = last_ack(&mut gateway, &mut device);
        assert_eq!(ack.status, Some(afdx::AckStatus::Accepted));
        assert_eq!(ack.slot_id, Some(0));
        assert_eq!(ack.sync_interval, Some(1000));
        assert!(ack.challenge.is_some());

        let record = gateway.device("D1").unwrap();
        assert_eq!(record.status, DeviceState::Online);
        assert_eq!(record.slot_id, Some(0));
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::DeviceConnected), 1);
        assert!(gateway.security().is_registered("D1"));
    }

    #[test]
    fn test_join_without_key_rejected() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);

        let join = device.packet(Message::Join(JoinPayload::default()), NOW);
        gateway.handle_datagram(&join, device.addr, NOW);

        let ack = last_ack(&mut gateway, &mut device);
        assert_eq!(ack.status, Some(afdx::AckStatus::Rejected));
        assert!(gateway.device("D1").is_none());
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::JoinRejected), 1);
    }

    #[test]
    fn test_rejoin_moves_slot() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        let join = device.join(NOW + 1);
        gateway.handle_datagram(&join, device.addr, NOW + 1);

        let ack = last_ack(&mut gateway, &mut device);
        assert_eq!(ack.status, Some(afdx::AckStatus::Accepted));
        assert_eq!(gateway.slot_table().len(), 1);
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::DeviceDisconnected), 1);
    }

    #[test]
    fn test_replayed_datagram_dropped() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        let heartbeat = device.packet(Message::Heartbeat(HeartbeatPayload::default()), NOW);
        gateway.handle_datagram(&heartbeat, device.addr, NOW);
        gateway.transport_mut().take_sent();

        gateway.handle_datagram(&heartbeat, device.addr, NOW + 5);
        assert_eq!(gateway.transport().pending(), 0);
        assert_eq!(gateway.stats().dropped, 1);
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::ReplayDetected), 1);
    }

    #[test]
    fn test_replayed_join_cannot_take_over() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);
        let intruder = SocketAddr::from(([6, 6, 6, 6], 666));

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        let heartbeat = device.packet(Message::Heartbeat(HeartbeatPayload::default()), NOW + 1);
        gateway.handle_datagram(&heartbeat, device.addr, NOW + 1);
        gateway.transport_mut().take_sent();
        let before = gateway.device("D1").unwrap().clone();

        gateway.handle_datagram(&join, intruder, NOW + 5_000);

        assert_eq!(gateway.transport().pending(), 0);
        let after = gateway.device("D1").unwrap();
        assert_eq!(after.addr(), device.addr);
        assert_eq!(after.slot_id, before.slot_id);
        assert_eq!(after.connected_at, before.connected_at);
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::ReplayDetected), 1);
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::DeviceDisconnected), 0);
    }

    #[test]
    fn test_join_replayed_before_any_other_traffic() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        gateway.transport_mut().take_sent();

        // Same timestamp is not newer, so the counter still applies
        gateway.handle_datagram(&join, SocketAddr::from(([6, 6, 6, 6], 666)), NOW + 10);
        assert_eq!(gateway.transport().pending(), 0);
        assert_eq!(gateway.device("D1").unwrap().addr(), device.addr);
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::ReplayDetected), 1);
    }

    #[test]
    fn test_restarted_device_rejoins() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        for offset in 1..=3 {
            let heartbeat =
                device.packet(Message::Heartbeat(HeartbeatPayload::default()), NOW + offset);
            gateway.handle_datagram(&heartbeat, device.addr, NOW + offset);
        }
        gateway.transport_mut().take_sent();

        // Power cycled: the counter is back at 1, the clock moved on
        let mut rebooted = Device::new("D1", 4001, key);
        let join = rebooted.join(NOW + 5_000);
        gateway.handle_datagram(&join, rebooted.addr, NOW + 5_000);
        let ack = last_ack(&mut gateway, &mut rebooted);
        assert_eq!(ack.status, Some(afdx::AckStatus::Accepted));

        let heartbeat =
            rebooted.packet(Message::Heartbeat(HeartbeatPayload::default()), NOW + 5_001);
        gateway.handle_datagram(&heartbeat, rebooted.addr, NOW + 5_001);
        assert_eq!(gateway.stats().dropped, 0);
        assert_eq!(gateway.device("D1").unwrap().last_packet_at, NOW + 5_001);
    }

    #[test]
    fn test_data_refused_outside_slot_can_be_resent() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);
        gateway.start(NOW);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        let data = device.packet(
            Message::Data(DataPayload::new(serde_json::Map::new()).with_ack()),
            NOW + 900,
        );
        gateway.handle_datagram(&data, device.addr, NOW + 900);
        gateway.transport_mut().take_sent();
        assert_eq!(
            gateway.observer().protocol_count(ProtocolMetric::SlotTimingViolation),
            1
        );

        gateway.poll_timers(NOW + 1000);
        assert!(gateway.scheduler().is_slot_active(0));
        gateway.transport_mut().take_sent();

        // The very same bytes, now inside the slot
        gateway.handle_datagram(&data, device.addr, NOW + 1005);
        let ack = last_ack(&mut gateway, &mut device);
        assert_eq!(ack.message_id, Some(2));
        assert_eq!(gateway.observer().messages().len(), 1);
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::ReplayDetected), 0);

        // Once acted on, the number is spent
        gateway.handle_datagram(&data, device.addr, NOW + 1006);
        assert_eq!(gateway.transport().pending(), 0);
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::ReplayDetected), 1);
    }

    #[test]
    fn test_due_timers_run_before_gating() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);
        gateway.start(NOW);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        gateway.transport_mut().take_sent();

        // Slot 0 opened at NOW + 1000 but no timer poll happened since
        let data = device.packet(
            Message::Data(DataPayload::new(serde_json::Map::new()).with_ack()),
            NOW + 1005,
        );
        gateway.handle_datagram(&data, device.addr, NOW + 1005);
        let ack = last_ack(&mut gateway, &mut device);
        assert_eq!(ack.message_id, Some(2));
        assert_eq!(gateway.observer().protocol_count(ProtocolMetric::SyncSent), 2);
    }

    #[test]
    fn test_garbage_is_isolated() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);

        gateway.handle_datagram(b"not json", device.addr, NOW);
        gateway.handle_datagram(&[0xff; 16], device.addr, NOW);
        assert_eq!(gateway.stats().errors, 2);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        let ack = last_ack(&mut gateway, &mut device);
        assert_eq!(ack.status, Some(afdx::AckStatus::Accepted));
    }

    #[test]
    fn test_heartbeat_authentication() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);

        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);
        let challenge = last_ack(&mut gateway, &mut device).challenge.unwrap();

        let signature = device.signing.sign(challenge.as_bytes());
        let heartbeat = HeartbeatPayload {
            timestamp: Some(NOW),
            auth: Some(AuthProof {
                challenge: challenge.clone(),
                signature: hex::encode(signature.to_bytes()),
            }),
            session: None,
        };
        let bytes = device.packet(Message::Heartbeat(heartbeat.clone()), NOW + 10);
        gateway.handle_datagram(&bytes, device.addr, NOW + 10);

        let sent = gateway.transport_mut().take_sent();
        let Message::Heartbeat(echo) = device.read(&sent[0].bytes, NOW + 10) else {
            panic!("expected heartbeat echo");
        };
        assert_eq!(echo.timestamp, Some(NOW + 10));
        let ticket = echo.session.unwrap();
        assert!(gateway.security().session(&ticket.session_id).is_some());

        // The challenge is single use
        let bytes = device.packet(Message::Heartbeat(heartbeat), NOW + 20);
        gateway.handle_datagram(&bytes, device.addr, NOW + 20);
        let sent = gateway.transport_mut().take_sent();
        let Message::Heartbeat(echo) = device.read(&sent[0].bytes, NOW + 20) else {
            panic!("expected heartbeat echo");
        };
        assert!(echo.session.is_none());
        assert_eq!(
            gateway
                .observer()
                .protocol_count(ProtocolMetric::AuthenticationFailure),
            1
        );
    }

    #[test]
    fn test_stop_cancels_timers() {
        let (mut gateway, _) = setup();
        gateway.start(NOW);
        assert_eq!(gateway.next_deadline(), Some(NOW));
        gateway.stop(NOW + 1);
        assert_eq!(gateway.next_deadline(), None);
        assert!(!gateway.status(NOW + 2).running);
    }

    #[test]
    fn test_status_and_health() {
        let (mut gateway, key) = setup();
        let mut device = Device::new("D1", 4001, key);
        gateway.start(NOW);
        gateway.poll_timers(NOW);
        let join = device.join(NOW);
        gateway.handle_datagram(&join, device.addr, NOW);

        let status = gateway.status(NOW + 500);
        assert!(status.running);
        assert_eq!(status.uptime_ms, 500);
        assert_eq!(status.devices, 1);
        assert_eq!(status.online_devices, 1);
        assert_eq!(status.stats.messages_received, 1);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["scheduler"]["totalSlots"], 1);

        // One of two slots in use
        let health = gateway.health(NOW + 500);
        assert_eq!(
            health.check("dispatcher").unwrap().status,
            afdx::HealthStatus::Healthy
        );
        assert!(health.is_operational());
    }
}
