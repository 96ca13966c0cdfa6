// AFDX Gateway - TDMA gateway dispatcher and runtime
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Device table
//!
//! One record per admitted device, owned by the dispatcher.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use afdx::{PriorityClass, SlotId};
use serde::Serialize;

/// Lifecycle state of a device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    /// JOIN received, admission in progress
    JoinPending,
    /// Admitted and heard from recently
    Online,
    /// Silent for longer than the offline timeout
    Offline,
}

/// A device known to the gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub status: DeviceState,
    pub slot_id: Option<SlotId>,
    pub priority: PriorityClass,
    pub bandwidth: u32,
    pub last_seen: u64,
    /// Header timestamp of the newest packet acted on
    pub last_packet_at: u64,
    pub connected_at: u64,
    pub total_messages: u64,
    pub total_alerts: u64,
}

impl DeviceRecord {
    fn new(id: &str, from: SocketAddr, now_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            ip: from.ip(),
            port: from.port(),
            status: DeviceState::JoinPending,
            slot_id: None,
            priority: PriorityClass::default(),
            bandwidth: afdx::scheduler::BASELINE_BANDWIDTH,
            last_seen: now_ms,
            last_packet_at: 0,
            connected_at: now_ms,
            total_messages: 0,
            total_alerts: 0,
        }
    }

    /// Last known address
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Device records keyed by id, bounded by `max_devices`
#[derive(Debug, Clone)]
pub struct DeviceTable {
    records: HashMap<String, DeviceRecord>,
    max_devices: usize,
}

impl DeviceTable {
    /// Create an empty table
    pub fn new(max_devices: usize) -> Self {
        Self {
            records: HashMap::new(),
            max_devices,
        }
    }

    /// Whether no further device can be admitted
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_devices
    }

    /// Create the record, or mark an existing one, as joining
    pub fn begin_join(&mut self, id: &str, from: SocketAddr, now_ms: u64) -> &mut DeviceRecord {
        let record = self
            .records
            .entry(id.to_string())
            .or_insert_with(|| DeviceRecord::new(id, from, now_ms));
        record.status = DeviceState::JoinPending;
        record.ip = from.ip();
        record.port = from.port();
        record.last_seen = now_ms;
        record
    }

    /// Record traffic from a known device
    ///
    /// Returns false when the device is unknown.
    pub fn observe(&mut self, id: &str, from: SocketAddr, now_ms: u64) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        record.ip = from.ip();
        record.port = from.port();
        record.last_seen = now_ms;
        record.total_messages += 1;
        if record.status == DeviceState::Offline {
            record.status = DeviceState::Online;
        }
        true
    }

    /// Ids of devices silent for longer than `timeout_ms`
    pub fn timed_out(&self, now_ms: u64, timeout_ms: u64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .values()
            .filter(|record| now_ms.saturating_sub(record.last_seen) > timeout_ms)
            .map(|record| record.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Get a record
    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.records.get(id)
    }

    /// Get a mutable record
    pub fn get_mut(&mut self, id: &str) -> Option<&mut DeviceRecord> {
        self.records.get_mut(id)
    }

    /// Whether a device is known
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Remove a record
    pub fn remove(&mut self, id: &str) -> Option<DeviceRecord> {
        self.records.remove(id)
    }

    /// All records, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.values()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], port))
    }

    #[test]
    fn test_join_then_observe() {
        let mut table = DeviceTable::new(10);
        table.begin_join("D1", addr(4000), 100).status = DeviceState::Online;

        assert!(table.observe("D1", addr(4001), 200));
        let record = table.get("D1").unwrap();
        assert_eq!(record.port, 4001);
        assert_eq!(record.last_seen, 200);
        assert_eq!(record.connected_at, 100);
        assert_eq!(record.total_messages, 1);

        assert!(!table.observe("D2", addr(4000), 200));
    }

    #[test]
    fn test_capacity() {
        let mut table = DeviceTable::new(2);
        table.begin_join("D1", addr(1), 0);
        assert!(!table.is_full());
        table.begin_join("D2", addr(2), 0);
        assert!(table.is_full());
        table.remove("D1");
        assert!(!table.is_full());
    }

    #[test]
    fn test_timed_out_is_strict() {
        let mut table = DeviceTable::new(10);
        table.begin_join("D1", addr(1), 0);
        table.begin_join("D2", addr(2), 500);

        assert!(table.timed_out(60_000, 60_000).is_empty());
        assert_eq!(table.timed_out(60_001, 60_000), vec!["D1".to_string()]);
        assert_eq!(table.timed_out(70_000, 60_000).len(), 2);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let mut table = DeviceTable::new(1);
        let record = table.begin_join("D1", addr(4000), 5);
        record.status = DeviceState::Online;
        record.slot_id = Some(3);

        let value = serde_json::to_value(table.get("D1").unwrap()).unwrap();
        assert_eq!(value["status"], "ONLINE");
        assert_eq!(value["slotId"], 3);
        assert_eq!(value["ip"], "192.168.1.20");
    }
}
