//! Protocol statistics for the packet codec
//!
//! Counts packets created and parsed, bytes on the wire, and rejections by
//! reason, so the gateway can report codec health.

use crate::error::PacketError;
use std::collections::HashMap;

/// Reason a packet was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    /// Could not be deserialized or violates the envelope rules
    Malformed,
    /// MAC missing or wrong
    MacFailure,
    /// Timestamp older than the accepted age
    Stale,
    /// Sequence number did not move forward
    SequenceRegression,
    /// Encrypted blob did not open
    Decryption,
    /// Payload or type not understood
    Payload,
}

impl From<&PacketError> for RejectReason {
    fn from(err: &PacketError) -> Self {
        match err {
            PacketError::Malformed { .. } => RejectReason::Malformed,
            PacketError::MacVerificationFailure => RejectReason::MacFailure,
            PacketError::Stale { .. } => RejectReason::Stale,
            PacketError::SequenceRegression { .. } => RejectReason::SequenceRegression,
            PacketError::DecryptionFailed => RejectReason::Decryption,
            PacketError::UnknownMessageType(_) | PacketError::InvalidPayload { .. } => {
                RejectReason::Payload
            }
        }
    }
}

/// Codec statistics collector
#[derive(Debug, Clone, Default)]
pub struct ProtocolMetrics {
    /// Packets produced by `create_packet`
    pub packets_created: u64,
    /// Packets accepted by `parse_packet`
    pub packets_parsed: u64,
    /// Bytes of accepted inbound datagrams
    pub bytes_in: u64,
    /// Rejections per reason
    pub rejections: HashMap<RejectReason, u64>,
}

impl ProtocolMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet creation
    pub fn record_created(&mut self) {
        self.packets_created += 1;
    }

    /// Record an accepted inbound packet
    pub fn record_parsed(&mut self, size: usize) {
        self.packets_parsed += 1;
        self.bytes_in += size as u64;
    }

    /// Record a refused packet
    pub fn record_rejection(&mut self, err: &PacketError) {
        *self.rejections.entry(RejectReason::from(err)).or_insert(0) += 1;
    }

    /// Rejections for one reason
    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejections.get(&reason).copied().unwrap_or(0)
    }

    /// Total rejections
    pub fn total_rejected(&self) -> u64 {
        self.rejections.values().sum()
    }

    /// Share of inbound packets refused (0.0 - 1.0)
    pub fn rejection_rate(&self) -> f64 {
        let total = self.packets_parsed + self.total_rejected();
        if total == 0 {
            return 0.0;
        }
        self.total_rejected() as f64 / total as f64
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Generate a human-readable report
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== AFDX Protocol Metrics ===\n\n");
        report.push_str(&format!("Packets created: {}\n", self.packets_created));
        report.push_str(&format!("Packets parsed: {}\n", self.packets_parsed));
        report.push_str(&format!("Inbound bytes: {}\n", self.bytes_in));
        report.push_str(&format!(
            "Rejection rate: {:.1}%\n",
            self.rejection_rate() * 100.0
        ));

        if !self.rejections.is_empty() {
            report.push_str("\nRejections:\n");
            let mut reasons: Vec<_> = self.rejections.iter().collect();
            reasons.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (reason, count) in reasons {
                report.push_str(&format!("  {:?}: {}\n", reason, count));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_rate() {
        let mut metrics = ProtocolMetrics::new();
        metrics.record_parsed(100);
        metrics.record_parsed(100);
        metrics.record_parsed(100);
        metrics.record_rejection(&PacketError::MacVerificationFailure);

        assert!((metrics.rejection_rate() - 0.25).abs() < 0.001);
        assert_eq!(metrics.bytes_in, 300);
    }

    #[test]
    fn test_rejection_reasons() {
        let mut metrics = ProtocolMetrics::new();
        metrics.record_rejection(&PacketError::Stale {
            age_ms: 31_000,
            max_age_ms: 30_000,
        });
        metrics.record_rejection(&PacketError::Stale {
            age_ms: 45_000,
            max_age_ms: 30_000,
        });
        metrics.record_rejection(&PacketError::DecryptionFailed);

        assert_eq!(metrics.rejected(RejectReason::Stale), 2);
        assert_eq!(metrics.rejected(RejectReason::Decryption), 1);
        assert_eq!(metrics.rejected(RejectReason::MacFailure), 0);
        assert_eq!(metrics.total_rejected(), 3);
    }

    #[test]
    fn test_report_generation() {
        let mut metrics = ProtocolMetrics::new();
        metrics.record_created();
        metrics.record_rejection(&PacketError::MacVerificationFailure);

        let report = metrics.report();
        assert!(report.contains("Packets created: 1"));
        assert!(report.contains("MacFailure"));
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = ProtocolMetrics::new();
        assert_eq!(metrics.rejection_rate(), 0.0);
        assert_eq!(metrics.total_rejected(), 0);
    }

    #[test]
    fn test_reset() {
        let mut metrics = ProtocolMetrics::new();
        metrics.record_created();
        metrics.record_parsed(10);
        metrics.reset();

        assert_eq!(metrics.packets_created, 0);
        assert_eq!(metrics.packets_parsed, 0);
    }
}
