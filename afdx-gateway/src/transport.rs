// AFDX Gateway - TDMA gateway dispatcher and runtime
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Transport abstraction
//!
//! The dispatcher only ever sends; receiving belongs to the runtime loop.
//! Sends never block the dispatch path.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

/// Statistics about transport usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Unicast datagrams sent
    pub unicasts_sent: u64,
    /// Broadcast datagrams sent
    pub broadcasts_sent: u64,
    /// Sends that failed
    pub send_errors: u64,
}

/// Outbound side of the gateway's network
pub trait Transport {
    /// Send one datagram to a device
    fn send_to(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Send one datagram to the broadcast destination
    fn broadcast(&mut self, datagram: &[u8]) -> io::Result<()>;

    /// Get transport metrics
    fn metrics(&self) -> TransportMetrics;
}

/// UDP transport over a socket shared with the receive loop
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    metrics: TransportMetrics,
}

impl UdpTransport {
    /// Create a transport; the socket must have broadcast enabled
    pub fn new(socket: Arc<UdpSocket>, broadcast_addr: SocketAddr) -> Self {
        Self {
            socket,
            broadcast_addr,
            metrics: TransportMetrics::default(),
        }
    }

    fn send(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        match self.socket.try_send_to(datagram, to) {
            Ok(_) => {
                self.metrics.bytes_sent += datagram.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.metrics.send_errors += 1;
                Err(err)
            }
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.send(datagram, to)?;
        self.metrics.unicasts_sent += 1;
        Ok(())
    }

    fn broadcast(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.send(datagram, self.broadcast_addr)?;
        self.metrics.broadcasts_sent += 1;
        Ok(())
    }

    fn metrics(&self) -> TransportMetrics {
        self.metrics.clone()
    }
}

/// Where a recorded datagram went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(SocketAddr),
    Broadcast,
}

/// A datagram captured by [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub to: Destination,
    pub bytes: Vec<u8>,
}

/// In-memory transport for testing and local simulation
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: VecDeque<SentDatagram>,
    is_open: bool,
    metrics: TransportMetrics,
}

impl MemoryTransport {
    /// Create a new memory transport
    pub fn new() -> Self {
        Self {
            sent: VecDeque::new(),
            is_open: true,
            metrics: TransportMetrics::default(),
        }
    }

    /// Pop the oldest captured datagram
    pub fn pop_sent(&mut self) -> Option<SentDatagram> {
        self.sent.pop_front()
    }

    /// Take every captured datagram
    pub fn take_sent(&mut self) -> Vec<SentDatagram> {
        self.sent.drain(..).collect()
    }

    /// Number of captured datagrams
    pub fn pending(&self) -> usize {
        self.sent.len()
    }

    /// Make every further send fail
    pub fn close(&mut self) {
        self.is_open = false;
    }

    fn record(&mut self, datagram: &[u8], to: Destination) -> io::Result<()> {
        if !self.is_open {
            self.metrics.send_errors += 1;
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is closed",
            ));
        }
        self.metrics.bytes_sent += datagram.len() as u64;
        match to {
            Destination::Unicast(_) => self.metrics.unicasts_sent += 1,
            Destination::Broadcast => self.metrics.broadcasts_sent += 1,
        }
        self.sent.push_back(SentDatagram {
            to,
            bytes: datagram.to_vec(),
        });
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.record(datagram, Destination::Unicast(to))
    }

    fn broadcast(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.record(datagram, Destination::Broadcast)
    }

    fn metrics(&self) -> TransportMetrics {
        self.metrics.clone()
    }
}
