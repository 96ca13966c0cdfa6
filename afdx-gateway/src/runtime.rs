// AFDX Gateway - TDMA gateway dispatcher and runtime
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! UDP runtime
//!
//! A single task owns the [`Gateway`] and multiplexes socket receive, the
//! next timer deadline and shutdown with `tokio::select!`. Other tasks see
//! the gateway only through [`Snapshot`]s published on a watch channel.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use afdx::{now_millis, HealthCheck, HealthStatus};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::{Gateway, GatewayStatus};
use crate::observer::GatewayObserver;
use crate::transport::UdpTransport;

/// Upper bound on a single wait when no timer is armed
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Status and health published after every loop turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(flatten)]
    pub status: GatewayStatus,
    pub health: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

impl Snapshot {
    fn capture<O: GatewayObserver>(gateway: &Gateway<UdpTransport, O>, now_ms: u64) -> Self {
        let health = gateway.health(now_ms);
        Self {
            status: gateway.status(now_ms),
            health: health.status(),
            checks: health.checks().cloned().collect(),
        }
    }
}

/// Gateway bound to its UDP socket
pub struct GatewayServer<O: GatewayObserver> {
    gateway: Gateway<UdpTransport, O>,
    socket: Arc<UdpSocket>,
    status: watch::Sender<Snapshot>,
    max_datagram_size: usize,
}

impl<O: GatewayObserver> GatewayServer<O> {
    /// Bind the UDP socket with broadcast enabled
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the socket
    /// cannot be bound.
    pub async fn bind(config: GatewayConfig, observer: O) -> Result<Self> {
        config.validate()?;
        let addr = config.bind_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        let max_datagram_size = config.network.max_datagram_size;
        let transport = UdpTransport::new(socket.clone(), config.broadcast_addr());
        let gateway = Gateway::new(config, transport, observer)?;
        let (status, _) = watch::channel(Snapshot::capture(&gateway, now_millis()));

        info!(addr = %socket.local_addr()?, "udp socket bound");
        Ok(Self {
            gateway,
            socket,
            status,
            max_datagram_size,
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive status snapshots
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.status.subscribe()
    }

    /// Get the gateway
    pub fn gateway(&self) -> &Gateway<UdpTransport, O> {
        &self.gateway
    }

    /// Serve until `shutdown` resolves, then stop and hand the gateway back
    ///
    /// Receive errors are logged and the loop continues.
    pub async fn run<F>(mut self, shutdown: F) -> Result<Gateway<UdpTransport, O>>
    where
        F: Future<Output = ()>,
    {
        let socket = self.socket.clone();
        // One spare byte so oversized datagrams are seen as such
        let mut buf = vec![0u8; self.max_datagram_size + 1];
        self.gateway.start(now_millis());
        tokio::pin!(shutdown);

        loop {
            let wait = self
                .gateway
                .next_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(now_millis())))
                .unwrap_or(IDLE_WAIT);

            tokio::select! {
                _ = &mut shutdown => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.gateway.handle_datagram(&buf[..len], from, now_millis())
                    }
                    Err(err) => warn!(error = %err, "receive failed"),
                },
                _ = tokio::time::sleep(wait) => self.gateway.poll_timers(now_millis()),
            }

            self.publish();
        }

        self.gateway.stop(now_millis());
        self.publish();
        Ok(self.gateway)
    }

    fn publish(&self) {
        self.status
            .send_replace(Snapshot::capture(&self.gateway, now_millis()));
    }
}
