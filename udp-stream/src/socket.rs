//! Lossy UDP datagram transport.
//!
//! [`LossySocket`] is a thin wrapper around `tokio::net::UdpSocket` that
//! remembers one default peer, offers a receive-with-timeout, and can drop
//! inbound datagrams at random (see [`crate::simulator`]).  All protocol
//! logic lives elsewhere; this module owns only byte I/O.
//!
//! # Truncation
//!
//! The receive buffer is exactly `max_segment_size` bytes.  A larger datagram
//! is cut to that size by the OS on receipt; the excess bytes are lost and
//! never written past the buffer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};

use crate::error::{Result, StreamError};
use crate::simulator::{LossModel, SimulatorConfig};

/// An unreliable, connectionless socket bound to one local port.
///
/// Receive-side state (loss RNG, last sender) sits behind small mutexes so
/// the socket can be shared between a sending and a receiving task.
#[derive(Debug)]
pub struct LossySocket {
    inner: UdpSocket,
    local_addr: SocketAddr,
    peer: Option<SocketAddr>,
    max_segment_size: usize,
    loss: Mutex<LossModel>,
    last_from: Mutex<Option<SocketAddr>>,
}

impl LossySocket {
    /// Bind to `port` on every local IPv4 interface.
    pub async fn bind_local(
        port: u16,
        max_segment_size: usize,
        sim: &SimulatorConfig,
    ) -> Result<Self> {
        Self::bind_addr(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            max_segment_size,
            sim,
        )
        .await
    }

    /// Bind to an OS-chosen ephemeral port.
    pub async fn bind_local_any(max_segment_size: usize, sim: &SimulatorConfig) -> Result<Self> {
        Self::bind_local(0, max_segment_size, sim).await
    }

    /// Bind to an explicit local address (e.g. `127.0.0.1:0` in tests).
    pub async fn bind_addr(
        addr: SocketAddr,
        max_segment_size: usize,
        sim: &SimulatorConfig,
    ) -> Result<Self> {
        let inner = UdpSocket::bind(addr).await.map_err(|source| StreamError::Bind {
            port: addr.port(),
            source,
        })?;
        let local_addr = inner.local_addr()?;
        log::debug!("[socket] bound {local_addr}");
        Ok(Self {
            inner,
            local_addr,
            peer: None,
            max_segment_size,
            loss: Mutex::new(LossModel::new(sim)),
            last_from: Mutex::new(None),
        })
    }

    /// Resolve `host:port` and make it the default destination.
    ///
    /// Addresses of the same family as the local socket are preferred.
    pub async fn set_peer(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        let addr = resolve(host, port, self.local_addr.is_ipv4()).await?;
        self.set_peer_addr(addr);
        Ok(addr)
    }

    /// Use an already-resolved address as the default destination.
    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        // An unspecified local IP cannot reach an unspecified remote; use loopback.
        let addr = if addr.ip().is_unspecified() {
            let lo = match addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            SocketAddr::new(lo, addr.port())
        } else {
            addr
        };
        self.peer = Some(addr);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port this socket is bound to.
    pub fn bound_to(&self) -> u16 {
        self.local_addr.port()
    }

    /// Source address of the most recent datagram handed to the caller.
    pub fn last_received_from(&self) -> Option<SocketAddr> {
        *lock(&self.last_from)
    }

    /// Send `bytes` as one datagram to the configured peer.
    ///
    /// Delivery is not guaranteed and nothing is retried here.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let peer = self.peer.ok_or(StreamError::NoPeer)?;
        self.inner.send_to(bytes, peer).await?;
        Ok(())
    }

    /// Wait for one datagram.
    ///
    /// Returns an empty vector when `timeout` expires first, or when the loss
    /// model discards the datagram that did arrive.  `None` waits forever.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.max_segment_size];
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.inner.recv_from(&mut buf)).await
            {
                Ok(result) => result,
                Err(_elapsed) => return Ok(Vec::new()),
            },
            None => self.inner.recv_from(&mut buf).await,
        };
        let (n, from) = match received {
            Ok(v) => v,
            // ICMP port-unreachable from an earlier send surfaces here on some
            // platforms; to an unreliable transport that is just loss.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if lock(&self.loss).should_drop() {
            log::trace!("[socket] simulated loss of {n} bytes from {from}");
            return Ok(Vec::new());
        }

        *lock(&self.last_from) = Some(from);
        buf.truncate(n);
        Ok(buf)
    }

    /// `(dropped, delivered)` counts from the loss model.
    pub fn loss_counts(&self) -> (u64, u64) {
        let loss = lock(&self.loss);
        (loss.dropped(), loss.delivered())
    }
}

/// Resolve `host:port`, preferring IPv4 results when `prefer_ipv4` is set
/// and IPv6 results otherwise.
pub async fn resolve(host: &str, port: u16, prefer_ipv4: bool) -> Result<SocketAddr> {
    let resolution = |source| StreamError::Resolution {
        host: host.to_owned(),
        source,
    };
    let candidates: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| resolution(Some(e)))?
        .collect();
    candidates
        .iter()
        .find(|a| a.is_ipv4() == prefer_ipv4)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| resolution(None))
}

/// Wildcard address of the same family as `addr`, with port 0.
pub fn unspecified_like(addr: &SocketAddr) -> SocketAddr {
    let ip = match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

// The guarded values are plain data with no invariants a panic could break.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
