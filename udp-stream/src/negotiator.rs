//! Connection negotiators: where a stream comes from.
//!
//! - [`Connector`] names a remote [`Acceptor`] and is used for an active open.
//! - [`Acceptor`] owns the well-known rendezvous socket and is used for a
//!   passive open.  Each accepted stream moves to its own ephemeral port, so
//!   one acceptor can hand out any number of sequential streams.
//!
//! Neither type carries protocol state; the handshake itself lives in
//! [`crate::handshake`].

use std::net::SocketAddr;
use std::sync::Mutex;

use crate::error::Result;
use crate::segment::MAX_SEGMENT_SIZE;
use crate::simulator::SimulatorConfig;
use crate::socket::LossySocket;

/// Address of a remote acceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    host: String,
    port: u16,
}

impl Connector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for Connector {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// A bound rendezvous socket waiting for SYNs.
///
/// The rendezvous socket itself never loses packets; loss simulation applies
/// to the per-stream sockets created by the handshake.
#[derive(Debug)]
pub struct Acceptor {
    socket: LossySocket,
    /// `(client address, client ISN)` of the last SYN turned into a stream.
    last_accepted: Mutex<Option<(SocketAddr, u32)>>,
}

impl Acceptor {
    /// Listen on `port` on every local IPv4 interface.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket =
            LossySocket::bind_local(port, MAX_SEGMENT_SIZE, &SimulatorConfig::lossless()).await?;
        Ok(Self::from_socket(socket))
    }

    /// Listen on an explicit address (e.g. `127.0.0.1:0` in tests).
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let socket =
            LossySocket::bind_addr(addr, MAX_SEGMENT_SIZE, &SimulatorConfig::lossless()).await?;
        Ok(Self::from_socket(socket))
    }

    fn from_socket(socket: LossySocket) -> Self {
        log::info!("[acceptor] listening on {}", socket.local_addr());
        Self {
            socket,
            last_accepted: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.socket.bound_to()
    }

    /// A [`Connector`] that reaches this acceptor over loopback.
    pub fn connector(&self) -> Connector {
        let addr = self.local_addr();
        let host = if addr.ip().is_unspecified() {
            "127.0.0.1".to_owned()
        } else {
            addr.ip().to_string()
        };
        Connector::new(host, addr.port())
    }

    pub(crate) fn socket(&self) -> &LossySocket {
        &self.socket
    }

    /// Record a SYN as accepted; `false` if it repeats the previous one.
    pub(crate) fn claim(&self, client: SocketAddr, isn: u32) -> bool {
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *last == Some((client, isn)) {
            return false;
        }
        *last = Some((client, isn));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_from_socket_addr() {
        let c = Connector::from("127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(c.host(), "127.0.0.1");
        assert_eq!(c.port(), 9000);
    }

    #[tokio::test]
    async fn acceptor_reports_bound_port() {
        let a = Acceptor::bind_addr("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(a.port(), 0);
        assert_eq!(a.connector().port(), a.port());
        assert_eq!(a.connector().host(), "127.0.0.1");
    }

    #[tokio::test]
    async fn repeated_syn_is_claimed_once() {
        let a = Acceptor::bind_addr("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        assert!(a.claim(client, 7));
        assert!(!a.claim(client, 7));
        assert!(a.claim(client, 8));
    }
}
