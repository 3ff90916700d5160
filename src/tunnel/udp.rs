//! UDP transport
//!
//! A connected tokio `UdpSocket` behind the [`DatagramSocket`] capability.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

use super::flow::{Connector, DatagramSocket};

/// Largest datagram accepted from the peer
const MAX_DATAGRAM: usize = 65_535;

/// Upper bound on datagrams handed to the session per receive
const MAX_BATCH: usize = 64;

/// Opens connected UDP sockets
#[derive(Debug, Clone, Default)]
pub struct UdpConnector;

impl UdpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for UdpConnector {
    async fn open(&self, hostname: &str, port: &str) -> io::Result<Arc<dyn DatagramSocket>> {
        let port: u16 = port.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port {:?}", port))
        })?;

        let peer = lookup_host((hostname, port)).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", hostname),
            )
        })?;

        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        debug!("UDP socket {} connected to {}", socket.local_addr()?, peer);

        Ok(Arc::new(UdpDatagramSocket {
            socket,
            peer,
            buf: Mutex::new(vec![0u8; MAX_DATAGRAM]),
        }))
    }
}

/// A UDP socket connected to one peer
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    peer: SocketAddr,
    /// Receive buffer reused across calls
    buf: Mutex<Vec<u8>>,
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_datagrams(&self, datagrams: &[Vec<u8>]) -> io::Result<()> {
        for datagram in datagrams {
            self.socket.send(datagram).await?;
        }
        Ok(())
    }

    async fn recv_datagrams(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut guard = self.buf.lock().await;
        let buf = guard.as_mut_slice();
        let n = self.socket.recv(buf).await?;
        let mut batch = vec![buf[..n].to_vec()];

        // Drain whatever else is already queued
        while batch.len() < MAX_BATCH {
            match self.socket.try_recv(buf) {
                Ok(n) => batch.push(buf[..n].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Stopping receive batch from {}: {}", self.peer, e);
                    break;
                }
            }
        }
        Ok(batch)
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}
