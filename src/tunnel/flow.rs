//! Host Capabilities
//!
//! The operating system's virtual interface, datagram sockets and network
//! configuration, reduced to the few async operations a session needs.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// IP family of a packet handed to the virtual interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Classify a raw IP packet by the version nibble of its first byte
    ///
    /// Anything that is not version 6 (including an empty packet) is
    /// treated as IPv4.
    pub fn classify(packet: &[u8]) -> Self {
        match packet.first().map(|b| b >> 4) {
            Some(6) => IpFamily::V6,
            _ => IpFamily::V4,
        }
    }
}

/// Settings applied to the host once the tunnel is established
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TunnelNetworkSettings {
    /// Address reported by the server for the tunnel's remote end
    pub remote_address: String,
    /// Local address of the virtual interface
    pub local_address: Option<String>,
    pub mtu: Option<u16>,
    /// Destinations routed into the tunnel (CIDR)
    pub routes: Vec<String>,
}

/// Virtual interface packet source and sink
#[async_trait]
pub trait PacketFlow: Send + Sync {
    /// Wait for the next batch of outbound packets
    async fn read_packets(&self) -> io::Result<Vec<Vec<u8>>>;

    /// Deliver inbound packets to the local stack
    async fn write_packets(&self, packets: Vec<(Vec<u8>, IpFamily)>) -> io::Result<()>;
}

/// A connected datagram socket
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Send a batch of datagrams to the peer
    async fn send_datagrams(&self, datagrams: &[Vec<u8>]) -> io::Result<()>;

    /// Wait for the next batch of datagrams from the peer
    async fn recv_datagrams(&self) -> io::Result<Vec<Vec<u8>>>;

    /// Peer description for logs
    fn peer(&self) -> String;
}

/// Opens datagram sockets; a successful open is the socket becoming ready
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, hostname: &str, port: &str) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// Applies tunnel network settings to the host
#[async_trait]
pub trait NetworkSettingsApplier: Send + Sync {
    async fn apply(&self, settings: &TunnelNetworkSettings) -> Result<()>;
}
