//! Tunnel Module
//!
//! The connection state machine and the packet relay, plus the abstract
//! host capabilities they drive (virtual interface, datagram socket,
//! network settings).

pub mod flow;
pub mod relay;
pub mod session;
pub mod udp;

#[cfg(test)]
pub(crate) mod testing;

pub use flow::{
    Connector, DatagramSocket, IpFamily, NetworkSettingsApplier, PacketFlow,
    TunnelNetworkSettings,
};
pub use relay::{RelayStats, RelayStatsSnapshot};
pub use session::{Session, SessionIo, SessionOptions, SessionState};
pub use udp::UdpConnector;
