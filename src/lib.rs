//! WolfLink - Encrypted UDP Packet Tunnel Client
//!
//! Connects a local virtual interface to a remote WolfLink server over UDP.
//! Every datagram carries a one-byte packet code followed by a
//! ChaCha20-Poly1305 sealed body under a pre-shared key.
//!
//! # Architecture
//!
//! A [`tunnel::Session`] owns one tunnel. It opens a socket, authenticates
//! with a username and password, applies the network settings the server
//! hands back and then relays IP packets in both directions. The operating
//! system pieces (virtual interface, sockets, network settings) sit behind
//! small async traits so the state machine runs the same against a Linux
//! TUN device or in-memory test doubles.
//!
//! # Features
//!
//! - Authenticated encryption of every datagram
//! - Single-shot start with a configurable authentication timeout
//! - Packet relay that survives malformed or tampered datagrams
//! - TOML configuration with a separate credential store

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod tunnel;

#[cfg(target_os = "linux")]
pub mod tun;

pub use config::WolfLinkConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ProtocolConfiguration, TunnelConfiguration, WolfLinkConfig};
    pub use crate::credentials::{CredentialStore, FileCredentials, MemoryCredentials};
    pub use crate::crypto::{Cipher, SymmetricKey};
    pub use crate::error::{Error, FailureReason, Result};
    pub use crate::protocol::{ClientAuthRequest, Data, PacketCode, ServerAuthResponse};
    pub use crate::provider::TunnelProvider;
    pub use crate::tunnel::{Session, SessionIo, SessionOptions, SessionState, UdpConnector};
}
