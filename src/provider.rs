//! Tunnel Provider
//!
//! The control surface a hosting application drives: start with a protocol
//! configuration record, stop, and exchange app messages. Configuration
//! problems are reported here, before the session opens any socket.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::{ProtocolConfiguration, TunnelConfiguration, WolfLinkConfig};
use crate::credentials::CredentialStore;
use crate::crypto::SymmetricKey;
use crate::error::Result;
use crate::tunnel::{Session, SessionIo, SessionOptions};

/// Owns one session and the credential store its passwords come from
pub struct TunnelProvider {
    session: Session,
    credentials: Arc<dyn CredentialStore>,
}

impl TunnelProvider {
    pub fn new(
        key: &SymmetricKey,
        io: SessionIo,
        options: SessionOptions,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            session: Session::new(key, io, options),
            credentials,
        }
    }

    /// Build a provider from the daemon configuration file
    pub fn from_config(
        config: &WolfLinkConfig,
        io: SessionIo,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let key = config.load_key()?;
        Ok(Self::new(&key, io, SessionOptions::from_config(config), credentials))
    }

    /// Validate the record and start the tunnel
    pub async fn start_tunnel(&self, protocol: &ProtocolConfiguration) -> Result<()> {
        let config = match TunnelConfiguration::from_protocol(protocol, self.credentials.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                error!("Rejecting tunnel configuration: {}", e);
                return Err(e);
            }
        };
        self.session.start(config).await
    }

    pub async fn stop_tunnel(&self) {
        info!("Stop requested by host application");
        self.session.stop().await;
    }

    pub async fn handle_app_message(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.session.handle_app_message(data).await
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
