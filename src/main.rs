//! WolfLink - Encrypted UDP Packet Tunnel Client
//!
//! Command line front end: bring a tunnel up on a TUN interface, or manage
//! the configuration and key files it uses.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolflink::config::{TunnelConfiguration, WolfLinkConfig};
use wolflink::credentials::FileCredentials;
use wolflink::crypto::SymmetricKey;
use wolflink::error::Result;

/// WolfLink - Encrypted UDP Packet Tunnel Client
#[derive(Parser)]
#[command(name = "wolflink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wolflink/wolflink.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the tunnel up and relay until interrupted
    Connect,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolflink.toml")]
        output: PathBuf,

        /// Server address (host:port)
        #[arg(long, default_value = "192.168.0.13:9999")]
        server: String,

        /// Account name
        #[arg(long, default_value = "kean")]
        username: String,
    },

    /// Validate configuration and credentials
    Validate,

    /// Generate a random pre-shared key file
    Genkey {
        /// Output path for the key file
        #[arg(short, long, default_value = "/etc/wolflink/psk.key")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Flag wins over the config file; RUST_LOG wins over both
    let level = cli.log_level.clone().unwrap_or_else(|| {
        WolfLinkConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Connect => run_connect(cli.config).await,
        Commands::Init {
            output,
            server,
            username,
        } => run_init(output, server, username),
        Commands::Validate => run_validate(cli.config),
        Commands::Genkey { output } => run_genkey(output),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Bring the tunnel up on a TUN interface
#[cfg(target_os = "linux")]
async fn run_connect(config_path: PathBuf) -> Result<()> {
    use std::sync::Arc;

    use wolflink::provider::TunnelProvider;
    use wolflink::tun::{IpCommandSettings, TunDevice};
    use wolflink::tunnel::{SessionIo, UdpConnector};

    tracing::info!("Starting WolfLink...");

    let config = match WolfLinkConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    let credentials = Arc::new(FileCredentials::load(&config.credentials.file)?);

    let device = TunDevice::create(&config.interface.name)?;
    let io = SessionIo {
        connector: Arc::new(UdpConnector::new()),
        settings: Arc::new(IpCommandSettings::new(device.name())),
        flow: Arc::new(device),
    };
    let provider = TunnelProvider::from_config(&config, io, credentials)?;

    provider.start_tunnel(&config.tunnel).await?;
    tracing::info!("Tunnel is up, press Ctrl+C to disconnect");

    let mut states = provider.session().subscribe();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupted");
        }
        _ = states.wait_for(|s| !matches!(s, wolflink::tunnel::SessionState::Established)) => {
            tracing::warn!("Tunnel left the established state: {}", provider.session().state());
        }
    }

    provider.stop_tunnel().await;
    let stats = provider.session().stats();
    tracing::info!(
        "Disconnected: {} packet(s) sent, {} received, {} dropped inbound",
        stats.packets_sent,
        stats.packets_received,
        stats.inbound_dropped
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_connect(_config_path: PathBuf) -> Result<()> {
    Err(wolflink::Error::NetworkSettings(
        "TUN interfaces are only supported on Linux".into(),
    ))
}

/// Write a default configuration file
fn run_init(output: PathBuf, server: String, username: String) -> Result<()> {
    let mut config = WolfLinkConfig::default();
    config.tunnel.server_address = Some(server);
    config.tunnel.username = Some(username);
    config.save(&output)?;

    println!("Configuration written to {:?}", output);
    println!("Add a password for the account to {:?}", config.credentials.file);
    Ok(())
}

/// Validate configuration file and credential lookup
fn run_validate(config_path: PathBuf) -> Result<()> {
    let checked = WolfLinkConfig::from_file(&config_path).and_then(|config| {
        let credentials = FileCredentials::load(&config.credentials.file)?;
        let tunnel = TunnelConfiguration::from_protocol(&config.tunnel, &credentials)?;
        config.load_key()?;
        Ok((config, tunnel))
    });

    match checked {
        Ok((config, tunnel)) => {
            println!("✓ Configuration is valid");
            println!("  Server: {}", tunnel.server_address());
            println!("  Username: {}", tunnel.username);
            println!("  Interface: {} (mtu {})", config.interface.name, config.interface.mtu);
            println!("  Auth timeout: {:?}", config.auth_timeout());
            println!(
                "  Key: {}",
                config
                    .session
                    .key_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "built-in".to_string())
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Generate a random pre-shared key
fn run_genkey(output: PathBuf) -> Result<()> {
    let key = SymmetricKey::generate();
    key.save(&output)?;
    println!("Key written to {:?}", output);
    println!("Set [session] key_file in the configuration and share it with the server");
    Ok(())
}
