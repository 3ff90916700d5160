//! TUN device management for WolfLink
//!
//! Creates the virtual interface with the Linux TUN driver and exposes it as
//! a [`PacketFlow`]. Network settings are applied with the `ip` tool.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::tunnel::{IpFamily, NetworkSettingsApplier, PacketFlow, TunnelNetworkSettings};

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write bit as 4
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

const MAX_PACKET: usize = 65_535;
const MAX_BATCH: usize = 64;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// A non-blocking Linux TUN device registered with the tokio reactor
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Create (or attach to) the TUN interface `name`
    pub fn create(name: &str) -> Result<Self> {
        let raw = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr() as *const _,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(Error::NetworkSettings(format!(
                "failed to open /dev/net/tun: {}",
                io::Error::last_os_error()
            )));
        }
        // Closed on every early return from here on
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            return Err(Error::NetworkSettings(format!(
                "ioctl TUNSETIFF failed for {}: {}",
                name,
                io::Error::last_os_error()
            )));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();
        info!("Created TUN interface {}", actual_name);

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name: actual_name,
        })
    }

    /// Get the interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const _, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[async_trait]
impl PacketFlow for TunDevice {
    async fn read_packets(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_PACKET];
        let first = loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|fd| read_fd(fd.get_ref().as_raw_fd(), &mut buf)) {
                Ok(result) => break result?,
                Err(_would_block) => continue,
            }
        };

        let mut batch = vec![buf[..first].to_vec()];
        while batch.len() < MAX_BATCH {
            match read_fd(self.raw_fd(), &mut buf) {
                Ok(n) => batch.push(buf[..n].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(batch)
    }

    async fn write_packets(&self, packets: Vec<(Vec<u8>, IpFamily)>) -> io::Result<()> {
        // IFF_NO_PI: the kernel reads the family from the packet itself
        for (packet, _family) in packets {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|fd| write_fd(fd.get_ref().as_raw_fd(), &packet)) {
                    Ok(result) => {
                        result?;
                        break;
                    }
                    Err(_would_block) => continue,
                }
            }
        }
        Ok(())
    }
}

/// Applies tunnel settings to a Linux interface with `ip`
#[derive(Debug, Clone)]
pub struct IpCommandSettings {
    interface: String,
}

impl IpCommandSettings {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn ip(&self, args: &[&str]) -> Result<()> {
        debug!("ip {}", args.join(" "));
        let status = Command::new("ip")
            .args(args)
            .status()
            .await
            .map_err(|e| Error::NetworkSettings(format!("failed to run ip: {}", e)))?;
        if !status.success() {
            return Err(Error::NetworkSettings(format!(
                "'ip {}' exited with {}",
                args.join(" "),
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkSettingsApplier for IpCommandSettings {
    async fn apply(&self, settings: &TunnelNetworkSettings) -> Result<()> {
        let dev = self.interface.as_str();

        if let Some(local) = &settings.local_address {
            self.ip(&["addr", "replace", local, "peer", &settings.remote_address, "dev", dev])
                .await?;
        } else {
            warn!(
                "No local address configured for {}, remote end is {}",
                dev, settings.remote_address
            );
        }

        if let Some(mtu) = settings.mtu {
            let mtu = mtu.to_string();
            if let Err(e) = self.ip(&["link", "set", "dev", dev, "mtu", &mtu]).await {
                warn!("Failed to set MTU on {}: {}", dev, e);
            }
        }

        self.ip(&["link", "set", "dev", dev, "up"]).await?;

        for route in &settings.routes {
            self.ip(&["route", "replace", route, "dev", dev]).await?;
        }

        info!(
            "Interface {} up, remote {} ({} route(s))",
            dev,
            settings.remote_address,
            settings.routes.len()
        );
        Ok(())
    }
}
