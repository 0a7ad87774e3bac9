//! Kernel TUN interface through the `tun` crate.

use super::{PacketDevice, PacketReader, PacketWriter};
use crate::error::{TunatError, TunatResult};
use ipnet::{Ipv4Net, Ipv6Net};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

/// TUN device configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Device name (e.g., "tun0"). If None, system assigns a name.
    pub name: Option<String>,
    /// IPv4 prefix assigned to the interface when `configure_addresses` is set.
    pub ipv4: Option<Ipv4Net>,
    /// IPv6 prefix assigned to the interface when `configure_addresses` is set.
    pub ipv6: Option<Ipv6Net>,
    /// MTU for the device.
    pub mtu: u16,
    /// Assign the prefixes to the interface instead of leaving it to setup commands.
    pub configure_addresses: bool,
}

impl TunConfig {
    /// Create a new TUN configuration.
    pub fn new(mtu: u16) -> Self {
        Self {
            name: None,
            ipv4: None,
            ipv6: None,
            mtu,
            configure_addresses: false,
        }
    }

    /// Set the device name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Assign prefixes to the interface on creation.
    pub fn with_addresses(mut self, ipv4: Option<Ipv4Net>, ipv6: Option<Ipv6Net>) -> Self {
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
        self.configure_addresses = true;
        self
    }
}

/// A TUN device with async I/O.
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Create (or attach to) the named TUN interface.
    pub fn create(config: TunConfig) -> TunatResult<Self> {
        let mut tun_config = Configuration::default();
        tun_config.mtu(config.mtu).up();

        if let Some(ref name) = config.name {
            #[allow(deprecated)]
            tun_config.name(name);
        }

        if config.configure_addresses {
            if let Some(prefix) = config.ipv4 {
                tun_config.address(prefix.addr()).netmask(prefix.netmask());
            }
        }

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| TunatError::TunDevice(format!("Failed to create TUN device: {}", e)))?;

        let name = device
            .tun_name()
            .map_err(|e| TunatError::TunDevice(format!("Failed to get TUN name: {}", e)))?;

        log::info!("Created TUN device: {} (mtu {})", name, config.mtu);

        if config.configure_addresses {
            if let Some(prefix) = config.ipv4 {
                log::info!("Configured TUN IPv4: {}", prefix);
            }
            if let Some(prefix) = config.ipv6 {
                configure_tun_ipv6(&name, prefix)?;
                log::info!("Configured TUN IPv6: {}", prefix);
            }
        }

        Ok(Self { device, name })
    }

    /// Adopt an already opened TUN file descriptor. The device takes ownership.
    #[cfg(unix)]
    pub fn from_raw_fd(fd: std::os::fd::RawFd) -> TunatResult<Self> {
        let mut tun_config = Configuration::default();
        tun_config.raw_fd(fd);

        let device = tun::create_as_async(&tun_config).map_err(|e| {
            TunatError::TunDevice(format!("Failed to open TUN descriptor {}: {}", fd, e))
        })?;

        let name = device.tun_name().unwrap_or_else(|_| format!("fd{}", fd));
        log::info!("Using TUN device {} from descriptor {}", name, fd);

        Ok(Self { device, name })
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PacketDevice for TunDevice {
    type Reader = TunReader;
    type Writer = TunWriter;

    /// Note: the tun crate returns (writer, reader) order from split().
    fn split(self) -> io::Result<(TunReader, TunWriter)> {
        let (writer, reader) = self
            .device
            .split()
            .map_err(|e| io::Error::other(format!("Failed to split TUN device: {}", e)))?;

        Ok((TunReader { reader }, TunWriter { writer }))
    }
}

/// Read half of a split TUN device.
pub struct TunReader {
    reader: DeviceReader,
}

impl PacketReader for TunReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.read(buf).await? {
            0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "TUN device closed")),
            n => Ok(n),
        }
    }
}

/// Write half of a split TUN device.
pub struct TunWriter {
    writer: DeviceWriter,
}

impl PacketWriter for TunWriter {
    async fn write_packet(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame).await
    }
}

/// Check if an error message indicates that a resource already exists.
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists") || lower.contains("eexist")
}

/// Configure IPv6 address on TUN device (platform-specific).
#[cfg(target_os = "linux")]
fn configure_tun_ipv6(tun_name: &str, prefix: Ipv6Net) -> TunatResult<()> {
    let output = std::process::Command::new("ip")
        .args(["-6", "addr", "add", &prefix.to_string(), "dev", tun_name])
        .output()
        .map_err(|e| TunatError::TunDevice(format!("Failed to configure IPv6: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Treat "address already exists" as idempotent success
        if is_already_exists_error(&stderr) {
            log::warn!(
                "IPv6 address {} already exists on {} (treating as success)",
                prefix,
                tun_name
            );
            return Ok(());
        }
        return Err(TunatError::TunDevice(format!(
            "IPv6 configuration failed: {}",
            stderr.trim()
        )));
    }

    Ok(())
}

/// Configure IPv6 address on TUN device (platform-specific).
#[cfg(target_os = "macos")]
fn configure_tun_ipv6(tun_name: &str, prefix: Ipv6Net) -> TunatResult<()> {
    let output = std::process::Command::new("ifconfig")
        .args([
            tun_name,
            "inet6",
            "add",
            &prefix.addr().to_string(),
            "prefixlen",
            &prefix.prefix_len().to_string(),
        ])
        .output()
        .map_err(|e| TunatError::TunDevice(format!("Failed to configure IPv6: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_exists_error(&stderr) {
            return Ok(());
        }
        return Err(TunatError::TunDevice(format!(
            "IPv6 configuration failed: {}",
            stderr.trim()
        )));
    }

    Ok(())
}

/// Configure IPv6 address on TUN device (unsupported platform stub).
#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn configure_tun_ipv6(_tun_name: &str, _prefix: Ipv6Net) -> TunatResult<()> {
    Err(TunatError::TunDevice(
        "IPv6 configuration not supported on this platform".into(),
    ))
}
