//! Engine configuration types.

use crate::error::{TunatError, TunatResult};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Default pump read buffer size (largest possible IP frame).
pub const DEFAULT_BUFFER_SIZE: usize = MAX_BUFFER_SIZE;

/// Smallest accepted read buffer (IPv6 minimum link MTU).
pub const MIN_BUFFER_SIZE: usize = 1280;

/// Largest useful read buffer.
pub const MAX_BUFFER_SIZE: usize = 65535;

/// Default capacity of the inbound UDP queue.
pub const DEFAULT_UDP_QUEUE_CAPACITY: usize = 100;

/// Default MTU when the engine creates the TUN interface itself.
pub const DEFAULT_MTU: u16 = 1500;

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Where the packet device comes from.
///
/// In TOML: `device = { name = "tun1" }`, `device = { fd = 5 }` or
/// `device = { unix_socket = "/tmp/tunat.sock" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSource {
    /// Open (or create) the named TUN interface.
    Name(String),
    /// Use an already opened TUN file descriptor.
    Fd(i32),
    /// Receive a TUN file descriptor over a Unix socket at this path.
    UnixSocket(PathBuf),
}

/// Addresses the engine derives from one configured prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyAddrs {
    /// The prefix address itself; local listener connections are redirected here.
    pub local: IpAddr,
    /// The address right after `local`, used as the substitute client source.
    pub fake: IpAddr,
}

/// Construction-time configuration for [`Tunat`](crate::Tunat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunatConfig {
    /// Device source. Required by [`Tunat::open`](crate::Tunat::open),
    /// ignored when a device is supplied directly.
    #[serde(default)]
    pub device: Option<DeviceSource>,

    /// IPv4 interface prefix, e.g. `10.0.0.1/24`.
    #[serde(default)]
    pub ipv4_prefix: Option<Ipv4Net>,

    /// IPv6 interface prefix, e.g. `fd::1/120`.
    #[serde(default)]
    pub ipv6_prefix: Option<Ipv6Net>,

    /// Pump read buffer capacity; must cover the interface MTU.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Bound of the inbound UDP queue. A full queue stalls the pump.
    #[serde(default = "default_udp_queue_capacity")]
    pub udp_queue_capacity: usize,

    /// MTU applied when creating a named interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Let the TUN adapter assign the prefix addresses to a named interface
    /// instead of relying on `post_commands`.
    #[serde(default)]
    pub configure_interface: bool,

    /// Commands run before the device is acquired.
    #[serde(default)]
    pub pre_commands: Vec<String>,

    /// Commands run after the device is acquired.
    #[serde(default)]
    pub post_commands: Vec<String>,
}

impl Default for TunatConfig {
    fn default() -> Self {
        Self {
            device: None,
            ipv4_prefix: None,
            ipv6_prefix: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            udp_queue_capacity: DEFAULT_UDP_QUEUE_CAPACITY,
            mtu: DEFAULT_MTU,
            configure_interface: false,
            pre_commands: vec![],
            post_commands: vec![],
        }
    }
}

impl TunatConfig {
    /// Create an empty configuration with default sizes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device source.
    pub fn with_device(mut self, device: DeviceSource) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the IPv4 prefix.
    pub fn with_ipv4_prefix(mut self, prefix: Ipv4Net) -> Self {
        self.ipv4_prefix = Some(prefix);
        self
    }

    /// Set the IPv6 prefix.
    pub fn with_ipv6_prefix(mut self, prefix: Ipv6Net) -> Self {
        self.ipv6_prefix = Some(prefix);
        self
    }

    /// Set the read buffer capacity.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the UDP queue bound.
    pub fn with_udp_queue_capacity(mut self, capacity: usize) -> Self {
        self.udp_queue_capacity = capacity;
        self
    }

    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> TunatResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunatError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            TunatError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Addresses derived from the IPv4 prefix, if one is configured.
    pub fn ipv4_addrs(&self) -> TunatResult<Option<FamilyAddrs>> {
        let Some(prefix) = self.ipv4_prefix else {
            return Ok(None);
        };
        let fake = u32::from(prefix.addr())
            .checked_add(1)
            .map(Ipv4Addr::from)
            .filter(|fake| prefix.contains(fake))
            .ok_or_else(|| {
                TunatError::Config(format!("IPv4 next address is out of prefix {}", prefix))
            })?;
        Ok(Some(FamilyAddrs {
            local: IpAddr::V4(prefix.addr()),
            fake: IpAddr::V4(fake),
        }))
    }

    /// Addresses derived from the IPv6 prefix, if one is configured.
    pub fn ipv6_addrs(&self) -> TunatResult<Option<FamilyAddrs>> {
        let Some(prefix) = self.ipv6_prefix else {
            return Ok(None);
        };
        let fake = u128::from(prefix.addr())
            .checked_add(1)
            .map(Ipv6Addr::from)
            .filter(|fake| prefix.contains(fake))
            .ok_or_else(|| {
                TunatError::Config(format!("IPv6 next address is out of prefix {}", prefix))
            })?;
        Ok(Some(FamilyAddrs {
            local: IpAddr::V6(prefix.addr()),
            fake: IpAddr::V6(fake),
        }))
    }

    /// Check the configuration without touching the system.
    pub fn validate(&self) -> TunatResult<()> {
        if self.ipv4_prefix.is_none() && self.ipv6_prefix.is_none() {
            return Err(TunatError::Config(
                "At least one of ipv4_prefix or ipv6_prefix is required".into(),
            ));
        }

        self.ipv4_addrs()?;
        self.ipv6_addrs()?;

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(TunatError::Config(format!(
                "buffer_size {} must be between {} and {}",
                self.buffer_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            )));
        }

        if matches!(self.device, Some(DeviceSource::Name(_)))
            && self.buffer_size < self.mtu as usize
        {
            return Err(TunatError::Config(format!(
                "buffer_size {} is smaller than the MTU {}",
                self.buffer_size, self.mtu
            )));
        }

        if self.udp_queue_capacity == 0 {
            return Err(TunatError::Config(
                "udp_queue_capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

// Default value functions for serde
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_udp_queue_capacity() -> usize {
    DEFAULT_UDP_QUEUE_CAPACITY
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}
