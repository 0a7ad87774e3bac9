//! The engine handle.

use crate::command::run_commands;
use crate::config::{DeviceSource, FamilyAddrs, IpFamily, TunatConfig};
use crate::device::{PacketDevice, TunConfig, TunDevice};
use crate::error::{TunatError, TunatResult};
use crate::nat::{FlowTable, NatEntry};
use crate::pump::{PacketPump, PumpStats, Shutdown};
use crate::tcp::{FamilyRoute, NatListener, NatTcpStream, TcpRedirector};
use crate::udp::{UdpDatagram, UdpRelay};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// A running NAT engine bound to one packet device.
///
/// Construction binds one local listener per configured family and spawns
/// the packet pump on the current tokio runtime. Dropping the handle closes
/// the engine.
pub struct Tunat<D: PacketDevice = TunDevice> {
    table: Arc<FlowTable>,
    v4: Option<NatListener>,
    v6: Option<NatListener>,
    udp: UdpRelay<D::Writer>,
    stats: Arc<PumpStats>,
    shutdown: Arc<Shutdown>,
    pump: Mutex<Option<JoinHandle<TunatResult<()>>>>,
}

impl Tunat<TunDevice> {
    /// Acquire the TUN device named by `config.device` and start the engine.
    ///
    /// `pre_commands` run before the device is acquired and `post_commands`
    /// after; a failing command aborts construction.
    pub async fn open(config: TunatConfig) -> TunatResult<Self> {
        config.validate()?;
        let source = config
            .device
            .clone()
            .ok_or_else(|| TunatError::Config("No device configured".into()))?;

        run_commands(&config.pre_commands).await?;

        let device = match source {
            DeviceSource::Name(name) => {
                let mut tun = TunConfig::new(config.mtu).with_name(name);
                if config.configure_interface {
                    tun = tun.with_addresses(config.ipv4_prefix, config.ipv6_prefix);
                }
                TunDevice::create(tun)?
            }
            #[cfg(unix)]
            DeviceSource::Fd(fd) => TunDevice::from_raw_fd(fd)?,
            #[cfg(unix)]
            DeviceSource::UnixSocket(path) => crate::device::unix::open_from_socket(&path).await?,
            #[cfg(not(unix))]
            other => {
                return Err(TunatError::Config(format!(
                    "Device source {:?} is only supported on Unix",
                    other
                )))
            }
        };

        run_commands(&config.post_commands).await?;

        Self::new(config, device).await
    }

    /// Load a TOML configuration file and [`open`](Self::open) it.
    pub async fn open_file(path: &std::path::Path) -> TunatResult<Self> {
        Self::open(TunatConfig::from_file(path)?).await
    }
}

impl<D: PacketDevice> Tunat<D> {
    /// Start the engine on an already acquired device.
    ///
    /// `config.device` and the setup commands are ignored.
    pub async fn new(config: TunatConfig, device: D) -> TunatResult<Self> {
        config.validate()?;
        let table = Arc::new(FlowTable::new());

        let (v4, v4_route) = Self::listen(config.ipv4_addrs()?, &table).await?;
        let (v6, v6_route) = Self::listen(config.ipv6_addrs()?, &table).await?;

        let (reader, writer) = device
            .split()
            .map_err(|e| TunatError::TunDevice(format!("Failed to split device: {}", e)))?;
        let writer = Arc::new(Mutex::new(writer));

        let shutdown = Arc::new(Shutdown::default());
        let stats = Arc::new(PumpStats::new());
        let (udp, sink) = UdpRelay::new(config.udp_queue_capacity, writer.clone(), shutdown.clone());
        let pump = PacketPump::new(
            reader,
            writer,
            TcpRedirector::new(table.clone(), v4_route, v6_route),
            sink,
            stats.clone(),
            shutdown.clone(),
            config.buffer_size,
        );
        let handle = tokio::spawn(pump.run());

        Ok(Self {
            table,
            v4,
            v6,
            udp,
            stats,
            shutdown,
            pump: Mutex::new(Some(handle)),
        })
    }

    async fn listen(
        addrs: Option<FamilyAddrs>,
        table: &Arc<FlowTable>,
    ) -> TunatResult<(Option<NatListener>, Option<FamilyRoute>)> {
        let Some(addrs) = addrs else {
            return Ok((None, None));
        };
        let listener = NatListener::bind(addrs.local, table.clone()).await?;
        let route = FamilyRoute {
            fake_ip: addrs.fake,
            target: listener.redirect_target(),
        };
        Ok((Some(listener), Some(route)))
    }

    fn listener(&self, family: IpFamily) -> TunatResult<&NatListener> {
        match family {
            IpFamily::V4 => self.v4.as_ref(),
            IpFamily::V6 => self.v6.as_ref(),
        }
        .ok_or(TunatError::FamilyNotConfigured(family))
    }

    /// Next redirected IPv4 connection.
    pub async fn accept_v4(&self) -> TunatResult<NatTcpStream> {
        self.listener(IpFamily::V4)?.accept().await
    }

    /// Next redirected IPv6 connection.
    pub async fn accept_v6(&self) -> TunatResult<NatTcpStream> {
        self.listener(IpFamily::V6)?.accept().await
    }

    /// Local address redirected connections of `family` are delivered to.
    pub fn redirect_target(&self, family: IpFamily) -> Option<SocketAddr> {
        self.listener(family).ok().map(NatListener::redirect_target)
    }

    /// Next captured UDP datagram.
    pub async fn recv_udp(&self) -> TunatResult<UdpDatagram> {
        self.udp.recv().await
    }

    /// Inject a UDP datagram that appears to come from `src`.
    pub async fn send_udp(&self, payload: &[u8], src: SocketAddr, dst: SocketAddr) -> TunatResult<()> {
        self.udp.send(payload, src, dst).await
    }

    /// Forget the flow of a real client.
    pub fn remove_flow(&self, client: &SocketAddr) -> Option<NatEntry> {
        self.table.remove_client(client)
    }

    /// Snapshot of every tracked flow.
    pub fn flows(&self) -> Vec<NatEntry> {
        self.table.entries()
    }

    pub fn stats(&self) -> &PumpStats {
        &self.stats
    }

    /// Stop the pump. Reads, UDP injection and queue consumption fail with
    /// [`TunatError::DeviceClosed`] afterwards (queued datagrams drain first).
    pub fn close(&self) {
        self.shutdown.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_closed()
    }

    /// Wait for the pump to stop.
    ///
    /// `Ok` after [`close`](Self::close); the device error if the device
    /// failed. Only the first caller sees the error, later callers get `Ok`.
    pub async fn wait(&self) -> TunatResult<()> {
        let mut pump = self.pump.lock().await;
        let Some(handle) = pump.as_mut() else {
            return Ok(());
        };
        let result = handle.await;
        *pump = None;

        result.map_err(|e| TunatError::Device(io::Error::other(format!("Packet pump failed: {}", e))))?
    }
}

impl<D: PacketDevice> Drop for Tunat<D> {
    fn drop(&mut self) {
        self.shutdown.close();
    }
}
