//! tunat
//!
//! Opens a TUN device, echoes every redirected TCP connection back to its
//! client and answers every captured UDP datagram with a spoofed copy.

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::{Ipv4Net, Ipv6Net};
use std::path::PathBuf;
use std::sync::Arc;

use tunat::{DeviceSource, IpFamily, NatTcpStream, Tunat, TunatConfig};

#[derive(Parser)]
#[command(name = "tunat")]
#[command(version)]
#[command(about = "Transparent TCP redirection and UDP relaying over a TUN device")]
struct Args {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TUN interface name to create or attach to
    #[arg(short, long, conflicts_with_all = ["fd", "unix_socket"])]
    name: Option<String>,

    /// Already opened TUN file descriptor
    #[arg(long, conflicts_with = "unix_socket")]
    fd: Option<i32>,

    /// Receive the TUN descriptor over a Unix socket at this path
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// IPv4 interface prefix (e.g., 10.0.0.1/24)
    #[arg(long)]
    ipv4_prefix: Option<Ipv4Net>,

    /// IPv6 interface prefix (e.g., fd::1/120)
    #[arg(long)]
    ipv6_prefix: Option<Ipv6Net>,

    /// MTU when creating a named interface (valid range: 576-65535)
    #[arg(long, value_parser = clap::value_parser!(u16).range(576..))]
    mtu: Option<u16>,

    /// Packet read buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Number of captured UDP datagrams held before the pump waits
    #[arg(long)]
    udp_queue_capacity: Option<usize>,

    /// Assign the prefixes to the created interface
    #[arg(long)]
    configure_interface: bool,

    /// Command run before the device is acquired (repeatable)
    #[arg(long = "pre-command", value_name = "COMMAND")]
    pre_commands: Vec<String>,

    /// Command run after the device is acquired (repeatable)
    #[arg(long = "post-command", value_name = "COMMAND")]
    post_commands: Vec<String>,
}

impl Args {
    /// Merge flags over the configuration file.
    fn into_config(self) -> Result<TunatConfig> {
        let mut config = match &self.config {
            Some(path) => TunatConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => TunatConfig::default(),
        };

        if let Some(name) = self.name {
            config.device = Some(DeviceSource::Name(name));
        } else if let Some(fd) = self.fd {
            config.device = Some(DeviceSource::Fd(fd));
        } else if let Some(path) = self.unix_socket {
            config.device = Some(DeviceSource::UnixSocket(path));
        }
        if self.ipv4_prefix.is_some() {
            config.ipv4_prefix = self.ipv4_prefix;
        }
        if self.ipv6_prefix.is_some() {
            config.ipv6_prefix = self.ipv6_prefix;
        }
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(capacity) = self.udp_queue_capacity {
            config.udp_queue_capacity = capacity;
        }
        config.configure_interface |= self.configure_interface;
        config.pre_commands.extend(self.pre_commands);
        config.post_commands.extend(self.post_commands);

        if config.device.is_none() {
            anyhow::bail!(
                "No device given.\n\
                 Use --name <IFNAME>, --fd <FD>, --unix-socket <PATH> or a config file"
            );
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    let tunat = Arc::new(
        Tunat::open(config)
            .await
            .context("Failed to start tunat")?,
    );

    for family in [IpFamily::V4, IpFamily::V6] {
        if let Some(target) = tunat.redirect_target(family) {
            log::info!("{} connections are delivered to {}", family, target);
            tokio::spawn(accept_loop(tunat.clone(), family));
        }
    }
    tokio::spawn(udp_loop(tunat.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            log::info!("Shutting down");
            tunat.close();
            tunat.wait().await.context("Packet pump failed")?;
        }
        result = tunat.wait() => {
            result.context("Packet pump failed")?;
        }
    }

    Ok(())
}

/// Accept redirected connections and echo them.
async fn accept_loop(tunat: Arc<Tunat>, family: IpFamily) {
    loop {
        let accepted = match family {
            IpFamily::V4 => tunat.accept_v4().await,
            IpFamily::V6 => tunat.accept_v6().await,
        };
        match accepted {
            Ok(stream) => {
                tokio::spawn(echo(stream));
            }
            Err(e) if e.is_fatal() => break,
            Err(e) => log::warn!("Accept failed: {}", e),
        }
    }
}

async fn echo(stream: NatTcpStream) {
    let client = stream.peer_addr();
    let dest = stream.local_addr();
    log::info!("TCP {} -> {}", client, dest);

    let (mut reader, mut writer) = tokio::io::split(stream);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => log::info!("TCP {} -> {} closed after {} bytes", client, dest, bytes),
        Err(e) => log::warn!("TCP {} -> {} failed: {}", client, dest, e),
    }
}

/// Answer each captured datagram with a copy sent from its destination.
async fn udp_loop(tunat: Arc<Tunat>) {
    loop {
        let datagram = match tunat.recv_udp().await {
            Ok(datagram) => datagram,
            Err(_) => break,
        };
        log::info!(
            "UDP {} -> {} ({} bytes)",
            datagram.src,
            datagram.dst,
            datagram.payload.len()
        );
        if let Err(e) = tunat
            .send_udp(&datagram.payload, datagram.dst, datagram.src)
            .await
        {
            log::warn!("UDP reply to {} failed: {}", datagram.src, e);
        }
    }
}
