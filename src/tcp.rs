//! Transparent TCP redirection.
//!
//! The redirector rewrites a client's segments so the host stack sees a
//! connection from the family's fake address to the local listener, and
//! rewrites the listener's replies so the client sees its original
//! destination answering. [`NatListener`] then maps each accepted
//! connection back to the flow it belongs to.

use crate::config::IpFamily;
use crate::error::{TunatError, TunatResult};
use crate::nat::{FlowLookup, FlowTable, NatEntry};
use crate::packet::tcp::{rewrite, TcpHeader};
use crate::packet::IpHeader;
use crate::pump::DropReason;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// Per-family redirection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyRoute {
    /// Substitute client address for new flows.
    pub fake_ip: IpAddr,
    /// Where redirected connections are delivered: prefix address and listener port.
    pub target: SocketAddr,
}

/// Creates flows and rewrites TCP frames in both directions.
#[derive(Debug)]
pub struct TcpRedirector {
    table: Arc<FlowTable>,
    v4: Option<FamilyRoute>,
    v6: Option<FamilyRoute>,
}

impl TcpRedirector {
    pub fn new(table: Arc<FlowTable>, v4: Option<FamilyRoute>, v6: Option<FamilyRoute>) -> Self {
        Self { table, v4, v6 }
    }

    fn route(&self, family: IpFamily) -> Option<&FamilyRoute> {
        match family {
            IpFamily::V4 => self.v4.as_ref(),
            IpFamily::V6 => self.v6.as_ref(),
        }
    }

    /// Rewrite a TCP frame in place.
    ///
    /// Only an initiating segment (SYN without ACK) from an unknown client
    /// creates a flow; replies never touch the table.
    pub fn process(&self, frame: &mut [u8], ip: &mut IpHeader) -> Result<(), DropReason> {
        let tcp = TcpHeader::parse(ip.transport(frame))?;
        let source = SocketAddr::new(ip.src, tcp.src_port);
        let destination = SocketAddr::new(ip.dst, tcp.dst_port);
        let route = self.route(ip.family).copied();

        if tcp.is_initial_syn() {
            if let Some(route) = route {
                match self.table.get_or_create(source, destination, route.fake_ip) {
                    FlowLookup::Created(entry) => log::debug!(
                        "New flow {} -> {} as {}",
                        entry.client,
                        entry.dest,
                        entry.fake
                    ),
                    FlowLookup::Existing(_) => {}
                    FlowLookup::Exhausted => return Err(DropReason::PortsExhausted),
                }
            }
        }

        if let Some(entry) = self.table.lookup_by_client(&source) {
            let route = route.ok_or(DropReason::Untracked)?;
            rewrite(frame, ip, entry.fake, route.target);
        } else if let Some(entry) = self.table.lookup_by_fake(&destination) {
            rewrite(frame, ip, entry.dest, entry.client);
        } else {
            return Err(DropReason::Untracked);
        }

        Ok(())
    }
}

/// Local listener terminating redirected connections of one family.
#[derive(Debug)]
pub struct NatListener {
    listener: TcpListener,
    table: Arc<FlowTable>,
    target: SocketAddr,
}

impl NatListener {
    /// Bind an ephemeral port on the unspecified address of `local_ip`'s
    /// family. The redirect target is `local_ip` with that port.
    pub async fn bind(local_ip: IpAddr, table: Arc<FlowTable>) -> TunatResult<Self> {
        let unspecified = match local_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let listener = TcpListener::bind(SocketAddr::new(unspecified, 0)).await?;
        let target = SocketAddr::new(local_ip, listener.local_addr()?.port());
        log::info!("Redirecting {} TCP to {}", IpFamily::of(&local_ip), target);

        Ok(Self {
            listener,
            table,
            target,
        })
    }

    /// Address redirected segments are sent to.
    pub fn redirect_target(&self) -> SocketAddr {
        self.target
    }

    /// Wait for the next redirected connection.
    ///
    /// A connection whose remote address is no flow's fake address is closed
    /// and reported as [`TunatError::UntrackedConnection`].
    pub async fn accept(&self) -> TunatResult<NatTcpStream> {
        let (stream, peer) = self.listener.accept().await?;

        match self.table.lookup_by_fake(&peer) {
            Some(entry) => {
                log::debug!("Accepted {} -> {}", entry.client, entry.dest);
                Ok(NatTcpStream {
                    stream,
                    entry,
                    table: self.table.clone(),
                })
            }
            None => {
                log::warn!("Accepted connection from {} matches no flow", peer);
                drop(stream);
                Err(TunatError::UntrackedConnection(peer))
            }
        }
    }
}

/// An accepted redirected connection reporting its original addressing.
///
/// Dropping or closing the stream removes its flow.
#[derive(Debug)]
pub struct NatTcpStream {
    stream: TcpStream,
    entry: NatEntry,
    table: Arc<FlowTable>,
}

impl NatTcpStream {
    /// The destination the client originally dialed.
    pub fn local_addr(&self) -> SocketAddr {
        self.entry.dest
    }

    /// The real client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.entry.client
    }

    /// Internal address the host stack saw as the peer.
    pub fn fake_addr(&self) -> SocketAddr {
        self.entry.fake
    }

    pub fn entry(&self) -> NatEntry {
        self.entry
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    /// Shut down the write side and release the flow.
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

impl Drop for NatTcpStream {
    fn drop(&mut self) {
        if self.table.remove(&self.entry) {
            log::debug!("Released flow {} -> {}", self.entry.client, self.entry.dest);
        }
    }
}

impl AsyncRead for NatTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for NatTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
