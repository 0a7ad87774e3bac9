//! The packet pump: one sequential loop reading frames from the device,
//! classifying them and dispatching to the TCP redirector or UDP relay.

use crate::device::{PacketReader, PacketWriter, SharedWriter};
use crate::error::{TunatError, TunatResult};
use crate::packet::{IpHeader, ParseError, PROTO_TCP, PROTO_UDP};
use crate::tcp::TcpRedirector;
use crate::udp::{UdpDatagram, UdpSink};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Why a frame was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Frame of 20 bytes or less.
    TooShort,
    /// IP version nibble is neither 4 nor 6.
    UnknownVersion,
    /// Transport is neither TCP nor UDP.
    UnsupportedProtocol,
    /// Header lengths disagree with the frame.
    Malformed,
    /// No fake port is free for a new flow.
    PortsExhausted,
    /// TCP segment matching no flow in either direction.
    Untracked,
    /// Writing the rewritten frame back to the device failed.
    WriteFailed,
}

impl DropReason {
    pub const ALL: [DropReason; 7] = [
        DropReason::TooShort,
        DropReason::UnknownVersion,
        DropReason::UnsupportedProtocol,
        DropReason::Malformed,
        DropReason::PortsExhausted,
        DropReason::Untracked,
        DropReason::WriteFailed,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::TooShort => "too short",
            DropReason::UnknownVersion => "unknown IP version",
            DropReason::UnsupportedProtocol => "unsupported protocol",
            DropReason::Malformed => "malformed",
            DropReason::PortsExhausted => "fake ports exhausted",
            DropReason::Untracked => "untracked flow",
            DropReason::WriteFailed => "device write failed",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ParseError> for DropReason {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::TooShort => DropReason::TooShort,
            ParseError::UnknownVersion(_) => DropReason::UnknownVersion,
            ParseError::Malformed => DropReason::Malformed,
        }
    }
}

/// Pump counters.
///
/// Atomic counters instead of per-packet logging in the hot path.
#[derive(Debug, Default)]
pub struct PumpStats {
    /// Frames read from the device.
    frames_read: AtomicU64,
    /// TCP frames rewritten and written back.
    tcp_forwarded: AtomicU64,
    /// UDP datagrams queued for the application.
    udp_captured: AtomicU64,
    /// Drops, indexed by [`DropReason`].
    drops: [AtomicU64; 7],
}

impl PumpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    pub fn tcp_forwarded(&self) -> u64 {
        self.tcp_forwarded.load(Ordering::Relaxed)
    }

    pub fn udp_captured(&self) -> u64 {
        self.udp_captured.load(Ordering::Relaxed)
    }

    /// Frames dropped for `reason`.
    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].load(Ordering::Relaxed)
    }

    /// Frames dropped for any reason.
    pub fn total_drops(&self) -> u64 {
        DropReason::ALL.iter().map(|r| self.drops(*r)).sum()
    }

    fn record_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// Close signal shared by the engine handle and the pump.
#[derive(Debug, Default)]
pub(crate) struct Shutdown {
    notify: Notify,
    closed: AtomicBool,
}

impl Shutdown {
    /// Request the pump to stop. Idempotent.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Stores a permit if the pump is busy, so the request is not lost
            self.notify.notify_one();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.notify.notified().await
    }
}

/// What the pump does after a frame.
enum Flow {
    Continue,
    Stop,
}

/// The read/classify/dispatch loop.
pub(crate) struct PacketPump<R, W> {
    reader: R,
    writer: SharedWriter<W>,
    redirector: TcpRedirector,
    udp: UdpSink,
    stats: Arc<PumpStats>,
    shutdown: Arc<Shutdown>,
    buffer_size: usize,
}

impl<R: PacketReader, W: PacketWriter> PacketPump<R, W> {
    pub(crate) fn new(
        reader: R,
        writer: SharedWriter<W>,
        redirector: TcpRedirector,
        udp: UdpSink,
        stats: Arc<PumpStats>,
        shutdown: Arc<Shutdown>,
        buffer_size: usize,
    ) -> Self {
        Self {
            reader,
            writer,
            redirector,
            udp,
            stats,
            shutdown,
            buffer_size,
        }
    }

    /// Run until the device fails or the engine is closed.
    ///
    /// Returns `Ok` when stopped by a close request and the read error
    /// otherwise. Either way the loop never restarts; dropping the pump
    /// closes the UDP queue.
    pub(crate) async fn run(mut self) -> TunatResult<()> {
        let mut buf = vec![0u8; self.buffer_size];
        log::info!("Packet pump started (buffer {} bytes)", self.buffer_size);

        let result = loop {
            let n = tokio::select! {
                _ = self.shutdown.wait() => break Ok(()),
                read = self.reader.read_packet(&mut buf) => match read {
                    Ok(n) => n,
                    Err(e) => break Err(TunatError::Device(e)),
                },
            };

            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
            if let Flow::Stop = self.process(&mut buf[..n]).await {
                break Ok(());
            }
        };

        // Late callers see the engine as closed even after a device failure
        self.shutdown.close();
        match &result {
            Ok(()) => log::info!("Packet pump stopped"),
            Err(e) => log::error!("Packet pump stopped: {}", e),
        }
        result
    }

    async fn process(&mut self, frame: &mut [u8]) -> Flow {
        let mut ip = match IpHeader::parse(frame) {
            Ok(ip) => ip,
            Err(e) => {
                self.dropped(e.into(), frame.len());
                return Flow::Continue;
            }
        };

        match ip.protocol {
            PROTO_TCP => {
                if let Err(reason) = self.redirector.process(frame, &mut ip) {
                    self.dropped(reason, frame.len());
                    return Flow::Continue;
                }
                let written = self.writer.lock().await.write_packet(&frame[..ip.total_len]).await;
                match written {
                    Ok(()) => {
                        self.stats.tcp_forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::warn!("TUN write error: {}", e);
                        self.dropped(DropReason::WriteFailed, frame.len());
                    }
                }
                Flow::Continue
            }
            PROTO_UDP => {
                let datagram = match UdpDatagram::from_frame(frame, &ip) {
                    Ok(datagram) => datagram,
                    Err(e) => {
                        self.dropped(e.into(), frame.len());
                        return Flow::Continue;
                    }
                };
                // A full queue stalls the pump; a close request still gets through
                let queued = tokio::select! {
                    _ = self.shutdown.wait() => return Flow::Stop,
                    queued = self.udp.push(datagram) => queued,
                };
                if !queued {
                    return Flow::Stop;
                }
                self.stats.udp_captured.fetch_add(1, Ordering::Relaxed);
                Flow::Continue
            }
            _ => {
                self.dropped(DropReason::UnsupportedProtocol, frame.len());
                Flow::Continue
            }
        }
    }

    /// Single exit for every discarded frame.
    fn dropped(&self, reason: DropReason, len: usize) {
        self.stats.record_drop(reason);
        match reason {
            DropReason::PortsExhausted => log::debug!("Dropped {} byte frame: {}", len, reason),
            _ => log::trace!("Dropped {} byte frame: {}", len, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ChannelDevice, ChannelPeer, PacketDevice};
    use crate::nat::{FlowTable, NatEntry};
    use crate::packet::tcp::{TcpHeader, FLAG_ACK, FLAG_SYN};
    use crate::packet::test_util::{tcp_frame, transport_checksum_ok};
    use crate::packet::udp::build_frame;
    use crate::tcp::FamilyRoute;
    use crate::udp::UdpRelay;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct Harness {
        peer: ChannelPeer,
        table: Arc<FlowTable>,
        relay: UdpRelay<crate::device::ChannelWriter>,
        stats: Arc<PumpStats>,
        shutdown: Arc<Shutdown>,
        pump: JoinHandle<TunatResult<()>>,
    }

    fn target() -> SocketAddr {
        "10.0.0.1:5555".parse().unwrap()
    }

    fn start() -> Harness {
        let (device, peer) = ChannelDevice::pair(16);
        let (reader, writer) = device.split().unwrap();
        let writer = Arc::new(Mutex::new(writer));
        let table = Arc::new(FlowTable::new());
        let shutdown = Arc::new(Shutdown::default());
        let stats = Arc::new(PumpStats::new());
        let redirector = TcpRedirector::new(
            table.clone(),
            Some(FamilyRoute {
                fake_ip: "10.0.0.2".parse().unwrap(),
                target: target(),
            }),
            None,
        );
        let (relay, sink) = UdpRelay::new(4, writer.clone(), shutdown.clone());
        let pump = PacketPump::new(
            reader,
            writer,
            redirector,
            sink,
            stats.clone(),
            shutdown.clone(),
            65535,
        );
        Harness {
            peer,
            table,
            relay,
            stats,
            shutdown,
            pump: tokio::spawn(pump.run()),
        }
    }

    async fn next_frame(peer: &mut ChannelPeer) -> Vec<u8> {
        timeout(Duration::from_secs(5), peer.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("device writer closed")
    }

    fn endpoints(frame: &[u8]) -> (SocketAddr, SocketAddr) {
        let ip = IpHeader::parse(frame).unwrap();
        let tcp = TcpHeader::parse(ip.transport(frame)).unwrap();
        (
            SocketAddr::new(ip.src, tcp.src_port),
            SocketAddr::new(ip.dst, tcp.dst_port),
        )
    }

    #[tokio::test]
    async fn test_syn_is_redirected() {
        let mut h = start();
        let client: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let dest: SocketAddr = "10.0.0.3:100".parse().unwrap();

        h.peer.inject(tcp_frame(client, dest, FLAG_SYN, &[])).await.unwrap();
        let out = next_frame(&mut h.peer).await;

        let fake: SocketAddr = "10.0.0.2:1".parse().unwrap();
        assert_eq!(endpoints(&out), (fake, target()));
        assert!(transport_checksum_ok(&out));
        assert_eq!(
            h.table.lookup_by_client(&client),
            Some(NatEntry { client, fake, dest })
        );

        // Kernel reply from the listener goes back to the client as the destination
        h.peer
            .inject(tcp_frame(target(), fake, FLAG_SYN | FLAG_ACK, &[]))
            .await
            .unwrap();
        let reply = next_frame(&mut h.peer).await;
        assert_eq!(endpoints(&reply), (dest, client));
        assert!(transport_checksum_ok(&reply));

        assert_eq!(h.stats.tcp_forwarded(), 2);
        assert_eq!(h.table.len(), 1);
    }

    #[tokio::test]
    async fn test_untracked_segment_is_dropped() {
        let mut h = start();
        let stray = tcp_frame(
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.3:100".parse().unwrap(),
            FLAG_ACK,
            b"data",
        );
        h.peer.inject(stray).await.unwrap();

        // A following SYN still gets through, so the stray was handled first
        let client: SocketAddr = "10.0.0.1:40001".parse().unwrap();
        h.peer
            .inject(tcp_frame(client, "10.0.0.3:100".parse().unwrap(), FLAG_SYN, &[]))
            .await
            .unwrap();
        next_frame(&mut h.peer).await;

        assert_eq!(h.stats.drops(DropReason::Untracked), 1);
        assert!(h.table.lookup_by_client(&"10.0.0.1:40000".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_stop_the_pump() {
        let h = start();

        h.peer.inject(vec![0x45; 10]).await.unwrap();
        let mut unknown = vec![0u8; 40];
        unknown[0] = 0x70;
        h.peer.inject(unknown).await.unwrap();
        let mut icmp = build_frame(b"ping", "10.0.0.1:1".parse().unwrap(), "10.0.0.3:2".parse().unwrap())
            .unwrap();
        icmp[9] = 1;
        h.peer.inject(icmp).await.unwrap();

        let src: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.3:53".parse().unwrap();
        h.peer.inject(build_frame(b"abcd", src, dst).unwrap()).await.unwrap();

        let datagram = timeout(Duration::from_secs(5), h.relay.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.payload, b"abcd");

        assert_eq!(h.stats.drops(DropReason::TooShort), 1);
        assert_eq!(h.stats.drops(DropReason::UnknownVersion), 1);
        assert_eq!(h.stats.drops(DropReason::UnsupportedProtocol), 1);
        assert_eq!(h.stats.total_drops(), 3);
        assert_eq!(h.stats.frames_read(), 4);
    }

    #[tokio::test]
    async fn test_close_stops_pump() {
        let h = start();
        h.shutdown.close();

        let result = timeout(Duration::from_secs(5), h.pump).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(matches!(h.relay.recv().await, Err(TunatError::DeviceClosed)));
    }

    #[tokio::test]
    async fn test_device_closure_is_fatal() {
        let h = start();
        drop(h.peer);

        let result = timeout(Duration::from_secs(5), h.pump).await.unwrap().unwrap();
        assert!(matches!(result, Err(TunatError::Device(_))));
        assert!(h.shutdown.is_closed());
    }

    #[tokio::test]
    async fn test_close_interrupts_full_udp_queue() {
        let h = start();
        let src: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.3:53".parse().unwrap();

        // Queue capacity is 4; the fifth datagram blocks the pump
        for i in 0..5u8 {
            h.peer.inject(build_frame(&[i], src, dst).unwrap()).await.unwrap();
        }
        while h.stats.udp_captured() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.shutdown.close();
        let result = timeout(Duration::from_secs(5), h.pump).await.unwrap().unwrap();
        assert!(result.is_ok());

        // Queued datagrams drain before the queue reports closure
        for i in 0..4u8 {
            assert_eq!(h.relay.recv().await.unwrap().payload, vec![i]);
        }
        assert!(matches!(h.relay.recv().await, Err(TunatError::DeviceClosed)));
    }
}
