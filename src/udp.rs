//! UDP relaying.
//!
//! Inbound datagrams are copied onto a bounded queue with their original
//! addressing intact; replies are injected as synthesized frames carrying
//! whatever source the application chooses.

use crate::device::{PacketWriter, SharedWriter};
use crate::error::{TunatError, TunatResult};
use crate::packet::udp::{build_frame, parse};
use crate::packet::{IpHeader, ParseError};
use crate::pump::Shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A captured datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub payload: Vec<u8>,
    /// Original sender.
    pub src: SocketAddr,
    /// Original destination.
    pub dst: SocketAddr,
}

impl UdpDatagram {
    /// Copy the datagram out of a UDP frame.
    pub fn from_frame(frame: &[u8], ip: &IpHeader) -> Result<Self, ParseError> {
        let (src, dst, payload) = parse(frame, ip)?;
        Ok(Self {
            payload: payload.to_vec(),
            src,
            dst,
        })
    }
}

/// Pump side of the relay queue. Dropping it closes the queue.
#[derive(Debug)]
pub(crate) struct UdpSink {
    tx: mpsc::Sender<UdpDatagram>,
}

impl UdpSink {
    /// Queue a datagram, waiting while the queue is full.
    /// Returns false once the application side is gone.
    pub(crate) async fn push(&self, datagram: UdpDatagram) -> bool {
        self.tx.send(datagram).await.is_ok()
    }
}

/// Application side of the relay.
pub struct UdpRelay<W> {
    queue: Mutex<mpsc::Receiver<UdpDatagram>>,
    writer: SharedWriter<W>,
    shutdown: Arc<Shutdown>,
}

impl<W: PacketWriter> UdpRelay<W> {
    pub(crate) fn new(
        capacity: usize,
        writer: SharedWriter<W>,
        shutdown: Arc<Shutdown>,
    ) -> (Self, UdpSink) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                queue: Mutex::new(rx),
                writer,
                shutdown,
            },
            UdpSink { tx },
        )
    }

    /// Next captured datagram. Each datagram is delivered to exactly one caller.
    ///
    /// Once the pump has stopped, queued datagrams are still returned and
    /// then [`TunatError::DeviceClosed`].
    pub async fn recv(&self) -> TunatResult<UdpDatagram> {
        self.queue
            .lock()
            .await
            .recv()
            .await
            .ok_or(TunatError::DeviceClosed)
    }

    /// Write a datagram from `src` to `dst` onto the device.
    pub async fn send(&self, payload: &[u8], src: SocketAddr, dst: SocketAddr) -> TunatResult<()> {
        if self.shutdown.is_closed() {
            return Err(TunatError::DeviceClosed);
        }
        let frame = build_frame(payload, src, dst)?;
        self.writer
            .lock()
            .await
            .write_packet(&frame)
            .await
            .map_err(TunatError::Device)?;
        log::trace!("Injected {} byte datagram {} -> {}", payload.len(), src, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ChannelDevice, PacketDevice};
    use crate::packet::test_util::transport_checksum_ok;

    #[tokio::test]
    async fn test_send_writes_frame() {
        let (device, mut peer) = ChannelDevice::pair(4);
        let (_reader, writer) = device.split().unwrap();
        let (relay, _sink) = UdpRelay::new(4, Arc::new(Mutex::new(writer)), Arc::default());

        let src: SocketAddr = "10.0.0.3:100".parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        relay.send(b"abcd", src, dst).await.unwrap();

        let frame = peer.recv().await.unwrap();
        let ip = IpHeader::parse(&frame).unwrap();
        let datagram = UdpDatagram::from_frame(&frame, &ip).unwrap();
        assert_eq!(
            datagram,
            UdpDatagram {
                payload: b"abcd".to_vec(),
                src,
                dst
            }
        );
        assert!(transport_checksum_ok(&frame));
    }

    #[tokio::test]
    async fn test_queue_delivers_once_in_order() {
        let (device, _peer) = ChannelDevice::pair(4);
        let (_reader, writer) = device.split().unwrap();
        let (relay, sink) = UdpRelay::new(4, Arc::new(Mutex::new(writer)), Arc::default());

        let src: SocketAddr = "[fd::1]:5000".parse().unwrap();
        let dst: SocketAddr = "[fd::3]:53".parse().unwrap();
        for payload in [b"one".to_vec(), b"two".to_vec()] {
            assert!(sink.push(UdpDatagram { payload, src, dst }).await);
        }
        drop(sink);

        assert_eq!(relay.recv().await.unwrap().payload, b"one");
        assert_eq!(relay.recv().await.unwrap().payload, b"two");
        assert!(matches!(relay.recv().await, Err(TunatError::DeviceClosed)));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (device, _peer) = ChannelDevice::pair(4);
        let (_reader, writer) = device.split().unwrap();
        let shutdown = Arc::new(Shutdown::default());
        let (relay, _sink) = UdpRelay::new(4, Arc::new(Mutex::new(writer)), shutdown.clone());

        shutdown.close();
        let result = relay
            .send(b"abcd", "10.0.0.3:100".parse().unwrap(), "10.0.0.1:1".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TunatError::DeviceClosed)));
    }

    #[tokio::test]
    async fn test_send_rejects_mixed_families() {
        let (device, _peer) = ChannelDevice::pair(4);
        let (_reader, writer) = device.split().unwrap();
        let (relay, _sink) = UdpRelay::new(4, Arc::new(Mutex::new(writer)), Arc::default());

        let result = relay
            .send(b"abcd", "10.0.0.3:100".parse().unwrap(), "[fd::1]:1".parse().unwrap())
            .await;
        assert!(matches!(
            result,
            Err(TunatError::AddressFamilyMismatch { .. })
        ));
    }
}
