//! In-memory packet device backed by tokio channels.

use super::{PacketDevice, PacketReader, PacketWriter};
use std::io;
use tokio::sync::mpsc;

/// Engine side of an in-memory device.
pub struct ChannelDevice {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// Test or embedding side: injects frames and observes what the engine writes.
///
/// Dropping the peer closes the device.
pub struct ChannelPeer {
    inbound: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::Receiver<Vec<u8>>,
}

impl ChannelDevice {
    /// Create a connected device and peer. Each direction holds up to
    /// `capacity` frames.
    pub fn pair(capacity: usize) -> (ChannelDevice, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            ChannelDevice {
                inbound: in_rx,
                outbound: out_tx,
            },
            ChannelPeer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

impl ChannelPeer {
    /// Hand a frame to the engine as if it had been routed onto the interface.
    pub async fn inject(&self, frame: Vec<u8>) -> io::Result<()> {
        self.inbound
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device reader dropped"))
    }

    /// Next frame the engine wrote, or `None` once the writer is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    /// Next written frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }
}

impl PacketDevice for ChannelDevice {
    type Reader = ChannelReader;
    type Writer = ChannelWriter;

    fn split(self) -> io::Result<(ChannelReader, ChannelWriter)> {
        Ok((
            ChannelReader { rx: self.inbound },
            ChannelWriter { tx: self.outbound },
        ))
    }
}

pub struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PacketReader for ChannelReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let frame = self
            .rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "device closed"))?;
        // Oversized frames are truncated like a short read on a real interface
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }
}

pub struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl PacketWriter for ChannelWriter {
    async fn write_packet(&mut self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device peer dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (device, mut peer) = ChannelDevice::pair(4);
        let (mut reader, mut writer) = device.split().unwrap();

        peer.inject(vec![1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        writer.write_packet(&[4, 5]).await.unwrap();
        assert_eq!(peer.recv().await, Some(vec![4, 5]));
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test]
    async fn test_dropping_peer_closes_device() {
        let (device, peer) = ChannelDevice::pair(4);
        let (mut reader, mut writer) = device.split().unwrap();
        drop(peer);

        let mut buf = [0u8; 16];
        let err = reader.read_packet(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(writer.write_packet(&[1]).await.is_err());
    }
}
