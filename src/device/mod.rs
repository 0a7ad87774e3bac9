//! Packet devices.
//!
//! The engine only sees a device through [`PacketDevice`]: something that
//! splits into a half reading one IP frame per call and a half writing one
//! IP frame per call. Acquisition strategies live in separate adapters and
//! are chosen before the engine starts:
//!
//! * [`TunDevice`]: kernel TUN interface, created by name or adopted from an
//!   already opened file descriptor.
//! * [`unix::receive_fd`]: receives that descriptor from another process.
//! * [`ChannelDevice`]: in-memory device for embedding and tests.
//!
//! Drivers built on a shared ring buffer (such as wintun sessions) map onto
//! the same contract: end of stream is reported as a read error (the pump
//! stops), a full ring silently drops the outgoing frame, and corrupted ring
//! state is a read error.

mod channel;
mod tun_device;
#[cfg(unix)]
pub mod unix;

pub use channel::{ChannelDevice, ChannelPeer, ChannelReader, ChannelWriter};
pub use tun_device::{TunConfig, TunDevice, TunReader, TunWriter};

use std::future::Future;
use std::io;
use std::sync::Arc;

/// Write half shared by the pump and UDP injection; one frame per lock.
pub type SharedWriter<W> = Arc<tokio::sync::Mutex<W>>;

/// Read half of a packet device.
pub trait PacketReader: Send + 'static {
    /// Read one frame into `buf`, returning its length.
    ///
    /// An error, including end of stream, stops the packet pump for good.
    fn read_packet(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Write half of a packet device.
pub trait PacketWriter: Send + 'static {
    /// Write exactly one frame.
    fn write_packet(&mut self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// A duplex frame device.
pub trait PacketDevice: Send + 'static {
    type Reader: PacketReader;
    type Writer: PacketWriter;

    /// Split into independent read and write halves.
    fn split(self) -> io::Result<(Self::Reader, Self::Writer)>;
}
