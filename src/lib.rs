//! tunat library
//!
//! Transparent NAT over a TUN device. Every TCP connection routed onto the
//! interface is silently redirected to a local listener, and the accepted
//! stream still reports the real client and the destination it dialed. UDP
//! datagrams are captured with their original addressing, and replies can be
//! injected from any source address.
//!
//! ```text
//!            client 10.0.0.1:X -> 10.0.0.3:100
//!                         |
//!                   [ TUN device ]
//!                         |
//!                   packet pump ---- UDP ----> bounded queue -> recv_udp()
//!                         |                                     send_udp()
//!                        TCP                                        |
//!                         |                                         v
//!       10.0.0.2:P -> 10.0.0.1:L (fake -> listener)          synthesized frame
//!                         |
//!                 host TCP stack -> NatListener::accept()
//!                                   local_addr() = 10.0.0.3:100
//!                                   peer_addr()  = 10.0.0.1:X
//! ```

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod nat;
pub mod packet;
pub mod pump;
pub mod tcp;
pub mod tunat;
pub mod udp;

pub use config::{DeviceSource, IpFamily, TunatConfig};
pub use error::{TunatError, TunatResult};
pub use nat::NatEntry;
pub use pump::{DropReason, PumpStats};
pub use tcp::NatTcpStream;
pub use tunat::Tunat;
pub use udp::UdpDatagram;
