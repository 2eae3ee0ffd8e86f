//! Ether Dream laser DAC protocol implementation.
//!
//! Ether Dream is a network-based laser DAC that uses TCP for streaming
//! and UDP for device discovery.
//!
//! # Example
//!
//! ```no_run
//! use etherdream::protocols::ether_dream::{recv_dac_broadcasts, dac::stream};
//! use etherdream::protocols::ether_dream::protocol::COMMUNICATION_PORT;
//! use std::net::SocketAddr;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut broadcasts = recv_dac_broadcasts()?;
//!     broadcasts.set_timeout(Some(Duration::from_secs(2)))?;
//!
//!     if let Ok((broadcast, src_addr)) = broadcasts.next_broadcast() {
//!         println!("Found DAC: {:?}", broadcast);
//!
//!         let addr = SocketAddr::new(src_addr.ip(), COMMUNICATION_PORT);
//!         let mut stream = stream::connect_timeout(&broadcast, addr, Duration::from_secs(5))?;
//!         stream.queue_commands().prepare_stream().submit()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod dac;
pub mod protocol;

pub use self::protocol::{
    DacBroadcast, DacPoint, DacResponse, DacStatus, ReadBytes, SizeBytes, WriteBytes,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{io, net};

/// An iterator that listens and waits for broadcast messages from DACs on the network and yields
/// them as they are received on the inner UDP socket.
pub struct RecvDacBroadcasts {
    udp_socket: net::UdpSocket,
    buffer: [u8; RecvDacBroadcasts::BUFFER_LEN],
}

impl RecvDacBroadcasts {
    /// Large enough for a broadcast plus any trailing bytes newer firmware appends.
    pub const BUFFER_LEN: usize = 512;
}

/// Listen for DAC broadcasts on the standard port on all interfaces.
pub fn recv_dac_broadcasts() -> io::Result<RecvDacBroadcasts> {
    let addr = net::SocketAddrV4::new(net::Ipv4Addr::UNSPECIFIED, protocol::BROADCAST_PORT);
    recv_dac_broadcasts_on(addr.into())
}

/// Listen for DAC broadcasts on a specific address.
///
/// The socket is bound with `SO_REUSEADDR` so several listeners on one host
/// can share the broadcast port.
pub fn recv_dac_broadcasts_on(addr: net::SocketAddr) -> io::Result<RecvDacBroadcasts> {
    let domain = match addr {
        net::SocketAddr::V4(_) => Domain::IPV4,
        net::SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    Ok(RecvDacBroadcasts {
        udp_socket: socket.into(),
        buffer: [0; RecvDacBroadcasts::BUFFER_LEN],
    })
}

impl RecvDacBroadcasts {
    /// Attempt to read the next broadcast.
    pub fn next_broadcast(&mut self) -> io::Result<(protocol::DacBroadcast, net::SocketAddr)> {
        let (len, src_addr) = self.udp_socket.recv_from(&mut self.buffer)?;
        if len < protocol::DacBroadcast::SIZE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "received {} bytes, expected at least {}",
                    len,
                    protocol::DacBroadcast::SIZE_BYTES
                ),
            ));
        }
        let mut bytes = &self.buffer[..len];
        let dac_broadcast = bytes.read_bytes::<protocol::DacBroadcast>()?;
        Ok((dac_broadcast, src_addr))
    }

    /// Set the timeout for the inner UDP socket used for reading broadcasts.
    pub fn set_timeout(&self, duration: Option<std::time::Duration>) -> io::Result<()> {
        self.udp_socket.set_read_timeout(duration)
    }

    /// The address the inner socket is bound to.
    pub fn local_addr(&self) -> io::Result<net::SocketAddr> {
        self.udp_socket.local_addr()
    }
}

impl Iterator for RecvDacBroadcasts {
    type Item = io::Result<(protocol::DacBroadcast, net::SocketAddr)>;
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_broadcast())
    }
}
