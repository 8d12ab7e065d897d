//! Send primitives.
//!
//! ICMP echo goes out on a raw ICMP socket (the kernel adds the IP header).
//! TCP SYN templates carry their own IPv4 header and go out on an
//! `IPPROTO_RAW` socket, which implies header inclusion on Linux. UDP uses a
//! connected datagram socket so each send skips the route lookup.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use tracing::debug;

use super::WorkerError;
use crate::packet::Protocol;

/// Larger send buffer so short scheduling hiccups do not turn into drops.
const SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// One send call per packet. A failed send is counted as a drop by the
/// caller and never retried.
pub trait PacketSink: Send {
    fn send(&mut self, packet: &[u8]) -> io::Result<usize>;
}

impl<S: PacketSink + ?Sized> PacketSink for Box<S> {
    #[inline]
    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        (**self).send(packet)
    }
}

/// Unconnected raw socket with a fixed destination.
pub struct RawSink {
    socket: Socket,
    destination: SockAddr,
}

impl PacketSink for RawSink {
    #[inline]
    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send_to(packet, &self.destination)
    }
}

/// Connected UDP socket.
pub struct DatagramSink {
    socket: Socket,
}

impl PacketSink for DatagramSink {
    #[inline]
    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send(packet)
    }
}

/// Acquire the send primitive for `protocol`.
///
/// Raw sockets need root or `CAP_NET_RAW`; a permission failure is reported
/// as [`WorkerError::Resource`] so the session can skip this worker.
pub fn open_sink(
    worker_id: usize,
    protocol: Protocol,
    destination: Ipv4Addr,
    port: u16,
) -> Result<Box<dyn PacketSink>, WorkerError> {
    let resource = |e: io::Error| WorkerError::Resource {
        worker_id,
        reason: describe(protocol, &e),
    };

    let sink: Box<dyn PacketSink> = match protocol {
        Protocol::Icmp => {
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::ICMPV4))
                .map_err(resource)?;
            tune(&socket, worker_id);
            Box::new(RawSink {
                socket,
                destination: SockAddr::from(SocketAddrV4::new(destination, 0)),
            })
        }
        Protocol::TcpSyn => {
            let socket = Socket::new(
                Domain::IPV4,
                Type::RAW,
                Some(SockProtocol::from(libc::IPPROTO_RAW)),
            )
            .map_err(resource)?;
            tune(&socket, worker_id);
            Box::new(RawSink {
                socket,
                destination: SockAddr::from(SocketAddrV4::new(destination, 0)),
            })
        }
        Protocol::Udp => {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))
                .map_err(resource)?;
            tune(&socket, worker_id);
            socket
                .connect(&SockAddr::from(SocketAddrV4::new(destination, port)))
                .map_err(resource)?;
            Box::new(DatagramSink { socket })
        }
    };

    debug!(worker_id, protocol = %protocol, %destination, "send primitive acquired");
    Ok(sink)
}

fn tune(socket: &Socket, worker_id: usize) {
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
        debug!(worker_id, error = %e, "could not raise send buffer size");
    }
}

fn describe(protocol: Protocol, e: &io::Error) -> String {
    if e.kind() == io::ErrorKind::PermissionDenied && protocol != Protocol::Udp {
        format!("{} (raw sockets require root or CAP_NET_RAW)", e)
    } else {
        e.to_string()
    }
}

/// Local address the routing table would use to reach `destination`.
///
/// Connecting a UDP socket sends nothing; it only fixes the route.
pub fn local_source_address(destination: Ipv4Addr) -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((destination, 80))?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        std::net::IpAddr::V6(ip) => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("route to {} uses IPv6 source {}", destination, ip),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_udp_sink_delivers_payload() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut sink = open_sink(0, Protocol::Udp, Ipv4Addr::LOCALHOST, port).unwrap();
        assert_eq!(sink.send(b"stressgen").unwrap(), 9);

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"stressgen");
    }

    #[test]
    fn test_local_source_for_loopback() {
        assert_eq!(
            local_source_address(Ipv4Addr::LOCALHOST).unwrap(),
            Ipv4Addr::LOCALHOST
        );
    }

    #[test]
    fn test_permission_hint_only_for_raw() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(describe(Protocol::Icmp, &denied).contains("CAP_NET_RAW"));
        assert!(!describe(Protocol::Udp, &denied).contains("CAP_NET_RAW"));
    }
}
