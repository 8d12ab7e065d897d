//! Packet template construction for the flood engine.
//!
//! Templates are built once per session and shared read-only between all
//! workers as [`Bytes`]. A [`TemplatePool`] holds a small number of variants
//! (distinct sequence numbers, source ports, payloads) so the receiver does
//! not see a single repeated frame; each worker walks the pool round-robin
//! through its own [`PoolCursor`].

pub mod checksum;
pub mod icmp;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use checksum::checksum;

/// Default ICMP packet size: fills a 1500-byte MTU once the 20-byte IP
/// header and 8-byte ICMP header are accounted for.
pub const DEFAULT_ICMP_PACKET_SIZE: usize = 1472;
/// Default UDP payload size.
pub const DEFAULT_UDP_PAYLOAD_SIZE: usize = 1300;
/// Largest payload a single IPv4 datagram can carry.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("could not resolve target address '{address}': {reason}")]
    AddressResolution { address: String, reason: String },

    #[error("invalid packet configuration: {0}")]
    InvalidConfiguration(String),
}

/// Traffic kind generated by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Icmp,
    TcpSyn,
    Udp,
}

impl Protocol {
    /// Smallest packet the builder can produce for this protocol.
    pub fn min_packet_size(&self) -> usize {
        match self {
            Protocol::Icmp => icmp::HEADER_LEN,
            Protocol::TcpSyn => tcp::SYN_PACKET_LEN,
            Protocol::Udp => 1,
        }
    }

    /// Largest packet the builder will produce for this protocol.
    pub fn max_packet_size(&self) -> usize {
        match self {
            Protocol::Icmp | Protocol::Udp => MAX_DATAGRAM_PAYLOAD,
            Protocol::TcpSyn => u16::MAX as usize,
        }
    }

    /// Packet size used when the session does not request one.
    pub fn default_packet_size(&self) -> usize {
        match self {
            Protocol::Icmp => DEFAULT_ICMP_PACKET_SIZE,
            Protocol::TcpSyn => tcp::SYN_PACKET_LEN,
            Protocol::Udp => DEFAULT_UDP_PAYLOAD_SIZE,
        }
    }

    /// Whether the protocol addresses a destination port.
    pub fn uses_port(&self) -> bool {
        !matches!(self, Protocol::Icmp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::TcpSyn => write!(f, "tcp_syn"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(Protocol::Icmp),
            "tcp" | "syn" | "tcp_syn" | "tcp-syn" => Ok(Protocol::TcpSyn),
            "udp" => Ok(Protocol::Udp),
            other => Err(PacketError::InvalidConfiguration(format!(
                "unknown protocol '{}'",
                other
            ))),
        }
    }
}

/// Resolve a target given as an IPv4 literal or a host name.
///
/// Only IPv4 destinations are supported; the first IPv4 address returned by
/// the resolver wins.
pub async fn resolve_target(address: &str) -> Result<Ipv4Addr, PacketError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(PacketError::AddressResolution {
            address: address.to_string(),
            reason: "empty address".into(),
        });
    }

    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) if !v4.is_unspecified() => Ok(v4),
            IpAddr::V4(_) => Err(PacketError::AddressResolution {
                address: address.to_string(),
                reason: "unspecified address".into(),
            }),
            IpAddr::V6(_) => Err(PacketError::AddressResolution {
                address: address.to_string(),
                reason: "IPv6 targets are not supported".into(),
            }),
        };
    }

    let addrs = tokio::net::lookup_host((trimmed, 0))
        .await
        .map_err(|e| PacketError::AddressResolution {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    addrs
        .filter_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| PacketError::AddressResolution {
            address: address.to_string(),
            reason: "no IPv4 address found".into(),
        })
}

/// Parameters the pool builder needs beyond protocol and destination.
#[derive(Debug, Clone)]
pub struct TemplateOptions {
    /// Total bytes handed to the send primitive per packet.
    pub packet_size: usize,
    /// Number of pre-built variants.
    pub pool_size: usize,
    /// Destination port (TCP/UDP).
    pub target_port: u16,
    /// Source address written into hand-built IP headers (TCP SYN).
    pub source: Ipv4Addr,
    /// IPv4 time-to-live for hand-built IP headers.
    pub ttl: u8,
    /// TCP receive window advertised in SYN packets.
    pub tcp_window: u16,
}

impl TemplateOptions {
    /// Defaults for `protocol`, to be overridden field by field.
    pub fn for_protocol(protocol: Protocol) -> Self {
        Self {
            packet_size: protocol.default_packet_size(),
            pool_size: 64,
            target_port: 0,
            source: Ipv4Addr::UNSPECIFIED,
            ttl: tcp::DEFAULT_TTL,
            tcp_window: tcp::DEFAULT_WINDOW,
        }
    }
}

/// One pre-built packet and the offsets of its mutable header fields.
#[derive(Debug, Clone)]
pub struct PacketTemplate {
    bytes: Bytes,
    /// Offset of the 16-bit identifier (ICMP id, IPv4 id). `None` for UDP.
    pub identifier_offset: Option<usize>,
    /// Offset of the sequence field (ICMP sequence, TCP sequence number).
    pub sequence_offset: Option<usize>,
    /// Offset of the checksum covering the transport header.
    pub checksum_offset: Option<usize>,
}

impl PacketTemplate {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Immutable set of packet variants for one session.
#[derive(Debug, Clone)]
pub struct TemplatePool {
    protocol: Protocol,
    destination: Ipv4Addr,
    target_port: u16,
    templates: Vec<PacketTemplate>,
}

impl TemplatePool {
    /// Build `options.pool_size` variants for `protocol` towards `destination`.
    pub fn build(
        protocol: Protocol,
        destination: Ipv4Addr,
        options: &TemplateOptions,
    ) -> Result<Self, PacketError> {
        if destination.is_unspecified() {
            return Err(PacketError::AddressResolution {
                address: destination.to_string(),
                reason: "unspecified destination".into(),
            });
        }
        if options.pool_size == 0 {
            return Err(PacketError::InvalidConfiguration(
                "template pool size must be at least 1".into(),
            ));
        }
        if options.packet_size < protocol.min_packet_size() {
            return Err(PacketError::InvalidConfiguration(format!(
                "{} packet size {} is below the {}-byte minimum",
                protocol,
                options.packet_size,
                protocol.min_packet_size()
            )));
        }
        if options.packet_size > protocol.max_packet_size() {
            return Err(PacketError::InvalidConfiguration(format!(
                "{} packet size {} exceeds the {}-byte maximum",
                protocol,
                options.packet_size,
                protocol.max_packet_size()
            )));
        }
        if protocol.uses_port() && options.target_port == 0 {
            return Err(PacketError::InvalidConfiguration(format!(
                "{} requires a non-zero target port",
                protocol
            )));
        }

        let templates = match protocol {
            Protocol::Icmp => icmp::build_pool(options),
            Protocol::TcpSyn => tcp::build_pool(destination, options)?,
            Protocol::Udp => udp::build_pool(options),
        };

        Ok(Self {
            protocol,
            destination,
            target_port: options.target_port,
            templates,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Size in bytes of every packet in the pool.
    pub fn packet_size(&self) -> usize {
        self.templates.first().map(|t| t.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn templates(&self) -> &[PacketTemplate] {
        &self.templates
    }

    /// A round-robin iterator starting at `offset`.
    ///
    /// Workers use their id as the offset so they do not all emit the same
    /// variant at the same moment.
    pub fn cursor(&self, offset: usize) -> PoolCursor {
        let buffers: Vec<Bytes> = self.templates.iter().map(|t| t.bytes.clone()).collect();
        let next = if buffers.is_empty() { 0 } else { offset % buffers.len() };
        PoolCursor { buffers, next }
    }
}

/// Worker-owned position inside a [`TemplatePool`].
#[derive(Debug, Clone)]
pub struct PoolCursor {
    buffers: Vec<Bytes>,
    next: usize,
}

impl PoolCursor {
    /// Return the next packet, wrapping around at the end of the pool.
    #[inline]
    pub fn next_packet(&mut self) -> &[u8] {
        let idx = self.next;
        self.next += 1;
        if self.next == self.buffers.len() {
            self.next = 0;
        }
        &self.buffers[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    #[test]
    fn test_protocol_parse_and_display() {
        assert_eq!("ICMP".parse::<Protocol>().unwrap(), Protocol::Icmp);
        assert_eq!("tcp-syn".parse::<Protocol>().unwrap(), Protocol::TcpSyn);
        assert_eq!("syn".parse::<Protocol>().unwrap(), Protocol::TcpSyn);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
        assert_eq!(Protocol::TcpSyn.to_string(), "tcp_syn");
    }

    #[test]
    fn test_undersized_packet_rejected() {
        let mut opts = TemplateOptions::for_protocol(Protocol::Icmp);
        opts.packet_size = 4;
        let err = TemplatePool::build(Protocol::Icmp, target(), &opts).unwrap_err();
        assert!(matches!(err, PacketError::InvalidConfiguration(_)));

        let mut opts = TemplateOptions::for_protocol(Protocol::TcpSyn);
        opts.target_port = 80;
        opts.source = Ipv4Addr::new(10, 0, 0, 2);
        opts.packet_size = 39;
        let err = TemplatePool::build(Protocol::TcpSyn, target(), &opts).unwrap_err();
        assert!(matches!(err, PacketError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut opts = TemplateOptions::for_protocol(Protocol::Udp);
        opts.target_port = 9;
        opts.packet_size = MAX_DATAGRAM_PAYLOAD + 1;
        assert!(TemplatePool::build(Protocol::Udp, target(), &opts).is_err());
    }

    #[test]
    fn test_port_required_for_udp() {
        let opts = TemplateOptions::for_protocol(Protocol::Udp);
        let err = TemplatePool::build(Protocol::Udp, target(), &opts).unwrap_err();
        assert!(matches!(err, PacketError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_unspecified_destination_rejected() {
        let opts = TemplateOptions::for_protocol(Protocol::Icmp);
        let err = TemplatePool::build(Protocol::Icmp, Ipv4Addr::UNSPECIFIED, &opts).unwrap_err();
        assert!(matches!(err, PacketError::AddressResolution { .. }));
    }

    #[test]
    fn test_pool_size_and_packet_size() {
        let mut opts = TemplateOptions::for_protocol(Protocol::Icmp);
        opts.pool_size = 16;
        let pool = TemplatePool::build(Protocol::Icmp, target(), &opts).unwrap();
        assert_eq!(pool.len(), 16);
        assert_eq!(pool.packet_size(), DEFAULT_ICMP_PACKET_SIZE);
        assert!(pool.templates().iter().all(|t| t.len() == DEFAULT_ICMP_PACKET_SIZE));
    }

    #[test]
    fn test_cursor_round_robin() {
        let mut opts = TemplateOptions::for_protocol(Protocol::Icmp);
        opts.pool_size = 3;
        opts.packet_size = 64;
        let pool = TemplatePool::build(Protocol::Icmp, target(), &opts).unwrap();

        let mut cursor = pool.cursor(1);
        let seen: Vec<Vec<u8>> = (0..6).map(|_| cursor.next_packet().to_vec()).collect();
        assert_eq!(seen[0], pool.templates()[1].bytes().to_vec());
        assert_eq!(seen[1], pool.templates()[2].bytes().to_vec());
        assert_eq!(seen[2], pool.templates()[0].bytes().to_vec());
        assert_eq!(seen[0], seen[3]);
        assert_eq!(seen[2], seen[5]);
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        assert_eq!(resolve_target("192.0.2.7").await.unwrap(), Ipv4Addr::new(192, 0, 2, 7));
        assert_eq!(resolve_target(" 127.0.0.1 ").await.unwrap(), Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_targets() {
        for bad in ["", "0.0.0.0", "::1", "no-such-host.invalid"] {
            let err = resolve_target(bad).await.unwrap_err();
            assert!(
                matches!(err, PacketError::AddressResolution { .. }),
                "{} should not resolve",
                bad
            );
        }
    }
}
