//! IPv4 + TCP SYN templates for header-included raw sockets.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use super::checksum::{checksum, pseudo_header_checksum};
use super::{PacketError, PacketTemplate, TemplateOptions};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const SYN_PACKET_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;

pub const DEFAULT_TTL: u8 = 64;
pub const DEFAULT_WINDOW: u16 = 8192;

const PROTO_TCP: u8 = 6;
const FLAG_SYN: u8 = 0x02;
const DONT_FRAGMENT: u16 = 0x4000;

const IP_ID_OFFSET: usize = 4;
const IP_CHECKSUM_OFFSET: usize = 10;
const TCP_SEQ_OFFSET: usize = IPV4_HEADER_LEN + 4;
const TCP_CHECKSUM_OFFSET: usize = IPV4_HEADER_LEN + 16;

/// Fields that vary between SYN variants.
#[derive(Debug, Clone, Copy)]
pub struct SynFields {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence: u32,
    pub ip_id: u16,
    pub ttl: u8,
    pub window: u16,
}

/// Build a complete IPv4 packet carrying a TCP SYN segment.
///
/// `total_size` at least [`SYN_PACKET_LEN`]; anything beyond the two headers
/// is zero payload covered by the TCP checksum.
pub fn build_syn(fields: &SynFields, total_size: usize) -> Bytes {
    let total_size = total_size.max(SYN_PACKET_LEN);
    let mut buf = BytesMut::with_capacity(total_size);

    // IPv4 header
    buf.put_u8(0x45); // version 4, IHL 5
    buf.put_u8(0); // DSCP/ECN
    buf.put_u16(total_size as u16);
    buf.put_u16(fields.ip_id);
    buf.put_u16(DONT_FRAGMENT);
    buf.put_u8(fields.ttl);
    buf.put_u8(PROTO_TCP);
    buf.put_u16(0); // header checksum
    buf.put_slice(&fields.src.octets());
    buf.put_slice(&fields.dst.octets());

    // TCP header
    buf.put_u16(fields.src_port);
    buf.put_u16(fields.dst_port);
    buf.put_u32(fields.sequence);
    buf.put_u32(0); // ack
    buf.put_u8((TCP_HEADER_LEN as u8 / 4) << 4);
    buf.put_u8(FLAG_SYN);
    buf.put_u16(fields.window);
    buf.put_u16(0); // checksum
    buf.put_u16(0); // urgent pointer

    buf.put_bytes(0, total_size - SYN_PACKET_LEN);

    let ip_sum = checksum(&buf[..IPV4_HEADER_LEN]);
    buf[IP_CHECKSUM_OFFSET..IP_CHECKSUM_OFFSET + 2].copy_from_slice(&ip_sum.to_be_bytes());

    let tcp_sum = pseudo_header_checksum(fields.src, fields.dst, PROTO_TCP, &buf[IPV4_HEADER_LEN..]);
    buf[TCP_CHECKSUM_OFFSET..TCP_CHECKSUM_OFFSET + 2].copy_from_slice(&tcp_sum.to_be_bytes());

    buf.freeze()
}

/// Each slot gets its own random source port, sequence number and IP id.
pub(super) fn build_pool(
    destination: Ipv4Addr,
    options: &TemplateOptions,
) -> Result<Vec<PacketTemplate>, PacketError> {
    if options.source.is_unspecified() {
        return Err(PacketError::InvalidConfiguration(
            "TCP SYN templates need the local source address".into(),
        ));
    }

    let mut rng = rand::thread_rng();
    let templates = (0..options.pool_size)
        .map(|_| {
            let fields = SynFields {
                src: options.source,
                dst: destination,
                src_port: rng.gen_range(1024..=u16::MAX),
                dst_port: options.target_port,
                sequence: rng.gen(),
                ip_id: rng.gen(),
                ttl: options.ttl,
                window: options.tcp_window,
            };
            PacketTemplate {
                bytes: build_syn(&fields, options.packet_size),
                identifier_offset: Some(IP_ID_OFFSET),
                sequence_offset: Some(TCP_SEQ_OFFSET),
                checksum_offset: Some(TCP_CHECKSUM_OFFSET),
            }
        })
        .collect();

    Ok(templates)
}
