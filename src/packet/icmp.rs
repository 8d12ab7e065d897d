//! ICMP echo-request templates.
//!
//! The kernel supplies the IP header for raw ICMP sockets, so a template is
//! only the 8-byte echo header followed by padding.

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

use super::checksum::checksum;
use super::{PacketTemplate, TemplateOptions};

pub const HEADER_LEN: usize = 8;
pub const ECHO_REQUEST: u8 = 8;

const CHECKSUM_OFFSET: usize = 2;
const IDENTIFIER_OFFSET: usize = 4;
const SEQUENCE_OFFSET: usize = 6;

/// Build a single echo request of exactly `total_size` bytes.
///
/// The payload is filled from `payload` (repeated if shorter); the checksum
/// covers header and payload.
pub fn build_echo(identifier: u16, sequence: u16, total_size: usize, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(total_size.max(HEADER_LEN));
    buf.put_u8(ECHO_REQUEST);
    buf.put_u8(0); // code
    buf.put_u16(0); // checksum, filled below
    buf.put_u16(identifier);
    buf.put_u16(sequence);

    let pad = total_size.saturating_sub(HEADER_LEN);
    if payload.is_empty() {
        buf.put_bytes(0, pad);
    } else {
        for i in 0..pad {
            buf.put_u8(payload[i % payload.len()]);
        }
    }

    let sum = checksum(&buf);
    buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
    buf.freeze()
}

/// One identifier per pool, one sequence number per slot.
pub(super) fn build_pool(options: &TemplateOptions) -> Vec<PacketTemplate> {
    let mut rng = rand::thread_rng();
    let identifier = (rng.next_u32() & 0xFFFF) as u16;
    let mut payload = vec![0u8; options.packet_size.saturating_sub(HEADER_LEN)];

    (0..options.pool_size)
        .map(|slot| {
            rng.fill_bytes(&mut payload);
            PacketTemplate {
                bytes: build_echo(identifier, slot as u16, options.packet_size, &payload),
                identifier_offset: Some(IDENTIFIER_OFFSET),
                sequence_offset: Some(SEQUENCE_OFFSET),
                checksum_offset: Some(CHECKSUM_OFFSET),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;

    #[test]
    fn test_header_fields() {
        let pkt = build_echo(0xBEEF, 7, 64, &[0xAA]);
        assert_eq!(pkt.len(), 64);
        assert_eq!(pkt[0], ECHO_REQUEST);
        assert_eq!(pkt[1], 0);
        assert_eq!(u16::from_be_bytes([pkt[4], pkt[5]]), 0xBEEF);
        assert_eq!(u16::from_be_bytes([pkt[6], pkt[7]]), 7);
        assert!(pkt[8..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_checksum_verifies() {
        let pkt = build_echo(1, 2, 1472, b"payload");
        assert_eq!(checksum(&pkt), 0);
    }

    #[test]
    fn test_odd_size_checksum_verifies() {
        let pkt = build_echo(0x1234, 99, 101, b"xyz");
        assert_eq!(pkt.len(), 101);
        assert_eq!(checksum(&pkt), 0);
    }

    #[test]
    fn test_header_only_packet() {
        let pkt = build_echo(5, 6, HEADER_LEN, &[]);
        assert_eq!(pkt.len(), HEADER_LEN);
        assert_eq!(checksum(&pkt), 0);
    }

    #[test]
    fn test_pool_sequences_and_shared_identifier() {
        let mut opts = TemplateOptions::for_protocol(Protocol::Icmp);
        opts.pool_size = 64;
        let pool = build_pool(&opts);
        assert_eq!(pool.len(), 64);

        let id = u16::from_be_bytes([pool[0].bytes()[4], pool[0].bytes()[5]]);
        for (slot, template) in pool.iter().enumerate() {
            let bytes = template.bytes();
            assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), id);
            assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), slot as u16);
            assert_eq!(checksum(bytes), 0);
            assert_eq!(template.checksum_offset, Some(2));
        }
    }
}
