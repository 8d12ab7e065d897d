//! RFC 1071 Internet checksum.

use std::net::Ipv4Addr;

/// Compute the one's-complement Internet checksum of `data`.
///
/// The buffer is read as big-endian 16-bit words, an odd trailing byte is
/// padded with zero, and the carries are folded back into the low half until
/// none remain. The checksum field inside `data` must be zero when this is
/// called.
pub fn checksum(data: &[u8]) -> u16 {
    finish(sum_words(0, data))
}

/// Checksum of a TCP (or UDP) segment including the IPv4 pseudo-header.
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = sum_words(0, &pseudo);
    finish(sum_words(sum, segment))
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
        // Fold early so very large buffers cannot overflow the accumulator.
        if sum & 0x8000_0000 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn test_rfc1071_example() {
        // Worked example from RFC 1071 section 3: the folded sum is 0xddf2.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_empty_buffer() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_odd_length_pads_with_zero() {
        assert_eq!(checksum(&[0xAB]), checksum(&[0xAB, 0x00]));
        assert_eq!(checksum(&[1, 2, 3]), checksum(&[1, 2, 3, 0]));
    }

    #[test]
    fn test_round_trip_yields_zero() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let words = rng.gen_range(2..800);
            let mut buf = vec![0u8; words * 2];
            rng.fill_bytes(&mut buf);

            // Use bytes 2..4 as the checksum field, like ICMP.
            buf[2] = 0;
            buf[3] = 0;
            let sum = checksum(&buf);
            buf[2..4].copy_from_slice(&sum.to_be_bytes());

            assert_eq!(checksum(&buf), 0, "buffer of {} bytes", buf.len());
        }
    }

    #[test]
    fn test_all_ones_buffer() {
        let buf = vec![0xFFu8; 4096];
        assert_eq!(checksum(&buf), 0);
    }

    #[test]
    fn test_pseudo_header_round_trip() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(10, 0, 0, 1);
        let mut segment = vec![0u8; 20];
        rand::thread_rng().fill_bytes(&mut segment);
        segment[16] = 0;
        segment[17] = 0;

        let sum = pseudo_header_checksum(src, dst, 6, &segment);
        segment[16..18].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(pseudo_header_checksum(src, dst, 6, &segment), 0);
    }
}
