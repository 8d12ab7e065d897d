//! UDP payload templates. The kernel builds the UDP and IP headers.

use bytes::Bytes;
use rand::RngCore;

use super::{PacketTemplate, TemplateOptions};

/// Random payload of `size` bytes.
pub fn build_payload(size: usize) -> Bytes {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    Bytes::from(payload)
}

pub(super) fn build_pool(options: &TemplateOptions) -> Vec<PacketTemplate> {
    (0..options.pool_size)
        .map(|_| PacketTemplate {
            bytes: build_payload(options.packet_size),
            identifier_offset: None,
            sequence_offset: None,
            checksum_offset: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Protocol, DEFAULT_UDP_PAYLOAD_SIZE};

    #[test]
    fn test_payload_size() {
        assert_eq!(build_payload(1300).len(), 1300);
        assert_eq!(build_payload(1).len(), 1);
    }

    #[test]
    fn test_pool_defaults() {
        let opts = TemplateOptions::for_protocol(Protocol::Udp);
        let pool = build_pool(&opts);
        assert_eq!(pool.len(), 64);
        assert!(pool.iter().all(|t| t.len() == DEFAULT_UDP_PAYLOAD_SIZE));
        assert!(pool.iter().all(|t| t.checksum_offset.is_none()));
        // Independent random payloads; a collision over 1300 bytes is not realistic.
        assert_ne!(pool[0].bytes(), pool[1].bytes());
    }
}
