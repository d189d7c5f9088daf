//! Property tests for the fragmentation layer.
//!
//! The reassembly property is the load-bearing one: for any payload and any
//! MTU, any permutation of the chunks with arbitrary duplicates must produce
//! the original payload exactly once, and never before the last missing slot
//! fills.

use proptest::prelude::*;

use bitchat_core::frag::{self, Header, Reassembler, HDR_SIZE, MAX_PAYLOAD, PROTO_VER};

proptest! {
    #[test]
    fn header_pack_unpack_round_trip(
        flags in 0u8..4,
        msg_id in any::<u32>(),
        total in 1u16..=u16::MAX,
        seq_offset in any::<u16>(),
        len in 0u16..=MAX_PAYLOAD as u16,
    ) {
        let hdr = Header {
            ver: PROTO_VER,
            flags,
            msg_id,
            seq: seq_offset % total,
            total,
            len,
        };
        prop_assert!(hdr.validate().is_ok());
        prop_assert_eq!(Header::unpack(&hdr.pack()), hdr);
    }

    #[test]
    fn serialize_parse_round_trip(
        msg_id in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 0..=2048),
        mtu in 1usize..=MAX_PAYLOAD,
    ) {
        let chunks = frag::make_chunks(msg_id, &payload, mtu).unwrap();
        for c in &chunks {
            let frame = frag::serialize(c).unwrap();
            prop_assert_eq!(frame.len(), HDR_SIZE + c.hdr.len as usize);
            prop_assert_eq!(&frag::parse(&frame).unwrap(), c);
        }
    }

    #[test]
    fn chunking_covers_payload_exactly(
        msg_id in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 1..=4096),
        mtu in 1usize..=MAX_PAYLOAD,
    ) {
        let chunks = frag::make_chunks(msg_id, &payload, mtu).unwrap();
        prop_assert_eq!(chunks.len(), payload.len().div_ceil(mtu));
        // Exactly the last chunk is final; sequence numbers are dense.
        for (i, c) in chunks.iter().enumerate() {
            prop_assert_eq!(c.hdr.seq as usize, i);
            prop_assert_eq!(c.hdr.total as usize, chunks.len());
            prop_assert_eq!(c.hdr.is_final(), i + 1 == chunks.len());
        }
        let rejoined: Vec<u8> = chunks.iter().flat_map(|c| c.payload.clone()).collect();
        prop_assert_eq!(rejoined, payload);
    }

    #[test]
    fn reassembly_tolerates_permutation_and_duplicates(
        msg_id in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 1..=2048),
        mtu in 1usize..=MAX_PAYLOAD,
        seed in any::<u64>(),
    ) {
        let chunks = frag::make_chunks(msg_id, &payload, mtu).unwrap();

        // Deterministic shuffle plus duplicates derived from the seed.
        let mut order: Vec<usize> = (0..chunks.len()).collect();
        let mut state = seed;
        for i in (1..order.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }
        let mut feed_order: Vec<usize> = Vec::new();
        for &i in &order {
            feed_order.push(i);
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if state % 3 == 0 {
                feed_order.push(i); // duplicate
            }
        }

        let mut r = Reassembler::new();
        let mut done: Option<Vec<u8>> = None;
        let mut seen = std::collections::HashSet::new();
        for (n, &i) in feed_order.iter().enumerate() {
            if done.is_some() {
                // Completion drops the state; later duplicates would start a
                // fresh message, which is outside this property.
                break;
            }
            let completes_set = seen.insert(i) && seen.len() == chunks.len();
            let out = r.feed(&chunks[i]);
            if completes_set {
                prop_assert!(out.is_some(), "no payload after all slots filled");
                prop_assert!(done.is_none(), "payload produced twice");
                done = out;
            } else {
                prop_assert!(out.is_none(), "payload produced early at step {}", n);
            }
        }
        prop_assert_eq!(done.unwrap(), payload);
    }
}
