//! Chunk framing and reassembly.
//!
//! Every link frame is a fixed 12-byte header followed by up to
//! [`MAX_PAYLOAD`] payload bytes. A message is split into `ceil(len/mtu)`
//! chunks by [`make_chunks`]; the receiving side feeds parsed chunks into a
//! [`Reassembler`], which tolerates arbitrary interleaving and duplicates and
//! returns the concatenated payload exactly once.
//!
//! There is no ACK or retransmission here: the BLE layer underneath already
//! provides ATT-level acknowledgments, and the sender keeps at most one
//! message in flight.

use std::collections::HashMap;

use crate::errors::FragError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// On-wire protocol version.
pub const PROTO_VER: u8 = 1;

/// Set on the last chunk of a message.
pub const FLAG_FINAL: u8 = 1 << 0;

/// Reserved for retransmitted chunks.
pub const FLAG_RETRANS: u8 = 1 << 1;

/// Fixed header size in bytes.
pub const HDR_SIZE: usize = 12;

/// Maximum payload bytes carried by a single chunk.
pub const MAX_PAYLOAD: usize = 100;

/// Maximum number of chunks per message.
pub const MAX_FRAGMENTS: usize = 65535;

// ----------------------------------------------------------------------------
// Header
// ----------------------------------------------------------------------------

/// On-wire chunk header.
///
/// Layout: `ver:u8, flags:u8, msg_id:u32 BE, seq:u16 BE, total:u16 BE,
/// len:u16 BE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ver: u8,
    pub flags: u8,
    pub msg_id: u32,
    pub seq: u16,
    pub total: u16,
    pub len: u16,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            ver: PROTO_VER,
            flags: 0,
            msg_id: 0,
            seq: 0,
            total: 0,
            len: 0,
        }
    }
}

impl Header {
    /// Check the header invariants.
    pub fn validate(&self) -> Result<(), FragError> {
        if self.ver != PROTO_VER {
            return Err(FragError::BadHeader("version"));
        }
        if self.total == 0 {
            return Err(FragError::BadHeader("total is zero"));
        }
        if self.seq >= self.total {
            return Err(FragError::BadHeader("seq >= total"));
        }
        if self.len as usize > MAX_PAYLOAD {
            return Err(FragError::BadHeader("len > MAX_PAYLOAD"));
        }
        Ok(())
    }

    /// Serialize into the fixed 12-byte wire layout.
    pub fn pack(&self) -> [u8; HDR_SIZE] {
        let mut out = [0u8; HDR_SIZE];
        out[0] = self.ver;
        out[1] = self.flags;
        out[2..6].copy_from_slice(&self.msg_id.to_be_bytes());
        out[6..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..10].copy_from_slice(&self.total.to_be_bytes());
        out[10..12].copy_from_slice(&self.len.to_be_bytes());
        out
    }

    /// Deserialize from the fixed 12-byte wire layout. Does not validate.
    pub fn unpack(buf: &[u8; HDR_SIZE]) -> Self {
        Self {
            ver: buf[0],
            flags: buf[1],
            msg_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            seq: u16::from_be_bytes([buf[6], buf[7]]),
            total: u16::from_be_bytes([buf[8], buf[9]]),
            len: u16::from_be_bytes([buf[10], buf[11]]),
        }
    }

    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }
}

// ----------------------------------------------------------------------------
// Chunk
// ----------------------------------------------------------------------------

/// A header plus its payload; one chunk is one BLE GATT operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub hdr: Header,
    pub payload: Vec<u8>,
}

/// Split `payload` into chunks of at most `mtu_payload` bytes each.
///
/// An empty payload yields exactly one empty chunk so that receivers still
/// observe a complete message. The last chunk carries [`FLAG_FINAL`].
pub fn make_chunks(msg_id: u32, payload: &[u8], mtu_payload: usize) -> Result<Vec<Chunk>, FragError> {
    if mtu_payload == 0 || mtu_payload > MAX_PAYLOAD {
        return Err(FragError::MtuOutOfRange(mtu_payload));
    }

    if payload.is_empty() {
        return Ok(vec![Chunk {
            hdr: Header {
                flags: FLAG_FINAL,
                msg_id,
                seq: 0,
                total: 1,
                len: 0,
                ..Header::default()
            },
            payload: Vec::new(),
        }]);
    }

    let total = payload.len().div_ceil(mtu_payload);
    if total > MAX_FRAGMENTS {
        return Err(FragError::TooManyFragments(total));
    }

    let mut chunks = Vec::with_capacity(total);
    for (seq, part) in payload.chunks(mtu_payload).enumerate() {
        let last = seq + 1 == total;
        chunks.push(Chunk {
            hdr: Header {
                flags: if last { FLAG_FINAL } else { 0 },
                msg_id,
                seq: seq as u16,
                total: total as u16,
                len: part.len() as u16,
                ..Header::default()
            },
            payload: part.to_vec(),
        });
    }
    Ok(chunks)
}

/// Serialize a chunk into its `12 + len` byte frame.
pub fn serialize(c: &Chunk) -> Result<Vec<u8>, FragError> {
    c.hdr.validate()?;
    if c.payload.len() != c.hdr.len as usize {
        return Err(FragError::PayloadMismatch {
            want: c.hdr.len as usize,
            got: c.payload.len(),
        });
    }
    let mut out = Vec::with_capacity(HDR_SIZE + c.payload.len());
    out.extend_from_slice(&c.hdr.pack());
    out.extend_from_slice(&c.payload);
    Ok(out)
}

/// Parse one frame into a chunk. No partial accept: the frame must be exactly
/// `12 + len` bytes and satisfy every header invariant.
pub fn parse(frame: &[u8]) -> Result<Chunk, FragError> {
    if frame.len() < HDR_SIZE {
        return Err(FragError::FrameTooShort(frame.len()));
    }
    let mut hdr_buf = [0u8; HDR_SIZE];
    hdr_buf.copy_from_slice(&frame[..HDR_SIZE]);
    let hdr = Header::unpack(&hdr_buf);
    hdr.validate()?;
    let want = HDR_SIZE + hdr.len as usize;
    if frame.len() != want {
        return Err(FragError::LengthMismatch {
            want,
            got: frame.len(),
        });
    }
    Ok(Chunk {
        hdr,
        payload: frame[HDR_SIZE..].to_vec(),
    })
}

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

/// Per-message reassembly state: one payload slot per expected chunk plus a
/// presence bitmap.
#[derive(Debug)]
struct State {
    total: u16,
    received: usize,
    bytes: usize,
    parts: Vec<Vec<u8>>,
    have: Vec<bool>,
}

impl State {
    fn new(total: u16) -> Self {
        Self {
            total,
            received: 0,
            bytes: 0,
            parts: vec![Vec::new(); total as usize],
            have: vec![false; total as usize],
        }
    }
}

/// Reassembles chunks into complete message payloads.
///
/// State for a `msg_id` is created on its first chunk and destroyed as soon as
/// the message completes. If a later chunk announces a different `total`, the
/// state is rebuilt for the new epoch and earlier fragments are discarded.
#[derive(Debug, Default)]
pub struct Reassembler {
    map: HashMap<u32, State>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the complete payload when the last missing
    /// slot fills, and `None` otherwise. Duplicates are no-ops.
    pub fn feed(&mut self, c: &Chunk) -> Option<Vec<u8>> {
        if c.hdr.seq >= c.hdr.total || c.payload.len() != c.hdr.len as usize {
            return None;
        }

        let state = self
            .map
            .entry(c.hdr.msg_id)
            .or_insert_with(|| State::new(c.hdr.total));
        if state.total != c.hdr.total {
            *state = State::new(c.hdr.total);
        }

        let slot = c.hdr.seq as usize;
        if !state.have[slot] {
            state.have[slot] = true;
            state.received += 1;
            state.bytes += c.payload.len();
            state.parts[slot] = c.payload.clone();
        }

        if state.received == state.total as usize {
            let state = self.map.remove(&c.hdr.msg_id)?;
            let mut out = Vec::with_capacity(state.bytes);
            for part in &state.parts {
                out.extend_from_slice(part);
            }
            Some(out)
        } else {
            None
        }
    }

    /// Drop any pending state for `msg_id`.
    pub fn clear(&mut self, msg_id: u32) {
        self.map.remove(&msg_id);
    }

    /// Number of messages currently being reassembled.
    pub fn pending(&self) -> usize {
        self.map.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = Header {
            ver: PROTO_VER,
            flags: FLAG_FINAL | FLAG_RETRANS,
            msg_id: 0xDEADBEEF,
            seq: 41,
            total: 42,
            len: 100,
        };
        assert_eq!(Header::unpack(&hdr.pack()), hdr);
    }

    #[test]
    fn header_layout_is_big_endian() {
        let hdr = Header {
            ver: 1,
            flags: 1,
            msg_id: 0x01020304,
            seq: 0x0506,
            total: 0x0708,
            len: 0x0009,
        };
        assert_eq!(
            hdr.pack(),
            [0x01, 0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x00, 0x09]
        );
    }

    #[test]
    fn empty_payload_is_one_final_chunk() {
        let chunks = make_chunks(7, &[], 50).unwrap();
        assert_eq!(chunks.len(), 1);
        let c = &chunks[0];
        assert_eq!(c.hdr.total, 1);
        assert_eq!(c.hdr.seq, 0);
        assert_eq!(c.hdr.len, 0);
        assert!(c.hdr.is_final());

        let mut r = Reassembler::new();
        assert_eq!(r.feed(c), Some(Vec::new()));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn mtu_bounds_are_enforced() {
        assert_eq!(make_chunks(1, b"x", 0), Err(FragError::MtuOutOfRange(0)));
        assert_eq!(
            make_chunks(1, b"x", MAX_PAYLOAD + 1),
            Err(FragError::MtuOutOfRange(MAX_PAYLOAD + 1))
        );
        assert!(make_chunks(1, b"x", 1).is_ok());
        assert!(make_chunks(1, b"x", MAX_PAYLOAD).is_ok());
    }

    #[test]
    fn too_many_fragments_is_rejected() {
        let payload = vec![0u8; MAX_FRAGMENTS + 1];
        assert_eq!(
            make_chunks(1, &payload, 1),
            Err(FragError::TooManyFragments(MAX_FRAGMENTS + 1))
        );
        let payload = vec![0u8; MAX_FRAGMENTS];
        assert_eq!(make_chunks(1, &payload, 1).unwrap().len(), MAX_FRAGMENTS);
    }

    #[test]
    fn fragmented_long_message_counts() {
        // 4096 bytes of plaintext seal to 4136 bytes; a 32-byte frame MTU
        // leaves 20 payload bytes per chunk.
        let sealed = vec![b'X'; 4136];
        let chunks = make_chunks(9, &sealed, 20).unwrap();
        assert_eq!(chunks.len(), 207);
        let last = chunks.last().unwrap();
        assert_eq!(last.hdr.len, 16);
        assert!(last.hdr.is_final());
        assert!(chunks[..206].iter().all(|c| !c.hdr.is_final()));
    }

    #[test]
    fn serialize_parse_identity() {
        let chunks = make_chunks(3, b"hello fragmentation", 8).unwrap();
        for c in &chunks {
            let frame = serialize(c).unwrap();
            assert_eq!(frame.len(), HDR_SIZE + c.hdr.len as usize);
            assert_eq!(parse(&frame).unwrap(), *c);
        }
    }

    #[test]
    fn serialize_rejects_inconsistent_chunk() {
        let mut c = make_chunks(3, b"abc", 10).unwrap().remove(0);
        c.payload.push(b'!');
        assert!(matches!(
            serialize(&c),
            Err(FragError::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn parse_rejects_bad_frames() {
        assert_eq!(parse(&[0u8; 4]), Err(FragError::FrameTooShort(4)));

        let good = serialize(&make_chunks(1, b"abcd", 4).unwrap()[0]).unwrap();

        // Wrong version.
        let mut f = good.clone();
        f[0] = 2;
        assert_eq!(parse(&f), Err(FragError::BadHeader("version")));

        // total == 0
        let mut f = good.clone();
        f[8] = 0;
        f[9] = 0;
        assert_eq!(parse(&f), Err(FragError::BadHeader("total is zero")));

        // seq >= total
        let mut f = good.clone();
        f[6] = 0;
        f[7] = 1;
        assert_eq!(parse(&f), Err(FragError::BadHeader("seq >= total")));

        // Trailing byte.
        let mut f = good.clone();
        f.push(0);
        assert!(matches!(parse(&f), Err(FragError::LengthMismatch { .. })));

        // len > MAX_PAYLOAD.
        let mut f = good;
        f[10] = 0;
        f[11] = 101;
        assert_eq!(parse(&f), Err(FragError::BadHeader("len > MAX_PAYLOAD")));
    }

    #[test]
    fn out_of_order_with_duplicate() {
        // 230 bytes at payload MTU 100 -> chunks of 100, 100, 30.
        let payload: Vec<u8> = (0..230u32).map(|i| i as u8).collect();
        let chunks = make_chunks(5, &payload, 100).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].hdr.len, 30);

        let mut r = Reassembler::new();
        assert_eq!(r.feed(&chunks[0]), None);
        assert_eq!(r.feed(&chunks[0]), None); // duplicate is a no-op
        assert_eq!(r.feed(&chunks[2]), None);
        assert_eq!(r.feed(&chunks[1]), Some(payload));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn total_change_resets_state() {
        let payload = vec![7u8; 60];
        let old = make_chunks(5, &payload, 20).unwrap(); // total = 3
        let new = make_chunks(5, &payload, 30).unwrap(); // total = 2

        let mut r = Reassembler::new();
        assert_eq!(r.feed(&old[0]), None);
        assert_eq!(r.feed(&old[1]), None);
        // Same msg_id, different total: the old epoch is discarded.
        assert_eq!(r.feed(&new[0]), None);
        assert_eq!(r.feed(&new[1]), Some(payload));
    }

    #[test]
    fn clear_drops_state() {
        let chunks = make_chunks(5, &[1u8; 40], 20).unwrap();
        let mut r = Reassembler::new();
        assert_eq!(r.feed(&chunks[0]), None);
        r.clear(5);
        assert_eq!(r.pending(), 0);
        // Feeding the remaining chunk starts a fresh, incomplete state.
        assert_eq!(r.feed(&chunks[1]), None);
        assert_eq!(r.pending(), 1);
    }

    #[test]
    fn interleaved_messages_complete_independently() {
        let pa = vec![0xAAu8; 50];
        let pb = vec![0xBBu8; 50];
        let ca = make_chunks(1, &pa, 20).unwrap();
        let cb = make_chunks(2, &pb, 20).unwrap();

        let mut r = Reassembler::new();
        assert_eq!(r.feed(&ca[0]), None);
        assert_eq!(r.feed(&cb[0]), None);
        assert_eq!(r.feed(&ca[1]), None);
        assert_eq!(r.feed(&cb[1]), None);
        assert_eq!(r.feed(&cb[2]), Some(pb));
        assert_eq!(r.feed(&ca[2]), Some(pa));
    }
}
