//! HELLO control frames.
//!
//! A HELLO is the one-shot capability/nonce record exchanged once per link
//! epoch. On the wire it is two fixed bytes (`0x01` message type, `0x01`
//! version) followed by TLV entries with big-endian `u16` lengths. The caps
//! bitmap value is the single little-endian field in the protocol and must
//! stay that way for wire compatibility.
//!
//! Unknown tags are skipped so that future peers can extend the record;
//! anything truncated or with an out-of-range length fails the parse and the
//! whole frame is dropped.

use crate::errors::HelloError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// First byte of a HELLO frame.
pub const MSG_CTRL_HELLO: u8 = 0x01;

/// HELLO format version.
pub const HELLO_VER: u8 = 0x01;

/// TLV tag: opaque user identity, 1..=64 bytes.
pub const T_USER_ID: u8 = 0x01;

/// TLV tag: capability bitmap, exactly 4 bytes, little-endian.
pub const T_CAPS: u8 = 0x02;

/// TLV tag: 32-byte nonce contribution for the key exchange.
pub const T_NA32: u8 = 0x12;

/// Capability bit: PSK-based AEAD supported.
pub const CAP_AEAD_PSK_SUPPORTED: u32 = 1 << 0;

/// Maximum user id length in bytes.
pub const MAX_USER_ID: usize = 64;

// ----------------------------------------------------------------------------
// Hello record
// ----------------------------------------------------------------------------

/// Parsed HELLO contents. Optional fields stay `None` when the peer omitted
/// the corresponding TLV.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hello {
    pub user_id: String,
    pub caps: Option<u32>,
    pub na32: Option<[u8; 32]>,
}

impl Hello {
    /// Whether the peer advertised PSK AEAD support.
    pub fn supports_psk(&self) -> bool {
        self.caps
            .is_some_and(|c| c & CAP_AEAD_PSK_SUPPORTED != 0)
    }
}

/// Quick check whether a frame looks like a HELLO, used to route inbound
/// frames before attempting a full parse.
pub fn is_hello(frame: &[u8]) -> bool {
    frame.len() >= 2 && frame[0] == MSG_CTRL_HELLO && frame[1] == HELLO_VER
}

// ----------------------------------------------------------------------------
// Encode
// ----------------------------------------------------------------------------

/// Encode a HELLO frame. The user id is truncated to [`MAX_USER_ID`] bytes
/// and omitted entirely when empty; the nonce TLV is emitted only when a
/// contribution is provided.
pub fn encode_hello(user_id: &str, caps: u32, na32: Option<&[u8; 32]>) -> Vec<u8> {
    let user = &user_id.as_bytes()[..user_id.len().min(MAX_USER_ID)];

    let mut out = Vec::with_capacity(2 + 3 + user.len() + 3 + 4 + 3 + 32);
    out.push(MSG_CTRL_HELLO);
    out.push(HELLO_VER);

    if !user.is_empty() {
        out.push(T_USER_ID);
        out.extend_from_slice(&(user.len() as u16).to_be_bytes());
        out.extend_from_slice(user);
    }

    out.push(T_CAPS);
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&caps.to_le_bytes());

    if let Some(na) = na32 {
        out.push(T_NA32);
        out.extend_from_slice(&32u16.to_be_bytes());
        out.extend_from_slice(na);
    }

    out
}

// ----------------------------------------------------------------------------
// Parse
// ----------------------------------------------------------------------------

/// Parse a HELLO frame. Unknown tags are skipped; any truncated entry or
/// length violation fails the whole parse.
pub fn parse_hello(frame: &[u8]) -> Result<Hello, HelloError> {
    if !is_hello(frame) {
        return Err(HelloError::NotHello);
    }

    let mut h = Hello::default();
    let mut i = 2;
    while i < frame.len() {
        if i + 3 > frame.len() {
            return Err(HelloError::Truncated(i));
        }
        let tag = frame[i];
        let len = u16::from_be_bytes([frame[i + 1], frame[i + 2]]) as usize;
        i += 3;
        if i + len > frame.len() {
            return Err(HelloError::Truncated(i));
        }
        let value = &frame[i..i + len];
        match tag {
            T_USER_ID => {
                if len == 0 || len > MAX_USER_ID {
                    return Err(HelloError::BadLength { tag, len });
                }
                h.user_id = String::from_utf8_lossy(value).into_owned();
            }
            T_CAPS => {
                if len != 4 {
                    return Err(HelloError::BadLength { tag, len });
                }
                h.caps = Some(u32::from_le_bytes([
                    value[0], value[1], value[2], value[3],
                ]));
            }
            T_NA32 => {
                if len != 32 {
                    return Err(HelloError::BadLength { tag, len });
                }
                let mut na = [0u8; 32];
                na.copy_from_slice(value);
                h.na32 = Some(na);
            }
            _ => {} // forward compatibility
        }
        i += len;
    }
    Ok(h)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_wire_layout() {
        let na: [u8; 32] = core::array::from_fn(|i| i as u8);
        let frame = encode_hello("alice", CAP_AEAD_PSK_SUPPORTED, Some(&na));

        let mut expect = vec![
            0x01, 0x01, // type, version
            0x01, 0x00, 0x05, b'a', b'l', b'i', b'c', b'e', // user id
            0x02, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, // caps, little-endian
            0x12, 0x00, 0x20, // nonce tag + length
        ];
        expect.extend_from_slice(&na);
        assert_eq!(frame, expect);
    }

    #[test]
    fn parse_recovers_encoded_fields() {
        let na = [0x5Au8; 32];
        let frame = encode_hello("alice", 0x8000_0001, Some(&na));
        let h = parse_hello(&frame).unwrap();
        assert_eq!(h.user_id, "alice");
        assert_eq!(h.caps, Some(0x8000_0001));
        assert_eq!(h.na32, Some(na));
        assert!(h.supports_psk());
    }

    #[test]
    fn empty_user_and_no_nonce_round_trip() {
        let frame = encode_hello("", 0, None);
        let h = parse_hello(&frame).unwrap();
        assert!(h.user_id.is_empty());
        assert_eq!(h.caps, Some(0));
        assert_eq!(h.na32, None);
        assert!(!h.supports_psk());
    }

    #[test]
    fn long_user_id_is_truncated_on_encode() {
        let long = "x".repeat(80);
        let frame = encode_hello(&long, 0, None);
        let h = parse_hello(&frame).unwrap();
        assert_eq!(h.user_id.len(), MAX_USER_ID);
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let mut frame = vec![0x01, 0x01];
        // Unknown tag 0x7F with 3 bytes of payload, then a known caps TLV.
        frame.extend_from_slice(&[0x7F, 0x00, 0x03, 1, 2, 3]);
        frame.extend_from_slice(&[0x02, 0x00, 0x04, 0x02, 0x00, 0x00, 0x00]);
        let h = parse_hello(&frame).unwrap();
        assert_eq!(h.caps, Some(2));
    }

    #[test]
    fn truncated_tlv_is_rejected() {
        let na = [0u8; 32];
        let frame = encode_hello("bob", 1, Some(&na));
        // Chop the final nonce byte.
        assert!(matches!(
            parse_hello(&frame[..frame.len() - 1]),
            Err(HelloError::Truncated(_))
        ));
        // A dangling partial TLV header is also truncation.
        let mut frame = encode_hello("bob", 1, None);
        frame.push(T_NA32);
        assert!(matches!(
            parse_hello(&frame),
            Err(HelloError::Truncated(_))
        ));
    }

    #[test]
    fn bad_lengths_are_rejected() {
        // caps with 3 bytes
        let frame = [0x01, 0x01, 0x02, 0x00, 0x03, 1, 2, 3];
        assert_eq!(
            parse_hello(&frame),
            Err(HelloError::BadLength { tag: T_CAPS, len: 3 })
        );
        // zero-length user id
        let frame = [0x01, 0x01, 0x01, 0x00, 0x00];
        assert_eq!(
            parse_hello(&frame),
            Err(HelloError::BadLength {
                tag: T_USER_ID,
                len: 0
            })
        );
        // nonce with 31 bytes
        let mut frame = vec![0x01, 0x01, 0x12, 0x00, 0x1F];
        frame.extend_from_slice(&[0u8; 31]);
        assert_eq!(
            parse_hello(&frame),
            Err(HelloError::BadLength { tag: T_NA32, len: 31 })
        );
    }

    #[test]
    fn non_hello_frames_are_not_hello() {
        assert!(!is_hello(&[]));
        assert!(!is_hello(&[0x01]));
        assert!(!is_hello(&[0x02, 0x01]));
        assert!(!is_hello(&[0x01, 0x02]));
        assert_eq!(parse_hello(&[0x01, 0x02]), Err(HelloError::NotHello));
    }
}
