//! PSK-based authenticated encryption.
//!
//! Sealed frames are `nonce(24) ‖ ciphertext ‖ tag(16)` under
//! XChaCha20-Poly1305. Nonces are drawn fresh from the CSPRNG for every frame:
//! the PSK path has no sequence counter, and random 192-bit nonces keep the
//! protocol stateless across restarts with the same key.
//!
//! Once a per-link session is installed (see [`crate::kex`]), sealing uses the
//! outbound session key; opening tries the inbound session key first and falls
//! back to the raw PSK, which covers the window where only one side has
//! completed the key exchange.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};


use crate::config;
use crate::errors::CryptoError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// XChaCha20-Poly1305 key size.
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

// ----------------------------------------------------------------------------
// Session keys
// ----------------------------------------------------------------------------

/// Directional per-link key material derived by the key exchange.
///
/// After the role swap performed at derivation time, each side calls its
/// outbound pair `c2p` locally. All bytes are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub ke_c2p: [u8; KEY_SIZE],
    pub ke_p2c: [u8; KEY_SIZE],
    pub n24_c2p: [u8; NONCE_SIZE],
    pub n24_p2c: [u8; NONCE_SIZE],
}

impl Default for SessionKeys {
    fn default() -> Self {
        Self {
            ke_c2p: [0u8; KEY_SIZE],
            ke_p2c: [0u8; KEY_SIZE],
            n24_c2p: [0u8; NONCE_SIZE],
            n24_p2c: [0u8; NONCE_SIZE],
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.write_str("SessionKeys{..}")
    }
}

// ----------------------------------------------------------------------------
// PskAead
// ----------------------------------------------------------------------------

enum Mode {
    /// Test variant: keeps the wire framing with an all-zero nonce and tag.
    Noop,
    /// XChaCha20-Poly1305 under the given pre-shared key.
    Psk(Zeroizing<[u8; KEY_SIZE]>),
}

/// Seals and opens chat payloads, with an optional installed session.
pub struct PskAead {
    mode: Mode,
    session: Option<SessionKeys>,
}

impl PskAead {
    /// AEAD that only frames; used by tests and as the fallback when no PSK
    /// is configured.
    pub fn noop() -> Self {
        Self {
            mode: Mode::Noop,
            session: None,
        }
    }

    /// Real AEAD under a 32-byte pre-shared key.
    pub fn with_psk(key: [u8; KEY_SIZE]) -> Self {
        Self {
            mode: Mode::Psk(Zeroizing::new(key)),
            session: None,
        }
    }

    /// Build from an environment variable holding the PSK as 64-char hex or
    /// base64. Returns `None` when the variable is unset or does not decode
    /// to exactly 32 bytes.
    pub fn init_from_env(var: &str) -> Option<Self> {
        let raw = std::env::var(var).ok()?;
        let key = config::parse_psk(&raw)?;
        Some(Self::with_psk(*key))
    }

    /// Whether this instance performs real encryption.
    pub fn is_encrypting(&self) -> bool {
        matches!(self.mode, Mode::Psk(_))
    }

    /// Install (`Some`) or clear (`None`) the per-link session. Clearing
    /// wipes the previous key material.
    pub fn set_session(&mut self, keys: Option<SessionKeys>) -> bool {
        self.session = keys;
        true
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Seal `plaintext`, producing `nonce ‖ ciphertext ‖ tag`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.mode {
            Mode::Noop => {
                let mut out = vec![0u8; NONCE_SIZE + plaintext.len() + TAG_SIZE];
                out[NONCE_SIZE..NONCE_SIZE + plaintext.len()].copy_from_slice(plaintext);
                Ok(out)
            }
            Mode::Psk(psk) => {
                let key: &[u8; KEY_SIZE] = match &self.session {
                    Some(s) => &s.ke_c2p,
                    None => &**psk,
                };
                let mut nonce = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce);
                let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
                let ct = cipher
                    .encrypt(
                        XNonce::from_slice(&nonce),
                        Payload {
                            msg: plaintext,
                            aad,
                        },
                    )
                    .map_err(|_| CryptoError::SealFailed)?;
                let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    /// Open a sealed frame. With a session installed, the inbound session key
    /// is tried first and the PSK second; only when both fail does this
    /// return [`CryptoError::AeadFailed`].
    pub fn open(&self, frame: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::FrameTooShort(frame.len()));
        }
        match &self.mode {
            Mode::Noop => Ok(frame[NONCE_SIZE..frame.len() - TAG_SIZE].to_vec()),
            Mode::Psk(psk) => {
                let (nonce, ct) = frame.split_at(NONCE_SIZE);
                if let Some(s) = &self.session {
                    if let Ok(pt) = Self::open_with(&s.ke_p2c, nonce, ct, aad) {
                        return Ok(pt);
                    }
                }
                Self::open_with(psk, nonce, ct, aad)
            }
        }
    }

    fn open_with(
        key: &[u8; KEY_SIZE],
        nonce: &[u8],
        ct: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ct, aad })
            .map_err(|_| CryptoError::AeadFailed)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const AAD: &[u8] = b"BC1";

    fn psk_aead(byte: u8) -> PskAead {
        PskAead::with_psk([byte; KEY_SIZE])
    }

    #[test]
    fn seal_open_round_trip() {
        let aead = psk_aead(0x42);
        let sealed = aead.seal(b"hello, aead", AAD).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 11 + TAG_SIZE);
        assert_eq!(aead.open(&sealed, AAD).unwrap(), b"hello, aead");
    }

    #[test]
    fn empty_plaintext_round_trip() {
        let aead = psk_aead(0x42);
        let sealed = aead.seal(b"", AAD).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + TAG_SIZE);
        assert_eq!(aead.open(&sealed, AAD).unwrap(), b"");
    }

    #[test]
    fn wrong_aad_fails() {
        let aead = psk_aead(0x42);
        let sealed = aead.seal(b"bound to BC1", AAD).unwrap();
        assert_eq!(aead.open(&sealed, b"BC2"), Err(CryptoError::AeadFailed));
    }

    #[test]
    fn any_bit_flip_fails() {
        let aead = psk_aead(0x42);
        let sealed = aead.seal(b"tamper me", AAD).unwrap();
        for i in 0..sealed.len() {
            let mut bad = sealed.clone();
            bad[i] ^= 0x01;
            assert!(aead.open(&bad, AAD).is_err(), "flip at byte {i} opened");
        }
    }

    #[test]
    fn psk_mismatch_fails_but_holder_opens() {
        let sender = psk_aead(0x42);
        let receiver = psk_aead(0x43);
        let sealed = sender.seal(b"mismatch should fail", AAD).unwrap();
        assert_eq!(receiver.open(&sealed, AAD), Err(CryptoError::AeadFailed));
        assert_eq!(
            sender.open(&sealed, AAD).unwrap(),
            b"mismatch should fail"
        );
    }

    #[test]
    fn short_frame_is_rejected() {
        let aead = psk_aead(0x42);
        assert_eq!(
            aead.open(&[0u8; NONCE_SIZE + TAG_SIZE - 1], AAD),
            Err(CryptoError::FrameTooShort(NONCE_SIZE + TAG_SIZE - 1))
        );
    }

    #[test]
    fn receiver_session_still_opens_psk_traffic() {
        // Sender has no session yet; receiver already installed one. The
        // receiver's PSK fallback must still open the frame.
        let sender = psk_aead(0x42);
        let mut receiver = psk_aead(0x42);
        receiver.set_session(Some(SessionKeys {
            ke_c2p: [1u8; KEY_SIZE],
            ke_p2c: [2u8; KEY_SIZE],
            ..SessionKeys::default()
        }));
        let sealed = sender.seal(b"early frame", AAD).unwrap();
        assert_eq!(receiver.open(&sealed, AAD).unwrap(), b"early frame");
    }

    #[test]
    fn session_directions_pair_up() {
        // Mirrored sessions: sender's outbound key is receiver's inbound key.
        let mut sender = psk_aead(0x42);
        let mut receiver = psk_aead(0x42);
        sender.set_session(Some(SessionKeys {
            ke_c2p: [9u8; KEY_SIZE],
            ke_p2c: [7u8; KEY_SIZE],
            ..SessionKeys::default()
        }));
        receiver.set_session(Some(SessionKeys {
            ke_c2p: [7u8; KEY_SIZE],
            ke_p2c: [9u8; KEY_SIZE],
            ..SessionKeys::default()
        }));
        let sealed = sender.seal(b"session frame", AAD).unwrap();
        assert_eq!(receiver.open(&sealed, AAD).unwrap(), b"session frame");
    }

    #[test]
    fn clearing_session_reverts_to_psk() {
        let mut aead = psk_aead(0x42);
        aead.set_session(Some(SessionKeys {
            ke_c2p: [9u8; KEY_SIZE],
            ..SessionKeys::default()
        }));
        assert!(aead.has_session());
        assert!(aead.set_session(None));
        assert!(!aead.has_session());
        let sealed = aead.seal(b"psk again", AAD).unwrap();
        assert_eq!(aead.open(&sealed, AAD).unwrap(), b"psk again");
    }

    #[test]
    fn noop_keeps_wire_framing() {
        let aead = PskAead::noop();
        let sealed = aead.seal(b"clear text", AAD).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 10 + TAG_SIZE);
        assert!(sealed[..NONCE_SIZE].iter().all(|&b| b == 0));
        assert!(sealed[sealed.len() - TAG_SIZE..].iter().all(|&b| b == 0));
        assert_eq!(aead.open(&sealed, AAD).unwrap(), b"clear text");
    }
}
