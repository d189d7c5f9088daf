//! Session key derivation.
//!
//! Mixes the pre-shared key with both sides' HELLO nonce contributions via
//! HKDF-SHA-256: `prk = Extract(salt = PSK, ikm = central_na ‖ peripheral_na)`
//! followed by four labeled expands for the two encryption keys and the two
//! nonce seeds. The non-central side swaps its directional pairs before
//! installing, so each side locally calls its outbound pair `c2p` and the two
//! installations mirror each other.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::SessionKeys;
use crate::config::Role;
use crate::errors::CryptoError;

// HKDF expand labels, 7 ASCII bytes each.
const CTX_KE_C2P: &[u8] = b"bcKC2P1";
const CTX_KE_P2C: &[u8] = b"bcKP2C1";
const CTX_N_C2P: &[u8] = b"bcNC2P1";
const CTX_N_P2C: &[u8] = b"bcNP2C1";

/// Derive the per-link session keys from the PSK and both nonces.
///
/// `local_na` is this side's contribution, `peer_na` the peer's; `role`
/// fixes the IKM ordering (central first) and selects the directional swap.
/// All intermediates are wiped before returning.
pub fn derive_session_keys(
    psk: &[u8],
    local_na: &[u8; 32],
    peer_na: &[u8; 32],
    role: Role,
) -> Result<SessionKeys, CryptoError> {
    if psk.is_empty() {
        return Err(CryptoError::InvalidKey);
    }

    let mut ikm = Zeroizing::new([0u8; 64]);
    match role {
        Role::Central => {
            ikm[..32].copy_from_slice(local_na);
            ikm[32..].copy_from_slice(peer_na);
        }
        Role::Peripheral => {
            ikm[..32].copy_from_slice(peer_na);
            ikm[32..].copy_from_slice(local_na);
        }
    }

    let hk = Hkdf::<Sha256>::new(Some(psk), ikm.as_ref());

    let mut keys = SessionKeys::default();
    hk.expand(CTX_KE_C2P, &mut keys.ke_c2p)
        .map_err(|_| CryptoError::InvalidKey)?;
    hk.expand(CTX_KE_P2C, &mut keys.ke_p2c)
        .map_err(|_| CryptoError::InvalidKey)?;
    hk.expand(CTX_N_C2P, &mut keys.n24_c2p)
        .map_err(|_| CryptoError::InvalidKey)?;
    hk.expand(CTX_N_P2C, &mut keys.n24_p2c)
        .map_err(|_| CryptoError::InvalidKey)?;

    // Each side names its outbound pair c2p locally.
    if role == Role::Peripheral {
        std::mem::swap(&mut keys.ke_c2p, &mut keys.ke_p2c);
        std::mem::swap(&mut keys.n24_c2p, &mut keys.n24_p2c);
    }

    Ok(keys)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
