//! Environment-driven configuration.
//!
//! The daemon is configured entirely through `BITCHAT_*` environment
//! variables. Rejected values never abort startup: they log a warning and
//! fall back to the documented default, so a typo degrades the daemon instead
//! of killing it.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::warn;
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;
use crate::frag::MAX_PAYLOAD;
use crate::hello::MAX_USER_ID;

// ----------------------------------------------------------------------------
// Environment keys
// ----------------------------------------------------------------------------

pub const ENV_TRANSPORT: &str = "BITCHAT_TRANSPORT";
pub const ENV_ROLE: &str = "BITCHAT_ROLE";
pub const ENV_ADAPTER: &str = "BITCHAT_ADAPTER";
pub const ENV_PEER: &str = "BITCHAT_PEER";
pub const ENV_PSK: &str = "BITCHAT_PSK";
pub const ENV_USER_ID: &str = "BITCHAT_USER_ID";
pub const ENV_CTRL_HELLO: &str = "BITCHAT_CTRL_HELLO";
pub const ENV_MTU_PAYLOAD: &str = "BITCHAT_MTU_PAYLOAD";
pub const ENV_LOG_LEVEL: &str = "BITCHAT_LOG_LEVEL";
pub const ENV_CTL_SOCK: &str = "BITCHAT_CTL_SOCK";
pub const ENV_TX_PAUSE_MS: &str = "BITCHAT_TX_PAUSE_MS";

/// Default frame MTU (header + payload bytes per BLE operation).
pub const DEFAULT_MTU: usize = 100;

/// Allowed range for the `BITCHAT_MTU_PAYLOAD` override.
pub const MTU_RANGE: (usize, usize) = (20, 244);

// ----------------------------------------------------------------------------
// Types
// ----------------------------------------------------------------------------

/// Which transport backs the chat service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Loopback,
    Bluez,
}

/// BLE role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Peripheral,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Central => f.write_str("central"),
            Role::Peripheral => f.write_str("peripheral"),
        }
    }
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportKind,
    pub role: Role,
    pub adapter: String,
    /// Normalized peer MAC, enforced strictly by the central when set.
    pub peer: Option<String>,
    pub user_id: String,
    /// `Some(false)` disables the HELLO beacon, `Some(true)` forces it on,
    /// `None` leaves the transport-dependent default (on for BLE).
    pub ctrl_hello: Option<bool>,
    /// Frame MTU: one chunk header plus payload must fit in this many bytes.
    pub mtu_payload: usize,
    /// Optional pause after each central write, in milliseconds.
    pub tx_pause_ms: u64,
    pub log_level: String,
    pub ctl_sock: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::Loopback,
            role: Role::Peripheral,
            adapter: "hci0".into(),
            peer: None,
            user_id: String::new(),
            ctrl_hello: None,
            mtu_payload: DEFAULT_MTU,
            tx_pause_ms: 0,
            log_level: "info".into(),
            ctl_sock: default_ctl_sock(),
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        match env_nonempty(ENV_TRANSPORT).as_deref() {
            None | Some("loopback") => {}
            Some("bluez") => cfg.transport = TransportKind::Bluez,
            Some(other) => warn!("{ENV_TRANSPORT}={other} not recognized, using loopback"),
        }

        match env_nonempty(ENV_ROLE).as_deref() {
            None | Some("peripheral") => {}
            Some("central") => cfg.role = Role::Central,
            Some(other) => warn!("{ENV_ROLE}={other} not recognized, using peripheral"),
        }

        if let Some(adapter) = env_nonempty(ENV_ADAPTER) {
            cfg.adapter = adapter;
        }

        if let Some(raw) = env_nonempty(ENV_PEER) {
            match parse_peer_addr(&raw) {
                Some(mac) => cfg.peer = Some(mac),
                None => warn!("{ENV_PEER}={raw} is not a MAC address, ignoring"),
            }
        }

        if let Some(mut user) = env_nonempty(ENV_USER_ID) {
            if user.len() > MAX_USER_ID {
                let mut end = MAX_USER_ID;
                while !user.is_char_boundary(end) {
                    end -= 1;
                }
                user.truncate(end);
            }
            cfg.user_id = user;
        }

        if let Some(raw) = env_nonempty(ENV_CTRL_HELLO) {
            cfg.ctrl_hello = Some(raw != "0");
        }

        if let Some(raw) = env_nonempty(ENV_MTU_PAYLOAD) {
            match raw.parse::<usize>() {
                Ok(mtu) if (MTU_RANGE.0..=MTU_RANGE.1).contains(&mtu) => cfg.mtu_payload = mtu,
                _ => warn!(
                    "{ENV_MTU_PAYLOAD}={raw} outside [{}, {}], using {DEFAULT_MTU}",
                    MTU_RANGE.0, MTU_RANGE.1
                ),
            }
        }

        if let Some(raw) = env_nonempty(ENV_TX_PAUSE_MS) {
            match raw.parse::<u64>() {
                Ok(ms) => cfg.tx_pause_ms = ms,
                Err(_) => warn!("{ENV_TX_PAUSE_MS}={raw} is not a number, ignoring"),
            }
        }

        if let Some(level) = env_nonempty(ENV_LOG_LEVEL) {
            cfg.log_level = level;
        }

        if let Some(path) = env_nonempty(ENV_CTL_SOCK) {
            cfg.ctl_sock = PathBuf::from(path);
        }

        cfg
    }

    /// Effective per-chunk payload MTU: the frame MTU minus the chunk header,
    /// capped at the protocol's per-chunk maximum.
    pub fn payload_mtu(&self) -> usize {
        self.mtu_payload
            .saturating_sub(crate::frag::HDR_SIZE)
            .min(MAX_PAYLOAD)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// PSK parsing
// ----------------------------------------------------------------------------

/// Decode a PSK given as 64-char hex or base64. Returns `None` unless the
/// input decodes to exactly 32 bytes.
pub fn parse_psk(raw: &str) -> Option<Zeroizing<[u8; KEY_SIZE]>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let bytes = if s.len() % 2 == 0 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        Zeroizing::new(hex::decode(s).ok()?)
    } else {
        Zeroizing::new(BASE64.decode(s).ok()?)
    };

    if bytes.len() != KEY_SIZE {
        return None;
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&bytes);
    Some(key)
}

/// Read and decode `BITCHAT_PSK` from the environment.
pub fn psk_from_env() -> Option<Zeroizing<[u8; KEY_SIZE]>> {
    parse_psk(&std::env::var(ENV_PSK).ok()?)
}

// ----------------------------------------------------------------------------
// Peer address parsing
// ----------------------------------------------------------------------------

/// Validate and normalize a `AA:BB:CC:DD:EE:FF` MAC address to uppercase.
pub fn parse_peer_addr(raw: &str) -> Option<String> {
    let s = raw.trim();
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for p in &parts {
        if p.len() != 2 || !p.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
    }
    Some(s.to_ascii_uppercase())
}

// ----------------------------------------------------------------------------
// Control socket path
// ----------------------------------------------------------------------------

/// Default control socket path under the user's cache directory.
pub fn default_ctl_sock() -> PathBuf {
    let base = std::env::var("HOME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "/tmp".into());
    PathBuf::from(base).join(".cache/bitchatd/ctl.sock")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psk_accepts_hex() {
        let hexkey = "aa".repeat(32);
        let key = parse_psk(&hexkey).unwrap();
        assert_eq!(*key, [0xAAu8; 32]);
        // Surrounding whitespace is tolerated.
        assert!(parse_psk(&format!("  {hexkey}\t")).is_some());
    }

    #[test]
    fn psk_accepts_base64() {
        let key_bytes = [0x5Au8; 32];
        let b64 = BASE64.encode(key_bytes);
        let key = parse_psk(&b64).unwrap();
        assert_eq!(*key, key_bytes);
    }

    #[test]
    fn psk_rejects_wrong_sizes_and_garbage() {
        assert!(parse_psk("").is_none());
        assert!(parse_psk("aabb").is_none()); // 2 bytes
        assert!(parse_psk(&"aa".repeat(33)).is_none()); // 33 bytes
        assert!(parse_psk("not hex, not base64 !!!").is_none());
        assert!(parse_psk(&BASE64.encode([0u8; 16])).is_none());
    }

    #[test]
    fn peer_addr_is_validated_and_normalized() {
        assert_eq!(
            parse_peer_addr("aa:bb:cc:dd:ee:ff").as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert!(parse_peer_addr("AA:BB:CC:DD:EE").is_none());
        assert!(parse_peer_addr("AA:BB:CC:DD:EE:GG").is_none());
        assert!(parse_peer_addr("AABBCCDDEEFF").is_none());
        assert!(parse_peer_addr("AA:BB:CC:DD:EE:F").is_none());
    }

    #[test]
    fn payload_mtu_subtracts_header_and_caps() {
        let mut cfg = Config::default();
        assert_eq!(cfg.payload_mtu(), 88);
        cfg.mtu_payload = 32;
        assert_eq!(cfg.payload_mtu(), 20);
        cfg.mtu_payload = 244;
        // Never exceeds the protocol's per-chunk maximum.
        assert_eq!(cfg.payload_mtu(), MAX_PAYLOAD);
    }
}
