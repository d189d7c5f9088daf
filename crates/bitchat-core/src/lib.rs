//! Protocol core for the bitchat BLE chat daemon.
//!
//! This crate is the transport-agnostic part of the stack:
//!
//! - [`frag`]: splitting variable-size payloads into MTU-sized chunks and
//!   reassembling them with duplicate and out-of-order tolerance.
//! - [`aead`]: XChaCha20-Poly1305 sealing/opening with a pre-shared key and an
//!   optional HKDF-derived per-link session.
//! - [`hello`]: the one-shot HELLO capability/nonce record exchanged per link
//!   epoch.
//! - [`kex`]: the session key derivation that mixes the PSK with both sides'
//!   nonces.
//! - [`transport`]: the uniform transport interface plus the in-process
//!   loopback used by tests.
//! - [`chat`]: the service that wires all of the above together and owns the
//!   HELLO beacon loop.
//!
//! BLE itself lives in the `bitchat-ble` crate; the daemon and control client
//! live in `bitchat-cli`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod aead;
pub mod chat;
pub mod config;
pub mod errors;
pub mod frag;
pub mod hello;
pub mod kex;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use aead::{PskAead, SessionKeys, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use chat::ChatService;
pub use config::{Config, Role, TransportKind};
pub use errors::{BitchatError, Result};
pub use transport::{Frame, LoopbackTransport, OnFrame, Settings, Transport};
pub use transport::{RX_UUID, SVC_UUID, TX_UUID};
