//! Error types for the bitchat protocol stack.
//!
//! Each protocol concern carries its own error enum; [`BitchatError`] unifies
//! them for callers that cross layer boundaries. Per-frame errors are logged
//! and the frame dropped; they never tear down a link.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Fragmentation
// ----------------------------------------------------------------------------

/// Errors from chunk framing and reassembly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragError {
    /// Requested payload MTU outside `[1, MAX_PAYLOAD]`.
    #[error("payload mtu {0} out of range")]
    MtuOutOfRange(usize),
    /// Payload would need more than 65535 fragments.
    #[error("message needs {0} fragments, limit is 65535")]
    TooManyFragments(usize),
    /// Frame shorter than the fixed header.
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),
    /// Frame length disagrees with the header `len` field.
    #[error("frame length {got} does not match header length {want}")]
    LengthMismatch { want: usize, got: usize },
    /// A header invariant does not hold.
    #[error("bad header: {0}")]
    BadHeader(&'static str),
    /// Chunk payload size disagrees with its header.
    #[error("chunk payload {got} bytes, header says {want}")]
    PayloadMismatch { want: usize, got: usize },
}

// ----------------------------------------------------------------------------
// Crypto
// ----------------------------------------------------------------------------

/// Errors from sealing, opening, and key handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("AEAD seal failed")]
    SealFailed,
    /// Decrypt failed with both the session key and the PSK.
    #[error("AEAD open failed")]
    AeadFailed,
    #[error("sealed frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("invalid key material")]
    InvalidKey,
}

// ----------------------------------------------------------------------------
// HELLO
// ----------------------------------------------------------------------------

/// Errors from the HELLO TLV codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HelloError {
    /// Frame does not start with the HELLO type/version bytes.
    #[error("not a HELLO frame")]
    NotHello,
    /// A TLV entry runs past the end of the frame.
    #[error("truncated TLV at offset {0}")]
    Truncated(usize),
    /// A known tag carries a length outside its allowed range.
    #[error("tag {tag:#04x} has invalid length {len}")]
    BadLength { tag: u8, len: usize },
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// Errors surfaced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link cannot carry frames right now (`link_ready() == false`).
    #[error("transport is not ready")]
    NotReady,
    /// Transient condition; the caller may retry.
    #[error("transport busy: {0}")]
    Busy(String),
    /// Non-retryable failure; link state has been cleared.
    #[error("transport failure: {0}")]
    Fatal(String),
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),
}

// ----------------------------------------------------------------------------
// Unified error
// ----------------------------------------------------------------------------

/// Top-level error type for the bitchat stack.
#[derive(Debug, Error)]
pub enum BitchatError {
    #[error("fragmentation error: {0}")]
    Frag(#[from] FragError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("hello error: {0}")]
    Hello(#[from] HelloError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BitchatError {
    /// Create a configuration error with a reason.
    pub fn config<T: Into<String>>(reason: T) -> Self {
        BitchatError::Configuration(reason.into())
    }
}

pub type Result<T> = core::result::Result<T, BitchatError>;
