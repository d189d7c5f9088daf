//! Transport abstraction.
//!
//! Every transport carries opaque link frames of at most the negotiated MTU
//! and hands received frames to a single `on_frame` callback, in arrival
//! order, from transport-owned tasks. The three implementations (loopback
//! here, central and peripheral in `bitchat-ble`) share this interface so the
//! chat service stays transport-agnostic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Role;
use crate::errors::TransportError;

// ----------------------------------------------------------------------------
// GATT identifiers
// ----------------------------------------------------------------------------

/// Primary chat service UUID.
pub const SVC_UUID: Uuid = Uuid::from_u128(0x7e0f8f20_cc0b_4c6e_8a3e_5d21b2f8a9c4);

/// TX characteristic (peripheral notifies, central subscribes).
pub const TX_UUID: Uuid = Uuid::from_u128(0x7e0f8f21_cc0b_4c6e_8a3e_5d21b2f8a9c4);

/// RX characteristic (central writes, peripheral receives).
pub const RX_UUID: Uuid = Uuid::from_u128(0x7e0f8f22_cc0b_4c6e_8a3e_5d21b2f8a9c4);

// ----------------------------------------------------------------------------
// Types
// ----------------------------------------------------------------------------

/// One link frame: chunk header plus payload.
pub type Frame = Vec<u8>;

/// Receive callback. Invoked once per frame; implementations must not block
/// for long since transports call it from their event loops.
pub type OnFrame = Arc<dyn Fn(Frame) + Send + Sync>;

/// Settings handed to a transport at start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub role: Role,
    pub svc_uuid: Uuid,
    pub tx_uuid: Uuid,
    pub rx_uuid: Uuid,
    /// Frame MTU; `send` is given frames no larger than this.
    pub mtu_payload: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: Role::Peripheral,
            svc_uuid: SVC_UUID,
            tx_uuid: TX_UUID,
            rx_uuid: RX_UUID,
            mtu_payload: crate::config::DEFAULT_MTU,
        }
    }
}

// ----------------------------------------------------------------------------
// Transport trait
// ----------------------------------------------------------------------------

/// Uniform interface over the loopback and BLE transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the transport up. Idempotent: a second `start` on a running
    /// transport is a no-op.
    async fn start(&self, settings: Settings, on_frame: OnFrame) -> Result<(), TransportError>;

    /// Transmit exactly one link frame.
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Tear everything down, including transport-owned tasks. Idempotent.
    async fn stop(&self);

    /// Whether the link can currently both send and receive. Role-specific:
    /// the peripheral is ready while the peer is subscribed, the central once
    /// it is connected and subscribed.
    fn link_ready(&self) -> bool;

    fn name(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// Loopback transport
// ----------------------------------------------------------------------------

/// In-process echo transport: `send` delivers the frame straight back through
/// `on_frame` on the caller's task. Test-only by design.
#[derive(Default)]
pub struct LoopbackTransport {
    running: AtomicBool,
    on_frame: Mutex<Option<OnFrame>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn start(&self, _settings: Settings, on_frame: OnFrame) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.on_frame.lock().unwrap() = Some(on_frame);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady);
        }
        let cb = self.on_frame.lock().unwrap().clone();
        match cb {
            Some(cb) => {
                cb(frame.to_vec());
                Ok(())
            }
            None => Err(TransportError::NotReady),
        }
    }

    async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.on_frame.lock().unwrap().take();
        }
    }

    fn link_ready(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn loopback_echoes_synchronously() {
        let t = LoopbackTransport::new();
        let seen: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        t.start(
            Settings::default(),
            Arc::new(move |f| sink.lock().unwrap().push(f)),
        )
        .await
        .unwrap();

        assert!(t.link_ready());
        t.send(b"one").await.unwrap();
        t.send(b"two").await.unwrap();
        // The callback ran before send returned.
        assert_eq!(*seen.lock().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let t = LoopbackTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        t.start(Settings::default(), Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        // Second start must not replace the callback.
        t.start(Settings::default(), Arc::new(|_| panic!("replaced callback")))
            .await
            .unwrap();

        t.send(b"frame").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_send_fails_after() {
        let t = LoopbackTransport::new();
        t.start(Settings::default(), Arc::new(|_| {})).await.unwrap();
        t.stop().await;
        t.stop().await;
        assert!(matches!(t.send(b"x").await, Err(TransportError::NotReady)));
    }
}
