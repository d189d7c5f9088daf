//! Chat service: the glue between AEAD, fragmentation, HELLO, and the
//! transport.
//!
//! Outbound path: plaintext -> seal -> chunk -> one `transport.send` per
//! chunk. Inbound path: frame -> HELLO dispatch or parse -> reassemble ->
//! open -> deliver. A dedicated beacon task watches `link_ready()` at 200 ms and
//! sends one HELLO per link epoch; a rising link edge regenerates the local
//! nonce and drops any installed session, so every new link negotiates fresh
//! keys.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::aead::{PskAead, KEY_SIZE};
use crate::config::{self, Config, Role};
use crate::errors::Result;
use crate::frag::{self, Reassembler, MAX_PAYLOAD};
use crate::hello::{self, Hello, CAP_AEAD_PSK_SUPPORTED};
use crate::kex;
use crate::transport::{OnFrame, Settings, Transport};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Associated data bound into every sealed chat payload.
pub const AAD: &[u8] = b"BC1";

/// Beacon cadence of the HELLO task.
const HELLO_INTERVAL: Duration = Duration::from_millis(200);

/// Callback invoked with each delivered plaintext.
pub type OnPlaintext = Arc<dyn Fn(&[u8]) + Send + Sync>;

// ----------------------------------------------------------------------------
// Chat service
// ----------------------------------------------------------------------------

pub struct ChatService {
    inner: Arc<ChatInner>,
    hello_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct PeerInfo {
    user: String,
    caps: u32,
    has_psk: bool,
    na32: [u8; 32],
    have_na: bool,
}

struct ChatInner {
    transport: Arc<dyn Transport>,
    aead: Mutex<PskAead>,
    reasm: Mutex<Reassembler>,
    settings: Settings,
    role: Role,
    hello_enabled: bool,

    local_user: String,
    local_caps: u32,
    local_has_psk: bool,
    psk: Option<Zeroizing<[u8; KEY_SIZE]>>,

    na_local: Mutex<[u8; 32]>,
    have_na_local: AtomicBool,
    peer: Mutex<PeerInfo>,

    session_on: AtomicBool,
    hello_sent: AtomicBool,
    hello_stop: AtomicBool,

    next_id: AtomicU32,
    tail: AtomicBool,
    on_plaintext: Mutex<Option<OnPlaintext>>,
}

impl ChatService {
    /// Build the service. The PSK is read from the environment here, because
    /// the local capability bit depends on whether it parses.
    pub fn new(transport: Arc<dyn Transport>, aead: PskAead, cfg: &Config) -> Self {
        let psk = config::psk_from_env();
        let local_has_psk = psk.is_some();
        let local_caps = if local_has_psk {
            CAP_AEAD_PSK_SUPPORTED
        } else {
            0
        };
        let hello_enabled = cfg
            .ctrl_hello
            .unwrap_or_else(|| transport.name() == "bluez");

        let settings = Settings {
            role: cfg.role,
            mtu_payload: cfg.mtu_payload,
            ..Settings::default()
        };

        Self {
            inner: Arc::new(ChatInner {
                transport,
                aead: Mutex::new(aead),
                reasm: Mutex::new(Reassembler::new()),
                settings,
                role: cfg.role,
                hello_enabled,
                local_user: cfg.user_id.clone(),
                local_caps,
                local_has_psk,
                psk,
                na_local: Mutex::new([0u8; 32]),
                have_na_local: AtomicBool::new(false),
                peer: Mutex::new(PeerInfo::default()),
                session_on: AtomicBool::new(false),
                hello_sent: AtomicBool::new(false),
                hello_stop: AtomicBool::new(false),
                next_id: AtomicU32::new(1),
                tail: AtomicBool::new(false),
                on_plaintext: Mutex::new(None),
            }),
            hello_task: Mutex::new(None),
        }
    }

    /// Start the transport and, when enabled, the HELLO beacon task.
    pub async fn start(&self) -> Result<()> {
        // A restart must not leave a second beacon running.
        self.stop_hello().await;

        let inner = self.inner.clone();
        let on_frame: OnFrame = Arc::new(move |frame| inner.on_rx(&frame));
        self.inner
            .transport
            .start(self.inner.settings.clone(), on_frame)
            .await?;

        self.inner.new_link_epoch();

        if self.inner.hello_enabled {
            self.inner.hello_stop.store(false, Ordering::SeqCst);
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move { inner.hello_loop().await });
            *self.hello_task.lock().unwrap() = Some(handle);
        }
        Ok(())
    }

    /// Seal, chunk, and transmit one text message. Failures are logged and
    /// reported as `false`; partial sends are not retried.
    pub async fn send_text(&self, text: &str) -> bool {
        let sealed = {
            let aead = self.inner.aead.lock().unwrap();
            match aead.seal(text.as_bytes(), AAD) {
                Ok(s) => s,
                Err(e) => {
                    warn!("send_text: AEAD seal failed: {e}");
                    return false;
                }
            }
        };

        let msg_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let chunks = match frag::make_chunks(msg_id, &sealed, self.inner.payload_mtu()) {
            Ok(c) => c,
            Err(e) => {
                warn!("send_text: make_chunks failed: {e}");
                return false;
            }
        };

        for chunk in &chunks {
            let frame = match frag::serialize(chunk) {
                Ok(f) => f,
                Err(e) => {
                    warn!("send_text: serialize failed: {e}");
                    return false;
                }
            };
            if let Err(e) = self.inner.transport.send(&frame).await {
                warn!("send_text: transport send failed: {e}");
                return false;
            }
        }
        true
    }

    /// Stop the beacon, the transport, and wipe any session material.
    /// Idempotent; the beacon task is joined exactly once.
    pub async fn stop(&self) {
        self.stop_hello().await;
        self.inner.transport.stop().await;
        self.inner.clear_session("stop");
    }

    async fn stop_hello(&self) {
        self.inner.hello_stop.store(true, Ordering::SeqCst);
        let handle = self.hello_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Toggle local echo of delivered plaintext.
    pub fn set_tail(&self, on: bool) {
        self.inner.tail.store(on, Ordering::Relaxed);
    }

    pub fn tail(&self) -> bool {
        self.inner.tail.load(Ordering::Relaxed)
    }

    /// Register a callback for delivered plaintext.
    pub fn set_on_plaintext(&self, cb: OnPlaintext) {
        *self.inner.on_plaintext.lock().unwrap() = Some(cb);
    }

    pub fn link_ready(&self) -> bool {
        self.inner.transport.link_ready()
    }

    pub fn session_established(&self) -> bool {
        self.inner.session_on.load(Ordering::SeqCst)
    }

    pub fn peer_user(&self) -> String {
        self.inner.peer.lock().unwrap().user.clone()
    }
}

// ----------------------------------------------------------------------------
// Inner logic
// ----------------------------------------------------------------------------

impl ChatInner {
    fn payload_mtu(&self) -> usize {
        self.settings
            .mtu_payload
            .saturating_sub(frag::HDR_SIZE)
            .min(MAX_PAYLOAD)
    }

    /// New link epoch: fresh local nonce, forget the peer's, drop the session
    /// so the next HELLO renegotiates.
    fn new_link_epoch(&self) {
        let mut na = self.na_local.lock().unwrap();
        OsRng.fill_bytes(&mut *na);
        drop(na);
        self.have_na_local.store(self.local_has_psk, Ordering::SeqCst);
        self.peer.lock().unwrap().have_na = false;
        self.hello_sent.store(false, Ordering::SeqCst);
        self.clear_session("new link epoch");
    }

    fn clear_session(&self, why: &str) {
        if self.session_on.swap(false, Ordering::SeqCst) {
            debug!("clearing AEAD session ({why})");
        }
        self.aead.lock().unwrap().set_session(None);
    }

    async fn hello_loop(self: Arc<Self>) {
        let mut last_ready = false;
        while !self.hello_stop.load(Ordering::SeqCst) {
            let ready = self.transport.link_ready();

            // Rising edge: this is a new link, renegotiate from scratch.
            if ready && !last_ready {
                self.new_link_epoch();
            }

            if ready && !self.hello_sent.load(Ordering::SeqCst) {
                let na = *self.na_local.lock().unwrap();
                let frame = hello::encode_hello(
                    &self.local_user,
                    self.local_caps,
                    self.local_has_psk.then_some(&na),
                );
                match self.transport.send(&frame).await {
                    Ok(()) => {
                        self.hello_sent.store(true, Ordering::SeqCst);
                        if self.local_has_psk {
                            info!(
                                "[CTRL] HELLO out: user='{}' caps=0x{:08x} na32={:02x}{:02x}..",
                                self.local_user, self.local_caps, na[0], na[1]
                            );
                        } else {
                            info!(
                                "[CTRL] HELLO out: user='{}' caps=0x{:08x} na32=(none)",
                                self.local_user, self.local_caps
                            );
                        }
                    }
                    Err(e) => debug!("HELLO send failed, will retry: {e}"),
                }
            }

            if !ready {
                self.hello_sent.store(false, Ordering::SeqCst);
                if self.session_on.load(Ordering::SeqCst) {
                    self.clear_session("link down");
                }
            }

            last_ready = ready;
            tokio::time::sleep(HELLO_INTERVAL).await;
        }
    }

    /// Inbound frame dispatch: HELLO first, data path otherwise. Runs on the
    /// transport's task; must not block.
    fn on_rx(&self, frame: &[u8]) {
        if self.hello_enabled && hello::is_hello(frame) {
            match hello::parse_hello(frame) {
                Ok(h) => {
                    self.handle_hello(h);
                    return;
                }
                // Not a well-formed HELLO after all; fall through to the
                // data path like any other frame.
                Err(e) => debug!("HELLO parse failed ({e}), trying data path"),
            }
        }

        let chunk = match frag::parse(frame) {
            Ok(c) => c,
            Err(e) => {
                warn!("on_rx: dropping invalid frame: {e}");
                return;
            }
        };

        let Some(full) = self.reasm.lock().unwrap().feed(&chunk) else {
            return;
        };

        let plain = match self.aead.lock().unwrap().open(&full, AAD) {
            Ok(p) => p,
            Err(_) => {
                warn!("[SEC] AEAD decrypt failed (PSK mismatch?), dropping frame");
                return;
            }
        };

        if let Some(cb) = self.on_plaintext.lock().unwrap().clone() {
            cb(&plain);
        }
        if self.tail.load(Ordering::Relaxed) {
            info!("[RECV] {}", String::from_utf8_lossy(&plain));
        }
    }

    fn handle_hello(&self, h: Hello) {
        let has_na = h.na32.is_some();
        {
            let mut peer = self.peer.lock().unwrap();
            if !h.user_id.is_empty() {
                peer.user = h.user_id.clone();
            }
            if let Some(caps) = h.caps {
                peer.caps = caps;
            }
            peer.has_psk = h.supports_psk();
            match h.na32 {
                Some(na) => {
                    peer.na32 = na;
                    peer.have_na = true;
                }
                None => peer.na32 = [0u8; 32],
            }
        }

        self.maybe_kex();

        let peer = self.peer.lock().unwrap();
        let user = if peer.user.is_empty() {
            "<none>"
        } else {
            peer.user.as_str()
        };
        if has_na {
            info!(
                "[CTRL] HELLO in: user='{}' caps=0x{:08x} na32={:02x}{:02x}..",
                user, peer.caps, peer.na32[0], peer.na32[1]
            );
        } else {
            info!("[CTRL] HELLO in: user='{}' caps=0x{:08x} na32=(none)", user, peer.caps);
        }
    }

    /// Run the key exchange exactly when both sides hold a PSK, both nonces
    /// are present, and no session is installed yet.
    fn maybe_kex(&self) {
        if !self.local_has_psk || !self.have_na_local.load(Ordering::SeqCst) {
            return;
        }
        if self.session_on.load(Ordering::SeqCst) {
            return;
        }
        let (peer_ok, peer_na) = {
            let peer = self.peer.lock().unwrap();
            (peer.has_psk && peer.have_na, peer.na32)
        };
        if !peer_ok {
            return;
        }
        let Some(psk) = &self.psk else { return };
        let local_na = *self.na_local.lock().unwrap();

        match kex::derive_session_keys(&psk[..], &local_na, &peer_na, self.role) {
            Ok(keys) => {
                if self.aead.lock().unwrap().set_session(Some(keys)) {
                    self.session_on.store(true, Ordering::SeqCst);
                    info!("[KEX] complete, AEAD session enabled");
                } else {
                    warn!("[KEX] session install failed, staying on PSK");
                }
            }
            Err(e) => warn!("[KEX] derivation failed: {e}"),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
