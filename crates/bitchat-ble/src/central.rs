//! BLE central role: scan, connect, subscribe, write.
//!
//! A single event-loop task owns the BlueZ session and every stream. It
//! receives adapter and device events plus operator commands over one
//! channel, and between event batches runs the pump: cold scan when no
//! device is known, gated connect attempts with classified backoff, GATT
//! discovery and TX subscription once services resolve, discovery on/off
//! policy around inflight connects, and the periodic candidate refresh.
//!
//! The link is ready when connected and subscribed. `send` performs a GATT
//! Write Request on the remote RX characteristic and honors the optional
//! inter-fragment pause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, ErrorKind, Uuid};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bitchat_core::errors::TransportError;
use bitchat_core::transport::{OnFrame, Settings, Transport};

use crate::candidates::CandidateCache;
use crate::{BleConfig, Candidate};

// ----------------------------------------------------------------------------
// Tunables
// ----------------------------------------------------------------------------

/// Pump cadence between event batches.
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum spacing of cold scans.
const COLD_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Spacing of automatic candidate refreshes.
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Spacing of GATT discovery attempts while waiting to subscribe.
const DISCOVER_INTERVAL: Duration = Duration::from_secs(1);

/// Client-side ceiling on a Connect call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before connecting to a handover target.
const HANDOVER_CONNECT_DELAY: Duration = Duration::from_millis(300);

/// Backoff after a timeout or in-progress connect failure.
const BACKOFF_BUSY: Duration = Duration::from_secs(5);

/// Backoff after any other connect failure.
const BACKOFF_OTHER: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Connect failure classification
// ----------------------------------------------------------------------------

/// Outcome of a failed connect attempt.
#[derive(Debug)]
pub(crate) enum ConnectFailure {
    /// No reply within [`CONNECT_TIMEOUT`].
    Timeout,
    Bluez { kind: ErrorKind, message: String },
}

impl From<bluer::Error> for ConnectFailure {
    fn from(e: bluer::Error) -> Self {
        ConnectFailure::Bluez {
            kind: e.kind,
            message: e.message,
        }
    }
}

/// Map a connect failure to its backoff and whether the adopted device must
/// be forgotten (object gone, the pump has to re-discover).
pub(crate) fn classify_connect_failure(failure: &ConnectFailure) -> (Duration, bool) {
    match failure {
        ConnectFailure::Timeout => (BACKOFF_BUSY, false),
        ConnectFailure::Bluez { kind, message } => match kind {
            ErrorKind::InProgress => (BACKOFF_BUSY, false),
            ErrorKind::Failed if message.contains("in progress") => (BACKOFF_BUSY, false),
            ErrorKind::DoesNotExist | ErrorKind::NotFound => (BACKOFF_OTHER, true),
            _ => (BACKOFF_OTHER, false),
        },
    }
}

/// Some stacks surface EBADMSG on WriteValue even though the ATT write went
/// through; treat it as a soft error.
pub(crate) fn is_soft_write_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("ebadmsg") || msg.contains("bad message")
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

#[derive(Default)]
struct LinkState {
    /// Adopted device address; cleared on removal or fatal connect errors.
    dev: Option<Address>,
    /// Handover target overriding the configured peer.
    desired: Option<Address>,
    /// Empty handover received: stop adopting and connecting.
    halted: bool,
    /// Monotonic epoch; bumped whenever the device is dropped so stale
    /// connect completions are ignored.
    generation: u64,
    next_connect_at: Option<Instant>,
    last_cold_scan: Option<Instant>,
    last_refresh: Option<Instant>,
    last_discover: Option<Instant>,
}

struct Shared {
    running: AtomicBool,
    connected: AtomicBool,
    subscribed: AtomicBool,
    services_resolved: AtomicBool,
    connect_inflight: AtomicBool,
    discovery_on: AtomicBool,
    refresh_req: AtomicBool,
    link: Mutex<LinkState>,
    candidates: Mutex<CandidateCache>,
    on_frame: Mutex<Option<OnFrame>>,
    rx_char: tokio::sync::Mutex<Option<Characteristic>>,
}

impl Shared {
    fn effective_peer(&self, cfg: &BleConfig) -> Option<Address> {
        let link = self.link.lock().unwrap();
        link.desired.or(cfg.peer)
    }

    fn deliver(&self, frame: Vec<u8>) {
        let cb = self.on_frame.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(frame);
        }
    }

    /// Forget the adopted device and all link progress.
    fn clear_device(&self, why: &str) {
        let mut link = self.link.lock().unwrap();
        if link.dev.take().is_some() {
            info!("cleared device ({why})");
        }
        link.generation += 1;
        link.next_connect_at = None;
        drop(link);
        self.connected.store(false, Ordering::SeqCst);
        self.subscribed.store(false, Ordering::SeqCst);
        self.services_resolved.store(false, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Commands into the event loop
// ----------------------------------------------------------------------------

enum Cmd {
    Adapter(AdapterEvent),
    Device {
        addr: Address,
        event: DeviceEvent,
    },
    ConnectDone {
        addr: Address,
        generation: u64,
        result: Result<(), ConnectFailure>,
    },
    NotifyEnded {
        addr: Address,
    },
    Handover(Option<Address>),
    Refresh,
    Stop,
}

// ----------------------------------------------------------------------------
// Central transport
// ----------------------------------------------------------------------------

pub struct CentralTransport {
    cfg: BleConfig,
    shared: Arc<Shared>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Cmd>>>,
    loop_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    tx_pause: Duration,
}

impl CentralTransport {
    pub fn new(cfg: BleConfig) -> Self {
        let tx_pause = cfg.tx_pause;
        Self {
            cfg,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                services_resolved: AtomicBool::new(false),
                connect_inflight: AtomicBool::new(false),
                discovery_on: AtomicBool::new(false),
                refresh_req: AtomicBool::new(false),
                link: Mutex::new(LinkState::default()),
                candidates: Mutex::new(CandidateCache::new()),
                on_frame: Mutex::new(None),
                rx_char: tokio::sync::Mutex::new(None),
            }),
            cmd_tx: Mutex::new(None),
            loop_task: tokio::sync::Mutex::new(None),
            tx_pause,
        }
    }

    /// Current candidate list, strongest RSSI first.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.shared.candidates.lock().unwrap().sorted()
    }

    /// Ask the event loop for an immediate candidate refresh.
    pub fn request_refresh(&self) {
        self.shared.refresh_req.store(true, Ordering::SeqCst);
        self.send_cmd(Cmd::Refresh);
    }

    /// Tear down the current link and retarget to `addr`. `None` means
    /// disconnect and stop trying until the next handover.
    pub fn handover_to(&self, addr: Option<Address>) -> bool {
        self.send_cmd(Cmd::Handover(addr))
    }

    fn send_cmd(&self, cmd: Cmd) -> bool {
        let guard = self.cmd_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for CentralTransport {
    async fn start(&self, settings: Settings, on_frame: OnFrame) -> Result<(), TransportError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.shared.on_frame.lock().unwrap() = Some(on_frame);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx.clone());

        let cfg = self.cfg.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            event_loop(cfg, settings, shared, cmd_tx, cmd_rx).await;
        });
        *self.loop_task.lock().await = Some(handle);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.link_ready() {
            return Err(TransportError::NotReady);
        }
        {
            let guard = self.shared.rx_char.lock().await;
            let Some(rx) = guard.as_ref() else {
                return Err(TransportError::NotReady);
            };
            let req = CharacteristicWriteRequest {
                op_type: WriteOp::Request,
                ..Default::default()
            };
            match rx.write_ext(frame, &req).await {
                Ok(()) => {}
                Err(e) if is_soft_write_error(&e.message) => {
                    warn!("WriteValue returned a soft error, assuming delivered: {e}");
                }
                Err(e) => {
                    debug!("write failed: {e}");
                    return Err(TransportError::Busy(format!("WriteValue: {e}")));
                }
            }
        }
        if !self.tx_pause.is_zero() {
            tokio::time::sleep(self.tx_pause).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.send_cmd(Cmd::Stop);
        self.cmd_tx.lock().unwrap().take();
        // Join the loop outside every lock.
        let handle = self.loop_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.rx_char.lock().await.take();
        self.shared.on_frame.lock().unwrap().take();
        self.shared.clear_device("stop");
        info!("central stopped");
    }

    fn link_ready(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
            && self.shared.subscribed.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "bluez"
    }
}

// ----------------------------------------------------------------------------
// Event loop
// ----------------------------------------------------------------------------

async fn event_loop(
    cfg: BleConfig,
    settings: Settings,
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
) {
    let session = match bluer::Session::new().await {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot open bus session: {e}");
            shared.running.store(false, Ordering::SeqCst);
            return;
        }
    };
    let adapter = match session.adapter(&cfg.adapter) {
        Ok(a) => a,
        Err(e) => {
            warn!("adapter {} unavailable: {e}", cfg.adapter);
            shared.running.store(false, Ordering::SeqCst);
            return;
        }
    };
    if let Err(e) = adapter.set_powered(true).await {
        warn!("cannot power adapter {}: {e}", cfg.adapter);
    }

    let mut discovery = start_discovery(&adapter, settings.svc_uuid, &cmd_tx).await;
    shared.discovery_on.store(discovery.is_some(), Ordering::SeqCst);

    let mut device_watch: Option<JoinHandle<()>> = None;
    let mut ticker = tokio::time::interval(PUMP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        "central up on {}: svc={} peer={}",
        cfg.adapter,
        settings.svc_uuid,
        cfg.peer.map(|a| a.to_string()).unwrap_or_else(|| "(any)".into()),
    );

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Cmd::Stop => break,
                    cmd => {
                        handle_cmd(
                            cmd,
                            &cfg,
                            &settings,
                            &adapter,
                            &shared,
                            &cmd_tx,
                            &mut discovery,
                            &mut device_watch,
                        )
                        .await;
                    }
                }
            }
            _ = ticker.tick() => {
                pump(&cfg, &settings, &adapter, &shared, &cmd_tx, &mut discovery, &mut device_watch).await;
            }
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
    }

    // Teardown: best-effort disconnect, then drop every stream and handle.
    let dev = shared.link.lock().unwrap().dev;
    if let Some(addr) = dev {
        if let Ok(device) = adapter.device(addr) {
            let _ = device.disconnect().await;
        }
    }
    if let Some(task) = device_watch.take() {
        task.abort();
    }
    if let Some(task) = discovery.take() {
        task.abort();
    }
    shared.discovery_on.store(false, Ordering::SeqCst);
    debug!("central event loop exited");
}

/// Apply the discovery filter and spawn the task that forwards adapter
/// events into the command channel. Dropping the task's stream stops
/// discovery on the adapter.
async fn start_discovery(
    adapter: &Adapter,
    svc_uuid: Uuid,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
) -> Option<JoinHandle<()>> {
    let filter = bluer::DiscoveryFilter {
        uuids: vec![svc_uuid].into_iter().collect(),
        transport: bluer::DiscoveryTransport::Le,
        duplicate_data: false,
        ..Default::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("cannot set discovery filter: {e}");
    }
    let adapter = adapter.clone();
    let cmd_tx = cmd_tx.clone();
    Some(tokio::spawn(async move {
        let stream = match adapter.discover_devices().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot start discovery: {e}");
                return;
            }
        };
        futures::pin_mut!(stream);
        while let Some(ev) = stream.next().await {
            if cmd_tx.send(Cmd::Adapter(ev)).is_err() {
                break;
            }
        }
    }))
}

#[allow(clippy::too_many_arguments)]
async fn handle_cmd(
    cmd: Cmd,
    cfg: &BleConfig,
    settings: &Settings,
    adapter: &Adapter,
    shared: &Arc<Shared>,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
    discovery: &mut Option<JoinHandle<()>>,
    device_watch: &mut Option<JoinHandle<()>>,
) {
    match cmd {
        Cmd::Adapter(AdapterEvent::DeviceAdded(addr)) => {
            on_device_added(addr, cfg, settings, adapter, shared, cmd_tx, device_watch).await;
        }
        Cmd::Adapter(AdapterEvent::DeviceRemoved(addr)) => {
            let is_current = shared.link.lock().unwrap().dev == Some(addr);
            if is_current {
                shared.clear_device("device removed");
                if let Some(task) = device_watch.take() {
                    task.abort();
                }
            }
        }
        Cmd::Adapter(_) => {}
        Cmd::Device { addr, event } => {
            on_device_event(addr, event, cfg, settings, adapter, shared, cmd_tx, device_watch)
                .await;
        }
        Cmd::ConnectDone {
            addr,
            generation,
            result,
        } => {
            shared.connect_inflight.store(false, Ordering::SeqCst);
            let current_gen = shared.link.lock().unwrap().generation;
            if generation != current_gen {
                // The device was dropped while the call was in flight.
                debug!("stale connect completion for {addr}, ignoring");
                return;
            }
            match result {
                Ok(()) => {
                    shared.connected.store(true, Ordering::SeqCst);
                    shared.services_resolved.store(false, Ordering::SeqCst);
                    info!("device connected: {addr}");
                    // ServicesResolved may already be set from a prior link.
                    if let Ok(device) = adapter.device(addr) {
                        if device.is_services_resolved().await.unwrap_or(false) {
                            shared.services_resolved.store(true, Ordering::SeqCst);
                        }
                    }
                }
                Err(failure) => {
                    let (backoff, clear_dev) = classify_connect_failure(&failure);
                    warn!("connect to {addr} failed ({failure:?}), backoff {backoff:?}");
                    shared.connected.store(false, Ordering::SeqCst);
                    shared.subscribed.store(false, Ordering::SeqCst);
                    let mut link = shared.link.lock().unwrap();
                    link.next_connect_at = Some(Instant::now() + backoff);
                    drop(link);
                    if clear_dev {
                        shared.clear_device("device object gone");
                    }
                }
            }
        }
        Cmd::NotifyEnded { addr } => {
            let is_current = shared.link.lock().unwrap().dev == Some(addr);
            if is_current && shared.subscribed.swap(false, Ordering::SeqCst) {
                shared.rx_char.lock().await.take();
                info!("notification stream ended for {addr}");
            }
        }
        Cmd::Handover(target) => {
            info!(
                "handover to {}",
                target.map(|a| a.to_string()).unwrap_or_else(|| "(none)".into())
            );
            // Stop discovery while we tear the old link down.
            if let Some(task) = discovery.take() {
                task.abort();
            }
            shared.discovery_on.store(false, Ordering::SeqCst);
            if let Some(task) = device_watch.take() {
                task.abort();
            }

            let dev = shared.link.lock().unwrap().dev;
            if let Some(addr) = dev {
                if let Ok(device) = adapter.device(addr) {
                    let _ = device.disconnect().await;
                }
            }
            shared.rx_char.lock().await.take();
            shared.clear_device("handover");

            {
                let mut link = shared.link.lock().unwrap();
                link.desired = target;
                link.halted = target.is_none();
                link.next_connect_at = Some(Instant::now() + HANDOVER_CONNECT_DELAY);
                link.last_cold_scan = None;
            }
            shared.refresh_req.store(true, Ordering::SeqCst);

            *discovery = start_discovery(adapter, settings.svc_uuid, cmd_tx).await;
            shared.discovery_on.store(discovery.is_some(), Ordering::SeqCst);
        }
        Cmd::Refresh => {
            refresh_candidates(adapter, settings.svc_uuid, shared).await;
        }
        Cmd::Stop => unreachable!("handled by the loop"),
    }
}

/// Adoption rules for a scan hit: first hit wins; a configured peer MAC must
/// match, except that a service-UUID hit with a different address is accepted
/// (the peer may be using a resolvable private address).
async fn on_device_added(
    addr: Address,
    cfg: &BleConfig,
    settings: &Settings,
    adapter: &Adapter,
    shared: &Arc<Shared>,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
    device_watch: &mut Option<JoinHandle<()>>,
) {
    let Ok(device) = adapter.device(addr) else {
        return;
    };

    let uuid_match = match device.uuids().await {
        Ok(Some(uuids)) => uuids.iter().any(|u| *u == settings.svc_uuid),
        _ => false,
    };
    // During filtered discovery BlueZ only reports matching devices, so an
    // active filter counts as a service hit.
    let uuid_hit = uuid_match || shared.discovery_on.load(Ordering::SeqCst);
    let rssi = device.rssi().await.ok().flatten();

    if uuid_hit {
        let mut candidates = shared.candidates.lock().unwrap();
        candidates.upsert(addr, rssi, Instant::now());
    }

    let peer = shared.effective_peer(cfg);
    let (halted, have_dev) = {
        let link = shared.link.lock().unwrap();
        (link.halted, link.dev.is_some())
    };
    if halted || have_dev {
        return;
    }

    let adopt = match peer {
        Some(peer) if peer == addr => true,
        Some(peer) => {
            if uuid_hit {
                debug!("peer MAC {peer} mismatch but service UUID hit on {addr}, accepting");
                true
            } else {
                false
            }
        }
        None => uuid_hit,
    };
    if !adopt {
        return;
    }

    shared.link.lock().unwrap().dev = Some(addr);
    match rssi {
        Some(rssi) => info!("found {addr} rssi={rssi} (svc hit)"),
        None => info!("found {addr} (svc hit)"),
    }
    watch_device(addr, adapter, cmd_tx, device_watch);
}

/// Forward the adopted device's property changes into the command channel.
fn watch_device(
    addr: Address,
    adapter: &Adapter,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
    device_watch: &mut Option<JoinHandle<()>>,
) {
    if let Some(task) = device_watch.take() {
        task.abort();
    }
    let Ok(device) = adapter.device(addr) else {
        return;
    };
    let cmd_tx = cmd_tx.clone();
    *device_watch = Some(tokio::spawn(async move {
        let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                debug!("cannot watch device {addr}: {e}");
                return;
            }
        };
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            if cmd_tx.send(Cmd::Device { addr, event }).is_err() {
                break;
            }
        }
    }));
}

#[allow(clippy::too_many_arguments)]
async fn on_device_event(
    addr: Address,
    event: DeviceEvent,
    cfg: &BleConfig,
    settings: &Settings,
    adapter: &Adapter,
    shared: &Arc<Shared>,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
    device_watch: &mut Option<JoinHandle<()>>,
) {
    let property = match event {
        DeviceEvent::PropertyChanged(property) => property,
        _ => return,
    };
    let is_current = shared.link.lock().unwrap().dev == Some(addr);

    match property {
        DeviceProperty::Connected(connected) if is_current => {
            if connected && !shared.connected.swap(true, Ordering::SeqCst) {
                info!("Connected property became true ({addr})");
            } else if !connected && shared.connected.swap(false, Ordering::SeqCst) {
                shared.subscribed.store(false, Ordering::SeqCst);
                shared.services_resolved.store(false, Ordering::SeqCst);
                shared.rx_char.lock().await.take();
                info!("disconnected ({addr})");
            }
        }
        DeviceProperty::ServicesResolved(resolved) if is_current => {
            shared.services_resolved.store(resolved, Ordering::SeqCst);
            debug!("ServicesResolved={resolved} on {addr}");
        }
        DeviceProperty::Rssi(rssi) => {
            let mut candidates = shared.candidates.lock().unwrap();
            candidates.upsert(addr, Some(rssi), Instant::now());
        }
        DeviceProperty::Uuids(uuids) if !is_current => {
            // UUIDs arriving late may reveal the service; adopt only when no
            // peer MAC narrows the search.
            let peer = shared.effective_peer(cfg);
            let (halted, have_dev) = {
                let link = shared.link.lock().unwrap();
                (link.halted, link.dev.is_some())
            };
            if peer.is_none()
                && !halted
                && !have_dev
                && uuids.into_iter().any(|u| u == settings.svc_uuid)
            {
                shared.link.lock().unwrap().dev = Some(addr);
                debug!("late UUIDs picked device {addr}");
                watch_device(addr, adapter, cmd_tx, device_watch);
            }
        }
        _ => {}
    }
}

/// One pump step; runs every [`PUMP_INTERVAL`] between event batches.
async fn pump(
    cfg: &BleConfig,
    settings: &Settings,
    adapter: &Adapter,
    shared: &Arc<Shared>,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
    discovery: &mut Option<JoinHandle<()>>,
    device_watch: &mut Option<JoinHandle<()>>,
) {
    if !shared.running.load(Ordering::SeqCst) {
        return;
    }
    let now = Instant::now();
    let connected = shared.connected.load(Ordering::SeqCst);
    let inflight = shared.connect_inflight.load(Ordering::SeqCst);

    // 1. Without a connection there is nothing subscribed.
    if !connected && shared.subscribed.swap(false, Ordering::SeqCst) {
        shared.rx_char.lock().await.take();
    }

    let (dev, halted, connect_due, cold_scan_due, refresh_due) = {
        let mut link = shared.link.lock().unwrap();
        let connect_due = link.next_connect_at.map_or(true, |t| now >= t);
        let cold_due = link
            .last_cold_scan
            .map_or(true, |t| now.duration_since(t) >= COLD_SCAN_INTERVAL);
        let refresh_due = link
            .last_refresh
            .map_or(true, |t| now.duration_since(t) >= REFRESH_INTERVAL);
        if cold_due && link.dev.is_none() && !link.halted {
            link.last_cold_scan = Some(now);
        }
        if refresh_due {
            link.last_refresh = Some(now);
        }
        (link.dev, link.halted, connect_due, cold_due, refresh_due)
    };

    // 2. No adopted device: throttled cold scan over the known objects.
    if dev.is_none() && !halted && cold_scan_due {
        cold_scan(cfg, settings, adapter, shared, cmd_tx, device_watch).await;
    }

    // 3. Connect when the gate allows it.
    let dev = shared.link.lock().unwrap().dev;
    if let Some(addr) = dev {
        if !connected && !inflight && connect_due && !halted {
            spawn_connect(addr, adapter, shared, cmd_tx);
            // 5. Discovery pauses while a connect is in flight; some
            // controllers abort scans during pairing.
            if let Some(task) = discovery.take() {
                task.abort();
            }
            shared.discovery_on.store(false, Ordering::SeqCst);
        }

        // 4. Connected but not subscribed: discover GATT paths and enable
        // notifications, retrying transient failures on later pumps.
        if connected
            && !shared.subscribed.load(Ordering::SeqCst)
            && shared.services_resolved.load(Ordering::SeqCst)
        {
            let discover_due = {
                let mut link = shared.link.lock().unwrap();
                let due = link
                    .last_discover
                    .map_or(true, |t| now.duration_since(t) >= DISCOVER_INTERVAL);
                if due {
                    link.last_discover = Some(now);
                }
                due
            };
            if discover_due {
                match try_subscribe(addr, settings, adapter, shared, cmd_tx).await {
                    Ok(()) => info!("subscribed to TX notifications on {addr}"),
                    Err(e) => debug!("GATT discovery not ready on {addr}: {e}"),
                }
            }
        }
    }

    // 5. Discovery resumes when no connect is in flight.
    if !shared.connect_inflight.load(Ordering::SeqCst)
        && discovery.is_none()
        && shared.running.load(Ordering::SeqCst)
    {
        *discovery = start_discovery(adapter, settings.svc_uuid, cmd_tx).await;
        shared.discovery_on.store(discovery.is_some(), Ordering::SeqCst);
    }

    // 6. Periodic or requested candidate refresh.
    if refresh_due || shared.refresh_req.swap(false, Ordering::SeqCst) {
        refresh_candidates(adapter, settings.svc_uuid, shared).await;
    }
}

/// Enumerate the adapter's known devices, seed adoption, and refresh the
/// candidate cache. Stands in for a full object-manager walk.
async fn cold_scan(
    cfg: &BleConfig,
    settings: &Settings,
    adapter: &Adapter,
    shared: &Arc<Shared>,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
    device_watch: &mut Option<JoinHandle<()>>,
) {
    let Ok(addresses) = adapter.device_addresses().await else {
        return;
    };
    let peer = shared.effective_peer(cfg);

    for addr in addresses {
        let Ok(device) = adapter.device(addr) else {
            continue;
        };
        let uuid_hit = match device.uuids().await {
            Ok(Some(uuids)) => uuids.iter().any(|u| *u == settings.svc_uuid),
            _ => false,
        };
        if uuid_hit {
            let rssi = device.rssi().await.ok().flatten();
            shared
                .candidates
                .lock()
                .unwrap()
                .upsert(addr, rssi, Instant::now());
        }

        let have_dev = shared.link.lock().unwrap().dev.is_some();
        if have_dev {
            continue;
        }
        let adopt = match peer {
            // The cold scan is strict about a configured peer: only the
            // exact address seeds adoption.
            Some(peer) => peer == addr,
            None => uuid_hit,
        };
        if adopt {
            shared.link.lock().unwrap().dev = Some(addr);
            info!("cold scan adopted {addr}");
            watch_device(addr, adapter, cmd_tx, device_watch);
        }
    }
}

/// Fire one async Connect; the completion lands back in the command channel.
fn spawn_connect(
    addr: Address,
    adapter: &Adapter,
    shared: &Arc<Shared>,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
) {
    let Ok(device) = adapter.device(addr) else {
        shared.clear_device("device handle unavailable");
        return;
    };
    shared.connect_inflight.store(true, Ordering::SeqCst);
    let generation = shared.link.lock().unwrap().generation;
    let cmd_tx = cmd_tx.clone();
    debug!("connecting to {addr}");
    tokio::spawn(async move {
        let result = match tokio::time::timeout(CONNECT_TIMEOUT, device.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectFailure::from(e)),
            Err(_) => Err(ConnectFailure::Timeout),
        };
        let _ = cmd_tx.send(Cmd::ConnectDone {
            addr,
            generation,
            result,
        });
    });
}

/// Why a subscription attempt has to wait for the next pump.
#[derive(Debug)]
enum SubscribeError {
    PathsNotResolved,
    Bluez(bluer::Error),
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscribeError::PathsNotResolved => f.write_str("gatt paths not resolvable yet"),
            SubscribeError::Bluez(e) => e.fmt(f),
        }
    }
}

impl From<bluer::Error> for SubscribeError {
    fn from(e: bluer::Error) -> Self {
        SubscribeError::Bluez(e)
    }
}

/// Resolve the service and characteristics, then subscribe to TX. Any error
/// here is transient; the pump retries.
async fn try_subscribe(
    addr: Address,
    settings: &Settings,
    adapter: &Adapter,
    shared: &Arc<Shared>,
    cmd_tx: &mpsc::UnboundedSender<Cmd>,
) -> Result<(), SubscribeError> {
    let device = adapter.device(addr)?;

    let mut tx_char: Option<Characteristic> = None;
    let mut rx_char: Option<Characteristic> = None;
    for service in device.services().await? {
        if service.uuid().await? != settings.svc_uuid {
            continue;
        }
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            if uuid == settings.tx_uuid {
                tx_char = Some(characteristic);
            } else if uuid == settings.rx_uuid {
                rx_char = Some(characteristic);
            }
        }
    }
    let (Some(tx), Some(rx)) = (tx_char, rx_char) else {
        return Err(SubscribeError::PathsNotResolved);
    };

    let notifications = tx.notify().await?;
    *shared.rx_char.lock().await = Some(rx);
    shared.subscribed.store(true, Ordering::SeqCst);

    let shared = shared.clone();
    let cmd_tx = cmd_tx.clone();
    tokio::spawn(async move {
        futures::pin_mut!(notifications);
        while let Some(value) = notifications.next().await {
            debug!("notify on {addr}: {} bytes", value.len());
            shared.deliver(value);
        }
        let _ = cmd_tx.send(Cmd::NotifyEnded { addr });
    });
    Ok(())
}

/// Update `{addr, rssi, last_seen}` for every device advertising the service
/// and evict entries past their TTL.
async fn refresh_candidates(adapter: &Adapter, svc_uuid: Uuid, shared: &Arc<Shared>) {
    let now = Instant::now();
    if let Ok(addresses) = adapter.device_addresses().await {
        for addr in addresses {
            let Ok(device) = adapter.device(addr) else {
                continue;
            };
            let uuid_hit = match device.uuids().await {
                Ok(Some(uuids)) => uuids.iter().any(|u| *u == svc_uuid),
                _ => false,
            };
            if uuid_hit {
                let rssi = device.rssi().await.ok().flatten();
                shared.candidates.lock().unwrap().upsert(addr, rssi, now);
            }
        }
    }
    shared.candidates.lock().unwrap().evict_stale(now);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn bluez_err(kind: ErrorKind, message: &str) -> ConnectFailure {
        ConnectFailure::Bluez {
            kind,
            message: message.into(),
        }
    }

    #[test]
    fn timeout_and_in_progress_back_off_five_seconds() {
        let (backoff, clear) = classify_connect_failure(&ConnectFailure::Timeout);
        assert_eq!(backoff, BACKOFF_BUSY);
        assert!(!clear);

        let (backoff, clear) =
            classify_connect_failure(&bluez_err(ErrorKind::InProgress, "operation in progress"));
        assert_eq!(backoff, BACKOFF_BUSY);
        assert!(!clear);

        let (backoff, clear) = classify_connect_failure(&bluez_err(
            ErrorKind::Failed,
            "connect already in progress",
        ));
        assert_eq!(backoff, BACKOFF_BUSY);
        assert!(!clear);
    }

    #[test]
    fn vanished_object_clears_the_device() {
        let (backoff, clear) =
            classify_connect_failure(&bluez_err(ErrorKind::DoesNotExist, "does not exist"));
        assert_eq!(backoff, BACKOFF_OTHER);
        assert!(clear);
    }

    #[test]
    fn other_failures_back_off_two_seconds() {
        let (backoff, clear) =
            classify_connect_failure(&bluez_err(ErrorKind::Failed, "le-connection-abort"));
        assert_eq!(backoff, BACKOFF_OTHER);
        assert!(!clear);
    }

    #[test]
    fn ebadmsg_is_soft() {
        assert!(is_soft_write_error("EBADMSG"));
        assert!(is_soft_write_error("Write failed: Bad message"));
        assert!(!is_soft_write_error("Not connected"));
    }
}
