//! BLE peripheral role: GATT server plus LE advertisement.
//!
//! Startup order matters to BlueZ: open the session, power the adapter,
//! register the GATT application (service with TX notify and RX write
//! characteristics), then register the advertisement. Teardown is the
//! reverse and happens by dropping the registration handles.
//!
//! The link is ready exactly while the peer keeps TX notifications enabled;
//! `send` emits one notification per frame and drops silently otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, Characteristic, CharacteristicNotify, CharacteristicNotifyMethod,
    CharacteristicNotifier, CharacteristicWrite, CharacteristicWriteMethod, ReqError, Service,
};
use futures::FutureExt;
use tracing::{debug, info, warn};

use bitchat_core::errors::TransportError;
use bitchat_core::transport::{OnFrame, Settings, Transport};

use crate::BleConfig;

/// Local name carried in the LE advertisement.
const ADV_LOCAL_NAME: &str = "BitChat";

// ----------------------------------------------------------------------------
// Peripheral transport
// ----------------------------------------------------------------------------

pub struct PeripheralTransport {
    cfg: BleConfig,
    shared: Arc<Shared>,
    /// RAII owners of the GATT application and advertisement registrations.
    run: tokio::sync::Mutex<Option<Registrations>>,
}

struct Shared {
    running: AtomicBool,
    /// Peer has TX notifications enabled.
    notifying: AtomicBool,
    notifier: tokio::sync::Mutex<Option<CharacteristicNotifier>>,
    on_frame: Mutex<Option<OnFrame>>,
}

struct Registrations {
    // Dropped in declaration order: advertisement first, then the GATT app,
    // then the bus connection.
    _adv: bluer::adv::AdvertisementHandle,
    _app: bluer::gatt::local::ApplicationHandle,
    _session: bluer::Session,
}

impl PeripheralTransport {
    pub fn new(cfg: BleConfig) -> Self {
        Self {
            cfg,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                notifying: AtomicBool::new(false),
                notifier: tokio::sync::Mutex::new(None),
                on_frame: Mutex::new(None),
            }),
            run: tokio::sync::Mutex::new(None),
        }
    }

    fn build_application(&self, settings: &Settings) -> Application {
        let notify_shared = self.shared.clone();
        let write_shared = self.shared.clone();

        Application {
            services: vec![Service {
                uuid: settings.svc_uuid,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: settings.tx_uuid,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                                let shared = notify_shared.clone();
                                async move {
                                    shared.on_subscribe(notifier).await;
                                }
                                .boxed()
                            })),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: settings.rx_uuid,
                        write: Some(CharacteristicWrite {
                            write: true,
                            write_without_response: true,
                            method: CharacteristicWriteMethod::Fun(Box::new(
                                move |new_value, req| {
                                    let shared = write_shared.clone();
                                    async move {
                                        if req.offset != 0 {
                                            return Err(ReqError::InvalidOffset);
                                        }
                                        debug!("rx write: {} bytes", new_value.len());
                                        shared.deliver(new_value);
                                        Ok(())
                                    }
                                    .boxed()
                                },
                            )),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

impl Shared {
    fn deliver(&self, frame: Vec<u8>) {
        let cb = self.on_frame.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(frame);
        }
    }

    /// Peer invoked StartNotify on TX: hold the notifier and watch for the
    /// matching StopNotify.
    async fn on_subscribe(self: Arc<Self>, notifier: CharacteristicNotifier) {
        info!("peer subscribed to TX notifications");
        *self.notifier.lock().await = Some(notifier);
        self.notifying.store(true, Ordering::SeqCst);

        let shared = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                let guard = shared.notifier.lock().await;
                match guard.as_ref() {
                    Some(n) if !n.is_stopped() => continue,
                    _ => break,
                }
            }
            // StopNotify, link loss, or a newer subscription replaced us.
            let mut guard = shared.notifier.lock().await;
            if guard.as_ref().is_some_and(|n| n.is_stopped()) {
                guard.take();
                shared.notifying.store(false, Ordering::SeqCst);
                info!("peer unsubscribed from TX notifications");
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Transport implementation
// ----------------------------------------------------------------------------

#[async_trait]
impl Transport for PeripheralTransport {
    async fn start(&self, settings: Settings, on_frame: OnFrame) -> Result<(), TransportError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.shared.on_frame.lock().unwrap() = Some(on_frame);

        let result: Result<Registrations, bluer::Error> = async {
            let session = bluer::Session::new().await?;
            let adapter = session.adapter(&self.cfg.adapter)?;
            adapter.set_powered(true).await?;

            let app = adapter
                .serve_gatt_application(self.build_application(&settings))
                .await?;

            let advertisement = Advertisement {
                advertisement_type: bluer::adv::Type::Peripheral,
                service_uuids: vec![settings.svc_uuid].into_iter().collect(),
                local_name: Some(ADV_LOCAL_NAME.to_string()),
                discoverable: Some(true),
                ..Default::default()
            };
            let adv = adapter.advertise(advertisement).await?;

            info!(
                "peripheral up on {}: svc={} advertising as '{}'",
                self.cfg.adapter, settings.svc_uuid, ADV_LOCAL_NAME
            );
            Ok(Registrations {
                _adv: adv,
                _app: app,
                _session: session,
            })
        }
        .await;

        match result {
            Ok(regs) => {
                *self.run.lock().await = Some(regs);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.on_frame.lock().unwrap().take();
                Err(TransportError::Fatal(format!(
                    "peripheral start failed: {e}"
                )))
            }
        }
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady);
        }
        let mut guard = self.shared.notifier.lock().await;
        let Some(notifier) = guard.as_mut() else {
            // Not notifying: drop silently, the peer is not listening.
            debug!("send: dropping {} bytes, peer not subscribed", frame.len());
            return Ok(());
        };
        match notifier.notify(frame.to_vec()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("notify failed, peer unsubscribed: {e}");
                guard.take();
                self.shared.notifying.store(false, Ordering::SeqCst);
                Err(TransportError::Busy(format!("notify failed: {e}")))
            }
        }
    }

    async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Unregister advertisement and application by dropping the handles.
        self.run.lock().await.take();
        self.shared.notifier.lock().await.take();
        self.shared.notifying.store(false, Ordering::SeqCst);
        self.shared.on_frame.lock().unwrap().take();
        info!("peripheral stopped");
    }

    fn link_ready(&self) -> bool {
        self.shared.notifying.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "bluez"
    }
}
