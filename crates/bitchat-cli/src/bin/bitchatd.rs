//! The bitchat daemon.
//!
//! Wires the configured transport into the chat service and drives both from
//! the control socket. One process, one link, no persisted state.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bitchat_ble::{Address, BleConfig, CentralTransport, PeripheralTransport};
use bitchat_core::aead::PskAead;
use bitchat_core::chat::ChatService;
use bitchat_core::config::{self, Config, Role, TransportKind};
use bitchat_core::transport::{LoopbackTransport, Transport};

use bitchat_cli::ipc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    init_tracing(&cfg.log_level);
    info!(
        "bitchatd starting: transport={:?} role={} adapter={} mtu={}",
        cfg.transport, cfg.role, cfg.adapter, cfg.mtu_payload
    );

    let aead = match PskAead::init_from_env(config::ENV_PSK) {
        Some(aead) => {
            info!("AEAD: XChaCha20-Poly1305 with pre-shared key");
            aead
        }
        None => {
            warn!("no usable {} value, frames are framed but not encrypted", config::ENV_PSK);
            PskAead::noop()
        }
    };

    let mut central: Option<Arc<CentralTransport>> = None;
    let transport: Arc<dyn Transport> = match (cfg.transport, cfg.role) {
        (TransportKind::Loopback, _) => Arc::new(LoopbackTransport::new()),
        (TransportKind::Bluez, Role::Central) => {
            let c = Arc::new(CentralTransport::new(BleConfig::from_core(&cfg)));
            central = Some(c.clone());
            c
        }
        (TransportKind::Bluez, Role::Peripheral) => {
            Arc::new(PeripheralTransport::new(BleConfig::from_core(&cfg)))
        }
    };

    let chat = Arc::new(ChatService::new(transport, aead, &cfg));
    chat.start().await.context("chat service failed to start")?;

    let ctl_sock = cfg.ctl_sock.clone();
    let handler_chat = chat.clone();
    let handler_central = central.clone();
    let server = ipc::serve(&ctl_sock, move |line| {
        let chat = handler_chat.clone();
        let central = handler_central.clone();
        async move { handle_line(&line, &chat, central.as_deref()).await }
    });

    tokio::select! {
        result = server => result.context("control socket server failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }

    chat.stop().await;
    info!("bitchatd exited");
    Ok(())
}

/// Process one control line; returns `false` to shut the daemon down.
async fn handle_line(line: &str, chat: &ChatService, central: Option<&CentralTransport>) -> bool {
    match line {
        "QUIT" => {
            info!("QUIT received, shutting down");
            return false;
        }
        "TAIL on" => {
            chat.set_tail(true);
            info!("tail enabled");
        }
        "TAIL off" => {
            chat.set_tail(false);
            info!("tail disabled");
        }
        "PEERS" => match central {
            Some(central) => {
                central.request_refresh();
                for candidate in central.candidates() {
                    info!("{} {}", candidate.addr, candidate.rssi);
                }
            }
            None => warn!("PEERS: not running as BLE central"),
        },
        "DISCONNECT" => match central {
            Some(central) => {
                central.handover_to(None);
            }
            None => warn!("DISCONNECT: not running as BLE central"),
        },
        _ if line.starts_with("SEND ") => {
            let text = &line["SEND ".len()..];
            if !chat.send_text(text).await {
                warn!("SEND failed");
            }
        }
        _ if line.starts_with("CONNECT ") => {
            let addr = line["CONNECT ".len()..].trim();
            match central {
                Some(central) => match parse_addr(addr) {
                    Some(addr) => {
                        central.handover_to(Some(addr));
                    }
                    None => warn!("CONNECT: '{addr}' is not a MAC address"),
                },
                None => warn!("CONNECT: not running as BLE central"),
            }
        }
        "" => {}
        other => warn!("unknown control line: {other}"),
    }
    true
}

fn parse_addr(raw: &str) -> Option<Address> {
    config::parse_peer_addr(raw).and_then(|mac| mac.parse().ok())
}

/// `RUST_LOG` wins when set; otherwise `BITCHAT_LOG_LEVEL` picks the level.
fn init_tracing(level: &str) {
    let default = match level {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
