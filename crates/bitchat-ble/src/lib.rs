//! BlueZ GATT transport for bitchat.
//!
//! Two role-specific implementations of the core [`Transport`] trait, both
//! driving the host BlueZ stack through `bluer`:
//!
//! - [`PeripheralTransport`] exports the GATT service (TX notify, RX write)
//!   and an LE advertisement; the link is ready while the peer keeps TX
//!   notifications enabled.
//! - [`CentralTransport`] scans for the service, connects, subscribes to TX,
//!   and writes frames to RX; it also maintains the candidate cache behind
//!   the `PEERS` operator command and supports handover between peers.
//!
//! Both roles run a single event-loop task that owns every BlueZ handle, so
//! teardown is a matter of dropping RAII handles and joining that task.
//!
//! [`Transport`]: bitchat_core::transport::Transport

use std::time::Duration;

use bitchat_core::config::Config;

pub mod candidates;
pub mod central;
pub mod peripheral;

pub use bluer::Address;
pub use candidates::Candidate;
pub use central::CentralTransport;
pub use peripheral::PeripheralTransport;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// BLE-specific settings, resolved from the daemon configuration.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Host adapter name, e.g. `hci0`.
    pub adapter: String,
    /// Peer MAC enforced by the central when set.
    pub peer: Option<Address>,
    /// Optional pause after each central write.
    pub tx_pause: Duration,
}

impl BleConfig {
    /// Extract the BLE settings from the core configuration. An unparsable
    /// peer address has already been rejected by `Config::from_env`.
    pub fn from_core(cfg: &Config) -> Self {
        Self {
            adapter: cfg.adapter.clone(),
            peer: cfg.peer.as_deref().and_then(|s| s.parse().ok()),
            tx_pause: Duration::from_millis(cfg.tx_pause_ms),
        }
    }
}
