//! # Mesh Proxy
//!
//! Proxy reconciliation engine for a peer-to-peer WireGuard overlay. Decides,
//! per remote peer and per network, whether traffic flows directly, through a
//! local NAT-traversal proxy session, or through a relay, and keeps that
//! decision set in sync with desired-state payloads from the control plane.
//!
//! ## Key Components
//!
//! ### Reconciliation
//! - [`ProxyManager`] - Single-consumer loop converging live connections to payloads
//! - [`ExtClientWatcher`] - Creates connections for external clients once their endpoint is learned
//!
//! ### State
//! - [`GlobalState`] - Network settings, connection table, relay table, ext-client waits
//! - [`PeerConnection`] - One forwarding session per proxied peer
//! - [`MetricsStore`] - Per-peer traffic samples, flushed to disk periodically
//!
//! ### Collaborators
//! - [`WgInterface`] / [`CliWgControl`] - The local WireGuard device
//! - [`UdpProxyConnector`] - Loopback UDP forwarding sessions
//! - [`discover_host_info`] - STUN address discovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use meshproxy::{CliWgProvider, Config, GlobalState, MetricsStore, ProxyManager, ProxyStats, UdpProxyConnector};
//! use std::sync::Arc;
//!
//! let config = Config::load("config.toml")?;
//! let store = MetricsStore::new();
//! let connector = Arc::new(UdpProxyConnector::new(config.proxy.bind_address, store.clone()));
//! let manager = ProxyManager::new(
//!     GlobalState::new(),
//!     Arc::new(CliWgProvider),
//!     connector,
//!     ProxyStats::new(),
//!     &config.proxy,
//! );
//! manager.run(updates, shutdown).await;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod extclient;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod payload;
pub mod proxy;
pub mod relay;
pub mod state;
pub mod stun;
pub mod wg;

#[cfg(test)]
mod testing;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{Config, DaemonConfig, ProxyConfig, StunConfig, TimingConfig};

// ============================================================================
// Payloads
// ============================================================================

pub use error::PayloadError;
pub use payload::{PeerConf, PeerConfig, ProxyAction, ProxyPayload, RelayedConf};

// ============================================================================
// Connections
// ============================================================================

pub use connection::{
    ConnectionBuilder, LinkState, PeerConnection, PeerPlan, ProxyConnector, ProxyRequest,
    StaleReason, StopSignal,
};
pub use proxy::UdpProxyConnector;

// ============================================================================
// State
// ============================================================================

pub use relay::{RelayEntry, RelayTable};
pub use state::{ExtClientInfo, ExtClientWait, GlobalState, NetworkSettings, PeerMap};

// ============================================================================
// Reconciliation
// ============================================================================

pub use extclient::{ExtClientWatcher, WatchState};
pub use manager::{Outcome, ProxyManager};

// ============================================================================
// Metrics
// ============================================================================

pub use metrics::{Metric, MetricsStore, ProxyStats};

// ============================================================================
// Address Discovery
// ============================================================================

pub use stun::{discover_host_info, HostInfo};

// ============================================================================
// WireGuard
// ============================================================================

pub use wg::{CliWgControl, CliWgProvider, InterfaceProvider, PeerRuntimeState, WgInterface};
