//! Peer connections: one forwarding session per proxied remote peer.
//!
//! A [`PeerConnection`] is created by the manager (or by an external-client
//! watcher once the peer's endpoint is known) and torn down by firing its
//! [`StopSignal`]. The forwarding session itself lives behind the
//! [`ProxyConnector`] seam and releases its socket when it observes the stop.

use anyhow::{bail, Context, Result};
use log::info;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

use crate::payload::{PeerConfig, ProxyPayload};
use crate::wg::WgInterface;

// ============================================================================
// Stop Signal
// ============================================================================

/// Cancellation handle shared between a connection and its forwarding session.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns false if it was already fired.
    pub fn stop(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once the signal has been fired.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

// ============================================================================
// Peer Plan
// ============================================================================

/// Resolved intent for one desired peer, derived from a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPlan {
    pub network: String,
    pub peer: PeerConfig,
    /// Address the forwarding session should reach the peer at
    pub endpoint: Option<SocketAddr>,
    pub is_relayed: bool,
    pub relayed_to: Option<SocketAddr>,
    pub is_ext_client: bool,
    pub is_attached_ext_client: bool,
    pub address: String,
}

impl PeerPlan {
    pub fn from_payload(payload: &ProxyPayload, peer: &PeerConfig) -> Self {
        let conf = payload.peer_conf(&peer.public_key);
        let (is_relayed, relayed_to) = payload.effective_relay(conf);
        Self {
            network: payload.network.clone(),
            peer: peer.clone(),
            endpoint: payload.dial_endpoint(peer),
            is_relayed,
            relayed_to,
            is_ext_client: conf.map(|c| c.is_ext_client).unwrap_or(false),
            is_attached_ext_client: conf.map(|c| c.is_attached_ext_client).unwrap_or(false),
            address: conf.map(|c| c.address.clone()).unwrap_or_default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.peer.public_key
    }
}

// ============================================================================
// Peer Connection
// ============================================================================

/// Mutable fields of a connection, read by the forwarding session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    /// Local forwarding address the interface peer points at
    pub local_addr: SocketAddr,
    /// Actual remote address of the peer
    pub remote_addr: SocketAddr,
    pub is_relayed: bool,
    pub relayed_to: Option<SocketAddr>,
    pub is_ext_client: bool,
    pub is_attached_ext_client: bool,
}

/// Why an existing connection no longer matches the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    RelayStatusChanged,
    RelayEndpointChanged,
    /// The interface peer endpoint no longer points at the proxy
    EndpointNotProxied,
    RemoteAddressChanged,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::RelayStatusChanged => write!(f, "relay status changed"),
            StaleReason::RelayEndpointChanged => write!(f, "relay endpoint changed"),
            StaleReason::EndpointNotProxied => write!(f, "endpoint is not set to proxy"),
            StaleReason::RemoteAddressChanged => write!(f, "remote address changed"),
        }
    }
}

#[derive(Debug)]
pub struct PeerConnection {
    key: String,
    network: String,
    stop: StopSignal,
    state: Mutex<LinkState>,
}

impl PeerConnection {
    pub fn new(key: &str, network: &str, state: LinkState, stop: StopSignal) -> Self {
        Self {
            key: key.to_string(),
            network: network.to_string(),
            stop,
            state: Mutex::new(state),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.state.lock().local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.state.lock().remote_addr
    }

    pub fn is_relayed(&self) -> bool {
        self.state.lock().is_relayed
    }

    pub fn is_attached_ext_client(&self) -> bool {
        self.state.lock().is_attached_ext_client
    }

    /// Fire the stop signal. Safe to call more than once.
    pub fn stop(&self) -> bool {
        let _guard = self.state.lock();
        self.stop.stop()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Compare against the desired plan and the endpoint the interface
    /// currently holds for this peer.
    pub fn is_stale(&self, plan: &PeerPlan, live_endpoint: Option<SocketAddr>) -> Option<StaleReason> {
        let state = self.state.lock();
        if state.is_relayed != plan.is_relayed {
            return Some(StaleReason::RelayStatusChanged);
        }
        if state.relayed_to != plan.relayed_to {
            return Some(StaleReason::RelayEndpointChanged);
        }
        if let Some(live) = live_endpoint {
            if live != state.local_addr {
                return Some(StaleReason::EndpointNotProxied);
            }
        }
        if let Some(desired) = plan.endpoint {
            // NAT rebinding moves ports around; only a host change counts
            if desired.ip() != state.remote_addr.ip() {
                return Some(StaleReason::RemoteAddressChanged);
            }
        }
        None
    }
}

// ============================================================================
// Forwarding Session Seam
// ============================================================================

/// Everything a forwarding session needs to serve one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub network: String,
    pub public_key: String,
    pub remote_addr: SocketAddr,
    pub is_relayed: bool,
    pub relayed_to: Option<SocketAddr>,
    /// Listen port of the local interface
    pub listen_port: u16,
}

impl ProxyRequest {
    /// Where outbound traffic goes: the relay when relayed, the peer otherwise.
    pub fn dial_addr(&self) -> SocketAddr {
        match (self.is_relayed, self.relayed_to) {
            (true, Some(relay)) => relay,
            _ => self.remote_addr,
        }
    }
}

/// Binds forwarding sessions. Returns the local address the interface
/// should send this peer's traffic to. The session must shut down when
/// `stop` flips to true.
pub trait ProxyConnector: Send + Sync {
    fn connect(&self, request: &ProxyRequest, stop: watch::Receiver<bool>) -> Result<SocketAddr>;
}

/// Creates connections: binds a session and repoints the interface peer at it.
#[derive(Clone)]
pub struct ConnectionBuilder {
    connector: Arc<dyn ProxyConnector>,
}

impl ConnectionBuilder {
    pub fn new(connector: Arc<dyn ProxyConnector>) -> Self {
        Self { connector }
    }

    /// Bind a session and point the interface peer at it.
    pub fn establish(
        &self,
        iface: &dyn WgInterface,
        listen_port: u16,
        plan: &PeerPlan,
    ) -> Result<Arc<PeerConnection>> {
        let conn = self.bind(listen_port, plan)?;
        self.attach(iface, &conn, plan)?;
        Ok(conn)
    }

    /// Start the forwarding session for `plan` without touching the
    /// interface.
    pub fn bind(&self, listen_port: u16, plan: &PeerPlan) -> Result<Arc<PeerConnection>> {
        let Some(remote_addr) = plan.endpoint else {
            bail!("endpoint nil for peer {}", plan.key());
        };

        let stop = StopSignal::new();
        let request = ProxyRequest {
            network: plan.network.clone(),
            public_key: plan.key().to_string(),
            remote_addr,
            is_relayed: plan.is_relayed,
            relayed_to: plan.relayed_to,
            listen_port,
        };
        let local_addr = self
            .connector
            .connect(&request, stop.subscribe())
            .with_context(|| format!("failed to bind proxy for peer {}", plan.key()))?;

        info!(
            "Proxy for peer {} on {}: {} -> {}{}",
            plan.key(),
            plan.network,
            local_addr,
            request.dial_addr(),
            if plan.is_relayed { " (relayed)" } else { "" }
        );

        let state = LinkState {
            local_addr,
            remote_addr,
            is_relayed: plan.is_relayed,
            relayed_to: plan.relayed_to,
            is_ext_client: plan.is_ext_client,
            is_attached_ext_client: plan.is_attached_ext_client,
        };
        Ok(Arc::new(PeerConnection::new(
            plan.key(),
            &plan.network,
            state,
            stop,
        )))
    }

    /// Repoint the interface peer at a bound session. The session is stopped
    /// if the interface rejects the update.
    pub fn attach(&self, iface: &dyn WgInterface, conn: &PeerConnection, plan: &PeerPlan) -> Result<()> {
        let mut wg_peer = plan.peer.clone();
        wg_peer.endpoint = Some(conn.local_addr());
        if let Err(e) = iface.update_peer(&wg_peer) {
            conn.stop();
            return Err(e.context(format!("failed to point peer {} at proxy", plan.key())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, MockConnector, MockInterface};

    fn plan(endpoint: &str) -> PeerPlan {
        PeerPlan {
            network: "net1".into(),
            peer: PeerConfig::new("peer-a", Some(addr(endpoint))),
            endpoint: Some(addr(endpoint)),
            is_relayed: false,
            relayed_to: None,
            is_ext_client: false,
            is_attached_ext_client: false,
            address: "10.10.0.2".into(),
        }
    }

    #[test]
    fn test_stop_signal_is_idempotent() {
        let signal = StopSignal::new();
        let rx = signal.subscribe();

        assert!(!signal.is_stopped());
        assert!(signal.stop());
        assert!(!signal.stop());
        assert!(signal.is_stopped());
        assert!(*rx.borrow());
    }

    #[test]
    fn test_establish_points_interface_at_proxy() {
        let iface = MockInterface::new("nm-net1", 51821);
        let connector = MockConnector::new();
        let builder = ConnectionBuilder::new(connector.clone());

        let conn = builder.establish(&iface, 51821, &plan("203.0.113.5:51820")).unwrap();

        assert_eq!(conn.key(), "peer-a");
        assert_eq!(conn.remote_addr(), addr("203.0.113.5:51820"));
        assert_eq!(iface.endpoint_of("peer-a"), Some(conn.local_addr()));
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.last_request().unwrap().listen_port, 51821);
    }

    #[test]
    fn test_establish_stops_session_when_interface_rejects() {
        let iface = MockInterface::new("nm-net1", 51821);
        iface.fail_updates(true);
        let connector = MockConnector::new();
        let builder = ConnectionBuilder::new(connector.clone());

        assert!(builder.establish(&iface, 51821, &plan("203.0.113.5:51820")).is_err());
        assert_eq!(connector.connects(), 1);
        assert!(connector.all_stopped());
    }

    #[test]
    fn test_bind_leaves_interface_untouched() {
        let iface = MockInterface::new("nm-net1", 51821);
        let connector = MockConnector::new();
        let builder = ConnectionBuilder::new(connector.clone());
        let desired = plan("203.0.113.5:51820");

        let conn = builder.bind(51821, &desired).unwrap();
        assert_eq!(connector.connects(), 1);
        assert_eq!(iface.updates(), 0);
        assert_eq!(iface.endpoint_of("peer-a"), None);

        builder.attach(&iface, &conn, &desired).unwrap();
        assert_eq!(iface.endpoint_of("peer-a"), Some(conn.local_addr()));
        assert!(!conn.is_stopped());
    }

    #[test]
    fn test_establish_requires_endpoint() {
        let iface = MockInterface::new("nm-net1", 51821);
        let connector = MockConnector::new();
        let builder = ConnectionBuilder::new(connector.clone());
        let mut no_endpoint = plan("203.0.113.5:51820");
        no_endpoint.endpoint = None;

        assert!(builder.establish(&iface, 51821, &no_endpoint).is_err());
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn test_stale_detection() {
        let iface = MockInterface::new("nm-net1", 51821);
        let builder = ConnectionBuilder::new(MockConnector::new());
        let desired = plan("203.0.113.5:51820");
        let conn = builder.establish(&iface, 51821, &desired).unwrap();
        let local = Some(conn.local_addr());

        assert_eq!(conn.is_stale(&desired, local), None);
        // port-only change is tolerated
        assert_eq!(conn.is_stale(&plan("203.0.113.5:40000"), local), None);

        assert_eq!(
            conn.is_stale(&plan("203.0.113.99:51820"), local),
            Some(StaleReason::RemoteAddressChanged)
        );
        assert_eq!(
            conn.is_stale(&desired, Some(addr("203.0.113.5:51820"))),
            Some(StaleReason::EndpointNotProxied)
        );

        let mut relayed = desired.clone();
        relayed.is_relayed = true;
        relayed.relayed_to = Some(addr("192.0.2.1:51722"));
        assert_eq!(conn.is_stale(&relayed, local), Some(StaleReason::RelayStatusChanged));
    }

    #[test]
    fn test_relayed_request_dials_relay() {
        let request = ProxyRequest {
            network: "net1".into(),
            public_key: "peer-a".into(),
            remote_addr: addr("203.0.113.5:51820"),
            is_relayed: true,
            relayed_to: Some(addr("192.0.2.1:51722")),
            listen_port: 51821,
        };
        assert_eq!(request.dial_addr(), addr("192.0.2.1:51722"));
    }
}
