//! Proxy manager: the reconciliation engine.
//!
//! Consumes desired-state payloads one at a time, in arrival order, and
//! converges the live connection set of each network towards them. Per-peer
//! failures are logged and skipped; only validation failures reject a
//! payload as a whole.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::ProxyConfig;
use crate::connection::{ConnectionBuilder, PeerPlan, ProxyConnector};
use crate::extclient::ExtClientWatcher;
use crate::metrics::ProxyStats;
use crate::payload::{PeerConfig, ProxyAction, ProxyPayload};
use crate::relay::RelayEntry;
use crate::state::GlobalState;
use crate::wg::{InterfaceProvider, WgInterface};

/// What a processed payload did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Deleted,
    /// Relay topology or listen port changed; everything was torn down and
    /// is rebuilt by the next payload.
    Reset,
    Reconciled {
        created: usize,
        torn_down: usize,
        bypassed: usize,
        waiting: usize,
    },
}

pub struct ProxyManager {
    state: Arc<GlobalState>,
    provider: Arc<dyn InterfaceProvider>,
    builder: ConnectionBuilder,
    watcher: ExtClientWatcher,
    stats: Arc<ProxyStats>,
    proxy_port: u16,
}

impl ProxyManager {
    pub fn new(
        state: Arc<GlobalState>,
        provider: Arc<dyn InterfaceProvider>,
        connector: Arc<dyn ProxyConnector>,
        stats: Arc<ProxyStats>,
        config: &ProxyConfig,
    ) -> Self {
        let builder = ConnectionBuilder::new(connector);
        let watcher = ExtClientWatcher::new(
            state.clone(),
            builder.clone(),
            stats.clone(),
            config.ext_client_queue,
        );
        Self {
            state,
            provider,
            builder,
            watcher,
            stats,
            proxy_port: config.proxy_port,
        }
    }

    pub fn state(&self) -> &Arc<GlobalState> {
        &self.state
    }

    /// Process payloads until `shutdown` flips or the sender side closes.
    pub async fn run(
        &self,
        mut updates: mpsc::Receiver<ProxyPayload>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Proxy manager started");
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    info!("Proxy manager shutting down");
                    break;
                }
                payload = updates.recv() => {
                    let Some(payload) = payload else {
                        info!("Payload channel closed");
                        break;
                    };
                    match self.process(&payload) {
                        Ok(outcome) => debug!("Network {}: {:?}", payload.network, outcome),
                        Err(e) => error!("Failed to process payload for {:?}: {:#}", payload.network, e),
                    }
                }
            }
        }
        let canceled = self.state.cancel_all_ext_client_waits();
        if canceled > 0 {
            info!("Canceled {} pending ext client waits", canceled);
        }
    }

    /// Apply one payload.
    pub fn process(&self, payload: &ProxyPayload) -> Result<Outcome> {
        if let Err(e) = payload.validate() {
            self.stats.inc_rejected();
            return Err(e).context("Invalid proxy payload");
        }
        self.stats.inc_processed();

        match payload.action {
            ProxyAction::DeleteNetwork => {
                let stopped = self.state.delete_network(&payload.network);
                self.stats.add_torn_down(stopped as u64);
                info!(
                    "Deleted network {} ({} connections stopped)",
                    payload.network, stopped
                );
                Ok(Outcome::Deleted)
            }
            ProxyAction::AddNetwork => self.add_network(payload),
        }
    }

    fn add_network(&self, payload: &ProxyPayload) -> Result<Outcome> {
        let network = payload.network.as_str();
        let iface = self
            .provider
            .get_interface(&payload.interface_name)
            .with_context(|| format!("Failed to get interface {}", payload.interface_name))?;
        let listen_port = iface
            .listen_port()
            .with_context(|| format!("Failed to read listen port of {}", iface.name()))?;
        if self.state.is_interface_set() {
            self.state.update_interface(iface.clone(), listen_port);
        } else {
            self.state.set_interface(iface.clone(), listen_port);
        }

        if self.needs_reset(payload, listen_port) {
            let stopped = self.state.delete_network(network);
            self.stats.inc_resets();
            self.stats.add_torn_down(stopped as u64);
            info!(
                "Network {} reset, {} connections stopped; rebuilding on next update",
                network, stopped
            );
            return Ok(Outcome::Reset);
        }

        self.state.set_relay_status(network, payload.is_relay);
        self.state.set_relayed_status(network, payload.is_relayed);
        self.state.set_ingress_status(network, payload.is_ingress);

        self.update_relay_table(payload);

        let torn_down = self.remove_undesired(payload);
        let desired: HashSet<String> = payload
            .peers
            .iter()
            .filter(|p| payload.is_proxied(&p.public_key))
            .map(|p| p.public_key.clone())
            .collect();
        self.state.set_desired_peers(network, desired);

        let mut outcome = Reconcile {
            torn_down,
            ..Default::default()
        };
        for peer in &payload.peers {
            self.reconcile_peer(payload, &iface, listen_port, peer, &mut outcome);
        }

        self.state.record_listen_port(network, listen_port);
        self.stats.add_torn_down(outcome.torn_down as u64);
        info!(
            "Network {}: {} created, {} torn down, {} bypassed, {} waiting ({} live)",
            network,
            outcome.created,
            outcome.torn_down,
            outcome.bypassed,
            outcome.waiting,
            self.state.peer_count(network)
        );
        Ok(Outcome::Reconciled {
            created: outcome.created,
            torn_down: outcome.torn_down,
            bypassed: outcome.bypassed,
            waiting: outcome.waiting,
        })
    }

    /// A relayed-flag flip or a listen-port change invalidates every binding.
    fn needs_reset(&self, payload: &ProxyPayload, listen_port: u16) -> bool {
        let network = payload.network.as_str();
        if !self.state.network_exists(network) {
            return false;
        }
        let was_relayed = self.state.relayed_status(network);
        if was_relayed != payload.is_relayed {
            info!(
                "Network {} relayed status changed: {} -> {}",
                network, was_relayed, payload.is_relayed
            );
            return true;
        }
        match self.state.network_listen_port(network) {
            Some(prev) if prev != listen_port => {
                info!(
                    "Network {} listen port changed: {} -> {}",
                    network, prev, listen_port
                );
                true
            }
            _ => false,
        }
    }

    /// Rebuild this network's relay routes from `relayed_conf`. A node that
    /// stopped relaying, or a relayed node absent from the payload, loses
    /// its routes.
    fn update_relay_table(&self, payload: &ProxyPayload) {
        let mut entries = Vec::new();
        if payload.is_relay {
            for (relayed_node, conf) in &payload.relayed_conf {
                for peer in &conf.relayed_peers {
                    let Some(endpoint) = peer.endpoint else {
                        debug!("Relayed peer {} has no endpoint", peer.public_key);
                        continue;
                    };
                    entries.push(RelayEntry {
                        network: payload.network.clone(),
                        peer_key: peer.public_key.clone(),
                        relayed_node: relayed_node.clone(),
                        endpoint: self.with_proxy_port(endpoint),
                    });
                }
                match conf.relayed_peer_endpoint {
                    Some(endpoint) => entries.push(RelayEntry {
                        network: payload.network.clone(),
                        peer_key: relayed_node.clone(),
                        relayed_node: relayed_node.clone(),
                        endpoint: self.with_proxy_port(endpoint),
                    }),
                    None => debug!("Relayed node {} has no endpoint", relayed_node),
                }
            }
        }
        let count = entries.len();
        let previous = self.state.replace_relay_routes(&payload.network, entries);
        if previous != count {
            debug!(
                "Relay routes on {}: {} -> {}",
                payload.network, previous, count
            );
        }
    }

    fn with_proxy_port(&self, mut endpoint: SocketAddr) -> SocketAddr {
        endpoint.set_port(self.proxy_port);
        endpoint
    }

    /// Tear down connections and waits whose identity left the payload.
    fn remove_undesired(&self, payload: &ProxyPayload) -> usize {
        let network = payload.network.as_str();
        let mut torn_down = 0;
        for (key, conn) in self.state.network_peers(network) {
            if payload.peer_conf(&key).is_some() {
                continue;
            }
            if conn.is_attached_ext_client() {
                self.state.delete_ext_client_wait(network, &key);
                self.state.delete_ext_client_info(&conn.remote_addr());
            }
            if self.state.remove_peer(network, &key) {
                info!("Peer {} left network {}", key, network);
                torn_down += 1;
            }
        }
        let canceled = self
            .state
            .cancel_ext_client_waits(network, |key| payload.peer_conf(key).is_some());
        if canceled > 0 {
            info!("Canceled {} ext client waits on {}", canceled, network);
        }
        torn_down
    }

    fn reconcile_peer(
        &self,
        payload: &ProxyPayload,
        iface: &Arc<dyn WgInterface>,
        listen_port: u16,
        peer: &PeerConfig,
        outcome: &mut Reconcile,
    ) {
        let network = payload.network.as_str();
        let key = peer.public_key.as_str();
        let attached = payload.is_attached_ext_client(key);

        if !payload.is_proxied(key) {
            if attached {
                debug!("Attached ext client {} not proxied, skipping", key);
                return;
            }
            if self.state.remove_peer(network, key) {
                outcome.torn_down += 1;
            }
            match iface.update_peer(peer) {
                Ok(()) => {
                    outcome.bypassed += 1;
                    self.stats.inc_bypassed();
                    debug!("Peer {} configured without proxy", key);
                }
                Err(e) => {
                    self.stats.inc_setup_failures();
                    warn!("Failed to configure peer {} directly: {:#}", key, e);
                }
            }
            return;
        }

        let plan = PeerPlan::from_payload(payload, peer);
        if let Some(conn) = self.state.peer(network, key) {
            if conn.is_attached_ext_client() {
                return;
            }
            let live = match iface.peer_state(key) {
                Ok(state) => state.endpoint,
                Err(e) => {
                    debug!("No runtime state for peer {}: {}", key, e);
                    None
                }
            };
            match conn.is_stale(&plan, live) {
                Some(reason) => {
                    info!("Peer {} on {}: {}, tearing down", key, network, reason);
                    if self.state.remove_peer(network, key) {
                        outcome.torn_down += 1;
                    }
                }
                None => debug!("Peer {} on {} unchanged", key, network),
            }
            return;
        }

        if attached {
            if self.watcher.spawn(iface.clone(), plan).is_some() {
                outcome.waiting += 1;
            }
            return;
        }
        if plan.endpoint.is_none() {
            warn!("Peer {} on {} has no endpoint, skipping", key, network);
            return;
        }
        match self.builder.establish(iface.as_ref(), listen_port, &plan) {
            Ok(conn) => {
                self.state.insert_peer(conn);
                self.stats.inc_created();
                outcome.created += 1;
            }
            Err(e) => {
                self.stats.inc_setup_failures();
                warn!("Failed to set up proxy for peer {}: {:#}", key, e);
            }
        }
    }
}

#[derive(Default)]
struct Reconcile {
    created: usize,
    torn_down: usize,
    bypassed: usize,
    waiting: usize,
}
