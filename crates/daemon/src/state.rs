//! Process-wide proxy state.
//!
//! [`GlobalState`] owns per-network settings, the live peer-connection table,
//! the relay table and the external-client wait registry. It does no network
//! I/O. Constructed once at startup and shared by `Arc` with the manager,
//! the external-client watchers and the forwarding path.
//!
//! Locking: one store-wide `RwLock`. Removing a connection and firing its
//! stop signal happen under the write lock; the connection's own mutex is
//! only ever taken after the store lock, never the other way around.

use log::{debug, info};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::connection::{PeerConnection, StopSignal};
use crate::relay::{RelayEntry, RelayTable};
use crate::wg::WgInterface;

pub type PeerMap = HashMap<String, Arc<PeerConnection>>;

/// Per-network settings.
#[derive(Default)]
pub struct NetworkSettings {
    pub is_relay: bool,
    pub is_relayed: bool,
    pub is_ingress: bool,
    /// Interface listen port recorded at the last reconciliation
    pub listen_port: Option<u16>,
    /// Identities wanted by the latest payload
    desired: HashSet<String>,
}

/// A peer whose endpoint is still being learned through NAT traversal.
#[derive(Debug, Clone)]
pub struct ExtClientWait {
    pub id: u64,
    pub network: String,
    pub key: String,
    pub cancel: StopSignal,
    pub notify: mpsc::Sender<Option<SocketAddr>>,
}

/// Resolved external client, keyed by the endpoint it was seen at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtClientInfo {
    pub network: String,
    pub key: String,
}

#[derive(Clone)]
struct InterfaceHandle {
    iface: Arc<dyn WgInterface>,
    listen_port: u16,
}

#[derive(Default)]
struct Inner {
    iface: Option<InterfaceHandle>,
    networks: HashMap<String, NetworkSettings>,
    peers: HashMap<String, PeerMap>,
    relay: RelayTable,
    /// Keyed by (network, identity)
    ext_waits: HashMap<(String, String), ExtClientWait>,
    ext_info: HashMap<SocketAddr, ExtClientInfo>,
}

#[derive(Default)]
pub struct GlobalState {
    inner: RwLock<Inner>,
    next_wait_id: AtomicU64,
}

impl GlobalState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // === Network Settings ===

    pub fn set_relay_status(&self, network: &str, value: bool) {
        self.inner.write().settings_mut(network).is_relay = value;
    }

    pub fn set_relayed_status(&self, network: &str, value: bool) {
        self.inner.write().settings_mut(network).is_relayed = value;
    }

    pub fn set_ingress_status(&self, network: &str, value: bool) {
        self.inner.write().settings_mut(network).is_ingress = value;
    }

    pub fn relay_status(&self, network: &str) -> bool {
        self.read_settings(network, |s| s.is_relay)
    }

    pub fn relayed_status(&self, network: &str) -> bool {
        self.read_settings(network, |s| s.is_relayed)
    }

    pub fn ingress_status(&self, network: &str) -> bool {
        self.read_settings(network, |s| s.is_ingress)
    }

    pub fn network_exists(&self, network: &str) -> bool {
        self.inner.read().networks.contains_key(network)
    }

    pub fn networks(&self) -> Vec<String> {
        self.inner.read().networks.keys().cloned().collect()
    }

    pub fn record_listen_port(&self, network: &str, port: u16) {
        self.inner.write().settings_mut(network).listen_port = Some(port);
    }

    pub fn network_listen_port(&self, network: &str) -> Option<u16> {
        self.inner
            .read()
            .networks
            .get(network)
            .and_then(|s| s.listen_port)
    }

    /// Replace the set of identities the latest payload wants for `network`.
    pub fn set_desired_peers(&self, network: &str, keys: HashSet<String>) {
        self.inner.write().settings_mut(network).desired = keys;
    }

    // === Interface ===

    pub fn set_interface(&self, iface: Arc<dyn WgInterface>, listen_port: u16) {
        self.inner.write().iface = Some(InterfaceHandle { iface, listen_port });
    }

    pub fn update_interface(&self, iface: Arc<dyn WgInterface>, listen_port: u16) {
        let mut inner = self.inner.write();
        if let Some(old) = &inner.iface {
            if old.listen_port != listen_port {
                info!(
                    "Interface {} listen port {} -> {}",
                    iface.name(),
                    old.listen_port,
                    listen_port
                );
            }
        }
        inner.iface = Some(InterfaceHandle { iface, listen_port });
    }

    pub fn is_interface_set(&self) -> bool {
        self.inner.read().iface.is_some()
    }

    pub fn interface(&self) -> Option<Arc<dyn WgInterface>> {
        self.inner.read().iface.as_ref().map(|h| h.iface.clone())
    }

    pub fn interface_listen_port(&self) -> Option<u16> {
        self.inner.read().iface.as_ref().map(|h| h.listen_port)
    }

    // === Peer Connections ===

    /// Snapshot of the connection table. Changing the returned map does not
    /// touch the store.
    pub fn network_peers(&self, network: &str) -> PeerMap {
        self.inner
            .read()
            .peers
            .get(network)
            .cloned()
            .unwrap_or_default()
    }

    pub fn peer(&self, network: &str, key: &str) -> Option<Arc<PeerConnection>> {
        self.inner
            .read()
            .peers
            .get(network)
            .and_then(|m| m.get(key))
            .cloned()
    }

    pub fn peer_count(&self, network: &str) -> usize {
        self.inner.read().peers.get(network).map_or(0, |m| m.len())
    }

    /// Atomically replace the table for `network`. Connections that are not
    /// carried over into the new table are stopped.
    pub fn update_network_peers(&self, network: &str, peers: PeerMap) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.peers.get(network) {
            for (key, conn) in old {
                let kept = peers.get(key).is_some_and(|c| Arc::ptr_eq(c, conn));
                if !kept {
                    conn.stop();
                }
            }
        }
        inner.peers.insert(network.to_string(), peers);
    }

    /// Insert a connection, stopping any different connection it replaces.
    pub fn insert_peer(&self, conn: Arc<PeerConnection>) {
        let mut inner = self.inner.write();
        let table = inner.peers.entry(conn.network().to_string()).or_default();
        if let Some(old) = table.insert(conn.key().to_string(), conn.clone()) {
            if !Arc::ptr_eq(&old, &conn) {
                old.stop();
            }
        }
    }

    /// Commit a connection resolved by an external-client watcher. Under one
    /// write lock: the watcher's wait (matched by `wait_id`) is consumed, and
    /// the connection is inserted only if its identity is still wanted and
    /// not already connected. Returns false without inserting otherwise.
    pub fn commit_resolved_peer(&self, conn: Arc<PeerConnection>, wait_id: u64) -> bool {
        let mut inner = self.inner.write();
        let wait_key = (conn.network().to_string(), conn.key().to_string());
        if !inner.ext_waits.get(&wait_key).is_some_and(|w| w.id == wait_id) {
            return false;
        }
        inner.ext_waits.remove(&wait_key);

        let wanted = inner
            .networks
            .get(conn.network())
            .is_some_and(|s| s.desired.contains(conn.key()));
        if !wanted {
            return false;
        }
        let table = inner.peers.entry(conn.network().to_string()).or_default();
        if table.contains_key(conn.key()) {
            return false;
        }
        table.insert(conn.key().to_string(), conn);
        true
    }

    /// Stop and remove one connection.
    pub fn remove_peer(&self, network: &str, key: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.peers.get_mut(network).and_then(|m| m.remove(key));
        match removed {
            Some(conn) => {
                conn.stop();
                debug!("Removed peer {} from {}", key, network);
                true
            }
            None => false,
        }
    }

    /// Stop and remove every connection of `network`.
    pub fn delete_network_peers(&self, network: &str) -> usize {
        let mut inner = self.inner.write();
        match inner.peers.remove(network) {
            Some(table) => {
                for conn in table.values() {
                    conn.stop();
                }
                table.len()
            }
            None => 0,
        }
    }

    /// Full teardown of a network: connections, settings, relay routes,
    /// pending external-client waits and resolved external-client records.
    pub fn delete_network(&self, network: &str) -> usize {
        let mut inner = self.inner.write();
        let stopped = match inner.peers.remove(network) {
            Some(table) => {
                for conn in table.values() {
                    conn.stop();
                }
                table.len()
            }
            None => 0,
        };
        inner.networks.remove(network);
        inner.relay.remove_network(network);
        inner.ext_waits.retain(|(net, _), w| {
            if net == network {
                w.cancel.stop();
                false
            } else {
                true
            }
        });
        inner.ext_info.retain(|_, i| i.network != network);
        stopped
    }

    // === Relay Table ===

    pub fn save_relayed_peer(&self, identity: &str, entry: RelayEntry) {
        self.inner.write().relay.upsert(identity, entry);
    }

    /// Remove a relayed node together with every route learned through it.
    pub fn delete_relayed_peer(&self, identity: &str) -> usize {
        self.inner.write().relay.remove_relayed_node(identity)
    }

    /// Replace every route of `network` with `entries` under one lock.
    /// Returns the number of routes the network had before.
    pub fn replace_relay_routes(&self, network: &str, entries: Vec<RelayEntry>) -> usize {
        let mut inner = self.inner.write();
        let previous = inner.relay.remove_network(network);
        for entry in entries.into_iter().filter(|e| e.network == network) {
            let identity = entry.peer_key.clone();
            inner.relay.upsert(&identity, entry);
        }
        previous
    }

    pub fn relay_entry(&self, identity: &str) -> Option<RelayEntry> {
        self.inner.read().relay.get(identity).cloned()
    }

    pub fn relay_table_len(&self) -> usize {
        self.inner.read().relay.len()
    }

    // === External Client Waits ===

    pub fn next_wait_id(&self) -> u64 {
        self.next_wait_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a wait. Refused when the identity already has a wait or a
    /// live connection on the same network, so at most one watcher exists
    /// per identity and network.
    pub fn save_ext_client_wait(&self, wait: ExtClientWait) -> bool {
        let mut inner = self.inner.write();
        let connected = inner
            .peers
            .get(&wait.network)
            .is_some_and(|m| m.contains_key(&wait.key));
        let wait_key = (wait.network.clone(), wait.key.clone());
        if connected || inner.ext_waits.contains_key(&wait_key) {
            return false;
        }
        inner.ext_waits.insert(wait_key, wait);
        true
    }

    /// Cancel and remove the wait for `key` on `network`.
    pub fn delete_ext_client_wait(&self, network: &str, key: &str) -> bool {
        let wait_key = (network.to_string(), key.to_string());
        match self.inner.write().ext_waits.remove(&wait_key) {
            Some(wait) => {
                wait.cancel.stop();
                true
            }
            None => false,
        }
    }

    /// Remove a wait on behalf of its own watcher, without cancelling it.
    /// Only succeeds if the registered wait carries `id`.
    pub fn withdraw_ext_client_wait(&self, network: &str, key: &str, id: u64) -> bool {
        let mut inner = self.inner.write();
        let wait_key = (network.to_string(), key.to_string());
        if inner.ext_waits.get(&wait_key).is_some_and(|w| w.id == id) {
            inner.ext_waits.remove(&wait_key);
            true
        } else {
            false
        }
    }

    pub fn has_ext_client_wait(&self, network: &str, key: &str) -> bool {
        self.inner
            .read()
            .ext_waits
            .contains_key(&(network.to_string(), key.to_string()))
    }

    /// Cancel the waits of `network` whose identity `keep` rejects.
    pub fn cancel_ext_client_waits<F>(&self, network: &str, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut inner = self.inner.write();
        let before = inner.ext_waits.len();
        inner.ext_waits.retain(|(net, key), w| {
            if net == network && !keep(key) {
                w.cancel.stop();
                false
            } else {
                true
            }
        });
        before - inner.ext_waits.len()
    }

    pub fn cancel_all_ext_client_waits(&self) -> usize {
        let mut inner = self.inner.write();
        for wait in inner.ext_waits.values() {
            wait.cancel.stop();
        }
        let count = inner.ext_waits.len();
        inner.ext_waits.clear();
        count
    }

    /// Hand a learned endpoint to the watcher waiting on `key` in `network`.
    /// Returns false when nobody waits or the watcher's queue is full.
    pub fn notify_ext_client(&self, network: &str, key: &str, endpoint: Option<SocketAddr>) -> bool {
        let wait_key = (network.to_string(), key.to_string());
        let notify = match self.inner.read().ext_waits.get(&wait_key) {
            Some(wait) => wait.notify.clone(),
            None => return false,
        };
        match notify.try_send(endpoint) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropped endpoint update for {}: {}", key, e);
                false
            }
        }
    }

    pub fn save_ext_client_info(&self, endpoint: SocketAddr, info: ExtClientInfo) {
        self.inner.write().ext_info.insert(endpoint, info);
    }

    pub fn delete_ext_client_info(&self, endpoint: &SocketAddr) -> bool {
        self.inner.write().ext_info.remove(endpoint).is_some()
    }

    pub fn ext_client_info(&self, endpoint: &SocketAddr) -> Option<ExtClientInfo> {
        self.inner.read().ext_info.get(endpoint).cloned()
    }

    fn read_settings<T: Default>(&self, network: &str, f: impl Fn(&NetworkSettings) -> T) -> T {
        self.inner
            .read()
            .networks
            .get(network)
            .map(f)
            .unwrap_or_default()
    }
}

impl Inner {
    fn settings_mut(&mut self, network: &str) -> &mut NetworkSettings {
        self.networks.entry(network.to_string()).or_default()
    }
}
