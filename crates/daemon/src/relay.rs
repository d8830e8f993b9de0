//! Relay routing table.
//!
//! Populated when this node relays for other nodes. The forwarding path
//! looks up a peer's identity here to find where traffic addressed to a
//! relayed peer must be re-sent.

use log::debug;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Where a relayed peer can currently be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub network: String,
    pub peer_key: String,
    /// Identity of the relayed node this entry was learned from
    pub relayed_node: String,
    pub endpoint: SocketAddr,
}

#[derive(Debug, Default)]
pub struct RelayTable {
    by_peer: HashMap<String, RelayEntry>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry for `identity`.
    pub fn upsert(&mut self, identity: &str, entry: RelayEntry) {
        debug!(
            "Relay route {} -> {} (via {})",
            identity, entry.endpoint, entry.relayed_node
        );
        self.by_peer.insert(identity.to_string(), entry);
    }

    pub fn get(&self, identity: &str) -> Option<&RelayEntry> {
        self.by_peer.get(identity)
    }

    pub fn remove(&mut self, identity: &str) -> Option<RelayEntry> {
        self.by_peer.remove(identity)
    }

    /// Drop a relayed node and every route learned through it.
    pub fn remove_relayed_node(&mut self, relayed_node: &str) -> usize {
        let before = self.by_peer.len();
        self.by_peer
            .retain(|key, e| key != relayed_node && e.relayed_node != relayed_node);
        before - self.by_peer.len()
    }

    pub fn remove_network(&mut self, network: &str) -> usize {
        let before = self.by_peer.len();
        self.by_peer.retain(|_, e| e.network != network);
        before - self.by_peer.len()
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}
