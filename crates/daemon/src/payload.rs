//! Desired-state payloads pushed by the control plane.
//!
//! A payload describes the complete wanted peer and relay configuration for
//! one network. The manager treats it as the reconciliation target; nothing
//! in here touches live state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::PayloadError;

/// What the control plane wants done with a network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyAction {
    #[default]
    #[serde(rename = "ADD_NETWORK_TO_PROXY")]
    AddNetwork,
    #[serde(rename = "DELETE_NETWORK_FROM_PROXY")]
    DeleteNetwork,
}

/// WireGuard peer descriptor as delivered by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: String,
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub persistent_keepalive: Option<u32>,
}

impl PeerConfig {
    pub fn new(public_key: impl Into<String>, endpoint: Option<SocketAddr>) -> Self {
        Self {
            public_key: public_key.into(),
            endpoint,
            ..Default::default()
        }
    }
}

/// Per-peer attributes, keyed by public key in [`ProxyPayload::peer_map`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConf {
    pub is_ext_client: bool,
    pub address: String,
    pub is_attached_ext_client: bool,
    pub ingress_gateway_endpoint: Option<SocketAddr>,
    pub is_relayed: bool,
    pub relayed_to: Option<SocketAddr>,
    /// Gates whether the peer is proxied at all
    pub proxy: bool,
}

/// A node this node relays for, along with that node's own peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayedConf {
    pub relayed_peer_endpoint: Option<SocketAddr>,
    pub relayed_peer_pub_key: String,
    pub relayed_peers: Vec<PeerConfig>,
}

/// One reconciliation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPayload {
    pub action: ProxyAction,
    pub interface_name: String,
    pub network: String,
    pub wg_addr: String,
    pub peers: Vec<PeerConfig>,
    pub peer_map: HashMap<String, PeerConf>,
    pub is_relayed: bool,
    pub is_ingress: bool,
    pub is_relay: bool,
    pub relayed_to: Option<SocketAddr>,
    pub relayed_conf: HashMap<String, RelayedConf>,
}

impl ProxyPayload {
    /// Decode a payload from its JSON wire form.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Failed to decode proxy payload")
    }

    /// Reject payloads that cannot be reconciled.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.interface_name.is_empty() {
            return Err(PayloadError::EmptyInterface);
        }
        if self.network.is_empty() {
            return Err(PayloadError::EmptyNetwork);
        }
        if self.peers.is_empty() {
            return Err(PayloadError::NoPeers);
        }
        Ok(())
    }

    pub fn peer_conf(&self, key: &str) -> Option<&PeerConf> {
        self.peer_map.get(key)
    }

    /// An identity without attributes is treated as proxy-disabled.
    pub fn is_proxied(&self, key: &str) -> bool {
        self.peer_conf(key).map(|c| c.proxy).unwrap_or(false)
    }

    pub fn is_attached_ext_client(&self, key: &str) -> bool {
        self.peer_conf(key)
            .map(|c| c.is_attached_ext_client)
            .unwrap_or(false)
    }

    /// Relay flag and relay target for a peer. When this node is itself
    /// relayed, every proxied peer goes through the node's relay.
    pub fn effective_relay(&self, conf: Option<&PeerConf>) -> (bool, Option<SocketAddr>) {
        if self.is_relayed {
            return (true, self.relayed_to);
        }
        conf.map(|c| (c.is_relayed, c.relayed_to))
            .unwrap_or((false, None))
    }

    /// Address the proxy should reach the peer at. Plain external clients are
    /// reached through their ingress gateway.
    pub fn dial_endpoint(&self, peer: &PeerConfig) -> Option<SocketAddr> {
        match self.peer_conf(&peer.public_key) {
            Some(conf) if conf.is_ext_client && !conf.is_attached_ext_client => {
                conf.ingress_gateway_endpoint
            }
            _ => peer.endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "action": "ADD_NETWORK_TO_PROXY",
        "interface_name": "nm-net1",
        "network": "net1",
        "wg_addr": "10.10.0.1",
        "peers": [
            {"public_key": "peer-a", "endpoint": "203.0.113.5:51820", "allowed_ips": ["10.10.0.2/32"]},
            {"public_key": "peer-b", "endpoint": null}
        ],
        "peer_map": {
            "peer-a": {"proxy": true, "address": "10.10.0.2"},
            "peer-b": {"is_ext_client": true, "ingress_gateway_endpoint": "198.51.100.7:51820", "proxy": true}
        },
        "is_relayed": false,
        "is_ingress": true,
        "is_relay": true,
        "relayed_to": null,
        "relayed_conf": {
            "node-r": {
                "relayed_peer_endpoint": "192.0.2.9:51820",
                "relayed_peer_pub_key": "node-r",
                "relayed_peers": [{"public_key": "peer-a", "endpoint": "203.0.113.5:51820"}]
            }
        }
    }"#;

    #[test]
    fn test_decode_wire_payload() {
        let payload = ProxyPayload::from_json(PAYLOAD.as_bytes()).unwrap();

        assert_eq!(payload.action, ProxyAction::AddNetwork);
        assert_eq!(payload.peers.len(), 2);
        assert_eq!(payload.peers[1].endpoint, None);
        assert!(payload.is_proxied("peer-a"));
        assert!(payload.is_ingress);
        assert_eq!(payload.relayed_conf["node-r"].relayed_peers.len(), 1);
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_delete_action_name() {
        let action: ProxyAction = serde_json::from_str("\"DELETE_NETWORK_FROM_PROXY\"").unwrap();
        assert_eq!(action, ProxyAction::DeleteNetwork);
    }

    #[test]
    fn test_validation_order() {
        let mut payload = ProxyPayload::default();
        assert_eq!(payload.validate(), Err(PayloadError::EmptyInterface));

        payload.interface_name = "nm-net1".into();
        assert_eq!(payload.validate(), Err(PayloadError::EmptyNetwork));

        payload.network = "net1".into();
        assert_eq!(payload.validate(), Err(PayloadError::NoPeers));
    }

    #[test]
    fn test_unknown_peer_is_not_proxied() {
        let payload = ProxyPayload::from_json(PAYLOAD.as_bytes()).unwrap();
        assert!(!payload.is_proxied("stranger"));
        assert!(!payload.is_attached_ext_client("stranger"));
    }

    #[test]
    fn test_ext_client_dials_ingress_gateway() {
        let payload = ProxyPayload::from_json(PAYLOAD.as_bytes()).unwrap();
        let ingress: SocketAddr = "198.51.100.7:51820".parse().unwrap();

        assert_eq!(payload.dial_endpoint(&payload.peers[1]), Some(ingress));
        assert_eq!(payload.dial_endpoint(&payload.peers[0]), payload.peers[0].endpoint);
    }

    #[test]
    fn test_node_relay_overrides_peer_relay() {
        let mut payload = ProxyPayload::from_json(PAYLOAD.as_bytes()).unwrap();
        let relay: SocketAddr = "192.0.2.1:51722".parse().unwrap();
        let conf = payload.peer_conf("peer-a").cloned();

        assert_eq!(payload.effective_relay(conf.as_ref()), (false, None));

        payload.is_relayed = true;
        payload.relayed_to = Some(relay);
        assert_eq!(payload.effective_relay(conf.as_ref()), (true, Some(relay)));
    }
}
