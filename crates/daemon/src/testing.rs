//! Recording doubles for the interface and forwarding-session seams.

use anyhow::{anyhow, bail, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::connection::{ProxyConnector, ProxyRequest};
use crate::payload::PeerConfig;
use crate::wg::{InterfaceProvider, PeerRuntimeState, WgInterface};

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub struct MockInterface {
    name: String,
    listen_port: AtomicU16,
    peers: Mutex<HashMap<String, PeerConfig>>,
    rejected: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    updates: AtomicUsize,
}

impl MockInterface {
    pub fn new(name: &str, listen_port: u16) -> Self {
        Self {
            name: name.to_string(),
            listen_port: AtomicU16::new(listen_port),
            peers: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn reject_peer(&self, key: &str) {
        self.rejected.lock().insert(key.to_string());
    }

    /// Simulate something else rewriting the peer endpoint on the device.
    pub fn set_endpoint(&self, key: &str, endpoint: SocketAddr) {
        let mut peers = self.peers.lock();
        let peer = peers
            .entry(key.to_string())
            .or_insert_with(|| PeerConfig::new(key, None));
        peer.endpoint = Some(endpoint);
    }

    pub fn endpoint_of(&self, key: &str) -> Option<SocketAddr> {
        self.peers.lock().get(key).and_then(|p| p.endpoint)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl WgInterface for MockInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn listen_port(&self) -> Result<u16> {
        Ok(self.listen_port.load(Ordering::SeqCst))
    }

    fn update_peer(&self, peer: &PeerConfig) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) || self.rejected.lock().contains(&peer.public_key) {
            bail!("device rejected peer {}", peer.public_key);
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.peers
            .lock()
            .insert(peer.public_key.clone(), peer.clone());
        Ok(())
    }

    fn peer_state(&self, public_key: &str) -> Result<PeerRuntimeState> {
        let peers = self.peers.lock();
        let peer = peers
            .get(public_key)
            .ok_or_else(|| anyhow!("peer {} not found", public_key))?;
        Ok(PeerRuntimeState {
            endpoint: peer.endpoint,
            ..Default::default()
        })
    }
}

pub struct MockProvider {
    iface: Arc<MockInterface>,
    fail: AtomicBool,
}

impl MockProvider {
    pub fn new(iface: Arc<MockInterface>) -> Arc<Self> {
        Arc::new(Self {
            iface,
            fail: AtomicBool::new(false),
        })
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl InterfaceProvider for MockProvider {
    fn get_interface(&self, name: &str) -> Result<Arc<dyn WgInterface>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("no such device: {}", name);
        }
        let iface: Arc<dyn WgInterface> = self.iface.clone();
        Ok(iface)
    }
}

/// Hands out sequential loopback addresses and remembers every session.
/// `hold` parks connects for one identity until `release`.
pub struct MockConnector {
    next_port: AtomicU16,
    sessions: Mutex<Vec<(ProxyRequest, watch::Receiver<bool>)>>,
    gate: Mutex<Gate>,
    opened: Condvar,
}

#[derive(Default)]
struct Gate {
    held: Option<String>,
    blocked: bool,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(40000),
            sessions: Mutex::new(Vec::new()),
            gate: Mutex::new(Gate::default()),
            opened: Condvar::new(),
        })
    }

    pub fn hold(&self, key: &str) {
        self.gate.lock().held = Some(key.to_string());
    }

    pub fn release(&self) {
        self.gate.lock().held = None;
        self.opened.notify_all();
    }

    /// True while a connect is parked by `hold`.
    pub fn blocked(&self) -> bool {
        self.gate.lock().blocked
    }

    pub fn connects(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn connects_for(&self, key: &str) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|(r, _)| r.public_key == key)
            .count()
    }

    pub fn stopped(&self) -> usize {
        self.sessions.lock().iter().filter(|(_, rx)| *rx.borrow()).count()
    }

    pub fn all_stopped(&self) -> bool {
        self.sessions.lock().iter().all(|(_, rx)| *rx.borrow())
    }

    pub fn last_request(&self) -> Option<ProxyRequest> {
        self.sessions.lock().last().map(|(r, _)| r.clone())
    }
}

impl ProxyConnector for MockConnector {
    fn connect(&self, request: &ProxyRequest, stop: watch::Receiver<bool>) -> Result<SocketAddr> {
        {
            let mut gate = self.gate.lock();
            while gate.held.as_deref() == Some(request.public_key.as_str()) {
                gate.blocked = true;
                self.opened.wait(&mut gate);
            }
            gate.blocked = false;
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().push((request.clone(), stop));
        Ok(SocketAddr::from(([127, 0, 0, 1], port)))
    }
}
