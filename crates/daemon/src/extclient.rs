//! Watchers for attached external clients.
//!
//! An attached external client has no known endpoint when it first shows up
//! in a payload. One watcher task per identity waits until the endpoint is
//! learned (see [`GlobalState::notify_ext_client`]) and then creates the
//! connection itself, outside the reconciliation loop.

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionBuilder, PeerPlan, StopSignal};
use crate::metrics::ProxyStats;
use crate::state::{ExtClientInfo, ExtClientWait, GlobalState};
use crate::wg::WgInterface;

/// Lifecycle of one watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Waiting,
    /// Endpoint learned and connection committed.
    Resolved(SocketAddr),
    /// Nothing was created.
    Canceled,
}

#[derive(Clone)]
pub struct ExtClientWatcher {
    state: Arc<GlobalState>,
    builder: ConnectionBuilder,
    stats: Arc<ProxyStats>,
    queue: usize,
}

impl ExtClientWatcher {
    pub fn new(
        state: Arc<GlobalState>,
        builder: ConnectionBuilder,
        stats: Arc<ProxyStats>,
        queue: usize,
    ) -> Self {
        Self {
            state,
            builder,
            stats,
            queue: queue.max(1),
        }
    }

    /// Register a wait for `plan` and start its watcher. Returns `None` if
    /// the identity is already waiting or already connected.
    pub fn spawn(
        &self,
        iface: Arc<dyn WgInterface>,
        plan: PeerPlan,
    ) -> Option<JoinHandle<WatchState>> {
        let (tx, rx) = mpsc::channel(self.queue);
        let cancel = StopSignal::new();
        let wait = ExtClientWait {
            id: self.state.next_wait_id(),
            network: plan.network.clone(),
            key: plan.key().to_string(),
            cancel: cancel.clone(),
            notify: tx,
        };
        let id = wait.id;
        if !self.state.save_ext_client_wait(wait) {
            debug!("Ext client {} already waiting or connected", plan.key());
            return None;
        }

        self.stats.inc_ext_waits();
        info!(
            "Waiting for endpoint of ext client {} on {}",
            plan.key(),
            plan.network
        );
        let watcher = self.clone();
        Some(tokio::spawn(async move {
            watcher.watch(iface, plan, id, cancel, rx).await
        }))
    }

    /// Current state of `key` as seen from the store.
    pub fn status(&self, network: &str, key: &str) -> WatchState {
        if self.state.has_ext_client_wait(network, key) {
            return WatchState::Waiting;
        }
        match self.state.peer(network, key) {
            Some(conn) => WatchState::Resolved(conn.remote_addr()),
            None => WatchState::Canceled,
        }
    }

    /// The wait stays registered until the commit consumes it, so no second
    /// watcher can start while the session is being bound. The interface is
    /// only repointed after a successful commit.
    async fn watch(
        self,
        iface: Arc<dyn WgInterface>,
        mut plan: PeerPlan,
        id: u64,
        cancel: StopSignal,
        mut rx: mpsc::Receiver<Option<SocketAddr>>,
    ) -> WatchState {
        let endpoint = loop {
            tokio::select! {
                biased;
                _ = cancel.stopped() => {
                    return self.canceled(&plan, "canceled");
                }
                update = rx.recv() => match update {
                    Some(Some(endpoint)) => break endpoint,
                    Some(None) => continue,
                    None => return self.canceled(&plan, "notification channel closed"),
                },
            }
        };

        plan.endpoint = Some(endpoint);
        let listen_port = match iface.listen_port() {
            Ok(port) => port,
            Err(e) => {
                warn!("Ext client {}: failed to read listen port: {}", plan.key(), e);
                return self.setup_failed(&plan, id);
            }
        };
        let conn = match self.builder.bind(listen_port, &plan) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Ext client {}: {:#}", plan.key(), e);
                return self.setup_failed(&plan, id);
            }
        };

        // Consumes the wait. Fails if it was canceled meanwhile.
        if !self.state.commit_resolved_peer(conn.clone(), id) {
            conn.stop();
            info!(
                "Ext client {} no longer wanted on {}, dropping resolved endpoint",
                plan.key(),
                plan.network
            );
            return WatchState::Canceled;
        }

        if let Err(e) = self.builder.attach(iface.as_ref(), &conn, &plan) {
            warn!("Ext client {}: {:#}", plan.key(), e);
            self.state.remove_peer(&plan.network, plan.key());
            self.stats.inc_setup_failures();
            return WatchState::Canceled;
        }

        self.state.save_ext_client_info(
            endpoint,
            ExtClientInfo {
                network: plan.network.clone(),
                key: plan.key().to_string(),
            },
        );
        self.stats.inc_created();
        self.stats.inc_ext_resolved();
        info!(
            "Ext client {} resolved at {} on {}",
            plan.key(),
            endpoint,
            plan.network
        );
        WatchState::Resolved(endpoint)
    }

    /// Give up before anything was committed; the next payload may start
    /// a new watcher.
    fn setup_failed(&self, plan: &PeerPlan, id: u64) -> WatchState {
        self.state.withdraw_ext_client_wait(&plan.network, plan.key(), id);
        self.stats.inc_setup_failures();
        WatchState::Canceled
    }

    fn canceled(&self, plan: &PeerPlan, reason: &str) -> WatchState {
        self.stats.inc_ext_canceled();
        debug!("Ext client {} watcher stopped: {}", plan.key(), reason);
        WatchState::Canceled
    }
}
