use anyhow::{Context, Result};
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

// ============================================================================
// Per-Peer Metrics
// ============================================================================

/// Latest traffic and latency sample for one peer. No history is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "LastRecordedLatency")]
    pub last_recorded_latency: u64,
    #[serde(rename = "ConnectionStatus")]
    pub connection_status: bool,
    #[serde(rename = "TrafficSent")]
    pub traffic_sent: f64,
    #[serde(rename = "TrafficRecieved")]
    pub traffic_received: f64,
}

type NetworkMetrics = HashMap<String, HashMap<String, Metric>>;

/// Process-wide (network, peer) -> [`Metric`] map.
///
/// Snapshots are written to disk periodically on a best-effort basis: a
/// failed write is ignored and anything since the last snapshot is lost on
/// crash.
#[derive(Debug, Default)]
pub struct MetricsStore {
    networks: RwLock<NetworkMetrics>,
}

impl MetricsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Latest sample, or a zeroed one. Creates the network's map on first use.
    pub fn get(&self, network: &str, peer: &str) -> Metric {
        if let Some(peers) = self.networks.read().get(network) {
            return peers.get(peer).copied().unwrap_or_default();
        }
        self.networks
            .write()
            .entry(network.to_string())
            .or_default();
        Metric::default()
    }

    /// Overwrite the sample for a peer.
    pub fn update(&self, network: &str, peer: &str, metric: Metric) {
        self.networks
            .write()
            .entry(network.to_string())
            .or_default()
            .insert(peer.to_string(), metric);
    }

    /// Add traffic counters and mark the peer up, in one step.
    pub fn record_traffic(&self, network: &str, peer: &str, sent: u64, received: u64) {
        let mut networks = self.networks.write();
        let metric = networks
            .entry(network.to_string())
            .or_default()
            .entry(peer.to_string())
            .or_default();
        metric.traffic_sent += sent as f64;
        metric.traffic_received += received as f64;
        metric.connection_status = true;
    }

    pub fn set_connection_status(&self, network: &str, peer: &str, up: bool) {
        let mut metric = self.get(network, peer);
        metric.connection_status = up;
        self.update(network, peer, metric);
    }

    pub fn has_network(&self, network: &str) -> bool {
        self.networks.read().contains_key(network)
    }

    pub fn to_json(&self) -> Result<String> {
        let networks = self.networks.read();
        serde_json::to_string_pretty(&*networks).context("Failed to serialize metrics")
    }

    /// Write the whole store to `path`, replacing the previous snapshot.
    pub async fn flush(&self, path: &Path) -> Result<()> {
        let data = self.to_json()?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path, data)
            .await
            .with_context(|| format!("Failed to write metrics to {:?}", path))
    }

    /// Flush every `period` until `shutdown` flips.
    pub fn spawn_flush(
        self: &Arc<Self>,
        path: PathBuf,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Metrics snapshots every {:?} to {:?}", period, path);
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush(&path).await {
                            debug!("Metrics flush skipped: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Per-peer gauges in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let networks = self.networks.read();
        let mut out = String::from(
            "# HELP meshproxy_peer_latency Last recorded peer latency\n\
             # TYPE meshproxy_peer_latency gauge\n\
             # HELP meshproxy_peer_up Peer connection status\n\
             # TYPE meshproxy_peer_up gauge\n\
             # HELP meshproxy_peer_traffic_sent Bytes sent to peer\n\
             # TYPE meshproxy_peer_traffic_sent gauge\n\
             # HELP meshproxy_peer_traffic_received Bytes received from peer\n\
             # TYPE meshproxy_peer_traffic_received gauge\n",
        );
        for (network, peers) in networks.iter() {
            for (peer, m) in peers {
                let labels = format!("network=\"{}\",peer=\"{}\"", network, peer);
                let _ = writeln!(out, "meshproxy_peer_latency{{{}}} {}", labels, m.last_recorded_latency);
                let _ = writeln!(out, "meshproxy_peer_up{{{}}} {}", labels, m.connection_status as u8);
                let _ = writeln!(out, "meshproxy_peer_traffic_sent{{{}}} {}", labels, m.traffic_sent);
                let _ = writeln!(out, "meshproxy_peer_traffic_received{{{}}} {}", labels, m.traffic_received);
            }
        }
        out
    }
}

// ============================================================================
// Daemon Counters
// ============================================================================

/// Counters for the reconciliation engine.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub payloads_processed: AtomicU64,
    pub payloads_rejected: AtomicU64,
    pub connections_created: AtomicU64,
    pub connections_torn_down: AtomicU64,
    pub network_resets: AtomicU64,
    /// Peers pushed straight to the interface with proxying off
    pub peers_bypassed: AtomicU64,
    /// Per-peer failures skipped during reconciliation
    pub peer_setup_failures: AtomicU64,
    pub ext_client_waits_started: AtomicU64,
    pub ext_client_resolved: AtomicU64,
    pub ext_client_canceled: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_processed(&self) {
        self.payloads_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.payloads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_torn_down(&self, count: u64) {
        self.connections_torn_down.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_resets(&self) {
        self.network_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bypassed(&self) {
        self.peers_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_setup_failures(&self) {
        self.peer_setup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ext_waits(&self) {
        self.ext_client_waits_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ext_resolved(&self) {
        self.ext_client_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ext_canceled(&self) {
        self.ext_client_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn created(&self) -> u64 {
        self.connections_created.load(Ordering::Relaxed)
    }

    pub fn torn_down(&self) -> u64 {
        self.connections_torn_down.load(Ordering::Relaxed)
    }

    /// Format counters in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP meshproxy_payloads_processed_total Desired-state payloads processed\n\
             # TYPE meshproxy_payloads_processed_total counter\n\
             meshproxy_payloads_processed_total {}\n\
             # HELP meshproxy_payloads_rejected_total Payloads rejected by validation\n\
             # TYPE meshproxy_payloads_rejected_total counter\n\
             meshproxy_payloads_rejected_total {}\n\
             # HELP meshproxy_connections_created_total Peer connections created\n\
             # TYPE meshproxy_connections_created_total counter\n\
             meshproxy_connections_created_total {}\n\
             # HELP meshproxy_connections_torn_down_total Peer connections torn down\n\
             # TYPE meshproxy_connections_torn_down_total counter\n\
             meshproxy_connections_torn_down_total {}\n\
             # HELP meshproxy_network_resets_total Full network resets\n\
             # TYPE meshproxy_network_resets_total counter\n\
             meshproxy_network_resets_total {}\n\
             # HELP meshproxy_peers_bypassed_total Peers configured without proxy\n\
             # TYPE meshproxy_peers_bypassed_total counter\n\
             meshproxy_peers_bypassed_total {}\n\
             # HELP meshproxy_peer_setup_failures_total Peers skipped after a setup failure\n\
             # TYPE meshproxy_peer_setup_failures_total counter\n\
             meshproxy_peer_setup_failures_total {}\n\
             # HELP meshproxy_ext_client_waits_total External-client watchers started\n\
             # TYPE meshproxy_ext_client_waits_total counter\n\
             meshproxy_ext_client_waits_total {}\n\
             # HELP meshproxy_ext_client_resolved_total External clients resolved\n\
             # TYPE meshproxy_ext_client_resolved_total counter\n\
             meshproxy_ext_client_resolved_total {}\n\
             # HELP meshproxy_ext_client_canceled_total External-client watchers canceled\n\
             # TYPE meshproxy_ext_client_canceled_total counter\n\
             meshproxy_ext_client_canceled_total {}\n",
            self.payloads_processed.load(Ordering::Relaxed),
            self.payloads_rejected.load(Ordering::Relaxed),
            self.connections_created.load(Ordering::Relaxed),
            self.connections_torn_down.load(Ordering::Relaxed),
            self.network_resets.load(Ordering::Relaxed),
            self.peers_bypassed.load(Ordering::Relaxed),
            self.peer_setup_failures.load(Ordering::Relaxed),
            self.ext_client_waits_started.load(Ordering::Relaxed),
            self.ext_client_resolved.load(Ordering::Relaxed),
            self.ext_client_canceled.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(latency: u64, up: bool) -> Metric {
        Metric {
            last_recorded_latency: latency,
            connection_status: up,
            traffic_sent: 10.0,
            traffic_received: 20.0,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("meshproxy-test-{}-{}", std::process::id(), nanos))
            .join(name)
    }

    #[test]
    fn test_get_missing_returns_zero_and_creates_network() {
        let store = MetricsStore::new();
        assert!(!store.has_network("net1"));

        assert_eq!(store.get("net1", "peer-a"), Metric::default());
        assert!(store.has_network("net1"));
    }

    #[test]
    fn test_update_overwrites() {
        let store = MetricsStore::new();
        let m2 = sample(42, false);

        store.update("net1", "peer-a", sample(7, true));
        store.update("net1", "peer-a", m2);

        assert_eq!(store.get("net1", "peer-a"), m2);
    }

    #[test]
    fn test_record_traffic_accumulates() {
        let store = MetricsStore::new();
        store.record_traffic("net1", "peer-a", 100, 0);
        store.record_traffic("net1", "peer-a", 50, 25);

        let m = store.get("net1", "peer-a");
        assert_eq!(m.traffic_sent, 150.0);
        assert_eq!(m.traffic_received, 25.0);
        assert!(m.connection_status);

        store.set_connection_status("net1", "peer-a", false);
        assert!(!store.get("net1", "peer-a").connection_status);
    }

    #[test]
    fn test_json_field_names() {
        let store = MetricsStore::new();
        store.update("net1", "peer-a", sample(5, true));

        let json: serde_json::Value = serde_json::from_str(&store.to_json().unwrap()).unwrap();
        let m = &json["net1"]["peer-a"];
        assert_eq!(m["LastRecordedLatency"], 5);
        assert_eq!(m["ConnectionStatus"], true);
        assert_eq!(m["TrafficSent"], 10.0);
        assert_eq!(m["TrafficRecieved"], 20.0);
    }

    #[tokio::test]
    async fn test_flush_writes_snapshot() {
        let store = MetricsStore::new();
        store.update("net1", "peer-a", sample(5, true));
        let path = temp_path("metrics.json");

        store.flush(&path).await.unwrap();
        store.update("net1", "peer-a", sample(9, true));
        store.flush(&path).await.unwrap();

        let data = std::fs::read_to_string(&path).unwrap();
        let decoded: NetworkMetrics = serde_json::from_str(&data).unwrap();
        assert_eq!(decoded["net1"]["peer-a"].last_recorded_latency, 9);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_periodic_flush_stops_on_shutdown() {
        let store = MetricsStore::new();
        store.update("net1", "peer-a", sample(5, true));
        let path = temp_path("metrics.json");
        let (tx, rx) = watch::channel(false);

        let handle = store.spawn_flush(path.clone(), Duration::from_millis(20), rx);
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_stats_prometheus_output() {
        let stats = ProxyStats::new();
        stats.inc_created();
        stats.inc_created();
        stats.add_torn_down(1);
        stats.inc_rejected();

        let output = stats.to_prometheus();
        assert!(output.contains("meshproxy_connections_created_total 2"));
        assert!(output.contains("meshproxy_connections_torn_down_total 1"));
        assert!(output.contains("meshproxy_payloads_rejected_total 1"));
    }

    #[test]
    fn test_peer_gauges() {
        let store = MetricsStore::new();
        store.update("net1", "peer-a", sample(5, true));

        let output = store.to_prometheus();
        assert!(output.contains("meshproxy_peer_latency{network=\"net1\",peer=\"peer-a\"} 5"));
        assert!(output.contains("meshproxy_peer_up{network=\"net1\",peer=\"peer-a\"} 1"));
    }
}
