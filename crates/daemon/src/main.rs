use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use meshproxy::{
    config::{self, StunConfig},
    http,
    manager::ProxyManager,
    metrics::{MetricsStore, ProxyStats},
    payload::ProxyPayload,
    proxy::UdpProxyConnector,
    state::GlobalState,
    stun::{self, HostInfo},
    wg::{CliWgProvider, InterfaceProvider},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[command(
    name = "meshproxy",
    version,
    about = "Mesh proxy daemon - reconciles peer proxy sessions against control-plane state",
    long_about = "Mesh proxy daemon\n\n\
        Reads desired-state payloads (one JSON object per line) and keeps a\n\
        per-peer UDP proxy session for every proxied WireGuard peer.\n\n\
        Examples:\n  \
          # Read payloads from stdin\n  \
          meshproxy --interface nm-mesh\n\n  \
          # Replay payloads from a file and expose metrics\n  \
          meshproxy --payloads updates.jsonl --metrics-port 9100"
)]
struct Args {
    /// Path to config file
    #[arg(long, short = 'C')]
    config: Option<PathBuf>,

    /// WireGuard interface to check at startup
    #[arg(long, short = 'i')]
    interface: Option<String>,

    /// File with newline-delimited JSON payloads (stdin when omitted)
    #[arg(long, short = 'p')]
    payloads: Option<PathBuf>,

    /// STUN server host used for address discovery
    #[arg(long)]
    stun_server: Option<String>,

    /// STUN server port
    #[arg(long)]
    stun_port: Option<u16>,

    /// Port for the Prometheus metrics endpoint
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn load_config(args: &Args) -> (config::Config, Option<anyhow::Error>) {
    match &args.config {
        Some(path) => match config::Config::load(path) {
            Ok(config) => (config, None),
            Err(e) => (config::Config::default(), Some(e)),
        },
        None => (config::Config::load_or_default(), None),
    }
}

fn stun_candidates(config: &StunConfig) -> Vec<(String, u16)> {
    match &config.server {
        Some(server) => vec![(server.clone(), config.port)],
        None => stun::STUN_SERVERS
            .iter()
            .filter_map(|s| {
                let (host, port) = s.rsplit_once(':')?;
                Some((host.to_string(), port.parse().ok()?))
            })
            .collect(),
    }
}

async fn discover_host(config: &StunConfig) -> Option<HostInfo> {
    for (host, port) in stun_candidates(config) {
        match stun::discover_host_info(&host, port).await {
            Ok(info) => return Some(info),
            Err(e) => debug!("STUN server {}:{} failed: {:#}", host, port, e),
        }
    }
    None
}

async fn feed_payloads(path: Option<PathBuf>, tx: mpsc::Sender<ProxyPayload>) -> Result<()> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &path {
        Some(path) => {
            let file = File::open(path)
                .await
                .with_context(|| format!("Failed to open payload file {:?}", path))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut lines = reader.lines();
    let mut count = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match ProxyPayload::from_json(line.as_bytes()) {
            Ok(payload) => {
                if tx.send(payload).await.is_err() {
                    break;
                }
                count += 1;
            }
            Err(e) => warn!("Skipping payload: {:#}", e),
        }
    }
    info!("Payload feed finished after {} payloads", count);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (mut config, load_error) = load_config(&args);
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.daemon.log_level.as_str()),
    )
    .init();
    if let Some(e) = load_error {
        warn!("Failed to load config: {:#}. Using defaults.", e);
    }

    if let Some(iface) = &args.interface {
        config.daemon.interface = iface.clone();
    }
    if args.metrics_port.is_some() {
        config.daemon.metrics_port = args.metrics_port;
    }
    if args.stun_server.is_some() {
        config.stun.server = args.stun_server.clone();
    }
    if let Some(port) = args.stun_port {
        config.stun.port = port;
    }

    info!(
        "Starting mesh proxy (interface {}, proxy port {})",
        config.daemon.interface, config.proxy.proxy_port
    );

    let provider = Arc::new(CliWgProvider);
    if let Err(e) = provider.get_interface(&config.daemon.interface) {
        warn!("Interface {} not available yet: {:#}", config.daemon.interface, e);
    }

    match discover_host(&config.stun).await {
        Some(host) if host.is_public_facing() => {
            info!("Host is public facing at {}:{}", host.public_ip, host.public_port)
        }
        Some(host) => info!(
            "Host behind NAT: {}:{} -> {}:{}",
            host.private_ip, host.private_port, host.public_ip, host.public_port
        ),
        None => warn!("Host address discovery failed, continuing without it"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = GlobalState::new();
    let stats = ProxyStats::new();
    let store = MetricsStore::new();

    let metrics_file = config.daemon.metrics_file();
    let flush_task = store.spawn_flush(
        metrics_file.clone(),
        config.timing.metrics_flush(),
        shutdown_rx.clone(),
    );

    if let Some(port) = config.daemon.metrics_port {
        let stats = stats.clone();
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve_metrics(stats, store, port).await {
                error!("Metrics server failed: {:#}", e);
            }
        });
    }

    let connector = Arc::new(UdpProxyConnector::new(
        config.proxy.bind_address,
        store.clone(),
    ));
    let manager = Arc::new(ProxyManager::new(
        state.clone(),
        provider,
        connector,
        stats,
        &config.proxy,
    ));

    let (tx, rx) = mpsc::channel(config.proxy.update_queue.max(1));
    let runner = manager.clone();
    let run_shutdown = shutdown_rx.clone();
    let manager_task = tokio::spawn(async move { runner.run(rx, run_shutdown).await });

    // the manager keeps serving watchers after the feed reaches EOF
    let _feed_guard = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = feed_payloads(args.payloads, tx).await {
            error!("Payload feed failed: {:#}", e);
        }
    });

    signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = manager_task.await {
        error!("Manager task failed: {}", e);
    }
    for network in state.networks() {
        let stopped = state.delete_network_peers(&network);
        debug!("Stopped {} connections on {}", stopped, network);
    }
    let _ = flush_task.await;
    if let Err(e) = store.flush(&metrics_file).await {
        debug!("Final metrics flush skipped: {:#}", e);
    }

    info!("Shutdown complete");
    Ok(())
}
