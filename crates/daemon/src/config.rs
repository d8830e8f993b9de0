use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the proxy daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub stun: StunConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Daemon runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// WireGuard interface the payloads usually target
    #[serde(default = "default_iface")]
    pub interface: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding metrics.json
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Port for the Prometheus endpoint. Disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interface: default_iface(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            metrics_port: None,
        }
    }
}

impl DaemonConfig {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.data_path().join("metrics.json")
    }
}

/// Forwarding and queueing settings.
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    /// Well-known port every proxy listens on; substituted into relay routes
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Local address forwarding sockets bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Capacity of the payload queue feeding the manager
    #[serde(default = "default_update_queue")]
    pub update_queue: usize,
    /// Capacity of each external-client notification channel
    #[serde(default = "default_ext_client_queue")]
    pub ext_client_queue: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            bind_address: default_bind_address(),
            update_queue: default_update_queue(),
            ext_client_queue: default_ext_client_queue(),
        }
    }
}

/// Public address discovery.
#[derive(Debug, Deserialize)]
pub struct StunConfig {
    /// STUN server host. Falls back to the built-in list when unset.
    pub server: Option<String>,
    #[serde(default = "default_stun_port")]
    pub port: u16,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: default_stun_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// How often the metrics store is written to disk
    #[serde(default = "default_metrics_flush")]
    pub metrics_flush_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            metrics_flush_secs: default_metrics_flush(),
        }
    }
}

impl TimingConfig {
    pub fn metrics_flush(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_secs.max(1))
    }
}

fn default_iface() -> String {
    "nm-mesh".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "~/.meshproxy".to_string()
}
fn default_proxy_port() -> u16 {
    51722
}
fn default_bind_address() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}
fn default_update_queue() -> usize {
    64
}
fn default_ext_client_queue() -> usize {
    30
}
fn default_stun_port() -> u16 {
    3478
}
fn default_metrics_flush() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/meshproxy/config.toml",
            "~/.meshproxy/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }
}
