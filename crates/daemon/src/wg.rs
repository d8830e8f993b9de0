//! Boundary with the WireGuard interface.
//!
//! The manager never owns the device; it only reads the listen port, reads
//! per-peer runtime state and pushes peer updates. [`CliWgControl`] does this
//! through the `wg` tool.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, info};
use std::net::SocketAddr;
use std::process::Command;
use std::sync::Arc;

use crate::payload::PeerConfig;

/// Live per-peer state reported by the interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRuntimeState {
    pub endpoint: Option<SocketAddr>,
    /// Seconds since UNIX epoch, 0 when no handshake happened yet
    pub latest_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub trait WgInterface: Send + Sync {
    fn name(&self) -> &str;
    fn listen_port(&self) -> Result<u16>;
    fn update_peer(&self, peer: &PeerConfig) -> Result<()>;
    fn peer_state(&self, public_key: &str) -> Result<PeerRuntimeState>;
}

pub trait InterfaceProvider: Send + Sync {
    fn get_interface(&self, name: &str) -> Result<Arc<dyn WgInterface>>;
}

pub struct CliWgControl {
    interface: String,
}

impl CliWgControl {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    fn show(&self, what: &str) -> Result<String> {
        let output = Command::new("wg")
            .args(["show", &self.interface, what])
            .output()
            .context("Failed to execute wg command")?;
        if !output.status.success() {
            bail!(
                "wg show {} {} failed: {}",
                self.interface,
                what,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl WgInterface for CliWgControl {
    fn name(&self) -> &str {
        &self.interface
    }

    fn listen_port(&self) -> Result<u16> {
        let out = self.show("listen-port")?;
        out.trim()
            .parse()
            .with_context(|| format!("Invalid listen port from wg: {:?}", out.trim()))
    }

    fn update_peer(&self, peer: &PeerConfig) -> Result<()> {
        let mut cmd = Command::new("wg");
        cmd.arg("set").arg(&self.interface);
        cmd.arg("peer").arg(&peer.public_key);

        if let Some(ep) = peer.endpoint {
            cmd.arg("endpoint").arg(ep.to_string());
        }

        if !peer.allowed_ips.is_empty() {
            cmd.arg("allowed-ips").arg(peer.allowed_ips.join(","));
        }

        if let Some(keepalive) = peer.persistent_keepalive {
            cmd.arg("persistent-keepalive").arg(keepalive.to_string());
        }

        debug!("Executing: {:?}", cmd);

        match cmd.output() {
            Ok(output) if output.status.success() => {
                info!("Configured peer {} on {}", peer.public_key, self.interface);
                Ok(())
            }
            Ok(output) => {
                let err = String::from_utf8_lossy(&output.stderr).trim().to_string();
                error!("Failed to configure peer {}: {}", peer.public_key, err);
                Err(anyhow!(err))
            }
            Err(e) => {
                error!("Failed to execute wg command: {}", e);
                Err(e.into())
            }
        }
    }

    fn peer_state(&self, public_key: &str) -> Result<PeerRuntimeState> {
        let dump = self.show("dump")?;
        parse_dump_peer(&dump, public_key)
            .ok_or_else(|| anyhow!("peer {} not found on {}", public_key, self.interface))
    }
}

/// Opens interfaces through the `wg` tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct CliWgProvider;

impl InterfaceProvider for CliWgProvider {
    fn get_interface(&self, name: &str) -> Result<Arc<dyn WgInterface>> {
        let iface = CliWgControl::new(name);
        // Fails early when the device does not exist
        iface
            .listen_port()
            .with_context(|| format!("Failed to get interface {}", name))?;
        Ok(Arc::new(iface))
    }
}

/// Find a peer line in `wg show <iface> dump` output.
///
/// The first line describes the interface; every following line is
/// `public-key preshared-key endpoint allowed-ips latest-handshake
/// transfer-rx transfer-tx persistent-keepalive`, tab separated.
pub fn parse_dump_peer(dump: &str, public_key: &str) -> Option<PeerRuntimeState> {
    dump.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 || fields[0] != public_key {
            return None;
        }
        Some(PeerRuntimeState {
            endpoint: fields[2].parse().ok(),
            latest_handshake: fields[4].parse().unwrap_or(0),
            rx_bytes: fields[5].parse().unwrap_or(0),
            tx_bytes: fields[6].parse().unwrap_or(0),
        })
    })
}
