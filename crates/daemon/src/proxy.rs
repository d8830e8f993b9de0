//! Default forwarding sessions: one loopback UDP socket per proxied peer.
//!
//! The interface peer is pointed at the socket's local address. Datagrams
//! arriving from the interface are sent on to the peer (or its relay), and
//! everything else is handed back to the interface.

use anyhow::{Context, Result};
use log::debug;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::connection::{ProxyConnector, ProxyRequest};
use crate::metrics::MetricsStore;

const MAX_DATAGRAM: usize = 65535;

pub struct UdpProxyConnector {
    bind_ip: IpAddr,
    metrics: Arc<MetricsStore>,
}

impl UdpProxyConnector {
    /// `bind_ip` must be an address the local interface can send to.
    pub fn new(bind_ip: IpAddr, metrics: Arc<MetricsStore>) -> Self {
        Self { bind_ip, metrics }
    }
}

impl ProxyConnector for UdpProxyConnector {
    fn connect(&self, request: &ProxyRequest, stop: watch::Receiver<bool>) -> Result<SocketAddr> {
        let runtime = Handle::try_current().context("No tokio runtime for proxy session")?;
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(self.bind_ip, 0))
            .with_context(|| format!("Failed to bind proxy socket on {}", self.bind_ip))?;
        std_socket.set_nonblocking(true)?;
        let socket = {
            let _guard = runtime.enter();
            UdpSocket::from_std(std_socket)?
        };
        let local_addr = socket.local_addr()?;

        let session = Session {
            socket,
            wg_addr: SocketAddr::new(self.bind_ip, request.listen_port),
            target: request.dial_addr(),
            network: request.network.clone(),
            peer: request.public_key.clone(),
            metrics: self.metrics.clone(),
        };
        runtime.spawn(session.run(stop));
        Ok(local_addr)
    }
}

struct Session {
    socket: UdpSocket,
    wg_addr: SocketAddr,
    target: SocketAddr,
    network: String,
    peer: String,
    metrics: Arc<MetricsStore>,
}

impl Session {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        debug!(
            "Proxy session for {} started: {} <-> {}",
            self.peer, self.wg_addr, self.target
        );
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                // also fires when the connection (and its sender) is dropped
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
                res = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("Proxy recv error for {}: {}", self.peer, e);
                            continue;
                        }
                    };
                    let outbound = from == self.wg_addr;
                    let to = if outbound { self.target } else { self.wg_addr };
                    match self.socket.send_to(&buf[..len], to).await {
                        Ok(_) if outbound => {
                            self.metrics.record_traffic(&self.network, &self.peer, len as u64, 0)
                        }
                        Ok(_) => self.metrics.record_traffic(&self.network, &self.peer, 0, len as u64),
                        Err(e) => debug!("Proxy send to {} failed: {}", to, e),
                    }
                }
            }
        }
        self.metrics
            .set_connection_status(&self.network, &self.peer, false);
        debug!("Proxy session for {} stopped", self.peer);
    }
}
