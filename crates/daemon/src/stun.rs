//! Host reachability discovery over STUN (RFC 5389 Binding Request).

use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

/// Reliable public STUN servers to use as ultimate fallback
pub const STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
    "stun.ekiga.net:3478",
];

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
const BINDING_REQUEST: [u8; 2] = [0x00, 0x01];
const BINDING_SUCCESS: [u8; 2] = [0x01, 0x01];
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// How this host is reachable: the address it binds on and the address the
/// internet sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub private_ip: IpAddr,
    pub private_port: u16,
    pub public_ip: IpAddr,
    pub public_port: u16,
}

impl HostInfo {
    /// True when the host sits directly on a public address.
    pub fn is_public_facing(&self) -> bool {
        is_public_ip(self.private_ip)
    }
}

/// Query one STUN server for this host's private and public addresses.
pub async fn discover_host_info(server_addr: &str, server_port: u16) -> Result<HostInfo> {
    if server_addr.is_empty() || server_port == 0 {
        bail!("stun config values cannot be empty");
    }

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind STUN socket")?;
    socket
        .connect((server_addr, server_port))
        .await
        .with_context(|| format!("failed to reach STUN server {}:{}", server_addr, server_port))?;
    let local = socket.local_addr()?;

    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&BINDING_REQUEST);
    request[4..8].copy_from_slice(&MAGIC_COOKIE);
    for byte in request.iter_mut().skip(8) {
        *byte = rand::random();
    }
    socket.send(&request).await?;

    let mut response = [0u8; 1024];
    let n = timeout(Duration::from_secs(3), socket.recv(&mut response))
        .await
        .context("STUN query timed out")??;
    debug!("STUN response: {} bytes from {}:{}", n, server_addr, server_port);

    if response[8..20] != request[8..20] {
        bail!("STUN transaction id mismatch");
    }
    let public = parse_mapped_address(&response[..n])
        .context("STUN response carried no mapped address")?;

    let info = HostInfo {
        private_ip: local.ip(),
        private_port: local.port(),
        public_ip: public.ip(),
        public_port: public.port(),
    };
    info!("Host info: {:?}", info);
    Ok(info)
}

/// Extract the reflexive address from a Binding Success Response, preferring
/// XOR-MAPPED-ADDRESS over the legacy MAPPED-ADDRESS.
pub fn parse_mapped_address(msg: &[u8]) -> Option<SocketAddr> {
    if msg.len() < 20 || msg[0..2] != BINDING_SUCCESS || msg[4..8] != MAGIC_COOKIE {
        return None;
    }
    let body_len = u16::from_be_bytes([msg[2], msg[3]]) as usize;
    let end = (20 + body_len).min(msg.len());

    let mut mapped = None;
    let mut pos = 20;
    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let attr_len = u16::from_be_bytes([msg[pos + 2], msg[pos + 3]]) as usize;
        let value_start = pos + 4;
        if value_start + attr_len > end {
            break;
        }
        let value = &msg[value_start..value_start + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, Some(&msg[4..20])) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => mapped = decode_address(value, None),
            _ => {}
        }
        // attributes are padded to 4 bytes
        pos = value_start + attr_len.div_ceil(4) * 4;
    }
    mapped
}

fn decode_address(value: &[u8], xor_key: Option<&[u8]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_key.is_some() {
        port ^= u16::from_be_bytes([MAGIC_COOKIE[0], MAGIC_COOKIE[1]]);
    }

    let ip = match family {
        0x01 if value.len() >= 8 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            if let Some(key) = xor_key {
                for (b, k) in octets.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(key) = xor_key {
                for (b, k) in octets.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Whether an address is routable on the public internet.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_unspecified()
                || v4.is_multicast())
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (seg0 & 0xffc0) == 0xfe80
                || (seg0 & 0xfe00) == 0xfc00)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(attr_type: u16, value: &[u8]) -> Vec<u8> {
        let mut msg = vec![0x01, 0x01];
        msg.extend_from_slice(&((value.len() + 4) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE);
        msg.extend_from_slice(&[7u8; 12]);
        msg.extend_from_slice(&attr_type.to_be_bytes());
        msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
        msg.extend_from_slice(value);
        msg
    }

    #[test]
    fn test_parse_xor_mapped_ipv4() {
        // 203.0.113.5:51820 xored with the magic cookie
        let port = 51820u16 ^ 0x2112;
        let ip: [u8; 4] = [203 ^ 0x21, 0x12, 113 ^ 0xA4, 5 ^ 0x42];
        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&port.to_be_bytes());
        value.extend_from_slice(&ip);

        let addr = parse_mapped_address(&response_with(ATTR_XOR_MAPPED_ADDRESS, &value)).unwrap();
        assert_eq!(addr, "203.0.113.5:51820".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_parse_plain_mapped_ipv4() {
        let value = [0x00, 0x01, 0x0d, 0x96, 198, 51, 100, 7];
        let addr = parse_mapped_address(&response_with(ATTR_MAPPED_ADDRESS, &value)).unwrap();
        assert_eq!(addr, "198.51.100.7:3478".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_rejects_non_success_response() {
        let mut msg = response_with(ATTR_MAPPED_ADDRESS, &[0x00, 0x01, 0, 1, 1, 2, 3, 4]);
        msg[1] = 0x11;
        assert!(parse_mapped_address(&msg).is_none());
        assert!(parse_mapped_address(&[0u8; 8]).is_none());
    }

    #[test]
    fn test_is_public_ip() {
        assert!(is_public_ip("203.0.113.5".parse().unwrap()));
        assert!(!is_public_ip("10.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("192.168.1.20".parse().unwrap()));
        assert!(!is_public_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("169.254.1.1".parse().unwrap()));
        assert!(!is_public_ip("fe80::1".parse().unwrap()));
        assert!(!is_public_ip("fd00::1".parse().unwrap()));
        assert!(is_public_ip("2001:4860::8888".parse().unwrap()));
    }
}
