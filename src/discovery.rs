//! Best-effort discovery of a PIR server on the local /24.
//!
//! Probes every host address of the subnet in turn with a short TCP connect
//! and returns the first one that accepts. Slow and racy by nature; callers
//! should always allow an explicit address instead.

use crate::error::{PirError, Result};
use log::{debug, info};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};

/// Any routable address works; connecting a UDP socket sends nothing.
const ROUTE_PROBE: &str = "8.8.8.8:80";

/// This host's IPv4 address on the default route.
pub async fn local_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(PirError::NoRoute)?;
    socket.connect(ROUTE_PROBE).await.map_err(PirError::NoRoute)?;
    match socket.local_addr().map_err(PirError::NoRoute)?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(PirError::NoRoute(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable IPv4 address on the default route (got {})", other),
        ))),
    }
}

/// Host addresses `.1` to `.254` of the /24 containing `ip`.
pub fn subnet_hosts(ip: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    let [a, b, c, _] = ip.octets();
    (1..=254).map(move |host| Ipv4Addr::new(a, b, c, host))
}

fn network_label(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{}.{}.{}.0/24", a, b, c)
}

/// Probe the /24 of `ip` sequentially for a listener on `port`.
pub async fn scan_subnet(ip: Ipv4Addr, port: u16, timeout_per_host: Duration) -> Result<SocketAddr> {
    let network = network_label(ip);
    info!("Scanning network {} for PIR server on port {}", network, port);

    for host in subnet_hosts(ip) {
        let addr = SocketAddr::from((host, port));
        match tokio::time::timeout(timeout_per_host, TcpStream::connect(addr)).await {
            Ok(Ok(_probe)) => {
                info!("Found PIR server at {}", addr);
                return Ok(addr);
            }
            Ok(Err(e)) => debug!("{}: {}", addr, e),
            Err(_) => {}
        }
    }

    Err(PirError::NotFound { network })
}

/// Find a PIR server on the local network.
pub async fn discover(port: u16, timeout_per_host: Duration) -> Result<SocketAddr> {
    info!("Searching for PIR server on network...");
    let ip = local_ipv4().await?;
    scan_subnet(ip, port, timeout_per_host).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_subnet_hosts_cover_24() {
        let hosts: Vec<_> = subnet_hosts(Ipv4Addr::new(192, 168, 1, 37)).collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
        assert_eq!(network_label(Ipv4Addr::new(192, 168, 1, 37)), "192.168.1.0/24");
    }

    #[tokio::test]
    async fn test_scan_finds_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let found = scan_subnet(Ipv4Addr::new(127, 0, 0, 42), port, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(found, SocketAddr::from(([127, 0, 0, 1], port)));
    }
}
