//! Fleet-wide helpers: port assignment and the address players connect to.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener, UdpSocket};

use crate::error::{ManagerError, Result};

/// Smallest port at or above `requested` that no known server uses and
/// `is_bound` reports free.
pub fn allocate_port<F>(requested: u16, used: &HashSet<u16>, is_bound: F) -> Result<u16>
where
    F: Fn(u16) -> bool,
{
    if requested == 0 {
        return Err(ManagerError::InvalidConfig("port must be non-zero".to_string()));
    }
    (requested..=u16::MAX)
        .find(|port| !used.contains(port) && !is_bound(*port))
        .ok_or(ManagerError::PortInUse(requested))
}

/// Whether something on this host already listens on `port`.
pub fn port_bound(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_err()
}

/// Address of the interface used for outbound traffic. Nothing is sent:
/// connecting a UDP socket only selects a route.
pub fn host_ip() -> String {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect(("8.8.8.8", 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_port_kept_when_free() {
        assert_eq!(allocate_port(25565, &HashSet::new(), |_| false).unwrap(), 25565);
    }

    #[test]
    fn skips_ports_of_known_servers() {
        let used: HashSet<u16> = [25565, 25566].into_iter().collect();
        assert_eq!(allocate_port(25565, &used, |_| false).unwrap(), 25567);
    }

    #[test]
    fn skips_os_bound_ports() {
        let used: HashSet<u16> = [25565].into_iter().collect();
        assert_eq!(allocate_port(25565, &used, |p| p == 25566).unwrap(), 25567);
    }

    #[test]
    fn exhausted_range_is_port_in_use() {
        let err = allocate_port(u16::MAX, &HashSet::new(), |_| true).unwrap_err();
        assert!(matches!(err, ManagerError::PortInUse(p) if p == u16::MAX));
    }

    #[test]
    fn listening_socket_is_detected() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_bound(port));
    }

    #[test]
    fn host_ip_is_an_address() {
        assert!(host_ip().parse::<std::net::IpAddr>().is_ok());
    }
}
