use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

pub const LISTENING_ADDRESS: &str = "LISTENING SOCKET";

/// Peer address as shown to users: dotted quad for IPv4, eight uncompressed
/// lowercase hex groups for IPv6. IPv4-mapped IPv6 addresses are shown as the
/// IPv4 address they carry.
pub fn address_to_text(addr: &SocketAddr) -> String {
    ip_to_text(&addr.ip())
}

pub fn ip_to_text(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6
                .segments()
                .iter()
                .map(|group| format!("{group:x}"))
                .collect::<Vec<_>>()
                .join(":"),
        },
    }
}

/// Resolves `host` to every stream address it has, in resolver order.
pub fn resolve_host(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        log::debug!("resolving {host}:{port} gave no addresses");
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}"),
        ));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ipv4_is_dotted_quad() {
        let addr = SocketAddr::from((Ipv4Addr::new(192, 168, 1, 20), 2100));
        assert_eq!(address_to_text(&addr), "192.168.1.20");
    }

    #[test]
    fn test_ipv6_is_eight_uncompressed_groups() {
        let addr = SocketAddr::from((Ipv6Addr::LOCALHOST, 2100));
        assert_eq!(address_to_text(&addr), "0:0:0:0:0:0:0:1");

        let ip: Ipv6Addr = "2001:DB8::AB:1".parse().unwrap();
        assert_eq!(ip_to_text(&IpAddr::V6(ip)), "2001:db8:0:0:0:0:ab:1");
    }

    #[test]
    fn test_mapped_ipv4_shows_embedded_address() {
        let ip = Ipv4Addr::new(10, 0, 0, 7).to_ipv6_mapped();
        assert_eq!(ip_to_text(&IpAddr::V6(ip)), "10.0.0.7");
    }

    #[test]
    fn test_resolves_loopback() {
        let addrs = resolve_host("127.0.0.1", 2100).unwrap();
        assert_eq!(addrs, vec![SocketAddr::from((Ipv4Addr::LOCALHOST, 2100))]);
    }
}
