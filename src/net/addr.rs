//! Listen address parsing.
//!
//! Addresses are `host:port`. An empty host (`:9090`) means every IPv4
//! interface. An empty string is not an address: it disables the endpoint,
//! and callers check for it before resolving.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolve a listen address to a single socket address.
///
/// Host names may resolve to several addresses; IPv4 is preferred so that
/// `localhost:19090` resolves the same way on every host.
pub fn resolve(address: &str) -> io::Result<SocketAddr> {
    let normalized = match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => address.to_string(),
    };

    let candidates: Vec<SocketAddr> = normalized.to_socket_addrs()?.collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} did not resolve to any address", address),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_host_means_all_interfaces() {
        assert_eq!(resolve(":9090").unwrap(), "0.0.0.0:9090".parse().unwrap());
    }

    #[test]
    fn literal_addresses() {
        assert_eq!(resolve("127.0.0.1:8080").unwrap(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(resolve("[::1]:8080").unwrap(), "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn localhost_prefers_ipv4() {
        let addr = resolve("localhost:19090").unwrap();
        assert_eq!(addr.port(), 19090);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(resolve("no-port").is_err());
        assert!(resolve("127.0.0.1:notaport").is_err());
        assert!(resolve(":99999").is_err());
    }
}
