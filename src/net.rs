//! Name resolution, address validation, and socket helpers.
//!
//! This module is the crate's view of the host network stack: dual-stack
//! name resolution, literal/hostname validation, local address discovery,
//! and timed TCP connects. Everything above it (peer client, DHT,
//! discovery) goes through these helpers rather than touching the
//! resolver directly.
//!
//! Dual-stack ordering: [`resolve_dual`] lists IPv6 candidates before
//! IPv4. Callers that try candidates in order therefore prefer IPv6 when
//! both families resolve.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::timeout;

/// Maximum total hostname length accepted by [`is_hostname`].
const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single hostname label.
const MAX_LABEL_LEN: usize = 63;

/// Errors from resolution and socket setup.
#[derive(Debug, Error)]
pub enum NetError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The name is neither a valid IP literal nor a valid hostname.
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// Name lookup returned no usable addresses.
    #[error("resolution failed for {0}")]
    ResolutionFailed(String),

    /// The connect attempt did not finish within its deadline.
    #[error("connect timed out")]
    ConnectTimeout,
}

/// Returns whether `s` parses as an IPv4 literal.
pub fn is_valid_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

/// Returns whether `s` parses as an IPv6 literal.
pub fn is_valid_ipv6(s: &str) -> bool {
    s.parse::<Ipv6Addr>().is_ok()
}

/// Returns whether `s` is a syntactically valid hostname.
///
/// Accepts ASCII letters, digits, hyphens and dots; rejects empty labels
/// (leading/trailing dots, `..`), labels starting or ending with `-`,
/// labels over 63 bytes, and names over 253 bytes.
pub fn is_hostname(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_HOSTNAME_LEN {
        return false;
    }

    if !s.is_ascii() {
        return false;
    }

    for label in s.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return false;
        }
    }

    true
}

/// Resolves `host` to its IPv4 addresses.
pub async fn resolve_v4(host: &str) -> Result<Vec<Ipv4Addr>, NetError> {
    let addrs = resolve_dual(host, 0).await?;
    let v4: Vec<Ipv4Addr> = addrs
        .into_iter()
        .filter_map(|a| match a.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();

    if v4.is_empty() {
        return Err(NetError::ResolutionFailed(host.to_string()));
    }
    Ok(v4)
}

/// Resolves `host` to its IPv6 addresses.
pub async fn resolve_v6(host: &str) -> Result<Vec<Ipv6Addr>, NetError> {
    let addrs = resolve_dual(host, 0).await?;
    let v6: Vec<Ipv6Addr> = addrs
        .into_iter()
        .filter_map(|a| match a.ip() {
            IpAddr::V6(ip) => Some(ip),
            IpAddr::V4(_) => None,
        })
        .collect();

    if v6.is_empty() {
        return Err(NetError::ResolutionFailed(host.to_string()));
    }
    Ok(v6)
}

/// Resolves `host` over both families, IPv6 candidates first.
///
/// IP literals short-circuit the resolver. The returned list is deduplicated
/// and never empty.
pub async fn resolve_dual(host: &str, port: u16) -> Result<Vec<SocketAddr>, NetError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    if !is_hostname(host) {
        return Err(NetError::InvalidHost(host.to_string()));
    }

    let resolved = lookup_host((host, port))
        .await
        .map_err(|_| NetError::ResolutionFailed(host.to_string()))?;

    let mut v6 = Vec::new();
    let mut v4 = Vec::new();
    for addr in resolved {
        match addr {
            SocketAddr::V6(_) if !v6.contains(&addr) => v6.push(addr),
            SocketAddr::V4(_) if !v4.contains(&addr) => v4.push(addr),
            _ => {}
        }
    }

    v6.extend(v4);
    if v6.is_empty() {
        return Err(NetError::ResolutionFailed(host.to_string()));
    }
    Ok(v6)
}

/// Returns the non-loopback addresses this host uses for outbound traffic.
///
/// Discovered by connecting an unbound UDP socket towards a public address
/// per family and reading the chosen source address; no packets are sent.
pub fn local_addresses() -> Vec<IpAddr> {
    let mut out = Vec::new();

    if let Some(ip) = probe_local(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))) {
        if !ip.is_loopback() {
            out.push(ip);
        }
    }

    if let Some(ip) = probe_local(IpAddr::V6(Ipv6Addr::new(
        0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888,
    ))) {
        if !ip.is_loopback() {
            out.push(ip);
        }
    }

    out
}

fn probe_local(target: IpAddr) -> Option<IpAddr> {
    use std::net::UdpSocket;

    let bind_addr: SocketAddr = match target {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = UdpSocket::bind(bind_addr).ok()?;
    socket.connect((target, 53)).ok()?;
    Some(socket.local_addr().ok()?.ip())
}

/// Connects to `addr` with a deadline.
pub async fn connect_tcp(addr: SocketAddr, deadline: Duration) -> Result<TcpStream, NetError> {
    match timeout(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetError::Io(e)),
        Err(_) => Err(NetError::ConnectTimeout),
    }
}

/// Binds listeners for both address families on `port`.
///
/// The V6 listener binds first; on hosts where an unspecified V6 bind is
/// dual-stack (Linux with `bindv6only=0`) it accepts V4-mapped
/// connections and the dedicated V4 bind simply fails. On V6-only-strict
/// hosts both listeners bind. At least one must succeed. Passing port 0
/// picks an ephemeral port on the first listener and reuses it for the
/// second.
pub async fn bind_dual_stack(
    port: u16,
) -> Result<(Option<TcpListener>, Option<TcpListener>, u16), NetError> {
    let v6 = TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await.ok();

    let effective = match &v6 {
        Some(l) => l.local_addr()?.port(),
        None => port,
    };

    let v4 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, effective))
        .await
        .ok();

    let bound_port = match (&v6, &v4) {
        (Some(l), _) => l.local_addr()?.port(),
        (None, Some(l)) => l.local_addr()?.port(),
        (None, None) => {
            return Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "failed to bind any listener",
            )))
        }
    };

    Ok((v4, v6, bound_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_literals() {
        assert!(is_valid_ipv4("127.0.0.1"));
        assert!(is_valid_ipv4("255.255.255.255"));
        assert!(!is_valid_ipv4("256.0.0.1"));
        assert!(!is_valid_ipv4("::1"));
        assert!(!is_valid_ipv4("example.com"));
    }

    #[test]
    fn test_ipv6_literals() {
        assert!(is_valid_ipv6("::1"));
        assert!(is_valid_ipv6("fe80::1"));
        assert!(!is_valid_ipv6("127.0.0.1"));
        assert!(!is_valid_ipv6("not-an-ip"));
    }

    #[test]
    fn test_hostname_validation() {
        assert!(is_hostname("example.com"));
        assert!(is_hostname("a-b.example.com"));
        assert!(is_hostname("localhost"));
        assert!(is_hostname("x1"));

        assert!(!is_hostname(""));
        assert!(!is_hostname(".example.com"));
        assert!(!is_hostname("example.com."));
        assert!(!is_hostname("exa..mple.com"));
        assert!(!is_hostname("-example.com"));
        assert!(!is_hostname("example-.com"));
        assert!(!is_hostname("exam ple.com"));
        assert!(!is_hostname(&"a".repeat(254)));
        assert!(!is_hostname(&format!("{}.com", "a".repeat(64))));
    }

    #[tokio::test]
    async fn test_resolve_dual_literal() {
        let addrs = resolve_dual("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);

        let addrs = resolve_dual("::1", 9090).await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv6());
    }

    #[tokio::test]
    async fn test_resolve_dual_rejects_garbage() {
        assert!(resolve_dual("exa..mple", 1).await.is_err());
        assert!(resolve_dual("", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_dual_stack_ephemeral() {
        let (v4, v6, port) = bind_dual_stack(0).await.unwrap();
        assert!(port > 0);
        assert!(v4.is_some() || v6.is_some());
        if let (Some(v4), Some(v6)) = (&v4, &v6) {
            assert_eq!(v4.local_addr().unwrap().port(), port);
            assert_eq!(v6.local_addr().unwrap().port(), port);
        }
    }
}
