//! Outbound TCP dialing with an IPv4-first policy.
//!
//! Targets are first resolved to IPv4 addresses only. When that resolution
//! fails (no such host, or no A records) the dial is repeated exactly once
//! with any address family. Refused/reset/unreachable connects and timeouts
//! are never retried.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};

/// Address families a dial may use
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressFamily {
    Ipv4,
    Any,
}

impl AddressFamily {
    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Any => true,
        }
    }
}

/// Resolve `host:port`, keeping only addresses of `family`
pub async fn resolve(host: &str, port: u16, family: AddressFamily) -> ProxyResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::Resolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .filter(|addr| family.admits(addr))
        .collect();

    if addrs.is_empty() {
        return Err(ProxyError::Resolution {
            host: host.to_string(),
            reason: match family {
                AddressFamily::Ipv4 => "no IPv4 addresses".to_string(),
                AddressFamily::Any => "no addresses".to_string(),
            },
        });
    }

    Ok(addrs)
}

/// Resolve and connect, trying each resolved address in order
pub async fn dial(host: &str, port: u16, family: AddressFamily) -> ProxyResult<TcpStream> {
    let addrs = resolve(host, port, family).await?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!("Connected to {}:{} via {}", host, port, addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(ProxyError::Connect {
        addr: format!("{}:{}", host, port),
        source: last_err.unwrap_or_else(|| std::io::Error::other("no addresses to connect to")),
    })
}

/// Run `attempt` with IPv4 only, and once more with any family if that
/// attempt failed to resolve
pub async fn with_family_fallback<T, F, Fut>(mut attempt: F) -> ProxyResult<T>
where
    F: FnMut(AddressFamily) -> Fut,
    Fut: Future<Output = ProxyResult<T>>,
{
    match attempt(AddressFamily::Ipv4).await {
        Err(e) if e.is_resolution() => {
            warn!("{}; retrying without IPv4 restriction", e);
            attempt(AddressFamily::Any).await
        }
        other => other,
    }
}

/// [`dial`] wrapped in the single dual-stack retry
pub async fn dial_with_fallback(host: &str, port: u16) -> ProxyResult<TcpStream> {
    with_family_fallback(|family| dial(host, port, family)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn resolution_error() -> ProxyError {
        ProxyError::Resolution {
            host: "unresolvable.test".to_string(),
            reason: "not found".to_string(),
        }
    }

    #[tokio::test]
    async fn test_resolution_failure_retries_exactly_once() {
        let families = Mutex::new(Vec::new());
        let result: ProxyResult<()> = with_family_fallback(|family| {
            families.lock().unwrap().push(family);
            async { Err(resolution_error()) }
        })
        .await;

        assert!(result.unwrap_err().is_resolution());
        assert_eq!(
            *families.lock().unwrap(),
            vec![AddressFamily::Ipv4, AddressFamily::Any]
        );
    }

    #[tokio::test]
    async fn test_fallback_success_is_returned() {
        let result = with_family_fallback(|family| async move {
            match family {
                AddressFamily::Ipv4 => Err(resolution_error()),
                AddressFamily::Any => Ok(6u8),
            }
        })
        .await;

        assert_eq!(result.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: ProxyResult<()> = with_family_fallback(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ProxyError::Connect {
                    addr: "127.0.0.1:1".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::Connect { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: ProxyResult<()> = with_family_fallback(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProxyError::Timeout(std::time::Duration::from_secs(10))) }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ipv6_literal_fails_ipv4_resolution() {
        let err = resolve("::1", 80, AddressFamily::Ipv4).await.unwrap_err();
        assert!(err.is_resolution());

        let addrs = resolve("::1", 80, AddressFamily::Any).await.unwrap();
        assert!(addrs.iter().all(|a| a.is_ipv6()));
    }

    #[tokio::test]
    async fn test_dial_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = dial_with_fallback("127.0.0.1", port).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_dial_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial("127.0.0.1", port, AddressFamily::Ipv4).await.unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }));
    }
}
