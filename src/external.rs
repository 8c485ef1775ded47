//! Collaborator interfaces: DNS resolution, SOCKS dialing, and the
//! URL-policy (redirector) hook.
//!
//! These are thin seams over external services. The engine consumes them
//! through traits so tests can script them; the default implementations use
//! the runtime's resolver, a SOCKS5 CONNECT handshake, and an allow-all
//! policy.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};

/// Asynchronous name resolution.
#[async_trait(?Send)]
pub trait Resolver {
    /// Resolve `host:port` to socket addresses.
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// The runtime's own resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioResolver;

#[async_trait(?Send)]
impl Resolver for TokioResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ProxyError::UpstreamConnectFail(format!("{host}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(ProxyError::UpstreamConnectFail(format!("{host}: no address")));
        }
        Ok(addrs)
    }
}

/// What the URL-policy hook decided about a request.
#[derive(Debug, Clone)]
pub enum PolicyDecision {
    /// Forward the request unchanged.
    Allow,
    /// Refuse the request with this status and message.
    Deny {
        /// HTTP status to surface.
        status: u16,
        /// Message for the error body.
        message: String,
    },
    /// Rewrite the request to this URL.
    Redirect {
        /// The replacement URL.
        url: String,
    },
}

/// The forbidden-URL / redirector hook.
#[async_trait(?Send)]
pub trait UrlPolicy {
    /// Inspect a URL before it is fetched.
    async fn check(&self, url: &str) -> PolicyDecision;
}

/// The default policy: everything is allowed.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait(?Send)]
impl UrlPolicy for AllowAll {
    async fn check(&self, _url: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// A SOCKS5 client restricted to the CONNECT command with no
/// authentication, which is what a local SOCKS parent offers.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    /// SOCKS server host.
    pub host: String,
    /// SOCKS server port.
    pub port: u16,
}

impl SocksDialer {
    /// Connect to `host:port` through the SOCKS parent.
    ///
    /// The hostname is passed through to the server (ATYP 3), so DNS happens
    /// on the far side.
    pub async fn connect(&self, resolver: &dyn Resolver, host: &str, port: u16) -> Result<TcpStream> {
        if host.len() > 255 {
            return Err(ProxyError::BadRequest("hostname too long for SOCKS"));
        }
        let addrs = resolver.resolve(&self.host, self.port).await?;
        let mut stream = connect_any(&addrs).await?;

        stream.write_all(&[5, 1, 0]).await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply != [5, 0] {
            return Err(ProxyError::UpstreamConnectFail("SOCKS method refused".into()));
        }

        let mut request = Vec::with_capacity(7 + host.len());
        request.extend_from_slice(&[5, 1, 0, 3, host.len() as u8]);
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0 {
            return Err(ProxyError::UpstreamConnectFail(format!(
                "SOCKS connect failed (code {})",
                head[1]
            )));
        }
        // Absorb the bound address the server reports.
        let skip = match head[3] {
            1 => 4,
            3 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            4 => 16,
            _ => return Err(ProxyError::UpstreamConnectFail("malformed SOCKS reply".into())),
        };
        let mut rest = vec![0u8; skip + 2];
        stream.read_exact(&mut rest).await?;
        Ok(stream)
    }
}

/// Try each address in turn until one connects.
pub async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream> {
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(ProxyError::UpstreamConnectFail(
        last.map(|e| e.to_string()).unwrap_or_else(|| "no address".into()),
    ))
}

/// Open a stream to `host:port` along the configured route, bounded by a
/// connect timeout.
pub async fn open_stream(
    resolver: Rc<dyn Resolver>,
    socks: Option<&SocksDialer>,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream> {
    let fut = async {
        match socks {
            Some(dialer) => dialer.connect(resolver.as_ref(), host, port).await,
            None => {
                let addrs = resolver.resolve(host, port).await?;
                connect_any(&addrs).await
            }
        }
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::UpstreamConnectFail(format!("{host}:{port}: connect timed out"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn resolver_handles_literal_addresses() {
        let addrs = TokioResolver.resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(addrs[0], "127.0.0.1:80".parse().unwrap());
    }

    #[tokio::test]
    async fn socks_dialer_speaks_socks5() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            stream.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[5, 1, 0, 3]);
            let mut name = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut name).await.unwrap();
            assert_eq!(&name[..head[4] as usize], b"origin.test");

            // Success reply with a dummy bound address.
            stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            stream.write_all(b"tunnelled").await.unwrap();
        });

        let dialer = SocksDialer { host: addr.ip().to_string(), port: addr.port() };
        let mut stream = dialer.connect(&TokioResolver, "origin.test", 80).await.unwrap();
        let mut buf = vec![0u8; 9];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnelled");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn socks_dialer_surfaces_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[5, 0]).await.unwrap();
            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            let mut name = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut name).await.unwrap();
            // Host unreachable.
            stream.write_all(&[5, 4, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let dialer = SocksDialer { host: addr.ip().to_string(), port: addr.port() };
        let err = dialer.connect(&TokioResolver, "origin.test", 80).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnectFail(_)));
    }
}
