//! The CONNECT tunnel.
//!
//! After the port filter admits the target, the proxy opens the upstream
//! leg (directly, through a SOCKS parent, or with a CONNECT request through
//! a parent proxy), answers the client with `200 Tunnel established`, and
//! splices bytes both ways. Each direction half-closes independently: EOF on
//! one side shuts down the write half of the other once its buffer drains,
//! and the tunnel is torn down when both directions are finished.

use std::rc::Rc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::chunk::CHUNK_SIZE;
use crate::error::{ProxyError, Result};
use crate::external::open_stream;
use crate::io::{self, HeadRead, BIG_BUFFER_SIZE};
use crate::parse;
use crate::proxy::Core;

/// Relay buffer per direction.
const TUNNEL_BUFFER: usize = 4 * CHUNK_SIZE;

/// Run a CONNECT tunnel on an accepted client connection.
///
/// `leftover` holds client bytes that arrived behind the CONNECT head; they
/// are forwarded ahead of anything read from the socket.
pub async fn run(
    core: Rc<Core>,
    mut client: TcpStream,
    leftover: Bytes,
    host: String,
    port: u16,
) -> Result<()> {
    if !core.config.port_allowed(port) {
        let body = format!("Port {port} is not allowed through this proxy.\n");
        let head = format!(
            "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        client.write_all(head.as_bytes()).await?;
        client.write_all(body.as_bytes()).await?;
        let _ = client.shutdown().await;
        return Ok(());
    }

    let origin = match establish(&core, &host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("tunnel to {host}:{port} failed: {e}");
            let status = e.status();
            let body = format!("Couldn't reach {host}:{port}: {e}\n");
            let head = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\
                 Connection: close\r\n\r\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Error"),
                body.len()
            );
            client.write_all(head.as_bytes()).await?;
            client.write_all(body.as_bytes()).await?;
            let _ = client.shutdown().await;
            return Ok(());
        }
    };

    client.write_all(b"HTTP/1.1 200 Tunnel established\r\n\r\n").await?;
    trace!("tunnel to {host}:{port} up");

    let (client_read, client_write) = client.into_split();
    let (origin_read, origin_write) = origin.into_split();

    let up = relay(client_read, origin_write, Some(leftover));
    let down = relay(origin_read, client_write, None);
    let (up_bytes, down_bytes) = tokio::join!(up, down);
    trace!("tunnel to {host}:{port} done, {up_bytes} up / {down_bytes} down");
    Ok(())
}

/// Open the upstream leg of the tunnel.
async fn establish(core: &Rc<Core>, host: &str, port: u16) -> Result<TcpStream> {
    let timeout = Duration::from_secs(core.config.server_timeout.min(30).max(1));

    if let Some((parent_host, parent_port)) = &core.config.parent_proxy {
        let mut stream = open_stream(
            core.resolver.clone(),
            core.socks.as_ref(),
            parent_host,
            *parent_port,
            timeout,
        )
        .await?;
        let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let Some(credentials) = &core.config.parent_auth_credentials {
            request.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                BASE64_STANDARD.encode(credentials)
            ));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut buf = BytesMut::new();
        let end = match io::read_head(&mut stream, &mut buf, BIG_BUFFER_SIZE).await? {
            HeadRead::Complete(end) => end,
            HeadRead::Closed => {
                return Err(ProxyError::UpstreamConnectFail("parent closed".into()))
            }
        };
        let (head, _) = parse::parse_response_head(&buf[..end])?
            .ok_or(ProxyError::UpstreamProtoError("bad parent response"))?;
        if !(200..300).contains(&head.code) {
            return Err(ProxyError::UpstreamConnectFail(format!(
                "parent refused CONNECT with {}",
                head.code
            )));
        }
        return Ok(stream);
    }

    open_stream(core.resolver.clone(), core.socks.as_ref(), host, port, timeout).await
}

/// Copy one direction until EOF or error, then shut down the write side.
/// Returns the number of bytes moved.
async fn relay(mut from: OwnedReadHalf, mut to: OwnedWriteHalf, preface: Option<Bytes>) -> u64 {
    let mut moved = 0u64;

    if let Some(data) = preface {
        if !data.is_empty() {
            if to.write_all(&data).await.is_err() {
                return moved;
            }
            moved += data.len() as u64;
        }
    }

    let mut buf = BytesMut::with_capacity(TUNNEL_BUFFER);
    loop {
        buf.clear();
        match from.read_buf(&mut buf).await {
            // Peer closed its write side: propagate the half-close.
            Ok(0) => break,
            Ok(n) => {
                if to.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                moved += n as u64;
            }
            Err(_) => break,
        }
    }
    let _ = to.shutdown().await;
    moved
}
