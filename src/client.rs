//! The client-side dispatcher.
//!
//! One task per accepted connection. The task reads request heads from the
//! connection buffer (upgrading to a big buffer for oversized heads),
//! resolves each request against the object store, decides between serving
//! from cache and triggering an upstream fetch, and streams the object back,
//! waiting on the object's condition while a fetch is still filling it.
//! CONNECT requests hand the connection over to the tunnel module.
//!
//! Head-of-line ordering is structural: the next request head is parsed,
//! from bytes that may already be buffered, only when the current response
//! has been fully written.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::atom::Atom;
use crate::chunk::CHUNK_SIZE;
use crate::error::{ProxyError, Result};
use crate::external::PolicyDecision;
use crate::fresh;
use crate::io::{self, ChunkedDecoder, HeadRead, BIG_BUFFER_SIZE, CHUNKED_TERMINATOR};
use crate::local;
use crate::object::{CacheFlags, Object, ObjectFlags, ObjectKind};
use crate::parse::{self, ByteRange, RequestHead, RequestTarget};
use crate::proxy::{chunk_floor, Core};
use crate::server::{self, SideBody};
use crate::tunnel;

/// How many bytes the lingering-close path reads and discards to absorb
/// late client data before the reset would hit the response.
const SHUTDOWN_ABSORB: usize = 17;

const RESOLVE_ATTEMPTS: usize = 8;

/// How a finished request leaves the connection.
#[derive(Debug)]
enum Finish {
    /// Keep the connection and read the next request.
    KeepAlive,
    /// Drain and close gently.
    Lingering,
    /// Close immediately.
    Abrupt,
    /// Hand the connection over to a CONNECT tunnel.
    Tunnel {
        host: String,
        port: u16,
        leftover: Bytes,
    },
}

/// Serve one accepted client connection to completion.
pub async fn handle_connection(core: Rc<Core>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut conn = ClientConn { core, stream, buf: BytesMut::new(), peer, serviced: 0 };
    loop {
        match conn.one_request().await {
            Ok(Finish::KeepAlive) => {
                conn.serviced += 1;
                continue;
            }
            Ok(Finish::Lingering) => {
                conn.lingering_close().await;
                return Ok(());
            }
            Ok(Finish::Abrupt) => return Ok(()),
            Ok(Finish::Tunnel { host, port, leftover }) => {
                return tunnel::run(conn.core, conn.stream, leftover, host, port).await;
            }
            Err(e) => {
                trace!("client {}: {e}", conn.peer);
                return Err(e);
            }
        }
    }
}

struct ClientConn {
    core: Rc<Core>,
    stream: TcpStream,
    buf: BytesMut,
    peer: SocketAddr,
    serviced: u32,
}

impl ClientConn {
    async fn one_request(&mut self) -> Result<Finish> {
        let timeout = Duration::from_secs(self.core.config.client_timeout.max(1));
        let head_end = match tokio::time::timeout(
            timeout,
            io::read_head(&mut self.stream, &mut self.buf, BIG_BUFFER_SIZE),
        )
        .await
        {
            Err(_) => return Ok(Finish::Abrupt),
            Ok(Ok(HeadRead::Closed)) => return Ok(Finish::Abrupt),
            Ok(Ok(HeadRead::Complete(end))) => end,
            Ok(Err(e @ ProxyError::BadRequest(_))) => {
                self.error_response(&e, true).await?;
                return Ok(Finish::Lingering);
            }
            Ok(Err(e)) => return Err(e),
        };

        let head = match parse::parse_request_head(&self.buf[..head_end]) {
            Ok(Some((head, consumed))) => {
                let _ = self.buf.split_to(consumed);
                head
            }
            Ok(None) => {
                let e = ProxyError::BadRequest("incomplete request head");
                self.error_response(&e, true).await?;
                return Ok(Finish::Lingering);
            }
            Err(e) => {
                self.error_response(&e, true).await?;
                return Ok(Finish::Lingering);
            }
        };
        trace!("{} {:?} from {}", head.method, head.target, self.peer);

        if let Err(e) = self.check_preconditions(&head) {
            let drained = self.discard_request_body(&head).await?;
            let persistent = drained && wants_keepalive(&head);
            self.error_response(&e, persistent).await?;
            return Ok(finish_hint(persistent));
        }

        match (&head.method, &head.target) {
            (&Method::CONNECT, RequestTarget::Authority { host, port }) => {
                let leftover = self.buf.split().freeze();
                Ok(Finish::Tunnel { host: host.clone(), port: *port, leftover })
            }
            (&Method::CONNECT, _) => {
                let e = ProxyError::BadRequest("CONNECT without authority");
                self.error_response(&e, true).await?;
                Ok(Finish::Lingering)
            }
            (m, RequestTarget::Origin { path }) if *m == Method::GET || *m == Method::HEAD => {
                let path = path.clone();
                self.local_request(&head, &path).await
            }
            (m, RequestTarget::Absolute { .. }) if *m == Method::GET || *m == Method::HEAD => {
                self.cache_request(&head).await
            }
            (m, RequestTarget::Absolute { .. }) if *m == Method::POST || *m == Method::PUT => {
                self.side_request(&head).await
            }
            _ => {
                let drained = self.discard_request_body(&head).await?;
                let persistent = drained && wants_keepalive(&head);
                let e = ProxyError::MethodNotImplemented;
                self.error_response(&e, persistent).await?;
                Ok(finish_hint(persistent))
            }
        }
    }

    /// Checks that precede dispatch: Via loops, proxy auth, Expect.
    fn check_preconditions(&self, head: &RequestHead) -> Result<()> {
        if parse::via_loop(&head.headers, &self.core.config.proxy_name) {
            return Err(ProxyError::UpstreamConnectFail("via loop detected".into()));
        }
        if let Some(expect) = head.headers.get(http::header::EXPECT) {
            if !expect.to_str().unwrap_or("").eq_ignore_ascii_case("100-continue") {
                return Err(ProxyError::ExpectationFailed);
            }
        }
        if let Some(credentials) = &self.core.config.auth_credentials {
            let expected = format!("Basic {}", BASE64_STANDARD.encode(credentials));
            let presented = head
                .headers
                .get(http::header::PROXY_AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if presented != expected {
                return Err(ProxyError::AuthRequired);
            }
        }
        Ok(())
    }

    /// GET/HEAD for a local path: served from the document root, never
    /// revalidated upstream.
    async fn local_request(&mut self, head: &RequestHead, path: &str) -> Result<Finish> {
        let persistent = wants_keepalive(head);
        let Some(root) = self.core.config.local_document_root.clone() else {
            let e = ProxyError::Forbidden;
            self.error_response(&e, persistent).await?;
            return Ok(finish_hint(persistent));
        };
        let url = Atom::intern(path.as_bytes());
        let obj = match self.core.store.make(ObjectKind::Local, &url, true) {
            Ok(obj) => obj,
            Err(e) => {
                self.error_response(&e, false).await?;
                return Ok(Finish::Lingering);
            }
        };
        obj.set_flag(ObjectFlags::LOCAL);
        if obj.is(ObjectFlags::INITIAL) {
            match local::load_metadata(&obj, &root) {
                Ok(()) => {}
                Err(e @ ProxyError::Forbidden) => {
                    self.core.store.privatise(&obj);
                    self.error_response(&e, persistent).await?;
                    return Ok(finish_hint(persistent));
                }
                Err(_) => {
                    self.core.store.privatise(&obj);
                    self.simple_response(StatusCode::NOT_FOUND, "File not found", persistent)
                        .await?;
                    return Ok(finish_hint(persistent));
                }
            }
        }
        self.serve_object(head, &obj, persistent).await
    }

    /// The cache consult path for GET and HEAD on remote URLs.
    async fn cache_request(&mut self, head: &RequestHead) -> Result<Finish> {
        let RequestTarget::Absolute { url, host, port, path } = head.target.clone() else {
            return Err(ProxyError::InternalInvariant("absolute target expected"));
        };
        let info = parse::transfer_info(head.version, &head.headers, true)?;
        let persistent = info.persistent;
        let cc = parse::parse_cache_control(&head.headers);
        let authorized = head.headers.contains_key(http::header::AUTHORIZATION);

        // The policy hook may deny or rewrite the URL.
        let url = match self.core.policy.check(&url).await {
            PolicyDecision::Allow => url,
            PolicyDecision::Deny { status, message } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
                self.simple_response(status, &message, persistent).await?;
                return Ok(finish_hint(persistent));
            }
            PolicyDecision::Redirect { url: to } => {
                self.redirect_response(&to).await?;
                return Ok(finish_hint(persistent));
            }
        };
        let url_atom = Atom::intern(url.as_bytes());

        let mut validated = false;
        for _ in 0..RESOLVE_ATTEMPTS {
            // An authorized response is single-consumer unless the origin
            // marks it public; start it private and linear.
            let obj = if authorized {
                let obj = self.core.store.make(ObjectKind::Http, &url_atom, false)?;
                obj.set_flag(ObjectFlags::LINEAR);
                obj.add_cache_flags(CacheFlags::AUTHORIZATION);
                obj
            } else {
                match self.core.store.make(ObjectKind::Http, &url_atom, true) {
                    Ok(obj) => obj,
                    Err(e) => {
                        self.error_response(&e, false).await?;
                        return Ok(Finish::Lingering);
                    }
                }
            };

            if obj.is(ObjectFlags::INITIAL) {
                if let Some(disk) = &self.core.disk {
                    disk.load_metadata(&obj);
                }
            }

            let now = crate::now();
            let needs_fetch = obj.is(ObjectFlags::INITIAL)
                || obj.is(ObjectFlags::FAILED)
                || (!validated
                    && (fresh::is_stale(&obj, &cc, &self.core.config, now)
                        || fresh::must_revalidate(&obj, &self.core.config)
                        || cc.flags.contains(CacheFlags::NO_CACHE)));

            if needs_fetch && !obj.is(ObjectFlags::INPROGRESS) {
                if cc.flags.contains(CacheFlags::ONLY_IF_CACHED) {
                    if obj.is(ObjectFlags::INITIAL) {
                        let e = ProxyError::ObjectNotInCache;
                        self.error_response(&e, persistent).await?;
                        return Ok(finish_hint(persistent));
                    }
                    // Serve what we have, stale or not.
                } else if self.core.config.proxy_offline {
                    if obj.is(ObjectFlags::INITIAL) {
                        let e = ProxyError::DisconnectedNoCache;
                        self.error_response(&e, persistent).await?;
                        return Ok(finish_hint(persistent));
                    }
                    // Disconnected operation: serve the cached copy.
                } else {
                    let validate = !obj.is(ObjectFlags::INITIAL)
                        && (obj.etag().is_some() || obj.last_modified() >= 0);
                    server::request_object(
                        &self.core,
                        &obj,
                        head.method.clone(),
                        host.clone(),
                        port,
                        path.clone(),
                        0,
                        -1,
                        validate,
                        Some(self.forwarded_headers(head)),
                        self.via_value(head),
                        None,
                    );
                    validated = true;
                }
            } else if needs_fetch {
                // Someone else is fetching; their completion validates for
                // us as well.
                validated = true;
            }

            // Wait until the object has headers and is out of validation.
            match self.wait_ready(&obj).await? {
                WaitOutcome::Ready => {
                    return self.serve_object(head, &obj, persistent).await;
                }
                WaitOutcome::Superseded => continue,
                WaitOutcome::Failed => {
                    // Stale-but-intact objects are served with a warning.
                    if obj.code() == 200 && !obj.is(ObjectFlags::ABORTED) && obj.size() > 0 {
                        return self.serve_object(head, &obj, persistent).await;
                    }
                    let code = if obj.code() >= 400 { obj.code() } else { 502 };
                    let status =
                        StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
                    let message = obj.message().to_string();
                    self.simple_response(status, &message, persistent).await?;
                    return Ok(finish_hint(persistent));
                }
            }
        }
        let e = ProxyError::InternalInvariant("object kept superseding");
        self.error_response(&e, false).await?;
        Ok(Finish::Lingering)
    }

    /// POST/PUT: stream the body upstream and attach a fresh object that
    /// supersedes the cached entity on success.
    async fn side_request(&mut self, head: &RequestHead) -> Result<Finish> {
        let RequestTarget::Absolute { url, host, port, path } = head.target.clone() else {
            return Err(ProxyError::InternalInvariant("absolute target expected"));
        };
        let info = parse::transfer_info(head.version, &head.headers, true)?;
        let persistent = info.persistent;
        let url_atom = Atom::intern(url.as_bytes());

        if head.headers.get(http::header::EXPECT).is_some() {
            self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        }

        // The response lands on a private object; the cached entity is only
        // superseded once the origin confirms the mutation.
        let obj = self.core.store.make(ObjectKind::Http, &url_atom, false)?;
        obj.set_flag(ObjectFlags::LINEAR | ObjectFlags::MUTATING);

        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        server::request_object(
            &self.core,
            &obj,
            head.method.clone(),
            host,
            port,
            path,
            0,
            -1,
            false,
            Some(self.forwarded_headers(head)),
            self.via_value(head),
            Some(SideBody { content_length: info.content_length, rx }),
        );

        self.forward_request_body(head, tx).await?;

        match self.wait_ready(&obj).await? {
            WaitOutcome::Ready | WaitOutcome::Superseded => {}
            WaitOutcome::Failed => {
                let code = if obj.code() >= 400 { obj.code() } else { 502 };
                let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
                let message = obj.message().to_string();
                self.simple_response(status, &message, false).await?;
                return Ok(Finish::Lingering);
            }
        }

        // A successful mutation invalidates the cached entity. The lookup
        // loop is capped in case privatisation keeps yielding hits.
        if (200..300).contains(&obj.code()) {
            for _ in 0..RESOLVE_ATTEMPTS {
                match self.core.store.find(ObjectKind::Http, &url_atom) {
                    Some(cached) if !Rc::ptr_eq(&cached, &obj) => {
                        self.core.store.supersede(&cached);
                        if let Some(disk) = &self.core.disk {
                            disk.destroy_entry(&cached, true);
                        }
                    }
                    _ => break,
                }
            }
        }

        self.serve_object(head, &obj, persistent).await
    }

    /// Read the request body off the connection and feed it to the server
    /// side, honoring both framings.
    async fn forward_request_body(
        &mut self,
        head: &RequestHead,
        tx: tokio::sync::mpsc::Sender<Bytes>,
    ) -> Result<()> {
        let info = parse::transfer_info(head.version, &head.headers, true)?;
        let timeout = Duration::from_secs(self.core.config.client_timeout.max(1));

        if info.chunked {
            let mut decoder = ChunkedDecoder::new();
            loop {
                let mut out = Vec::new();
                decoder.decode(&mut self.buf, &mut out)?;
                if !out.is_empty() && tx.send(Bytes::from(out)).await.is_err() {
                    return Err(ProxyError::UpstreamConnectFail("upstream went away".into()));
                }
                if decoder.is_finished() {
                    return Ok(());
                }
                let n = tokio::time::timeout(timeout, self.stream.read_buf(&mut self.buf))
                    .await
                    .map_err(|_| ProxyError::BadRequest("timeout reading request body"))??;
                if n == 0 {
                    return Err(ProxyError::BadRequest("truncated request body"));
                }
            }
        }

        let mut remaining = info.content_length.max(0);
        while remaining > 0 {
            if !self.buf.is_empty() {
                let take = (remaining as usize).min(self.buf.len());
                let data = self.buf.split_to(take).freeze();
                remaining -= data.len() as i64;
                if tx.send(data).await.is_err() {
                    return Err(ProxyError::UpstreamConnectFail("upstream went away".into()));
                }
                continue;
            }
            let n = tokio::time::timeout(timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| ProxyError::BadRequest("timeout reading request body"))??;
            if n == 0 {
                return Err(ProxyError::BadRequest("truncated request body"));
            }
        }
        Ok(())
    }

    /// Read and discard any request body so the connection can be reused
    /// after an error response. Returns true when the body was fully
    /// drained and the connection may stay open.
    async fn discard_request_body(&mut self, head: &RequestHead) -> Result<bool> {
        let Ok(info) = parse::transfer_info(head.version, &head.headers, true) else {
            return Ok(false);
        };
        if info.chunked || info.content_length > BIG_BUFFER_SIZE as i64 {
            // Not worth draining; the caller closes instead.
            return Ok(false);
        }
        let mut remaining = info.content_length.max(0) as usize;
        while remaining > 0 {
            if !self.buf.is_empty() {
                let take = remaining.min(self.buf.len());
                let _ = self.buf.split_to(take);
                remaining -= take;
                continue;
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Park on the object's condition until it can be served, was
    /// superseded, or failed.
    async fn wait_ready(&mut self, obj: &Rc<Object>) -> Result<WaitOutcome> {
        let timeout = Duration::from_secs(self.core.config.client_timeout.max(1));
        loop {
            if obj.is(ObjectFlags::SUPERSEDED) {
                return Ok(WaitOutcome::Superseded);
            }
            if obj.is(ObjectFlags::ABORTED) || obj.is(ObjectFlags::FAILED) {
                return Ok(WaitOutcome::Failed);
            }
            if !obj.is(ObjectFlags::INITIAL) && !obj.is(ObjectFlags::VALIDATING) {
                return Ok(WaitOutcome::Ready);
            }
            let wait = obj.cond.wait();
            tokio::pin!(wait);
            if tokio::time::timeout(timeout, wait).await.is_err() {
                return Err(ProxyError::UpstreamConnectFail("gave up waiting for upstream".into()));
            }
        }
    }

    /// Emit the response head and stream the object body, waiting on the
    /// condition while an upstream fetch is still filling it.
    async fn serve_object(
        &mut self,
        head: &RequestHead,
        obj: &Rc<Object>,
        persistent: bool,
    ) -> Result<Finish> {
        obj.touch();
        let now = crate::now();
        let cond = parse::parse_conditions(&head.headers);

        // Client preconditions against the cached validators.
        if let Some(if_match) = &cond.if_match {
            let matched = match obj.etag() {
                Some(etag) => if_match.trim() == "*" || parse::etag_match(&etag, if_match),
                None => if_match.trim() == "*" && obj.size() > 0,
            };
            if !matched {
                let e = ProxyError::PreconditionFailed;
                self.error_response(&e, persistent).await?;
                return Ok(finish_hint(persistent));
            }
        }
        if cond.if_unmodified_since >= 0
            && obj.last_modified() >= 0
            && obj.last_modified() > cond.if_unmodified_since
        {
            let e = ProxyError::PreconditionFailed;
            self.error_response(&e, persistent).await?;
            return Ok(finish_hint(persistent));
        }
        let not_modified = match (&cond.if_none_match, obj.etag()) {
            (Some(inm), Some(etag)) => inm.trim() == "*" || parse::etag_match(&etag, inm),
            (Some(inm), None) => inm.trim() == "*" && obj.size() > 0,
            (None, _) => {
                cond.if_modified_since >= 0
                    && obj.last_modified() >= 0
                    && obj.last_modified() <= cond.if_modified_since
            }
        };
        if not_modified && obj.code() == 200 {
            self.not_modified_response(obj, persistent).await?;
            return Ok(finish_hint(persistent));
        }

        // Resolve the requested range. A range can only be honoured against
        // a known total length; a suffix range without one is refused, any
        // other range falls back to the full body. An If-Range validator
        // that no longer matches downgrades the request to the full body.
        let if_range_ok = match &cond.if_range {
            None => true,
            Some(validator) => match obj.etag() {
                Some(etag) => parse::etag_match(&etag, validator),
                None => {
                    let date = parse::parse_date(validator);
                    date >= 0 && obj.last_modified() >= 0 && date == obj.last_modified()
                }
            },
        };
        let range =
            parse::parse_range(&head.headers).filter(|_| obj.code() == 200 && if_range_ok);
        let (mut offset, end, ranged) = match range {
            None => (0, -1, false),
            Some(ByteRange { from, .. }) if from < 0 && obj.length() < 0 => {
                let e = ProxyError::RangeNotSatisfiable;
                self.error_response(&e, persistent).await?;
                return Ok(finish_hint(persistent));
            }
            Some(_) if obj.length() < 0 => (0, -1, false),
            Some(ByteRange { from, .. }) if from < 0 => {
                ((obj.length() + from).max(0), obj.length(), true)
            }
            Some(ByteRange { from, to }) => {
                if from >= obj.length() {
                    let e = ProxyError::RangeNotSatisfiable;
                    self.error_response(&e, persistent).await?;
                    return Ok(finish_hint(persistent));
                }
                let end = if to < 0 { obj.length() } else { to.min(obj.length()) };
                (from, end, true)
            }
        };

        let head_only = head.method == Method::HEAD;
        let body_end = if end >= 0 { end } else { obj.length() };
        let known_total = obj.length() >= 0;

        // Chunked framing when the total is unknown and the client is 1.1;
        // a 1.0 client gets a close-delimited body instead.
        let chunked = !known_total && !head_only && head.version >= Version::HTTP_11;
        let mut persistent = persistent && (known_total || chunked || head_only);

        let response_head =
            self.build_response_head(obj, ranged, offset, body_end, chunked, persistent, now);
        self.stream.write_all(&response_head).await?;

        if head_only || obj.code() == 204 || obj.code() == 304 {
            return Ok(finish_hint(persistent));
        }

        // Stream the body.
        let timeout = Duration::from_secs(self.core.config.client_timeout.max(1));
        let mut continuation_fetches = 0u32;
        loop {
            if body_end >= 0 && offset >= body_end {
                break;
            }
            if obj.length() >= 0 && offset >= obj.length() {
                break;
            }

            let budget = if body_end >= 0 {
                ((body_end - offset) as usize).min(2 * CHUNK_SIZE)
            } else {
                2 * CHUNK_SIZE
            };
            let chunk_idx = offset as usize / CHUNK_SIZE;
            obj.lock_chunk(chunk_idx);
            let data = obj.copy_data(offset, budget);
            obj.unlock_chunk(chunk_idx);

            if !data.is_empty() {
                if chunked {
                    let mut frame = BytesMut::new();
                    io::write_chunk_frame(&mut frame, &data);
                    self.stream.write_all(&frame).await?;
                } else {
                    self.stream.write_all(&data).await?;
                }
                offset += data.len() as i64;
                continue;
            }

            // Nothing resident at this offset: recover from disk, from the
            // local root, or wait for the fetch to progress.
            if obj.is(ObjectFlags::LOCAL) {
                if let Some(root) = &self.core.config.local_document_root {
                    if local::fill(obj, root, chunk_floor(offset), 2, &self.core.pool) {
                        continue;
                    }
                }
                break;
            }
            if obj.disk_size() > offset {
                if let Some(disk) = &self.core.disk {
                    if disk.fill_from_disk(obj, chunk_floor(offset), 2, &self.core.pool) {
                        continue;
                    }
                }
            }
            if obj.is(ObjectFlags::SUPERSEDED) || obj.is(ObjectFlags::ABORTED) {
                // Mid-stream loss of the entity; the framing tells the
                // client the body is short.
                persistent = false;
                break;
            }
            if obj.is(ObjectFlags::INPROGRESS) {
                let wait = obj.cond.wait();
                tokio::pin!(wait);
                if tokio::time::timeout(timeout, wait).await.is_err() {
                    persistent = false;
                    break;
                }
                continue;
            }
            if obj.size() > offset || (obj.length() >= 0 && obj.length() > offset) {
                // There is more entity than we hold and nobody is fetching:
                // issue a continuation fetch.
                continuation_fetches += 1;
                if continuation_fetches > 2 {
                    persistent = false;
                    break;
                }
                if let RequestTarget::Absolute { host, port, path, .. } = &head.target {
                    server::request_object(
                        &self.core,
                        obj,
                        Method::GET,
                        host.clone(),
                        *port,
                        path.clone(),
                        chunk_floor(offset.max(obj.size())),
                        -1,
                        false,
                        Some(self.forwarded_headers(head)),
                        self.via_value(head),
                        None,
                    );
                    continue;
                }
                persistent = false;
                break;
            }
            break;
        }

        if chunked {
            self.stream.write_all(CHUNKED_TERMINATOR).await?;
        }

        // Linear objects are never reused; drop them from circulation.
        if obj.is(ObjectFlags::LINEAR) {
            self.core.store.privatise(obj);
        }

        Ok(finish_hint(persistent))
    }

    fn build_response_head(
        &self,
        obj: &Rc<Object>,
        ranged: bool,
        from: i64,
        end: i64,
        chunked: bool,
        persistent: bool,
        now: i64,
    ) -> BytesMut {
        use bytes::BufMut;
        let mut out = BytesMut::with_capacity(512);

        let code = if ranged && obj.code() == 200 { 206 } else { obj.code().max(200) };
        let message = obj.message();
        let reason = if code == 206 {
            "Partial Content".to_string()
        } else if message.is_empty() {
            "OK".to_string()
        } else {
            message.to_string()
        };
        out.put_slice(format!("HTTP/1.1 {code} {reason}\r\n").as_bytes());

        let mut has_date = false;
        if let Some(headers) = obj.headers() {
            has_date = parse::parse_header_block(headers.as_bytes())
                .contains_key(http::header::DATE);
            out.put_slice(headers.as_bytes());
        }
        // The origin's Date plus our Age describe freshness; only a
        // response without one gets the proxy's clock.
        if !has_date {
            out.put_slice(format!("Date: {}\r\n", parse::format_date(now)).as_bytes());
        }
        if obj.age() >= 0 && !obj.is(ObjectFlags::LOCAL) {
            let age = (now - obj.age()).max(0);
            if age > 0 {
                out.put_slice(format!("Age: {age}\r\n").as_bytes());
            }
        }

        if ranged {
            let total =
                if obj.length() >= 0 { obj.length().to_string() } else { "*".to_string() };
            out.put_slice(
                format!("Content-Range: bytes {}-{}/{}\r\n", from, end - 1, total).as_bytes(),
            );
            out.put_slice(format!("Content-Length: {}\r\n", end - from).as_bytes());
        } else if obj.length() >= 0 {
            out.put_slice(format!("Content-Length: {}\r\n", obj.length()).as_bytes());
        }
        if chunked {
            out.put_slice(b"Transfer-Encoding: chunked\r\n");
        }

        // Warnings: stale service, disconnected operation, heuristic expiry.
        let config = &self.core.config;
        if obj.is(ObjectFlags::FAILED) {
            out.put_slice(b"Warning: 111 - \"Revalidation failed\"\r\n");
        } else if fresh::is_stale(obj, &Default::default(), config, now) && obj.code() == 200 {
            out.put_slice(b"Warning: 110 - \"Response is stale\"\r\n");
        }
        if config.proxy_offline {
            out.put_slice(b"Warning: 112 - \"Disconnected operation\"\r\n");
        }
        if fresh::heuristic_freshness(obj, config) && now - obj.age().max(0) > 86400 {
            out.put_slice(b"Warning: 113 - \"Heuristic expiration\"\r\n");
        }

        out.put_slice(
            format!(
                "Via: {}\r\n",
                parse::via_element(Version::HTTP_11, &config.proxy_name, config.proxy_port)
            )
            .as_bytes(),
        );
        out.put_slice(if persistent {
            b"Connection: keep-alive\r\n".as_slice()
        } else {
            b"Connection: close\r\n".as_slice()
        });
        out.put_slice(b"\r\n");
        out
    }

    /// Client request headers worth forwarding upstream: everything minus
    /// hop-by-hop, framing, target bookkeeping, and fields the proxy
    /// re-derives itself.
    fn forwarded_headers(&self, head: &RequestHead) -> Atom {
        let mut stripped = parse::strip_hop_by_hop(&head.headers);
        for name in [
            http::header::HOST,
            http::header::RANGE,
            http::header::IF_NONE_MATCH,
            http::header::IF_MODIFIED_SINCE,
            http::header::IF_RANGE,
            http::header::EXPECT,
            http::header::VIA,
        ] {
            stripped.remove(name);
        }
        Atom::intern(&parse::serialize_headers(&stripped))
    }

    /// The Via value for the upstream request: the client's chain plus this
    /// proxy's element.
    fn via_value(&self, head: &RequestHead) -> String {
        let element = parse::via_element(
            head.version,
            &self.core.config.proxy_name,
            self.core.config.proxy_port,
        );
        match head.headers.get(http::header::VIA).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {element}"),
            _ => element,
        }
    }

    async fn not_modified_response(&mut self, obj: &Rc<Object>, persistent: bool) -> Result<()> {
        use bytes::BufMut;
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(b"HTTP/1.1 304 Not Modified\r\n");
        if let Some(etag) = obj.etag() {
            out.put_slice(format!("ETag: {etag}\r\n").as_bytes());
        }
        out.put_slice(format!("Date: {}\r\n", parse::format_date(crate::now())).as_bytes());
        out.put_slice(if persistent {
            b"Connection: keep-alive\r\n".as_slice()
        } else {
            b"Connection: close\r\n".as_slice()
        });
        out.put_slice(b"\r\n");
        self.stream.write_all(&out).await?;
        Ok(())
    }

    async fn redirect_response(&mut self, to: &str) -> Result<()> {
        let body = format!("<html><body>Redirected to <a href=\"{to}\">{to}</a></body></html>\n");
        let head = format!(
            "HTTP/1.1 302 Found\r\nLocation: {to}\r\nContent-Type: text/html\r\n\
             Content-Length: {}\r\nConnection: keep-alive\r\n\r\n",
            body.len()
        );
        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(body.as_bytes()).await?;
        Ok(())
    }

    async fn error_response(&mut self, e: &ProxyError, persistent: bool) -> Result<()> {
        self.simple_response(e.status(), &e.to_string(), persistent).await
    }

    async fn simple_response(
        &mut self,
        status: StatusCode,
        message: &str,
        persistent: bool,
    ) -> Result<()> {
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = format!(
            "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\n\
             <body><h1>{code} {reason}</h1><p>{message}</p>\n\
             <hr>Generated by {name}</body></html>\n",
            code = status.as_u16(),
            name = self.core.config.proxy_name,
        );
        let mut head = format!(
            "HTTP/1.1 {code} {reason}\r\nContent-Type: text/html\r\nContent-Length: {len}\r\n",
            code = status.as_u16(),
            len = body.len(),
        );
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            head.push_str("Proxy-Authenticate: Basic realm=\"cachew\"\r\n");
        }
        head.push_str(if persistent { "Connection: keep-alive\r\n" } else { "Connection: close\r\n" });
        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(body.as_bytes()).await?;
        Ok(())
    }

    /// The gentle close: shut the write side, absorb a little late input so
    /// the close does not turn into a reset, then drop the socket.
    async fn lingering_close(mut self) {
        let _ = self.stream.shutdown().await;
        let mut absorb = [0u8; SHUTDOWN_ABSORB];
        let deadline = Duration::from_secs(10);
        let _ = tokio::time::timeout(deadline, async {
            loop {
                match self.stream.read(&mut absorb).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                }
            }
        })
        .await;
        debug!("closed client {} after {} requests", self.peer, self.serviced);
    }
}

#[derive(Debug, Clone, Copy)]
enum WaitOutcome {
    Ready,
    Superseded,
    Failed,
}

fn finish_hint(persistent: bool) -> Finish {
    if persistent {
        Finish::KeepAlive
    } else {
        Finish::Lingering
    }
}

/// Whether the client's request allows keeping the connection open.
fn wants_keepalive(head: &RequestHead) -> bool {
    parse::transfer_info(head.version, &head.headers, true)
        .map(|info| info.persistent)
        .unwrap_or(false)
}
