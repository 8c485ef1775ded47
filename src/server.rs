//! The server-side dispatcher.
//!
//! Upstream fetches are queued per origin server; each origin carries up to
//! a configured number of concurrent connections, and idle connections are
//! kept for reuse until a reaper closes them. Requests without a body may be
//! pipelined behind each other on one connection; responses are correlated
//! strictly in order, and a framing violation resets the connection and
//! re-enqueues the unanswered requests for one retry.
//!
//! As response bytes arrive they are appended to the target object's chunks
//! and the object's condition is signalled, which wakes every client waiting
//! on it. At most one upstream fetch is in flight per object, enforced by
//! the object's requestor slot.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::atom::Atom;
use crate::error::{ProxyError, Result};
use crate::external::open_stream;
use crate::io::{self, ChunkedDecoder, HeadRead, BIG_BUFFER_SIZE, CHUNKED_TERMINATOR};
use crate::object::{CacheFlags, Object, ObjectFlags, ObjectKind};
use crate::parse;
use crate::proxy::Core;

const MAX_ATTEMPTS: u8 = 2;

/// Identity of an origin endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    /// Host to connect to (the parent proxy when one is configured).
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// True when this endpoint is a parent proxy.
    pub is_proxy: bool,
}

/// A body to stream upstream alongside a POST or PUT.
pub struct SideBody {
    /// Declared length, `-1` with chunked framing.
    pub content_length: i64,
    /// Receives body bytes from the client side; closed at end of body.
    pub rx: tokio::sync::mpsc::Receiver<Bytes>,
}

impl std::fmt::Debug for SideBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideBody").field("content_length", &self.content_length).finish()
    }
}

/// One queued upstream request.
#[derive(Debug)]
pub struct ServerRequest {
    /// The object the response fills.
    pub object: Rc<Object>,
    /// GET, HEAD, POST or PUT.
    pub method: Method,
    /// Origin host (from the URL, even when routed via a parent).
    pub host: String,
    /// Origin port.
    pub port: u16,
    /// Path plus query.
    pub path: String,
    /// First byte wanted; a positive value produces a Range header.
    pub from: i64,
    /// One past the last byte wanted, `-1` for open-ended.
    pub to: i64,
    /// Revalidate: send the object's validators as If-None-Match or
    /// If-Modified-Since. Mutually exclusive with a Range fetch, which
    /// sends If-Range instead.
    pub validate: bool,
    /// Filtered client headers to forward.
    pub extra_headers: Option<Atom>,
    /// The Via value to send, already including this proxy's element.
    pub via: String,
    /// Id holding the object's requestor slot.
    pub requestor_id: u64,
    /// Request body for side (POST/PUT) requests.
    pub body: Option<SideBody>,
    /// Delivery attempts so far.
    pub attempts: u8,
}

#[derive(Debug)]
struct ParkedConnection {
    stream: TcpStream,
    leftover: BytesMut,
    parked_at: Instant,
    generation: u64,
}

/// Per-origin dispatch state.
#[derive(Debug)]
pub struct OriginServer {
    key: ServerKey,
    queue: RefCell<VecDeque<ServerRequest>>,
    active: Cell<usize>,
    idle: RefCell<Vec<ParkedConnection>>,
    generation: Cell<u64>,
    /// Smoothed connect latency, microseconds. Kept for slot decisions.
    rtt: Cell<i64>,
    /// The origin answered with HTTP/1.1 at least once.
    http11: Cell<bool>,
}

/// The table of origin servers.
#[derive(Debug, Default)]
pub struct ServerPool {
    servers: RefCell<HashMap<ServerKey, Rc<OriginServer>>>,
}

impl ServerPool {
    /// An empty pool.
    pub fn new() -> ServerPool {
        ServerPool::default()
    }

    fn get(&self, key: ServerKey) -> Rc<OriginServer> {
        self.servers
            .borrow_mut()
            .entry(key.clone())
            .or_insert_with(|| {
                Rc::new(OriginServer {
                    key,
                    queue: RefCell::new(VecDeque::new()),
                    active: Cell::new(0),
                    idle: RefCell::new(Vec::new()),
                    generation: Cell::new(0),
                    rtt: Cell::new(-1),
                    http11: Cell::new(false),
                })
            })
            .clone()
    }
}

/// Queue an upstream request and kick the dispatcher.
pub fn schedule(core: &Rc<Core>, request: ServerRequest) {
    let key = match &core.config.parent_proxy {
        Some((host, port)) => ServerKey { host: host.clone(), port: *port, is_proxy: true },
        None => ServerKey { host: request.host.clone(), port: request.port, is_proxy: false },
    };
    let server = core.servers.get(key);
    server.queue.borrow_mut().push_back(request);
    trigger(core, &server);
}

/// Open slots until the queue drains or the per-origin cap is reached.
fn trigger(core: &Rc<Core>, server: &Rc<OriginServer>) {
    while !server.queue.borrow().is_empty() && server.active.get() < core.config.server_slots {
        server.active.set(server.active.get() + 1);
        let core = core.clone();
        let server = server.clone();
        tokio::task::spawn_local(async move {
            connection_task(&core, &server).await;
            server.active.set(server.active.get() - 1);
            if !server.queue.borrow().is_empty() {
                trigger(&core, &server);
            }
        });
    }
}

async fn connection_task(core: &Rc<Core>, server: &Rc<OriginServer>) {
    loop {
        let batch = take_batch(core, server);
        if batch.is_empty() {
            return;
        }

        let conn = match obtain_connection(core, server).await {
            Ok(conn) => conn,
            Err(e) => {
                let message = e.to_string();
                let status = e.status().as_u16();
                for req in batch {
                    fail_request(core, server, req, status, &message);
                }
                return;
            }
        };

        match run_batch(core, server, conn, batch).await {
            BatchEnd::Reusable(stream, leftover) => {
                if server.queue.borrow().is_empty() {
                    park_connection(core, server, stream, leftover);
                    return;
                }
                // Loop with a fresh batch on the same connection by parking
                // it at the head of the idle list first.
                server.idle.borrow_mut().push(ParkedConnection {
                    stream,
                    leftover,
                    parked_at: Instant::now(),
                    generation: server.generation.get(),
                });
            }
            BatchEnd::Closed => {
                if server.queue.borrow().is_empty() {
                    return;
                }
            }
        }
    }
}

fn take_batch(core: &Rc<Core>, server: &Rc<OriginServer>) -> Vec<ServerRequest> {
    let mut queue = server.queue.borrow_mut();
    let mut batch = Vec::new();
    let window = if server.http11.get() {
        1 + core.config.pipeline_additional_requests
    } else {
        1
    };
    while batch.len() < window {
        let pipelinable = match queue.front() {
            Some(req) => req.body.is_none() && (req.method == Method::GET || req.method == Method::HEAD),
            None => break,
        };
        if !batch.is_empty() && !pipelinable {
            break;
        }
        let req = queue.pop_front().unwrap();
        let stop =
            req.body.is_some() || (req.method != Method::GET && req.method != Method::HEAD);
        batch.push(req);
        if stop {
            break;
        }
    }
    batch
}

async fn obtain_connection(
    core: &Rc<Core>,
    server: &Rc<OriginServer>,
) -> Result<(TcpStream, BytesMut, bool)> {
    if let Some(parked) = server.idle.borrow_mut().pop() {
        return Ok((parked.stream, parked.leftover, true));
    }
    let started = Instant::now();
    let stream = open_stream(
        core.resolver.clone(),
        core.socks.as_ref(),
        &server.key.host,
        server.key.port,
        Duration::from_secs(core.config.server_timeout.min(30)),
    )
    .await?;
    let rtt = started.elapsed().as_micros() as i64;
    let old = server.rtt.get();
    server.rtt.set(if old < 0 { rtt } else { (3 * old + rtt) / 4 });
    Ok((stream, BytesMut::new(), false))
}

fn park_connection(core: &Rc<Core>, server: &Rc<OriginServer>, stream: TcpStream, leftover: BytesMut) {
    let generation = server.generation.get() + 1;
    server.generation.set(generation);
    server.idle.borrow_mut().push(ParkedConnection {
        stream,
        leftover,
        parked_at: Instant::now(),
        generation,
    });
    // Reap the connection if it is still parked when it expires.
    let expire = Duration::from_secs(core.config.server_expire_time.max(1));
    let server = server.clone();
    tokio::task::spawn_local(async move {
        tokio::time::sleep(expire).await;
        let mut idle = server.idle.borrow_mut();
        idle.retain(|c| c.generation != generation || c.parked_at.elapsed() < expire);
    });
}

fn fail_request(core: &Rc<Core>, server: &Rc<OriginServer>, mut req: ServerRequest, status: u16, message: &str) {
    req.attempts += 1;
    let idempotent = req.method == Method::GET || req.method == Method::HEAD;
    if req.attempts < MAX_ATTEMPTS && req.body.is_none() && idempotent {
        debug!("retrying {} {} after failure: {message}", req.method, req.path);
        server.queue.borrow_mut().push_back(req);
        trigger(core, server);
        return;
    }
    finish_failed(core, &req, status, message);
}

enum BatchEnd {
    Reusable(TcpStream, BytesMut),
    Closed,
}

async fn run_batch(
    core: &Rc<Core>,
    server: &Rc<OriginServer>,
    conn: (TcpStream, BytesMut, bool),
    mut batch: Vec<ServerRequest>,
) -> BatchEnd {
    let (mut stream, mut buf, reused) = conn;

    // Write every request of the batch up front.
    let mut wire = BytesMut::new();
    for req in &batch {
        build_request(server, req, core.config.parent_auth_credentials.as_deref(), &mut wire);
    }
    if let Err(e) = stream.write_all(&wire).await {
        let message = format!("write failed: {e}");
        for req in batch {
            fail_request(core, server, req, 504, &message);
        }
        return BatchEnd::Closed;
    }

    // Stream the side body, if any; only the last request may carry one.
    if let Some(mut body) = batch.last_mut().and_then(|r| r.body.take()) {
        let chunked = body.content_length < 0;
        while let Some(data) = body.rx.recv().await {
            let result = if chunked {
                let mut frame = BytesMut::new();
                io::write_chunk_frame(&mut frame, &data);
                stream.write_all(&frame).await
            } else {
                stream.write_all(&data).await
            };
            if result.is_err() {
                let req = batch.pop().unwrap();
                fail_request(core, server, req, 504, "write failed mid-body");
                return BatchEnd::Closed;
            }
        }
        if chunked && stream.write_all(CHUNKED_TERMINATOR).await.is_err() {
            let req = batch.pop().unwrap();
            fail_request(core, server, req, 504, "write failed mid-body");
            return BatchEnd::Closed;
        }
    }

    // Read responses in request order.
    let mut requests = batch.into_iter();
    let mut first = true;
    while let Some(req) = requests.next() {
        // A parked connection may have died while idle; the first request
        // on it is retried on a fresh connection rather than failed.
        let allow_retry = reused && first;
        first = false;
        match run_response(core, &mut stream, &mut buf, req, allow_retry).await {
            ResponseOutcome::Next { reusable: true } => continue,
            ResponseOutcome::Next { reusable: false } | ResponseOutcome::Fail => {
                requeue_rest(core, server, requests);
                return BatchEnd::Closed;
            }
            ResponseOutcome::Retry(req) => {
                server.queue.borrow_mut().push_front(*req);
                requeue_rest(core, server, requests);
                return BatchEnd::Closed;
            }
        }
    }
    BatchEnd::Reusable(stream, buf)
}

fn requeue_rest(
    core: &Rc<Core>,
    server: &Rc<OriginServer>,
    rest: impl Iterator<Item = ServerRequest>,
) {
    for req in rest {
        fail_request(core, server, req, 502, "pipelined request reset");
    }
}

fn build_request(
    server: &Rc<OriginServer>,
    req: &ServerRequest,
    parent_auth: Option<&str>,
    out: &mut BytesMut,
) {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use bytes::BufMut;

    let target = if server.key.is_proxy {
        format!("http://{}{}{}", req.host, fmt_port(req.port), req.path)
    } else {
        req.path.clone()
    };
    out.put_slice(format!("{} {} HTTP/1.1\r\n", req.method, target).as_bytes());
    out.put_slice(format!("Host: {}{}\r\n", req.host, fmt_port(req.port)).as_bytes());
    if server.key.is_proxy {
        if let Some(credentials) = parent_auth {
            out.put_slice(
                format!("Proxy-Authorization: Basic {}\r\n", BASE64_STANDARD.encode(credentials))
                    .as_bytes(),
            );
        }
    }

    if let Some(extra) = &req.extra_headers {
        out.put_slice(extra.as_bytes());
    }

    if req.from > 0 || req.to >= 0 {
        if req.to >= 0 {
            out.put_slice(format!("Range: bytes={}-{}\r\n", req.from, req.to - 1).as_bytes());
        } else {
            out.put_slice(format!("Range: bytes={}-\r\n", req.from).as_bytes());
        }
        // A ranged fetch guards the range with If-Range, never with
        // If-None-Match: a 304 would leave the hole unfilled.
        if let Some(etag) = req.object.etag() {
            if parse::is_strong_etag(&etag) {
                out.put_slice(format!("If-Range: {etag}\r\n").as_bytes());
            }
        }
    } else if req.validate {
        if let Some(etag) = req.object.etag() {
            out.put_slice(format!("If-None-Match: {etag}\r\n").as_bytes());
        } else if req.object.last_modified() >= 0 {
            out.put_slice(
                format!(
                    "If-Modified-Since: {}\r\n",
                    parse::format_date(req.object.last_modified())
                )
                .as_bytes(),
            );
        }
    }

    if let Some(body) = &req.body {
        if body.content_length >= 0 {
            out.put_slice(format!("Content-Length: {}\r\n", body.content_length).as_bytes());
        } else {
            out.put_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    out.put_slice(format!("Via: {}\r\n", req.via).as_bytes());
    out.put_slice(b"\r\n");
}

fn fmt_port(port: u16) -> String {
    if port == 80 {
        String::new()
    } else {
        format!(":{port}")
    }
}

/// What became of one response on an upstream connection.
enum ResponseOutcome {
    /// The response was consumed; `reusable` says whether the connection
    /// may carry another.
    Next {
        /// Connection survives for the next response.
        reusable: bool,
    },
    /// A reused connection died before saying anything; the request gets a
    /// fresh connection.
    Retry(Box<ServerRequest>),
    /// The request failed and its object carries the error.
    Fail,
}

/// Drive one response into its object.
async fn run_response(
    core: &Rc<Core>,
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut req: ServerRequest,
    allow_retry: bool,
) -> ResponseOutcome {
    let timeout = Duration::from_secs(core.config.server_timeout.max(1));

    let head = loop {
        let read = match tokio::time::timeout(
            timeout,
            io::read_head(stream, buf, BIG_BUFFER_SIZE),
        )
        .await
        {
            Ok(read) => read,
            Err(_) => {
                finish_failed(core, &req, 504, "timeout waiting for upstream response");
                return ResponseOutcome::Fail;
            }
        };
        let complete = match read {
            Ok(HeadRead::Complete(end)) => end,
            Ok(HeadRead::Closed) | Err(_) => {
                if allow_retry && buf.is_empty() {
                    return ResponseOutcome::Retry(Box::new(req));
                }
                finish_failed(core, &req, 502, "upstream closed before responding");
                return ResponseOutcome::Fail;
            }
        };
        let (head, consumed) = match parse::parse_response_head(&buf[..complete]) {
            Ok(Some(parsed)) => parsed,
            Ok(None) | Err(_) => {
                finish_failed(core, &req, 502, "unparseable response head");
                return ResponseOutcome::Fail;
            }
        };
        let _ = buf.split_to(consumed);
        if head.code == 100 {
            // Interim response; keep waiting for the real one.
            continue;
        }
        break head;
    };
    trace!("upstream {} for {} {}", head.code, req.method, req.path);

    if head.version == http::Version::HTTP_11 {
        // Pipelining is only worth trying against 1.1 servers.
        if let Some(s) = core.servers.get_for_stats(&req) {
            s.http11.set(true);
        }
    }

    let info = match parse::transfer_info(head.version, &head.headers, false) {
        Ok(info) => info,
        Err(_) => {
            finish_failed(core, &req, 502, "unsupported response framing");
            return ResponseOutcome::Fail;
        }
    };

    // 304: refresh metadata in place, no body follows. Only our own
    // validators can produce one, so the stored entity stays as it is.
    if head.code == 304 {
        refresh_metadata(&req.object, &head);
        finish_ok(&req);
        return ResponseOutcome::Next { reusable: info.persistent };
    }

    // Other bodyless statuses.
    let bodyless = req.method == Method::HEAD
        || head.code == 204
        || (100..200).contains(&head.code);

    // Decide where the body lands: on this object, or on a fresh one when
    // the entity no longer matches what we have cached.
    let mut write_offset = 0i64;
    let mut total_length = info.content_length;
    let mut object = req.object.clone();

    if head.code == 206 {
        match parse::parse_content_range(&head.headers) {
            Some((first, _last, total)) => {
                let resumable = first == req.from
                    || (first <= object.size() && first <= req.from);
                if !resumable {
                    // Treated as an entity mismatch: the old object is
                    // superseded and the partial body is unusable.
                    if let Ok(fresh) = replace_object(core, &req, &head) {
                        core.store.abort(&fresh, 502, "unusable partial response");
                    }
                    return ResponseOutcome::Fail;
                }
                write_offset = first;
                if total >= 0 {
                    total_length = total;
                }
            }
            None => {
                finish_failed(core, &req, 502, "206 without a content range");
                return ResponseOutcome::Fail;
            }
        }
    } else if head.code == 200 && entity_mismatch(&object, &head) {
        match replace_object(core, &req, &head) {
            Ok(fresh) => object = fresh,
            Err(_) => return ResponseOutcome::Fail,
        }
    }
    // Every later step, including the failure paths, works on the object
    // the body actually lands on.
    req.object = object.clone();

    apply_metadata(&object, &head, total_length, core);
    if head.code != 200 && head.code != 206 {
        // An error response (404, 500, ...) still flows to the waiters, but
        // marked so they surface it rather than cache it.
        object.set_flag(ObjectFlags::FAILED);
    }
    object.notify();

    if bodyless {
        finish_ok(&req);
        return ResponseOutcome::Next { reusable: info.persistent };
    }

    // Stream the body into the object.
    let mut decoder = info.chunked.then(ChunkedDecoder::new);
    let remaining = if info.chunked { -1 } else { info.content_length };
    let mut received = 0i64;

    loop {
        if !buf.is_empty() {
            let data: Vec<u8> = match &mut decoder {
                Some(decoder) => {
                    let mut out = Vec::new();
                    if decoder.decode(buf, &mut out).is_err() {
                        finish_failed(core, &req, 502, "bad chunked framing");
                        return ResponseOutcome::Fail;
                    }
                    out
                }
                None => {
                    let take = if remaining >= 0 {
                        (remaining - received).min(buf.len() as i64).max(0) as usize
                    } else {
                        buf.len()
                    };
                    buf.split_to(take).to_vec()
                }
            };
            if !data.is_empty() {
                if let Err(e) = append_body(core, &object, write_offset + received, &data) {
                    finish_failed(core, &req, e.status().as_u16(), "cannot store body");
                    return ResponseOutcome::Fail;
                }
                received += data.len() as i64;
            }
        }

        let done = match &decoder {
            Some(decoder) => decoder.is_finished(),
            None => remaining >= 0 && received >= remaining,
        };
        if done {
            break;
        }

        let n = match tokio::time::timeout(timeout, stream.read_buf(buf)).await {
            Ok(n) => n,
            Err(_) => {
                finish_failed(core, &req, 504, "timeout reading upstream body");
                return ResponseOutcome::Fail;
            }
        };
        match n {
            Ok(0) => {
                if decoder.is_some() || remaining >= 0 {
                    finish_failed(core, &req, 502, "truncated upstream body");
                    return ResponseOutcome::Fail;
                }
                break;
            }
            Ok(_) => {}
            Err(_) => {
                finish_failed(core, &req, 502, "upstream read error");
                return ResponseOutcome::Fail;
            }
        }
    }

    // EOF- or chunk-terminated bodies define the length now.
    if object.length() < 0 {
        object.set_length(write_offset + received);
    }

    finish_ok(&req);
    let reusable = info.persistent && (decoder.is_some() || remaining >= 0);
    ResponseOutcome::Next { reusable }
}

fn append_body(core: &Rc<Core>, object: &Rc<Object>, offset: i64, data: &[u8]) -> Result<()> {
    if object.is(ObjectFlags::ABORTED) {
        return Err(ProxyError::InternalInvariant("append to aborted object"));
    }
    object.add_data(offset, data, || core.get_chunk())?;
    if let Some(disk) = &core.disk {
        disk.mark_dirty();
    }
    object.notify();
    Ok(())
}

fn entity_mismatch(object: &Rc<Object>, head: &parse::ResponseHead) -> bool {
    if object.is(ObjectFlags::INITIAL) || object.size() == 0 && object.etag().is_none() {
        return false;
    }
    let new_etag = head
        .headers
        .get(http::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string());
    if let (Some(old), Some(new)) = (object.etag(), new_etag.as_ref()) {
        if !parse::etag_match(&old, new) {
            return true;
        }
    }
    let new_lm = head
        .headers
        .get(http::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(parse::parse_date)
        .unwrap_or(-1);
    object.last_modified() >= 0 && new_lm >= 0 && object.last_modified() != new_lm
}

/// Supersede the cached entity and transfer the fetch to a fresh object.
fn replace_object(
    core: &Rc<Core>,
    req: &ServerRequest,
    _head: &parse::ResponseHead,
) -> Result<Rc<Object>> {
    let old = &req.object;
    let key = old.key.clone();
    let was_public = old.is(ObjectFlags::PUBLIC);
    old.release_requestor(req.requestor_id);
    core.store.supersede(old);
    if let Some(disk) = &core.disk {
        disk.destroy_entry(old, true);
    }
    let fresh = core.store.make(key.kind, &key.url, was_public)?;
    fresh.set_flag(ObjectFlags::INPROGRESS);
    fresh.claim_requestor(req.requestor_id);
    Ok(fresh)
}

fn refresh_metadata(object: &Rc<Object>, head: &parse::ResponseHead) {
    let date = head
        .headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .map(parse::parse_date)
        .unwrap_or(-1);
    if date >= 0 {
        object.set_date(date);
    }
    object.set_age(crate::now());
    let expires = head
        .headers
        .get(http::header::EXPIRES)
        .and_then(|v| v.to_str().ok())
        .map(parse::parse_date)
        .unwrap_or(-1);
    if expires >= 0 {
        object.set_expires(expires);
    }
    let cc = parse::parse_cache_control(&head.headers);
    if cc.max_age >= 0 {
        object.set_max_age(cc.max_age);
    }
    if cc.s_maxage >= 0 {
        object.set_s_maxage(cc.s_maxage);
    }
    object.add_cache_flags(cc.flags);
    object.clear_flag(ObjectFlags::VALIDATING | ObjectFlags::FAILED);
}

fn apply_metadata(object: &Rc<Object>, head: &parse::ResponseHead, length: i64, core: &Rc<Core>) {
    let headers = &head.headers;
    let now = crate::now();

    object.set_code(head.code, Atom::intern(head.reason.as_bytes()));
    let stored = parse::strip_hop_by_hop(headers);
    object.set_headers(Atom::intern(&parse::serialize_headers(&stored)));

    let date = headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .map(parse::parse_date)
        .unwrap_or(-1);
    object.set_date(if date >= 0 { date } else { now });

    let age_header = headers
        .get(http::header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(0);
    // The age reference is when this response was generated, so an Age
    // header shifts it into the past.
    object.set_age(now - age_header.max(0));

    object.set_expires(
        headers
            .get(http::header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .map(parse::parse_date)
            .unwrap_or(-1),
    );
    object.set_last_modified(
        headers
            .get(http::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(parse::parse_date)
            .unwrap_or(-1),
    );
    object.set_etag(
        headers.get(http::header::ETAG).and_then(|v| v.to_str().ok()).map(|s| s.trim().to_string()),
    );

    let cc = parse::parse_cache_control(headers);
    object.set_max_age(cc.max_age);
    object.set_s_maxage(cc.s_maxage);
    let mut flags = cc.flags;
    let (vary, only_host) = parse::vary_info(headers);
    if vary && !only_host {
        flags |= CacheFlags::VARY;
    }
    if headers.contains_key(http::header::SET_COOKIE) {
        flags |= CacheFlags::COOKIE;
    }
    object.add_cache_flags(flags);

    if length >= 0 {
        object.set_length(length);
    }
    object.clear_flag(ObjectFlags::INITIAL);
    if head.code == 200 || head.code == 206 {
        object.clear_flag(ObjectFlags::FAILED);
    }

    // Responses the cache must not share leave the public table; current
    // holders keep streaming the private object.
    let uncacheable = flags.contains(CacheFlags::NO_STORE)
        || (core.config.cache_is_shared && flags.contains(CacheFlags::PRIVATE))
        || (core.config.dont_cache_cookies && flags.contains(CacheFlags::COOKIE));
    if uncacheable && object.is(ObjectFlags::PUBLIC) {
        core.store.privatise(object);
    }
}

fn finish_ok(req: &ServerRequest) {
    let obj = &req.object;
    obj.clear_flag(ObjectFlags::INPROGRESS | ObjectFlags::VALIDATING);
    obj.release_requestor(req.requestor_id);
    obj.notify();
}

fn finish_failed(core: &Rc<Core>, req: &ServerRequest, status: u16, message: &str) {
    let obj = &req.object;
    obj.release_requestor(req.requestor_id);
    // A failed revalidation of an intact cached entity keeps the stale
    // data; waiters may serve it with a warning instead of an error.
    if obj.is(ObjectFlags::VALIDATING) && !obj.is(ObjectFlags::INITIAL) && obj.code() == 200 {
        obj.set_flag(ObjectFlags::FAILED);
        obj.clear_flag(ObjectFlags::VALIDATING | ObjectFlags::INPROGRESS);
        obj.notify();
        return;
    }
    core.store.abort(obj, status, message);
}

impl ServerPool {
    fn get_for_stats(&self, req: &ServerRequest) -> Option<Rc<OriginServer>> {
        let direct = ServerKey { host: req.host.clone(), port: req.port, is_proxy: false };
        self.servers.borrow().get(&direct).cloned().or_else(|| {
            self.servers
                .borrow()
                .values()
                .find(|s| s.key.is_proxy)
                .cloned()
        })
    }
}

/// Issue an upstream fetch for `obj` unless one is already in flight.
///
/// This is the client dispatcher's single entry point: it claims the
/// requestor slot, marks the object in progress, and queues the request.
#[allow(clippy::too_many_arguments)]
pub fn request_object(
    core: &Rc<Core>,
    obj: &Rc<Object>,
    method: Method,
    host: String,
    port: u16,
    path: String,
    from: i64,
    to: i64,
    validate: bool,
    extra_headers: Option<Atom>,
    via: String,
    body: Option<SideBody>,
) -> bool {
    debug_assert_eq!(obj.key.kind, ObjectKind::Http);
    if obj.is(ObjectFlags::INPROGRESS) && body.is_none() {
        // Someone else is already fetching; just wait on the condition.
        return false;
    }
    let requestor_id = core.next_request_id();
    if !obj.claim_requestor(requestor_id) {
        return false;
    }
    obj.set_flag(ObjectFlags::INPROGRESS);
    if validate {
        obj.set_flag(ObjectFlags::VALIDATING);
    }
    schedule(
        core,
        ServerRequest {
            object: obj.clone(),
            method,
            host,
            port,
            path,
            from,
            to,
            validate,
            extra_headers,
            via,
            requestor_id,
            body,
            attempts: 0,
        },
    );
    true
}
