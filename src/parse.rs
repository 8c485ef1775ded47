//! HTTP head parsing and header digestion.
//!
//! The byte-level work is delegated to `httparse`; this module turns its
//! output into typed request/response heads and digests the headers the
//! engine treats specially: framing (Content-Length, Transfer-Encoding,
//! Connection), caching (Cache-Control, Pragma, Age, Date, Expires, ETag,
//! Last-Modified, Vary), conditions, ranges, and Via. Hop-by-hop headers are
//! stripped before storage and forwarding.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};
use memchr::memmem;

use crate::error::{ProxyError, Result};
use crate::object::{CacheControl, CacheFlags};

const MAX_HEADERS: usize = 128;

/// A parsed request head.
#[derive(Debug)]
pub struct RequestHead {
    /// Request method. Parsing accepts any token; dispatch restricts it.
    pub method: Method,
    /// The request target, split by form.
    pub target: RequestTarget,
    /// HTTP/1.0 or HTTP/1.1.
    pub version: Version,
    /// All request headers as received.
    pub headers: HeaderMap,
}

/// The three request-target forms the proxy accepts.
#[derive(Debug, Clone)]
pub enum RequestTarget {
    /// `http://host:port/path` as sent to a proxy. `url` keeps the exact
    /// received text and is the cache key.
    Absolute {
        /// The full URL text, fragment removed.
        url: String,
        /// Host component.
        host: String,
        /// Port, defaulted to 80.
        port: u16,
        /// Path plus query, always starting with `/`.
        path: String,
    },
    /// `/path`, served from the local document root.
    Origin {
        /// Path plus query.
        path: String,
    },
    /// `host:port`, only valid with CONNECT.
    Authority {
        /// Host to tunnel to.
        host: String,
        /// Port to tunnel to.
        port: u16,
    },
}

/// A parsed response head.
#[derive(Debug)]
pub struct ResponseHead {
    /// Status code.
    pub code: u16,
    /// Reason phrase as sent.
    pub reason: String,
    /// HTTP/1.0 or HTTP/1.1.
    pub version: Version,
    /// All response headers as received.
    pub headers: HeaderMap,
}

/// Framing information digested from a head.
#[derive(Debug, Clone, Copy)]
pub struct TransferInfo {
    /// Body length from Content-Length, `-1` when unknown.
    pub content_length: i64,
    /// True when Transfer-Encoding is chunked.
    pub chunked: bool,
    /// True when the connection may carry another request afterwards.
    pub persistent: bool,
}

/// Client conditions attached to a request. `-1` means unset for dates.
#[derive(Debug, Clone, Default)]
pub struct RequestCondition {
    /// If-None-Match entity tags, verbatim.
    pub if_none_match: Option<String>,
    /// If-Modified-Since as epoch seconds.
    pub if_modified_since: i64,
    /// If-Match entity tag, verbatim.
    pub if_match: Option<String>,
    /// If-Unmodified-Since as epoch seconds.
    pub if_unmodified_since: i64,
    /// If-Range validator (entity tag or date), verbatim.
    pub if_range: Option<String>,
}

/// A requested byte range `[from, to)`; `to = -1` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset. Negative for a suffix range (`bytes=-n` is stored
    /// as `from = -n, to = -1` until the object length is known).
    pub from: i64,
    /// One past the last byte, or `-1`.
    pub to: i64,
}

/// Locate the end of a header block; returns the offset just past the blank
/// line. Accepts bare-LF line endings the way lenient servers do.
pub fn find_end_of_headers(buf: &[u8]) -> Option<usize> {
    let crlf = memmem::find(buf, b"\r\n\r\n").map(|i| i + 4);
    let lf = memmem::find(buf, b"\n\n").map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse a request head out of `buf`.
///
/// Returns the head and the number of bytes consumed, or `Ok(None)` when the
/// head is not yet complete.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut storage);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(ProxyError::BadRequest("malformed request head")),
    };
    let method = Method::from_bytes(req.method.unwrap_or("").as_bytes())
        .map_err(|_| ProxyError::BadRequest("malformed method"))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(ProxyError::BadRequest("unsupported protocol version")),
    };
    let target = parse_target(&method, req.path.ok_or(ProxyError::BadRequest("missing target"))?)?;
    let headers = collect_headers(req.headers)?;
    Ok(Some((RequestHead { method, target, version, headers }, len)))
}

/// Parse a response head out of `buf`.
///
/// Returns `Ok(None)` when the head is not yet complete.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut storage);
    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(ProxyError::UpstreamProtoError("malformed response head")),
    };
    let code = res.code.ok_or(ProxyError::UpstreamProtoError("missing status"))?;
    let version = match res.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let reason = res.reason.unwrap_or("").to_string();
    let headers = collect_headers(res.headers)
        .map_err(|_| ProxyError::UpstreamProtoError("malformed response header"))?;
    Ok(Some((ResponseHead { code, reason, version, headers }, len)))
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| ProxyError::BadRequest("malformed header name"))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| ProxyError::BadRequest("malformed header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn parse_target(method: &Method, raw: &str) -> Result<RequestTarget> {
    if *method == Method::CONNECT {
        let (host, port) = split_host_port(raw, 443)
            .ok_or(ProxyError::BadRequest("malformed CONNECT target"))?;
        return Ok(RequestTarget::Authority { host, port });
    }
    if raw.starts_with('/') {
        return Ok(RequestTarget::Origin { path: raw.to_string() });
    }
    let without_fragment = raw.split('#').next().unwrap_or(raw);
    let url = url::Url::parse(without_fragment)
        .map_err(|_| ProxyError::BadRequest("malformed URL"))?;
    if url.scheme() != "http" {
        return Err(ProxyError::Forbidden);
    }
    let host = url
        .host_str()
        .ok_or(ProxyError::BadRequest("URL without host"))?
        .to_string();
    let port = url.port().unwrap_or(80);
    let mut path = url.path().to_string();
    if let Some(q) = url.query() {
        path.push('?');
        path.push_str(q);
    }
    Ok(RequestTarget::Absolute { url: without_fragment.to_string(), host, port, path })
}

/// Split `host[:port]`, with a default port.
pub fn split_host_port(raw: &str, default_port: u16) -> Option<(String, u16)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.rfind(':') {
        Some(i) if !raw[i + 1..].is_empty() && raw[i + 1..].chars().all(|c| c.is_ascii_digit()) => {
            let port = raw[i + 1..].parse().ok()?;
            Some((raw[..i].to_string(), port))
        }
        _ => Some((raw.to_string(), default_port)),
    }
}

/// Digest framing headers from a head.
///
/// Rejects any transfer coding other than `identity` and `chunked`.
pub fn transfer_info(version: Version, headers: &HeaderMap, is_request: bool) -> Result<TransferInfo> {
    let mut chunked = false;
    for value in headers.get_all(http::header::TRANSFER_ENCODING) {
        for token in split_tokens(value) {
            match token.as_str() {
                "identity" | "" => {}
                "chunked" => chunked = true,
                _ => {
                    return Err(if is_request {
                        ProxyError::BadRequest("unsupported transfer encoding")
                    } else {
                        ProxyError::UpstreamProtoError("unsupported transfer encoding")
                    })
                }
            }
        }
    }

    let content_length = match headers.get(http::header::CONTENT_LENGTH) {
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|n| *n >= 0)
            .ok_or(if is_request {
                ProxyError::BadRequest("malformed Content-Length")
            } else {
                ProxyError::UpstreamProtoError("malformed Content-Length")
            })?,
        None => -1,
    };

    let mut persistent = version >= Version::HTTP_11;
    for name in [http::header::CONNECTION, HeaderName::from_static("proxy-connection")] {
        for value in headers.get_all(&name) {
            for token in split_tokens(value) {
                match token.as_str() {
                    "close" => persistent = false,
                    "keep-alive" => persistent = true,
                    _ => {}
                }
            }
        }
    }

    Ok(TransferInfo { content_length, chunked, persistent })
}

fn split_tokens(value: &HeaderValue) -> Vec<String> {
    value
        .to_str()
        .unwrap_or("")
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Parse Cache-Control (and Pragma: no-cache) into the flag bitset plus
/// numeric fields. Cookie and Authorization flags are set by the caller.
pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();
    for value in headers.get_all(http::header::CACHE_CONTROL) {
        for directive in value.to_str().unwrap_or("").split(',') {
            let directive = directive.trim();
            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim().to_ascii_lowercase(), Some(a.trim().trim_matches('"'))),
                None => (directive.to_ascii_lowercase(), None),
            };
            let num = |a: Option<&str>| a.and_then(|s| s.parse::<i64>().ok()).unwrap_or(-1);
            match name.as_str() {
                "no-cache" => cc.flags |= CacheFlags::NO_CACHE,
                "no-store" => cc.flags |= CacheFlags::NO_STORE,
                "no-transform" => cc.flags |= CacheFlags::NO_TRANSFORM,
                "public" => cc.flags |= CacheFlags::PUBLIC,
                "private" => cc.flags |= CacheFlags::PRIVATE,
                "must-revalidate" => cc.flags |= CacheFlags::MUST_REVALIDATE,
                "proxy-revalidate" => cc.flags |= CacheFlags::PROXY_REVALIDATE,
                "only-if-cached" => cc.flags |= CacheFlags::ONLY_IF_CACHED,
                "max-age" => cc.max_age = num(arg),
                "s-maxage" => cc.s_maxage = num(arg),
                "min-fresh" => cc.min_fresh = num(arg),
                // max-stale with no argument means "any amount of stale".
                "max-stale" => cc.max_stale = if arg.is_some() { num(arg) } else { i64::MAX / 4 },
                _ => {}
            }
        }
    }
    if let Some(pragma) = headers.get(http::header::PRAGMA) {
        if pragma.to_str().unwrap_or("").to_ascii_lowercase().contains("no-cache") {
            cc.flags |= CacheFlags::NO_CACHE;
        }
    }
    cc
}

/// Parse a Range header. Only single ranges are honoured; anything else
/// (multiple ranges, non-byte units) is ignored and the full body served.
pub fn parse_range(headers: &HeaderMap) -> Option<ByteRange> {
    let value = headers.get(http::header::RANGE)?.to_str().ok()?;
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (from, to) = spec.split_once('-')?;
    let from = from.trim();
    let to = to.trim();
    if from.is_empty() {
        // Suffix range: last n bytes; resolved against the object length.
        let n: i64 = to.parse().ok()?;
        if n <= 0 {
            return None;
        }
        return Some(ByteRange { from: -n, to: -1 });
    }
    let start: i64 = from.parse().ok()?;
    if to.is_empty() {
        return Some(ByteRange { from: start, to: -1 });
    }
    let last: i64 = to.parse().ok()?;
    if last < start {
        return None;
    }
    Some(ByteRange { from: start, to: last + 1 })
}

/// Parse a Content-Range header as `(first, one_past_last, total)` with `-1`
/// for an unknown (`*`) total. Returns `None` for unsatisfied-range forms.
pub fn parse_content_range(headers: &HeaderMap) -> Option<(i64, i64, i64)> {
    let value = headers.get(http::header::CONTENT_RANGE)?.to_str().ok()?;
    let spec = value.trim().strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let total = if total.trim() == "*" { -1 } else { total.trim().parse().ok()? };
    let (first, last) = range.split_once('-')?;
    let first: i64 = first.trim().parse().ok()?;
    let last: i64 = last.trim().parse().ok()?;
    if last < first {
        return None;
    }
    Some((first, last + 1, total))
}

/// Digest the condition headers of a request.
pub fn parse_conditions(headers: &HeaderMap) -> RequestCondition {
    let date = |name: HeaderName| {
        headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(parse_date)
            .unwrap_or(-1)
    };
    let text = |name: HeaderName| {
        headers.get(&name).and_then(|v| v.to_str().ok()).map(|s| s.trim().to_string())
    };
    RequestCondition {
        if_none_match: text(http::header::IF_NONE_MATCH),
        if_modified_since: date(http::header::IF_MODIFIED_SINCE),
        if_match: text(http::header::IF_MATCH),
        if_unmodified_since: date(http::header::IF_UNMODIFIED_SINCE),
        if_range: text(http::header::IF_RANGE),
    }
}

/// Parse an HTTP date to epoch seconds, `-1` on failure.
pub fn parse_date(value: &str) -> i64 {
    httpdate::parse_http_date(value.trim())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(-1)
}

/// Format epoch seconds as an RFC 7231 date.
pub fn format_date(secs: i64) -> String {
    let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs.max(0) as u64);
    httpdate::fmt_http_date(t)
}

/// True for a strong entity tag (not weak, properly quoted).
pub fn is_strong_etag(etag: &str) -> bool {
    let etag = etag.trim();
    etag.starts_with('"') && etag.ends_with('"') && etag.len() >= 2
}

/// True when two entity tags match strongly (byte equality of strong tags).
pub fn etag_match(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

const HOP_BY_HOP: [HeaderName; 7] = [
    http::header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    http::header::TE,
    http::header::TRAILER,
    http::header::UPGRADE,
    http::header::PROXY_AUTHENTICATE,
    HeaderName::from_static("proxy-authorization"),
];

/// Strip hop-by-hop headers, connection-named headers, and framing headers
/// that are recomputed on every serve (Content-Length, Transfer-Encoding,
/// Age, Content-Range, Proxy-Connection).
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut named: Vec<String> = Vec::new();
    for value in headers.get_all(http::header::CONNECTION) {
        for token in split_tokens(value) {
            named.push(token);
        }
    }
    let mut out = HeaderMap::with_capacity(headers.len());
    'outer: for (name, value) in headers {
        if HOP_BY_HOP.iter().any(|h| h == name) {
            continue;
        }
        match name.as_str() {
            "proxy-connection" | "transfer-encoding" | "content-length" | "age"
            | "content-range" => continue,
            _ => {}
        }
        for token in &named {
            if name.as_str() == token {
                continue 'outer;
            }
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Serialize headers as `Name: value\r\n` lines, no terminating blank line.
pub fn serialize_headers(headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(headers.len() * 32);
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parse a bare header block (no request/status line) back into a map.
/// Unparseable lines are skipped, matching the lenient disk-load path.
pub fn parse_header_block(bytes: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for line in bytes.split(|&b| b == b'\n') {
        let line = if line.ends_with(b"\r") { &line[..line.len() - 1] } else { line };
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else { continue };
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name), HeaderValue::from_bytes(value))
        {
            headers.append(name, value);
        }
    }
    headers
}

/// Build the Via element this proxy appends: `1.1 name[:port]`.
pub fn via_element(version: Version, name: &str, port: u16) -> String {
    let protocol = if version == Version::HTTP_10 { "1.0" } else { "1.1" };
    if port == 8123 {
        format!("{protocol} {name}")
    } else {
        format!("{protocol} {name}:{port}")
    }
}

/// True when an existing Via header already names this proxy, which means
/// the request has looped back to us.
pub fn via_loop(headers: &HeaderMap, name: &str) -> bool {
    for value in headers.get_all(http::header::VIA) {
        let text = value.to_str().unwrap_or("");
        for element in text.split(',') {
            // Elements look like "1.1 name[:port] (comment)".
            let mut parts = element.trim().split_whitespace();
            let _protocol = parts.next();
            if let Some(received_by) = parts.next() {
                let host = received_by.split(':').next().unwrap_or(received_by);
                if host.eq_ignore_ascii_case(name) {
                    return true;
                }
            }
        }
    }
    false
}

/// Vary digestion: `(present, only_host)`. A Vary naming only Host is
/// harmless for a forward proxy keyed on the full URL.
pub fn vary_info(headers: &HeaderMap) -> (bool, bool) {
    let mut present = false;
    let mut only_host = true;
    for value in headers.get_all(http::header::VARY) {
        for token in split_tokens(value) {
            present = true;
            if token != "host" {
                only_host = false;
            }
        }
    }
    (present, only_host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn end_of_headers_detection() {
        assert_eq!(find_end_of_headers(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nrest"), Some(27));
        assert_eq!(find_end_of_headers(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
        assert_eq!(find_end_of_headers(b"a\n\nb"), Some(3));
    }

    #[test]
    fn request_head_absolute_form() {
        let buf = b"GET http://o.test:8080/a/b?x=1 HTTP/1.1\r\nHost: o.test:8080\r\n\r\n";
        let (head, len) = parse_request_head(buf).unwrap().unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(head.method, Method::GET);
        match head.target {
            RequestTarget::Absolute { ref url, ref host, port, ref path } => {
                assert_eq!(url, "http://o.test:8080/a/b?x=1");
                assert_eq!(host, "o.test");
                assert_eq!(port, 8080);
                assert_eq!(path, "/a/b?x=1");
            }
            other => panic!("wrong target: {other:?}"),
        }
    }

    #[test]
    fn request_head_connect_form() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        let (head, _) = parse_request_head(buf).unwrap().unwrap();
        match head.target {
            RequestTarget::Authority { ref host, port } => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 443);
            }
            other => panic!("wrong target: {other:?}"),
        }
    }

    #[test]
    fn partial_head_is_not_an_error() {
        assert!(parse_request_head(b"GET / HT").unwrap().is_none());
    }

    #[test]
    fn transfer_info_framing() {
        let h = headers(&[("content-length", "42")]);
        let t = transfer_info(Version::HTTP_11, &h, false).unwrap();
        assert_eq!(t.content_length, 42);
        assert!(!t.chunked);
        assert!(t.persistent);

        let h = headers(&[("transfer-encoding", "chunked"), ("connection", "close")]);
        let t = transfer_info(Version::HTTP_11, &h, false).unwrap();
        assert!(t.chunked);
        assert!(!t.persistent);

        let h = headers(&[("transfer-encoding", "gzip")]);
        assert!(transfer_info(Version::HTTP_11, &h, false).is_err());

        // HTTP/1.0 defaults to close unless keep-alive is explicit.
        let h = headers(&[]);
        assert!(!transfer_info(Version::HTTP_10, &h, true).unwrap().persistent);
        let h = headers(&[("connection", "keep-alive")]);
        assert!(transfer_info(Version::HTTP_10, &h, true).unwrap().persistent);
    }

    #[test]
    fn cache_control_directives() {
        let h = headers(&[("cache-control", "no-cache, max-age=60, s-maxage=30")]);
        let cc = parse_cache_control(&h);
        assert!(cc.flags.contains(CacheFlags::NO_CACHE));
        assert_eq!(cc.max_age, 60);
        assert_eq!(cc.s_maxage, 30);

        let h = headers(&[("pragma", "no-cache")]);
        assert!(parse_cache_control(&h).flags.contains(CacheFlags::NO_CACHE));

        let h = headers(&[("cache-control", "max-stale")]);
        assert!(parse_cache_control(&h).max_stale > 1_000_000_000);
    }

    #[test]
    fn range_forms() {
        let h = headers(&[("range", "bytes=10-19")]);
        assert_eq!(parse_range(&h), Some(ByteRange { from: 10, to: 20 }));

        let h = headers(&[("range", "bytes=100-")]);
        assert_eq!(parse_range(&h), Some(ByteRange { from: 100, to: -1 }));

        let h = headers(&[("range", "bytes=-100")]);
        assert_eq!(parse_range(&h), Some(ByteRange { from: -100, to: -1 }));

        let h = headers(&[("range", "bytes=5-2")]);
        assert_eq!(parse_range(&h), None);

        let h = headers(&[("range", "bytes=0-0,5-6")]);
        assert_eq!(parse_range(&h), None);
    }

    #[test]
    fn content_range_parsing() {
        let h = headers(&[("content-range", "bytes 4090-4100/5000")]);
        assert_eq!(parse_content_range(&h), Some((4090, 4101, 5000)));
        let h = headers(&[("content-range", "bytes 0-99/*")]);
        assert_eq!(parse_content_range(&h), Some((0, 100, -1)));
    }

    #[test]
    fn hop_by_hop_stripping() {
        let h = headers(&[
            ("connection", "keep-alive, x-custom"),
            ("keep-alive", "timeout=5"),
            ("te", "trailers"),
            ("trailer", "x-t"),
            ("upgrade", "h2c"),
            ("proxy-authenticate", "Basic"),
            ("proxy-authorization", "Basic Zm9v"),
            ("x-custom", "1"),
            ("content-length", "10"),
            ("content-type", "text/plain"),
            ("etag", "\"v1\""),
        ]);
        let out = strip_hop_by_hop(&h);
        for gone in [
            "connection",
            "keep-alive",
            "te",
            "trailer",
            "upgrade",
            "proxy-authenticate",
            "proxy-authorization",
            "x-custom",
            "content-length",
        ] {
            assert!(!out.contains_key(gone), "{gone} survived stripping");
        }
        assert_eq!(out.get("content-type").unwrap(), "text/plain");
        assert_eq!(out.get("etag").unwrap(), "\"v1\"");
    }

    #[test]
    fn header_block_round_trip() {
        let h = headers(&[("content-type", "text/html"), ("etag", "\"abc\"")]);
        let bytes = serialize_headers(&h);
        let parsed = parse_header_block(&bytes);
        assert_eq!(parsed.get("content-type").unwrap(), "text/html");
        assert_eq!(parsed.get("etag").unwrap(), "\"abc\"");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn via_loop_detection() {
        let h = headers(&[("via", "1.1 other, 1.1 me:8123")]);
        assert!(via_loop(&h, "me"));
        assert!(!via_loop(&h, "someone"));
        let h = headers(&[]);
        assert!(!via_loop(&h, "me"));
    }

    #[test]
    fn vary_digestion() {
        assert_eq!(vary_info(&headers(&[("vary", "Host")])), (true, true));
        assert_eq!(vary_info(&headers(&[("vary", "Accept-Encoding")])), (true, false));
        assert_eq!(vary_info(&headers(&[("vary", "*")])), (true, false));
        assert_eq!(vary_info(&headers(&[])), (false, true));
    }

    #[test]
    fn date_round_trip() {
        let t = 1_700_000_000;
        let s = format_date(t);
        assert_eq!(parse_date(&s), t);
        assert_eq!(parse_date("not a date"), -1);
    }
}
