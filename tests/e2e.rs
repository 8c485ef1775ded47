//! End-to-end scenarios against scripted origin servers.
//!
//! Each test binds an origin on an ephemeral loopback port, a proxy in
//! front of it, and drives raw HTTP/1.1 over TCP so the wire behavior is
//! observable: cache hits, conditional revalidation, ranges, request
//! collapsing, and CONNECT tunnelling.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;

use cachew::{Config, Proxy};

const CRLF2: &[u8] = b"\r\n\r\n";

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == CRLF2).map(|i| i + 4)
}

/// A parsed client-side view of one response read to EOF.
#[derive(Debug)]
struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

fn parse_response(raw: &[u8]) -> Response {
    let head_end = find_head_end(raw).expect("incomplete response head");
    let head = std::str::from_utf8(&raw[..head_end]).expect("non-utf8 head");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("missing status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("unparseable status");
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            line.split_once(':').map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        })
        .collect();
    Response { status, headers, body: raw[head_end..].to_vec() }
}

/// One proxied GET over its own connection, read to EOF.
async fn proxy_get(proxy: SocketAddr, url: &str, extra: &str) -> Response {
    let mut stream = TcpStream::connect(proxy).await.expect("connect to proxy");
    let request = format!("GET {url} HTTP/1.1\r\nHost: ignored\r\nConnection: close\r\n{extra}\r\n");
    stream.write_all(request.as_bytes()).await.expect("write request");
    let raw = read_to_eof(&mut stream).await;
    parse_response(&raw)
}

/// A scripted origin: serves `responses[i]` to the i-th request (the last
/// entry repeats), recording request heads.
struct Origin {
    addr: SocketAddr,
    hits: Rc<Cell<usize>>,
    requests: Rc<RefCell<Vec<String>>>,
}

async fn spawn_origin(responses: Vec<Vec<u8>>) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().unwrap();
    let hits = Rc::new(Cell::new(0usize));
    let requests = Rc::new(RefCell::new(Vec::new()));

    let origin = Origin { addr, hits: hits.clone(), requests: requests.clone() };
    tokio::task::spawn_local(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            let responses = responses.clone();
            let hits = hits.clone();
            let requests = requests.clone();
            tokio::task::spawn_local(async move {
                let mut buf = BytesMut::new();
                let head_end = loop {
                    if let Some(end) = find_head_end(&buf) {
                        break end;
                    }
                    match stream.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                };
                let head = buf.split_to(head_end);
                let head_text = String::from_utf8_lossy(&head).to_string();

                // Absorb any request body announced by Content-Length.
                let body_len: usize = head_text
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                while buf.len() < body_len {
                    match stream.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }

                let index = hits.get();
                hits.set(index + 1);
                requests.borrow_mut().push(head_text);

                let response = &responses[index.min(responses.len() - 1)];
                let _ = stream.write_all(response).await;
                // Scripted origins close after one exchange.
                let _ = stream.shutdown().await;
            });
        }
    });
    origin
}

async fn spawn_proxy(config: Config) -> SocketAddr {
    let proxy = Proxy::bind(config).await.expect("bind proxy");
    let addr = proxy.local_addr().unwrap();
    tokio::task::spawn_local(async move {
        let _ = proxy.run().await;
    });
    addr
}

fn test_config() -> Config {
    Config {
        proxy_address: "127.0.0.1".parse().unwrap(),
        proxy_port: 0,
        allowed_ports: Vec::new(),
        client_timeout: 10,
        server_timeout: 10,
        ..Config::default()
    }
}

fn origin_response(headers: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    out.extend_from_slice(
        format!("Date: {}\r\n", httpdate::fmt_http_date(std::time::SystemTime::now())).as_bytes(),
    );
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(headers.as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out
}

#[tokio::test]
async fn cold_miss_then_hit_serves_from_cache_with_age() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let origin = spawn_origin(vec![origin_response(
                "Cache-Control: max-age=60\r\n",
                b"abcd",
            )])
            .await;
            let proxy = spawn_proxy(test_config()).await;
            let url = format!("http://127.0.0.1:{}/a", origin.addr.port());

            let first = proxy_get(proxy, &url, "").await;
            assert_eq!(first.status, 200);
            assert_eq!(first.body, b"abcd");

            tokio::time::sleep(Duration::from_millis(1200)).await;

            let second = proxy_get(proxy, &url, "").await;
            assert_eq!(second.status, 200);
            assert_eq!(second.body, b"abcd");
            let age: i64 = second.header("age").expect("age header").parse().unwrap();
            assert!(age >= 1, "age was {age}");

            // The origin saw exactly one request.
            assert_eq!(origin.hits.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn stale_object_is_revalidated_with_conditional() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let first = origin_response(
                "Cache-Control: max-age=0\r\nETag: \"v1\"\r\n",
                b"hello",
            );
            let not_modified =
                b"HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\nConnection: close\r\n\r\n".to_vec();
            let origin = spawn_origin(vec![first, not_modified]).await;
            let proxy = spawn_proxy(test_config()).await;
            let url = format!("http://127.0.0.1:{}/etagged", origin.addr.port());

            let prime = proxy_get(proxy, &url, "").await;
            assert_eq!(prime.status, 200);
            assert_eq!(prime.body, b"hello");

            let second = proxy_get(proxy, &url, "").await;
            assert_eq!(second.status, 200);
            assert_eq!(second.body, b"hello");

            assert_eq!(origin.hits.get(), 2);
            let requests = origin.requests.borrow();
            assert!(
                requests[1].contains("If-None-Match: \"v1\""),
                "revalidation request was: {}",
                requests[1]
            );
        })
        .await;
}

#[tokio::test]
async fn range_across_chunk_boundary() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
            let origin =
                spawn_origin(vec![origin_response("Cache-Control: max-age=60\r\n", &body)]).await;
            let proxy = spawn_proxy(test_config()).await;
            let url = format!("http://127.0.0.1:{}/big", origin.addr.port());

            let prime = proxy_get(proxy, &url, "").await;
            assert_eq!(prime.status, 200);
            assert_eq!(prime.body.len(), 5000);

            let ranged = proxy_get(proxy, &url, "Range: bytes=4090-4100\r\n").await;
            assert_eq!(ranged.status, 206);
            assert_eq!(ranged.body.len(), 11);
            assert_eq!(ranged.body, &body[4090..4101]);
            assert_eq!(ranged.header("content-range"), Some("bytes 4090-4100/5000"));
            assert_eq!(origin.hits.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn concurrent_waiters_share_one_fetch() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // An origin that trickles its body so waiters pile up.
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let origin_addr = listener.local_addr().unwrap();
            let hits = Rc::new(Cell::new(0usize));
            let origin_hits = hits.clone();
            tokio::task::spawn_local(async move {
                loop {
                    let Ok((mut stream, _)) = listener.accept().await else { break };
                    origin_hits.set(origin_hits.get() + 1);
                    let mut buf = BytesMut::new();
                    loop {
                        if find_head_end(&buf).is_some() {
                            break;
                        }
                        if matches!(stream.read_buf(&mut buf).await, Ok(0) | Err(_)) {
                            return;
                        }
                    }
                    let body = vec![b'x'; 6000];
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\
                         Cache-Control: max-age=60\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    for piece in body.chunks(2000) {
                        let _ = stream.write_all(piece).await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    let _ = stream.shutdown().await;
                }
            });

            let proxy = spawn_proxy(test_config()).await;
            let url = format!("http://127.0.0.1:{}/slow", origin_addr.port());

            let mut clients = Vec::new();
            for _ in 0..3 {
                let url = url.clone();
                clients.push(tokio::task::spawn_local(async move {
                    proxy_get(proxy, &url, "").await
                }));
            }
            for client in clients {
                let response = client.await.unwrap();
                assert_eq!(response.status, 200);
                assert_eq!(response.body.len(), 6000);
                assert!(response.body.iter().all(|&b| b == b'x'));
            }
            assert_eq!(hits.get(), 1, "origin saw more than one fetch");
        })
        .await;
}

#[tokio::test]
async fn connect_tunnel_with_half_close() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // A raw TCP origin: reads until the client half-closes, then
            // answers ten bytes and half-closes itself.
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let origin_addr = listener.local_addr().unwrap();
            let received = Rc::new(RefCell::new(Vec::new()));
            let origin_received = received.clone();
            tokio::task::spawn_local(async move {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                let mut data = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => data.extend_from_slice(&buf[..n]),
                    }
                }
                *origin_received.borrow_mut() = data;
                let _ = stream.write_all(b"0123456789").await;
                let _ = stream.shutdown().await;
            });

            let proxy = spawn_proxy(test_config()).await;

            let mut client = TcpStream::connect(proxy).await.unwrap();
            let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_addr.port());
            client.write_all(connect.as_bytes()).await.unwrap();

            // Read the tunnel acknowledgement.
            let mut buf = BytesMut::new();
            loop {
                if find_head_end(&buf).is_some() {
                    break;
                }
                let n = client.read_buf(&mut buf).await.unwrap();
                assert!(n > 0, "proxy closed before acknowledging the tunnel");
            }
            let ack = String::from_utf8_lossy(&buf).to_string();
            assert!(ack.starts_with("HTTP/1.1 200"), "tunnel refused: {ack}");
            let leftover = buf.split_off(find_head_end(&buf).unwrap());

            client.write_all(b"GET /\r\n\r\n").await.unwrap();
            client.shutdown().await.unwrap();

            let mut body = leftover.to_vec();
            body.extend_from_slice(&read_to_eof(&mut client).await);
            assert_eq!(body, b"0123456789");
            assert_eq!(received.borrow().as_slice(), b"GET /\r\n\r\n");
        })
        .await;
}

#[tokio::test]
async fn disallowed_connect_port_is_refused() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let config = Config {
                allowed_ports: vec![443],
                ..test_config()
            };
            let proxy = spawn_proxy(config).await;

            let mut client = TcpStream::connect(proxy).await.unwrap();
            client.write_all(b"CONNECT 127.0.0.1:25 HTTP/1.1\r\n\r\n").await.unwrap();
            let raw = read_to_eof(&mut client).await;
            let response = parse_response(&raw);
            assert_eq!(response.status, 403);
        })
        .await;
}

#[tokio::test]
async fn via_loop_is_refused() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let config = Config { proxy_name: "looper.test".to_string(), ..test_config() };
            let proxy = spawn_proxy(config).await;

            let response = proxy_get(
                proxy,
                "http://unreachable.invalid/x",
                "Via: 1.1 looper.test\r\n",
            )
            .await;
            assert_eq!(response.status, 504);
        })
        .await;
}

#[tokio::test]
async fn post_streams_body_and_supersedes_cache() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let get_response = origin_response("Cache-Control: max-age=60\r\n", b"old entity");
            let post_response = origin_response("", b"created");
            let fresh_get = origin_response("Cache-Control: max-age=60\r\n", b"new entity");
            let origin = spawn_origin(vec![get_response, post_response, fresh_get]).await;
            let proxy = spawn_proxy(test_config()).await;
            let url = format!("http://127.0.0.1:{}/resource", origin.addr.port());

            let prime = proxy_get(proxy, &url, "").await;
            assert_eq!(prime.body, b"old entity");

            // POST through the proxy.
            let mut stream = TcpStream::connect(proxy).await.unwrap();
            let request = format!(
                "POST {url} HTTP/1.1\r\nHost: ignored\r\nContent-Length: 7\r\n\
                 Connection: close\r\n\r\npayload"
            );
            stream.write_all(request.as_bytes()).await.unwrap();
            let raw = read_to_eof(&mut stream).await;
            let posted = parse_response(&raw);
            assert_eq!(posted.status, 200);
            assert_eq!(posted.body, b"created");

            // The origin saw the body.
            {
                let requests = origin.requests.borrow();
                assert!(requests[1].starts_with("POST /resource"));
            }

            // The cached entity was superseded; the next GET refetches.
            let after = proxy_get(proxy, &url, "").await;
            assert_eq!(after.body, b"new entity");
            assert_eq!(origin.hits.get(), 3);
        })
        .await;
}

#[tokio::test]
async fn local_document_root_serving() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let docs = tempfile::tempdir().unwrap();
            std::fs::write(docs.path().join("hello.txt"), b"local content").unwrap();

            let config = Config {
                local_document_root: Some(docs.path().to_path_buf()),
                ..test_config()
            };
            let proxy = spawn_proxy(config).await;

            let response = proxy_get(proxy, "/hello.txt", "").await;
            assert_eq!(response.status, 200);
            assert_eq!(response.body, b"local content");
            assert_eq!(response.header("content-type"), Some("text/plain"));

            let missing = proxy_get(proxy, "/nope.txt", "").await;
            assert_eq!(missing.status, 404);

            let traversal = proxy_get(proxy, "/../secret", "").await;
            assert_eq!(traversal.status, 403);
        })
        .await;
}

#[tokio::test]
async fn disk_cache_survives_memory_eviction() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let cache_dir = tempfile::tempdir().unwrap();
            let body: Vec<u8> = (0..9000u32).map(|i| (i % 199) as u8).collect();
            let origin =
                spawn_origin(vec![origin_response("Cache-Control: max-age=60\r\n", &body)]).await;

            let config = Config {
                disk_cache_root: Some(cache_dir.path().to_path_buf()),
                ..test_config()
            };
            let proxy = Proxy::bind(config).await.unwrap();
            let proxy_addr = proxy.local_addr().unwrap();
            let core = proxy.core();
            tokio::task::spawn_local(async move {
                let _ = proxy.run().await;
            });

            let url = format!("http://127.0.0.1:{}/spilled", origin.addr.port());
            let prime = proxy_get(proxy_addr, &url, "").await;
            assert_eq!(prime.body, body);

            // Mirror the object to disk, then drop every in-memory chunk.
            core.flush();
            let obj = core
                .store
                .find(cachew::ObjectKind::Http, &cachew::Atom::intern(url.as_bytes()))
                .expect("object still public");
            obj.strip_covered_chunks(obj.disk_size());
            assert_eq!(obj.chunks_in_memory(), 0, "chunks were not spilled");

            let again = proxy_get(proxy_addr, &url, "").await;
            assert_eq!(again.status, 200);
            assert_eq!(again.body, body);
            assert_eq!(origin.hits.get(), 1, "disk miss forced a refetch");
        })
        .await;
}
