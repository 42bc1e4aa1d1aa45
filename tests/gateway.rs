//! Integration tests for the dev gateway

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use vitegate::app::{Application, BackendApp};
use vitegate::config::Config;
use vitegate::hotfile::{HotFile, Rendezvous};
use vitegate::server::{upstream_from_config, DevServer, Gateway};

/// A running gateway; dropping it stops the accept loop
struct TestGateway {
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

async fn start_gateway(config: &str, hot_file: &Path) -> TestGateway {
    let config: Config = toml::from_str(config).unwrap();
    config.validate().unwrap();

    let rendezvous = Arc::new(Rendezvous::new(hot_file));
    let app: Arc<dyn Application> =
        Arc::new(BackendApp::from_config(&config, upstream_from_config(&config)).unwrap());
    let gateway = Arc::new(Gateway::from_config(&config, app, rendezvous).unwrap());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = DevServer::bind("127.0.0.1:0".parse().unwrap(), gateway, shutdown_rx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    TestGateway {
        addr,
        _shutdown: shutdown_tx,
    }
}

/// Plain HTTP upstream standing in for the dev server. Reports what it saw
/// through `x-seen-*` response headers.
async fn spawn_upstream(accepts: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(upstream_response(req).await)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn upstream_response(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let seen = |name: &str| {
        req.headers()
            .get(name)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""))
    };
    let mut builder = Response::builder()
        .header("x-seen-host", seen("host"))
        .header("x-seen-forwarded-host", seen("x-forwarded-host"))
        .header("x-seen-forwarded-for", seen("x-forwarded-for"))
        .header("x-seen-forwarded-proto", seen("x-forwarded-proto"))
        .header("x-seen-request-id", seen("x-request-id"))
        .header("x-seen-accept-encoding", seen("accept-encoding"));

    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let body = req.into_body().collect().await.unwrap().to_bytes();

    let (status, body) = match path.as_str() {
        "/@vite/client" => {
            builder = builder
                .header("content-type", "text/javascript")
                .header("x-custom", "kept")
                .header("connection", "keep-alive")
                .header("keep-alive", "timeout=5");
            (StatusCode::OK, Bytes::from_static(b"console.log('vite client')"))
        }
        "/@vite/missing" => (StatusCode::NOT_FOUND, Bytes::from_static(b"no such module")),
        "/echo" => (StatusCode::CREATED, body),
        _ => (StatusCode::OK, Bytes::from(format!("rendered {} {}", method, path))),
    };

    builder.status(status).body(Full::new(body)).unwrap()
}

/// WebSocket echo server that accepts the first requested subprotocol
async fn spawn_ws_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let callback = |req: &WsRequest, mut resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
                    if let Some(protocols) = req.headers().get("sec-websocket-protocol") {
                        let first = protocols.to_str().unwrap().split(',').next().unwrap().trim().to_string();
                        resp.headers_mut()
                            .insert("sec-websocket-protocol", first.parse().unwrap());
                    }
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    } else if message.is_close() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn send(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &'static [u8],
) -> (StatusCode, HeaderMap, String) {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", addr, path));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Full::new(Bytes::from_static(body))).unwrap();

    let response = tokio::time::timeout(Duration::from_secs(10), client().request(request))
        .await
        .expect("gateway answered in time")
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, HeaderMap, String) {
    send(addr, "GET", path, &[], b"").await
}

fn publish(hot_file: &Path, addr: SocketAddr) {
    HotFile::new(hot_file).write(&format!("http://{}/", addr)).unwrap();
}

#[tokio::test]
async fn test_proxies_allow_listed_path() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let accepts = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(accepts.clone()).await;
    publish(&hot, upstream);

    let gateway = start_gateway("", &hot).await;
    let (status, headers, body) = get(gateway.addr, "/@vite/client").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "console.log('vite client')");
    assert!(headers.get("connection").is_none());
    assert!(headers.get("keep-alive").is_none());
    assert_eq!(headers.get("content-type").unwrap(), "text/javascript");
    assert_eq!(headers.get("x-custom").unwrap(), "kept");

    // Host rewritten to the upstream, the original travels separately
    assert_eq!(headers.get("x-seen-host").unwrap(), upstream.to_string().as_str());
    assert_eq!(
        headers.get("x-seen-forwarded-host").unwrap(),
        gateway.addr.to_string().as_str()
    );
    assert_eq!(headers.get("x-seen-forwarded-for").unwrap(), "127.0.0.1");
    assert_eq!(headers.get("x-seen-forwarded-proto").unwrap(), "http");
    assert!(!headers.get("x-seen-request-id").unwrap().is_empty());
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upstream_status_and_body_pass_through() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    publish(&hot, upstream);

    let gateway = start_gateway("", &hot).await;

    let (status, _, body) = get(gateway.addr, "/@vite/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "no such module");

    let (status, headers, body) = send(
        gateway.addr,
        "POST",
        "/static/echo",
        &[("accept-encoding", "gzip, br"), ("x-request-id", "req-42")],
        b"payload",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "rendered POST /static/echo");
    assert_eq!(headers.get("x-seen-accept-encoding").unwrap(), "");
    assert_eq!(headers.get("x-seen-request-id").unwrap(), "req-42");
}

#[tokio::test]
async fn test_not_running_without_hot_file() {
    let dir = TempDir::new().unwrap();
    let gateway = start_gateway("", &dir.path().join("hot")).await;

    let (status, headers, body) = get(gateway.addr, "/@vite/client").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers.get("x-proxy-error").unwrap(), "NOT_RUNNING");
    assert!(body.contains("not running"), "body: {body}");
}

#[tokio::test]
async fn test_hot_file_published_after_start() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let gateway = start_gateway("", &hot).await;

    let (status, _, _) = get(gateway.addr, "/@vite/client").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    publish(&hot, upstream);

    let (status, _, _) = get(gateway.addr, "/@vite/client").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_dead_upstream_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);
    publish(&hot, dead);

    let gateway = start_gateway("", &hot).await;
    let (status, headers, _) = get(gateway.addr, "/@vite/client").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers.get("x-proxy-error").unwrap(), "UPSTREAM_UNAVAILABLE");
}

#[tokio::test]
async fn test_delegates_unmatched_paths() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let accepts = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(accepts.clone()).await;
    publish(&hot, upstream);

    let gateway = start_gateway("", &hot).await;
    for path in ["/dashboard", "/", "/api/users", "/staticfile.js"] {
        let (status, _, body) = get(gateway.addr, path).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "path {path}");
        assert_eq!(body, "Not Found");
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_deny_list_never_forwards_application_routes() {
    let dir = TempDir::new().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(accepts.clone()).await;

    let config = format!(
        r#"
[frontend]
mode = "ssr"
target = "http://{}"

[app]
routes = ["/login", "/users/{{id}}"]
"#,
        upstream
    );
    let gateway = start_gateway(&config, &dir.path().join("hot")).await;

    for path in ["/login", "/users/7", "/api/items", "/docs", "/schema/openapi.json"] {
        let (status, _, _) = get(gateway.addr, path).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "path {path}");
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 0);

    let (status, _, body) = get(gateway.addr, "/about").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "rendered GET /about");
    assert!(accepts.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_delegated_requests_reach_backend() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;

    let config = format!(
        r#"
[server]
use_pool = false

[app]
backend_url = "http://{}"
"#,
        backend
    );
    let gateway = start_gateway(&config, &dir.path().join("hot")).await;

    let (status, headers, body) = get(gateway.addr, "/dashboard?tab=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "rendered GET /dashboard");
    // The backend sees the browser-facing host
    assert_eq!(headers.get("x-seen-host").unwrap(), gateway.addr.to_string().as_str());
}

#[tokio::test]
async fn test_backend_never_sees_client_forwarded_host() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;

    let config = format!(
        r#"
[app]
backend_url = "http://{}"
"#,
        backend
    );
    let gateway = start_gateway(&config, &dir.path().join("hot")).await;

    let (status, headers, _) = send(
        gateway.addr,
        "GET",
        "/dashboard",
        &[("x-forwarded-host", "evil.example.com")],
        b"",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-seen-forwarded-host").unwrap(), gateway.addr.to_string().as_str());
    assert_eq!(headers.get("x-seen-host").unwrap(), gateway.addr.to_string().as_str());
}

#[tokio::test]
async fn test_trusted_forwarded_headers() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    publish(&hot, upstream);

    let config = r#"
[forwarded]
enabled = true
trusted_hosts = "127.0.0.0/8"
"#;
    let gateway = start_gateway(config, &hot).await;

    let (status, headers, _) = send(
        gateway.addr,
        "GET",
        "/@vite/client",
        &[
            ("x-forwarded-for", "1.2.3.4, 127.0.0.1"),
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "app.example.com"),
        ],
        b"",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-seen-forwarded-for").unwrap(), "1.2.3.4");
    assert_eq!(headers.get("x-seen-forwarded-proto").unwrap(), "https");
    assert_eq!(headers.get("x-seen-forwarded-host").unwrap(), "app.example.com");
}

#[tokio::test]
async fn test_untrusted_forwarded_headers_ignored() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    publish(&hot, upstream);

    let config = r#"
[forwarded]
enabled = true
trusted_hosts = ["10.0.0.0/8"]
"#;
    let gateway = start_gateway(config, &hot).await;

    let (_, headers, _) = send(
        gateway.addr,
        "GET",
        "/@vite/client",
        &[("x-forwarded-for", "1.2.3.4"), ("x-forwarded-proto", "https")],
        b"",
    )
    .await;
    assert_eq!(headers.get("x-seen-forwarded-for").unwrap(), "127.0.0.1");
    assert_eq!(headers.get("x-seen-forwarded-proto").unwrap(), "http");
}

async fn connect_hmr(
    gateway: SocketAddr,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut request = format!("ws://{}/", gateway).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", HeaderValue::from_static("vite-hmr"));
    let (ws, response) = tokio::time::timeout(Duration::from_secs(5), tokio_tungstenite::connect_async(request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.headers().get("sec-websocket-protocol").unwrap(), "vite-hmr");
    ws
}

#[tokio::test]
async fn test_websocket_tunnel_echo() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let echo = spawn_ws_echo().await;
    publish(&hot, echo);

    let gateway = start_gateway("", &hot).await;
    let mut ws = connect_hmr(gateway.addr).await;

    for payload in ["{\"type\":\"connected\"}", "{\"type\":\"update\"}"] {
        ws.send(Message::text(payload)).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::text(payload));
    }

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_websocket_tunnel_prefers_hmr_record() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let echo = spawn_ws_echo().await;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    publish(&hot, dead);
    HotFile::new(vitegate::hotfile::hmr_path(&hot))
        .write(&format!("http://{}", echo))
        .unwrap();

    let gateway = start_gateway("", &hot).await;
    let mut ws = connect_hmr(gateway.addr).await;

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::binary(vec![1u8, 2, 3]));
}

#[tokio::test]
async fn test_websocket_closed_without_hot_file() {
    let dir = TempDir::new().unwrap();
    let gateway = start_gateway("", &dir.path().join("hot")).await;
    let mut ws = connect_hmr(gateway.addr).await;

    let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("closed in time")
        .unwrap()
        .unwrap();
    match message {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Error);
            assert!(frame.reason.contains("not running"));
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_websocket_closed_when_upstream_unreachable() {
    let dir = TempDir::new().unwrap();
    let hot = dir.path().join("hot");
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);
    publish(&hot, dead);

    let gateway = start_gateway("", &hot).await;
    let mut ws = connect_hmr(gateway.addr).await;

    let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("closed in time")
        .unwrap()
        .unwrap();
    let Message::Close(Some(frame)) = message else {
        panic!("expected close frame, got {message:?}");
    };
    assert_eq!(frame.code, CloseCode::Error);
}
