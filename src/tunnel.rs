//! WebSocket tunnel for hot-module-reload traffic
//!
//! The client handshake is answered locally, then the upstream socket is
//! opened with a bounded timeout and frames are pumped both ways until either
//! side goes away.

use futures::{Sink, SinkExt, Stream, StreamExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, TRANSFER_ENCODING, UPGRADE,
};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{error_response, full_body, ProxyBody, ProxyErrorCode};
use crate::forwarded::{ConnectionInfo, X_FORWARDED_FOR, X_FORWARDED_PROTO};
use crate::hotfile::Target;
use crate::proxy::TargetSource;

/// Subprotocols spoken by the dev server's HMR client
pub const HMR_SUBPROTOCOLS: &[&str] = &["vite-hmr", "vite-ping"];

/// Close reasons must fit a control frame
const MAX_CLOSE_REASON: usize = 123;

/// Time allowed for the client to answer our close frame
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("upstream WebSocket connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("upstream WebSocket connect failed: {0}")]
    Connect(#[source] WsError),
    #[error("client upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[source] WsError),
}

/// Per-connection lifecycle, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TunnelState {
    Pending,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Where one tunnel is in its lifecycle. Transitions only move forward.
#[derive(Debug)]
struct TunnelProgress {
    path: String,
    state: TunnelState,
}

impl TunnelProgress {
    fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: TunnelState::Pending,
        }
    }

    fn state(&self) -> TunnelState {
        self.state
    }

    fn advance(&mut self, next: TunnelState) {
        if next <= self.state {
            return;
        }
        debug!(path = %self.path, from = ?self.state, to = ?next, "HMR tunnel state");
        self.state = next;
    }
}

/// `Upgrade: websocket` with `Connection: upgrade`
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let headers = req.headers();
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// Subprotocols in the order the client listed them
pub fn requested_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

pub fn requests_hmr_protocol(headers: &HeaderMap) -> bool {
    requested_subprotocols(headers)
        .iter()
        .any(|p| HMR_SUBPROTOCOLS.contains(&p.as_str()))
}

/// Headers worth replaying upstream. The handshake headers are regenerated
/// by the client library.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let excluded = [
        HOST,
        CONNECTION,
        UPGRADE,
        SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION,
        SEC_WEBSOCKET_EXTENSIONS,
        SEC_WEBSOCKET_ACCEPT,
        SEC_WEBSOCKET_PROTOCOL,
        CONTENT_LENGTH,
        TRANSFER_ENCODING,
    ];
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !excluded.contains(name) && name.as_str() != "keep-alive" {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Everything the spawned tunnel task needs
struct TunnelRequest {
    path_and_query: String,
    headers: HeaderMap,
    subprotocols: Vec<String>,
}

/// Bridges browser HMR sockets to the frontend tool
#[derive(Debug, Clone)]
pub struct HmrTunnel {
    targets: TargetSource,
    open_timeout: Duration,
}

impl HmrTunnel {
    pub fn new(targets: TargetSource, open_timeout: Duration) -> Self {
        Self { targets, open_timeout }
    }

    /// Accept the client handshake and spawn the tunnel task.
    pub fn handle(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).map(|k| k.as_bytes().to_vec()) else {
            return error_response(ProxyErrorCode::BadRequest, "missing Sec-WebSocket-Key header");
        };

        let subprotocols = requested_subprotocols(req.headers());
        let mut headers = forwardable_headers(req.headers());
        if let Some(info) = req.extensions().get::<ConnectionInfo>() {
            if let Ok(value) = HeaderValue::from_str(&info.client) {
                headers.insert(X_FORWARDED_FOR, value);
            }
            if let Ok(value) = HeaderValue::from_str(&info.scheme) {
                headers.insert(X_FORWARDED_PROTO, value);
            }
        }

        let request = TunnelRequest {
            path_and_query: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            headers,
            subprotocols,
        };

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(&key));
        // Only the first requested subprotocol is honored
        if let Some(protocol) = request.subprotocols.first() {
            response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol.as_str());
        }
        let response = match response.body(full_body(Bytes::new())) {
            Ok(response) => response,
            Err(e) => {
                return error_response(ProxyErrorCode::BadRequest, format!("invalid WebSocket handshake: {}", e))
            }
        };

        let upgrade = hyper::upgrade::on(&mut req);
        let targets = self.targets.clone();
        let open_timeout = self.open_timeout;
        tokio::spawn(async move {
            let mut progress = TunnelProgress::new(request.path_and_query.clone());
            let result = run_tunnel(upgrade, targets, open_timeout, request, &mut progress).await;
            if let Err(e) = result {
                error!(path = %progress.path, state = ?progress.state(), error = %e, "HMR tunnel failed");
            }
            progress.advance(TunnelState::Closed);
        });

        response
    }
}

async fn run_tunnel(
    upgrade: OnUpgrade,
    targets: TargetSource,
    open_timeout: Duration,
    request: TunnelRequest,
    progress: &mut TunnelProgress,
) -> Result<(), TunnelError> {
    let upgraded = upgrade.await?;
    let mut client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
    debug!(path = %request.path_and_query, "Client WebSocket accepted");

    let Some(target) = targets.resolve_hmr() else {
        debug!("No rendezvous record for HMR, closing client");
        progress.advance(TunnelState::Closing);
        close_with_error(&mut client, "Frontend dev server not running").await;
        return Ok(());
    };

    progress.advance(TunnelState::Connecting);
    let upstream = match connect_upstream(&target, &request, open_timeout).await {
        Ok(upstream) => upstream,
        Err(e) => {
            // The browser's HMR client reconnects on its own
            warn!(%target, error = %e, "Upstream WebSocket unavailable");
            progress.advance(TunnelState::Closing);
            close_with_error(&mut client, &e.to_string()).await;
            return Ok(());
        }
    };

    progress.advance(TunnelState::Open);
    info!(%target, path = %request.path_and_query, "HMR tunnel open");
    let result = pump(client, upstream).await;
    progress.advance(TunnelState::Closing);
    result
}

async fn connect_upstream(
    target: &Target,
    request: &TunnelRequest,
    open_timeout: Duration,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TunnelError> {
    let mut upstream_req = target
        .ws_url(&request.path_and_query)
        .into_client_request()
        .map_err(TunnelError::Connect)?;

    let headers = upstream_req.headers_mut();
    for (name, value) in &request.headers {
        headers.append(name.clone(), value.clone());
    }
    if !request.subprotocols.is_empty() {
        let protocols = HeaderValue::from_str(&request.subprotocols.join(", "))
            .map_err(|e| TunnelError::Connect(WsError::HttpFormat(e.into())))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocols);
    }

    match tokio::time::timeout(open_timeout, tokio_tungstenite::connect_async(upstream_req)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(TunnelError::Connect(e)),
        Err(_) => Err(TunnelError::ConnectTimeout(open_timeout)),
    }
}

/// Run both forwarding loops; when one finishes the other is dropped and
/// both sockets are closed.
async fn pump<C, U>(client: WebSocketStream<C>, upstream: WebSocketStream<U>) -> Result<(), TunnelError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let result = tokio::select! {
        r = forward(&mut client_rx, &mut upstream_tx) => r,
        r = forward(&mut upstream_rx, &mut client_tx) => r,
    };

    debug!("Closing both ends of HMR tunnel");
    let _ = client_tx.close().await;
    let _ = upstream_tx.close().await;
    result
}

async fn forward<S, K>(source: &mut S, sink: &mut K) -> Result<(), TunnelError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) if is_disconnect(&e) => return Ok(()),
            Err(e) => return Err(TunnelError::Protocol(e)),
        };

        match message {
            Message::Close(frame) => {
                let _ = sink.send(Message::Close(frame)).await;
                return Ok(());
            }
            // Answered per hop by the protocol layer
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            message => {
                if let Err(e) = sink.send(message).await {
                    return if is_disconnect(&e) { Ok(()) } else { Err(TunnelError::Protocol(e)) };
                }
            }
        }
    }
    Ok(())
}

/// Normal or abrupt peer disconnects
fn is_disconnect(error: &WsError) -> bool {
    use tokio_tungstenite::tungstenite::error::ProtocolError;

    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

/// Close with 1011 and wait briefly for the client's reply.
async fn close_with_error<S>(ws: &mut WebSocketStream<S>, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Error,
        reason: truncate_reason(reason).into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "Client went away before close");
        return;
    }
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
