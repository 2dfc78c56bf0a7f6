//! Azure Relay Hybrid Connections listener.
//!
//! The listener keeps one outbound control WebSocket to the relay, with
//! exponential-backoff reconnect and periodic token renewal. Everything
//! else is driven by JSON commands arriving on it:
//!
//! | Command   | Meaning                              | Action                                   |
//! |-----------|--------------------------------------|------------------------------------------|
//! | `accept`  | a client opened a WebSocket          | connect to `address`, queue the socket   |
//! | `request` | a client sent an HTTP request        | run the handler, send a `response`       |
//!
//! Request bodies follow their `request` command as one binary frame. A
//! `request` without `method` was too large for the control channel; its
//! command and body are read from the rendezvous socket at `address`.
//! Responses up to 64 KiB that complete within two seconds go back on the
//! control channel. Larger or slower ones are streamed over a rendezvous
//! socket.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{
    parse_protocols, sas, ConnectionMode, FramedConnection, HandlerSlot, InboundConnection,
    TransportError, TunnelListener, TunnelTransport,
};
use crate::descriptor::TunnelDescriptor;
use crate::proxy::headers;

/// Largest response body sent inline on the control channel.
const MAX_CONTROL_BODY: usize = 64 * 1024;
/// Pending WebSocket connections per listener.
const ACCEPT_BACKLOG: usize = 32;
/// How long a response body may stay open before its headers are sent and
/// the rest is streamed over a rendezvous socket.
const INLINE_FLUSH: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RendezvousSink = SplitSink<WsStream, Message>;

/// Type alias for the shared control-channel sink.
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct HybridOptions {
    pub mode: ConnectionMode,
    /// Initial reconnect backoff (default 5s).
    pub reconnect_delay: Duration,
    /// Backoff ceiling (default 60s).
    pub reconnect_max_delay: Duration,
    /// Lifetime of each SAS token; renewed at half-life (default 1h).
    pub token_ttl: Duration,
    /// Replaces `wss://{namespace}` as the relay endpoint, e.g. for an emulator.
    pub relay_endpoint: Option<String>,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::Frames,
            reconnect_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            token_ttl: sas::DEFAULT_TTL,
            relay_endpoint: None,
        }
    }
}

/// Opens Hybrid Connection listeners.
pub struct HybridTransport {
    options: HybridOptions,
}

impl HybridTransport {
    pub fn new(options: HybridOptions) -> Self {
        Self { options }
    }
}

impl TunnelTransport for HybridTransport {
    fn open_listener<'a>(
        &'a self,
        descriptor: &'a TunnelDescriptor,
    ) -> BoxFuture<'a, Result<Arc<dyn TunnelListener>, TransportError>> {
        Box::pin(async move {
            let endpoint = Endpoint::new(descriptor, self.options.relay_endpoint.as_deref());
            let first = endpoint.connect(self.options.token_ttl).await?;
            info!(entity = %endpoint.entity, "Hybrid: control channel connected");

            let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
            let shared = Arc::new(Shared {
                endpoint,
                handler: HandlerSlot::default(),
                accept_tx,
                shutdown: CancellationToken::new(),
                options: self.options.clone(),
            });
            let span = info_span!("hybrid", entity = %shared.endpoint.entity);
            tokio::spawn(control_loop(shared.clone(), first).instrument(span));

            let listener: Arc<dyn TunnelListener> = Arc::new(HybridListener {
                address: descriptor.public_address(),
                shared,
                accept_rx: Mutex::new(accept_rx),
            });
            Ok(listener)
        })
    }
}

/// Where and how to connect the control channel.
struct Endpoint {
    /// `wss://{namespace}` unless overridden.
    base: String,
    namespace_fqdn: String,
    entity: String,
    key_name: String,
    key: String,
}

impl Endpoint {
    fn new(descriptor: &TunnelDescriptor, relay_endpoint: Option<&str>) -> Self {
        let namespace_fqdn = descriptor.namespace_fqdn();
        let base = relay_endpoint.map_or_else(
            || format!("wss://{namespace_fqdn}"),
            |b| b.trim_end_matches('/').to_string(),
        );
        Self {
            base,
            namespace_fqdn,
            entity: descriptor.tunnel_name.clone(),
            key_name: descriptor.policy_name.clone(),
            key: descriptor.policy_key.clone(),
        }
    }

    fn listen_url(&self) -> String {
        format!(
            "{}/$hc/{}?sb-hc-action=listen&sb-hc-id={}",
            self.base,
            self.entity,
            Uuid::new_v4()
        )
    }

    fn token(&self, ttl: Duration) -> Result<String, TransportError> {
        let resource = sas::resource_uri(&self.namespace_fqdn, &self.entity);
        sas::token(&resource, &self.key_name, &self.key, ttl)
    }

    async fn connect(&self, ttl: Duration) -> Result<WsStream, TransportError> {
        let mut request = self.listen_url().into_client_request()?;
        let token = HeaderValue::from_str(&self.token(ttl)?)
            .map_err(|e| TransportError::Signing(e.to_string()))?;
        request
            .headers_mut()
            .insert(HeaderName::from_static("servicebusauthorization"), token);
        match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _response)) => Ok(ws),
            Err(tungstenite::Error::Http(response)) => Err(TransportError::Handshake(format!(
                "relay answered HTTP {}",
                response.status()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// State shared by the listener handle and its background tasks.
struct Shared {
    endpoint: Endpoint,
    handler: HandlerSlot,
    accept_tx: mpsc::Sender<InboundConnection>,
    shutdown: CancellationToken,
    options: HybridOptions,
}

/// An open Hybrid Connection listener.
pub struct HybridListener {
    address: String,
    shared: Arc<Shared>,
    accept_rx: Mutex<mpsc::Receiver<InboundConnection>>,
}

impl TunnelListener for HybridListener {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn set_request_handler(&self, handler: Router) {
        self.shared.handler.set(handler);
    }

    fn accept_connection(&self) -> BoxFuture<'_, Option<InboundConnection>> {
        Box::pin(async move {
            let mut rx = self.accept_rx.lock().await;
            tokio::select! {
                conn = rx.recv() => conn,
                () = self.shared.shutdown.cancelled() => None,
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.shared.shutdown.cancel();
            Ok(())
        })
    }
}

// ─── Control channel ─────────────────────────────────────────────────────────

/// Reason the control channel ended.
enum DisconnectReason {
    /// Listener closed locally.
    Shutdown,
    /// Relay closed the socket or EOF.
    Dropped,
}

/// Run the control channel until shutdown, reconnecting on failure.
async fn control_loop(shared: Arc<Shared>, first: WsStream) {
    let options = &shared.options;
    let mut delay = options.reconnect_delay;
    let mut next = Some(first);

    loop {
        let ws = match next.take() {
            Some(ws) => ws,
            None => {
                info!("Hybrid: reconnecting control channel");
                match shared.endpoint.connect(options.token_ttl).await {
                    Ok(ws) => {
                        info!("Hybrid: control channel reconnected");
                        delay = options.reconnect_delay;
                        ws
                    }
                    Err(e) => {
                        warn!(
                            "Hybrid: reconnect failed: {e}, retrying in {}s",
                            delay.as_secs()
                        );
                        if !pause(&shared, delay).await {
                            break;
                        }
                        delay = (delay * 2).min(options.reconnect_max_delay);
                        continue;
                    }
                }
            }
        };

        match run_control(&shared, ws).await {
            Ok(DisconnectReason::Shutdown) => break,
            Ok(DisconnectReason::Dropped) => info!("Hybrid: control channel closed by relay"),
            Err(e) => warn!("Hybrid: control channel error: {e}"),
        }
        if !pause(&shared, delay).await {
            break;
        }
        delay = (delay * 2).min(options.reconnect_max_delay);
    }
    info!("Hybrid: control loop stopped");
}

/// Sleep for `delay`; `false` when shutdown interrupted it.
async fn pause(shared: &Shared, delay: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = shared.shutdown.cancelled() => false,
    }
}

async fn run_control(
    shared: &Arc<Shared>,
    ws: WsStream,
) -> Result<DisconnectReason, TransportError> {
    let (sink, mut stream) = ws.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    let renew_task = tokio::spawn(
        renew_tokens(shared.clone(), sink.clone()).instrument(tracing::Span::current()),
    );
    let result = read_commands(shared, &sink, &mut stream).await;
    renew_task.abort();
    result
}

async fn read_commands(
    shared: &Arc<Shared>,
    sink: &WsSink,
    stream: &mut SplitStream<WsStream>,
) -> Result<DisconnectReason, TransportError> {
    // A request whose body frame has not arrived yet.
    let mut pending: Option<RequestCommand> = None;

    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            () = shared.shutdown.cancelled() => {
                let mut sink = sink.lock().await;
                let _ = sink.send(Message::Close(None)).await;
                return Ok(DisconnectReason::Shutdown);
            }
        };
        let Some(msg) = msg else {
            return Ok(DisconnectReason::Dropped);
        };

        match msg? {
            Message::Text(text) => match serde_json::from_str::<ControlCommand>(&text) {
                Ok(ControlCommand::Accept(accept)) => {
                    debug!(id = %accept.id, "Hybrid: accept");
                    tokio::spawn(
                        accept_rendezvous(shared.clone(), accept)
                            .instrument(tracing::Span::current()),
                    );
                }
                Ok(ControlCommand::Request(request)) => {
                    if request.method.is_some() && request.body {
                        if let Some(displaced) = pending.replace(request) {
                            warn!(request_id = %displaced.id, "Hybrid: request body never arrived");
                            spawn_failure(sink, displaced, StatusCode::INTERNAL_SERVER_ERROR);
                        }
                    } else {
                        spawn_request(shared, sink, request, None);
                    }
                }
                Err(e) => debug!(error = %e, "Hybrid: ignoring control message"),
            },
            Message::Binary(body) => match pending.take() {
                Some(request) => spawn_request(shared, sink, request, Some(body)),
                None => debug!("Hybrid: binary frame without a pending request"),
            },
            Message::Close(_) => return Ok(DisconnectReason::Dropped),
            _ => {}
        }
    }
}

/// Send `renewToken` at half the token lifetime.
async fn renew_tokens(shared: Arc<Shared>, sink: WsSink) {
    let ttl = shared.options.token_ttl;
    let period = (ttl / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        let token = match shared.endpoint.token(ttl) {
            Ok(token) => token,
            Err(e) => {
                warn!("Hybrid: token renewal failed: {e}");
                continue;
            }
        };
        let msg = serde_json::json!({ "renewToken": { "token": token } });
        let mut sink = sink.lock().await;
        if sink.send(Message::text(msg.to_string())).await.is_err() {
            break;
        }
        debug!("Hybrid: token renewed");
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ControlCommand {
    Accept(AcceptCommand),
    Request(RequestCommand),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptCommand {
    address: String,
    id: String,
    #[serde(default)]
    connect_headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestCommand {
    /// Rendezvous address; present for large requests and responses.
    address: Option<String>,
    id: String,
    request_target: Option<String>,
    method: Option<String>,
    #[serde(default)]
    request_headers: HashMap<String, String>,
    #[serde(default)]
    body: bool,
}

#[derive(Serialize)]
struct ResponseEnvelope<'a> {
    response: ResponseCommand<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseCommand<'a> {
    request_id: &'a str,
    status_code: u16,
    status_description: &'a str,
    response_headers: BTreeMap<String, String>,
    body: bool,
}

// ─── Accept ──────────────────────────────────────────────────────────────────

async fn accept_rendezvous(shared: Arc<Shared>, accept: AcceptCommand) {
    let ws = match tokio_tungstenite::connect_async(accept.address.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(id = %accept.id, "Hybrid: rendezvous connect failed: {e}");
            return;
        }
    };
    let protocols = header_value(&accept.connect_headers, "sec-websocket-protocol")
        .map(parse_protocols)
        .unwrap_or_default();
    let path = relay_path(&accept.address);

    let (sink, stream) = ws.split();
    let framed = FramedConnection {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
        protocols,
        accepted_protocol: None,
        path,
    };
    let conn = InboundConnection::with_mode(framed, shared.options.mode);
    if shared.accept_tx.send(conn).await.is_err() {
        debug!(id = %accept.id, "Hybrid: listener closed, dropping connection");
    }
}

/// Relay-side request target for a rendezvous address: the path without the
/// `/$hc` prefix, with `sb-hc-*` parameters removed from the query.
fn relay_path(address: &str) -> String {
    let Ok(url) = url::Url::parse(address) else {
        return "/".to_string();
    };
    let path = url.path();
    let path = path.strip_prefix("/$hc").unwrap_or(path);
    let path = if path.is_empty() { "/" } else { path };

    let query: Vec<String> = url
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("sb-hc-"))
        .map(ToString::to_string)
        .collect();
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", query.join("&"))
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

// ─── Requests ────────────────────────────────────────────────────────────────

fn spawn_request(shared: &Arc<Shared>, sink: &WsSink, command: RequestCommand, body: Option<Bytes>) {
    let shared = shared.clone();
    let control = sink.clone();
    tokio::spawn(
        async move {
            let id = command.id.clone();
            if let Err(e) = serve_request(&shared, &control, command, body).await {
                warn!(request_id = %id, "Hybrid: request failed: {e}");
            }
        }
        .instrument(tracing::Span::current()),
    );
}

/// Answer `command` with a bare status, without running the handler.
fn spawn_failure(sink: &WsSink, command: RequestCommand, status: StatusCode) {
    let control = sink.clone();
    tokio::spawn(
        async move {
            if let Err(e) = send_response(&control, None, &command, status.into_response()).await {
                warn!(request_id = %command.id, "Hybrid: failure response not sent: {e}");
            }
        }
        .instrument(tracing::Span::current()),
    );
}

async fn serve_request(
    shared: &Shared,
    control: &WsSink,
    command: RequestCommand,
    body: Option<Bytes>,
) -> Result<(), TransportError> {
    let (command, body, rendezvous) = if command.method.is_some() {
        (command, body, None)
    } else {
        let address = command.address.as_deref().ok_or_else(|| {
            TransportError::Protocol("request has neither method nor address".into())
        })?;
        let (ws, _response) = tokio_tungstenite::connect_async(address).await?;
        let (sink, mut stream) = ws.split();
        let mut command = read_request_command(&mut stream).await?;
        let body = if command.body {
            read_binary(&mut stream).await?
        } else {
            None
        };
        if command.address.is_none() {
            command.address = Some(address.to_string());
        }
        (command, body, Some(sink))
    };

    let request = build_request(&command, body)?;
    let response = shared.handler.dispatch(request).await;
    send_response(control, rendezvous, &command, response).await
}

async fn read_request_command(
    stream: &mut SplitStream<WsStream>,
) -> Result<RequestCommand, TransportError> {
    while let Some(msg) = stream.next().await {
        if let Message::Text(text) = msg? {
            return match serde_json::from_str::<ControlCommand>(&text) {
                Ok(ControlCommand::Request(request)) => Ok(request),
                Ok(ControlCommand::Accept(_)) => Err(TransportError::Protocol(
                    "expected request on rendezvous".into(),
                )),
                Err(e) => Err(TransportError::Protocol(e.to_string())),
            };
        }
    }
    Err(TransportError::Protocol(
        "rendezvous closed before request".into(),
    ))
}

async fn read_binary(stream: &mut SplitStream<WsStream>) -> Result<Option<Bytes>, TransportError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Binary(data) => return Ok(Some(data)),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(None)
}

fn build_request(command: &RequestCommand, body: Option<Bytes>) -> Result<Request<Body>, TransportError> {
    let method = Method::from_bytes(command.method.as_deref().unwrap_or("GET").as_bytes())
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    let target = command.request_target.as_deref().unwrap_or("/");
    let uri = target
        .parse()
        .map_err(|e| TransportError::Protocol(format!("bad request target '{target}': {e}")))?;

    let body = body.unwrap_or_default();
    let body_len = body.len();
    let mut request = Request::new(Body::from(body));
    *request.method_mut() = method;
    *request.uri_mut() = uri;

    let headers = request.headers_mut();
    for (name, value) in &command.request_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    if body_len > 0 && !headers.contains_key(header::CONTENT_LENGTH) {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    }
    Ok(request)
}

async fn send_response(
    control: &WsSink,
    rendezvous: Option<RendezvousSink>,
    command: &RequestCommand,
    response: Response,
) -> Result<(), TransportError> {
    let (parts, body) = response.into_parts();
    let mut chunks = body.into_data_stream();

    // Buffer up to the inline limit; whatever does not fit goes to a
    // rendezvous. Without an address to stream to, only the size bounds it.
    let can_stream = rendezvous.is_some() || command.address.is_some();
    let flush = tokio::time::sleep(INLINE_FLUSH);
    tokio::pin!(flush);
    let mut head: Vec<u8> = Vec::new();
    let mut overflow: Option<Bytes> = None;
    let mut complete = false;
    loop {
        let next = tokio::select! {
            next = chunks.next() => next,
            () = &mut flush, if can_stream => {
                debug!(request_id = %command.id, "Hybrid: response still open, streaming");
                break;
            }
        };
        let Some(chunk) = next else {
            complete = true;
            break;
        };
        let chunk = chunk.map_err(|e| TransportError::Protocol(e.to_string()))?;
        if head.len() + chunk.len() > MAX_CONTROL_BODY {
            overflow = Some(chunk);
            break;
        }
        head.extend_from_slice(&chunk);
    }

    let envelope = ResponseEnvelope {
        response: ResponseCommand {
            request_id: &command.id,
            status_code: parts.status.as_u16(),
            status_description: parts.status.canonical_reason().unwrap_or(""),
            response_headers: headers::flatten(&parts.headers).into_iter().collect(),
            body: !head.is_empty() || !complete,
        },
    };
    let envelope = serde_json::to_string(&envelope)
        .map_err(|e| TransportError::Protocol(e.to_string()))?;

    if rendezvous.is_none() && complete {
        let mut sink = control.lock().await;
        sink.send(Message::text(envelope)).await?;
        if !head.is_empty() {
            sink.send(Message::binary(head)).await?;
        }
        return Ok(());
    }

    let mut sink = match rendezvous {
        Some(sink) => sink,
        None => {
            let address = command.address.as_deref().ok_or_else(|| {
                TransportError::Protocol("response cannot be inlined and no rendezvous address".into())
            })?;
            let (ws, _response) = tokio_tungstenite::connect_async(address).await?;
            ws.split().0
        }
    };
    sink.send(Message::text(envelope)).await?;
    if !head.is_empty() {
        sink.send(Message::binary(head)).await?;
    }
    if let Some(chunk) = overflow {
        sink.send(Message::Binary(chunk)).await?;
    }
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| TransportError::Protocol(e.to_string()))?;
        sink.send(Message::Binary(chunk)).await?;
    }
    sink.close().await?;
    Ok(())
}
