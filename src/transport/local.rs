//! Loopback transport: serves the tunnel capability on a local TCP port.
//!
//! The tunnel is reachable at `http://{addr}/{tunnel_name}/`. WebSocket
//! upgrades are accepted here and queued for
//! [`TunnelListener::accept_connection`]; everything else goes to the
//! registered request handler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, State};
use axum::http::{header, HeaderMap, Request};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::future::BoxFuture;
use futures::{stream, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    parse_protocols, ConnectionMode, FramedConnection, HandlerSlot, InboundConnection,
    TransportError, TunnelListener, TunnelTransport,
};
use crate::descriptor::TunnelDescriptor;

/// Pending WebSocket connections per listener.
const ACCEPT_BACKLOG: usize = 32;

/// Binds one TCP listener per opened tunnel.
pub struct LocalTransport {
    bind: SocketAddr,
    mode: ConnectionMode,
}

impl LocalTransport {
    pub fn new(bind: SocketAddr, mode: ConnectionMode) -> Self {
        Self { bind, mode }
    }
}

impl TunnelTransport for LocalTransport {
    fn open_listener<'a>(
        &'a self,
        descriptor: &'a TunnelDescriptor,
    ) -> BoxFuture<'a, Result<Arc<dyn TunnelListener>, TransportError>> {
        Box::pin(async move {
            let listener = TcpListener::bind(self.bind).await?;
            let local_addr = listener.local_addr()?;
            let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
            let shutdown = CancellationToken::new();
            let handler = HandlerSlot::default();

            let state = EntryState {
                handler: handler.clone(),
                accept_tx,
                mode: self.mode,
            };
            let app = Router::new().fallback(entry).with_state(state);

            let serve_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(serve_shutdown.cancelled_owned())
                    .await;
                if let Err(e) = served {
                    warn!(error = %e, "Local tunnel server error");
                }
            });

            let address = format!("http://{local_addr}/{}/", descriptor.tunnel_name);
            info!(%address, "Local tunnel listening");
            let listener: Arc<dyn TunnelListener> = Arc::new(LocalListener {
                address,
                local_addr,
                handler,
                accept_rx: Mutex::new(accept_rx),
                shutdown,
            });
            Ok(listener)
        })
    }
}

/// An open local tunnel.
pub struct LocalListener {
    address: String,
    local_addr: SocketAddr,
    handler: HandlerSlot,
    accept_rx: Mutex<mpsc::Receiver<InboundConnection>>,
    shutdown: CancellationToken,
}

impl LocalListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl TunnelListener for LocalListener {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn set_request_handler(&self, handler: Router) {
        self.handler.set(handler);
    }

    fn accept_connection(&self) -> BoxFuture<'_, Option<InboundConnection>> {
        Box::pin(async move {
            let mut rx = self.accept_rx.lock().await;
            tokio::select! {
                conn = rx.recv() => conn,
                () = self.shutdown.cancelled() => None,
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.shutdown.cancel();
            Ok(())
        })
    }
}

#[derive(Clone)]
struct EntryState {
    handler: HandlerSlot,
    accept_tx: mpsc::Sender<InboundConnection>,
    mode: ConnectionMode,
}

async fn entry(State(state): State<EntryState>, request: Request<Body>) -> Response {
    if !is_websocket_upgrade(request.headers()) {
        return state.handler.dispatch(request).await;
    }

    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let protocols = parts
        .headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(parse_protocols)
        .unwrap_or_default();
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

    // The handshake completes here, before the upstream is dialled, so the
    // client is promised its first choice and the bridge holds the upstream
    // to it.
    let accepted = protocols.first().cloned();
    let upgrade = match &accepted {
        Some(protocol) => upgrade.protocols([protocol.clone()]),
        None => upgrade,
    };
    upgrade.on_upgrade(move |socket| async move {
        let conn = InboundConnection::with_mode(
            framed(socket, protocols, accepted, path),
            state.mode,
        );
        if state.accept_tx.try_send(conn).is_err() {
            warn!("WebSocket accept backlog full or listener closed; dropping connection");
        }
    })
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Adapt an axum socket to the transport's frame types.
fn framed(
    socket: WebSocket,
    protocols: Vec<String>,
    accepted_protocol: Option<String>,
    path: String,
) -> FramedConnection {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| tungstenite::Error::Io(std::io::Error::other(e)))
        .with_flat_map(|msg: Message| stream::iter(to_axum(msg).map(Ok)));
    let stream = stream.map(|msg| {
        msg.map(from_axum)
            .map_err(|e| tungstenite::Error::Io(std::io::Error::other(e)))
    });
    FramedConnection {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
        protocols,
        accepted_protocol,
        path,
    }
}

fn to_axum(msg: Message) -> Option<ws::Message> {
    Some(match msg {
        Message::Text(text) => ws::Message::Text(text.as_str().into()),
        Message::Binary(data) => ws::Message::Binary(data),
        Message::Ping(data) => ws::Message::Ping(data),
        Message::Pong(data) => ws::Message::Pong(data),
        Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
        Message::Frame(_) => return None,
    })
}

fn from_axum(msg: ws::Message) -> Message {
    match msg {
        ws::Message::Text(text) => Message::text(text.as_str()),
        ws::Message::Binary(data) => Message::Binary(data),
        ws::Message::Ping(data) => Message::Ping(data),
        ws::Message::Pong(data) => Message::Pong(data),
        ws::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn descriptor() -> TunnelDescriptor {
        TunnelDescriptor::new("local", "Docs", "listen", "key")
    }

    #[tokio::test]
    async fn test_http_goes_to_handler() {
        let transport = LocalTransport::new("127.0.0.1:0".parse().unwrap(), ConnectionMode::Frames);
        let listener = transport.open_listener(&descriptor()).await.unwrap();
        let address = listener.address();
        assert!(address.ends_with("/docs/"));

        let before = reqwest::get(&address).await.unwrap();
        assert_eq!(before.status(), 503);

        listener.set_request_handler(Router::new().fallback(get(|| async { "handled" })));
        let after = reqwest::get(&address).await.unwrap();
        assert_eq!(after.text().await.unwrap(), "handled");

        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_is_queued_for_accept() {
        let transport = LocalTransport::new("127.0.0.1:0".parse().unwrap(), ConnectionMode::Frames);
        let listener = transport.open_listener(&descriptor()).await.unwrap();
        let ws_url = listener.address().replacen("http://", "ws://", 1) + "live?x=1";

        let client = tokio::spawn(async move {
            let (mut socket, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
            socket.send(Message::text("ping")).await.unwrap();
            socket
        });

        let conn = listener.accept_connection().await.unwrap();
        assert_eq!(conn.path(), "/docs/live?x=1");
        let InboundConnection::Framed(mut framed) = conn else {
            panic!("expected framed connection");
        };
        let first = framed.stream.next().await.unwrap().unwrap();
        assert_eq!(first, Message::text("ping"));
        drop(client.await.unwrap());

        listener.close().await.unwrap();
        assert!(listener.accept_connection().await.is_none());
    }

    #[tokio::test]
    async fn test_first_subprotocol_is_promised() {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let transport = LocalTransport::new("127.0.0.1:0".parse().unwrap(), ConnectionMode::Frames);
        let listener = transport.open_listener(&descriptor()).await.unwrap();
        let ws_url = listener.address().replacen("http://", "ws://", 1) + "live";
        let mut request = ws_url.into_client_request().unwrap();
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, "v2, chat".parse().unwrap());

        let client = tokio::spawn(async move {
            let (socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
            (socket, response)
        });

        let conn = listener.accept_connection().await.unwrap();
        assert_eq!(conn.protocols(), ["v2".to_string(), "chat".to_string()]);
        assert_eq!(conn.accepted_protocol(), Some("v2"));

        let (_socket, response) = client.await.unwrap();
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_PROTOCOL], "v2");

        listener.close().await.unwrap();
    }
}
