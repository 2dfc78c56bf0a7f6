//! Tunnel transport capability.
//!
//! A transport opens a listener for one [`TunnelDescriptor`]. The listener
//! delivers two kinds of inbound work:
//!
//! - plain HTTP requests, answered by the axum [`Router`] registered with
//!   [`TunnelListener::set_request_handler`]
//! - WebSocket connections, handed out by [`TunnelListener::accept_connection`]
//!
//! ```text
//! hybrid.rs  - Azure Relay Hybrid Connections (control channel + rendezvous)
//! local.rs   - plain TCP listener, same capability, for development and tests
//! sas.rs     - Shared Access Signature tokens for the hybrid control channel
//! ```

pub mod hybrid;
pub mod local;
pub mod sas;

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tower::ServiceExt;
use tracing::debug;

use crate::descriptor::TunnelDescriptor;

pub use hybrid::{HybridOptions, HybridTransport};
pub use local::LocalTransport;

/// Outgoing half of a framed inbound connection.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
/// Incoming half of a framed inbound connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// How inbound WebSocket connections are surfaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Message type and boundaries are preserved.
    #[default]
    Frames,
    /// Raw byte stream; boundaries are lost.
    Stream,
}

/// Byte stream with no frame boundaries.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A WebSocket connection whose frames are visible.
pub struct FramedConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
    /// Subprotocols the remote client requested, in order.
    pub protocols: Vec<String>,
    /// Subprotocol already confirmed to the client, if the transport
    /// completed the handshake itself.
    pub accepted_protocol: Option<String>,
    /// Request target as seen by the relay, tunnel prefix included.
    pub path: String,
}

/// A connection exposed only as a duplex byte stream.
pub struct RawConnection {
    pub io: Box<dyn RawStream>,
    pub protocols: Vec<String>,
    pub accepted_protocol: Option<String>,
    pub path: String,
}

/// One inbound WebSocket connection.
pub enum InboundConnection {
    Framed(FramedConnection),
    Raw(RawConnection),
}

impl InboundConnection {
    pub fn path(&self) -> &str {
        match self {
            Self::Framed(c) => &c.path,
            Self::Raw(c) => &c.path,
        }
    }

    pub fn protocols(&self) -> &[String] {
        match self {
            Self::Framed(c) => &c.protocols,
            Self::Raw(c) => &c.protocols,
        }
    }

    pub fn accepted_protocol(&self) -> Option<&str> {
        match self {
            Self::Framed(c) => c.accepted_protocol.as_deref(),
            Self::Raw(c) => c.accepted_protocol.as_deref(),
        }
    }

    /// Surface a framed connection according to `mode`.
    pub fn with_mode(conn: FramedConnection, mode: ConnectionMode) -> Self {
        match mode {
            ConnectionMode::Frames => Self::Framed(conn),
            ConnectionMode::Stream => Self::Raw(into_raw(conn, RAW_BUFFER)),
        }
    }
}

impl fmt::Debug for InboundConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Framed(_) => "framed",
            Self::Raw(_) => "raw",
        };
        f.debug_struct("InboundConnection")
            .field("kind", &kind)
            .field("path", &self.path())
            .field("protocols", &self.protocols())
            .finish()
    }
}

/// Transport-level failures.
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    WebSocket(tungstenite::Error),
    /// The relay rejected or never answered the listener handshake.
    Handshake(String),
    /// Token signing failed.
    Signing(String),
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::Handshake(msg) => write!(f, "listener handshake failed: {msg}"),
            Self::Signing(msg) => write!(f, "token signing failed: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::WebSocket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebSocket(e)
    }
}

/// Opens listeners on a relay.
pub trait TunnelTransport: Send + Sync {
    fn open_listener<'a>(
        &'a self,
        descriptor: &'a TunnelDescriptor,
    ) -> BoxFuture<'a, Result<Arc<dyn TunnelListener>, TransportError>>;
}

/// An open tunnel endpoint.
pub trait TunnelListener: Send + Sync {
    /// Address remote clients use.
    fn address(&self) -> String;

    /// Register the handler for plain HTTP requests. Replaces any previous one.
    fn set_request_handler(&self, handler: Router);

    /// Next inbound WebSocket connection, `None` once the listener is closed.
    fn accept_connection(&self) -> BoxFuture<'_, Option<InboundConnection>>;

    /// Stop accepting. In-flight requests are not interrupted.
    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Shared slot for the registered request handler.
#[derive(Clone, Default)]
pub struct HandlerSlot(Arc<RwLock<Option<Router>>>);

impl HandlerSlot {
    pub fn set(&self, router: Router) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(router);
    }

    pub fn clear(&self) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Run `request` through the handler, or answer 503 when none is set.
    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let router = self
            .0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match router {
            Some(router) => router
                .oneshot(request)
                .await
                .unwrap_or_else(|never| match never {}),
            None => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Tunnel is not accepting requests",
            )
                .into_response(),
        }
    }
}

/// Parse a `Sec-WebSocket-Protocol` header value into protocol names.
pub fn parse_protocols(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

const RAW_BUFFER: usize = 64 * 1024;
const RAW_READ_CHUNK: usize = 8 * 1024;

/// Expose a framed connection as a byte stream.
///
/// A background task copies binary and text payloads into the stream and
/// sends each chunk written to it as one binary message. The task ends when
/// either side closes.
pub fn into_raw(conn: FramedConnection, buffer: usize) -> RawConnection {
    let (local, remote) = tokio::io::duplex(buffer);
    let FramedConnection {
        mut sink,
        mut stream,
        protocols,
        accepted_protocol,
        path,
    } = conn;

    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(remote);

        let inbound = async {
            while let Some(Ok(msg)) = stream.next().await {
                let written = match msg {
                    Message::Binary(data) => writer.write_all(&data).await,
                    Message::Text(text) => writer.write_all(text.as_bytes()).await,
                    Message::Close(_) => break,
                    _ => Ok(()),
                };
                if written.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        };

        let outbound = async {
            let mut buf = vec![0u8; RAW_READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sink.send(Message::binary(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        };

        tokio::select! {
            () = inbound => {}
            () = outbound => {}
        }
        debug!("Raw stream adapter finished");
    });

    RawConnection {
        io: Box::new(local),
        protocols,
        accepted_protocol,
        path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[test]
    fn test_parse_protocols() {
        assert_eq!(parse_protocols("chat, superchat"), vec!["chat", "superchat"]);
        assert!(parse_protocols(" , ").is_empty());
    }

    #[tokio::test]
    async fn test_handler_slot_dispatch() {
        let slot = HandlerSlot::default();
        let request = Request::get("/x").body(Body::empty()).unwrap();
        assert_eq!(
            slot.dispatch(request).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        slot.set(Router::new().route("/x", get(|| async { "ok" })));
        let request = Request::get("/x").body(Body::empty()).unwrap();
        assert_eq!(slot.dispatch(request).await.status(), StatusCode::OK);

        slot.clear();
        let request = Request::get("/x").body(Body::empty()).unwrap();
        assert_eq!(
            slot.dispatch(request).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_into_raw_moves_bytes_both_ways() {
        let (to_conn_tx, to_conn_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (from_conn_tx, mut from_conn_rx) = futures::channel::mpsc::unbounded::<Message>();

        let conn = FramedConnection {
            sink: Box::pin(from_conn_tx.sink_map_err(|_| tungstenite::Error::ConnectionClosed)),
            stream: Box::pin(to_conn_rx.map(Ok::<Message, tungstenite::Error>)),
            protocols: Vec::new(),
            accepted_protocol: None,
            path: "/docs/".into(),
        };
        let mut raw = into_raw(conn, 1024);

        to_conn_tx.unbounded_send(Message::text("hello")).unwrap();
        let mut buf = [0u8; 5];
        raw.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        raw.io.write_all(b"world").await.unwrap();
        let msg = from_conn_rx.next().await.unwrap();
        assert_eq!(msg, Message::binary(b"world".to_vec()));
    }
}
