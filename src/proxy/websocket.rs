//! WebSocket bridging between an inbound tunnel connection and the upstream.
//!
//! Each bridge owns both ends for its whole life. Two pumps run concurrently
//! (inbound → upstream, upstream → inbound); the first one to finish ends the
//! session and both sides are closed best-effort.
//!
//! For [`InboundConnection::Raw`] every read chunk becomes one binary frame.
//! Original message boundaries cannot be recovered in that mode.

use std::fmt;
use std::time::Duration;

use axum::body::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{FramedConnection, InboundConnection, RawConnection};

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Ping interval on the upstream connection (default 30s).
    pub keep_alive: Duration,
    /// Read size for raw inbound streams (default 8 KiB).
    pub buffer_size: usize,
    /// Deadline for each teardown step (default 5s).
    pub close_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            buffer_size: 8 * 1024,
            close_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub enum BridgeError {
    /// The upstream WebSocket handshake failed.
    Connect {
        url: String,
        source: tungstenite::Error,
    },
    /// A requested subprotocol is not a valid header value.
    Protocols(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { url, source } => {
                write!(f, "failed to connect upstream WebSocket {url}: {source}")
            }
            Self::Protocols(value) => write!(f, "invalid subprotocol list '{value}'"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } => Some(source),
            Self::Protocols(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToUpstream,
    ToInbound,
}

/// One end of a bridged session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Inbound,
    Upstream,
}

impl Direction {
    fn source(self) -> Side {
        match self {
            Self::ToUpstream => Side::Inbound,
            Self::ToInbound => Side::Upstream,
        }
    }

    fn destination(self) -> Side {
        match self {
            Self::ToUpstream => Side::Upstream,
            Self::ToInbound => Side::Inbound,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToUpstream => write!(f, "inbound->upstream"),
            Self::ToInbound => write!(f, "upstream->inbound"),
        }
    }
}

/// How one pump stopped.
#[derive(Debug)]
enum PumpEnd {
    /// Source ended without a close frame.
    Eof,
    /// Close frame relayed.
    Closed,
    ReadFailed(String),
    WriteFailed(String),
}

/// Connect to `upstream_url` and relay frames until either side closes,
/// fails, or `cancel` fires.
///
/// Only the upstream connect can fail. Pump errors end the session and are
/// logged; teardown never fails.
pub async fn bridge(
    inbound: InboundConnection,
    upstream_url: &str,
    options: &BridgeOptions,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    // A subprotocol already confirmed to the client is the only one offered.
    let offered = match inbound.accepted_protocol() {
        Some(protocol) => vec![protocol.to_string()],
        None => inbound.protocols().to_vec(),
    };
    let request = build_request(upstream_url, &offered)?;

    let connected = tokio::select! {
        result = tokio_tungstenite::connect_async(request) => result,
        () = cancel.cancelled() => {
            reject_inbound(inbound, options, CloseCode::Away, "Relay closing").await;
            return Ok(());
        }
    };
    let upstream = match connected {
        Ok((upstream, response)) => {
            let chosen = response
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(str::trim);
            if let Some(promised) = inbound.accepted_protocol() {
                if chosen != Some(promised) {
                    warn!(
                        upstream = upstream_url,
                        promised,
                        chosen = chosen.unwrap_or(""),
                        "Upstream refused the subprotocol given to the client"
                    );
                    let (mut up_sink, _up_stream) = upstream.split();
                    close_upstream(
                        &mut up_sink,
                        close_message(CloseCode::Protocol, "Subprotocol mismatch"),
                        options.close_timeout,
                    )
                    .await;
                    reject_inbound(
                        inbound,
                        options,
                        CloseCode::Protocol,
                        "Subprotocol mismatch",
                    )
                    .await;
                    return Ok(());
                }
            }
            upstream
        }
        Err(source) => {
            if is_subprotocol_error(&source) {
                warn!(upstream = upstream_url, "Upstream refused the offered subprotocol");
                reject_inbound(inbound, options, CloseCode::Protocol, "Subprotocol mismatch")
                    .await;
            } else {
                reject_inbound(inbound, options, CloseCode::Error, "Upstream unavailable").await;
            }
            return Err(BridgeError::Connect {
                url: upstream_url.to_string(),
                source,
            });
        }
    };

    info!(upstream = upstream_url, "WebSocket session bridged");
    let (up_sink, up_stream) = upstream.split();
    match inbound {
        InboundConnection::Framed(conn) => {
            bridge_frames(conn, up_sink, up_stream, options, &cancel).await;
        }
        InboundConnection::Raw(conn) => {
            bridge_raw(conn, up_sink, up_stream, options, &cancel).await;
        }
    }
    info!(upstream = upstream_url, "WebSocket session ended");
    Ok(())
}

fn build_request(
    url: &str,
    protocols: &[String],
) -> Result<tungstenite::handshake::client::Request, BridgeError> {
    let mut request = url
        .into_client_request()
        .map_err(|source| BridgeError::Connect {
            url: url.to_string(),
            source,
        })?;
    if !protocols.is_empty() {
        let joined = protocols.join(", ");
        let value =
            HeaderValue::from_str(&joined).map_err(|_| BridgeError::Protocols(joined.clone()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(request)
}

async fn bridge_frames<K, S>(
    conn: FramedConnection,
    mut up_sink: K,
    up_stream: S,
    options: &BridgeOptions,
    cancel: &CancellationToken,
) where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let FramedConnection {
        sink: mut in_sink,
        stream: in_stream,
        ..
    } = conn;

    let ended = {
        let to_upstream = pump_frames(in_stream, &mut up_sink, Some(options.keep_alive));
        let to_inbound = pump_frames(up_stream, &mut in_sink, None);
        tokio::select! {
            end = to_upstream => Some((Direction::ToUpstream, end)),
            end = to_inbound => Some((Direction::ToInbound, end)),
            () = cancel.cancelled() => None,
        }
    };
    let fault = report(ended);

    close_upstream(&mut up_sink, upstream_close(fault), options.close_timeout).await;
    if fault == Some(Side::Upstream) {
        let _ = tokio::time::timeout(
            options.close_timeout,
            in_sink.send(close_message(CloseCode::Error, "Proxy error")),
        )
        .await;
    }
    let _ = tokio::time::timeout(options.close_timeout, in_sink.close()).await;
}

async fn bridge_raw<K, S>(
    conn: RawConnection,
    mut up_sink: K,
    up_stream: S,
    options: &BridgeOptions,
    cancel: &CancellationToken,
) where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(conn.io);

    let ended = {
        let to_upstream = pump_bytes(
            &mut reader,
            &mut up_sink,
            options.buffer_size,
            options.keep_alive,
        );
        let to_inbound = pump_payloads(up_stream, &mut writer);
        tokio::select! {
            end = to_upstream => Some((Direction::ToUpstream, end)),
            end = to_inbound => Some((Direction::ToInbound, end)),
            () = cancel.cancelled() => None,
        }
    };
    let fault = report(ended);

    // A byte stream has no close code; shutting it down is all it gets.
    close_upstream(&mut up_sink, upstream_close(fault), options.close_timeout).await;
    let _ = tokio::time::timeout(options.close_timeout, writer.shutdown()).await;
}

/// Log how the session ended and name the side whose connection failed.
fn report(ended: Option<(Direction, PumpEnd)>) -> Option<Side> {
    match ended {
        None => {
            debug!("WebSocket session cancelled");
            None
        }
        Some((direction, PumpEnd::Eof | PumpEnd::Closed)) => {
            debug!(%direction, "WebSocket pump finished");
            None
        }
        Some((direction, PumpEnd::ReadFailed(e))) => {
            warn!(%direction, error = %e, "WebSocket read failed");
            Some(direction.source())
        }
        Some((direction, PumpEnd::WriteFailed(e))) => {
            warn!(%direction, error = %e, "WebSocket write failed");
            Some(direction.destination())
        }
    }
}

/// Close frame for the upstream: 1011 when the inbound side failed.
fn upstream_close(fault: Option<Side>) -> Message {
    if fault == Some(Side::Inbound) {
        close_message(CloseCode::Error, "Proxy error")
    } else {
        close_message(CloseCode::Normal, "Relay closing")
    }
}

/// Relay frames from `source` to `sink`, keeping type and boundaries.
async fn pump_frames<S, K>(mut source: S, sink: &mut K, keep_alive: Option<Duration>) -> PumpEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut ping = keep_alive.map(ping_interval);
    loop {
        let next = tokio::select! {
            next = source.next() => next,
            () = tick(&mut ping) => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    return PumpEnd::WriteFailed(e.to_string());
                }
                continue;
            }
        };
        match next {
            None => return PumpEnd::Eof,
            Some(Err(e)) => return PumpEnd::ReadFailed(e.to_string()),
            Some(Ok(Message::Close(frame))) => {
                let _ = sink.send(Message::Close(frame)).await;
                return PumpEnd::Closed;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(msg)) => {
                if let Err(e) = sink.send(msg).await {
                    return PumpEnd::WriteFailed(e.to_string());
                }
            }
        }
    }
}

/// Raw inbound bytes → one binary frame per read.
async fn pump_bytes<R, K>(
    reader: &mut R,
    sink: &mut K,
    buffer_size: usize,
    keep_alive: Duration,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut ping = Some(ping_interval(keep_alive));
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            () = tick(&mut ping) => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    return PumpEnd::WriteFailed(e.to_string());
                }
                continue;
            }
        };
        match read {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => {
                if let Err(e) = sink.send(Message::binary(buf[..n].to_vec())).await {
                    return PumpEnd::WriteFailed(e.to_string());
                }
            }
            Err(e) => return PumpEnd::ReadFailed(e.to_string()),
        }
    }
}

/// Upstream frames → raw inbound bytes. Text and binary payloads are both
/// written as-is.
async fn pump_payloads<S, W>(mut source: S, writer: &mut W) -> PumpEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(next) = source.next().await {
        let written = match next {
            Ok(Message::Binary(data)) => writer.write_all(&data).await,
            Ok(Message::Text(text)) => writer.write_all(text.as_bytes()).await,
            Ok(Message::Close(_)) => return PumpEnd::Closed,
            Ok(_) => Ok(()),
            Err(e) => return PumpEnd::ReadFailed(e.to_string()),
        };
        if let Err(e) = written {
            return PumpEnd::WriteFailed(e.to_string());
        }
    }
    let _ = writer.flush().await;
    PumpEnd::Eof
}

async fn close_upstream<K>(sink: &mut K, close: Message, timeout: Duration)
where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let _ = tokio::time::timeout(timeout, sink.send(close)).await;
    let _ = tokio::time::timeout(timeout, sink.close()).await;
}

/// Close an inbound connection that never got an upstream.
async fn reject_inbound(
    inbound: InboundConnection,
    options: &BridgeOptions,
    code: CloseCode,
    reason: &'static str,
) {
    match inbound {
        InboundConnection::Framed(mut conn) => {
            let _ = tokio::time::timeout(
                options.close_timeout,
                conn.sink.send(close_message(code, reason)),
            )
            .await;
            let _ = tokio::time::timeout(options.close_timeout, conn.sink.close()).await;
        }
        InboundConnection::Raw(mut conn) => {
            let _ = tokio::time::timeout(options.close_timeout, conn.io.shutdown()).await;
        }
    }
}

fn is_subprotocol_error(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(_))
    )
}

fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

fn ping_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
