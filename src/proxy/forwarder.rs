//! HTTP forwarding to the fixed upstream target.
//!
//! One [`HttpForwarder`] per tunnel. It owns the only upstream `reqwest`
//! client (one connection pool) and is shared read-only by every request
//! handler until [`HttpForwarder::dispose`] drops the client.
//!
//! Bodies stream in both directions. The one exception is an upstream
//! `text/html` response while rewriting is enabled: it is buffered, passed
//! through [`rewrite_root_relative_paths`], and sent with a recomputed
//! `Content-Length`.

use std::borrow::Cow;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use tracing::{debug, warn};

use crate::descriptor::UpstreamTarget;
use crate::html::rewrite_root_relative_paths;
use crate::proxy::headers;

/// Upstream client settings.
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    /// Connect + response-headers deadline (default 30s).
    pub timeout: Duration,
    /// Rewrite root-relative paths in HTML responses (default true).
    pub rewrite_html: bool,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            rewrite_html: true,
        }
    }
}

/// Why a forward produced no upstream response.
#[derive(Debug)]
pub enum ForwardError {
    /// [`HttpForwarder::dispose`] already ran.
    Disposed,
    /// Refused, reset, or closed before response headers arrived.
    Unreachable {
        address: String,
        source: reqwest::Error,
    },
    /// No response headers within the configured timeout.
    Timeout { address: String },
    /// Anything else reported by the client.
    Upstream(reqwest::Error),
    /// The client could not be constructed.
    Build(reqwest::Error),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed => write!(f, "upstream client already disposed"),
            Self::Unreachable { address, source } => {
                write!(f, "upstream {address} is unreachable: {source}")
            }
            Self::Timeout { address } => write!(f, "upstream {address} timed out"),
            Self::Upstream(e) => write!(f, "upstream request failed: {e}"),
            Self::Build(e) => write!(f, "failed to build upstream client: {e}"),
        }
    }
}

impl std::error::Error for ForwardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unreachable { source, .. } => Some(source),
            Self::Upstream(e) | Self::Build(e) => Some(e),
            Self::Disposed | Self::Timeout { .. } => None,
        }
    }
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Disposed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) | Self::Build(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> axum::response::Response {
        let body = match &self {
            Self::Disposed => "Service Unavailable: tunnel is shutting down".to_string(),
            Self::Unreachable { address, .. } => {
                format!("Bad Gateway: upstream service at {address} is unreachable")
            }
            Self::Timeout { address } => {
                format!("Gateway Timeout: upstream service at {address} did not respond")
            }
            Self::Upstream(_) | Self::Build(_) => "Internal server error".to_string(),
        };
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

/// Forwards relay requests to one upstream base address.
pub struct HttpForwarder {
    target: UpstreamTarget,
    relay_name: String,
    options: ForwarderOptions,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpForwarder {
    pub fn new(
        target: UpstreamTarget,
        relay_name: impl Into<String>,
        options: ForwarderOptions,
    ) -> Result<Self, ForwardError> {
        // Self-signed dev certificates are only tolerated on loopback.
        let accept_invalid = target.is_loopback() && target.http().scheme() == "https";
        let client = reqwest::Client::builder()
            .connect_timeout(options.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(accept_invalid)
            .build()
            .map_err(ForwardError::Build)?;
        Ok(Self {
            target,
            relay_name: relay_name.into(),
            options,
            client: RwLock::new(Some(client)),
        })
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Forward one request. Failures become 502/503/504/500 responses.
    pub async fn forward(&self, request: Request<Body>, relative_path: &str) -> Response<Body> {
        match self.try_forward(request, relative_path).await {
            Ok(response) => response,
            Err(e) => {
                warn!(path = relative_path, error = %e, "Forward failed");
                e.into_response()
            }
        }
    }

    async fn try_forward(
        &self,
        request: Request<Body>,
        relative_path: &str,
    ) -> Result<Response<Body>, ForwardError> {
        let client = self.client()?;
        let (parts, body) = request.into_parts();
        let url = self.target.http_url_for(relative_path);
        debug!(method = %parts.method, %url, "Forwarding");

        let mut outbound = client
            .request(parts.method.clone(), &url)
            .headers(headers::request_headers(&parts.headers));
        if has_body(&parts.headers) {
            if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
                outbound = outbound.header(header::CONTENT_TYPE, content_type.clone());
            }
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = self.send(outbound).await?;
        self.relay_response(&parts.method, upstream).await
    }

    /// GET `relative` on the upstream, for handlers that shape the body
    /// themselves.
    pub async fn fetch(&self, relative: &str) -> Result<reqwest::Response, ForwardError> {
        let client = self.client()?;
        self.send(client.get(self.target.http_url_for(relative)))
            .await
    }

    /// Drop the upstream client. Returns `true` only on the first call.
    pub fn dispose(&self) -> bool {
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn client(&self) -> Result<reqwest::Client, ForwardError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ForwardError::Disposed)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ForwardError> {
        match tokio::time::timeout(self.options.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(self.classify(e)),
            Err(_) => Err(ForwardError::Timeout {
                address: self.target.http_base().to_string(),
            }),
        }
    }

    /// Map a client error onto the response taxonomy.
    pub fn classify(&self, e: reqwest::Error) -> ForwardError {
        let address = self.target.http_base().to_string();
        if e.is_timeout() {
            ForwardError::Timeout { address }
        } else if e.is_connect() || e.is_request() {
            ForwardError::Unreachable { address, source: e }
        } else {
            ForwardError::Upstream(e)
        }
    }

    async fn relay_response(
        &self,
        method: &Method,
        upstream: reqwest::Response,
    ) -> Result<Response<Body>, ForwardError> {
        let status = upstream.status();
        // HEAD carries the length of a body it never sends.
        let rewrite =
            self.options.rewrite_html && *method != Method::HEAD && is_html(upstream.headers());
        let mut headers = headers::response_headers(upstream.headers(), rewrite);

        let body = if rewrite {
            let bytes = upstream.bytes().await.map_err(|e| self.classify(e))?;
            let bytes = self.rewrite_body(bytes);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            Body::from(bytes)
        } else {
            Body::from_stream(upstream.bytes_stream())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    fn rewrite_body(&self, bytes: Bytes) -> Bytes {
        let rewritten = match std::str::from_utf8(&bytes) {
            Ok(text) => match rewrite_root_relative_paths(text, &self.relay_name) {
                Cow::Owned(html) => Some(html),
                Cow::Borrowed(_) => None,
            },
            Err(_) => None,
        };
        rewritten.map_or(bytes, Bytes::from)
    }
}

fn has_body(headers: &HeaderMap) -> bool {
    let declared_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|len| len > 0);
    declared_length || headers.contains_key(header::TRANSFER_ENCODING)
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.trim_start()
                .get(..9)
                .is_some_and(|head| head.eq_ignore_ascii_case("text/html"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;

    async fn spawn_upstream(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn closed_port() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn forwarder(addr: SocketAddr) -> HttpForwarder {
        let target = UpstreamTarget::new(&format!("http://{addr}"), None).unwrap();
        HttpForwarder::new(target, "docs", ForwarderOptions::default()).unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_html_is_rewritten_with_new_length() {
        let app = Router::new().route(
            "/page.html",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    r#"<a href="/next.html">next</a>"#,
                )
            }),
        );
        let fwd = forwarder(spawn_upstream(app).await);
        let request = Request::get("/docs/page.html").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/page.html").await;

        assert_eq!(response.status(), StatusCode::OK);
        let expected = r#"<a href="/docs/next.html">next</a>"#;
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            expected.len().to_string().as_str()
        );
        assert_eq!(body_string(response).await, expected);
    }

    #[tokio::test]
    async fn test_head_keeps_upstream_length() {
        let page = r#"<a href="/next.html">next</a>"#;
        let app = Router::new().route(
            "/page.html",
            get(move || async move { ([(header::CONTENT_TYPE, "text/html")], page) }),
        );
        let fwd = forwarder(spawn_upstream(app).await);
        let request = Request::head("/docs/page.html").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/page.html").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            page.len().to_string().as_str()
        );
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_non_html_streams_untouched() {
        let app = Router::new().route(
            "/data.json",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"href":"/x"}"#,
                )
            }),
        );
        let fwd = forwarder(spawn_upstream(app).await);
        let request = Request::get("/data.json").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/data.json").await;
        assert_eq!(body_string(response).await, r#"{"href":"/x"}"#);
    }

    #[tokio::test]
    async fn test_request_body_and_query_forwarded() {
        let app = Router::new().route(
            "/echo",
            post(|uri: axum::http::Uri, headers: HeaderMap, body: Bytes| async move {
                let ct = headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                format!(
                    "{}|{}|{}",
                    uri.query().unwrap_or(""),
                    ct,
                    String::from_utf8_lossy(&body)
                )
            }),
        );
        let fwd = forwarder(spawn_upstream(app).await);
        let request = Request::post("/docs/echo?x=1")
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, "5")
            .body(Body::from("hello"))
            .unwrap();
        let response = fwd.forward(request, "/echo?x=1").await;
        assert_eq!(body_string(response).await, "x=1|text/plain|hello");
    }

    #[tokio::test]
    async fn test_redirects_pass_through() {
        let app = Router::new().route(
            "/old.html",
            get(|| async { axum::response::Redirect::temporary("/new.html") }),
        );
        let fwd = forwarder(spawn_upstream(app).await);
        let request = Request::get("/old.html").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/old.html").await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/new.html");
    }

    #[tokio::test]
    async fn test_refused_connection_is_bad_gateway() {
        let addr = closed_port().await;
        let fwd = forwarder(addr);
        let request = Request::get("/x.json").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/x.json").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let app = Router::new().route(
            "/slow.json",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let addr = spawn_upstream(app).await;
        let target = UpstreamTarget::new(&format!("http://{addr}"), None).unwrap();
        let fwd = HttpForwarder::new(
            target,
            "docs",
            ForwarderOptions {
                timeout: Duration::from_millis(200),
                rewrite_html: true,
            },
        )
        .unwrap();
        let request = Request::get("/slow.json").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/slow.json").await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_dispose_once() {
        let fwd = forwarder(closed_port().await);
        assert!(!fwd.is_disposed());
        assert!(fwd.dispose());
        assert!(!fwd.dispose());
        assert!(fwd.is_disposed());

        let request = Request::get("/x.json").body(Body::empty()).unwrap();
        let response = fwd.forward(request, "/x.json").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_has_body() {
        let mut headers = HeaderMap::new();
        assert!(!has_body(&headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!has_body(&headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        assert!(has_body(&headers));
    }
}
