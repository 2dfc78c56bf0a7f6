//! Request handler registered on the tunnel listener.
//!
//! Every request is classified by [`route_target`] and answered by exactly
//! one of the handlers below. Failures become responses; nothing here
//! returns an error to the transport.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio_util::task::TaskTracker;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::assets::{AssetRoot, BROWSER_PAGE};
use crate::html::parse_directory_listing;
use crate::proxy::{headers, ForwardError, HttpForwarder};
use crate::routing::{route_target, strip_tunnel_prefix, RouteDecision};

/// Characters escaped inside one upstream path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/');

/// Everything a request needs; shared read-only by all requests of a tunnel.
pub(crate) struct Context {
    pub relay_name: String,
    pub forwarder: Arc<HttpForwarder>,
    pub assets: AssetRoot,
    /// In-flight requests, awaited by `close`.
    pub tasks: TaskTracker,
}

pub(crate) fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(ctx)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn handle(State(ctx): State<Arc<Context>>, request: Request) -> Response {
    let tasks = ctx.tasks.clone();
    tasks.track_future(dispatch(ctx, request)).await
}

async fn dispatch(ctx: Arc<Context>, request: Request) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let target = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());
    let relative = strip_tunnel_prefix(&target, &ctx.relay_name);
    let decision = route_target(&method, &relative);
    let route = decision.kind();

    let response = match decision {
        RouteDecision::ServeBrowserPage => serve_browser_page(&ctx.assets).await,
        RouteDecision::ListDirectory { path } => list_directory(&ctx.forwarder, &path).await,
        RouteDecision::DownloadFile { path } => download_file(&ctx.forwarder, &path).await,
        RouteDecision::ProxyPass { relative_path } => {
            ctx.forwarder.forward(request, &relative_path).await
        }
    };

    info!(
        %method,
        path = %relative,
        route,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request handled"
    );
    response
}

async fn serve_browser_page(assets: &AssetRoot) -> Response {
    match assets.read(BROWSER_PAGE).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(root = %assets.root().display(), error = %e, "Browser page unavailable");
            (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                "SPA file not found",
            )
                .into_response()
        }
    }
}

async fn list_directory(forwarder: &HttpForwarder, path: &str) -> Response {
    let upstream_path = upstream_path(path, true);
    let upstream = match forwarder.fetch(&upstream_path).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(path = %upstream_path, error = %e, "Directory listing failed");
            return upstream_error(&e);
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        return json_error(status, "Directory not found");
    }
    match upstream.text().await {
        Ok(html) => {
            let items = parse_directory_listing(&html);
            (
                [(header::CACHE_CONTROL, "no-cache")],
                Json(serde_json::json!({ "items": items })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(path = %upstream_path, error = %e, "Directory listing body failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn download_file(forwarder: &HttpForwarder, path: &str) -> Response {
    if path.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "File path required");
    }
    let upstream_path = upstream_path(path, false);
    match forwarder.fetch(&upstream_path).await {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = headers::response_headers(upstream.headers(), false);
            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            warn!(path = %upstream_path, error = %e, "File download failed");
            upstream_error(&e)
        }
    }
}

/// JSON body for a failed upstream fetch on the API routes.
fn upstream_error(e: &ForwardError) -> Response {
    match e {
        ForwardError::Unreachable { .. } | ForwardError::Timeout { .. } | ForwardError::Disposed => {
            json_error(e.status(), "Upstream unavailable")
        }
        _ => json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Upstream path for a decoded `path` parameter: segments re-encoded, empty
/// and dot segments dropped, trailing slash for non-root directories.
fn upstream_path(path: &str, directory: bool) -> String {
    let segments: Vec<String> = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(|s| utf8_percent_encode(s, SEGMENT).to_string())
        .collect();
    let mut out = format!("/{}", segments.join("/"));
    if directory && !segments.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_path() {
        assert_eq!(upstream_path("", true), "/");
        assert_eq!(upstream_path("docs", true), "/docs/");
        assert_eq!(upstream_path("docs/", true), "/docs/");
        assert_eq!(upstream_path("a/b.txt", false), "/a/b.txt");
        assert_eq!(upstream_path("my file#1.txt", false), "/my%20file%231.txt");
        assert_eq!(upstream_path("../../etc/passwd", false), "/etc/passwd");
        assert_eq!(upstream_path("a\\b", true), "/a/b/");
    }

    async fn json_body(response: Response) -> serde_json::Value {
        use http_body_util::BodyExt;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_download_unreachable_upstream_is_json() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let target = crate::descriptor::UpstreamTarget::new(&format!("http://{addr}"), None).unwrap();
        let forwarder =
            HttpForwarder::new(target, "docs", crate::proxy::ForwarderOptions::default()).unwrap();

        let response = download_file(&forwarder, "a.txt").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/json"));
        assert_eq!(json_body(response).await["error"], "Upstream unavailable");

        forwarder.dispose();
        let response = download_file(&forwarder, "a.txt").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "Upstream unavailable");
    }

    #[tokio::test]
    async fn test_missing_browser_page() {
        let assets = AssetRoot::new(std::env::temp_dir().join("relay-no-such-dir"));
        let response = serve_browser_page(&assets).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
