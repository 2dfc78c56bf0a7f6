//! Request classification for traffic arriving through the tunnel.
//!
//! Routing is a pure function of `(method, path, query)`; it never fails.
//! Rules are evaluated in order, first match wins:
//!
//! | # | Condition                                        | Decision           |
//! |---|--------------------------------------------------|--------------------|
//! | 1 | empty path or `/` (any query)                    | `ServeBrowserPage` |
//! | 2 | starts with `api/list` or `/api/list` (any case) | `ListDirectory`    |
//! | 3 | starts with `file` or `/file` (any case)         | `DownloadFile`     |
//! | 4 | no `.` in path and method is `GET`               | `ServeBrowserPage` |
//! | 5 | anything else                                    | `ProxyPass`        |

use axum::http::Method;
use percent_encoding::percent_decode_str;

/// Where one inbound HTTP request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Answer with the directory-browser page.
    ServeBrowserPage,
    /// Fetch and parse the upstream index page for `path`.
    ListDirectory { path: String },
    /// Stream the upstream file at `path`.
    DownloadFile { path: String },
    /// Forward as-is. `relative_path` keeps the query string.
    ProxyPass { relative_path: String },
}

impl RouteDecision {
    /// Short label for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServeBrowserPage => "spa",
            Self::ListDirectory { .. } => "list",
            Self::DownloadFile { .. } => "file",
            Self::ProxyPass { .. } => "proxy",
        }
    }
}

/// Classify a relay-relative path and its query string.
pub fn route(method: &Method, path: &str, query: Option<&str>) -> RouteDecision {
    let query = query.filter(|q| !q.is_empty());

    if path.is_empty() || path == "/" {
        return RouteDecision::ServeBrowserPage;
    }

    if starts_with_ignore_case(path, "api/list") || starts_with_ignore_case(path, "/api/list") {
        return RouteDecision::ListDirectory {
            path: path_param(query),
        };
    }

    if starts_with_ignore_case(path, "file") || starts_with_ignore_case(path, "/file") {
        return RouteDecision::DownloadFile {
            path: path_param(query),
        };
    }

    if !path.contains('.') && *method == Method::GET {
        return RouteDecision::ServeBrowserPage;
    }

    let relative_path = match query {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    RouteDecision::ProxyPass { relative_path }
}

/// Like [`route`], for a request target that still carries its `?query`.
pub fn route_target(method: &Method, target: &str) -> RouteDecision {
    match target.split_once('?') {
        Some((path, query)) => route(method, path, Some(query)),
        None => route(method, target, None),
    }
}

/// Removes the leading `/<tunnel_name>` segment from a request target.
///
/// Matching is case-insensitive. `/<name>` alone becomes `/`, a query directly
/// after the name is kept (`/<name>?x` → `/?x`). Targets outside the prefix are
/// returned unchanged.
pub fn strip_tunnel_prefix(target: &str, tunnel_name: &str) -> String {
    let prefix_len = tunnel_name.len() + 1;
    let Some(head) = target.get(..prefix_len) else {
        return target.to_string();
    };
    if !head.starts_with('/') || !head[1..].eq_ignore_ascii_case(tunnel_name) {
        return target.to_string();
    }
    let rest = &target[prefix_len..];
    if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else if rest.starts_with('?') {
        format!("/{rest}")
    } else {
        target.to_string()
    }
}

/// Value of the `path` query parameter, percent-decoded; empty when absent.
///
/// Pairs split on `&`, then `=`; a pair with other than exactly two parts is
/// ignored. `+` is left as-is.
pub fn path_param(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    query
        .trim_start_matches('?')
        .split('&')
        .find_map(|pair| {
            let mut parts = pair.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("path"), Some(value), None) => {
                    Some(percent_decode_str(value).decode_utf8_lossy().into_owned())
                }
                _ => None,
            }
        })
        .unwrap_or_default()
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
