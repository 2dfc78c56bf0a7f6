//! Header hygiene at the proxy boundary.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Request headers the outbound client sets itself (or must not see).
/// `Content-Type` is re-applied from the inbound body when one is attached.
const REQUEST_DROPPED: [&str; 12] = [
    "host",
    "content-type",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

/// True when `name` must not be copied onto the outbound request.
pub fn is_request_restricted(name: &HeaderName) -> bool {
    REQUEST_DROPPED.contains(&name.as_str())
}

/// Copy inbound request headers for the upstream request.
pub fn request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if !is_request_restricted(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Copy upstream response headers for the relay response.
///
/// `Transfer-Encoding` is always dropped. `Content-Length` is dropped when the
/// body is going to be mutated; the caller sets it from the final byte count.
/// Multi-valued headers are joined with `,`, except `Set-Cookie`.
pub fn response_headers(upstream: &HeaderMap, body_mutated: bool) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for name in upstream.keys() {
        if *name == header::TRANSFER_ENCODING
            || (body_mutated && *name == header::CONTENT_LENGTH)
        {
            continue;
        }
        let mut values = upstream.get_all(name).iter();
        let Some(first) = values.next() else {
            continue;
        };
        let rest: Vec<&HeaderValue> = values.collect();
        if rest.is_empty() || *name == header::SET_COOKIE {
            out.append(name.clone(), first.clone());
            for value in rest {
                out.append(name.clone(), value.clone());
            }
            continue;
        }
        match join_values(first, &rest) {
            Some(joined) => {
                out.insert(name.clone(), joined);
            }
            None => {
                out.append(name.clone(), first.clone());
                for value in rest {
                    out.append(name.clone(), value.clone());
                }
            }
        }
    }
    out
}

fn join_values(first: &HeaderValue, rest: &[&HeaderValue]) -> Option<HeaderValue> {
    let mut bytes = first.as_bytes().to_vec();
    for value in rest {
        bytes.push(b',');
        bytes.extend_from_slice(value.as_bytes());
    }
    HeaderValue::from_bytes(&bytes).ok()
}

/// Flattens headers to one string per name, for wire formats that carry a
/// plain name → value map. Values that are not visible ASCII are skipped.
pub fn flatten(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        out.push((name.as_str().to_string(), joined));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for &(name, value) in pairs {
            headers.append(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        headers
    }

    #[test]
    fn test_request_drops_restricted() {
        let inbound = map(&[
            ("host", "relay.example"),
            ("content-type", "application/json"),
            ("content-length", "12"),
            ("transfer-encoding", "chunked"),
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("proxy-connection", "keep-alive"),
            ("accept", "text/html"),
            ("x-custom", "1"),
        ]);
        let out = request_headers(&inbound);
        assert_eq!(out.len(), 2);
        assert_eq!(out["accept"], "text/html");
        assert_eq!(out["x-custom"], "1");
    }

    #[test]
    fn test_request_keeps_multi_values() {
        let inbound = map(&[("accept-language", "en"), ("accept-language", "fr")]);
        let out = request_headers(&inbound);
        assert_eq!(out.get_all("accept-language").iter().count(), 2);
    }

    #[test]
    fn test_response_drops_transfer_encoding() {
        let upstream = map(&[
            ("transfer-encoding", "chunked"),
            ("content-length", "42"),
            ("content-type", "text/plain"),
        ]);
        let out = response_headers(&upstream, false);
        assert!(out.get("transfer-encoding").is_none());
        assert_eq!(out["content-length"], "42");

        let out = response_headers(&upstream, true);
        assert!(out.get("content-length").is_none());
        assert_eq!(out["content-type"], "text/plain");
    }

    #[test]
    fn test_response_joins_multi_values() {
        let upstream = map(&[
            ("vary", "accept"),
            ("vary", "origin"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]);
        let out = response_headers(&upstream, false);
        assert_eq!(out.get_all("vary").iter().count(), 1);
        assert_eq!(out["vary"], "accept,origin");
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_flatten() {
        let headers = map(&[("x-a", "1"), ("x-a", "2"), ("x-b", "3")]);
        let flat = flatten(&headers);
        assert!(flat.contains(&("x-a".to_string(), "1,2".to_string())));
        assert!(flat.contains(&("x-b".to_string(), "3".to_string())));
    }
}
