//! Tunnel identity and upstream binding.
//!
//! Both types are built once from configuration and never mutated while a
//! [`DispatcherService`](crate::dispatcher::DispatcherService) is alive.

use std::fmt;
use std::net::IpAddr;

use url::Url;

/// Suffix appended to a bare namespace name to get its public host name.
const NAMESPACE_SUFFIX: &str = ".servicebus.windows.net";

/// Identifies one relay endpoint and the credentials used to listen on it.
#[derive(Clone)]
pub struct TunnelDescriptor {
    /// Namespace as configured, either a FQDN or a short name.
    pub namespace: String,
    /// Relay path segment, always lowercase.
    pub tunnel_name: String,
    /// The configured name when lowercasing changed it (display only).
    pub original_name: Option<String>,
    pub policy_name: String,
    pub policy_key: String,
    pub requires_client_authorization: bool,
    pub description: String,
    /// Resource group holding the namespace; needed for dynamic provisioning.
    pub resource_group: Option<String>,
}

impl TunnelDescriptor {
    pub fn new(
        namespace: impl Into<String>,
        name: &str,
        policy_name: impl Into<String>,
        policy_key: impl Into<String>,
    ) -> Self {
        let tunnel_name = name.to_lowercase();
        let original_name = (tunnel_name != name).then(|| name.to_string());
        Self {
            namespace: namespace.into(),
            tunnel_name,
            original_name,
            policy_name: policy_name.into(),
            policy_key: policy_key.into(),
            requires_client_authorization: true,
            description: "Dynamically created hybrid connection".to_string(),
            resource_group: None,
        }
    }

    /// Fully qualified namespace host, e.g. `myrelay.servicebus.windows.net`.
    pub fn namespace_fqdn(&self) -> String {
        let ns = self.namespace.trim().trim_end_matches('/');
        let ns = ns
            .strip_prefix("sb://")
            .or_else(|| ns.strip_prefix("https://"))
            .unwrap_or(ns);
        if ns.contains('.') {
            ns.to_string()
        } else {
            format!("{ns}{NAMESPACE_SUFFIX}")
        }
    }

    /// Namespace name without its DNS suffix, as the management plane expects.
    pub fn namespace_short_name(&self) -> String {
        let fqdn = self.namespace_fqdn();
        match fqdn.split_once('.') {
            Some((short, _)) => short.to_string(),
            None => fqdn,
        }
    }

    /// Public address remote clients use to reach this tunnel.
    pub fn public_address(&self) -> String {
        format!("https://{}/{}/", self.namespace_fqdn(), self.tunnel_name)
    }

    /// Name for log lines, noting the configured spelling when it differed.
    pub fn display_name(&self) -> String {
        match &self.original_name {
            Some(original) => format!("{} (configured as {original})", self.tunnel_name),
            None => self.tunnel_name.clone(),
        }
    }
}

impl fmt::Debug for TunnelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelDescriptor")
            .field("namespace", &self.namespace)
            .field("tunnel_name", &self.tunnel_name)
            .field("original_name", &self.original_name)
            .field("policy_name", &self.policy_name)
            .field("policy_key", &"<redacted>")
            .field(
                "requires_client_authorization",
                &self.requires_client_authorization,
            )
            .field("resource_group", &self.resource_group)
            .finish_non_exhaustive()
    }
}

/// Error building an [`UpstreamTarget`].
#[derive(Debug)]
pub enum TargetError {
    Parse { value: String, source: url::ParseError },
    UnsupportedScheme(String),
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { value, source } => write!(f, "invalid target URI '{value}': {source}"),
            Self::UnsupportedScheme(scheme) => write!(f, "unsupported target scheme '{scheme}'"),
        }
    }
}

impl std::error::Error for TargetError {}

/// The fixed upstream service a tunnel forwards to.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    http: Url,
    websocket: Url,
}

impl UpstreamTarget {
    /// Parses the HTTP base and an optional explicit WebSocket base.
    ///
    /// Without an explicit WebSocket base, the HTTP one is reused with its
    /// scheme mapped `http → ws`, `https → wss`.
    pub fn new(http: &str, websocket: Option<&str>) -> Result<Self, TargetError> {
        let http_url = parse(http)?;
        if !matches!(http_url.scheme(), "http" | "https") {
            return Err(TargetError::UnsupportedScheme(http_url.scheme().to_string()));
        }
        let websocket = match websocket.map(str::trim).filter(|s| !s.is_empty()) {
            Some(ws) => {
                let url = parse(ws)?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(TargetError::UnsupportedScheme(url.scheme().to_string()));
                }
                url
            }
            None => {
                let mut url = http_url.clone();
                let scheme = if http_url.scheme() == "https" { "wss" } else { "ws" };
                url.set_scheme(scheme)
                    .map_err(|()| TargetError::UnsupportedScheme(scheme.to_string()))?;
                url
            }
        };
        Ok(Self {
            http: http_url,
            websocket,
        })
    }

    pub fn http(&self) -> &Url {
        &self.http
    }

    pub fn websocket(&self) -> &Url {
        &self.websocket
    }

    /// HTTP base without the trailing slash, used in diagnostics.
    pub fn http_base(&self) -> &str {
        self.http.as_str().trim_end_matches('/')
    }

    /// True when the upstream host is `localhost` or a loopback IP.
    pub fn is_loopback(&self) -> bool {
        match self.http.host_str() {
            Some(host) if host.eq_ignore_ascii_case("localhost") => true,
            Some(host) => host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.is_loopback()),
            None => false,
        }
    }

    /// Base HTTP address joined with a relay-relative path (and query).
    pub fn http_url_for(&self, relative: &str) -> String {
        join(self.http_base(), relative)
    }

    /// Upstream WebSocket URI for an inbound connection's relay-relative path.
    ///
    /// An empty or root path maps to the configured WebSocket base as-is.
    pub fn websocket_url_for(&self, relative: &str) -> String {
        if relative.is_empty() || relative == "/" {
            return self.websocket.as_str().to_string();
        }
        join(self.websocket.as_str().trim_end_matches('/'), relative)
    }
}

fn parse(value: &str) -> Result<Url, TargetError> {
    Url::parse(value.trim()).map_err(|source| TargetError::Parse {
        value: value.to_string(),
        source,
    })
}

fn join(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        base.to_string()
    } else if relative.starts_with('/') || relative.starts_with('?') {
        format!("{base}{relative}")
    } else {
        format!("{base}/{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_name_lowercased() {
        let d = TunnelDescriptor::new("ns", "MyDocs", "listen", "key");
        assert_eq!(d.tunnel_name, "mydocs");
        assert_eq!(d.original_name.as_deref(), Some("MyDocs"));

        let d = TunnelDescriptor::new("ns", "docs", "listen", "key");
        assert!(d.original_name.is_none());
    }

    #[test]
    fn test_namespace_forms() {
        let short = TunnelDescriptor::new("myrelay", "docs", "p", "k");
        assert_eq!(short.namespace_fqdn(), "myrelay.servicebus.windows.net");
        assert_eq!(short.namespace_short_name(), "myrelay");

        let fqdn = TunnelDescriptor::new("sb://myrelay.servicebus.windows.net/", "docs", "p", "k");
        assert_eq!(fqdn.namespace_fqdn(), "myrelay.servicebus.windows.net");
        assert_eq!(fqdn.namespace_short_name(), "myrelay");
        assert_eq!(
            fqdn.public_address(),
            "https://myrelay.servicebus.windows.net/docs/"
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let d = TunnelDescriptor::new("ns", "docs", "listen", "super-secret");
        let dbg = format!("{d:?}");
        assert!(!dbg.contains("super-secret"));
    }

    #[test]
    fn test_websocket_base_derived() {
        let t = UpstreamTarget::new("http://localhost:8080", None).unwrap();
        assert_eq!(t.websocket().as_str(), "ws://localhost:8080/");

        let t = UpstreamTarget::new("https://example.com/app/", None).unwrap();
        assert_eq!(t.websocket().as_str(), "wss://example.com/app/");
    }

    #[test]
    fn test_explicit_websocket_base() {
        let t = UpstreamTarget::new("http://localhost:8080", Some("ws://localhost:9000/ws")).unwrap();
        assert_eq!(t.websocket_url_for(""), "ws://localhost:9000/ws");
        assert_eq!(t.websocket_url_for("/"), "ws://localhost:9000/ws");
        assert_eq!(
            t.websocket_url_for("/chat?room=1"),
            "ws://localhost:9000/ws/chat?room=1"
        );
    }

    #[test]
    fn test_invalid_targets() {
        assert!(matches!(
            UpstreamTarget::new("not a url", None),
            Err(TargetError::Parse { .. })
        ));
        assert!(matches!(
            UpstreamTarget::new("ftp://host", None),
            Err(TargetError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            UpstreamTarget::new("http://host", Some("http://host/ws")),
            Err(TargetError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_http_url_for() {
        let t = UpstreamTarget::new("http://localhost:8080/", None).unwrap();
        assert_eq!(t.http_url_for("/styles.css"), "http://localhost:8080/styles.css");
        assert_eq!(t.http_url_for("styles.css"), "http://localhost:8080/styles.css");
        assert_eq!(t.http_url_for("/a%20b?x=1"), "http://localhost:8080/a%20b?x=1");
    }

    #[test]
    fn test_is_loopback() {
        assert!(UpstreamTarget::new("https://localhost:5001", None).unwrap().is_loopback());
        assert!(UpstreamTarget::new("http://127.0.0.1:80", None).unwrap().is_loopback());
        assert!(UpstreamTarget::new("http://[::1]:80", None).unwrap().is_loopback());
        assert!(!UpstreamTarget::new("http://10.0.0.5", None).unwrap().is_loopback());
    }
}
