//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** - `RELAY_TUNNEL_LOG_LEVEL`,
//!    `RELAY_TUNNEL_SHUTDOWN_TIMEOUT`, `AZURE_SUBSCRIPTION_ID`,
//!    `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET`
//! 2. **Config file** - path via `--config <path>`, or `relay-tunnel.toml` in CWD
//! 3. **Compiled defaults** - see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! shutdown_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//!
//! [assets]
//! root = "wwwroot"
//!
//! # Only needed when a tunnel sets dynamic_resource_creation
//! [azure_management]
//! subscription_id = "..."
//! tenant_id = "..."
//! client_id = "..."
//! client_secret = "..."
//!
//! [[tunnels]]
//! id = "docs"
//! namespace = "myrelay.servicebus.windows.net"
//! name = "docs"
//! policy_name = "listen"
//! policy_key = "..."                       # or encrypted_policy_key
//! target = "http://localhost:8080"
//! target_websocket = "ws://localhost:8080/ws"   # optional
//! enable_websocket = true
//! rewrite_html = true
//! dynamic_resource_creation = false
//! resource_group = "rg"                    # required when dynamic
//! transport = "hybrid"                     # or "local"
//! local_listen = "127.0.0.1:8090"          # local transport only
//! connection_mode = "frames"               # or "stream"
//! request_timeout_secs = 30
//! provisioning_grace_secs = 2
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::credentials::{CredentialError, CredentialProtector};
use crate::descriptor::{TargetError, TunnelDescriptor, UpstreamTarget};
use crate::dispatcher::DispatcherOptions;
use crate::provisioning::ArmSettings;
use crate::proxy::{BridgeOptions, ForwarderOptions};
use crate::transport::ConnectionMode;

/// Default file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "relay-tunnel.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Budget for closing all tunnels on shutdown (default 30).
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    /// Service principal for dynamic provisioning.
    pub azure_management: Option<AzureManagementConfig>,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Tracing filter level (default `info`). `RUST_LOG` takes priority.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Local static assets.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
    /// Directory holding `directory-browser.html` (default `wwwroot`).
    #[serde(default = "default_assets_root")]
    pub root: String,
}

/// Azure Resource Manager credentials.
#[derive(Clone, Default, Deserialize)]
pub struct AzureManagementConfig {
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Override for sovereign clouds.
    pub management_endpoint: Option<String>,
    pub authority_host: Option<String>,
}

impl fmt::Debug for AzureManagementConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureManagementConfig")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// How the tunnel is exposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Azure Relay Hybrid Connection.
    #[default]
    Hybrid,
    /// Plain local TCP listener.
    Local,
}

/// One tunnel definition.
#[derive(Clone, Deserialize)]
pub struct TunnelConfig {
    /// Selector for `run --tunnel`; falls back to `name`.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub policy_name: String,
    pub policy_key: Option<String>,
    /// Policy key sealed with `relay-tunnel seal-key`.
    pub encrypted_policy_key: Option<String>,
    #[serde(default)]
    pub target: String,
    pub target_websocket: Option<String>,
    #[serde(default = "default_true")]
    pub enable_websocket: bool,
    #[serde(default = "default_true")]
    pub rewrite_html: bool,
    #[serde(default)]
    pub dynamic_resource_creation: bool,
    pub resource_group: Option<String>,
    #[serde(default = "default_true")]
    pub requires_client_authorization: bool,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default)]
    pub transport: TransportKind,
    pub local_listen: Option<String>,
    #[serde(default)]
    pub connection_mode: ConnectionMode,
    /// Upstream response-headers deadline (default 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Pause after provisioning before listening (default 2).
    #[serde(default = "default_provisioning_grace_secs")]
    pub provisioning_grace_secs: u64,
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("target", &self.target)
            .field("enabled", &self.enabled)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_assets_root() -> String {
    "wwwroot".to_string()
}
fn default_true() -> bool {
    true
}
fn default_description() -> String {
    "Dynamically created hybrid connection".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_provisioning_grace_secs() -> u64 {
    2
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            root: default_assets_root(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            logging: LoggingConfig::default(),
            assets: AssetsConfig::default(),
            azure_management: None,
            tunnels: Vec::new(),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: String,
        source: std::io::Error,
    },
    Parse {
        path: String,
        source: toml::de::Error,
    },
    /// Required tunnel fields are absent; all of them are listed.
    MissingFields {
        tunnel: String,
        fields: Vec<&'static str>,
    },
    InvalidTarget {
        tunnel: String,
        source: TargetError,
    },
    InvalidListen {
        tunnel: String,
        value: String,
    },
    Credential {
        tunnel: String,
        source: CredentialError,
    },
    /// Dynamic provisioning requested without complete management credentials.
    MissingManagement(Vec<&'static str>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "failed to read {path}: {source}"),
            Self::Parse { path, source } => write!(f, "failed to parse {path}: {source}"),
            Self::MissingFields { tunnel, fields } => {
                write!(f, "tunnel '{tunnel}' is missing: {}", fields.join(", "))
            }
            Self::InvalidTarget { tunnel, source } => {
                write!(f, "tunnel '{tunnel}' has an invalid target: {source}")
            }
            Self::InvalidListen { tunnel, value } => {
                write!(f, "tunnel '{tunnel}' has an invalid local_listen '{value}'")
            }
            Self::Credential { tunnel, source } => {
                write!(f, "tunnel '{tunnel}' policy key could not be unsealed: {source}")
            }
            Self::MissingManagement(fields) => write!(
                f,
                "dynamic_resource_creation needs [azure_management] {}",
                fields.join(", ")
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::InvalidTarget { source, .. } => Some(source),
            Self::Credential { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `relay-tunnel.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::read(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::read(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn read(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(level) = var("RELAY_TUNNEL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(secs) = var("RELAY_TUNNEL_SHUTDOWN_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.shutdown_timeout_secs = secs;
        }

        let overrides = [
            ("AZURE_SUBSCRIPTION_ID", var("AZURE_SUBSCRIPTION_ID")),
            ("AZURE_TENANT_ID", var("AZURE_TENANT_ID")),
            ("AZURE_CLIENT_ID", var("AZURE_CLIENT_ID")),
            ("AZURE_CLIENT_SECRET", var("AZURE_CLIENT_SECRET")),
        ];
        if overrides.iter().all(|(_, value)| value.is_none()) {
            return;
        }
        let management = self.azure_management.get_or_insert_with(Default::default);
        for (key, value) in overrides {
            let Some(value) = value else { continue };
            match key {
                "AZURE_SUBSCRIPTION_ID" => management.subscription_id = value,
                "AZURE_TENANT_ID" => management.tenant_id = value,
                "AZURE_CLIENT_ID" => management.client_id = value,
                _ => management.client_secret = value,
            }
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Enabled tunnels, narrowed to `selectors` when any are given.
    pub fn selected_tunnels<'a>(&'a self, selectors: &'a [String]) -> impl Iterator<Item = &'a TunnelConfig> {
        self.tunnels
            .iter()
            .filter(|t| t.enabled)
            .filter(move |t| selectors.is_empty() || selectors.iter().any(|s| t.matches(s)))
    }

    /// Management settings, or `None` when no enabled tunnel provisions
    /// dynamically.
    pub fn management_settings(&self) -> Result<Option<ArmSettings>, ConfigError> {
        let needed = self
            .tunnels
            .iter()
            .any(|t| t.enabled && t.dynamic_resource_creation);
        if !needed {
            return Ok(None);
        }
        let management = self.azure_management.clone().unwrap_or_default();
        let mut missing = Vec::new();
        if management.subscription_id.is_empty() {
            missing.push("subscription_id");
        }
        if management.tenant_id.is_empty() {
            missing.push("tenant_id");
        }
        if management.client_id.is_empty() {
            missing.push("client_id");
        }
        if management.client_secret.is_empty() {
            missing.push("client_secret");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingManagement(missing));
        }

        let mut settings = ArmSettings::new(
            management.subscription_id,
            management.tenant_id,
            management.client_id,
            management.client_secret,
        );
        if let Some(endpoint) = management.management_endpoint {
            settings.management_endpoint = endpoint;
        }
        if let Some(host) = management.authority_host {
            settings.authority_host = host;
        }
        Ok(Some(settings))
    }
}

impl TunnelConfig {
    /// Display label: `id`, or `name` when no id is set.
    pub fn label(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }

    pub fn matches(&self, selector: &str) -> bool {
        (!self.id.is_empty() && self.id.eq_ignore_ascii_case(selector))
            || self.name.eq_ignore_ascii_case(selector)
    }

    /// Report every missing required field at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.namespace.trim().is_empty() {
            missing.push("namespace");
        }
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.policy_name.trim().is_empty() {
            missing.push("policy_name");
        }
        let has_key = [&self.policy_key, &self.encrypted_policy_key]
            .iter()
            .any(|k| k.as_deref().is_some_and(|k| !k.trim().is_empty()));
        if !has_key {
            missing.push("policy_key");
        }
        if self.target.trim().is_empty() {
            missing.push("target");
        }
        if self.dynamic_resource_creation
            && self.resource_group.as_deref().is_none_or(|g| g.trim().is_empty())
        {
            missing.push("resource_group");
        }
        if self.transport == TransportKind::Local && self.local_listen.is_none() {
            missing.push("local_listen");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingFields {
                tunnel: self.label().to_string(),
                fields: missing,
            })
        }
    }

    pub fn descriptor(
        &self,
        protector: &dyn CredentialProtector,
    ) -> Result<TunnelDescriptor, ConfigError> {
        let key = match (&self.policy_key, &self.encrypted_policy_key) {
            (Some(plain), _) if !plain.trim().is_empty() => plain.clone(),
            (_, Some(sealed)) => {
                protector
                    .unprotect(sealed)
                    .map_err(|source| ConfigError::Credential {
                        tunnel: self.label().to_string(),
                        source,
                    })?
            }
            _ => {
                return Err(ConfigError::MissingFields {
                    tunnel: self.label().to_string(),
                    fields: vec!["policy_key"],
                })
            }
        };

        let mut descriptor =
            TunnelDescriptor::new(self.namespace.trim(), self.name.trim(), &self.policy_name, key);
        descriptor.requires_client_authorization = self.requires_client_authorization;
        descriptor.description.clone_from(&self.description);
        descriptor.resource_group = self.resource_group.clone().filter(|g| !g.is_empty());
        Ok(descriptor)
    }

    pub fn upstream(&self) -> Result<UpstreamTarget, ConfigError> {
        UpstreamTarget::new(&self.target, self.target_websocket.as_deref()).map_err(|source| {
            ConfigError::InvalidTarget {
                tunnel: self.label().to_string(),
                source,
            }
        })
    }

    pub fn local_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let value = self.local_listen.clone().unwrap_or_default();
        value.parse().map_err(|_| ConfigError::InvalidListen {
            tunnel: self.label().to_string(),
            value,
        })
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            enable_websocket: self.enable_websocket,
            dynamic_resource_creation: self.dynamic_resource_creation,
            provisioning_grace: Duration::from_secs(self.provisioning_grace_secs),
            forwarder: ForwarderOptions {
                timeout: Duration::from_secs(self.request_timeout_secs),
                rewrite_html: self.rewrite_html,
            },
            bridge: BridgeOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Base64Protector;

    const SAMPLE: &str = r#"
        shutdown_timeout_secs = 10

        [[tunnels]]
        id = "docs"
        namespace = "myrelay"
        name = "Docs"
        policy_name = "listen"
        policy_key = "secret"
        target = "http://localhost:8080"

        [[tunnels]]
        id = "api"
        enabled = false
        name = "api"
    "#;

    fn parse(toml_text: &str) -> Config {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(SAMPLE);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.assets.root, "wwwroot");

        let docs = &config.tunnels[0];
        assert!(docs.enabled);
        assert!(docs.enable_websocket);
        assert!(docs.rewrite_html);
        assert!(!docs.dynamic_resource_creation);
        assert_eq!(docs.transport, TransportKind::Hybrid);
        assert_eq!(docs.connection_mode, ConnectionMode::Frames);
        assert_eq!(docs.request_timeout_secs, 30);
        assert_eq!(docs.provisioning_grace_secs, 2);
        docs.validate().unwrap();
    }

    #[test]
    fn test_selected_tunnels() {
        let config = parse(SAMPLE);
        assert_eq!(config.selected_tunnels(&[]).count(), 1);
        assert_eq!(config.selected_tunnels(&["DOCS".to_string()]).count(), 1);
        assert_eq!(config.selected_tunnels(&["api".to_string()]).count(), 0);
    }

    #[test]
    fn test_validate_lists_all_missing() {
        let config = parse(SAMPLE);
        let err = config.tunnels[1].validate().unwrap_err();
        let ConfigError::MissingFields { tunnel, fields } = err else {
            panic!("expected MissingFields");
        };
        assert_eq!(tunnel, "api");
        assert_eq!(fields, vec!["namespace", "policy_name", "policy_key", "target"]);
    }

    #[test]
    fn test_dynamic_requires_resource_group_and_management() {
        let config = parse(
            r#"
            [[tunnels]]
            namespace = "ns"
            name = "dyn"
            policy_name = "listen"
            policy_key = "k"
            target = "http://localhost:1"
            dynamic_resource_creation = true
            "#,
        );
        let err = config.tunnels[0].validate().unwrap_err();
        assert!(err.to_string().contains("resource_group"));

        let err = config.management_settings().unwrap_err();
        assert!(matches!(err, ConfigError::MissingManagement(ref f) if f.len() == 4));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = parse(SAMPLE);
        config.apply_env(|key| match key {
            "RELAY_TUNNEL_LOG_LEVEL" => Some("debug".into()),
            "RELAY_TUNNEL_SHUTDOWN_TIMEOUT" => Some("5".into()),
            "AZURE_TENANT_ID" => Some("t".into()),
            _ => None,
        });
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.shutdown_timeout_secs, 5);
        assert_eq!(config.azure_management.unwrap().tenant_id, "t");
    }

    #[test]
    fn test_descriptor_from_sealed_key() {
        let mut tunnel = parse(SAMPLE).tunnels.remove(0);
        tunnel.policy_key = None;
        tunnel.encrypted_policy_key = Some(Base64Protector.protect("unsealed"));
        let descriptor = tunnel.descriptor(&Base64Protector).unwrap();
        assert_eq!(descriptor.policy_key, "unsealed");
        assert_eq!(descriptor.tunnel_name, "docs");
        assert_eq!(descriptor.original_name.as_deref(), Some("Docs"));

        tunnel.encrypted_policy_key = Some("%%%".into());
        let err = tunnel.descriptor(&Base64Protector).unwrap_err();
        assert!(matches!(err, ConfigError::Credential { .. }));
    }

    #[test]
    fn test_local_transport_needs_listen() {
        let mut tunnel = parse(SAMPLE).tunnels.remove(0);
        tunnel.transport = TransportKind::Local;
        assert!(tunnel.validate().is_err());
        tunnel.local_listen = Some("127.0.0.1:8090".into());
        tunnel.validate().unwrap();
        assert_eq!(tunnel.local_listen_addr().unwrap().port(), 8090);
    }

    #[test]
    fn test_invalid_target() {
        let mut tunnel = parse(SAMPLE).tunnels.remove(0);
        tunnel.target = "ftp://host".into();
        assert!(matches!(
            tunnel.upstream().unwrap_err(),
            ConfigError::InvalidTarget { .. }
        ));
    }
}
