//! Azure Resource Manager client for `Microsoft.Relay/hybridConnections`.
//!
//! | Operation | Request                                   | Success           |
//! |-----------|-------------------------------------------|-------------------|
//! | create    | `PUT  .../hybridConnections/{name}`       | 2xx, 409          |
//! | delete    | `DELETE .../hybridConnections/{name}`     | 2xx, 404          |
//! | exists    | `GET  .../hybridConnections/{name}`       | 2xx → true, 404 → false |
//!
//! Tokens come from the client-credentials flow and are cached until a
//! minute before they expire.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{ProvisionError, ResourceProvisioner};
use crate::descriptor::TunnelDescriptor;

const API_VERSION: &str = "2021-11-01";
/// Refresh this long before the token's stated expiry.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

/// Service principal and endpoints for the management API.
#[derive(Clone, Deserialize)]
pub struct ArmSettings {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
}

impl ArmSettings {
    pub fn new(
        subscription_id: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            management_endpoint: default_management_endpoint(),
            authority_host: default_authority_host(),
        }
    }
}

impl std::fmt::Debug for ArmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmSettings")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

pub struct ArmProvisioner {
    settings: ArmSettings,
    http: reqwest::Client,
    token: Mutex<Option<(String, Instant)>>,
}

impl ArmProvisioner {
    pub fn new(settings: ArmSettings) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            settings,
            http,
            token: Mutex::new(None),
        })
    }

    fn resource_url(&self, descriptor: &TunnelDescriptor) -> Result<String, ProvisionError> {
        let group = descriptor
            .resource_group
            .as_deref()
            .filter(|g| !g.is_empty())
            .ok_or(ProvisionError::Incomplete("resource group"))?;
        Ok(format!(
            "{}/subscriptions/{}/resourceGroups/{group}/providers/Microsoft.Relay/namespaces/{}/hybridConnections/{}?api-version={API_VERSION}",
            self.settings.management_endpoint.trim_end_matches('/'),
            self.settings.subscription_id,
            descriptor.namespace_short_name(),
            descriptor.tunnel_name,
        ))
    }

    async fn bearer(&self) -> Result<String, ProvisionError> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires)) = cached.as_ref() {
            if Instant::now() < *expires {
                return Ok(token.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.settings.authority_host.trim_end_matches('/'),
            self.settings.tenant_id
        );
        let scope = format!(
            "{}/.default",
            self.settings.management_endpoint.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Auth(format!("{status}: {body}")));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProvisionError::Auth(e.to_string()))?;
        debug!(expires_in = token.expires_in, "ARM token acquired");

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }

    async fn call(
        &self,
        method: Method,
        descriptor: &TunnelDescriptor,
        body: Option<serde_json::Value>,
    ) -> Result<StatusCode, ProvisionError> {
        let url = self.resource_url(descriptor)?;
        let token = self.bearer().await?;
        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT || status == StatusCode::NOT_FOUND
        {
            return Ok(status);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ProvisionError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

impl ResourceProvisioner for ArmProvisioner {
    fn create<'a>(
        &'a self,
        descriptor: &'a TunnelDescriptor,
    ) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "properties": {
                    "requiresClientAuthorization": descriptor.requires_client_authorization,
                    "userMetadata": descriptor.description,
                }
            });
            match self.call(Method::PUT, descriptor, Some(body)).await? {
                StatusCode::NOT_FOUND => Err(ProvisionError::Api {
                    status: 404,
                    message: "namespace or resource group not found".into(),
                }),
                status => {
                    info!(name = %descriptor.tunnel_name, %status, "Hybrid connection ready");
                    Ok(())
                }
            }
        })
    }

    fn delete<'a>(
        &'a self,
        descriptor: &'a TunnelDescriptor,
    ) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            info!(name = %descriptor.tunnel_name, "Deleting hybrid connection");
            match self.call(Method::DELETE, descriptor, None).await? {
                StatusCode::CONFLICT => Err(ProvisionError::Api {
                    status: 409,
                    message: "delete conflicted".into(),
                }),
                _ => {
                    info!(name = %descriptor.tunnel_name, "Hybrid connection deleted");
                    Ok(())
                }
            }
        })
    }

    fn exists<'a>(
        &'a self,
        descriptor: &'a TunnelDescriptor,
    ) -> BoxFuture<'a, Result<bool, ProvisionError>> {
        Box::pin(async move {
            let status = self.call(Method::GET, descriptor, None).await?;
            Ok(status.is_success())
        })
    }
}
