//! Identity resolution for new agent connections
//!
//! Maps (tenant auth code, agent ID) to the tenant and host identifiers
//! assigned by the manager service. Resolution is called once per new
//! connection.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default bound on a single resolution call
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

const CONN_AUTH_PATH: &str = "/agent/host/connAuth";
const STATUS_OK: i32 = 200;

/// Tenant/host identifiers assigned to a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    pub tenant_id: i32,
    pub host_id: i32,
}

impl Identity {
    /// Zeroed identity used when resolution fails
    pub fn degraded() -> Self {
        Self::default()
    }
}

/// Body of the connection-auth request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnAuthRequest {
    pub tenant_auth_code: String,
    pub agent_id: String,
    pub agent_version: String,
    pub ext_ip: String,
}

#[derive(Debug, Deserialize)]
struct ConnAuthResponse {
    status: i32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: ConnAuthData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnAuthData {
    #[serde(default)]
    tenant_id: i32,
    #[serde(default)]
    host_id: i32,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Identity rejected (status {status}): {msg}")]
    Rejected { status: i32, msg: String },

    #[error("Identity resolution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Identity resolution is not configured")]
    Disabled,
}

/// Resolves agent credentials to tenant/host identifiers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, request: &ConnAuthRequest) -> Result<Identity, IdentityError>;
}

/// Resolver backed by the manager's HTTP API
#[derive(Debug, Clone)]
pub struct HttpIdentityResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIdentityResolver {
    /// Create a resolver for `manager_url` (e.g. "http://manager:6701")
    pub fn new(manager_url: &str, timeout: Duration) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", manager_url.trim_end_matches('/'), CONN_AUTH_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve(&self, request: &ConnAuthRequest) -> Result<Identity, IdentityError> {
        let response: ConnAuthResponse = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?
            .json()
            .await?;

        if response.status != STATUS_OK {
            return Err(IdentityError::Rejected {
                status: response.status,
                msg: response.msg,
            });
        }

        debug!(
            agent_id = %request.agent_id,
            tenant_id = response.data.tenant_id,
            host_id = response.data.host_id,
            "Identity resolved"
        );
        Ok(Identity {
            tenant_id: response.data.tenant_id,
            host_id: response.data.host_id,
        })
    }
}

/// Resolver used when no manager is configured; every call fails
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledIdentityResolver;

#[async_trait]
impl IdentityResolver for DisabledIdentityResolver {
    async fn resolve(&self, _request: &ConnAuthRequest) -> Result<Identity, IdentityError> {
        Err(IdentityError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_camel_case() {
        let request = ConnAuthRequest {
            tenant_auth_code: "11ea5588".to_string(),
            agent_id: "agent-1".to_string(),
            agent_version: "1.1.3".to_string(),
            ext_ip: "210.158.1.69:41000".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tenantAuthCode"], "11ea5588");
        assert_eq!(json["agentId"], "agent-1");
        assert_eq!(json["agentVersion"], "1.1.3");
        assert_eq!(json["extIp"], "210.158.1.69:41000");
    }

    #[test]
    fn test_response_deserializes() {
        let body = r#"{"status":200,"msg":"ok","data":{"tenantId":12,"hostId":34}}"#;
        let response: ConnAuthResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data.tenant_id, 12);
        assert_eq!(response.data.host_id, 34);

        let body = r#"{"status":403,"msg":"bad tenant"}"#;
        let response: ConnAuthResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(response.data.tenant_id, 0);
    }

    #[test]
    fn test_endpoint_joins_path() {
        let resolver =
            HttpIdentityResolver::new("http://manager:6701/", DEFAULT_AUTH_TIMEOUT).unwrap();
        assert_eq!(resolver.endpoint(), "http://manager:6701/agent/host/connAuth");
    }

    #[tokio::test]
    async fn test_disabled_resolver_fails() {
        let request = ConnAuthRequest {
            tenant_auth_code: String::new(),
            agent_id: "a".to_string(),
            agent_version: String::new(),
            ext_ip: String::new(),
        };
        assert!(matches!(
            DisabledIdentityResolver.resolve(&request).await,
            Err(IdentityError::Disabled)
        ));
        assert_eq!(Identity::degraded(), Identity::default());
    }
}
