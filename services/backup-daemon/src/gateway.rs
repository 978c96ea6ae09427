//! Consul HTTP API gateway.
//!
//! Typed access to the control-plane operations the backup daemon needs:
//! - Leader status
//! - ACL token listing and creation
//! - Catalog nodes and datacenters
//! - Auth-method configuration
//! - Snapshot save and restore
//!
//! The gateway itself holds no credentials. Every call takes a
//! [`ClusterContext`] carrying the bearer token to present.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Header carrying the ACL token.
pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Policy attached to server agent tokens.
pub const AGENT_TOKEN_POLICY: &str = "agent-token";

const LEADER_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection refused, reset or timed out.
    #[error("transient network error during {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },

    /// The cluster answered with a non-success status.
    #[error("cluster rejected {operation} with status {status}: {body}")]
    Rejected {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// A success response could not be decoded.
    #[error("failed to decode {operation} response: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

impl GatewayError {
    /// Create a transient error from a transport failure.
    pub fn transient(operation: &'static str, err: impl fmt::Display) -> Self {
        Self::Transient {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true for connection-level failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The HTTP status of a rejection, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Request context carrying the ACL token for cluster calls.
///
/// Contexts are immutable; switching tokens produces a new context.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClusterContext {
    token: Option<String>,
}

impl ClusterContext {
    /// A context without a token, for clusters running without ACLs.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A new context presenting `token`.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// The token presented on every call, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// ACL token as returned by the token endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclToken {
    #[serde(rename = "AccessorID", default)]
    pub accessor_id: String,
    #[serde(rename = "SecretID", default)]
    pub secret_id: String,
    #[serde(rename = "Description", default)]
    pub description: String,
}

/// Policy reference in a token request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLink {
    #[serde(rename = "Name")]
    pub name: String,
}

/// Token creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAclToken {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Policies")]
    pub policies: Vec<PolicyLink>,
}

impl NewAclToken {
    /// A server agent token request.
    pub fn agent(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            policies: vec![PolicyLink {
                name: AGENT_TOKEN_POLICY.to_string(),
            }],
        }
    }
}

/// Kubernetes auth-method configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMethod {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Type")]
    pub method_type: String,
    #[serde(rename = "Config")]
    pub config: KubernetesAuthConfig,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesAuthConfig {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "CACert")]
    pub ca_cert: String,
    #[serde(rename = "ServiceAccountJWT")]
    pub service_account_jwt: String,
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMethod")
            .field("name", &self.name)
            .field("type", &self.method_type)
            .field("host", &self.config.host)
            .finish()
    }
}

impl fmt::Debug for KubernetesAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubernetesAuthConfig")
            .field("host", &self.host)
            .field("service_account_jwt", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogNode {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "Address")]
    address: String,
}

/// Consul control-plane operations.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Current raft leader address, `None` while no leader is elected.
    async fn leader(&self, ctx: &ClusterContext) -> Result<Option<String>, GatewayError>;

    /// Every ACL token visible to the context's token.
    async fn list_acl_tokens(&self, ctx: &ClusterContext) -> Result<Vec<AclToken>, GatewayError>;

    /// Create an ACL token.
    async fn create_acl_token(
        &self,
        ctx: &ClusterContext,
        request: &NewAclToken,
    ) -> Result<AclToken, GatewayError>;

    /// Catalog view of node name to registered address.
    async fn list_catalog_nodes(
        &self,
        ctx: &ClusterContext,
    ) -> Result<BTreeMap<String, String>, GatewayError>;

    /// Create or replace an auth method.
    async fn put_auth_method(
        &self,
        ctx: &ClusterContext,
        method: &AuthMethod,
    ) -> Result<(), GatewayError>;

    /// Known datacenters.
    async fn list_datacenters(&self, ctx: &ClusterContext) -> Result<Vec<String>, GatewayError>;

    /// Capture a snapshot of one datacenter.
    async fn save_snapshot(
        &self,
        ctx: &ClusterContext,
        datacenter: &str,
    ) -> Result<Bytes, GatewayError>;

    /// Restore a snapshot into one datacenter.
    async fn restore_snapshot(
        &self,
        ctx: &ClusterContext,
        datacenter: &str,
        snapshot: Bytes,
    ) -> Result<(), GatewayError>;
}

/// Gateway backed by the Consul HTTP API.
#[derive(Debug, Clone)]
pub struct HttpClusterGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClusterGateway {
    /// Create a gateway for `base_url`, trusting `ca_file` if given.
    pub fn new(base_url: &str, ca_file: Option<&Path>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(path) = ca_file {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read CA bundle {}", path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid CA bundle {}", path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build a URL for an endpoint.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Start a request with the context's token attached.
    fn request(
        &self,
        ctx: &ClusterContext,
        method: reqwest::Method,
        path: &str,
    ) -> reqwest::RequestBuilder {
        let request = self.client.request(method, self.url(path));
        match ctx.token() {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    /// Send a request, mapping transport and status failures.
    async fn send(
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::transient(operation, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(operation, status = %status, body = %body, "Consul rejected request");
            return Err(GatewayError::Rejected {
                operation,
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn json<T: DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::transient(operation, e))?;
        serde_json::from_slice(&body).map_err(|e| GatewayError::Decode {
            operation,
            message: e.to_string(),
        })
    }
}

/// Interpret a leader status body.
///
/// Consul answers with a JSON string; `""` means no leader is elected.
pub fn parse_leader(body: &str) -> Option<String> {
    let address = body.trim().trim_matches('"').trim();
    if address.is_empty() {
        None
    } else {
        Some(address.to_string())
    }
}

#[async_trait]
impl ClusterGateway for HttpClusterGateway {
    async fn leader(&self, ctx: &ClusterContext) -> Result<Option<String>, GatewayError> {
        const OP: &str = "get leader";
        let request = self
            .request(ctx, reqwest::Method::GET, "/v1/status/leader")
            .timeout(LEADER_TIMEOUT);
        let response = Self::send(OP, request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::transient(OP, e))?;
        Ok(parse_leader(&body))
    }

    async fn list_acl_tokens(&self, ctx: &ClusterContext) -> Result<Vec<AclToken>, GatewayError> {
        const OP: &str = "list ACL tokens";
        let request = self
            .request(ctx, reqwest::Method::GET, "/v1/acl/tokens")
            .timeout(LIST_TIMEOUT);
        let response = Self::send(OP, request).await?;
        Self::json(OP, response).await
    }

    async fn create_acl_token(
        &self,
        ctx: &ClusterContext,
        token: &NewAclToken,
    ) -> Result<AclToken, GatewayError> {
        const OP: &str = "create ACL token";
        let request = self
            .request(ctx, reqwest::Method::PUT, "/v1/acl/token")
            .timeout(WRITE_TIMEOUT)
            .json(token);
        let response = Self::send(OP, request).await?;
        let created: AclToken = Self::json(OP, response).await?;
        if created.secret_id.is_empty() {
            return Err(GatewayError::Decode {
                operation: OP,
                message: "response carries no SecretID".to_string(),
            });
        }
        Ok(created)
    }

    async fn list_catalog_nodes(
        &self,
        ctx: &ClusterContext,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        const OP: &str = "list catalog nodes";
        let request = self
            .request(ctx, reqwest::Method::GET, "/v1/catalog/nodes")
            .timeout(LIST_TIMEOUT);
        let response = Self::send(OP, request).await?;
        let nodes: Vec<CatalogNode> = Self::json(OP, response).await?;
        Ok(nodes.into_iter().map(|n| (n.node, n.address)).collect())
    }

    async fn put_auth_method(
        &self,
        ctx: &ClusterContext,
        method: &AuthMethod,
    ) -> Result<(), GatewayError> {
        const OP: &str = "update auth method";
        let path = format!("/v1/acl/auth-method/{}", method.name);
        let request = self
            .request(ctx, reqwest::Method::PUT, &path)
            .timeout(WRITE_TIMEOUT)
            .json(method);
        Self::send(OP, request).await?;
        Ok(())
    }

    async fn list_datacenters(&self, ctx: &ClusterContext) -> Result<Vec<String>, GatewayError> {
        const OP: &str = "list datacenters";
        let request = self
            .request(ctx, reqwest::Method::GET, "/v1/catalog/datacenters")
            .timeout(LIST_TIMEOUT);
        let response = Self::send(OP, request).await?;
        Self::json(OP, response).await
    }

    async fn save_snapshot(
        &self,
        ctx: &ClusterContext,
        datacenter: &str,
    ) -> Result<Bytes, GatewayError> {
        const OP: &str = "save snapshot";
        let request = self
            .request(ctx, reqwest::Method::GET, "/v1/snapshot")
            .timeout(SNAPSHOT_TIMEOUT)
            .query(&[("dc", datacenter)]);
        let response = Self::send(OP, request).await?;
        response
            .bytes()
            .await
            .map_err(|e| GatewayError::transient(OP, e))
    }

    async fn restore_snapshot(
        &self,
        ctx: &ClusterContext,
        datacenter: &str,
        snapshot: Bytes,
    ) -> Result<(), GatewayError> {
        const OP: &str = "restore snapshot";
        let request = self
            .request(ctx, reqwest::Method::PUT, "/v1/snapshot")
            .timeout(SNAPSHOT_TIMEOUT)
            .query(&[("dc", datacenter)])
            .body(snapshot);
        Self::send(OP, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_leader() {
        assert_eq!(parse_leader("\"10.0.0.1:8300\""), Some("10.0.0.1:8300".to_string()));
        assert_eq!(parse_leader("\"\""), None);
        assert_eq!(parse_leader(""), None);
        assert_eq!(parse_leader("  \"\"\n"), None);
    }

    #[test]
    fn test_context_replaces_token_without_mutation() {
        let anonymous = ClusterContext::anonymous();
        let old = anonymous.with_token("old");
        let new = old.with_token("new");

        assert_eq!(anonymous.token(), None);
        assert_eq!(old.token(), Some("old"));
        assert_eq!(new.token(), Some("new"));
        assert!(!format!("{:?}", new).contains("new\""));
    }

    #[test]
    fn test_agent_token_request_serialization() {
        let request = NewAclToken::agent("Server Token for 10.0.0.1");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Description": "Server Token for 10.0.0.1",
                "Policies": [{"Name": "agent-token"}]
            })
        );
    }

    #[test]
    fn test_token_list_tolerates_missing_fields() {
        let tokens: Vec<AclToken> = serde_json::from_str(
            r#"[{"AccessorID":"a1","SecretID":"s1"},{"AccessorID":"a2","SecretID":"s2","Description":"x"}]"#,
        )
        .unwrap();
        assert_eq!(tokens[0].description, "");
        assert_eq!(tokens[1].description, "x");
    }

    #[test]
    fn test_url_building() {
        let gateway = HttpClusterGateway::new("http://consul:8500/", None).unwrap();
        assert_eq!(gateway.url("/v1/status/leader"), "http://consul:8500/v1/status/leader");
    }
}
