//! Kubernetes auth-method republishing.
//!
//! A restored snapshot carries the auth methods of the backed-up cluster,
//! including a service account JWT and CA that may no longer be valid. The
//! synchronizer rebuilds the method from the live service account token and
//! publishes it under every binding name.

use std::sync::Arc;

use consul_reconcile::{BoundedPoll, PollStep};
use tracing::{debug, info};

use crate::config::RecoveryTimings;
use crate::directory::{ClusterActorDirectory, KeyValueSecret};
use crate::error::RecoveryError;
use crate::gateway::{AuthMethod, ClusterContext, ClusterGateway, GatewayError, KubernetesAuthConfig};
use crate::release::Release;

/// API server address as seen from inside the cluster.
pub const KUBERNETES_HOST: &str = "https://kubernetes.default.svc";

/// Auth method type understood by Consul.
pub const AUTH_METHOD_TYPE: &str = "kubernetes";

pub const AUTH_METHOD_DESCRIPTION: &str = "Kubernetes Auth Method";

const CA_CERT_KEY: &str = "ca.crt";
const JWT_KEY: &str = "token";

/// Republishes the Kubernetes auth methods.
pub struct AuthMethodSynchronizer {
    gateway: Arc<dyn ClusterGateway>,
    directory: Arc<dyn ClusterActorDirectory>,
    release: Release,
    timings: RecoveryTimings,
}

impl AuthMethodSynchronizer {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        directory: Arc<dyn ClusterActorDirectory>,
        release: Release,
        timings: RecoveryTimings,
    ) -> Self {
        Self {
            gateway,
            directory,
            release,
            timings,
        }
    }

    /// Publish the auth method under every binding name.
    ///
    /// Returns the published names.
    pub async fn sync(&self, ctx: &ClusterContext) -> Result<Vec<String>, RecoveryError> {
        info!("The update of Kubernetes auth methods is started");

        let secret = self.resolve_token_secret().await?;
        let config = auth_config(&secret)?;

        let mut published = Vec::new();
        for name in self.release.auth_method_bindings() {
            let method = AuthMethod {
                name: name.clone(),
                description: AUTH_METHOD_DESCRIPTION.to_string(),
                method_type: AUTH_METHOD_TYPE.to_string(),
                config: config.clone(),
            };
            self.publish(ctx, &method).await?;
            info!(auth_method = %name, "Auth method is updated");
            published.push(name);
        }

        Ok(published)
    }

    /// Find the service account token secret.
    ///
    /// A secret named after the service account wins; otherwise the secrets
    /// the service account references are tried in order.
    async fn resolve_token_secret(&self) -> Result<KeyValueSecret, RecoveryError> {
        let account = self.release.auth_method_service_account();

        if let Some(secret) = self.directory.get_secret(&account).await? {
            if secret.is_service_account_token() {
                debug!(secret = %account, "Using secret named after the service account");
                return Ok(secret);
            }
        }

        for name in self.directory.service_account_secret_names(&account).await? {
            if let Some(secret) = self.directory.get_secret(&name).await? {
                if secret.is_service_account_token() {
                    debug!(secret = %name, "Using secret referenced by the service account");
                    return Ok(secret);
                }
            }
        }

        Err(RecoveryError::inconsistency(format!(
            "no service account token secret found for service account {}",
            account
        )))
    }

    async fn publish(&self, ctx: &ClusterContext, method: &AuthMethod) -> Result<(), RecoveryError> {
        let poll = BoundedPoll::after_interval(
            self.timings.poll_interval,
            self.timings.auth_method_timeout,
        );
        let operation = format!("update auth method {}", method.name);

        poll.run(&operation, |_| async move {
            match self.gateway.put_auth_method(ctx, method).await {
                Ok(()) => PollStep::Ready(()),
                Err(e) => PollStep::<(), GatewayError>::Retry(e.to_string()),
            }
        })
        .await?;
        Ok(())
    }
}

fn auth_config(secret: &KeyValueSecret) -> Result<KubernetesAuthConfig, RecoveryError> {
    let ca_cert = text_value(secret, CA_CERT_KEY)?;
    let jwt = text_value(secret, JWT_KEY)?;
    Ok(KubernetesAuthConfig {
        host: KUBERNETES_HOST.to_string(),
        ca_cert,
        service_account_jwt: jwt,
    })
}

fn text_value(secret: &KeyValueSecret, key: &str) -> Result<String, RecoveryError> {
    let bytes = secret.get(key).ok_or_else(|| {
        RecoveryError::inconsistency(format!("service account token secret has no '{}' key", key))
    })?;
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        RecoveryError::inconsistency(format!("service account token secret '{}' is not UTF-8", key))
    })
}
