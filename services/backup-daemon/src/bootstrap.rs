//! Bootstrap token reconciliation.
//!
//! The bootstrap ACL token lives in a Kubernetes secret. After a restore the
//! cluster's ACL state belongs to the backup, so the secret must hold the
//! token captured with the backup. Whether it had to change decides if the
//! recovery workflow runs.

use consul_snapshot_format::TokenSidecar;
use tracing::info;

use crate::directory::{ClusterActorDirectory, KeyValueSecret};
use crate::error::RecoveryError;
use crate::release::{Release, BOOTSTRAP_TOKEN_KEY};

/// Result of reconciling the bootstrap secret.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    /// The token now stored in the secret.
    pub token: String,

    /// Whether the secret had to be patched.
    pub changed: bool,
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapToken")
            .field("token", &"[REDACTED]")
            .field("changed", &self.changed)
            .finish()
    }
}

/// Read the bootstrap token from its secret.
///
/// A missing secret or key is a configuration inconsistency.
pub async fn read_bootstrap_token(
    directory: &dyn ClusterActorDirectory,
    release: &Release,
) -> Result<String, RecoveryError> {
    let name = release.bootstrap_secret();
    let secret = directory
        .get_secret(&name)
        .await?
        .ok_or_else(|| RecoveryError::inconsistency(format!("secret {} does not exist", name)))?;
    let token = secret.get(BOOTSTRAP_TOKEN_KEY).ok_or_else(|| {
        RecoveryError::inconsistency(format!("secret {} has no '{}' key", name, BOOTSTRAP_TOKEN_KEY))
    })?;
    utf8_token(token)
}

/// Make the bootstrap secret hold the sidecar's token.
///
/// The secret is patched only when its value differs from the sidecar.
pub async fn reconcile_bootstrap_token(
    directory: &dyn ClusterActorDirectory,
    release: &Release,
    sidecar: &TokenSidecar,
) -> Result<BootstrapToken, RecoveryError> {
    let name = release.bootstrap_secret();
    let secret = directory
        .get_secret(&name)
        .await?
        .ok_or_else(|| RecoveryError::inconsistency(format!("secret {} does not exist", name)))?;

    let token = utf8_token(sidecar.token())?;
    let current = secret.get(BOOTSTRAP_TOKEN_KEY);

    if current == Some(sidecar.token()) {
        info!(secret = %name, "Bootstrap token is unchanged");
        return Ok(BootstrapToken {
            token,
            changed: false,
        });
    }

    let patch = KeyValueSecret {
        secret_type: None,
        data: [(BOOTSTRAP_TOKEN_KEY.to_string(), sidecar.token().to_vec())].into(),
    };
    directory.patch_secret(&name, &patch).await?;
    info!(secret = %name, "Bootstrap token is updated from the backup");

    Ok(BootstrapToken {
        token,
        changed: true,
    })
}

fn utf8_token(bytes: &[u8]) -> Result<String, RecoveryError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| RecoveryError::inconsistency("bootstrap token is not valid UTF-8"))
}
