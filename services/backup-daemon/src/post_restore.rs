//! Auth-method refresh after a volume-level restore.
//!
//! Used when the cluster was restored by replacing its volumes rather than
//! through the snapshot API. The bootstrap secret is reread on every attempt
//! because it may be restored after this command starts.

use std::sync::Arc;

use consul_reconcile::FixedRetry;
use tokio::time::Instant;
use tracing::info;

use crate::auth_method::AuthMethodSynchronizer;
use crate::bootstrap::read_bootstrap_token;
use crate::config::RecoveryTimings;
use crate::directory::ClusterActorDirectory;
use crate::error::{Phase, RecoveryError, RecoveryFailure};
use crate::gateway::{ClusterContext, ClusterGateway};
use crate::leader::LeaderWatcher;
use crate::release::Release;

/// Waits for a leader, then republishes the auth methods.
pub struct PostRestore {
    directory: Arc<dyn ClusterActorDirectory>,
    release: Release,
    acl_enabled: bool,
    timings: RecoveryTimings,
    leader: LeaderWatcher,
    auth: AuthMethodSynchronizer,
}

impl PostRestore {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        directory: Arc<dyn ClusterActorDirectory>,
        release: Release,
        acl_enabled: bool,
        timings: RecoveryTimings,
    ) -> Self {
        Self {
            leader: LeaderWatcher::new(gateway.clone(), timings.poll_interval),
            auth: AuthMethodSynchronizer::new(
                gateway,
                directory.clone(),
                release.clone(),
                timings.clone(),
            ),
            directory,
            release,
            acl_enabled,
            timings,
        }
    }

    /// Returns the republished auth-method names.
    pub async fn run(&self) -> Result<Vec<String>, RecoveryFailure> {
        let start = Instant::now();

        let ctx = self
            .context()
            .await
            .map_err(|e| e.in_phase(Phase::BootstrapToken, start.elapsed()))?;
        self.leader
            .await_leader(&ctx, self.timings.leader_timeout)
            .await
            .map_err(|e| e.in_phase(Phase::LeaderWait(1), start.elapsed()))?;

        let retry = FixedRetry::new(
            self.timings.post_restore_attempts,
            self.timings.post_restore_pause,
        );
        let published = retry
            .run("refresh auth methods", |_| async move {
                let ctx = self.context().await?;
                self.auth.sync(&ctx).await
            })
            .await
            .map_err(|e| e.in_phase(Phase::AuthSync, start.elapsed()))?;

        info!(auth_methods = ?published, "Auth methods are refreshed");
        Ok(published)
    }

    async fn context(&self) -> Result<ClusterContext, RecoveryError> {
        if !self.acl_enabled {
            return Ok(ClusterContext::anonymous());
        }
        let token = read_bootstrap_token(self.directory.as_ref(), &self.release).await?;
        Ok(ClusterContext::anonymous().with_token(token))
    }
}
