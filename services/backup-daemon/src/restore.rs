//! Snapshot restore workflow.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use consul_snapshot_format::{SnapshotLayout, TokenSidecar};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bootstrap::{read_bootstrap_token, reconcile_bootstrap_token};
use crate::config::RecoveryTimings;
use crate::directory::ClusterActorDirectory;
use crate::error::{Phase, RecoveryError, RecoveryFailure};
use crate::gateway::{ClusterContext, ClusterGateway};
use crate::orchestrator::{RecoveryOrchestrator, RecoveryOutcome};
use crate::release::Release;

/// Parameters of one restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Backup folder.
    pub folder: PathBuf,

    /// Datacenters to restore; every datacenter in the folder when empty.
    pub datacenters: Vec<String>,

    /// Restore snapshots only, without checking or recovering ACL state.
    pub skip_acl_recovery: bool,
}

/// Result of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub datacenters: Vec<String>,

    /// Recovery outcome; `None` when no ACL recovery applied.
    pub recovery: Option<RecoveryOutcome>,
}

/// Decide whether ACL recovery applies to this restore.
///
/// Returns the sidecar when the cluster and the backup both use ACLs, `None`
/// when neither does or the check is skipped. A mismatch is a configuration
/// inconsistency.
pub fn check_consistency(
    acl_enabled: bool,
    sidecar: Option<TokenSidecar>,
    skip_acl_recovery: bool,
) -> Result<Option<TokenSidecar>, RecoveryError> {
    if skip_acl_recovery {
        return Ok(None);
    }
    match (acl_enabled, sidecar) {
        (true, None) => Err(RecoveryError::inconsistency(
            "cluster has ACLs enabled but the backup has no bootstrap token",
        )),
        (false, Some(_)) => Err(RecoveryError::inconsistency(
            "cluster has ACLs disabled but the backup has a bootstrap token",
        )),
        (_, sidecar) => Ok(sidecar),
    }
}

/// Restores snapshots and, when needed, recovers the ACL state.
pub struct RestoreWorkflow {
    gateway: Arc<dyn ClusterGateway>,
    directory: Arc<dyn ClusterActorDirectory>,
    release: Release,
    acl_enabled: bool,
    orchestrator: RecoveryOrchestrator,
}

impl RestoreWorkflow {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        directory: Arc<dyn ClusterActorDirectory>,
        release: Release,
        acl_enabled: bool,
        timings: RecoveryTimings,
    ) -> Self {
        Self {
            orchestrator: RecoveryOrchestrator::new(
                gateway.clone(),
                directory.clone(),
                release.clone(),
                timings,
            ),
            gateway,
            directory,
            release,
            acl_enabled,
        }
    }

    pub async fn run(&self, request: &RestoreRequest) -> Result<RestoreSummary, RecoveryFailure> {
        let start = Instant::now();
        let fail = move |phase: Phase| move |e: RecoveryError| e.in_phase(phase, start.elapsed());

        let layout = SnapshotLayout::new(&request.folder);

        let sidecar = layout
            .read_token_sidecar()
            .map_err(RecoveryError::from)
            .and_then(|sidecar| {
                check_consistency(self.acl_enabled, sidecar, request.skip_acl_recovery)
            })
            .map_err(fail(Phase::ConsistencyCheck))?;

        let ctx = if self.acl_enabled {
            let token = read_bootstrap_token(self.directory.as_ref(), &self.release)
                .await
                .map_err(fail(Phase::BootstrapToken))?;
            ClusterContext::anonymous().with_token(token)
        } else {
            ClusterContext::anonymous()
        };

        let datacenters = self
            .restore_snapshots(&ctx, &layout, &request.datacenters)
            .await
            .map_err(fail(Phase::SnapshotRestore))?;

        let recovery = match sidecar {
            Some(sidecar) => {
                let bootstrap =
                    reconcile_bootstrap_token(self.directory.as_ref(), &self.release, &sidecar)
                        .await
                        .map_err(fail(Phase::BootstrapToken))?;
                let ctx = ctx.with_token(bootstrap.token);
                Some(self.orchestrator.run(&ctx, bootstrap.changed).await?)
            }
            None => None,
        };

        info!(datacenters = ?datacenters, "Snapshots are restored successfully");
        Ok(RestoreSummary {
            datacenters,
            recovery,
        })
    }

    async fn restore_snapshots(
        &self,
        ctx: &ClusterContext,
        layout: &SnapshotLayout,
        requested: &[String],
    ) -> Result<Vec<String>, RecoveryError> {
        let datacenters = if requested.is_empty() {
            debug!("Datacenters are not specified, restoring every datacenter in the backup");
            layout.datacenters()?
        } else {
            requested.to_vec()
        };

        info!(datacenters = ?datacenters, "Restoring snapshots");
        for datacenter in &datacenters {
            let path = layout.snapshot_path(datacenter)?;
            let snapshot = tokio::fs::read(&path).await?;
            self.gateway
                .restore_snapshot(ctx, datacenter, Bytes::from(snapshot))
                .await?;
            info!(datacenter = %datacenter, "Snapshot for datacenter is restored");
        }

        Ok(datacenters)
    }
}
