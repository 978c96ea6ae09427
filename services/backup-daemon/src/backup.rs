//! Snapshot backup workflow.

use std::path::PathBuf;
use std::sync::Arc;

use consul_snapshot_format::{SnapshotLayout, TokenSidecar, SNAPSHOT_FILE};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bootstrap::read_bootstrap_token;
use crate::directory::ClusterActorDirectory;
use crate::error::{Phase, RecoveryError, RecoveryFailure};
use crate::gateway::{ClusterContext, ClusterGateway};
use crate::release::Release;

/// Parameters of one backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    /// Destination folder.
    pub folder: PathBuf,

    /// Datacenters to capture; every known datacenter when empty.
    pub datacenters: Vec<String>,
}

/// Result of a successful backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub datacenters: Vec<String>,

    /// Whether the bootstrap token was captured.
    pub token_captured: bool,
}

/// Captures snapshots and the bootstrap token into a backup folder.
pub struct BackupWorkflow {
    gateway: Arc<dyn ClusterGateway>,
    directory: Arc<dyn ClusterActorDirectory>,
    release: Release,
    acl_enabled: bool,
}

impl BackupWorkflow {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        directory: Arc<dyn ClusterActorDirectory>,
        release: Release,
        acl_enabled: bool,
    ) -> Self {
        Self {
            gateway,
            directory,
            release,
            acl_enabled,
        }
    }

    pub async fn run(&self, request: &BackupRequest) -> Result<BackupSummary, RecoveryFailure> {
        let start = Instant::now();
        self.backup(request)
            .await
            .map_err(|e| e.in_phase(Phase::Backup, start.elapsed()))
    }

    async fn backup(&self, request: &BackupRequest) -> Result<BackupSummary, RecoveryError> {
        let layout = SnapshotLayout::new(&request.folder);

        let token = if self.acl_enabled {
            Some(read_bootstrap_token(self.directory.as_ref(), &self.release).await?)
        } else {
            None
        };
        let ctx = match &token {
            Some(token) => ClusterContext::anonymous().with_token(token.as_str()),
            None => ClusterContext::anonymous(),
        };

        let datacenters = if request.datacenters.is_empty() {
            debug!("Datacenters are not specified, capturing every known datacenter");
            self.gateway.list_datacenters(&ctx).await?
        } else {
            request.datacenters.clone()
        };

        info!(datacenters = ?datacenters, "Capturing snapshots");
        for datacenter in &datacenters {
            let dir = layout.create_datacenter_dir(datacenter)?;
            let snapshot = self.gateway.save_snapshot(&ctx, datacenter).await?;
            tokio::fs::write(dir.join(SNAPSHOT_FILE), &snapshot).await?;
            info!(
                datacenter = %datacenter,
                size_bytes = snapshot.len(),
                "Snapshot for datacenter is captured"
            );
        }

        if let Some(token) = &token {
            TokenSidecar::from_token(token.as_str()).write_to_file(layout.token_sidecar_path())?;
            info!(secret = %self.release.bootstrap_secret(), "Bootstrap token is captured");
        }

        Ok(BackupSummary {
            datacenters,
            token_captured: token.is_some(),
        })
    }
}
