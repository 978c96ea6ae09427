//! Post-restore recovery workflow.
//!
//! Runs when a restore replaced the bootstrap token. Phases run strictly in
//! order; the first fatal error ends the run with the failing phase:
//!
//! ```text
//! LeaderWait(1) -> ForceRestartServers -> LeaderWait(2) -> TokenReconcile
//!   -> LeaderWait(3) -> AuthSync -> NodeIntegrityFix -> LeaderWait(4)
//!   -> FinalRestart
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{error, info};

use crate::auth_method::AuthMethodSynchronizer;
use crate::config::RecoveryTimings;
use crate::directory::ClusterActorDirectory;
use crate::error::{Phase, RecoveryError, RecoveryFailure};
use crate::gateway::{ClusterContext, ClusterGateway};
use crate::integrity::NodeIntegrityChecker;
use crate::leader::LeaderWatcher;
use crate::release::Release;
use crate::tokens::{TokenReconcileReport, TokenReconciler};

/// Phases of a full recovery run, in execution order.
pub const RECOVERY_PHASES: [Phase; 9] = [
    Phase::LeaderWait(1),
    Phase::ForceRestartServers,
    Phase::LeaderWait(2),
    Phase::TokenReconcile,
    Phase::LeaderWait(3),
    Phase::AuthSync,
    Phase::NodeIntegrityFix,
    Phase::LeaderWait(4),
    Phase::FinalRestart,
];

/// How a recovery run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The bootstrap token did not change; nothing was touched.
    Skipped,

    /// Every phase succeeded.
    Completed(RecoveryReport),
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,

    /// Leader observed by the last leader wait.
    pub leader: String,

    /// Server pods deleted to pick up the new bootstrap token.
    pub servers_restarted: usize,

    pub tokens: TokenReconcileReport,

    /// Auth methods republished.
    pub auth_methods: Vec<String>,

    /// Servers restarted because of a stale catalog address.
    pub stale_nodes: Vec<String>,

    /// Pods restarted by the restart policy label.
    pub final_restarted: usize,
}

/// Drives the recovery phases against one release.
pub struct RecoveryOrchestrator {
    directory: Arc<dyn ClusterActorDirectory>,
    release: Release,
    timings: RecoveryTimings,
    leader: LeaderWatcher,
    tokens: TokenReconciler,
    auth: AuthMethodSynchronizer,
    integrity: NodeIntegrityChecker,
}

impl RecoveryOrchestrator {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        directory: Arc<dyn ClusterActorDirectory>,
        release: Release,
        timings: RecoveryTimings,
    ) -> Self {
        Self {
            leader: LeaderWatcher::new(gateway.clone(), timings.poll_interval),
            tokens: TokenReconciler::new(
                gateway.clone(),
                directory.clone(),
                release.clone(),
                timings.clone(),
            ),
            auth: AuthMethodSynchronizer::new(
                gateway.clone(),
                directory.clone(),
                release.clone(),
                timings.clone(),
            ),
            integrity: NodeIntegrityChecker::new(gateway, directory.clone(), release.clone()),
            directory,
            release,
            timings,
        }
    }

    /// Run the workflow.
    ///
    /// `ctx` must already carry the restored bootstrap token. When
    /// `token_changed` is false the run is skipped without any call.
    pub async fn run(
        &self,
        ctx: &ClusterContext,
        token_changed: bool,
    ) -> Result<RecoveryOutcome, RecoveryFailure> {
        if !token_changed {
            info!("Bootstrap token is unchanged, skipping ACL recovery");
            return Ok(RecoveryOutcome::Skipped);
        }

        let started_at = Utc::now();
        let start = Instant::now();
        info!("ACL recovery is started");

        self.phase(Phase::LeaderWait(1), start, self.await_leader(ctx))
            .await?;

        let servers_restarted = self
            .phase(Phase::ForceRestartServers, start, self.restart_servers())
            .await?;

        self.phase(Phase::LeaderWait(2), start, self.await_leader(ctx))
            .await?;

        let tokens = self
            .phase(Phase::TokenReconcile, start, self.tokens.reconcile(ctx))
            .await?;

        self.phase(Phase::LeaderWait(3), start, self.await_leader(ctx))
            .await?;

        let auth_methods = self
            .phase(Phase::AuthSync, start, self.auth.sync(ctx))
            .await?;

        let stale_nodes = self
            .phase(Phase::NodeIntegrityFix, start, self.integrity.check(ctx))
            .await?;

        let leader = self
            .phase(Phase::LeaderWait(4), start, self.await_leader(ctx))
            .await?;

        let final_restarted = self
            .phase(Phase::FinalRestart, start, self.restart_marked_pods())
            .await?;

        let report = RecoveryReport {
            started_at,
            elapsed: start.elapsed(),
            leader,
            servers_restarted,
            tokens,
            auth_methods,
            stale_nodes,
            final_restarted,
        };
        info!(
            elapsed_secs = report.elapsed.as_secs(),
            tokens_created = report.tokens.created,
            stale_nodes = report.stale_nodes.len(),
            "ACL recovery is completed"
        );
        Ok(RecoveryOutcome::Completed(report))
    }

    async fn phase<T, F>(&self, phase: Phase, start: Instant, work: F) -> Result<T, RecoveryFailure>
    where
        F: Future<Output = Result<T, RecoveryError>>,
    {
        info!(phase = %phase, "Recovery phase started");
        work.await.map_err(|e| {
            let failure = e.in_phase(phase, start.elapsed());
            error!(
                phase = %failure.phase,
                elapsed_secs = failure.elapsed.as_secs(),
                error = %failure.source,
                "Recovery phase failed"
            );
            failure
        })
    }

    async fn await_leader(&self, ctx: &ClusterContext) -> Result<String, RecoveryError> {
        self.leader
            .await_leader(ctx, self.timings.leader_timeout)
            .await
    }

    async fn restart_servers(&self) -> Result<usize, RecoveryError> {
        let deleted = self
            .directory
            .delete_by_selector(&self.release.server_selector())
            .await?;
        info!(deleted, "Server pods are restarted");
        Ok(deleted)
    }

    async fn restart_marked_pods(&self) -> Result<usize, RecoveryError> {
        let deleted = self
            .directory
            .delete_by_selector(&self.release.restart_required_selector())
            .await?;
        info!(deleted, "Pods with the restart policy are restarted");
        Ok(deleted)
    }
}
