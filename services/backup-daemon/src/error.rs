//! Error types for backup, restore and recovery.

use std::fmt;
use std::time::Duration;

use consul_snapshot_format::SnapshotFormatError;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::gateway::GatewayError;

/// A step of the restore and recovery workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Comparing the cluster's ACL mode with the backup's.
    ConsistencyCheck,
    /// Uploading snapshots.
    SnapshotRestore,
    /// Reconciling the bootstrap token secret with the sidecar.
    BootstrapToken,
    /// Waiting for a raft leader; rounds are numbered from 1.
    LeaderWait(u8),
    /// Restarting every server after a bootstrap token change.
    ForceRestartServers,
    /// Ensuring every server has an agent token.
    TokenReconcile,
    /// Republishing the Kubernetes auth methods.
    AuthSync,
    /// Restarting servers registered under a stale address.
    NodeIntegrityFix,
    /// Restarting pods marked `restore-policy=restart`.
    FinalRestart,
    /// Capturing snapshots.
    Backup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsistencyCheck => write!(f, "consistency_check"),
            Self::SnapshotRestore => write!(f, "snapshot_restore"),
            Self::BootstrapToken => write!(f, "bootstrap_token"),
            Self::LeaderWait(round) => write!(f, "leader_wait_{}", round),
            Self::ForceRestartServers => write!(f, "force_restart_servers"),
            Self::TokenReconcile => write!(f, "token_reconcile"),
            Self::AuthSync => write!(f, "auth_sync"),
            Self::NodeIntegrityFix => write!(f, "node_integrity_fix"),
            Self::FinalRestart => write!(f, "final_restart"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// Errors raised by a single phase.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Cluster call failed where no retry applies.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Pod backend call failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The cluster and the backup disagree structurally; retrying cannot help.
    #[error("configuration inconsistency: {0}")]
    ConfigurationInconsistency(String),

    /// A polling phase spent its budget.
    #[error("{operation} did not succeed within {budget:?}")]
    PhaseTimeout {
        operation: String,
        budget: Duration,
    },

    /// Local backup folder failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotFormatError),

    /// Local IO failure outside the folder format.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecoveryError {
    /// Create a configuration inconsistency.
    pub fn inconsistency(message: impl Into<String>) -> Self {
        Self::ConfigurationInconsistency(message.into())
    }

    /// Returns true for structural mismatches.
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, Self::ConfigurationInconsistency(_))
    }

    /// Returns true when a polling budget ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PhaseTimeout { .. })
    }

    /// Attach the phase and elapsed time.
    pub fn in_phase(self, phase: Phase, elapsed: Duration) -> RecoveryFailure {
        RecoveryFailure {
            phase,
            elapsed,
            source: self,
        }
    }
}

impl<E: Into<RecoveryError>> From<consul_reconcile::PollError<E>> for RecoveryError {
    fn from(err: consul_reconcile::PollError<E>) -> Self {
        match err {
            consul_reconcile::PollError::Timeout {
                operation, budget, ..
            } => Self::PhaseTimeout { operation, budget },
            consul_reconcile::PollError::Aborted(e) => e.into(),
        }
    }
}

/// A workflow that stopped in a specific phase.
#[derive(Debug, Error)]
#[error("{phase} failed after {elapsed:?}: {source}")]
pub struct RecoveryFailure {
    pub phase: Phase,
    pub elapsed: Duration,
    #[source]
    pub source: RecoveryError,
}

impl RecoveryFailure {
    /// The phase that aborted.
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use consul_reconcile::PollError;

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::LeaderWait(3).to_string(), "leader_wait_3");
        assert_eq!(Phase::NodeIntegrityFix.to_string(), "node_integrity_fix");
    }

    #[test]
    fn test_poll_timeout_becomes_phase_timeout() {
        let err: RecoveryError = PollError::<GatewayError>::Timeout {
            operation: "list ACL tokens".to_string(),
            budget: Duration::from_secs(180),
            attempts: 36,
        }
        .into();

        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "list ACL tokens did not succeed within 180s"
        );
    }

    #[test]
    fn test_failure_reports_phase() {
        let failure = RecoveryError::inconsistency("no sidecar")
            .in_phase(Phase::ConsistencyCheck, Duration::from_millis(5));

        assert_eq!(failure.phase(), Phase::ConsistencyCheck);
        assert!(failure.to_string().starts_with("consistency_check failed"));
    }
}
