//! Waiting for a raft leader.

use std::sync::Arc;
use std::time::Duration;

use consul_reconcile::{BoundedPoll, PollStep};
use tracing::info;

use crate::error::RecoveryError;
use crate::gateway::{ClusterContext, ClusterGateway, GatewayError};

/// Polls the leader endpoint until a leader is elected.
pub struct LeaderWatcher {
    gateway: Arc<dyn ClusterGateway>,
    interval: Duration,
}

impl LeaderWatcher {
    pub fn new(gateway: Arc<dyn ClusterGateway>, interval: Duration) -> Self {
        Self { gateway, interval }
    }

    /// Wait until the cluster reports a leader.
    ///
    /// Every failure is "not ready"; only the timeout is fatal. Returns the
    /// leader address.
    pub async fn await_leader(
        &self,
        ctx: &ClusterContext,
        timeout: Duration,
    ) -> Result<String, RecoveryError> {
        let poll = BoundedPoll::after_interval(self.interval, timeout);

        let leader = poll
            .run("leader election", |_| async move {
                match self.gateway.leader(ctx).await {
                    Ok(Some(leader)) => PollStep::Ready(leader),
                    Ok(None) => PollStep::Retry("no leader elected yet".to_string()),
                    Err(e) => PollStep::<String, GatewayError>::Retry(e.to_string()),
                }
            })
            .await?;

        info!(leader = %leader, "Consul leader is elected");
        Ok(leader)
    }
}
