//! Catalog address integrity.
//!
//! A server restored from a snapshot can stay registered in the catalog under
//! the address it had when the backup was taken. Such servers are restarted so
//! they re-register with their current address.

use std::sync::Arc;

use tracing::info;

use crate::directory::ClusterActorDirectory;
use crate::error::RecoveryError;
use crate::gateway::{ClusterContext, ClusterGateway};
use crate::release::Release;

/// Restarts servers whose catalog address is stale.
pub struct NodeIntegrityChecker {
    gateway: Arc<dyn ClusterGateway>,
    directory: Arc<dyn ClusterActorDirectory>,
    release: Release,
}

impl NodeIntegrityChecker {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        directory: Arc<dyn ClusterActorDirectory>,
        release: Release,
    ) -> Self {
        Self {
            gateway,
            directory,
            release,
        }
    }

    /// Compare catalog and pod addresses once, restarting mismatched servers.
    ///
    /// Returns the names of the restarted servers. A server missing from the
    /// catalog counts as a mismatch.
    pub async fn check(&self, ctx: &ClusterContext) -> Result<Vec<String>, RecoveryError> {
        info!("Checking node integrity");

        let catalog = self.gateway.list_catalog_nodes(ctx).await?;
        let servers = self
            .directory
            .list_by_selector(&self.release.server_selector())
            .await?;

        let mut restarted = Vec::new();
        for server in servers {
            let registered = catalog.get(&server.name);
            if registered == server.address.as_ref() {
                continue;
            }

            info!(
                server = %server.name,
                catalog_address = registered.map(String::as_str).unwrap_or("<absent>"),
                pod_address = server.address.as_deref().unwrap_or("<none>"),
                "Server is registered with a stale address, restarting"
            );
            self.directory
                .delete_by_selector(&self.release.pod_selector(&server.name))
                .await?;
            restarted.push(server.name);
        }

        Ok(restarted)
    }
}
