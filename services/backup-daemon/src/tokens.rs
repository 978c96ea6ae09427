//! Server agent token reconciliation.
//!
//! After a restore the servers' agent tokens may no longer exist in the
//! restored ACL state. For every server pod the reconciler:
//! - Looks up a token whose description is derived from the pod IP
//! - Creates one with the `agent-token` policy if none matches
//! - Installs it on the agent and makes the agent leave, so its supervisor
//!   restarts it and it rejoins with the new token
//!
//! Matching is by exact description. A node that gets a new IP after
//! replacement will not find its old token, and a new node that inherits a
//! previously used IP will pick up the old node's token.

use std::sync::Arc;

use consul_reconcile::{BoundedPoll, PollStep};
use tracing::{error, info, warn};

use crate::config::RecoveryTimings;
use crate::directory::{Actor, ClusterActorDirectory};
use crate::error::RecoveryError;
use crate::gateway::{AclToken, ClusterContext, ClusterGateway, GatewayError, NewAclToken};
use crate::release::{Release, CONSUL_CONTAINER};

/// Description of the agent token belonging to a server at `address`.
pub fn server_token_description(address: &str) -> String {
    format!("Server Token for {}", address)
}

/// Find the token with exactly this description.
///
/// An empty description never matches. Tokens listed without a secret
/// cannot be installed on an agent and are treated as absent.
pub fn find_token<'a>(tokens: &'a [AclToken], description: &str) -> Option<&'a AclToken> {
    if description.is_empty() {
        return None;
    }
    tokens
        .iter()
        .find(|t| t.description == description && !t.secret_id.is_empty())
}

/// The token chosen for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAssignment {
    pub node: String,
    pub description: String,
    pub secret_id: String,
    pub created: bool,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenReconcileReport {
    /// Tokens found by description.
    pub reused: usize,

    /// Tokens created in this pass.
    pub created: usize,

    /// Servers that accepted their token.
    pub propagated: Vec<String>,

    /// Servers whose propagation failed this pass.
    pub failed: Vec<String>,

    /// Servers without an address yet.
    pub skipped: Vec<String>,
}

/// Ensures every server has a live agent token.
pub struct TokenReconciler {
    gateway: Arc<dyn ClusterGateway>,
    directory: Arc<dyn ClusterActorDirectory>,
    release: Release,
    timings: RecoveryTimings,
}

impl TokenReconciler {
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

    /// Run one reconciliation pass.
    pub async fn reconcile(
        &self,
        ctx: &ClusterContext,
    ) -> Result<TokenReconcileReport, RecoveryError> {
        info!("The update of Consul server tokens is started");

        let Some(bootstrap_token) = ctx.token() else {
            return Err(RecoveryError::inconsistency(
                "server token reconciliation requires the bootstrap ACL token",
            ));
        };

        let tokens = self.fetch_tokens(ctx).await?;

        let servers = self
            .directory
            .list_by_selector(&self.release.server_selector())
            .await?;

        let mut report = TokenReconcileReport::default();
        let assignments = self.assign_tokens(ctx, tokens, &servers, &mut report).await?;

        for assignment in &assignments {
            if self.propagate(bootstrap_token, assignment).await {
                report.propagated.push(assignment.node.clone());
            } else {
                report.failed.push(assignment.node.clone());
            }
        }

        info!(
            reused = report.reused,
            created = report.created,
            propagated = report.propagated.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Server token reconciliation finished"
        );
        Ok(report)
    }

    /// Poll the token list until the cluster answers.
    async fn fetch_tokens(&self, ctx: &ClusterContext) -> Result<Vec<AclToken>, RecoveryError> {
        let poll = BoundedPoll::after_interval(
            self.timings.poll_interval,
            self.timings.token_list_timeout,
        );

        let tokens = poll
            .run("list ACL tokens", |_| async move {
                match self.gateway.list_acl_tokens(ctx).await {
                    Ok(tokens) => PollStep::Ready(tokens),
                    Err(e) => PollStep::<_, GatewayError>::Retry(e.to_string()),
                }
            })
            .await?;
        Ok(tokens)
    }

    /// Pick or create a token for every server, in selector order.
    async fn assign_tokens(
        &self,
        ctx: &ClusterContext,
        mut tokens: Vec<AclToken>,
        servers: &[Actor],
        report: &mut TokenReconcileReport,
    ) -> Result<Vec<TokenAssignment>, RecoveryError> {
        let mut assignments = Vec::with_capacity(servers.len());

        for server in servers {
            let Some(address) = server.address.as_deref() else {
                warn!(server = %server.name, "Server has no address yet, skipping token update");
                report.skipped.push(server.name.clone());
                continue;
            };

            let description = server_token_description(address);
            let (secret_id, created) = match find_token(&tokens, &description) {
                Some(token) => {
                    info!(description = %description, "Token is found");
                    report.reused += 1;
                    (token.secret_id.clone(), false)
                }
                None => {
                    info!(description = %description, "Token is not found, creating new one");
                    let token = self.create_token(ctx, &description).await?;
                    report.created += 1;
                    let secret_id = token.secret_id.clone();
                    tokens.push(token);
                    (secret_id, true)
                }
            };

            assignments.push(TokenAssignment {
                node: server.name.clone(),
                description,
                secret_id,
                created,
            });
        }

        Ok(assignments)
    }

    /// Create one agent token, retrying until the per-token budget is spent.
    async fn create_token(
        &self,
        ctx: &ClusterContext,
        description: &str,
    ) -> Result<AclToken, RecoveryError> {
        let request = NewAclToken::agent(description);
        let poll = BoundedPoll::immediate(
            self.timings.poll_interval,
            self.timings.token_create_timeout,
        );
        let request = &request;

        let token = poll
            .run("create server token", |_| async move {
                match self.gateway.create_acl_token(ctx, request).await {
                    Ok(token) => PollStep::Ready(token),
                    Err(e) => PollStep::<_, GatewayError>::Retry(e.to_string()),
                }
            })
            .await?;

        info!(description = %description, "Token is created");
        Ok(token)
    }

    /// Install the token on the agent, then make the agent leave.
    ///
    /// Returns false if either command failed; the node is then left for the
    /// next pass.
    async fn propagate(&self, bootstrap_token: &str, assignment: &TokenAssignment) -> bool {
        let node = assignment.node.as_str();

        let set_token = format!(
            "consul acl set-agent-token -token {} agent {}",
            bootstrap_token, assignment.secret_id
        );
        if !self.run_in_server(node, "set agent token", &set_token).await {
            return false;
        }

        let leave = format!("consul leave -token {}", bootstrap_token);
        if !self.run_in_server(node, "leave cluster", &leave).await {
            return false;
        }

        info!(server = %node, "Token for server is updated");
        true
    }

    async fn run_in_server(&self, node: &str, step: &str, command: &str) -> bool {
        match self.directory.exec(node, CONSUL_CONTAINER, command).await {
            Ok(output) if output.has_errors() => {
                error!(
                    server = %node,
                    step,
                    stdout = %output.stdout,
                    stderr = %output.stderr,
                    "Command reported errors"
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                error!(server = %node, step, error = %e, "Command could not be executed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn token(description: &str, secret_id: &str) -> AclToken {
        AclToken {
            accessor_id: format!("acc-{secret_id}"),
            secret_id: secret_id.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn test_description_format() {
        assert_eq!(
            server_token_description("10.0.0.1"),
            "Server Token for 10.0.0.1"
        );
    }

    #[test]
    fn test_find_token_exact_match() {
        let tokens = vec![
            token("Server Token for 10.0.0.1 ", "trailing-space"),
            token("server token for 10.0.0.1", "lowercase"),
            token("Server Token for 10.0.0.1", "exact"),
        ];

        let found = find_token(&tokens, "Server Token for 10.0.0.1").unwrap();
        assert_eq!(found.secret_id, "exact");
    }

    #[test]
    fn test_empty_description_never_matches() {
        let tokens = vec![token("", "anonymous")];
        assert!(find_token(&tokens, "").is_none());
    }

    #[test]
    fn test_token_without_secret_is_absent() {
        let tokens = vec![
            token("Server Token for 10.0.0.1", ""),
            token("Server Token for 10.0.0.1", "second"),
        ];
        let found = find_token(&tokens, "Server Token for 10.0.0.1").unwrap();
        assert_eq!(found.secret_id, "second");

        assert!(find_token(&tokens[..1], "Server Token for 10.0.0.1").is_none());
    }

    proptest! {
        #[test]
        fn prop_whitespace_variants_do_not_match(
            octet in 0u8..=255,
            pad in prop::sample::select(vec![" ", "\t", "\n", "  "]),
            leading in any::<bool>(),
        ) {
            let description = server_token_description(&format!("10.0.0.{octet}"));
            let variant = if leading {
                format!("{pad}{description}")
            } else {
                format!("{description}{pad}")
            };
            let tokens = vec![token(&variant, "padded")];

            prop_assert!(find_token(&tokens, &description).is_none());
        }
    }
}
