//! consul-backup - Consul snapshot backup and restore
//!
//! Runs inside the backup daemon pod next to a Consul release. Connection
//! settings come from the environment; see `config`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use consul_backup_daemon::backup::{BackupRequest, BackupWorkflow};
use consul_backup_daemon::config::{self, Config};
use consul_backup_daemon::gateway::HttpClusterGateway;
use consul_backup_daemon::kube_directory::KubeActorDirectory;
use consul_backup_daemon::post_restore::PostRestore;
use consul_backup_daemon::release::Release;
use consul_backup_daemon::restore::{RestoreRequest, RestoreWorkflow};
use consul_backup_daemon::{RecoveryFailure, RecoveryOutcome};

/// Consul snapshot backup, restore and ACL recovery.
#[derive(Debug, Parser)]
#[command(name = "consul-backup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture snapshots into a backup folder.
    Backup {
        /// Backup folder.
        folder: PathBuf,

        /// Comma-separated datacenters; every known datacenter if omitted.
        #[arg(short = 'd', long, value_delimiter = ',')]
        datacenters: Vec<String>,
    },

    /// Restore snapshots from a backup folder and recover ACL state.
    Restore {
        /// Backup folder.
        folder: PathBuf,

        /// Comma-separated datacenters; every datacenter in the folder if omitted.
        #[arg(short = 'd', long, value_delimiter = ',')]
        datacenters: Vec<String>,

        /// Restore snapshots without checking or recovering ACL state.
        #[arg(long, env = "CONSUL_SKIP_ACL_RECOVERY")]
        skip_acl_recovery: bool,
    },

    /// Wait for a leader and refresh auth methods after a volume restore.
    PostRestore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = config::log_level(|key| std::env::var(key).ok());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Configuration is invalid");
            std::process::exit(1);
        }
    };

    info!(
        consul_url = %config.consul_url,
        namespace = %config.namespace,
        fullname = %config.fullname,
        acl_enabled = config.acl_enabled,
        ca_file = ?config.ca_file,
        "Configuration loaded"
    );

    let gateway = Arc::new(HttpClusterGateway::new(
        &config.consul_url,
        config.ca_file.as_deref(),
    )?);
    let directory = Arc::new(KubeActorDirectory::connect(config.namespace.clone()).await?);
    let release = Release::new(config.fullname.clone());

    let result = match cli.command {
        Commands::Backup {
            folder,
            datacenters,
        } => {
            let workflow =
                BackupWorkflow::new(gateway, directory, release, config.acl_enabled);
            workflow
                .run(&BackupRequest {
                    folder,
                    datacenters,
                })
                .await
                .map(|summary| {
                    info!(
                        datacenters = ?summary.datacenters,
                        token_captured = summary.token_captured,
                        "Backup completed successfully"
                    );
                })
        }
        Commands::Restore {
            folder,
            datacenters,
            skip_acl_recovery,
        } => {
            let workflow = RestoreWorkflow::new(
                gateway,
                directory,
                release,
                config.acl_enabled,
                config.timings.clone(),
            );
            workflow
                .run(&RestoreRequest {
                    folder,
                    datacenters,
                    skip_acl_recovery,
                })
                .await
                .map(|summary| {
                    let recovered = matches!(summary.recovery, Some(RecoveryOutcome::Completed(_)));
                    info!(
                        datacenters = ?summary.datacenters,
                        acl_recovered = recovered,
                        "Restore completed successfully"
                    );
                })
        }
        Commands::PostRestore => {
            let post_restore = PostRestore::new(
                gateway,
                directory,
                release,
                config.acl_enabled,
                config.timings.clone(),
            );
            post_restore.run().await.map(|_| ())
        }
    };

    if let Err(failure) = result {
        report_failure(&failure);
        std::process::exit(1);
    }

    Ok(())
}

fn report_failure(failure: &RecoveryFailure) {
    error!(
        phase = %failure.phase,
        elapsed_secs = failure.elapsed.as_secs_f64(),
        error = %failure.source,
        "Command failed"
    );
}
