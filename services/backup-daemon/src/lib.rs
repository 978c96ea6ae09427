//! Consul backup daemon library
//!
//! Captures and restores Consul snapshots for a release running on
//! Kubernetes, and brings the cluster's ACL state back in line with the
//! restored data.
//!
//! ## Architecture
//!
//! ```text
//! RestoreWorkflow
//! ├── snapshot upload        (ClusterGateway)
//! ├── bootstrap secret       (ClusterActorDirectory)
//! └── RecoveryOrchestrator
//!     ├── LeaderWatcher
//!     ├── TokenReconciler
//!     ├── AuthMethodSynchronizer
//!     └── NodeIntegrityChecker
//! ```
//!
//! The Consul HTTP API sits behind [`gateway::ClusterGateway`] and the pod
//! backend behind [`directory::ClusterActorDirectory`], so every phase runs
//! against in-memory fakes in tests.
//!
//! ## Modules
//!
//! - `gateway`: Consul HTTP API client and the bearer token context
//! - `directory`, `kube_directory`: pods, exec and secrets
//! - `orchestrator`: post-restore recovery phases
//! - `backup`, `restore`, `post_restore`: the command workflows

pub mod auth_method;
pub mod backup;
pub mod bootstrap;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod integrity;
pub mod kube_directory;
pub mod leader;
pub mod orchestrator;
pub mod post_restore;
pub mod release;
pub mod restore;
pub mod tokens;

pub use error::{Phase, RecoveryError, RecoveryFailure};
pub use orchestrator::{RecoveryOrchestrator, RecoveryOutcome, RecoveryReport};
