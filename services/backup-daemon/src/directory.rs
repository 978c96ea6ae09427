//! Platform actor directory interface.
//!
//! The recovery phases reach the pod backend only through this trait:
//! - Listing and deleting pods by an explicit label selector
//! - Running a command inside a pod container
//! - Reading and patching named secrets

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Secret type carrying a service account's API token.
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Pod backend errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Kubernetes API error.
    #[error("kubernetes error during {operation}: {source}")]
    Kube {
        operation: &'static str,
        #[source]
        source: kube::Error,
    },

    /// Any other backend failure.
    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl DirectoryError {
    /// Create a backend error.
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }
}

/// An equality-based label selector.
///
/// Only actors carrying every listed label with the listed value match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    /// Create an empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required label.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Whether the selector has no requirements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over required labels.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Check whether a label set satisfies the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", pairs.join(","))
    }
}

/// A platform-managed actor (pod).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Stable identity (pod name).
    pub name: String,

    /// Current network address, if one is assigned.
    pub address: Option<String>,

    /// Labels attached to the actor.
    pub labels: BTreeMap<String, String>,
}

/// Output of a command run inside an actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command wrote anything to its error stream.
    pub fn has_errors(&self) -> bool {
        !self.stderr.trim().is_empty()
    }
}

/// A named secret with decoded key-value data.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KeyValueSecret {
    /// Secret type, e.g. `kubernetes.io/service-account-token`.
    pub secret_type: Option<String>,

    /// Decoded payload.
    pub data: BTreeMap<String, Vec<u8>>,
}

impl KeyValueSecret {
    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Whether this secret holds a service account token.
    pub fn is_service_account_token(&self) -> bool {
        self.secret_type.as_deref() == Some(SERVICE_ACCOUNT_TOKEN_TYPE)
    }
}

impl fmt::Debug for KeyValueSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueSecret")
            .field("secret_type", &self.secret_type)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Pod backend interface.
#[async_trait]
pub trait ClusterActorDirectory: Send + Sync {
    /// List actors matching a selector.
    async fn list_by_selector(&self, selector: &LabelSelector)
        -> Result<Vec<Actor>, DirectoryError>;

    /// Delete every actor matching a selector. Returns how many were deleted.
    async fn delete_by_selector(&self, selector: &LabelSelector) -> Result<usize, DirectoryError>;

    /// Run a shell command inside a container of an actor.
    async fn exec(
        &self,
        actor: &str,
        container: &str,
        command: &str,
    ) -> Result<ExecOutput, DirectoryError>;

    /// Read a secret. Returns `None` if it does not exist.
    async fn get_secret(&self, name: &str) -> Result<Option<KeyValueSecret>, DirectoryError>;

    /// Merge the given data into a secret.
    async fn patch_secret(&self, name: &str, secret: &KeyValueSecret)
        -> Result<(), DirectoryError>;

    /// Names of the secrets a service account references.
    ///
    /// Returns an empty list when the service account does not exist.
    async fn service_account_secret_names(&self, name: &str)
        -> Result<Vec<String>, DirectoryError>;
}
