//! Configuration for the backup daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};

/// CA bundle mounted when the cluster serves TLS with its own CA.
pub const CA_CERT_PATH: &str = "/consul/tls/ca/ca.crt";

/// Fallback certificate mounted by older chart versions.
pub const TLS_CRT_PATH: &str = "/consul/tls/ca/tls.crt";

/// Backup daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Consul HTTP API (scheme://host:port).
    pub consul_url: String,

    /// Kubernetes namespace the Consul release lives in.
    pub namespace: String,

    /// Helm full name of the Consul release; prefixes every derived name.
    pub fullname: String,

    /// Whether the cluster runs with ACLs enabled.
    pub acl_enabled: bool,

    /// CA bundle used to verify the Consul API, if any.
    pub ca_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Recovery poll intervals and budgets.
    pub timings: RecoveryTimings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (Some(host), Some(port)) = (non_empty("CONSUL_HOST"), non_empty("CONSUL_PORT")) else {
            bail!("Consul service name or port isn't specified (CONSUL_HOST, CONSUL_PORT)");
        };
        let port: u16 = port.trim().parse()?;

        let scheme = non_empty("CONSUL_SCHEME").unwrap_or_else(|| "http".to_string());
        if scheme != "http" && scheme != "https" {
            bail!("unsupported CONSUL_SCHEME '{}'", scheme);
        }

        let Some(namespace) = non_empty("CONSUL_NAMESPACE") else {
            bail!("Consul namespace isn't specified (CONSUL_NAMESPACE)");
        };

        let fullname = non_empty("CONSUL_FULLNAME").unwrap_or_else(|| "consul".to_string());

        let acl_enabled = non_empty("CONSUL_HTTP_TOKEN").is_some();

        let log_level = log_level(&lookup).to_string();

        Ok(Self {
            consul_url: format!("{}://{}:{}", scheme, host.trim(), port),
            namespace,
            fullname,
            acl_enabled,
            ca_file: discover_ca_file(Path::new(CA_CERT_PATH), Path::new(TLS_CRT_PATH)),
            log_level,
            timings: RecoveryTimings::default(),
        })
    }
}

/// Log level selected by `CONSUL_BACKUP_DAEMON_DEBUG`.
///
/// Readable before the rest of the configuration is validated.
pub fn log_level<F>(lookup: F) -> &'static str
where
    F: Fn(&str) -> Option<String>,
{
    if lookup("CONSUL_BACKUP_DAEMON_DEBUG").is_some() {
        "debug"
    } else {
        "info"
    }
}

/// Pick the first CA bundle that exists.
pub fn discover_ca_file(primary: &Path, fallback: &Path) -> Option<PathBuf> {
    [primary, fallback]
        .into_iter()
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
}

/// Poll intervals and budgets for each recovery phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryTimings {
    /// Pause between observations in every polling phase.
    pub poll_interval: Duration,

    /// Budget for each leader wait.
    pub leader_timeout: Duration,

    /// Budget for obtaining the ACL token list.
    pub token_list_timeout: Duration,

    /// Budget for creating one server token.
    pub token_create_timeout: Duration,

    /// Budget for publishing one auth method.
    pub auth_method_timeout: Duration,

    /// Attempts of the auth-method refresh in `post-restore`.
    pub post_restore_attempts: u32,

    /// Pause between `post-restore` attempts.
    pub post_restore_pause: Duration,
}

impl Default for RecoveryTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            leader_timeout: Duration::from_secs(120),
            token_list_timeout: Duration::from_secs(180),
            token_create_timeout: Duration::from_secs(60),
            auth_method_timeout: Duration::from_secs(60),
            post_restore_attempts: 9,
            post_restore_pause: Duration::from_secs(10),
        }
    }
}
