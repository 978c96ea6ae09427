//! Names and selectors derived from the Consul release full name.

use crate::directory::LabelSelector;

/// Label carrying a StatefulSet pod's own name.
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Label marking pods that must restart after a restore.
pub const RESTORE_POLICY_LABEL: &str = "restore-policy";

/// Container running the Consul agent inside server pods.
pub const CONSUL_CONTAINER: &str = "consul";

/// Key of the bootstrap token inside its secret.
pub const BOOTSTRAP_TOKEN_KEY: &str = "token";

/// Derives every resource name of one Consul release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    fullname: String,
}

impl Release {
    pub fn new(fullname: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
        }
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Selector for every server-role pod.
    pub fn server_selector(&self) -> LabelSelector {
        LabelSelector::new()
            .with("name", format!("{}-server", self.fullname))
            .with("component", "server")
    }

    /// Selector for exactly one pod.
    pub fn pod_selector(&self, pod_name: &str) -> LabelSelector {
        LabelSelector::new().with(POD_NAME_LABEL, pod_name)
    }

    /// Selector for pods that depend on the restored configuration.
    pub fn restart_required_selector(&self) -> LabelSelector {
        LabelSelector::new().with(RESTORE_POLICY_LABEL, "restart")
    }

    /// Secret holding the bootstrap ACL token.
    pub fn bootstrap_secret(&self) -> String {
        format!("{}-bootstrap-acl-token", self.fullname)
    }

    /// Service account whose token backs the auth methods.
    pub fn auth_method_service_account(&self) -> String {
        format!("{}-auth-method", self.fullname)
    }

    /// The primary and component auth-method binding names.
    pub fn auth_method_bindings(&self) -> [String; 2] {
        [
            format!("{}-k8s-auth-method", self.fullname),
            format!("{}-k8s-component-auth-method", self.fullname),
        ]
    }
}
