//! Kubernetes implementation of the actor directory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::ByteString;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::directory::{
    Actor, ClusterActorDirectory, DirectoryError, ExecOutput, KeyValueSecret, LabelSelector,
};

/// Grace period granted to deleted pods.
const DELETE_GRACE_PERIOD_SECS: u32 = 10;

/// Actor directory backed by the Kubernetes API of one namespace.
#[derive(Clone)]
pub struct KubeActorDirectory {
    client: Client,
    namespace: String,
}

impl KubeActorDirectory {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using in-cluster config, falling back to the local kubeconfig.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, DirectoryError> {
        let client = Client::try_default()
            .await
            .map_err(|source| DirectoryError::Kube {
                operation: "connect",
                source,
            })?;
        Ok(Self::new(client, namespace))
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn service_accounts(&self) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn kube_err(operation: &'static str) -> impl FnOnce(kube::Error) -> DirectoryError {
    move |source| DirectoryError::Kube { operation, source }
}

fn to_actor(pod: Pod) -> Actor {
    Actor {
        name: pod.metadata.name.unwrap_or_default(),
        address: pod.status.and_then(|s| s.pod_ip).filter(|ip| !ip.is_empty()),
        labels: pod.metadata.labels.unwrap_or_default(),
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut out).await?;
    }
    Ok(out)
}

#[async_trait]
impl ClusterActorDirectory for KubeActorDirectory {
    async fn list_by_selector(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<Actor>, DirectoryError> {
        let params = ListParams::default().labels(&selector.to_string());
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(kube_err("list pods"))?;
        Ok(pods.items.into_iter().map(to_actor).collect())
    }

    async fn delete_by_selector(&self, selector: &LabelSelector) -> Result<usize, DirectoryError> {
        if selector.is_empty() {
            return Err(DirectoryError::backend(
                "delete pods",
                "refusing to delete with an empty selector",
            ));
        }

        let pods = self.pods();
        let params = DeleteParams {
            grace_period_seconds: Some(DELETE_GRACE_PERIOD_SECS),
            ..DeleteParams::default()
        };

        let actors = self.list_by_selector(selector).await?;
        for actor in &actors {
            info!(pod = %actor.name, selector = %selector, "Deleting pod");
            match pods.delete(&actor.name, &params).await {
                Ok(_) => {}
                // Already gone between list and delete.
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!(pod = %actor.name, "Pod already deleted");
                }
                Err(e) => return Err(kube_err("delete pod")(e)),
            }
        }
        Ok(actors.len())
    }

    async fn exec(
        &self,
        actor: &str,
        container: &str,
        command: &str,
    ) -> Result<ExecOutput, DirectoryError> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods()
            .exec(actor, vec!["/bin/sh", "-c", command], &params)
            .await
            .map_err(kube_err("exec"))?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(drain(stdout_reader), drain(stderr_reader));
        let stdout = stdout.map_err(|e| DirectoryError::backend("exec", e.to_string()))?;
        let stderr = stderr.map_err(|e| DirectoryError::backend("exec", e.to_string()))?;

        attached
            .join()
            .await
            .map_err(|e| DirectoryError::backend("exec", e.to_string()))?;

        Ok(ExecOutput {
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
        })
    }

    async fn get_secret(&self, name: &str) -> Result<Option<KeyValueSecret>, DirectoryError> {
        let secret = self
            .secrets()
            .get_opt(name)
            .await
            .map_err(kube_err("read secret"))?;

        Ok(secret.map(|s| KeyValueSecret {
            secret_type: s.type_,
            data: s
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect(),
        }))
    }

    async fn patch_secret(
        &self,
        name: &str,
        secret: &KeyValueSecret,
    ) -> Result<(), DirectoryError> {
        let data: BTreeMap<String, ByteString> = secret
            .data
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.clone())))
            .collect();
        let patch = Secret {
            data: Some(data),
            ..Secret::default()
        };

        self.secrets()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(kube_err("patch secret"))?;
        Ok(())
    }

    async fn service_account_secret_names(
        &self,
        name: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        let account = self
            .service_accounts()
            .get_opt(name)
            .await
            .map_err(kube_err("read service account"))?;

        Ok(account
            .and_then(|a| a.secrets)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_pod_without_ip_has_no_address() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("consul-server-0".to_string()),
                labels: Some([("component".to_string(), "server".to_string())].into()),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                pod_ip: Some(String::new()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        };

        let actor = to_actor(pod);
        assert_eq!(actor.name, "consul-server-0");
        assert_eq!(actor.address, None);
        assert_eq!(actor.labels.get("component").map(String::as_str), Some("server"));
    }
}
