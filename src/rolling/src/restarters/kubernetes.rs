// Copyright the dbops authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use dbops_maintenance::{ClusterNodesInfo, Node};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::wait::{await_condition, conditions, Condition};
use kube::{Client, Config, ResourceExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::filter::{select_nodes, DomainConstraint, FilterNodeParams};
use crate::restarters::Restarter;

const STORAGE_LABEL_SELECTOR: &str = "app.kubernetes.io/instance=storage";
const TENANT_LABEL_SELECTOR: &str = "app.kubernetes.io/instance=database";

/// How long to wait for a replacement pod to become ready before declaring
/// the restart attempt failed.
const POD_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Restarts nodes by deleting their backing pod and waiting for the
/// replacement to become ready.
///
/// The Kubernetes client is constructed lazily on first use and then shared
/// by all concurrent restarts within a run.
pub struct KubernetesRestarter {
    kubeconfig: Option<PathBuf>,
    namespace: String,
    domain: DomainConstraint,
    label_selector: &'static str,
    pod_api: OnceCell<Api<Pod>>,
}

impl fmt::Debug for KubernetesRestarter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KubernetesRestarter")
            .field("kubeconfig", &self.kubeconfig)
            .field("namespace", &self.namespace)
            .field("domain", &self.domain)
            .field("label_selector", &self.label_selector)
            .finish_non_exhaustive()
    }
}

impl KubernetesRestarter {
    pub fn storage(kubeconfig: Option<PathBuf>, namespace: String) -> KubernetesRestarter {
        KubernetesRestarter {
            kubeconfig,
            namespace,
            domain: DomainConstraint::Storage,
            label_selector: STORAGE_LABEL_SELECTOR,
            pod_api: OnceCell::new(),
        }
    }

    pub fn tenant(kubeconfig: Option<PathBuf>, namespace: String) -> KubernetesRestarter {
        KubernetesRestarter {
            kubeconfig,
            namespace,
            domain: DomainConstraint::Tenant,
            label_selector: TENANT_LABEL_SELECTOR,
            pod_api: OnceCell::new(),
        }
    }

    async fn pod_api(&self) -> Result<&Api<Pod>, anyhow::Error> {
        self.pod_api
            .get_or_try_init(|| async {
                let config = match &self.kubeconfig {
                    Some(path) => {
                        let kubeconfig = Kubeconfig::read_from(path).with_context(|| {
                            format!("reading kubeconfig from {}", path.display())
                        })?;
                        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                            .await
                            .context("loading kubeconfig")?
                    }
                    None => Config::infer().await.context("inferring Kubernetes config")?,
                };
                let client = Client::try_from(config).context("building Kubernetes client")?;
                Ok(Api::namespaced(client, &self.namespace))
            })
            .await
    }

    /// The pod backing a node is named after the first label of the node's
    /// host FQDN.
    fn pod_name(node: &Node) -> &str {
        node.host.split('.').next().unwrap_or(&node.host)
    }
}

fn is_pod_ready() -> impl Condition<Pod> {
    |obj: Option<&Pod>| {
        obj.and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl Restarter for KubernetesRestarter {
    async fn candidate_nodes(
        &self,
        spec: &FilterNodeParams,
        cluster: &ClusterNodesInfo,
    ) -> Result<Vec<Node>, anyhow::Error> {
        let pod_api = self.pod_api().await?;

        // Only nodes with a backing pod under our label selector are
        // restartable by this variant; anything else in the topology is
        // somebody else's deployment.
        let pods = pod_api
            .list(&ListParams::default().labels(self.label_selector))
            .await
            .with_context(|| {
                format!(
                    "listing pods in namespace {} matching {}",
                    self.namespace, self.label_selector
                )
            })?;
        let pod_names: BTreeSet<String> = pods.into_iter().map(|pod| pod.name_any()).collect();

        let selected: Vec<Node> = select_nodes(spec, cluster, self.domain)
            .into_iter()
            .filter(|node| pod_names.contains(Self::pod_name(node)))
            .collect();
        debug!(
            namespace = %self.namespace,
            nodes = ?selected.iter().map(|n| n.id).collect::<Vec<_>>(),
            "kubernetes restarter selected nodes",
        );
        Ok(selected)
    }

    async fn restart_node(&self, node: &Node) -> Result<(), anyhow::Error> {
        let pod_api = self.pod_api().await?;
        let pod_name = Self::pod_name(node);

        let pod = pod_api
            .get(pod_name)
            .await
            .with_context(|| format!("no backing pod {pod_name} for node {}", node.id))?;
        let uid = pod
            .uid()
            .ok_or_else(|| anyhow!("pod {pod_name} has no uid"))?;

        info!(node_id = node.id, pod_name, "deleting pod");
        pod_api
            .delete(pod_name, &DeleteParams::default())
            .await
            .with_context(|| format!("deleting pod {pod_name}"))?;

        // Wait for the old pod to actually go away first; the replacement is
        // created under the same name and a ready check against the dying
        // pod would succeed spuriously.
        tokio::time::timeout(
            POD_READY_TIMEOUT,
            await_condition(pod_api.clone(), pod_name, conditions::is_deleted(&uid)),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for pod {pod_name} to terminate"))?
        .with_context(|| format!("watching pod {pod_name} terminate"))?;

        tokio::time::timeout(
            POD_READY_TIMEOUT,
            await_condition(pod_api.clone(), pod_name, is_pod_ready()),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for pod {pod_name} to become ready"))?
        .with_context(|| format!("watching pod {pod_name} become ready"))?;

        info!(node_id = node.id, pod_name, "pod is ready again");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_name_is_first_host_label() {
        let node = Node {
            id: 1,
            host: "storage-3.db.svc.cluster.local".into(),
            tenant: None,
        };
        assert_eq!(KubernetesRestarter::pod_name(&node), "storage-3");

        let bare = Node {
            id: 2,
            host: "storage-4".into(),
            tenant: None,
        };
        assert_eq!(KubernetesRestarter::pod_name(&bare), "storage-4");
    }

    #[test]
    fn ready_condition_requires_ready_status() {
        use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

        let mut pod = Pod::default();
        assert!(!is_pod_ready().matches_object(Some(&pod)));

        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "False".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(!is_pod_ready().matches_object(Some(&pod)));

        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_pod_ready().matches_object(Some(&pod)));
    }
}
