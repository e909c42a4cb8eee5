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

use anyhow::{bail, Context};
use async_trait::async_trait;
use dbops_maintenance::{ClusterNodesInfo, Node};
use openssh::{KnownHosts, Session};
use tracing::{debug, info};

use crate::filter::{select_nodes, DomainConstraint, FilterNodeParams};
use crate::restarters::Restarter;

pub const DEFAULT_STORAGE_UNIT: &str = "database-storage.service";
pub const DEFAULT_TENANT_UNIT: &str = "database-tenant.service";

/// Restarts nodes on bare hosts by restarting the database's systemd unit
/// over SSH.
///
/// Authentication rides on the ambient SSH configuration (agent, config
/// file); only the login user is overridable.
#[derive(Debug)]
pub struct BaremetalRestarter {
    ssh_user: Option<String>,
    systemd_unit: String,
    domain: DomainConstraint,
}

impl BaremetalRestarter {
    pub fn storage(ssh_user: Option<String>, systemd_unit: Option<String>) -> BaremetalRestarter {
        BaremetalRestarter {
            ssh_user,
            systemd_unit: systemd_unit.unwrap_or_else(|| DEFAULT_STORAGE_UNIT.to_owned()),
            domain: DomainConstraint::Storage,
        }
    }

    pub fn tenant(ssh_user: Option<String>, systemd_unit: Option<String>) -> BaremetalRestarter {
        BaremetalRestarter {
            ssh_user,
            systemd_unit: systemd_unit.unwrap_or_else(|| DEFAULT_TENANT_UNIT.to_owned()),
            domain: DomainConstraint::Tenant,
        }
    }

    fn destination(&self, node: &Node) -> String {
        match &self.ssh_user {
            Some(user) => format!("ssh://{user}@{}", node.host),
            None => format!("ssh://{}", node.host),
        }
    }
}

#[async_trait]
impl Restarter for BaremetalRestarter {
    async fn candidate_nodes(
        &self,
        spec: &FilterNodeParams,
        cluster: &ClusterNodesInfo,
    ) -> Result<Vec<Node>, anyhow::Error> {
        let selected = select_nodes(spec, cluster, self.domain);
        debug!(
            nodes = ?selected.iter().map(|n| n.id).collect::<Vec<_>>(),
            "baremetal restarter selected nodes",
        );
        Ok(selected)
    }

    async fn restart_node(&self, node: &Node) -> Result<(), anyhow::Error> {
        let destination = self.destination(node);
        let session = Session::connect_mux(&destination, KnownHosts::Accept)
            .await
            .with_context(|| format!("connecting to {destination}"))?;

        info!(
            node_id = node.id,
            host = %node.host,
            unit = %self.systemd_unit,
            "restarting systemd unit",
        );
        let status = session
            .command("sudo")
            .arg("systemctl")
            .arg("restart")
            .arg(&self.systemd_unit)
            .status()
            .await
            .with_context(|| format!("running systemctl restart on {}", node.host))?;

        let closed = session.close().await;
        if !status.success() {
            bail!(
                "systemctl restart {} on {} exited with {status}",
                self.systemd_unit,
                node.host
            );
        }
        // A restart that succeeded but left a broken control connection is
        // still a success; just surface the close failure.
        if let Err(err) = closed {
            debug!(host = %node.host, "failed to close ssh session: {err}");
        }
        Ok(())
    }
}
