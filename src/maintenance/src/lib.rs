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

//! Client interface to the cluster maintenance service (CMS).
//!
//! The CMS is the authority on which nodes may be taken down concurrently
//! without violating the cluster's availability guarantees. Callers group
//! per-node lock requests into a *maintenance task*, poll the task until the
//! service reports individual locks as granted, and explicitly complete each
//! granted action once the node has been serviced. A task's maximum duration
//! doubles as a safety net: locks self-expire even if the caller crashes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

mod client;

pub use client::HttpCmsClient;

/// Every task UID generated by this tool starts with this prefix, which makes
/// stray tasks attributable when inspecting the maintenance service directly.
pub const TASK_UID_PREFIX: &str = "maintenance";

/// Generates a fresh, globally unique maintenance task UID.
pub fn generate_task_uid() -> String {
    format!("{}-{}", TASK_UID_PREFIX, uuid::Uuid::new_v4())
}

/// A database node as reported by the cluster topology query.
///
/// The numeric id is assigned by the cluster and is the only authoritative
/// identity; hosts can be recycled across node replacements. Nodes are never
/// mutated locally, only refreshed wholesale from a new topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: u32,
    pub host: String,
    /// The tenant that owns this node, or `None` for storage-role nodes.
    #[serde(default)]
    pub tenant: Option<String>,
}

impl Node {
    pub fn is_storage(&self) -> bool {
        self.tenant.is_none()
    }
}

/// A point-in-time snapshot of cluster topology.
///
/// Taken once at the start of an orchestration run and never refreshed
/// mid-run: restart decisions must stay internally consistent even while the
/// real cluster is changing underneath.
#[derive(Debug, Clone, Default)]
pub struct ClusterNodesInfo {
    pub all_nodes: Vec<Node>,
    pub tenant_to_node_ids: BTreeMap<String, BTreeSet<u32>>,
}

impl ClusterNodesInfo {
    pub fn from_nodes(all_nodes: Vec<Node>) -> ClusterNodesInfo {
        let mut tenant_to_node_ids: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        for node in &all_nodes {
            if let Some(tenant) = &node.tenant {
                tenant_to_node_ids
                    .entry(tenant.clone())
                    .or_default()
                    .insert(node.id);
            }
        }
        ClusterNodesInfo {
            all_nodes,
            tenant_to_node_ids,
        }
    }
}

/// The availability policy under which the maintenance service decides how
/// many nodes may be locked concurrently.
///
/// The service names these policies `no-planned-downtime-strict`,
/// `maximum-availability`, and `forced`; the short tokens below are what
/// this tool serializes and accepts, with the service's long names taken as
/// aliases on the command line and when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvailabilityMode {
    /// No planned downtime: the service grants locks only when every
    /// affected storage group and tenant keeps full redundancy.
    #[value(alias = "no-planned-downtime-strict")]
    #[serde(alias = "no-planned-downtime-strict")]
    Strict,
    /// Allow locks as long as quorums survive, trading some redundancy for
    /// faster rollout.
    #[value(alias = "maximum-availability")]
    #[serde(alias = "maximum-availability")]
    MaxAvailability,
    /// Grant every requested lock unconditionally. For broken clusters and
    /// people who know what they are doing.
    #[value(alias = "forced")]
    #[serde(alias = "forced")]
    Force,
}

impl fmt::Display for AvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AvailabilityMode::Strict => f.write_str("strict"),
            AvailabilityMode::MaxAvailability => f.write_str("max-availability"),
            AvailabilityMode::Force => f.write_str("force"),
        }
    }
}

/// The lifecycle state of one per-node lock request within a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ActionStatus {
    /// Not grantable under the current availability mode. `reason` is the
    /// service's human-readable explanation.
    Pending { reason: String },
    /// The lock is held and the node may be restarted. The service may
    /// reclaim the lock after `deadline` even without explicit completion.
    Performed { deadline: DateTime<Utc> },
}

/// One lock request and its current state, as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionGroupState {
    pub action_uid: String,
    pub node_id: u32,
    #[serde(flatten)]
    pub status: ActionStatus,
}

/// A maintenance task as reported by the service. Completed actions are
/// absent from subsequent reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub uid: String,
    /// Server-suggested minimum delay before the next read of this task.
    #[serde(default, with = "retry_after_seconds")]
    pub retry_after: Option<Duration>,
    pub action_group_states: Vec<ActionGroupState>,
}

impl MaintenanceTask {
    /// Actions whose lock is currently held.
    pub fn performed_actions(&self) -> impl Iterator<Item = &ActionGroupState> {
        self.action_group_states
            .iter()
            .filter(|a| matches!(a.status, ActionStatus::Performed { .. }))
    }

    pub fn pending_count(&self) -> usize {
        self.action_group_states
            .iter()
            .filter(|a| matches!(a.status, ActionStatus::Pending { .. }))
            .count()
    }
}

/// Parameters for creating a maintenance task over a set of target nodes.
#[derive(Debug, Clone)]
pub struct MaintenanceTaskParams {
    pub task_uid: String,
    pub availability_mode: AvailabilityMode,
    /// Maximum time any single lock in this task may be held before the
    /// service reclaims it.
    pub duration: Duration,
    pub nodes: Vec<Node>,
}

/// Operations the maintenance service exposes to this tool.
///
/// `create_maintenance_task` failures are fatal to a run: lock state would be
/// indeterminate otherwise. `complete_action` failures are not: the lock
/// self-expires after the task duration, so callers log and move on.
#[async_trait]
pub trait CmsClient: fmt::Debug + Send + Sync {
    /// Fetches the current cluster topology.
    async fn nodes(&self) -> Result<Vec<Node>, anyhow::Error>;

    /// Registers a new maintenance task holding one lock request per node.
    async fn create_maintenance_task(
        &self,
        params: MaintenanceTaskParams,
    ) -> Result<MaintenanceTask, anyhow::Error>;

    /// Reads the current state of an existing task. Callers must not poll
    /// more frequently than the returned `retry_after` hint.
    async fn refresh_maintenance_task(
        &self,
        task_uid: &str,
    ) -> Result<MaintenanceTask, anyhow::Error>;

    /// Releases a granted lock, acknowledging that maintenance on its node
    /// has finished (successfully or not).
    async fn complete_action(&self, action_uid: &str) -> Result<(), anyhow::Error>;
}

/// Requests maintenance locks for every node on one host and returns the
/// created task's UID.
///
/// The UID is the handle for everything that happens afterwards: inspecting
/// the task, resuming a restart against it, or completing its actions once
/// the host has been serviced. A host that matches no node in the topology
/// is an error rather than an empty task.
pub async fn request_host_maintenance(
    cms: &dyn CmsClient,
    host_fqdn: &str,
    availability_mode: AvailabilityMode,
    duration: Duration,
) -> Result<String, anyhow::Error> {
    let nodes: Vec<Node> = cms
        .nodes()
        .await
        .context("fetching cluster topology")?
        .into_iter()
        .filter(|node| node.host == host_fqdn)
        .collect();
    if nodes.is_empty() {
        bail!("no nodes found on host {host_fqdn}");
    }

    let params = MaintenanceTaskParams {
        task_uid: generate_task_uid(),
        availability_mode,
        duration,
        nodes,
    };
    info!(
        task_uid = %params.task_uid,
        host = host_fqdn,
        nodes = params.nodes.len(),
        "requesting host maintenance",
    );
    let task = cms
        .create_maintenance_task(params)
        .await
        .context("creating maintenance task")?;
    Ok(task.uid)
}

mod retry_after_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_secs()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_uid_shape() {
        let uid = generate_task_uid();
        assert!(uid.starts_with("maintenance-"));
        let rest = uid.trim_start_matches("maintenance-");
        assert!(uuid::Uuid::parse_str(rest).is_ok());
        assert_ne!(uid, generate_task_uid());
    }

    #[test]
    fn cluster_info_builds_tenant_mapping() {
        let info = ClusterNodesInfo::from_nodes(vec![
            Node {
                id: 1,
                host: "a.db.local".into(),
                tenant: Some("alpha".into()),
            },
            Node {
                id: 2,
                host: "b.db.local".into(),
                tenant: Some("alpha".into()),
            },
            Node {
                id: 3,
                host: "c.db.local".into(),
                tenant: None,
            },
        ]);
        assert_eq!(
            info.tenant_to_node_ids["alpha"],
            BTreeSet::from([1, 2])
        );
        assert!(!info.tenant_to_node_ids.contains_key("c.db.local"));
        assert!(info.all_nodes[2].is_storage());
    }

    #[test]
    fn action_status_wire_shape() {
        let action: ActionGroupState = serde_json::from_value(serde_json::json!({
            "action_uid": "act-7",
            "node_id": 7,
            "state": "pending",
            "reason": "would break quorum",
        }))
        .unwrap();
        assert_eq!(
            action.status,
            ActionStatus::Pending {
                reason: "would break quorum".into()
            }
        );

        let json = serde_json::to_value(&ActionGroupState {
            action_uid: "act-8".into(),
            node_id: 8,
            status: ActionStatus::Performed {
                deadline: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            },
        })
        .unwrap();
        assert_eq!(json["state"], "performed");
        assert_eq!(json["node_id"], 8);
    }

    #[test]
    fn availability_mode_accepts_long_policy_names() {
        use clap::ValueEnum;

        assert_eq!(
            AvailabilityMode::from_str("no-planned-downtime-strict", false),
            Ok(AvailabilityMode::Strict)
        );
        assert_eq!(
            AvailabilityMode::from_str("maximum-availability", false),
            Ok(AvailabilityMode::MaxAvailability)
        );
        assert_eq!(
            AvailabilityMode::from_str("forced", false),
            Ok(AvailabilityMode::Force)
        );

        let mode: AvailabilityMode =
            serde_json::from_value(serde_json::json!("maximum-availability")).unwrap();
        assert_eq!(mode, AvailabilityMode::MaxAvailability);
        // The short token stays the serialized form.
        assert_eq!(
            serde_json::to_value(AvailabilityMode::MaxAvailability).unwrap(),
            "max-availability"
        );
    }

    #[derive(Debug, Default)]
    struct RecordingCms {
        nodes: Vec<Node>,
        created: std::sync::Mutex<Vec<MaintenanceTaskParams>>,
    }

    #[async_trait]
    impl CmsClient for RecordingCms {
        async fn nodes(&self) -> Result<Vec<Node>, anyhow::Error> {
            Ok(self.nodes.clone())
        }

        async fn create_maintenance_task(
            &self,
            params: MaintenanceTaskParams,
        ) -> Result<MaintenanceTask, anyhow::Error> {
            let task = MaintenanceTask {
                uid: params.task_uid.clone(),
                retry_after: None,
                action_group_states: vec![],
            };
            self.created.lock().unwrap().push(params);
            Ok(task)
        }

        async fn refresh_maintenance_task(
            &self,
            _task_uid: &str,
        ) -> Result<MaintenanceTask, anyhow::Error> {
            unimplemented!()
        }

        async fn complete_action(&self, _action_uid: &str) -> Result<(), anyhow::Error> {
            unimplemented!()
        }
    }

    fn host_node(id: u32, host: &str, tenant: Option<&str>) -> Node {
        Node {
            id,
            host: host.into(),
            tenant: tenant.map(|t| t.into()),
        }
    }

    #[tokio::test]
    async fn host_maintenance_covers_every_node_on_the_host() {
        let cms = RecordingCms {
            nodes: vec![
                host_node(1, "a.db.local", Some("alpha")),
                host_node(2, "a.db.local", None),
                host_node(3, "b.db.local", None),
            ],
            ..Default::default()
        };

        let uid = request_host_maintenance(
            &cms,
            "a.db.local",
            AvailabilityMode::Strict,
            Duration::from_secs(600),
        )
        .await
        .unwrap();

        assert!(uid.starts_with("maintenance-"));
        let created = cms.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].task_uid, uid);
        assert_eq!(created[0].duration, Duration::from_secs(600));
        let ids: Vec<u32> = created[0].nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn host_maintenance_rejects_unknown_hosts() {
        let cms = RecordingCms {
            nodes: vec![host_node(1, "a.db.local", None)],
            ..Default::default()
        };

        let err = request_host_maintenance(
            &cms,
            "z.db.local",
            AvailabilityMode::Strict,
            Duration::from_secs(600),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("no nodes found on host"));
        assert!(cms.created.lock().unwrap().is_empty());
    }

    #[test]
    fn retry_after_roundtrips_as_seconds() {
        let task = MaintenanceTask {
            uid: "maintenance-x".into(),
            retry_after: Some(Duration::from_secs(30)),
            action_group_states: vec![],
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["retry_after"], 30);
        let back: MaintenanceTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
