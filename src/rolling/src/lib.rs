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

//! Rolling restart orchestration.
//!
//! One run drives a single maintenance task to completion: select target
//! nodes, register one lock request per node with the maintenance service,
//! then poll. Every lock reported as granted in the same poll forms a
//! *batch* the service has certified as safe to restart concurrently; the
//! run restarts the batch in parallel, releases each lock, and polls again
//! until no lock request remains. A node that keeps failing past its retry
//! budget is recorded and released, never allowed to stall the rest of the
//! cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use dbops_maintenance::{
    generate_task_uid, AvailabilityMode, ClusterNodesInfo, CmsClient, MaintenanceTaskParams, Node,
};
use futures::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod filter;
pub mod progress;
pub mod restarters;

use crate::filter::{FilterNodeParams, SelectionError};
use crate::progress::{BatchReport, NodeFailure, NoopPresenter, Presenter, Progress, RestartReport};
use crate::restarters::Restarter;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(3600);
pub const DEFAULT_RESTART_RETRY_NUMBER: usize = 3;

/// Knobs for one rolling restart run.
#[derive(Debug, Clone)]
pub struct RestartOptions {
    pub availability_mode: AvailabilityMode,
    /// Maximum duration any single lock may be held; also the safety net
    /// after which the service reclaims locks on its own.
    pub duration: Duration,
    /// Additional restart attempts per node after the first failure.
    pub restart_retry_number: usize,
    /// Resume an existing task instead of creating a new one.
    pub task_uid: Option<String>,
    /// Poll delay when the service does not suggest one.
    pub poll_interval: Duration,
}

impl Default for RestartOptions {
    fn default() -> RestartOptions {
        RestartOptions {
            availability_mode: AvailabilityMode::Strict,
            duration: DEFAULT_LOCK_DURATION,
            restart_retry_number: DEFAULT_RESTART_RETRY_NUMBER,
            task_uid: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How a rolling restart run can fail.
///
/// Nodes that merely exhausted their retry budget are not an error: they are
/// reported as data inside [`RestartReport`], and the caller decides the exit
/// status.
#[derive(Debug, thiserror::Error)]
pub enum RollingError {
    #[error("invalid node selection: {0}")]
    Selection(#[from] SelectionError),
    /// The run was interrupted; any locks still held were released on a
    /// best-effort basis before returning.
    #[error("rolling restart interrupted")]
    Interrupted,
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

struct NodeOutcome {
    action_uid: String,
    node: Node,
    /// Whether the lock release was acknowledged by the service.
    completed: bool,
    result: Result<(), anyhow::Error>,
}

/// Drives one rolling restart run. See the module docs for the lifecycle.
pub struct RollingRestart {
    cms: Arc<dyn CmsClient>,
    restarter: Box<dyn Restarter>,
    opts: RestartOptions,
    presenter: Box<dyn Presenter>,
}

impl RollingRestart {
    pub fn new(
        cms: Arc<dyn CmsClient>,
        restarter: Box<dyn Restarter>,
        opts: RestartOptions,
    ) -> RollingRestart {
        RollingRestart {
            cms,
            restarter,
            opts,
            presenter: Box::new(NoopPresenter),
        }
    }

    pub fn with_presenter(mut self, presenter: Box<dyn Presenter>) -> RollingRestart {
        self.presenter = presenter;
        self
    }

    /// Runs to completion or to a fatal error.
    ///
    /// Cancelling `shutdown` makes the run release every currently held lock
    /// and return [`RollingError::Interrupted`] at the next suspension
    /// point; in-flight restart calls are allowed to finish first.
    pub async fn run(
        &self,
        spec: &FilterNodeParams,
        shutdown: &CancellationToken,
    ) -> Result<RestartReport, RollingError> {
        spec.validate()?;

        let nodes = self
            .cms
            .nodes()
            .await
            .context("fetching cluster topology")?;
        let cluster = ClusterNodesInfo::from_nodes(nodes);
        let nodes_by_id: BTreeMap<u32, Node> = cluster
            .all_nodes
            .iter()
            .map(|n| (n.id, n.clone()))
            .collect();

        let mut task = match &self.opts.task_uid {
            Some(uid) => {
                // Resuming: the task's recorded node set is authoritative,
                // so the selection criteria are not re-applied.
                info!(task_uid = %uid, "resuming existing maintenance task");
                self.cms
                    .refresh_maintenance_task(uid)
                    .await
                    .context("resuming maintenance task")?
            }
            None => {
                let targets = self
                    .restarter
                    .candidate_nodes(spec, &cluster)
                    .await
                    .context("selecting target nodes")?;
                if targets.is_empty() {
                    info!("selection matched no nodes; nothing to do");
                    return Ok(RestartReport::default());
                }
                let params = MaintenanceTaskParams {
                    task_uid: generate_task_uid(),
                    availability_mode: self.opts.availability_mode,
                    duration: self.opts.duration,
                    nodes: targets,
                };
                info!(
                    task_uid = %params.task_uid,
                    mode = %params.availability_mode,
                    nodes = params.nodes.len(),
                    "creating maintenance task",
                );
                self.cms
                    .create_maintenance_task(params)
                    .await
                    .context("creating maintenance task")?
            }
        };
        let task_uid = task.uid.clone();

        let run_nodes: Vec<Node> = task
            .action_group_states
            .iter()
            .filter_map(|a| nodes_by_id.get(&a.node_id).cloned())
            .collect();
        let mut progress = Progress::new(&run_nodes);
        let mut failures: Vec<NodeFailure> = Vec::new();
        // Nodes already handled this run; a lock whose release failed may
        // still show up as granted on the next poll and must not be
        // restarted twice.
        let mut processed: BTreeSet<u32> = BTreeSet::new();
        // Granted locks not yet acknowledged as released, for cleanup on
        // every early exit path.
        let mut held: BTreeMap<String, u32> = BTreeMap::new();

        loop {
            if shutdown.is_cancelled() {
                self.release_held(&held).await;
                return Err(RollingError::Interrupted);
            }

            self.presenter.task_state(&task);

            let mut batch: Vec<(String, Node)> = Vec::new();
            let mut orphaned: Vec<String> = Vec::new();
            for action in task.performed_actions() {
                if processed.contains(&action.node_id) {
                    continue;
                }
                match nodes_by_id.get(&action.node_id) {
                    Some(node) => batch.push((action.action_uid.clone(), node.clone())),
                    None => {
                        warn!(
                            node_id = action.node_id,
                            "granted lock for a node absent from the topology snapshot; releasing",
                        );
                        orphaned.push(action.action_uid.clone());
                        processed.insert(action.node_id);
                    }
                }
            }
            for action_uid in orphaned {
                if let Err(err) = self.cms.complete_action(&action_uid).await {
                    warn!(
                        action_uid = %action_uid,
                        "failed to release orphaned lock, it will self-expire: {err:#}",
                    );
                }
            }
            let pending = task.pending_count();

            if batch.is_empty() && pending == 0 {
                break;
            }

            if batch.is_empty() {
                debug!(pending, "no locks granted yet");
            } else {
                info!(
                    nodes = ?batch.iter().map(|(_, n)| n.id).collect::<Vec<_>>(),
                    "restarting batch",
                );
                for (action_uid, node) in &batch {
                    held.insert(action_uid.clone(), node.id);
                }

                let outcomes = future::join_all(
                    batch
                        .into_iter()
                        .map(|(action_uid, node)| self.process_node(action_uid, node)),
                )
                .await;

                let mut report = BatchReport::default();
                for outcome in outcomes {
                    processed.insert(outcome.node.id);
                    if outcome.completed {
                        held.remove(&outcome.action_uid);
                    }
                    match outcome.result {
                        Ok(()) => {
                            progress.record_restarted(&outcome.node);
                            report.restarted.push(outcome.node);
                        }
                        Err(err) => {
                            let failure = NodeFailure {
                                node_id: outcome.node.id,
                                host: outcome.node.host,
                                tenant: outcome.node.tenant,
                                error: format!("{err:#}"),
                            };
                            warn!(
                                node_id = failure.node_id,
                                host = %failure.host,
                                "node failed to restart: {}",
                                failure.error,
                            );
                            failures.push(failure.clone());
                            report.failed.push(failure);
                        }
                    }
                }
                report.per_tenant = progress.per_tenant().clone();
                self.presenter.batch_result(&report);
            }

            // Never poll faster than the service's hint.
            let delay = task.retry_after.unwrap_or(self.opts.poll_interval);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.release_held(&held).await;
                    return Err(RollingError::Interrupted);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            task = match self.cms.refresh_maintenance_task(&task_uid).await {
                Ok(task) => task,
                Err(err) => {
                    self.release_held(&held).await;
                    return Err(RollingError::Fatal(
                        err.context("polling maintenance task"),
                    ));
                }
            };
        }

        // A lock whose release kept failing is still held here; give it one
        // more chance before handing control back.
        if !held.is_empty() {
            self.release_held(&held).await;
        }

        let report = RestartReport {
            task_uid,
            restarted: progress.restarted(),
            per_tenant: progress.per_tenant().clone(),
            failures,
        };
        self.presenter.run_finished(&report);
        Ok(report)
    }

    async fn process_node(&self, action_uid: String, node: Node) -> NodeOutcome {
        let result = self.restart_with_retry(&node).await;
        // The lock is released whether or not the restart worked: a failed
        // node must not pin its lock until the task deadline.
        let completed = match self.cms.complete_action(&action_uid).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    action_uid = %action_uid,
                    node_id = node.id,
                    "failed to release lock, it will self-expire: {err:#}",
                );
                false
            }
        };
        NodeOutcome {
            action_uid,
            node,
            completed,
            result,
        }
    }

    async fn restart_with_retry(&self, node: &Node) -> Result<(), anyhow::Error> {
        let attempts = self.opts.restart_retry_number + 1;
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.restarter.restart_node(node).await {
                Ok(()) => {
                    info!(node_id = node.id, host = %node.host, attempt, "node restarted");
                    return Ok(());
                }
                Err(err) => {
                    if attempt < attempts {
                        warn!(
                            node_id = node.id,
                            attempt, "restart attempt failed, retrying: {err:#}",
                        );
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("node {} was never attempted", node.id))
            .context(format!("restart failed after {attempts} attempts")))
    }

    async fn release_held(&self, held: &BTreeMap<String, u32>) {
        for (action_uid, node_id) in held {
            info!(action_uid = %action_uid, node_id, "releasing held lock before exit");
            if let Err(err) = self.cms.complete_action(action_uid).await {
                warn!(
                    action_uid = %action_uid,
                    "failed to release held lock, it will self-expire: {err:#}",
                );
            }
        }
    }
}
