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

//! Progress accounting and the reporting boundary.

use std::collections::BTreeMap;

use dbops_maintenance::{MaintenanceTask, Node};

/// Restart progress for one tenant. `restarted + remaining` always equals
/// the tenant's total target node count; a node whose restart failed stays
/// in `remaining`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TenantProgress {
    pub restarted: usize,
    pub remaining: usize,
}

/// One node that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node_id: u32,
    pub host: String,
    pub tenant: Option<String>,
    pub error: String,
}

/// What happened in one restart batch, plus the per-tenant progress as of
/// the end of the batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub restarted: Vec<Node>,
    pub failed: Vec<NodeFailure>,
    pub per_tenant: BTreeMap<String, TenantProgress>,
}

/// The final outcome of a rolling restart run.
#[derive(Debug, Clone, Default)]
pub struct RestartReport {
    pub task_uid: String,
    pub restarted: usize,
    pub per_tenant: BTreeMap<String, TenantProgress>,
    pub failures: Vec<NodeFailure>,
}

/// Receives read-only snapshots of run state for rendering. The orchestrator
/// never formats output itself.
pub trait Presenter: Send + Sync {
    fn task_state(&self, _task: &MaintenanceTask) {}
    fn batch_result(&self, _batch: &BatchReport) {}
    fn run_finished(&self, _report: &RestartReport) {}
}

/// A presenter that discards everything.
#[derive(Debug, Default)]
pub struct NoopPresenter;

impl Presenter for NoopPresenter {}

#[derive(Debug, Default)]
pub(crate) struct Progress {
    per_tenant: BTreeMap<String, TenantProgress>,
    restarted: usize,
}

impl Progress {
    pub fn new(targets: &[Node]) -> Progress {
        let mut per_tenant: BTreeMap<String, TenantProgress> = BTreeMap::new();
        for node in targets {
            if let Some(tenant) = &node.tenant {
                per_tenant.entry(tenant.clone()).or_default().remaining += 1;
            }
        }
        Progress {
            per_tenant,
            restarted: 0,
        }
    }

    pub fn record_restarted(&mut self, node: &Node) {
        self.restarted += 1;
        if let Some(tenant) = &node.tenant {
            if let Some(progress) = self.per_tenant.get_mut(tenant) {
                progress.restarted += 1;
                progress.remaining = progress.remaining.saturating_sub(1);
            }
        }
    }

    pub fn restarted(&self) -> usize {
        self.restarted
    }

    pub fn per_tenant(&self) -> &BTreeMap<String, TenantProgress> {
        &self.per_tenant
    }
}
