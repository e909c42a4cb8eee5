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

//! Human-readable rendering of run state.

use dbops_maintenance::{ActionStatus, MaintenanceTask};
use dbops_rolling::progress::{BatchReport, Presenter, RestartReport};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Prints task, batch, and final state to stdout as the run progresses.
#[derive(Debug, Default)]
pub struct StdoutPresenter;

impl Presenter for StdoutPresenter {
    fn task_state(&self, task: &MaintenanceTask) {
        println!("Task {}:", task.uid);
        for action in &task.action_group_states {
            match &action.status {
                ActionStatus::Performed { deadline } => println!(
                    "  lock on node {} PERFORMED, until {}",
                    action.node_id,
                    deadline.format(TIME_FORMAT),
                ),
                ActionStatus::Pending { reason } => {
                    println!("  lock on node {} PENDING, {}", action.node_id, reason)
                }
            }
        }
    }

    fn batch_result(&self, batch: &BatchReport) {
        let restarted: Vec<u32> = batch.restarted.iter().map(|n| n.id).collect();
        println!("Restarted this step: {restarted:?}");
        for failure in &batch.failed {
            println!(
                "  node {} ({}) FAILED: {}",
                failure.node_id, failure.host, failure.error
            );
        }
        for (tenant, progress) in &batch.per_tenant {
            println!(
                "  tenant {tenant}: restarted {}, remaining {}",
                progress.restarted, progress.remaining
            );
        }
    }

    fn run_finished(&self, report: &RestartReport) {
        println!(
            "Done: task {}, {} node(s) restarted, {} failed",
            report.task_uid,
            report.restarted,
            report.failures.len()
        );
        for failure in &report.failures {
            println!(
                "  node {} ({}) FAILED: {}",
                failure.node_id, failure.host, failure.error
            );
        }
    }
}
