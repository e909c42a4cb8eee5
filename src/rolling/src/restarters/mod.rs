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

//! Restarter implementations for the supported deployment topologies.

use std::fmt;

use async_trait::async_trait;
use dbops_maintenance::{ClusterNodesInfo, Node};

use crate::filter::FilterNodeParams;

mod baremetal;
mod kubernetes;
mod run;

pub use baremetal::BaremetalRestarter;
pub use kubernetes::KubernetesRestarter;
pub use run::RunRestarter;

/// A restarter knows how to take down and bring back a single node in one
/// specific deployment topology.
///
/// The intent is that you can implement `Restarter` with pod replacement in
/// Kubernetes, remote commands over SSH, or an arbitrary local payload, and
/// the rolling restart loop never needs to know which. Restarters never retry
/// internally; retry policy belongs to the caller.
#[async_trait]
pub trait Restarter: fmt::Debug + Send + Sync {
    /// Computes the nodes this restarter would operate on, applying both the
    /// user's selection criteria and the restarter's own domain constraint.
    ///
    /// Implementations prepare any external binding state (e.g. a scoped
    /// Kubernetes client) before first use; repeated calls are idempotent.
    async fn candidate_nodes(
        &self,
        spec: &FilterNodeParams,
        cluster: &ClusterNodesInfo,
    ) -> Result<Vec<Node>, anyhow::Error>;

    /// Restarts one node, blocking until the node is back or the attempt has
    /// definitively failed. Must be safe to call concurrently for distinct
    /// nodes.
    async fn restart_node(&self, node: &Node) -> Result<(), anyhow::Error>;
}
