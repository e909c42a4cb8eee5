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

//! Node selection.
//!
//! Turns a user's selection criteria and a topology snapshot into the
//! concrete list of nodes a restarter will operate on. Selection is a pure
//! function of its inputs and always yields the same id-ordered,
//! duplicate-free list, so repeated runs against the same snapshot batch and
//! report identically.

use std::collections::{BTreeMap, BTreeSet};

use dbops_maintenance::{ClusterNodesInfo, Node};

/// User-supplied selection criteria for a restart run.
///
/// Inclusion sets narrow the universe; exclusion sets subtract from the
/// narrowed result. An empty inclusion set means "no restriction", not
/// "nothing".
#[derive(Debug, Clone, Default)]
pub struct FilterNodeParams {
    pub selected_node_ids: BTreeSet<u32>,
    pub selected_hosts: BTreeSet<String>,
    pub selected_tenants: BTreeSet<String>,
    pub excluded_node_ids: BTreeSet<u32>,
    pub excluded_hosts: BTreeSet<String>,
}

/// A contradiction in the selection criteria, detected before any lock is
/// requested from the maintenance service.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("node id {0} is both explicitly selected and excluded")]
    ContradictoryNodeId(u32),
    #[error("host {0} is both explicitly selected and excluded")]
    ContradictoryHost(String),
}

impl FilterNodeParams {
    pub fn validate(&self) -> Result<(), SelectionError> {
        if let Some(id) = self
            .selected_node_ids
            .intersection(&self.excluded_node_ids)
            .next()
        {
            return Err(SelectionError::ContradictoryNodeId(*id));
        }
        if let Some(host) = self
            .selected_hosts
            .intersection(&self.excluded_hosts)
            .next()
        {
            return Err(SelectionError::ContradictoryHost(host.clone()));
        }
        Ok(())
    }

    fn has_explicit_selection(&self) -> bool {
        !self.selected_node_ids.is_empty()
            || !self.selected_hosts.is_empty()
            || !self.selected_tenants.is_empty()
    }

    fn includes(&self, node: &Node) -> bool {
        self.selected_node_ids.contains(&node.id) || self.selected_hosts.contains(&node.host)
    }

    fn excludes(&self, node: &Node) -> bool {
        self.excluded_node_ids.contains(&node.id) || self.excluded_hosts.contains(&node.host)
    }
}

/// The subset of the cluster a restarter variant is able to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainConstraint {
    /// Any node in the cluster.
    Any,
    /// Only nodes owned by some tenant.
    Tenant,
    /// Only storage-role nodes.
    Storage,
}

impl DomainConstraint {
    fn admits(&self, node: &Node) -> bool {
        match self {
            DomainConstraint::Any => true,
            DomainConstraint::Tenant => !node.is_storage(),
            DomainConstraint::Storage => node.is_storage(),
        }
    }
}

/// Selects the target nodes for a restart run.
///
/// Starting from the nodes `domain` admits: when any inclusion criterion is
/// present, the result is the union of the nodes matching an explicit id or
/// host and the nodes of the named tenants (via the snapshot's
/// tenant-to-node mapping); with no inclusion criteria at all, every
/// admitted node is selected. The exclusion sets then subtract
/// unconditionally, so an excluded node never survives even if an inclusion
/// criterion also matched it.
///
/// An inclusion criterion matching nothing is not an error, and an empty
/// result is a legitimate "nothing to do".
pub fn select_nodes(
    spec: &FilterNodeParams,
    cluster: &ClusterNodesInfo,
    domain: DomainConstraint,
) -> Vec<Node> {
    let eligible: Vec<&Node> = cluster
        .all_nodes
        .iter()
        .filter(|n| domain.admits(n))
        .collect();

    // BTreeMap keyed by node id gives dedup and stable ordering in one go.
    let mut picked: BTreeMap<u32, &Node> = if spec.has_explicit_selection() {
        eligible
            .iter()
            .filter(|n| spec.includes(n))
            .map(|n| (n.id, *n))
            .collect()
    } else {
        eligible.iter().map(|n| (n.id, *n)).collect()
    };

    for tenant in &spec.selected_tenants {
        let Some(ids) = cluster.tenant_to_node_ids.get(tenant) else {
            continue;
        };
        for node in eligible.iter().filter(|n| ids.contains(&n.id)) {
            picked.insert(node.id, *node);
        }
    }

    picked.retain(|_, node| !spec.excludes(node));

    picked.into_values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, host: &str, tenant: Option<&str>) -> Node {
        Node {
            id,
            host: host.into(),
            tenant: tenant.map(|t| t.into()),
        }
    }

    fn cluster() -> ClusterNodesInfo {
        ClusterNodesInfo::from_nodes(vec![
            node(5, "s1.db.local", None),
            node(1, "a1.db.local", Some("alpha")),
            node(2, "a2.db.local", Some("alpha")),
            node(3, "b1.db.local", Some("beta")),
            node(4, "s2.db.local", None),
        ])
    }

    fn ids(nodes: &[Node]) -> Vec<u32> {
        nodes.iter().map(|n| n.id).collect()
    }

    #[test]
    fn empty_spec_selects_full_domain() {
        let spec = FilterNodeParams::default();
        assert_eq!(
            ids(&select_nodes(&spec, &cluster(), DomainConstraint::Any)),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(
            ids(&select_nodes(&spec, &cluster(), DomainConstraint::Tenant)),
            vec![1, 2, 3]
        );
        assert_eq!(
            ids(&select_nodes(&spec, &cluster(), DomainConstraint::Storage)),
            vec![4, 5]
        );
    }

    #[test]
    fn selection_is_deterministic_and_duplicate_free() {
        let spec = FilterNodeParams {
            selected_node_ids: BTreeSet::from([2, 1]),
            selected_tenants: BTreeSet::from(["alpha".to_owned()]),
            ..Default::default()
        };
        let first = select_nodes(&spec, &cluster(), DomainConstraint::Tenant);
        for _ in 0..10 {
            assert_eq!(select_nodes(&spec, &cluster(), DomainConstraint::Tenant), first);
        }
        // Nodes 1 and 2 match both an explicit id and the tenant expansion,
        // but appear once.
        assert_eq!(ids(&first), vec![1, 2]);
    }

    #[test]
    fn inclusion_criteria_union() {
        let spec = FilterNodeParams {
            selected_node_ids: BTreeSet::from([5]),
            selected_hosts: BTreeSet::from(["a1.db.local".to_owned()]),
            selected_tenants: BTreeSet::from(["beta".to_owned()]),
            ..Default::default()
        };
        assert_eq!(
            ids(&select_nodes(&spec, &cluster(), DomainConstraint::Any)),
            vec![1, 3, 5]
        );
    }

    #[test]
    fn tenants_alone_narrow_to_those_tenants() {
        let spec = FilterNodeParams {
            selected_tenants: BTreeSet::from(["beta".to_owned()]),
            ..Default::default()
        };
        assert_eq!(
            ids(&select_nodes(&spec, &cluster(), DomainConstraint::Tenant)),
            vec![3]
        );
        assert_eq!(
            ids(&select_nodes(&spec, &cluster(), DomainConstraint::Any)),
            vec![3]
        );
    }

    #[test]
    fn tenant_expansion_respects_domain() {
        // A tenant name never drags in nodes the domain does not admit.
        let spec = FilterNodeParams {
            selected_node_ids: BTreeSet::from([4]),
            selected_tenants: BTreeSet::from(["alpha".to_owned()]),
            ..Default::default()
        };
        assert_eq!(
            ids(&select_nodes(&spec, &cluster(), DomainConstraint::Storage)),
            vec![4]
        );
    }

    #[test]
    fn exclusion_beats_inclusion() {
        let spec = FilterNodeParams {
            selected_tenants: BTreeSet::from(["alpha".to_owned()]),
            selected_node_ids: BTreeSet::from([3]),
            excluded_node_ids: BTreeSet::from([2]),
            excluded_hosts: BTreeSet::from(["b1.db.local".to_owned()]),
            ..Default::default()
        };
        assert_eq!(
            ids(&select_nodes(&spec, &cluster(), DomainConstraint::Tenant)),
            vec![1]
        );
    }

    #[test]
    fn unmatched_inclusion_is_not_an_error() {
        let spec = FilterNodeParams {
            selected_node_ids: BTreeSet::from([99]),
            selected_tenants: BTreeSet::from(["gamma".to_owned()]),
            ..Default::default()
        };
        assert!(select_nodes(&spec, &cluster(), DomainConstraint::Any).is_empty());
    }

    #[test]
    fn contradictory_specs_fail_validation() {
        let spec = FilterNodeParams {
            selected_node_ids: BTreeSet::from([1]),
            excluded_node_ids: BTreeSet::from([1]),
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(SelectionError::ContradictoryNodeId(1))
        ));

        let spec = FilterNodeParams {
            selected_hosts: BTreeSet::from(["a1.db.local".to_owned()]),
            excluded_hosts: BTreeSet::from(["a1.db.local".to_owned()]),
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(SelectionError::ContradictoryHost(_))
        ));

        assert!(FilterNodeParams::default().validate().is_ok());
    }
}
