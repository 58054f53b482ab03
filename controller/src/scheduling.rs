//! Scheduling Oracle (spec §4.8 / §6 `Provisioner.Simulate`). The controller treats pod
//! scheduling as an external collaborator; this module defines the trait boundary plus a
//! deterministic first-fit reference used by tests, grounded on the filter-then-score
//! plugin shape of a real scheduler but simplified since full scoring is out of scope.

use k8s_openapi::api::core::v1::{Node, Pod};
use nlm_types::{NodeClaimTemplate, NodePool};

/// Cheap-to-compare value object per the "Results as a value object" design note: two
/// simulations are equal iff they'd produce the same scheduling decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    pub scheduled_pod_names: Vec<String>,
    pub unschedulable_pod_names: Vec<String>,
    pub new_node_claims: Vec<NodeClaimTemplate>,
}

impl Results {
    pub fn all_non_pending_pods_scheduled(&self) -> bool {
        self.unschedulable_pod_names.is_empty()
    }

    pub fn non_pending_pod_scheduling_errors(&self) -> String {
        if self.unschedulable_pod_names.is_empty() {
            String::new()
        } else {
            format!("pods could not be scheduled: {}", self.unschedulable_pod_names.join(", "))
        }
    }
}

pub trait SchedulingOracle: Send + Sync {
    /// Simulates removing `removed_nodes` and rescheduling `pending_pods` against the
    /// remaining nodes (`existing_nodes`) plus, if needed, one synthetic node per pool
    /// template drawn from `pools`.
    fn simulate(
        &self,
        existing_nodes: &[Node],
        removed_node_names: &[String],
        pending_pods: &[Pod],
        pools: &[NodePool],
    ) -> Results;
}

/// Deterministic bin-packer used by tests and as the default wiring when no richer
/// provisioner is configured: first-fit onto remaining nodes' allocatable CPU, else one
/// new claim from a dynamic pool template. `Provisioner.Simulate` carries no pricing
/// signal, so "which dynamic pool" is broken by sorting pool names rather than by cost.
#[derive(Default)]
pub struct ReferenceOracle;

fn node_allocatable_millicores(node: &Node) -> f64 {
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get("cpu"))
        .map(|q| parse_millicores(&q.0))
        .unwrap_or(0.0)
}

fn pod_request_millicores(pod: &Pod) -> f64 {
    pod.spec
        .as_ref()
        .map(|s| {
            s.containers
                .iter()
                .filter_map(|c| c.resources.as_ref()?.requests.as_ref()?.get("cpu"))
                .map(|q| parse_millicores(&q.0))
                .sum()
        })
        .unwrap_or(0.0)
}

fn parse_millicores(raw: &str) -> f64 {
    if let Some(m) = raw.strip_suffix('m') {
        m.parse().unwrap_or(0.0)
    } else {
        raw.parse::<f64>().unwrap_or(0.0) * 1000.0
    }
}

impl SchedulingOracle for ReferenceOracle {
    fn simulate(
        &self,
        existing_nodes: &[Node],
        removed_node_names: &[String],
        pending_pods: &[Pod],
        pools: &[NodePool],
    ) -> Results {
        let mut remaining: Vec<(String, f64)> = existing_nodes
            .iter()
            .filter(|n| {
                !removed_node_names
                    .iter()
                    .any(|r| Some(r.as_str()) == n.metadata.name.as_deref())
            })
            .map(|n| (n.metadata.name.clone().unwrap_or_default(), node_allocatable_millicores(n)))
            .collect();

        let mut scheduled = Vec::new();
        let mut unschedulable = Vec::new();
        let mut new_claims = Vec::new();

        let mut dynamic_pools: Vec<&NodePool> = pools.iter().filter(|p| p.is_dynamic()).collect();
        dynamic_pools.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        'pods: for pod in pending_pods {
            let name = pod.metadata.name.clone().unwrap_or_default();
            let need = pod_request_millicores(pod);
            for (_, cap) in remaining.iter_mut() {
                if *cap >= need {
                    *cap -= need;
                    scheduled.push(name);
                    continue 'pods;
                }
            }
            // Fits on a fresh node from the first dynamic pool template, by name.
            if let Some(pool) = dynamic_pools.first() {
                new_claims.push(pool.spec.template.clone());
                scheduled.push(name);
                continue;
            }
            unschedulable.push(name);
        }

        Results {
            scheduled_pod_names: scheduled,
            unschedulable_pod_names: unschedulable,
            new_node_claims: new_claims,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{bare_node_with_cpu, bare_pod_with_cpu};

    #[test]
    fn schedules_onto_remaining_capacity() {
        let node = bare_node_with_cpu("n1", 4000.0);
        let pod = bare_pod_with_cpu("p1", 1000.0);
        let oracle = ReferenceOracle;
        let results = oracle.simulate(&[node], &[], &[pod], &[]);
        assert!(results.all_non_pending_pods_scheduled());
        assert!(results.new_node_claims.is_empty());
    }

    #[test]
    fn unschedulable_without_capacity_or_pool() {
        let node = bare_node_with_cpu("n1", 100.0);
        let pod = bare_pod_with_cpu("p1", 1000.0);
        let oracle = ReferenceOracle;
        let results = oracle.simulate(&[node], &[], &[pod], &[]);
        assert!(!results.all_non_pending_pods_scheduled());
    }

    #[test]
    fn new_claim_picks_dynamic_pool_deterministically_by_name() {
        use crate::testutil::ready_pool;

        let pool_b = ready_pool("b-pool", false);
        let pool_a = ready_pool("a-pool", false);
        let pod = bare_pod_with_cpu("p1", 1000.0);
        let oracle = ReferenceOracle;

        // Same pools, opposite input order: the result must not depend on iteration order.
        let forward = oracle.simulate(&[], &[], &[pod.clone()], &[pool_b.clone(), pool_a.clone()]);
        let reverse = oracle.simulate(&[], &[], &[pod], &[pool_a, pool_b]);

        assert_eq!(forward.new_node_claims.len(), 1);
        assert_eq!(forward, reverse);
    }
}
