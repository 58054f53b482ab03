//! SingleNodeConsolidation (spec §4.3.5): cross-pool interleaved search for one
//! candidate that can be deleted or replaced on its own.

use nlm_types::NodePool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::candidate::{Candidate, DisruptionClass};
use crate::command::{Command, ConsolidationType, Decision, Reason, Replacement};

use super::{DisruptionMethod, MethodContext};

const INVOCATION_TIMEOUT: Duration = Duration::from_secs(180);

/// Pools whose candidates were not reached before the previous invocation's timeout;
/// pushed to the front of the next invocation's pool order.
#[derive(Default)]
pub struct SingleNodeConsolidation {
    previously_unseen: Mutex<Vec<String>>,
}

fn try_single(ctx: &MethodContext, candidate: &Candidate) -> Option<Command> {
    let node_name = candidate.node.metadata.name.clone().unwrap_or_default();
    let pools_vec: Vec<NodePool> = ctx.pools.values().cloned().collect();
    let results = ctx.oracle.simulate(
        ctx.existing_nodes,
        &[node_name],
        &candidate.reschedulable_pods,
        &pools_vec,
    );
    if !results.all_non_pending_pods_scheduled() {
        return None;
    }
    let replacements: Vec<Replacement> = results
        .new_node_claims
        .iter()
        .cloned()
        .map(Replacement::new)
        .collect();
    let command = Command::new(
        Reason::Underutilized,
        ConsolidationType::SingleNode,
        vec![candidate.clone()],
        replacements,
        Some(results),
        ctx.now,
    );
    match command.decision() {
        Decision::Delete | Decision::Replace => Some(command),
        Decision::NoOp => None,
    }
}

impl DisruptionMethod for SingleNodeConsolidation {
    fn reason(&self) -> Reason {
        Reason::Underutilized
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Graceful
    }

    fn consolidation_type(&self) -> ConsolidationType {
        ConsolidationType::SingleNode
    }

    fn should_disrupt(&self, candidate: &Candidate, pool: &NodePool) -> bool {
        pool.is_dynamic() && candidate.node_claim.is_consolidatable() && !candidate.is_empty()
    }

    fn compute_commands(&self, ctx: &MethodContext, candidates: Vec<Candidate>) -> Vec<Command> {
        let mut by_pool: HashMap<String, Vec<Candidate>> = HashMap::new();
        for candidate in candidates {
            if candidate.is_empty() {
                continue;
            }
            by_pool.entry(candidate.pool_name.clone()).or_default().push(candidate);
        }
        for group in by_pool.values_mut() {
            group.sort_by(|a, b| a.disruption_cost.partial_cmp(&b.disruption_cost).unwrap());
        }

        let mut pool_order: Vec<String> = self.previously_unseen.lock().unwrap().clone();
        pool_order.retain(|p| by_pool.contains_key(p));
        let mut remaining_pools: Vec<String> = by_pool.keys().cloned().collect();
        remaining_pools.sort();
        for p in remaining_pools {
            if !pool_order.contains(&p) {
                pool_order.push(p);
            }
        }

        let deadline = Instant::now() + INVOCATION_TIMEOUT;
        let mut indices: HashMap<String, usize> = HashMap::new();

        'outer: loop {
            let mut any_progress = false;
            for pool_name in &pool_order {
                if Instant::now() >= deadline {
                    let unseen: Vec<String> = pool_order
                        .iter()
                        .filter(|p| indices.get(*p).copied().unwrap_or(0) < by_pool.get(*p).map_or(0, Vec::len))
                        .cloned()
                        .collect();
                    *self.previously_unseen.lock().unwrap() = unseen;
                    return vec![];
                }

                let group = &by_pool[pool_name];
                let idx = indices.entry(pool_name.clone()).or_insert(0);
                if *idx >= group.len() {
                    continue;
                }
                let budget = ctx.budgets.get(pool_name).copied().unwrap_or(0) as usize;
                if *idx >= budget {
                    *idx = group.len();
                    continue;
                }

                let candidate = &group[*idx];
                *idx += 1;
                any_progress = true;

                if let Some(command) = try_single(ctx, candidate) {
                    self.previously_unseen.lock().unwrap().clear();
                    return vec![command];
                }
            }
            if !any_progress {
                break 'outer;
            }
        }

        self.previously_unseen.lock().unwrap().clear();
        vec![]
    }
}
