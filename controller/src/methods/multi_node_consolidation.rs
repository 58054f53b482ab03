//! MultiNodeConsolidation (spec §4.3.4): binary search for the largest batch of
//! same-pool candidates that can be consolidated into fewer, cheaper nodes.

use nlm_types::{NodeClaimTemplate, NodePool, labels};
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::candidate::{Candidate, DisruptionClass};
use crate::cloud_provider::CloudProvider;
use crate::command::{Command, ConsolidationType, Decision, Reason, Replacement};

use super::{DisruptionMethod, MethodContext};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BATCH: usize = 100;

#[derive(Default)]
pub struct MultiNodeConsolidation;

/// Narrows `template`'s instance-type requirement to only the types still worth
/// launching, per the spec §4.3.4 `filterSameInstanceType` rule. Returns `false` if the
/// filter empties the option set or violates the pool's `minValues`.
fn filter_same_instance_type(
    template: &mut NodeClaimTemplate,
    removed: &[Candidate],
    pool: &NodePool,
    cloud_provider: &dyn CloudProvider,
) -> bool {
    let pool_name = pool.metadata.name.clone().unwrap_or_default();
    let catalog = cloud_provider.instance_types(&pool_name).unwrap_or_default();
    let price_of = |name: &str| catalog.iter().find(|it| it.name == name).and_then(|it| it.cheapest_available_price());

    let removed_types: HashSet<String> = removed.iter().filter_map(|c| c.instance_type.clone()).collect();
    if removed_types.is_empty() {
        return true;
    }

    for requirement in template.spec.requirements.iter_mut().filter(|r| r.key == labels::INSTANCE_TYPE) {
        // The min price among the types this replacement would still keep if every
        // removed type were dropped. A removed type only survives the filter if it
        // remains strictly cheaper than the best of those kept alternatives.
        let min_kept_price = requirement
            .values
            .iter()
            .filter(|v| !removed_types.contains(*v))
            .filter_map(|v| price_of(v))
            .fold(f64::INFINITY, f64::min);

        requirement.values.retain(|v| {
            if !removed_types.contains(v) {
                return true;
            }
            match price_of(v) {
                Some(p) => p < min_kept_price,
                None => false,
            }
        });
        if requirement.values.is_empty() {
            return false;
        }
        if let Some(min_values) = requirement.min_values
            && (requirement.values.len() as u32) < min_values
        {
            return false;
        }
    }
    true
}

const MIN_SPOT_TO_SPOT_CHEAPER_OPTIONS: u32 = 15;

/// Spot-to-spot consolidation (spec §8) only fires when the replacement's
/// instance-type option set keeps at least this many distinct options priced strictly
/// below the removed candidates' cheapest type — or the pool's `minValues` for that
/// requirement, if larger. Guards against chasing a single marginally-cheaper spot price
/// that may no longer be available by the time the replacement launches.
fn spot_to_spot_threshold_met(removed: &[Candidate], template: &NodeClaimTemplate, pool: &NodePool, cloud_provider: &dyn CloudProvider) -> bool {
    let all_spot = !removed.is_empty() && removed.iter().all(|c| c.capacity_type.as_deref() == Some("spot"));
    if !all_spot {
        return true;
    }

    let pool_name = pool.metadata.name.clone().unwrap_or_default();
    let catalog = cloud_provider.instance_types(&pool_name).unwrap_or_default();
    let price_of = |name: &str| catalog.iter().find(|it| it.name == name).and_then(|it| it.cheapest_available_price());

    let removed_types: HashSet<String> = removed.iter().filter_map(|c| c.instance_type.clone()).collect();
    let min_removed_price = removed_types.iter().filter_map(|t| price_of(t)).fold(f64::INFINITY, f64::min);

    let Some(requirement) = template.spec.requirements.iter().find(|r| r.key == labels::INSTANCE_TYPE) else {
        return true;
    };

    let cheaper_options = requirement
        .values
        .iter()
        .filter(|v| !removed_types.contains(*v))
        .filter_map(|v| price_of(v))
        .filter(|p| *p < min_removed_price)
        .count() as u32;

    let threshold = requirement.min_values.unwrap_or(0).max(MIN_SPOT_TO_SPOT_CHEAPER_OPTIONS);
    cheaper_options >= threshold
}

fn try_batch(ctx: &MethodContext, pool: &NodePool, batch: &[Candidate]) -> Option<Command> {
    let removed_names: Vec<String> = batch
        .iter()
        .map(|c| c.node.metadata.name.clone().unwrap_or_default())
        .collect();
    let pending: Vec<_> = batch.iter().flat_map(|c| c.reschedulable_pods.clone()).collect();
    let pools_vec: Vec<NodePool> = ctx.pools.values().cloned().collect();

    let results = ctx.oracle.simulate(ctx.existing_nodes, &removed_names, &pending, &pools_vec);
    if !results.all_non_pending_pods_scheduled() {
        return None;
    }

    let mut replacements: Vec<Replacement> = results
        .new_node_claims
        .iter()
        .cloned()
        .map(Replacement::new)
        .collect();

    if !replacements.is_empty() {
        for replacement in &mut replacements {
            if !filter_same_instance_type(&mut replacement.template, batch, pool, ctx.cloud_provider) {
                return None;
            }
            if !spot_to_spot_threshold_met(batch, &replacement.template, pool, ctx.cloud_provider) {
                return None;
            }
        }
    }

    let command = Command::new(
        Reason::Underutilized,
        ConsolidationType::MultiNode,
        batch.to_vec(),
        replacements,
        Some(results),
        ctx.now,
    );
    match command.decision() {
        Decision::Delete | Decision::Replace => Some(command),
        Decision::NoOp => None,
    }
}

impl DisruptionMethod for MultiNodeConsolidation {
    fn reason(&self) -> Reason {
        Reason::Underutilized
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Graceful
    }

    fn consolidation_type(&self) -> ConsolidationType {
        ConsolidationType::MultiNode
    }

    fn should_disrupt(&self, candidate: &Candidate, pool: &NodePool) -> bool {
        pool.is_dynamic() && candidate.node_claim.is_consolidatable() && !candidate.is_empty()
    }

    fn compute_commands(&self, ctx: &MethodContext, candidates: Vec<Candidate>) -> Vec<Command> {
        let mut by_pool: std::collections::HashMap<String, Vec<Candidate>> = std::collections::HashMap::new();
        for candidate in candidates {
            if candidate.is_empty() {
                continue;
            }
            by_pool.entry(candidate.pool_name.clone()).or_default().push(candidate);
        }

        let mut pool_names: Vec<String> = by_pool.keys().cloned().collect();
        pool_names.sort();

        let deadline = Instant::now() + SEARCH_TIMEOUT;

        for pool_name in pool_names {
            let Some(pool) = ctx.pools.get(&pool_name) else { continue };
            let mut group = by_pool.remove(&pool_name).unwrap();
            group.sort_by(|a, b| a.disruption_cost.partial_cmp(&b.disruption_cost).unwrap());

            let budget = ctx.budgets.get(&pool_name).copied().unwrap_or(0) as usize;
            group.truncate(budget);

            let n = group.len().min(MAX_BATCH);
            if n < 2 {
                continue;
            }

            let mut lo = 2usize;
            let mut hi = n;
            let mut best: Option<Command> = None;
            while lo <= hi {
                if Instant::now() >= deadline {
                    break;
                }
                let mid = lo + (hi - lo) / 2;
                match try_batch(ctx, pool, &group[0..mid]) {
                    Some(cmd) => {
                        best = Some(cmd);
                        lo = mid + 1;
                    }
                    None => {
                        if mid == 0 {
                            break;
                        }
                        hi = mid - 1;
                    }
                }
            }

            if let Some(cmd) = best {
                return vec![cmd];
            }
        }

        vec![]
    }
}
