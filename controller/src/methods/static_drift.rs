//! StaticDrift (spec §4.3.2): rolling one-at-a-time replacement of drifted claims in a
//! static pool, gated by `ReserveNodeCount` so the pool never scales out to replace.

use std::collections::HashMap;

use crate::candidate::{Candidate, DisruptionClass};
use crate::command::{Command, ConsolidationType, Reason, Replacement};

use super::{DisruptionMethod, MethodContext};

pub struct StaticDrift;

impl DisruptionMethod for StaticDrift {
    fn reason(&self) -> Reason {
        Reason::Drifted
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Graceful
    }

    fn consolidation_type(&self) -> ConsolidationType {
        ConsolidationType::Drift
    }

    fn should_disrupt(&self, candidate: &Candidate, pool: &nlm_types::NodePool) -> bool {
        pool.is_static() && candidate.node_claim.is_drifted()
    }

    fn compute_commands(&self, ctx: &MethodContext, candidates: Vec<Candidate>) -> Vec<Command> {
        let mut by_pool: HashMap<String, Vec<Candidate>> = HashMap::new();
        for candidate in candidates {
            by_pool.entry(candidate.pool_name.clone()).or_default().push(candidate);
        }

        let mut commands = Vec::new();
        for (pool_name, mut group) in by_pool {
            let Some(pool) = ctx.pools.get(&pool_name) else { continue };
            let Some(replicas) = pool.spec.replicas else { continue };
            let counts = ctx.state.pool_counts(&pool_name);
            if counts.running + counts.pending_disruption > replicas as u32 {
                // Currently scaled out; let the excess get reaped first.
                continue;
            }

            let budget = ctx.budgets.get(&pool_name).copied().unwrap_or(0);
            let max_drifts = budget.min(group.len() as u32);
            if max_drifts == 0 {
                continue;
            }

            let node_limit = pool.spec.limits.nodes.unwrap_or(u32::MAX);
            let granted = ctx.state.reserve_node_count(&pool_name, node_limit, max_drifts);
            if granted == 0 {
                continue;
            }

            group.sort_by(|a, b| a.disruption_cost.partial_cmp(&b.disruption_cost).unwrap());
            for candidate in group.into_iter().take(granted as usize) {
                let replacement = Replacement::new(pool.spec.template.clone());
                commands.push(
                    Command::new(
                        Reason::Drifted,
                        ConsolidationType::Drift,
                        vec![candidate],
                        vec![replacement],
                        None,
                        ctx.now,
                    )
                    .with_reservation(pool_name.clone(), 1),
                );
            }
        }
        commands
    }
}
