//! Drift (spec §4.3.3): dynamic-pool drift replacement, at most one Command per tick.

use nlm_types::NodePool;
use std::collections::HashMap;

use crate::candidate::{Candidate, DisruptionClass};
use crate::command::{Command, ConsolidationType, Reason, Replacement};
use crate::events::{Event, EventReason};
use crate::util::messages;

use super::{DisruptionMethod, MethodContext};

pub struct Drift;

impl DisruptionMethod for Drift {
    fn reason(&self) -> Reason {
        Reason::Drifted
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Graceful
    }

    fn consolidation_type(&self) -> ConsolidationType {
        ConsolidationType::Drift
    }

    fn should_disrupt(&self, candidate: &Candidate, pool: &NodePool) -> bool {
        pool.is_dynamic() && candidate.node_claim.is_drifted()
    }

    fn compute_commands(&self, ctx: &MethodContext, candidates: Vec<Candidate>) -> Vec<Command> {
        let mut ordered = candidates;
        ordered.sort_by_key(|c| c.node_claim.drifted_transition_time());
        let (mut empty, mut non_empty): (Vec<_>, Vec<_>) = ordered.into_iter().partition(|c| c.is_empty());
        empty.append(&mut non_empty);

        let mut remaining = ctx.budgets.clone();
        let pools_vec: Vec<NodePool> = ctx.pools.values().cloned().collect();

        for candidate in empty {
            let left = remaining.entry(candidate.pool_name.clone()).or_insert(0);
            if *left == 0 {
                continue;
            }

            let node_name = candidate.node.metadata.name.clone().unwrap_or_default();
            let results = ctx.oracle.simulate(
                ctx.existing_nodes,
                &[node_name.clone()],
                &candidate.reschedulable_pods,
                &pools_vec,
            );

            if !results.all_non_pending_pods_scheduled() {
                ctx.recorder.publish(Event {
                    reason: EventReason::DisruptionBlocked,
                    subject: node_name.clone(),
                    message: messages::blocked(&node_name, &results.non_pending_pod_scheduling_errors()),
                });
                continue;
            }

            *left -= 1;
            let replacements = results
                .new_node_claims
                .iter()
                .cloned()
                .map(Replacement::new)
                .collect();
            return vec![Command::new(
                Reason::Drifted,
                ConsolidationType::Drift,
                vec![candidate],
                replacements,
                Some(results),
                ctx.now,
            )];
        }

        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::default_recorder;
    use crate::scheduling::ReferenceOracle;
    use crate::state::InMemoryClusterStateMirror;
    use crate::testutil::{drifted_candidate, empty_candidate};

    #[test]
    fn prefers_empty_candidate_and_returns_single_command() {
        let method = Drift;
        let pools = HashMap::new();
        let state = InMemoryClusterStateMirror::default();
        let oracle = ReferenceOracle;
        let recorder = default_recorder();
        let mut budgets = HashMap::new();
        budgets.insert("p".to_string(), 5);
        let cloud_provider = crate::cloud_provider::StaticCloudProvider::default();
        let ctx = MethodContext {
            budgets: &budgets,
            pools: &pools,
            state: &state,
            oracle: &oracle,
            recorder: &recorder,
            cloud_provider: &cloud_provider,
            existing_nodes: &[],
            now: chrono::Utc::now(),
        };
        let candidates = vec![drifted_candidate("nc1", "p"), empty_candidate("nc2", "p", true)];
        let commands = method.compute_commands(&ctx, candidates);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].candidates.len(), 1);
        assert_eq!(commands[0].candidates[0].node_claim.metadata.name.as_deref(), Some("nc2"));
    }

    #[test]
    fn zero_budget_yields_no_command() {
        let method = Drift;
        let pools = HashMap::new();
        let state = InMemoryClusterStateMirror::default();
        let oracle = ReferenceOracle;
        let recorder = default_recorder();
        let budgets = HashMap::new();
        let cloud_provider = crate::cloud_provider::StaticCloudProvider::default();
        let ctx = MethodContext {
            budgets: &budgets,
            pools: &pools,
            state: &state,
            oracle: &oracle,
            recorder: &recorder,
            cloud_provider: &cloud_provider,
            existing_nodes: &[],
            now: chrono::Utc::now(),
        };
        let candidates = vec![empty_candidate("nc1", "p", true)];
        assert!(method.compute_commands(&ctx, candidates).is_empty());
    }
}
