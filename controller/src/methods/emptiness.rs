//! Emptiness (spec §4.3.1).

use nlm_types::{ConsolidateAfter, NodePool};
use std::collections::HashSet;
use std::sync::Mutex;

use crate::candidate::{Candidate, DisruptionClass};
use crate::command::{Command, ConsolidationType, Reason};
use crate::events::{Event, EventReason};
use crate::util::messages;

use super::{DisruptionMethod, MethodContext};

/// Tracks, per dynamic pool, whether the last pass found nothing empty (a "latch" the
/// controller may consult to skip re-evaluating a pool it already knows is fully
/// consolidated — an optimization hook, not load-bearing for correctness).
#[derive(Default)]
pub struct Emptiness {
    consolidated: Mutex<HashSet<String>>,
}

impl Emptiness {
    pub fn is_consolidated(&self, pool: &str) -> bool {
        self.consolidated.lock().unwrap().contains(pool)
    }

    fn latch(&self, pool: &str) {
        self.consolidated.lock().unwrap().insert(pool.to_string());
    }

    fn unlatch(&self, pool: &str) {
        self.consolidated.lock().unwrap().remove(pool);
    }
}

impl DisruptionMethod for Emptiness {
    fn reason(&self) -> Reason {
        Reason::Empty
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Eventual
    }

    fn consolidation_type(&self) -> ConsolidationType {
        ConsolidationType::Empty
    }

    fn should_disrupt(&self, candidate: &Candidate, pool: &NodePool) -> bool {
        if pool.is_static() {
            return false;
        }
        // A nil consolidateAfter disables emptiness-only behavior for this pool (spec §9
        // open question) but never affects Drift or the other methods.
        if matches!(pool.spec.disruption.consolidate_after, ConsolidateAfter::Never) {
            return false;
        }
        candidate.node_claim.is_consolidatable() && candidate.is_empty()
    }

    fn compute_commands(&self, ctx: &MethodContext, mut candidates: Vec<Candidate>) -> Vec<Command> {
        if candidates.is_empty() {
            // Truly found nothing empty in any consolidation-eligible pool this tick:
            // latch every one so the next tick can skip re-scanning it.
            for (name, pool) in ctx.pools {
                if pool.is_static() || matches!(pool.spec.disruption.consolidate_after, ConsolidateAfter::Never) {
                    continue;
                }
                self.latch(name);
            }
            return vec![];
        }

        candidates.sort_by(|a, b| a.disruption_cost.partial_cmp(&b.disruption_cost).unwrap());

        let mut by_pool_remaining = ctx.budgets.clone();
        let mut selected = Vec::new();
        let mut fully_blocked = true;
        for candidate in candidates {
            let remaining = by_pool_remaining.entry(candidate.pool_name.clone()).or_insert(0);
            if *remaining == 0 {
                ctx.recorder.publish(Event {
                    reason: EventReason::Unconsolidatable,
                    subject: candidate.pool_name.clone(),
                    message: messages::node_pool_blocked(&candidate.pool_name),
                });
                continue;
            }
            *remaining -= 1;
            fully_blocked = false;
            selected.push(candidate);
        }

        if selected.is_empty() {
            return vec![];
        }

        for pool in selected.iter().map(|c| c.pool_name.clone()).collect::<HashSet<_>>() {
            if fully_blocked {
                self.unlatch(&pool);
            } else {
                self.latch(&pool);
            }
        }

        vec![Command::new(
            Reason::Empty,
            ConsolidationType::Empty,
            selected,
            vec![],
            None,
            ctx.now,
        )]
    }
}
