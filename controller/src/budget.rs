//! Budget Calculator (spec §4.2).

use nlm_types::NodePool;
use std::collections::HashMap;

use crate::events::{ConsoleEventRecorder, Event, EventReason, EventRecorder};
use crate::state::PoolCounts;
use crate::util::messages;

#[cfg(feature = "metrics")]
use crate::util::metrics::Metrics;

pub struct BudgetCalculator<'a> {
    pub recorder: &'a dyn EventRecorder,
    #[cfg(feature = "metrics")]
    pub metrics: Option<&'a Metrics>,
}

impl<'a> BudgetCalculator<'a> {
    pub fn new(recorder: &'a dyn EventRecorder) -> Self {
        BudgetCalculator {
            recorder,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Produces `pool -> allowance` for one disruption `reason`, given each pool's
    /// current counts and the number of candidates already queued per pool for that
    /// reason (`in_flight`). `now` gates each pool's budgets by their schedule window.
    pub fn compute(
        &self,
        pools: &[NodePool],
        counts: &dyn Fn(&str) -> PoolCounts,
        in_flight: &dyn Fn(&str, &str) -> u32,
        reason: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> HashMap<String, u32> {
        let mut out = HashMap::new();
        for pool in pools {
            let name = pool.metadata.name.clone().unwrap_or_default();
            let matching: Vec<_> = pool
                .spec
                .disruption
                .budgets
                .iter()
                .filter(|b| b.applies_to(reason) && b.in_schedule_window(now))
                .collect();

            if matching.is_empty() {
                out.insert(name, 0);
                continue;
            }

            let pool_counts = counts(&name);
            let base = pool_counts.running + pool_counts.pending_disruption;

            let mut allowance: Option<u32> = None;
            let mut any_invalid = false;
            for budget in &matching {
                match budget.allowance(base) {
                    Some(a) => {
                        allowance = Some(allowance.map_or(a, |cur| cur.min(a)));
                    }
                    None => any_invalid = true,
                }
            }
            if any_invalid {
                println!(
                    "nodepool '{name}' has a misconfigured disruption budget for reason '{reason}'; ignoring it this tick"
                );
            }
            let mut allowance = allowance.unwrap_or(0);

            let queued = in_flight(&name, reason);
            allowance = allowance.saturating_sub(queued);

            #[cfg(feature = "metrics")]
            if let Some(metrics) = self.metrics {
                metrics.node_pool_allowed_disruptions(&name, reason, allowance as i64);
            }

            if allowance == 0 {
                self.recorder.publish(Event {
                    reason: EventReason::NodePoolBlockedForDisruptionReason,
                    subject: name.clone(),
                    message: messages::node_pool_blocked_for_reason(&name, reason),
                });
            }

            out.insert(name, allowance);
        }
        out
    }
}

pub fn default_recorder() -> ConsoleEventRecorder {
    ConsoleEventRecorder::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ready_pool;
    use nlm_types::Budget;

    fn counts_zero(_: &str) -> PoolCounts {
        PoolCounts::default()
    }

    fn in_flight_zero(_: &str, _: &str) -> u32 {
        0
    }

    #[test]
    fn zero_percent_budget_yields_zero_allowance() {
        let mut pool = ready_pool("p", true);
        pool.spec.disruption.budgets = vec![Budget {
            nodes: "0%".to_string(),
            reasons: None,
            schedule: None,
            duration: None,
        }];
        let recorder = ConsoleEventRecorder::default();
        let calc = BudgetCalculator::new(&recorder);
        let map = calc.compute(&[pool], &counts_zero, &in_flight_zero, "Drifted", chrono::Utc::now());
        assert_eq!(map.get("p"), Some(&0));
    }

    #[test]
    fn in_flight_commands_reduce_allowance() {
        let mut pool = ready_pool("p", true);
        pool.spec.disruption.budgets = vec![Budget {
            nodes: "5".to_string(),
            reasons: None,
            schedule: None,
            duration: None,
        }];
        let recorder = ConsoleEventRecorder::default();
        let calc = BudgetCalculator::new(&recorder);
        let map = calc.compute(&[pool], &counts_zero, &|_, _| 3, "Drifted", chrono::Utc::now());
        assert_eq!(map.get("p"), Some(&2));
    }

    #[test]
    fn no_matching_budget_is_zero_allowance() {
        let pool = ready_pool("p", true);
        let recorder = ConsoleEventRecorder::default();
        let calc = BudgetCalculator::new(&recorder);
        let map = calc.compute(&[pool], &counts_zero, &in_flight_zero, "Drifted", chrono::Utc::now());
        assert_eq!(map.get("p"), Some(&0));
    }

    #[test]
    fn schedule_outside_window_yields_zero_allowance() {
        let mut pool = ready_pool("p", true);
        pool.spec.disruption.budgets = vec![Budget {
            nodes: "5".to_string(),
            reasons: None,
            // A schedule that can never match the current minute/hour simultaneously.
            schedule: Some("0 0 1 1 *".to_string()),
            duration: Some("1m".to_string()),
        }];
        let recorder = ConsoleEventRecorder::default();
        let calc = BudgetCalculator::new(&recorder);
        let now = chrono::DateTime::parse_from_rfc3339("2026-06-15T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let map = calc.compute(&[pool], &counts_zero, &in_flight_zero, "Drifted", now);
        assert_eq!(map.get("p"), Some(&0));
    }
}
