//! Controller Loop (spec §4.6): the periodic driver that sequences Candidate Builder,
//! the five disruption methods, the Validator, and the Orchestration Queue.

use nlm_types::{NodePool, taints};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::budget::BudgetCalculator;
use crate::candidate::{Candidate, CandidateBuilder};
use crate::clock::Clock;
use crate::cloud_provider::CloudProvider;
use crate::events::{Event, EventReason, EventRecorder};
use crate::methods::{DisruptionMethod, MethodContext, ordered_methods};
use crate::queue::{Launcher, NodeActuator, Queue, ReconcileOutcome};
use crate::scheduling::SchedulingOracle;
use crate::state::{ClusterStateMirror, PoolCounts};
use crate::util::messages;
use crate::util::{Error, POLL_INTERVAL};
use crate::validator::Validator;

#[cfg(feature = "metrics")]
use crate::util::metrics::Metrics;

/// Annotation the candidate-node fixtures and cloud-provider integration use to carry a
/// Node's `providerID` link to its owning `NodeClaim`.
const PROVIDER_ID_ANNOTATION: &str = "karpenter.sh/provider-id";

pub struct ControllerLoop {
    pub state: Arc<dyn ClusterStateMirror>,
    pub queue: Arc<Queue>,
    pub actuator: Arc<dyn NodeActuator>,
    pub launcher: Arc<dyn Launcher>,
    pub cloud_provider: Arc<dyn CloudProvider>,
    pub oracle: Arc<dyn SchedulingOracle>,
    pub recorder: Arc<dyn EventRecorder>,
    pub clock: Arc<dyn Clock>,
    pub validation_ttl: Duration,
    #[cfg(feature = "metrics")]
    pub metrics: Metrics,
}

impl ControllerLoop {
    /// Runs one tick. Returns `true` if any method produced admitted commands (the
    /// caller may poll again immediately rather than waiting a full `POLL_INTERVAL`).
    pub async fn tick(&self) -> Result<bool, Error> {
        if !self.state.is_synced() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            return Ok(false);
        }

        let snapshot = self.state.snapshot();
        let pools: HashMap<String, NodePool> = snapshot
            .pools
            .iter()
            .map(|p| (p.metadata.name.clone().unwrap_or_default(), p.clone()))
            .collect();

        self.reconcile_queue().await?;
        self.sweep_stale_taints(&snapshot).await?;

        let methods = ordered_methods();
        for method in &methods {
            if self.run_method(method.as_ref(), &snapshot, &pools).await? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Advances every admitted command's state machine one step (spec §4.5). Runs before
    /// the stale-taint sweep so a command that just timed out or completed is untainted
    /// in the same tick rather than the next.
    async fn reconcile_queue(&self) -> Result<(), Error> {
        for id in self.queue.ids() {
            let outcome = self
                .queue
                .reconcile(&id, self.state.as_ref(), self.actuator.as_ref(), self.clock.as_ref(), self.recorder.as_ref())
                .await?;
            #[cfg(feature = "metrics")]
            if let ReconcileOutcome::TimedOut(consolidation_type) = outcome {
                self.metrics.consolidation_timeout(consolidation_type.as_str());
            }
            #[cfg(not(feature = "metrics"))]
            let _ = outcome;
        }
        Ok(())
    }

    async fn sweep_stale_taints(&self, snapshot: &crate::state::Snapshot) -> Result<(), Error> {
        for node in &snapshot.nodes {
            if node.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let node_name = node.metadata.name.clone().unwrap_or_default();
            let tainted = node
                .spec
                .as_ref()
                .and_then(|s| s.taints.as_ref())
                .is_some_and(|ts| ts.iter().any(|t| t.key == taints::DISRUPTED_KEY));
            if !tainted {
                continue;
            }
            let node_provider_id = node
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(PROVIDER_ID_ANNOTATION))
                .map(String::as_str);
            let claim = snapshot
                .node_claims
                .iter()
                .find(|c| c.status.as_ref().and_then(|s| s.provider_id.as_deref()) == node_provider_id);
            let provider_id = claim.and_then(|c| c.status.as_ref()).and_then(|s| s.provider_id.as_deref());
            let in_flight = provider_id.is_some_and(|pid| self.queue.has_any(pid));
            if !in_flight {
                self.actuator.untaint(&node_name).await?;
                if let Some(claim) = claim {
                    let claim_name = claim.metadata.name.clone().unwrap_or_default();
                    self.actuator.clear_disruption_reason(&claim_name).await?;
                }
            }
        }
        Ok(())
    }

    fn build_candidates(
        &self,
        method: &dyn DisruptionMethod,
        snapshot: &crate::state::Snapshot,
        pools: &HashMap<String, NodePool>,
    ) -> Vec<Candidate> {
        let builder = CandidateBuilder { clock: self.clock.as_ref() };
        let class = method.class();
        let mut candidates = Vec::new();

        for claim in &snapshot.node_claims {
            let provider_id = claim.status.as_ref().and_then(|s| s.provider_id.as_deref());
            let Some(node) = provider_id.and_then(|pid| {
                snapshot.nodes.iter().find(|n| {
                    n.metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(PROVIDER_ID_ANNOTATION))
                        .map(String::as_str)
                        == Some(pid)
                })
            }) else {
                continue;
            };
            let pool = pools.get(claim.node_pool());
            let node_name = node.metadata.name.as_deref();
            let pods: Vec<_> = snapshot
                .pods
                .iter()
                .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == node_name)
                .cloned()
                .collect();

            match builder.build(node, claim, pool, &pods, &snapshot.pdbs, &self.queue, class) {
                Ok(candidate) => {
                    let Some(pool) = pool else { continue };
                    if method.should_disrupt(&candidate, pool) {
                        candidates.push(candidate);
                    }
                }
                Err(crate::candidate::CandidateError::CandidateBusy) => {}
                Err(e) => {
                    self.recorder.publish(Event {
                        reason: EventReason::DisruptionBlocked,
                        subject: claim.metadata.name.clone().unwrap_or_default(),
                        message: messages::blocked(&claim.metadata.name.clone().unwrap_or_default(), &e.to_string()),
                    });
                }
            }
        }
        candidates
    }

    async fn run_method(
        &self,
        method: &dyn DisruptionMethod,
        snapshot: &crate::state::Snapshot,
        pools: &HashMap<String, NodePool>,
    ) -> Result<bool, Error> {
        let candidates = self.build_candidates(method, snapshot, pools);
        let reason = method.reason().as_str();

        #[cfg(feature = "metrics")]
        {
            let by_pool: HashMap<&str, i64> = candidates.iter().fold(HashMap::new(), |mut acc, c| {
                *acc.entry(c.pool_name.as_str()).or_insert(0) += 1;
                acc
            });
            let total: i64 = by_pool.values().sum();
            self.metrics.eligible_nodes(reason, total);
        }

        if candidates.is_empty() {
            return Ok(false);
        }

        let pools_vec: Vec<NodePool> = pools.values().cloned().collect();
        let state = self.state.as_ref();
        let budgets = BudgetCalculator::new(self.recorder.as_ref()).compute(
            &pools_vec,
            &|pool: &str| -> PoolCounts { state.pool_counts(pool) },
            &|pool: &str, r: &str| self.queue.candidates_in_flight(pool, r),
            reason,
            self.clock.now(),
        );

        let existing_nodes = snapshot.nodes.clone();
        let ctx = MethodContext {
            budgets: &budgets,
            pools,
            state,
            oracle: self.oracle.as_ref(),
            recorder: self.recorder.as_ref(),
            cloud_provider: self.cloud_provider.as_ref(),
            existing_nodes: &existing_nodes,
            now: self.clock.now(),
        };

        let raw_commands = method.compute_commands(&ctx, candidates);
        let commands: Vec<_> = raw_commands.into_iter().filter(|c| c.decision() != crate::command::Decision::NoOp).collect();
        if commands.is_empty() {
            return Ok(false);
        }

        let validator = Validator { clock: self.clock.as_ref() };
        let mut admitted = false;
        for command in commands {
            #[cfg(feature = "metrics")]
            let _timer = self.metrics.evaluation_timer(reason, method.consolidation_type().as_str());

            match validator.validate(&command, method, &ctx, &self.queue, self.validation_ttl).await {
                Ok(()) => {
                    self.queue
                        .start_command(command, self.actuator.as_ref(), self.launcher.as_ref(), self.recorder.as_ref())
                        .await?;
                    #[cfg(feature = "metrics")]
                    self.metrics.decision_performed(reason);
                    admitted = true;
                }
                Err(_e) => {
                    #[cfg(feature = "metrics")]
                    self.metrics.failed_validation(method.consolidation_type().as_str());
                }
            }
        }

        Ok(admitted)
    }
}

pub fn poll_interval() -> Duration {
    POLL_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;
    use crate::cloud_provider::StaticCloudProvider;
    use crate::events::ConsoleEventRecorder;
    use crate::scheduling::ReferenceOracle;
    use crate::state::{InMemoryClusterStateMirror, Snapshot};
    use crate::testutil::{bare_node, bare_node_claim};
    use nlm_types::conditions;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeActuator {
        untainted: Mutex<Vec<String>>,
        cleared: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl NodeActuator for FakeActuator {
        async fn taint(&self, _node_name: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn untaint(&self, node_name: &str) -> Result<(), Error> {
            self.untainted.lock().unwrap().push(node_name.to_string());
            Ok(())
        }
        async fn set_disruption_reason(&self, _claim_name: &str, _reason: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn clear_disruption_reason(&self, claim_name: &str) -> Result<(), Error> {
            self.cleared.lock().unwrap().push(claim_name.to_string());
            Ok(())
        }
        async fn delete_claim(&self, _claim_name: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    struct FakeLauncher;

    #[async_trait::async_trait]
    impl Launcher for FakeLauncher {
        async fn create(&self, _pool_name: &str, _template: &nlm_types::NodeClaimTemplate) -> Result<String, Error> {
            Ok("nc-new".to_string())
        }
    }

    fn loop_with(actuator: Arc<FakeActuator>) -> ControllerLoop {
        ControllerLoop {
            state: Arc::new(InMemoryClusterStateMirror::default()),
            queue: Arc::new(Queue::new_in_memory()),
            actuator,
            launcher: Arc::new(FakeLauncher),
            cloud_provider: Arc::new(StaticCloudProvider::default()),
            oracle: Arc::new(ReferenceOracle),
            recorder: Arc::new(ConsoleEventRecorder::default()),
            clock: Arc::new(RealClock),
            validation_ttl: Duration::ZERO,
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        }
    }

    #[tokio::test]
    async fn sweep_untaints_node_whose_command_left_the_queue() {
        let actuator = Arc::new(FakeActuator::default());
        let controller = loop_with(actuator.clone());

        let mut node = bare_node("n1", "provider-1");
        node.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            taints: Some(vec![k8s_openapi::api::core::v1::Taint {
                key: taints::DISRUPTED_KEY.to_string(),
                effect: taints::DISRUPTED_EFFECT.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let mut claim = bare_node_claim("nc1", "p", Some("provider-1"));
        claim.status.as_mut().unwrap().conditions.push(nlm_types::ConditionSchema {
            type_: conditions::INITIALIZED.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });

        let snapshot = Snapshot {
            nodes: vec![node],
            node_claims: vec![claim],
            ..Default::default()
        };

        controller.sweep_stale_taints(&snapshot).await.unwrap();

        assert_eq!(actuator.untainted.lock().unwrap().as_slice(), ["n1"]);
        assert_eq!(actuator.cleared.lock().unwrap().as_slice(), ["nc1"]);
    }

    #[tokio::test]
    async fn sweep_leaves_in_flight_node_tainted() {
        let actuator = Arc::new(FakeActuator::default());
        let controller = loop_with(actuator.clone());
        controller.queue.mark_busy_for_test("provider-1");

        let mut node = bare_node("n1", "provider-1");
        node.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            taints: Some(vec![k8s_openapi::api::core::v1::Taint {
                key: taints::DISRUPTED_KEY.to_string(),
                effect: taints::DISRUPTED_EFFECT.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let claim = bare_node_claim("nc1", "p", Some("provider-1"));
        let snapshot = Snapshot {
            nodes: vec![node],
            node_claims: vec![claim],
            ..Default::default()
        };

        controller.sweep_stale_taints(&snapshot).await.unwrap();

        assert!(actuator.untainted.lock().unwrap().is_empty());
    }
}
