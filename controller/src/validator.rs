//! Validator (spec §4.4): re-proves a Command after a settling TTL before it is admitted
//! to the Orchestration Queue.

use nlm_types::NodePool;

use std::time::Duration;

use crate::candidate::{PodClass, classify_pod};
use crate::clock::Clock;
use crate::command::Command;
use crate::methods::{DisruptionMethod, MethodContext};
use crate::queue::Queue;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("candidate NodeClaim no longer exists")]
    CandidateMissing,
    #[error("candidate's pool is no longer known")]
    PoolUnknown,
    #[error("candidate is no longer eligible for this method")]
    NoLongerEligible,
    #[error("candidate was admitted to the queue by another pass")]
    AlreadyQueued,
    #[error("a pod bound to the candidate during the settling window: {0}")]
    PodChurn(String),
    #[error("a pending pod was nominated to schedule onto the candidate node: {0}")]
    NodeNominated(String),
    #[error("re-simulation no longer schedules all displaced pods")]
    SimulationRegressed,
}

pub struct Validator<'a> {
    pub clock: &'a dyn Clock,
}

impl<'a> Validator<'a> {
    /// Sleeps `ttl`, then re-derives eligibility and re-simulates against the latest
    /// snapshot. Zero `ttl` returns immediately — used in fast test/drift paths.
    pub async fn validate(
        &self,
        command: &Command,
        method: &dyn DisruptionMethod,
        ctx: &MethodContext<'_>,
        queue: &Queue,
        ttl: Duration,
    ) -> Result<(), ValidationError> {
        self.clock.sleep(ttl).await;

        let snapshot = ctx.state.snapshot();

        for candidate in &command.candidates {
            if let Some(pid) = candidate.provider_id()
                && queue.has_any(pid)
            {
                return Err(ValidationError::AlreadyQueued);
            }

            let still_present = snapshot
                .node_claims
                .iter()
                .any(|c| c.metadata.name == candidate.node_claim.metadata.name);
            if !still_present {
                return Err(ValidationError::CandidateMissing);
            }

            let pool: &NodePool = ctx
                .pools
                .get(&candidate.pool_name)
                .ok_or(ValidationError::PoolUnknown)?;
            if !method.should_disrupt(candidate, pool) {
                return Err(ValidationError::NoLongerEligible);
            }

            let node_name = candidate.node.metadata.name.as_deref();
            for pod in snapshot
                .pods
                .iter()
                .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == node_name)
            {
                let newly_blocking = matches!(classify_pod(pod, &snapshot.pdbs), PodClass::BlockingForEviction(_))
                    && !candidate
                        .reschedulable_pods
                        .iter()
                        .any(|known| known.metadata.name == pod.metadata.name);
                if newly_blocking {
                    return Err(ValidationError::PodChurn(pod.metadata.name.clone().unwrap_or_default()));
                }
            }

            // A pod nominated onto this node since the TTL began means the scheduler is
            // already counting on it staying; re-disrupting it would fight the scheduler.
            if node_name.is_some()
                && let Some(pod) = snapshot
                    .pods
                    .iter()
                    .find(|p| p.status.as_ref().and_then(|s| s.nominated_node_name.as_deref()) == node_name)
            {
                return Err(ValidationError::NodeNominated(pod.metadata.name.clone().unwrap_or_default()));
            }
        }

        if !command.replacements.is_empty() {
            let removed_names: Vec<String> = command
                .candidates
                .iter()
                .map(|c| c.node.metadata.name.clone().unwrap_or_default())
                .collect();
            let pending: Vec<_> = command
                .candidates
                .iter()
                .flat_map(|c| c.reschedulable_pods.clone())
                .collect();
            let pools_vec: Vec<NodePool> = ctx.pools.values().cloned().collect();
            let results = ctx.oracle.simulate(ctx.existing_nodes, &removed_names, &pending, &pools_vec);
            if !results.all_non_pending_pods_scheduled() {
                return Err(ValidationError::SimulationRegressed);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::default_recorder;
    use crate::cloud_provider::StaticCloudProvider;
    use crate::clock::VirtualClock;
    use crate::command::{ConsolidationType, Reason};
    use crate::methods::emptiness::Emptiness;
    use crate::scheduling::ReferenceOracle;
    use crate::state::{InMemoryClusterStateMirror, Snapshot};
    use crate::testutil::{bare_node, bare_node_claim, empty_candidate, ready_pool};
    use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use nlm_types::conditions;
    use std::collections::HashMap;

    fn settled_candidate(name: &str, pool: &str) -> crate::candidate::Candidate {
        let mut candidate = empty_candidate(name, pool, true);
        // Give it a matching, already-Initialized claim in the snapshot so only the
        // pod re-checks can fail it.
        candidate.node_claim = bare_node_claim(name, pool, Some("provider-x"));
        candidate.node_claim.status.as_mut().unwrap().conditions.push(nlm_types::ConditionSchema {
            type_: conditions::INITIALIZED.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });
        candidate.node_claim.status.as_mut().unwrap().conditions.push(nlm_types::ConditionSchema {
            type_: conditions::CONSOLIDATABLE.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });
        candidate.node = bare_node(name, "provider-x");
        candidate
    }

    #[test]
    fn zero_ttl_candidate_missing_from_snapshot_fails() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let clock = VirtualClock::new(chrono::Utc::now());
            let validator = Validator { clock: &clock };
            let method = Emptiness::default();
            let queue = Queue::new_in_memory();
            let state = InMemoryClusterStateMirror::default();
            let oracle = ReferenceOracle;
            let recorder = default_recorder();
            let cloud_provider = StaticCloudProvider::default();
            let mut pools = HashMap::new();
            pools.insert("p".to_string(), ready_pool("p", false));
            let budgets = HashMap::new();
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
            let candidate = empty_candidate("nc1", "p", true);
            let command = Command::new(Reason::Empty, ConsolidationType::Empty, vec![candidate], vec![], None, ctx.now);
            let err = validator
                .validate(&command, &method, &ctx, &queue, Duration::ZERO)
                .await
                .unwrap_err();
            assert_eq!(err, ValidationError::CandidateMissing);
        });
    }

    #[test]
    fn pod_newly_blocked_by_zero_budget_pdb_fails_revalidation() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let clock = VirtualClock::new(chrono::Utc::now());
            let validator = Validator { clock: &clock };
            let method = Emptiness::default();
            let queue = Queue::new_in_memory();
            let state = InMemoryClusterStateMirror::default();
            let oracle = ReferenceOracle;
            let recorder = default_recorder();
            let cloud_provider = StaticCloudProvider::default();
            let mut pools = HashMap::new();
            pools.insert("p".to_string(), ready_pool("p", false));
            let budgets = HashMap::new();
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

            let candidate = settled_candidate("nc1", "p");
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some("pod-a".to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    node_name: Some("nc1".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let pdb = k8s_openapi::api::policy::v1::PodDisruptionBudget {
                metadata: ObjectMeta {
                    name: Some("pdb-a".to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::policy::v1::PodDisruptionBudgetSpec {
                    selector: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                        match_labels: Some(std::collections::BTreeMap::new()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                status: Some(k8s_openapi::api::policy::v1::PodDisruptionBudgetStatus {
                    disruptions_allowed: Some(0),
                    ..Default::default()
                }),
            };
            state.replace(Snapshot {
                node_claims: vec![candidate.node_claim.clone()],
                pdbs: vec![pdb],
                pods: vec![pod],
                ..Default::default()
            });

            let command = Command::new(Reason::Empty, ConsolidationType::Empty, vec![candidate], vec![], None, ctx.now);
            let err = validator
                .validate(&command, &method, &ctx, &queue, Duration::ZERO)
                .await
                .unwrap_err();
            assert!(matches!(err, ValidationError::PodChurn(_)));
        });
    }

    #[test]
    fn node_nominated_for_a_pending_pod_fails_revalidation() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let clock = VirtualClock::new(chrono::Utc::now());
            let validator = Validator { clock: &clock };
            let method = Emptiness::default();
            let queue = Queue::new_in_memory();
            let state = InMemoryClusterStateMirror::default();
            let oracle = ReferenceOracle;
            let recorder = default_recorder();
            let cloud_provider = StaticCloudProvider::default();
            let mut pools = HashMap::new();
            pools.insert("p".to_string(), ready_pool("p", false));
            let budgets = HashMap::new();
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

            let candidate = settled_candidate("nc1", "p");
            let nominated_pod = Pod {
                metadata: ObjectMeta {
                    name: Some("pending-pod".to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
                status: Some(PodStatus {
                    nominated_node_name: Some("nc1".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            };
            state.replace(Snapshot {
                node_claims: vec![candidate.node_claim.clone()],
                pods: vec![nominated_pod],
                ..Default::default()
            });

            let command = Command::new(Reason::Empty, ConsolidationType::Empty, vec![candidate], vec![], None, ctx.now);
            let err = validator
                .validate(&command, &method, &ctx, &queue, Duration::ZERO)
                .await
                .unwrap_err();
            assert!(matches!(err, ValidationError::NodeNominated(_)));
        });
    }
}
