//! Candidate Builder (spec §4.1): turns a state-node into a transient `Candidate` or
//! rejects it with a never-fatal, reason-carrying error.

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use nlm_types::{NodeClaim, NodePool, annotations, labels};
use std::collections::HashMap;

use crate::clock::Clock;
use crate::queue::Queue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisruptionClass {
    /// Never bypasses a PDB-zero-budget or do-not-disrupt pod.
    Graceful,
    /// May bypass blocking pods when the claim carries a `terminationGracePeriod`.
    Eventual,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub node_claim: NodeClaim,
    pub node: Node,
    pub pool_name: String,
    pub instance_type: Option<String>,
    pub zone: Option<String>,
    pub capacity_type: Option<String>,
    pub reschedulable_pods: Vec<Pod>,
    pub disruption_cost: f64,
}

impl Candidate {
    pub fn provider_id(&self) -> Option<&str> {
        self.node_claim.status.as_ref()?.provider_id.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.reschedulable_pods.is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("node is already the subject of a queued command")]
    CandidateBusy,
    #[error("node is not disruptable: {0}")]
    NodeUndisruptable(String),
    #[error("blocked by a pod that cannot be evicted: {0}")]
    BlockedByPod(String),
    #[error("node is not owned by a known pool")]
    PoolUnknown,
}

/// Classification of one pod living on a candidate node.
pub(crate) enum PodClass {
    Ignorable,
    BlockingForEviction(String),
    Reschedulable,
}

pub(crate) fn classify_pod(pod: &Pod, pdbs: &[PodDisruptionBudget]) -> PodClass {
    let terminating = pod.metadata.deletion_timestamp.is_some();
    if terminating {
        return PodClass::Ignorable;
    }
    let is_daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|o| o.kind == "DaemonSet"));
    if is_daemonset {
        return PodClass::Ignorable;
    }
    let is_mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"));
    if is_mirror {
        return PodClass::Ignorable;
    }

    let do_not_disrupt = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::DO_NOT_DISRUPT))
        .is_some_and(|v| v == "true");
    if do_not_disrupt {
        return PodClass::BlockingForEviction("do-not-disrupt annotation".to_string());
    }

    if let Some(pdb) = pdb_for(pod, pdbs)
        && pdb
            .status
            .as_ref()
            .and_then(|s| s.disruptions_allowed)
            .is_some_and(|n| n <= 0)
    {
        let relaxed = pdb
            .spec
            .as_ref()
            .and_then(|s| s.unhealthy_pod_eviction_policy.as_deref())
            == Some("AlwaysAllow")
            && pod
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "False")
                });
        if !relaxed {
            return PodClass::BlockingForEviction(format!(
                "PodDisruptionBudget '{}' has zero disruptions allowed",
                pdb.metadata.name.clone().unwrap_or_default()
            ));
        }
    }

    PodClass::Reschedulable
}

fn pdb_for<'a>(pod: &Pod, pdbs: &'a [PodDisruptionBudget]) -> Option<&'a PodDisruptionBudget> {
    let pod_labels = pod.metadata.labels.as_ref()?;
    pdbs.iter().find(|pdb| {
        pdb.metadata.namespace == pod.metadata.namespace
            && pdb
                .spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .and_then(|s| s.match_labels.as_ref())
                .is_some_and(|ml| ml.iter().all(|(k, v)| pod_labels.get(k) == Some(v)))
    })
}

/// Reschedule cost for one pod. A reference shape: proportional to requested CPU
/// millicores, with a floor so zero-request pods still cost something to move.
fn pod_reschedule_cost(pod: &Pod) -> f64 {
    let millicores: f64 = pod
        .spec
        .as_ref()
        .map(|s| {
            s.containers
                .iter()
                .filter_map(|c| c.resources.as_ref()?.requests.as_ref()?.get("cpu"))
                .map(|q| parse_millicores(&q.0))
                .sum()
        })
        .unwrap_or(0.0);
    millicores.max(10.0)
}

fn parse_millicores(raw: &str) -> f64 {
    if let Some(m) = raw.strip_suffix('m') {
        m.parse().unwrap_or(0.0)
    } else {
        raw.parse::<f64>().unwrap_or(0.0) * 1000.0
    }
}

/// Fraction of a claim's remaining lifetime, from `expireAfter`. `1.0` when the claim
/// has no expiry or the field cannot be parsed.
fn lifetime_remaining_fraction(
    clock: &dyn Clock,
    pool: &NodePool,
    claim: &NodeClaim,
) -> f64 {
    let Some(expire_after) = pool.spec.template.spec.expire_after.as_deref() else {
        return 1.0;
    };
    let Ok(total) = parse_duration::parse(expire_after) else {
        return 1.0;
    };
    let Some(created) = claim.metadata.creation_timestamp.as_ref() else {
        return 1.0;
    };
    let age = clock.since(created.0.with_timezone(&chrono::Utc));
    let remaining = total.saturating_sub(age);
    if total.is_zero() {
        1.0
    } else {
        remaining.as_secs_f64() / total.as_secs_f64()
    }
}

pub struct CandidateBuilder<'a> {
    pub clock: &'a dyn Clock,
}

impl<'a> CandidateBuilder<'a> {
    pub fn build(
        &self,
        node: &Node,
        claim: &NodeClaim,
        pool: Option<&NodePool>,
        pods: &[Pod],
        pdbs: &[PodDisruptionBudget],
        queue: &Queue,
        class: DisruptionClass,
    ) -> Result<Candidate, CandidateError> {
        let provider_id = claim.status.as_ref().and_then(|s| s.provider_id.as_deref());
        if let Some(pid) = provider_id
            && queue.has_any(pid)
        {
            return Err(CandidateError::CandidateBusy);
        }

        let Some(pool) = pool else {
            return Err(CandidateError::PoolUnknown);
        };

        if !claim.is_initialized() {
            return Err(CandidateError::NodeUndisruptable(
                "NodeClaim is not yet Initialized".to_string(),
            ));
        }
        if node.metadata.deletion_timestamp.is_some() {
            return Err(CandidateError::NodeUndisruptable(
                "node is marked for deletion".to_string(),
            ));
        }

        let node_labels: &HashMap<String, String> = node.metadata.labels.as_ref().ok_or_else(|| {
            CandidateError::NodeUndisruptable("node has no labels".to_string())
        })?;
        for required in [labels::INSTANCE_TYPE, labels::CAPACITY_TYPE, labels::ZONE] {
            if !node_labels.contains_key(required) {
                return Err(CandidateError::NodeUndisruptable(format!(
                    "node is missing required label '{required}'"
                )));
            }
        }

        let mut reschedulable = Vec::new();
        let mut blocking: Option<String> = None;
        for pod in pods {
            match classify_pod(pod, pdbs) {
                PodClass::Ignorable => {}
                PodClass::Reschedulable => reschedulable.push(pod.clone()),
                PodClass::BlockingForEviction(reason) => {
                    blocking.get_or_insert(reason.clone());
                    if matches!(class, DisruptionClass::Eventual)
                        && claim.spec.termination_grace_period.is_some()
                    {
                        // Counted for cost accounting only; it will be force-evicted later.
                        reschedulable.push(pod.clone());
                    }
                }
            }
        }

        if let Some(reason) = blocking
            && (matches!(class, DisruptionClass::Graceful) || claim.spec.termination_grace_period.is_none())
        {
            return Err(CandidateError::BlockedByPod(reason));
        }

        let lifetime_fraction = lifetime_remaining_fraction(self.clock, pool, claim);
        let disruption_cost: f64 = reschedulable.iter().map(pod_reschedule_cost).sum::<f64>() * lifetime_fraction;

        Ok(Candidate {
            node_claim: claim.clone(),
            node: node.clone(),
            pool_name: claim.node_pool().to_string(),
            instance_type: node_labels.get(labels::INSTANCE_TYPE).cloned(),
            zone: node_labels.get(labels::ZONE).cloned(),
            capacity_type: node_labels.get(labels::CAPACITY_TYPE).cloned(),
            reschedulable_pods: reschedulable,
            disruption_cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;
    use crate::testutil::{bare_node, bare_node_claim, ready_pool};
    use nlm_types::conditions;

    #[test]
    fn rejects_busy_candidate() {
        let queue = Queue::new_in_memory();
        queue.mark_busy_for_test("provider-1");
        let node = bare_node("n1", "provider-1");
        let mut claim = bare_node_claim("nc1", "p", Some("provider-1"));
        claim.status.as_mut().unwrap().conditions.push(nlm_types::ConditionSchema {
            type_: conditions::INITIALIZED.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });
        let pool = ready_pool("p", true);
        let clock = RealClock;
        let builder = CandidateBuilder { clock: &clock };
        let err = builder
            .build(&node, &claim, Some(&pool), &[], &[], &queue, DisruptionClass::Graceful)
            .unwrap_err();
        assert_eq!(err, CandidateError::CandidateBusy);
    }

    #[test]
    fn rejects_uninitialized_claim() {
        let queue = Queue::new_in_memory();
        let node = bare_node("n1", "provider-1");
        let claim = bare_node_claim("nc1", "p", Some("provider-1"));
        let pool = ready_pool("p", true);
        let clock = RealClock;
        let builder = CandidateBuilder { clock: &clock };
        let err = builder
            .build(&node, &claim, Some(&pool), &[], &[], &queue, DisruptionClass::Graceful)
            .unwrap_err();
        assert!(matches!(err, CandidateError::NodeUndisruptable(_)));
    }
}
