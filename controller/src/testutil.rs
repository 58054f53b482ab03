//! Shared fixtures for unit tests across this crate. Cheap, hand-built objects rather
//! than fixture files, matching the inline-builder style the rest of the suite uses.

#![cfg(test)]

use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, Pod, PodSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use nlm_types::{ConditionSchema, ConsolidateAfter, DisruptionSpec, NodeClaim, NodeClaimSpec, NodeClaimStatus, NodePool, NodePoolSpec, conditions, labels};
use std::collections::BTreeMap;

use crate::candidate::Candidate;

pub fn bare_node(name: &str, provider_id: &str) -> Node {
    let mut node_labels = BTreeMap::new();
    node_labels.insert(labels::INSTANCE_TYPE.to_string(), "m5.large".to_string());
    node_labels.insert(labels::CAPACITY_TYPE.to_string(), "on-demand".to_string());
    node_labels.insert(labels::ZONE.to_string(), "us-east-1a".to_string());
    let mut annotations = BTreeMap::new();
    annotations.insert("karpenter.sh/provider-id".to_string(), provider_id.to_string());
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(node_labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn bare_node_with_cpu(name: &str, millicores: f64) -> Node {
    let mut node = bare_node(name, "provider-x");
    let mut allocatable = BTreeMap::new();
    allocatable.insert("cpu".to_string(), Quantity(format!("{millicores}m")));
    node.status = Some(NodeStatus {
        allocatable: Some(allocatable),
        ..Default::default()
    });
    node
}

pub fn bare_pod_with_cpu(name: &str, millicores: f64) -> Pod {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(format!("{millicores}m")));
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn bare_node_claim(name: &str, pool: &str, provider_id: Option<&str>) -> NodeClaim {
    let mut claim = NodeClaim::new(
        name,
        NodeClaimSpec {
            node_pool: pool.to_string(),
            requirements: vec![],
            termination_grace_period: None,
        },
    );
    claim.status = Some(NodeClaimStatus {
        provider_id: provider_id.map(str::to_string),
        ..Default::default()
    });
    claim
}

fn with_condition(mut claim: NodeClaim, type_: &str) -> NodeClaim {
    let status = claim.status.get_or_insert_with(Default::default);
    status.conditions.push(ConditionSchema {
        type_: type_.to_string(),
        status: "True".to_string(),
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        ..Default::default()
    });
    claim
}

/// A static (`replicas` set) or dynamic pool ready for Emptiness/Drift tests: consolidation
/// is enabled (`consolidateAfter` a concrete duration, not `Never`).
pub fn ready_pool(name: &str, is_static: bool) -> NodePool {
    let mut pool = NodePool::new(
        name,
        NodePoolSpec {
            replicas: if is_static { Some(3) } else { None },
            disruption: DisruptionSpec {
                consolidate_after: ConsolidateAfter::Duration("0s".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    pool.metadata.name = Some(name.to_string());
    pool
}

pub fn static_pool(name: &str, replicas: i32, node_limit: Option<u32>) -> NodePool {
    let mut pool = NodePool::new(
        name,
        NodePoolSpec {
            replicas: Some(replicas),
            limits: nlm_types::Limits { nodes: node_limit },
            ..Default::default()
        },
    );
    pool.metadata.name = Some(name.to_string());
    pool
}

fn base_candidate(claim_name: &str, pool: &str) -> Candidate {
    let node = bare_node(claim_name, "provider-x");
    let claim = bare_node_claim(claim_name, pool, Some("provider-x"));
    let claim = with_condition(claim, conditions::INITIALIZED);
    Candidate {
        node_claim: claim,
        node,
        pool_name: pool.to_string(),
        instance_type: Some("m5.large".to_string()),
        zone: Some("us-east-1a".to_string()),
        capacity_type: Some("on-demand".to_string()),
        reschedulable_pods: vec![],
        disruption_cost: 0.0,
    }
}

pub fn empty_candidate(claim_name: &str, pool: &str, consolidatable: bool) -> Candidate {
    let mut candidate = base_candidate(claim_name, pool);
    if consolidatable {
        candidate.node_claim = with_condition(candidate.node_claim, conditions::CONSOLIDATABLE);
    }
    candidate
}

pub fn drifted_candidate(claim_name: &str, pool: &str) -> Candidate {
    let mut candidate = base_candidate(claim_name, pool);
    candidate.node_claim = with_condition(candidate.node_claim, conditions::DRIFTED);
    candidate.reschedulable_pods = vec![bare_pod_with_cpu("pod", 50.0)];
    candidate.disruption_cost = 50.0;
    candidate
}

pub fn consolidatable_candidate(claim_name: &str, pool: &str, cost: f64) -> Candidate {
    let mut candidate = base_candidate(claim_name, pool);
    candidate.node_claim = with_condition(candidate.node_claim, conditions::CONSOLIDATABLE);
    candidate.reschedulable_pods = vec![bare_pod_with_cpu("pod", cost)];
    candidate.disruption_cost = cost;
    candidate
}
