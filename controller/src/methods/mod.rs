//! The five disruption methods (spec §4.3), tried in this fixed order every tick. The
//! first method to return a non-empty command list wins; later methods are skipped for
//! that tick (spec §4.6 step 3).

pub mod drift;
pub mod emptiness;
pub mod multi_node_consolidation;
pub mod single_node_consolidation;
pub mod static_drift;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use nlm_types::NodePool;
use std::collections::HashMap;

use crate::candidate::{Candidate, DisruptionClass};
use crate::cloud_provider::CloudProvider;
use crate::command::{Command, ConsolidationType, Reason};
use crate::events::EventRecorder;
use crate::scheduling::SchedulingOracle;
use crate::state::ClusterStateMirror;

pub struct MethodContext<'a> {
    pub budgets: &'a HashMap<String, u32>,
    pub pools: &'a HashMap<String, NodePool>,
    pub state: &'a dyn ClusterStateMirror,
    pub oracle: &'a dyn SchedulingOracle,
    pub recorder: &'a dyn EventRecorder,
    pub cloud_provider: &'a dyn CloudProvider,
    pub existing_nodes: &'a [Node],
    pub now: DateTime<Utc>,
}

pub trait DisruptionMethod: Send + Sync {
    fn reason(&self) -> Reason;
    fn class(&self) -> DisruptionClass;
    fn consolidation_type(&self) -> ConsolidationType;
    fn should_disrupt(&self, candidate: &Candidate, pool: &NodePool) -> bool;
    fn compute_commands(&self, ctx: &MethodContext, candidates: Vec<Candidate>) -> Vec<Command>;
}

/// Canonical priority order. Construction order, not configuration, decides priority
/// (spec §9 "Polymorphic method set").
pub fn ordered_methods() -> Vec<Box<dyn DisruptionMethod>> {
    vec![
        Box::new(emptiness::Emptiness::default()),
        Box::new(static_drift::StaticDrift),
        Box::new(drift::Drift),
        Box::new(multi_node_consolidation::MultiNodeConsolidation::default()),
        Box::new(single_node_consolidation::SingleNodeConsolidation::default()),
    ]
}
