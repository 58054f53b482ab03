//! Command / Replacement / Decision (spec §3): the unit of work a disruption method
//! hands to the Validator and then the Orchestration Queue.

use chrono::{DateTime, Utc};
use nlm_types::NodeClaimTemplate;

use crate::candidate::Candidate;
use crate::scheduling::Results;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Replace,
    Delete,
    NoOp,
}

#[derive(Debug, Clone)]
pub struct Replacement {
    pub template: NodeClaimTemplate,
    /// Name the Queue generates for the claim it creates on admit; `None` until admitted.
    pub claim_name: Option<String>,
    pub initialized: bool,
}

impl Replacement {
    pub fn new(template: NodeClaimTemplate) -> Self {
        Replacement {
            template,
            claim_name: None,
            initialized: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Empty,
    Drifted,
    Underutilized,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Empty => "Empty",
            Reason::Drifted => "Drifted",
            Reason::Underutilized => "Underutilized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationType {
    Empty,
    Drift,
    MultiNode,
    SingleNode,
}

impl ConsolidationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsolidationType::Empty => "empty",
            ConsolidationType::Drift => "drift",
            ConsolidationType::MultiNode => "multi",
            ConsolidationType::SingleNode => "single",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub reason: Reason,
    pub consolidation_type: ConsolidationType,
    pub candidates: Vec<Candidate>,
    pub replacements: Vec<Replacement>,
    pub results: Option<Results>,
    /// `(pool, amount)` reserved against that pool's node-count limit via
    /// `ClusterStateMirror::reserve_node_count` when this command was created, released
    /// back to the pool once the Queue retires the command (spec §8 Scenario 6).
    pub reserved_node_count: Option<(String, u32)>,
}

impl Command {
    pub fn new(
        reason: Reason,
        consolidation_type: ConsolidationType,
        candidates: Vec<Candidate>,
        replacements: Vec<Replacement>,
        results: Option<Results>,
        now: DateTime<Utc>,
    ) -> Self {
        Command {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            reason,
            consolidation_type,
            candidates,
            replacements,
            results,
            reserved_node_count: None,
        }
    }

    /// Records the `(pool, amount)` reserved for this command so the Queue can release it
    /// once the command retires.
    pub fn with_reservation(mut self, pool: impl Into<String>, amount: u32) -> Self {
        self.reserved_node_count = Some((pool.into(), amount));
        self
    }

    pub fn decision(&self) -> Decision {
        if self.candidates.is_empty() {
            Decision::NoOp
        } else if self.replacements.is_empty() {
            Decision::Delete
        } else {
            Decision::Replace
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.candidates
            .iter()
            .filter_map(|c| c.provider_id().map(str::to_string))
            .collect()
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.candidates.iter().map(|c| c.pool_name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_candidates_is_noop() {
        let cmd = Command::new(Reason::Empty, ConsolidationType::Empty, vec![], vec![], None, Utc::now());
        assert_eq!(cmd.decision(), Decision::NoOp);
    }
}
