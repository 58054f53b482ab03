use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod labels {
    pub const NODEPOOL: &str = "karpenter.sh/nodepool";
    pub const CAPACITY_TYPE: &str = "karpenter.sh/capacity-type";
    pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
    pub const ZONE: &str = "topology.kubernetes.io/zone";
    pub const RESERVATION_ID: &str = "karpenter.sh/reservation-id";
}

pub mod annotations {
    pub const DO_NOT_DISRUPT: &str = "karpenter.sh/do-not-disrupt";
}

pub mod taints {
    /// Key of the taint applied to a Node while a disruption command is in flight.
    pub const DISRUPTED_KEY: &str = "karpenter.sh/disrupted";
    pub const DISRUPTED_EFFECT: &str = "NoSchedule";
}

/// Well-known `NodeClaim` condition types. The controller only ever reads `Drifted`,
/// `Consolidatable`, and `Initialized`; it writes `DisruptionReason`.
pub mod conditions {
    pub const DRIFTED: &str = "Drifted";
    pub const CONSOLIDATABLE: &str = "Consolidatable";
    pub const INITIALIZED: &str = "Initialized";
    pub const DISRUPTION_REASON: &str = "DisruptionReason";
}

/// A single requirement constraining which instance types/zones/capacity-types a
/// `NodeClaim` may be launched with. Mirrors a Kubernetes node affinity term closely
/// enough for the controller's purposes without pulling in the full affinity API.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Requirement {
    pub key: String,
    pub operator: RequirementOperator,
    #[serde(default)]
    pub values: Vec<String>,
    /// Minimum number of distinct values that must remain for this key after any
    /// narrowing (e.g. `filterSameInstanceType`) for a replacement to stay valid.
    #[serde(default)]
    pub min_values: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum RequirementOperator {
    #[default]
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Requirement {
    pub fn matches(&self, value: Option<&str>) -> bool {
        match self.operator {
            RequirementOperator::Exists => value.is_some(),
            RequirementOperator::DoesNotExist => value.is_none(),
            RequirementOperator::In => value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            RequirementOperator::NotIn => value.is_none_or(|v| !self.values.iter().any(|x| x == v)),
        }
    }
}

/// `spec.limits` on a `NodePool`: a cap on the total number of `NodeClaim`s the pool may
/// own at once, across running + pending-disruption + reserved-for-launch.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Limits {
    pub nodes: Option<u32>,
}

/// One entry of `spec.disruption.budgets`. `nodes` is either a bare integer ("5") or a
/// percentage ("30%"), parsed by [`Budget::allowance`].
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Budget {
    pub nodes: String,
    #[serde(default)]
    pub reasons: Option<Vec<String>>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

impl Budget {
    /// Does this budget apply to the given disruption reason? A budget with no `reasons`
    /// filter applies to every reason.
    pub fn applies_to(&self, reason: &str) -> bool {
        self.reasons
            .as_ref()
            .is_none_or(|rs| rs.iter().any(|r| r == reason))
    }

    /// Does this budget's schedule window include `now`? A budget with no `schedule`
    /// always applies. `schedule` is a standard 5-field cron expression (minute hour
    /// day-of-month month day-of-week) naming the window's recurring start instant;
    /// `duration` (parsed the same way as `consolidateAfter`) is how long the window
    /// stays open afterward. A missing `duration` collapses the window to the
    /// triggering minute itself. An unparseable `schedule` never applies (treated the
    /// same as a misconfigured budget).
    pub fn in_schedule_window(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(schedule) = self.schedule.as_deref() else {
            return true;
        };
        let Some(fields) = CronFields::parse(schedule) else {
            return false;
        };
        let duration = self
            .duration
            .as_deref()
            .and_then(|d| parse_duration::parse(d).ok())
            .unwrap_or_default();

        let minute = chrono::Duration::minutes(1);
        let mut candidate = now;
        let mut elapsed = std::time::Duration::ZERO;
        loop {
            if fields.matches(&candidate) {
                return true;
            }
            if elapsed >= duration {
                return false;
            }
            candidate -= minute;
            elapsed += std::time::Duration::from_secs(60);
        }
    }

    /// Resolves `nodes` against a current pool size, rounding percentages half-up.
    /// Returns `None` if the value cannot be parsed (an invalid/misconfigured budget,
    /// handled per spec.md §7: never fatal, logged once per tick).
    pub fn allowance(&self, current_pool_size: u32) -> Option<u32> {
        let trimmed = self.nodes.trim();
        if let Some(pct) = trimmed.strip_suffix('%') {
            let pct: f64 = pct.trim().parse().ok()?;
            if pct < 0.0 {
                return None;
            }
            let raw = (current_pool_size as f64) * pct / 100.0;
            Some(raw.round() as u32)
        } else {
            trimmed.parse().ok()
        }
    }
}

/// A parsed standard 5-field cron expression (minute hour day-of-month month
/// day-of-week), used only to evaluate [`Budget::in_schedule_window`].
struct CronFields {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

enum CronField {
    Any,
    List(Vec<u32>),
}

impl CronField {
    fn parse(raw: &str) -> Option<Self> {
        if raw == "*" {
            return Some(CronField::Any);
        }
        raw.split(',').map(|v| v.trim().parse().ok()).collect::<Option<Vec<u32>>>().map(CronField::List)
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::List(values) => values.contains(&value),
        }
    }
}

impl CronFields {
    fn parse(expr: &str) -> Option<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return None;
        }
        Some(CronFields {
            minute: CronField::parse(parts[0])?,
            hour: CronField::parse(parts[1])?,
            day_of_month: CronField::parse(parts[2])?,
            month: CronField::parse(parts[3])?,
            day_of_week: CronField::parse(parts[4])?,
        })
    }

    fn matches(&self, t: &chrono::DateTime<chrono::Utc>) -> bool {
        use chrono::{Datelike, Timelike};
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum ConsolidationPolicy {
    #[default]
    WhenEmpty,
    WhenEmptyOrUnderutilized,
}

/// `spec.disruption.consolidateAfter`. `Never` disables underutilized consolidation for
/// the pool (see spec.md §9's Open Question) while emptiness-only disruption still runs.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConsolidateAfter {
    #[default]
    Never,
    Duration(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DisruptionSpec {
    #[serde(default)]
    pub budgets: Vec<Budget>,
    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,
    #[serde(default)]
    pub consolidate_after: ConsolidateAfter,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeClaimTemplateSpec {
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    pub termination_grace_period: Option<String>,
    pub expire_after: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeClaimTemplate {
    pub spec: NodeClaimTemplateSpec,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "karpenter.sh",
    version = "v1",
    kind = "NodePool",
    plural = "nodepools",
    derive = "PartialEq",
    status = "NodePoolStatus"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.replicas\", \"name\": \"REPLICAS\", \"type\": \"string\" }"
)]
pub struct NodePoolSpec {
    /// `nil` for a dynamic pool; an explicit non-negative count for a static pool.
    pub replicas: Option<i32>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub disruption: DisruptionSpec,
    pub template: NodeClaimTemplate,
}

impl NodePool {
    pub fn is_static(&self) -> bool {
        self.spec.replicas.is_some()
    }

    pub fn is_dynamic(&self) -> bool {
        !self.is_static()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct NodePoolStatus {
    #[serde(default)]
    pub conditions: Vec<ConditionSchema>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "karpenter.sh",
    version = "v1",
    kind = "NodeClaim",
    plural = "nodeclaims",
    derive = "PartialEq",
    status = "NodeClaimStatus"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.providerID\", \"name\": \"PROVIDER-ID\", \"type\": \"string\" }"
)]
pub struct NodeClaimSpec {
    pub node_pool: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    pub termination_grace_period: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct NodeClaimStatus {
    pub provider_id: Option<String>,
    #[serde(default)]
    pub allocatable: BTreeMap<String, String>,
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,
    #[serde(default)]
    pub conditions: Vec<ConditionSchema>,
}

/// `k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition` does not derive
/// `JsonSchema`, so the controller mirrors its shape for CRD status fields and converts
/// at the boundary. Field names match the upstream type exactly.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct ConditionSchema {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: Option<String>,
}

impl ConditionSchema {
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

impl From<Condition> for ConditionSchema {
    fn from(c: Condition) -> Self {
        ConditionSchema {
            type_: c.type_,
            status: c.status,
            reason: c.reason,
            message: c.message,
            last_transition_time: Some(c.last_transition_time.0.to_rfc3339()),
        }
    }
}

impl NodeClaim {
    pub fn condition(&self, type_: &str) -> Option<&ConditionSchema> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
    }

    pub fn condition_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(ConditionSchema::is_true)
    }

    pub fn is_drifted(&self) -> bool {
        self.condition_true(conditions::DRIFTED)
    }

    pub fn is_consolidatable(&self) -> bool {
        self.condition_true(conditions::CONSOLIDATABLE)
    }

    pub fn is_initialized(&self) -> bool {
        self.condition_true(conditions::INITIALIZED)
    }

    pub fn drifted_transition_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let c = self.condition(conditions::DRIFTED)?;
        if !c.is_true() {
            return None;
        }
        c.last_transition_time
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }

    pub fn node_pool(&self) -> &str {
        &self.spec.node_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_budget_rounds_half_up() {
        let b = Budget {
            nodes: "30%".to_string(),
            reasons: None,
            schedule: None,
            duration: None,
        };
        assert_eq!(b.allowance(10), Some(3));
        // 0.5 rounds up.
        let b = Budget {
            nodes: "50%".to_string(),
            ..b
        };
        assert_eq!(b.allowance(1), Some(1));
    }

    #[test]
    fn zero_percent_budget_is_zero() {
        let b = Budget {
            nodes: "0%".to_string(),
            reasons: None,
            schedule: None,
            duration: None,
        };
        assert_eq!(b.allowance(1000), Some(0));
    }

    #[test]
    fn integer_budget_ignores_pool_size() {
        let b = Budget {
            nodes: "5".to_string(),
            reasons: None,
            schedule: None,
            duration: None,
        };
        assert_eq!(b.allowance(2), Some(5));
    }

    #[test]
    fn invalid_budget_is_none_not_panic() {
        let b = Budget {
            nodes: "garbage".to_string(),
            reasons: None,
            schedule: None,
            duration: None,
        };
        assert_eq!(b.allowance(10), None);
    }

    #[test]
    fn budget_reason_filter() {
        let b = Budget {
            nodes: "10".to_string(),
            reasons: Some(vec!["Drifted".to_string()]),
            schedule: None,
            duration: None,
        };
        assert!(b.applies_to("Drifted"));
        assert!(!b.applies_to("Empty"));
    }

    #[test]
    fn static_pool_detection() {
        let mut pool = NodePool::new("p", NodePoolSpec::default());
        assert!(pool.is_dynamic());
        pool.spec.replicas = Some(3);
        assert!(pool.is_static());
    }

    #[test]
    fn requirement_in_matches_listed_values() {
        let r = Requirement {
            key: labels::INSTANCE_TYPE.to_string(),
            operator: RequirementOperator::In,
            values: vec!["m5.large".to_string(), "m5.xlarge".to_string()],
            min_values: None,
        };
        assert!(r.matches(Some("m5.large")));
        assert!(!r.matches(Some("c5.large")));
        assert!(!r.matches(None));
    }
}
