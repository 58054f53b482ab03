//! CloudProvider (spec §6): `InstanceTypes(pool) → []InstanceType`. Out of scope to
//! implement for real (the actual instance launching/termination lives in an external
//! plugin); this module carries the trait boundary plus a static reference impl so the
//! consolidation methods have pricing data to reason about in tests.

use crate::util::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    pub capacity_type: String,
    pub zone: String,
    pub price: f64,
    pub available: bool,
    pub reservation_id: Option<String>,
    pub reservation_capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceType {
    pub name: String,
    pub requirements: Vec<nlm_types::Requirement>,
    pub offerings: Vec<Offering>,
    pub resources: std::collections::BTreeMap<String, String>,
}

impl InstanceType {
    pub fn cheapest_available_price(&self) -> Option<f64> {
        self.offerings
            .iter()
            .filter(|o| o.available)
            .map(|o| o.price)
            .fold(None, |acc, p| Some(acc.map_or(p, |a: f64| a.min(p))))
    }
}

pub trait CloudProvider: Send + Sync {
    fn instance_types(&self, pool_name: &str) -> Result<Vec<InstanceType>, Error>;
}

/// Static price table, sufficient to drive `filterSameInstanceType` and the spot-to-spot
/// `>= 15 cheaper options` boundary behavior (see
/// `methods::multi_node_consolidation::spot_to_spot_threshold_met`) in tests.
#[derive(Default, Clone)]
pub struct StaticCloudProvider {
    pub by_pool: std::collections::HashMap<String, Vec<InstanceType>>,
}

impl CloudProvider for StaticCloudProvider {
    fn instance_types(&self, pool_name: &str) -> Result<Vec<InstanceType>, Error> {
        Ok(self.by_pool.get(pool_name).cloned().unwrap_or_default())
    }
}
