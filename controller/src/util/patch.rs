use super::MANAGER_NAME;
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::ClusterResourceScope,
};
use nlm_types::{ConditionSchema, NodeClaim, NodeClaimStatus, NodePool, NodePoolStatus};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

pub trait Object<S> {
    /// Returns a mutable reference to the status object, initializing it with the
    /// default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

impl Object<NodeClaimStatus> for NodeClaim {
    fn mut_status(&mut self) -> &mut NodeClaimStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Object<NodePoolStatus> for NodePool {
    fn mut_status(&mut self) -> &mut NodePoolStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Both CRDs in this controller are cluster-scoped, unlike the teacher's namespaced
/// `Strim`; `Api::all` replaces `Api::namespaced` accordingly.
pub async fn patch_status<S, T>(client: Client, instance: &T, f: impl FnOnce(&mut S)) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource + Object<S> + Serialize + DeserializeOwned + Debug + Resource<Scope = ClusterResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        let status = modified.mut_status();
        f(status);
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let api: Api<T> = Api::all(client);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}

/// Sets (or replaces) a single condition by type, bumping `lastTransitionTime` only when
/// the status actually changes — mirrors standard Kubernetes condition semantics.
pub fn set_condition(conditions: &mut Vec<ConditionSchema>, type_: &str, status: bool, reason: &str, message: &str) {
    let status_str = if status { "True" } else { "False" };
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status_str {
            existing.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
        }
        existing.status = status_str.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
    } else {
        conditions.push(ConditionSchema {
            type_: type_.to_string(),
            status: status_str.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        });
    }
}

pub fn clear_condition(conditions: &mut Vec<ConditionSchema>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}
