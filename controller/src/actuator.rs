//! Kube-backed `NodeActuator`/`Launcher` (spec §4.5 actuation): the production
//! counterparts of the in-memory fakes `queue.rs`'s tests and `controller_loop.rs`'s
//! tests use.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use nlm_types::{NodeClaim, NodeClaimSpec, NodeClaimTemplate, conditions, taints};

use crate::queue::{Launcher, NodeActuator};
use crate::util::patch::{clear_condition, patch_status, set_condition};
use crate::util::{Error, MANAGER_NAME};

pub struct KubeNodeActuator {
    client: Client,
}

impl KubeNodeActuator {
    pub fn new(client: Client) -> Self {
        KubeNodeActuator { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn claims(&self) -> Api<NodeClaim> {
        Api::all(self.client.clone())
    }
}

async fn patch_taints(api: &Api<Node>, node_name: &str, f: impl FnOnce(&mut Vec<Taint>)) -> Result<(), Error> {
    let node = api.get(node_name).await?;
    let mut modified = node.clone();
    let list = modified.spec.get_or_insert_with(Default::default).taints.get_or_insert_with(Vec::new);
    f(list);
    let patch = Patch::Json::<Node>(json_patch::diff(
        &serde_json::to_value(&node)?,
        &serde_json::to_value(&modified)?,
    ));
    api.patch(node_name, &PatchParams::apply(MANAGER_NAME), &patch).await?;
    Ok(())
}

#[async_trait]
impl NodeActuator for KubeNodeActuator {
    async fn taint(&self, node_name: &str) -> Result<(), Error> {
        let api = self.nodes();
        patch_taints(&api, node_name, |list| {
            if !list.iter().any(|t| t.key == taints::DISRUPTED_KEY) {
                list.push(Taint {
                    key: taints::DISRUPTED_KEY.to_string(),
                    effect: taints::DISRUPTED_EFFECT.to_string(),
                    value: None,
                    time_added: None,
                });
            }
        })
        .await
    }

    async fn untaint(&self, node_name: &str) -> Result<(), Error> {
        let api = self.nodes();
        patch_taints(&api, node_name, |list| {
            list.retain(|t| t.key != taints::DISRUPTED_KEY);
        })
        .await
    }

    async fn set_disruption_reason(&self, claim_name: &str, reason: &str) -> Result<(), Error> {
        let claim = self.claims().get(claim_name).await?;
        patch_status(self.client.clone(), &claim, |status| {
            set_condition(&mut status.conditions, conditions::DISRUPTION_REASON, true, reason, reason);
        })
        .await?;
        Ok(())
    }

    async fn clear_disruption_reason(&self, claim_name: &str) -> Result<(), Error> {
        let claim = self.claims().get(claim_name).await?;
        patch_status(self.client.clone(), &claim, |status| {
            clear_condition(&mut status.conditions, conditions::DISRUPTION_REASON);
        })
        .await?;
        Ok(())
    }

    async fn delete_claim(&self, claim_name: &str) -> Result<(), Error> {
        self.claims().delete(claim_name, &Default::default()).await?;
        Ok(())
    }
}

pub struct KubeLauncher {
    client: Client,
}

impl KubeLauncher {
    pub fn new(client: Client) -> Self {
        KubeLauncher { client }
    }
}

#[async_trait]
impl Launcher for KubeLauncher {
    async fn create(&self, pool_name: &str, template: &NodeClaimTemplate) -> Result<String, Error> {
        let name = format!("{pool_name}-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let claim = NodeClaim::new(
            &name,
            NodeClaimSpec {
                node_pool: pool_name.to_string(),
                requirements: template.spec.requirements.clone(),
                termination_grace_period: template.spec.termination_grace_period.clone(),
            },
        );
        let created = self.claims().create(&PostParams::default(), &claim).await?;
        Ok(created.metadata.name.unwrap_or(name))
    }
}
