//! Orchestration Queue (spec §4.5): per-command state machine plus the `providerID ->
//! Command` index enforcing `HasAny`.

use nlm_types::NodeClaimTemplate;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::Clock;
use crate::command::{Command, ConsolidationType};
use crate::events::{Event, EventReason, EventRecorder};
use crate::state::{ClusterStateMirror, Snapshot};
use crate::util::{Error, messages};

#[async_trait::async_trait]
pub trait NodeActuator: Send + Sync {
    async fn taint(&self, node_name: &str) -> Result<(), Error>;
    async fn untaint(&self, node_name: &str) -> Result<(), Error>;
    async fn set_disruption_reason(&self, claim_name: &str, reason: &str) -> Result<(), Error>;
    async fn clear_disruption_reason(&self, claim_name: &str) -> Result<(), Error>;
    async fn delete_claim(&self, claim_name: &str) -> Result<(), Error>;
}

#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
    /// Creates a NodeClaim owned by `pool_name` from `template` and returns its generated
    /// name.
    async fn create(&self, pool_name: &str, template: &NodeClaimTemplate) -> Result<String, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    AwaitingReplacements,
    Deleting,
    Untainting,
}

struct Entry {
    command: Command,
    state: QueueState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Not all replacements are ready yet; caller should requeue the command.
    Waiting,
    /// Replacements ready, originals deleted, command retired.
    Done,
    /// Exceeded `MaxRetryDuration`; taint removed, candidates survive.
    TimedOut(ConsolidationType),
    /// The command id is not (or no longer) in the queue.
    NotFound,
}

/// `clamp(queueLen * 80ms, 10min, 1hour)` (spec §4.5).
pub fn max_retry_duration(queue_len: usize) -> Duration {
    let raw = Duration::from_millis(queue_len as u64 * 80);
    raw.clamp(Duration::from_secs(600), Duration::from_secs(3600))
}

#[derive(Default)]
pub struct Queue {
    index: Mutex<HashMap<String, Entry>>,
    by_provider_id: Mutex<HashMap<String, String>>,
}

impl Queue {
    pub fn new_in_memory() -> Self {
        Queue::default()
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_any(&self, provider_id: &str) -> bool {
        self.by_provider_id.lock().unwrap().contains_key(provider_id)
    }

    /// Ids of every command currently admitted, for the controller loop to drive through
    /// `reconcile` each tick.
    pub fn ids(&self) -> Vec<String> {
        self.index.lock().unwrap().keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn mark_busy_for_test(&self, provider_id: &str) {
        self.by_provider_id
            .lock()
            .unwrap()
            .insert(provider_id.to_string(), "test".to_string());
    }

    pub fn candidates_in_flight(&self, pool: &str, reason: &str) -> u32 {
        self.index
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.command.reason.as_str() == reason)
            .flat_map(|e| &e.command.candidates)
            .filter(|c| c.pool_name == pool)
            .count() as u32
    }

    /// Admit (`StartCommand`): taint candidates, set `DisruptionReason`, launch
    /// replacements, register the command.
    pub async fn start_command(
        &self,
        mut command: Command,
        actuator: &dyn NodeActuator,
        launcher: &dyn Launcher,
        recorder: &dyn EventRecorder,
    ) -> Result<(), Error> {
        for candidate in &command.candidates {
            let node_name = candidate.node.metadata.name.clone().unwrap_or_default();
            actuator.taint(&node_name).await?;
            let claim_name = candidate.node_claim.metadata.name.clone().unwrap_or_default();
            actuator
                .set_disruption_reason(&claim_name, command.reason.as_str())
                .await?;
        }

        let pool_name = command.pool_names().first().cloned().unwrap_or_default();
        for replacement in &mut command.replacements {
            let name = launcher.create(&pool_name, &replacement.template).await?;
            recorder.publish(Event {
                reason: EventReason::DisruptionLaunching,
                subject: name.clone(),
                message: messages::launching(&name),
            });
            replacement.claim_name = Some(name);
        }

        let id = command.id.clone();
        let provider_ids = command.provider_ids();
        self.index.lock().unwrap().insert(
            id.clone(),
            Entry {
                command,
                state: QueueState::AwaitingReplacements,
            },
        );
        let mut by_pid = self.by_provider_id.lock().unwrap();
        for pid in provider_ids {
            by_pid.insert(pid, id.clone());
        }
        Ok(())
    }

    /// Reconcile one command: advance its state machine per spec §4.5.
    pub async fn reconcile(
        &self,
        command_id: &str,
        state: &dyn ClusterStateMirror,
        actuator: &dyn NodeActuator,
        clock: &dyn Clock,
        recorder: &dyn EventRecorder,
    ) -> Result<ReconcileOutcome, Error> {
        let queue_len = self.len();
        let next_state;
        let command_snapshot;
        {
            let mut index = self.index.lock().unwrap();
            let Some(entry) = index.get_mut(command_id) else {
                return Ok(ReconcileOutcome::NotFound);
            };

            if clock.since(entry.command.created_at) > max_retry_duration(queue_len) {
                entry.state = QueueState::Untainting;
            } else {
                let snap: Snapshot = state.snapshot();
                for replacement in &mut entry.command.replacements {
                    if replacement.initialized {
                        continue;
                    }
                    let Some(name) = replacement.claim_name.as_deref() else {
                        continue;
                    };
                    if snap
                        .node_claims
                        .iter()
                        .find(|c| c.metadata.name.as_deref() == Some(name))
                        .is_some_and(|c| c.is_initialized())
                    {
                        replacement.initialized = true;
                    }
                }
                if entry.command.replacements.iter().all(|r| r.initialized) {
                    entry.state = QueueState::Deleting;
                }
            }
            next_state = entry.state;
            command_snapshot = entry.command.clone();
        }

        match next_state {
            QueueState::Untainting => {
                for candidate in &command_snapshot.candidates {
                    let node_name = candidate.node.metadata.name.clone().unwrap_or_default();
                    actuator.untaint(&node_name).await?;
                    let claim_name = candidate.node_claim.metadata.name.clone().unwrap_or_default();
                    actuator.clear_disruption_reason(&claim_name).await?;
                }
                recorder.publish(Event {
                    reason: EventReason::DisruptionBlocked,
                    subject: command_snapshot.id.clone(),
                    message: messages::timed_out(&command_snapshot.id),
                });
                if let Some((pool, amount)) = &command_snapshot.reserved_node_count {
                    state.release_node_count(pool, *amount);
                }
                self.remove(command_id, &command_snapshot);
                Ok(ReconcileOutcome::TimedOut(command_snapshot.consolidation_type))
            }
            QueueState::AwaitingReplacements => {
                recorder.publish(Event {
                    reason: EventReason::DisruptionWaitingReadiness,
                    subject: command_snapshot.id.clone(),
                    message: messages::WAITING_ON_READINESS.to_string(),
                });
                Ok(ReconcileOutcome::Waiting)
            }
            QueueState::Deleting => {
                for candidate in &command_snapshot.candidates {
                    let claim_name = candidate.node_claim.metadata.name.clone().unwrap_or_default();
                    actuator.delete_claim(&claim_name).await?;
                    recorder.publish(Event {
                        reason: EventReason::DisruptionTerminating,
                        subject: claim_name.clone(),
                        message: messages::terminating(&claim_name),
                    });
                }
                if let Some((pool, amount)) = &command_snapshot.reserved_node_count {
                    state.release_node_count(pool, *amount);
                }
                self.remove(command_id, &command_snapshot);
                Ok(ReconcileOutcome::Done)
            }
        }
    }

    fn remove(&self, command_id: &str, command: &Command) {
        self.index.lock().unwrap().remove(command_id);
        let mut by_pid = self.by_provider_id.lock().unwrap();
        for pid in command.provider_ids() {
            by_pid.remove(&pid);
        }
    }
}
