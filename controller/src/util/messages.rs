//! Human-readable event messages. Kept as constants/builders so the wording a `kubectl
//! describe` shows stays consistent across call sites.

pub const WAITING_ON_READINESS: &str = "Waiting for replacement NodeClaims to become Ready.";

pub fn launching(replacement: &str) -> String {
    format!("Launched replacement NodeClaim '{replacement}'.")
}

pub fn terminating(candidate: &str) -> String {
    format!("NodeClaim '{candidate}' is being terminated by the disruption controller.")
}

pub fn blocked(candidate: &str, reason: &str) -> String {
    format!("NodeClaim '{candidate}' cannot be disrupted: {reason}")
}

pub fn unconsolidatable(pool: &str, reason: &str) -> String {
    format!("NodePool '{pool}' is not consolidatable: {reason}")
}

pub fn node_pool_blocked(pool: &str) -> String {
    format!("NodePool '{pool}' has no remaining disruption budget this tick.")
}

pub fn node_pool_blocked_for_reason(pool: &str, reason: &str) -> String {
    format!("NodePool '{pool}' has no remaining '{reason}' disruption budget this tick.")
}

pub fn timed_out(command_id: &str) -> String {
    format!("Command '{command_id}' exceeded its retry budget and was abandoned.")
}
