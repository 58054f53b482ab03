//! EventRecorder (spec §6): `Publish(event)` with de-duplication by key+timeout.
//! Grounded on the teacher's `util::messages` constant-message idiom plus the
//! `last_action`/`(key, Instant)` de-dup map shape used by richer reconcile loops in the
//! pack for emitting events without flooding the API server.

use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::util::colors::{FG1, FG2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    DisruptionLaunching,
    DisruptionWaitingReadiness,
    DisruptionTerminating,
    DisruptionBlocked,
    Unconsolidatable,
    /// Supplements the core five (spec §6) with the budget-exhaustion events spec §4.2
    /// names explicitly.
    NodePoolBlocked,
    NodePoolBlockedForDisruptionReason,
}

impl EventReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EventReason::DisruptionLaunching => "DisruptionLaunching",
            EventReason::DisruptionWaitingReadiness => "DisruptionWaitingReadiness",
            EventReason::DisruptionTerminating => "DisruptionTerminating",
            EventReason::DisruptionBlocked => "DisruptionBlocked",
            EventReason::Unconsolidatable => "Unconsolidatable",
            EventReason::NodePoolBlocked => "NodePoolBlocked",
            EventReason::NodePoolBlockedForDisruptionReason => "NodePoolBlockedForDisruptionReason",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub reason: EventReason,
    pub subject: String,
    pub message: String,
}

pub trait EventRecorder: Send + Sync {
    fn publish(&self, event: Event);
}

/// De-duplicates identical (reason, subject) pairs within `dedup_window` so a node stuck
/// in the same blocked state doesn't spam an event every tick.
pub struct ConsoleEventRecorder {
    last_published: Mutex<HashMap<(EventReason, String), Instant>>,
    dedup_window: Duration,
}

impl ConsoleEventRecorder {
    pub fn new(dedup_window: Duration) -> Self {
        ConsoleEventRecorder {
            last_published: Mutex::new(HashMap::new()),
            dedup_window,
        }
    }
}

impl Default for ConsoleEventRecorder {
    fn default() -> Self {
        // Spec §4.2: NodePoolBlocked events are deduplicated at 1-minute granularity.
        Self::new(Duration::from_secs(60))
    }
}

impl EventRecorder for ConsoleEventRecorder {
    fn publish(&self, event: Event) {
        let key = (event.reason, event.subject.clone());
        let mut last = self.last_published.lock().unwrap();
        let now = Instant::now();
        if let Some(prev) = last.get(&key)
            && now.duration_since(*prev) < self.dedup_window
        {
            return;
        }
        last.insert(key, now);
        drop(last);

        match event.reason {
            EventReason::DisruptionBlocked
            | EventReason::Unconsolidatable
            | EventReason::NodePoolBlocked
            | EventReason::NodePoolBlockedForDisruptionReason => {
                println!("{} {}{}{}", "⚠".color(FG2), event.subject.color(FG1), " — ", event.message);
            }
            _ => {
                println!("{} {}{}{}", "•".color(FG1), event.subject.color(FG2), " — ", event.message);
            }
        }
    }
}
