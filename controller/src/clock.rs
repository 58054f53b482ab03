//! Injectable clock, per the cooperative-clock design note: production code sleeps for
//! real; tests advance a virtual clock and observe when a waiter has started sleeping
//! before stepping it, so TTL-dependent logic stays deterministic.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn since(&self, t: DateTime<Utc>) -> Duration {
        (self.now() - t).to_std().unwrap_or(Duration::ZERO)
    }
    async fn sleep(&self, d: Duration);
}

#[derive(Clone, Default)]
pub struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

struct VirtualClockState {
    now: DateTime<Utc>,
    waiters: u32,
}

/// Test clock. `sleep` parks until `step` advances `now` past the waiter's deadline.
#[derive(Clone)]
pub struct VirtualClock {
    state: Arc<Mutex<VirtualClockState>>,
    notify: Arc<Notify>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        VirtualClock {
            state: Arc::new(Mutex::new(VirtualClockState {
                now: start,
                waiters: 0,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// True once at least one waiter is blocked in `sleep`. Lets tests avoid racing
    /// `step` against the task that is about to call `sleep`.
    pub fn has_waiters(&self) -> bool {
        self.state.lock().unwrap().waiters > 0
    }

    /// Advances the clock and wakes any waiter whose deadline has passed.
    pub fn step(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now += chrono::Duration::from_std(by).unwrap_or_default();
        drop(state);
        self.notify.notify_waiters();
    }
}

#[async_trait::async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().now
    }

    async fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        let deadline = self.now() + chrono::Duration::from_std(d).unwrap_or_default();
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.now >= deadline {
                    return;
                }
                state.waiters += 1;
            }
            self.notify.notified().await;
            let mut state = self.state.lock().unwrap();
            state.waiters = state.waiters.saturating_sub(1);
            if state.now >= deadline {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn virtual_clock_wakes_waiter_on_step() {
        let clock = VirtualClock::new(Utc::now());
        let waiter = clock.clone();
        let handle = tokio::spawn(async move {
            waiter.sleep(Duration::from_secs(15)).await;
        });

        while !clock.has_waiters() {
            tokio::task::yield_now().await;
        }
        clock.step(Duration::from_secs(15));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn zero_ttl_returns_immediately() {
        let clock = VirtualClock::new(Utc::now());
        clock.sleep(Duration::ZERO).await;
    }
}
