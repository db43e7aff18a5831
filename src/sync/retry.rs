//! Retry policy and the global delayed-retry scheduler.
//!
//! Failed entries are not given a timer each. They go into one min-heap keyed
//! by due instant, drained by a single worker task.

use rand::Rng;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::model::SyncConfig;

/// Backoff for single-entry retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Upper bound (exclusive) of the random jitter fraction.
    pub max_jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_delay_ms),
            multiplier: 2.0,
            max_jitter: 0.1,
        }
    }

    /// Delay before the next retry, given attempts already made (1-indexed).
    ///
    /// `base_delay * multiplier^(attempts - 1) * (1 + jitter)`, uncapped.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let jitter = if self.max_jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.max_jitter)
        } else {
            0.0
        };
        self.delay_with_jitter(attempts, jitter)
    }

    pub fn delay_with_jitter(&self, attempts: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent) * (1.0 + jitter);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Default)]
struct State {
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    /// Live schedule generation per entry; heap items with another generation are stale.
    live: HashMap<String, u64>,
    next_gen: u64,
}

impl State {
    fn drop_stale_head(&mut self) {
        while let Some(Reverse((_, generation, id))) = self.heap.peek() {
            if self.live.get(id) == Some(generation) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[derive(Debug, Default)]
pub struct RetryScheduler {
    state: Mutex<State>,
    wake: Notify,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule (or reschedule) a retry for `id`. Returns false if the delay
    /// overflows the clock, in which case the next full pass picks it up.
    pub fn schedule(&self, id: &str, delay: Duration) -> bool {
        match Instant::now().checked_add(delay) {
            Some(at) => {
                self.schedule_at(id, at);
                true
            }
            None => false,
        }
    }

    pub fn schedule_at(&self, id: &str, at: Instant) {
        {
            let mut state = self.lock();
            let generation = state.next_gen;
            state.next_gen += 1;
            state.live.insert(id.to_string(), generation);
            state.heap.push(Reverse((at, generation, id.to_string())));
        }
        self.wake.notify_one();
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.lock().live.remove(id).is_some()
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.lock().live.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_due(&self) -> Option<Instant> {
        let mut state = self.lock();
        state.drop_stale_head();
        state.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&self, now: Instant) -> Vec<String> {
        let mut state = self.lock();
        let mut due = Vec::new();
        loop {
            state.drop_stale_head();
            match state.heap.peek() {
                Some(Reverse((at, _, _))) if *at <= now => {}
                _ => break,
            }
            if let Some(Reverse((_, _, id))) = state.heap.pop() {
                state.live.remove(&id);
                due.push(id);
            }
        }
        due
    }

    /// Sleep until the earliest retry is due, a new retry is scheduled, or `idle` passes.
    pub async fn wait_next(&self, idle: Duration) {
        let deadline = self
            .next_due()
            .unwrap_or_else(|| Instant::now() + idle);
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = self.wake.notified() => {}
        }
    }
}
