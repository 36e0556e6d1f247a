//! Backoff policy for part workers
//!
//! Sleeps grow exponentially while failures come in quick succession
//! and shrink again once a worker has been failure free for a while.

use std::time::{Duration, Instant};

use crate::config::Config;

/// Tracks the backoff state of a single worker
#[derive(Debug, Clone)]
pub struct Backoff {
    floor_secs: u64,
    ceiling_secs: u64,
    next_secs: u64,
    last_failure_at: Option<Instant>,
}

impl Backoff {
    pub fn new(config: &Config) -> Self {
        let floor_secs = config.backoff_floor_secs.into_inner();
        Self {
            floor_secs,
            ceiling_secs: config.backoff_ceiling_secs.into_inner(),
            next_secs: floor_secs,
            last_failure_at: None,
        }
    }

    /// Register a failure and return how long to sleep before retrying
    pub fn failure(&mut self) -> Duration {
        let now = Instant::now();
        let gap = self.last_failure_at.map(|at| now - at);
        self.last_failure_at = Some(now);
        self.failure_with_gap(gap)
    }

    /// A long failure free stretch shrinks the sleep back down
    /// before the exponential growth is applied.
    fn failure_with_gap(&mut self, gap: Option<Duration>) -> Duration {
        match gap {
            None => self.next_secs = self.floor_secs,
            Some(gap) if gap >= Duration::from_secs(5 * 60) => self.next_secs = self.floor_secs,
            Some(gap) if gap >= Duration::from_secs(4 * 60) => {
                self.next_secs = 15.clamp(self.floor_secs, self.ceiling_secs)
            }
            Some(gap) if gap >= Duration::from_secs(3 * 60) => {
                self.next_secs = 31.clamp(self.floor_secs, self.ceiling_secs)
            }
            Some(_) => {}
        }

        let sleep_secs = self.next_secs;
        self.next_secs = (1 + 2 * self.next_secs).min(self.ceiling_secs);
        Duration::from_secs(sleep_secs)
    }

    /// The sleep the next failure would cause without registering one
    pub fn next_sleep(&self) -> Duration {
        Duration::from_secs(self.next_secs)
    }
}
