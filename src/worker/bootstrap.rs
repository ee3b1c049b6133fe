//! Bootstrap bookkeeping: getting from an empty or snapshot-seeded routing
//! table to a connected one.
//!
//! The actual network traffic is an ordinary iterative find_node lookup
//! towards our own id, driven by the worker. This type tracks the attempts,
//! the entry points and who is waiting to hear that the table is ready.

use std::{collections::HashSet, time::Duration};
use tokio::sync::oneshot;

/// Attempts before backing off to the slow retry cadence.
const FAST_ATTEMPTS: u8 = 3;

const FAST_RETRY: Duration = Duration::from_secs(5);
const SLOW_RETRY: Duration = Duration::from_secs(5 * 60);

pub(crate) struct TableBootstrap {
    entry_points: HashSet<String>,
    attempts: u8,
    bootstrapped: bool,
    waiters: Vec<oneshot::Sender<bool>>,
}

impl TableBootstrap {
    pub fn new(entry_points: HashSet<String>) -> Self {
        Self {
            entry_points,
            attempts: 0,
            bootstrapped: false,
            waiters: Vec::new(),
        }
    }

    pub fn entry_points(&self) -> &HashSet<String> {
        &self.entry_points
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Register interest in bootstrap completion. Already-bootstrapped
    /// tables answer immediately.
    pub fn subscribe(&mut self, waiter: oneshot::Sender<bool>) {
        if self.bootstrapped {
            waiter.send(true).ok();
        } else {
            self.waiters.push(waiter);
        }
    }

    /// Note the start of an attempt.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Mark the table bootstrapped and wake everyone waiting for it.
    pub fn record_success(&mut self) {
        self.bootstrapped = true;
        for waiter in self.waiters.drain(..) {
            waiter.send(true).ok();
        }
    }

    /// How long to wait before the next attempt after a failed one. Early
    /// failures retry with increasing backoff, after that the table keeps
    /// trying at a slow cadence in case the network comes up later.
    pub fn retry_delay(&self) -> Duration {
        if self.attempts < FAST_ATTEMPTS {
            FAST_RETRY * u32::from(self.attempts.max(1))
        } else {
            SLOW_RETRY
        }
    }
}
