//! In-memory scheduler lock manager.
//!
//! Enforces the same hold-time contract as the advisory-lock adapter: a
//! released lock stays held until its minimum hold time has passed (so a
//! fast run cannot let a second replica re-enter within one tick), and an
//! unreleased lock expires at its maximum hold time (bounding leakage after
//! a crash mid-run).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use writeflow::LockManager;

/// Thread-safe in-memory implementation of [`LockManager`].
#[derive(Default)]
pub struct InMemoryLockManager {
    // Lock name -> the instant until which the lock is considered held.
    held_until: Mutex<HashMap<String, Instant>>,
}

/// A held lock; pass back to [`LockManager::release`].
pub struct LockLease {
    name: String,
    acquired_at: Instant,
    min_hold: Duration,
}

impl InMemoryLockManager {
    /// Creates a manager with no locks held.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    type Lease = LockLease;

    async fn try_acquire(
        &self,
        name: &str,
        min_hold: Duration,
        max_hold: Duration,
    ) -> Option<Self::Lease> {
        let now = Instant::now();
        let mut held = self.held_until.lock().expect("Mutex poisoned");

        if held.get(name).is_some_and(|until| now < *until) {
            return None;
        }

        held.insert(name.to_string(), now + max_hold);
        Some(LockLease {
            name: name.to_string(),
            acquired_at: now,
            min_hold,
        })
    }

    async fn release(&self, lease: Self::Lease) {
        let now = Instant::now();
        let mut held = self.held_until.lock().expect("Mutex poisoned");
        // Keep the lock held until its minimum hold time has elapsed.
        let release_at = (lease.acquired_at + lease.min_hold).max(now);
        held.insert(lease.name, release_at);
    }
}
