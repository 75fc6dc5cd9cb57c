//! In-memory adapters for the `writeflow` write-path subsystem.
//!
//! This crate implements every seam trait from the core crate against plain
//! process memory: durable storage with staged unit-of-work commit, the
//! atomic counter store, a broker with redelivery/backoff/dead-letter
//! semantics, and the scheduler lock manager. Useful for tests and
//! development scenarios where external infrastructure is not required; the
//! semantics (atomic claim, commit-or-nothing unit of work, at-least-once
//! delivery) match the production adapters.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod counter;
mod lock;
mod storage;

pub use broker::{InMemoryBroker, InMemoryBrokerConfig, InMemorySubscription};
pub use counter::InMemoryCounterStore;
pub use lock::{InMemoryLockManager, LockLease};
pub use storage::{InMemoryStorage, MemoryUnitOfWork};
