//! Orchestration plumbing shared by the vpnfib engine.
//!
//! - [`Orch`]: an agent driven by the daemon loop
//! - [`Consumer`]: keyed mutation queue with DEL/SET coalescing
//! - [`SyncMap`]: map without auto-vivification, with reference-set bookkeeping
//! - [`JobCoordinator`]: keyed, serialized, retrying job execution on a bounded pool
//! - [`BatchingQueue`]: bounded intake that delivers coalesced batches by size or interval
//! - [`KeyedLocks`]: per-key async mutual exclusion
//! - [`TaskStatus`] / [`TaskError`]: job outcomes
//!
//! # Ordering model
//!
//! Work for one key is applied in submission order; work for different keys
//! runs concurrently with no ordering guarantee between them. Callers pick
//! keys so that everything touching the same forwarding state shares one.

mod batch;
mod consumer;
mod job;
mod keyed_lock;
mod orch;
mod sync_map;
mod task;

pub use batch::{BatchError, BatchHandler, BatchingConfig, BatchingQueue};
pub use consumer::{Consumer, ConsumerConfig, KeyedMutation, Operation};
pub use job::{JobCoordinator, JobCoordinatorConfig, JobHandle, JobStats};
pub use keyed_lock::{KeyedGuard, KeyedLocks};
pub use orch::Orch;
pub use sync_map::{HasRefCount, RefRelease, SyncMap, SyncMapError};
pub use task::{TaskError, TaskResult, TaskResultExt, TaskStatus};
