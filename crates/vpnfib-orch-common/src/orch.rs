//! Base Orch trait.

use async_trait::async_trait;

/// An event-driven agent driven by the daemon loop.
///
/// The daemon calls `do_task()` whenever `has_pending_tasks()` reports
/// work, visiting orchs in ascending `priority()` order, and calls
/// `on_timer()` once per tick.
#[async_trait]
pub trait Orch: Send + Sync {
    /// Returns the name of this Orch (for logging and debugging).
    fn name(&self) -> &str;

    /// Drains and processes pending entries.
    async fn do_task(&mut self);

    /// Lower values are processed first.
    fn priority(&self) -> i32 {
        0
    }

    fn has_pending_tasks(&self) -> bool {
        false
    }

    /// Human-readable description of queued work.
    fn dump_pending_tasks(&self) -> Vec<String> {
        vec![]
    }

    /// Periodic maintenance hook.
    async fn on_timer(&mut self) {}
}
