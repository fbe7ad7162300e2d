//! FibDaemon implementation.
//!
//! The FibDaemon owns the registered orchs and runs the main loop:
//! - orchs are ordered by priority (lower first)
//! - every tick each orch gets its timer hook, then a `do_task` pass if it
//!   has pending work
//! - the loop ends when the cancellation token fires

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vpnfib_orch_common::Orch;

/// Configuration for the FibDaemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FibDaemonConfig {
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Events handed to the reconciler per orch pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    128
}

impl Default for FibDaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

pub struct FibDaemon {
    config: FibDaemonConfig,
    /// Registered orchs keyed by priority
    orchs: BTreeMap<i32, Vec<Box<dyn Orch>>>,
    running: bool,
    ticks: u64,
}

impl FibDaemon {
    pub fn new(config: FibDaemonConfig) -> Self {
        Self {
            config,
            orchs: BTreeMap::new(),
            running: false,
            ticks: 0,
        }
    }

    pub fn config(&self) -> &FibDaemonConfig {
        &self.config
    }

    /// Registers an orch. Orchs sharing a priority run in registration
    /// order.
    pub fn register_orch(&mut self, orch: Box<dyn Orch>) {
        let priority = orch.priority();
        let orch_name = orch.name().to_string();
        info!("Registering {} with priority {}", orch_name, priority);

        audit_log!(AuditRecord::new(
            AuditCategory::ConfigurationChange,
            "FibDaemon",
            format!("register_orch: {}", orch_name),
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(orch_name)
        .with_object_type("orch_module")
        .with_details(serde_json::json!({
            "priority": priority,
        })));

        self.orchs.entry(priority).or_default().push(orch);
    }

    pub fn orch_count(&self) -> usize {
        self.orchs.values().map(Vec::len).sum()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of completed loop iterations.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub async fn init(&mut self) -> bool {
        info!("Initializing FibDaemon with {} orchs", self.orch_count());
        audit_log!(AuditRecord::new(
            AuditCategory::SystemLifecycle,
            "FibDaemon",
            "daemon_initialization",
        )
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({
            "orch_count": self.orch_count(),
            "heartbeat_interval_ms": self.config.heartbeat_interval_ms,
        })));
        true
    }

    /// One pass over every orch in priority order.
    pub async fn tick(&mut self) {
        for orchs in self.orchs.values_mut() {
            for orch in orchs.iter_mut() {
                orch.on_timer().await;
                if orch.has_pending_tasks() {
                    debug!("Processing tasks for {}", orch.name());
                    orch.do_task().await;
                }
            }
        }
        self.ticks += 1;
    }

    /// Runs the main loop until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!("Starting FibDaemon event loop");
        self.running = true;
        audit_log!(AuditRecord::new(AuditCategory::AdminAction, "FibDaemon", "event_loop_started")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "heartbeat_interval_ms": self.config.heartbeat_interval_ms,
                "orch_count": self.orch_count(),
            })));

        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        while self.running {
            self.tick().await;
            tokio::select! {
                _ = shutdown.cancelled() => self.stop(),
                _ = tokio::time::sleep(heartbeat) => {}
            }
        }

        info!("FibDaemon event loop stopped after {} ticks", self.ticks);
        audit_log!(AuditRecord::new(AuditCategory::AdminAction, "FibDaemon", "event_loop_stopped")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({ "ticks": self.ticks })));
    }

    /// Ticks until no orch reports pending work, at most `max_ticks` times.
    /// Returns true if the orchs drained.
    pub async fn run_until_idle(&mut self, max_ticks: u64) -> bool {
        for _ in 0..max_ticks {
            self.tick().await;
            if !self.has_pending_tasks() {
                return true;
            }
        }
        !self.has_pending_tasks()
    }

    fn has_pending_tasks(&self) -> bool {
        self.orchs
            .values()
            .flatten()
            .any(|orch| orch.has_pending_tasks())
    }

    pub fn stop(&mut self) {
        info!("Stopping FibDaemon");
        audit_log!(AuditRecord::new(AuditCategory::AdminAction, "FibDaemon", "stop_requested")
            .with_outcome(AuditOutcome::Success));
        self.running = false;
    }

    /// Dumps state for debugging.
    pub fn dump(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!("FibDaemon running: {}", self.running));
        for (priority, orchs) in &self.orchs {
            for orch in orchs {
                lines.push(format!(
                    "  [{:3}] {} - {} pending",
                    priority,
                    orch.name(),
                    orch.dump_pending_tasks().len()
                ));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct TestOrch {
        name: String,
        priority: i32,
        task_count: Arc<AtomicU32>,
        timer_count: Arc<AtomicU32>,
        pending: u32,
        log: Option<Arc<parking_lot::Mutex<Vec<String>>>>,
    }

    impl TestOrch {
        fn new(name: &str, priority: i32) -> Self {
            Self {
                name: name.to_string(),
                priority,
                task_count: Arc::new(AtomicU32::new(0)),
                timer_count: Arc::new(AtomicU32::new(0)),
                pending: 0,
                log: None,
            }
        }

        fn with_pending(mut self, pending: u32) -> Self {
            self.pending = pending;
            self
        }

        fn with_log(mut self, log: Arc<parking_lot::Mutex<Vec<String>>>) -> Self {
            self.log = Some(log);
            self
        }
    }

    #[async_trait]
    impl Orch for TestOrch {
        fn name(&self) -> &str {
            &self.name
        }

        async fn do_task(&mut self) {
            self.task_count.fetch_add(1, Ordering::SeqCst);
            self.pending = self.pending.saturating_sub(1);
            if let Some(log) = &self.log {
                log.lock().push(self.name.clone());
            }
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn has_pending_tasks(&self) -> bool {
            self.pending > 0
        }

        fn dump_pending_tasks(&self) -> Vec<String> {
            (0..self.pending).map(|i| format!("task-{}", i)).collect()
        }

        async fn on_timer(&mut self) {
            self.timer_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_config() {
        let config = FibDaemonConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 1000);
        assert_eq!(config.batch_size, 128);
    }

    #[test]
    fn test_register_groups_by_priority() {
        let mut daemon = FibDaemon::new(FibDaemonConfig::default());
        daemon.register_orch(Box::new(TestOrch::new("FibOrch", 0)));
        daemon.register_orch(Box::new(TestOrch::new("TunnelOrch", 10)));
        daemon.register_orch(Box::new(TestOrch::new("NodeOrch", 0)));

        assert_eq!(daemon.orchs.get(&0).map(|v| v.len()), Some(2));
        assert_eq!(daemon.orchs.get(&10).map(|v| v.len()), Some(1));
        assert_eq!(daemon.orch_count(), 3);
    }

    #[tokio::test]
    async fn test_tick_runs_pending_orchs_in_priority_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut daemon = FibDaemon::new(FibDaemonConfig::default());
        daemon.register_orch(Box::new(
            TestOrch::new("late", 5).with_pending(1).with_log(log.clone()),
        ));
        daemon.register_orch(Box::new(TestOrch::new("idle", 0).with_log(log.clone())));
        daemon.register_orch(Box::new(
            TestOrch::new("early", -1).with_pending(1).with_log(log.clone()),
        ));

        daemon.tick().await;
        assert_eq!(*log.lock(), vec!["early".to_string(), "late".to_string()]);
        assert_eq!(daemon.ticks(), 1);
    }

    #[tokio::test]
    async fn test_timer_hook_runs_every_tick() {
        let orch = TestOrch::new("FibOrch", 0);
        let timers = orch.timer_count.clone();
        let tasks = orch.task_count.clone();
        let mut daemon = FibDaemon::new(FibDaemonConfig::default());
        daemon.register_orch(Box::new(orch));

        daemon.tick().await;
        daemon.tick().await;
        assert_eq!(timers.load(Ordering::SeqCst), 2);
        assert_eq!(tasks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_until_idle() {
        let orch = TestOrch::new("FibOrch", 0).with_pending(3);
        let tasks = orch.task_count.clone();
        let mut daemon = FibDaemon::new(FibDaemonConfig::default());
        daemon.register_orch(Box::new(orch));

        assert!(daemon.run_until_idle(10).await);
        assert_eq!(tasks.load(Ordering::SeqCst), 3);
        assert_eq!(daemon.ticks(), 3);
    }

    #[tokio::test]
    async fn test_run_until_idle_gives_up() {
        let mut daemon = FibDaemon::new(FibDaemonConfig::default());
        daemon.register_orch(Box::new(TestOrch::new("FibOrch", 0).with_pending(5)));
        assert!(!daemon.run_until_idle(2).await);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mut daemon = FibDaemon::new(FibDaemonConfig {
            heartbeat_interval_ms: 5,
            ..Default::default()
        });
        daemon.register_orch(Box::new(TestOrch::new("FibOrch", 0)));
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        daemon.run(shutdown).await;
        assert!(!daemon.is_running());
        assert!(daemon.ticks() >= 1);
    }

    #[test]
    fn test_dump() {
        let mut daemon = FibDaemon::new(FibDaemonConfig::default());
        daemon.register_orch(Box::new(TestOrch::new("FibOrch", 0).with_pending(2)));
        let dump = daemon.dump();
        assert_eq!(dump[0], "FibDaemon running: false");
        assert_eq!(dump[1], "  [  0] FibOrch - 2 pending");
    }
}
