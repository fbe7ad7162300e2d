//! Shared state handed to every route handler.

use crate::adjacency::AdjacencyResolver;
use crate::collaborators::Collaborators;
use crate::config::FibConfig;
use crate::error::{FibError, Result};
use crate::interface_wait::InterfaceWaiter;
use crate::label::LabelRouteRegistry;
use crate::nexthop::{NextHopConfig, NextHopGroupManager};
use crate::txn::TransactionRunner;
use crate::types::RoutingDomain;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use vpnfib_orch_common::{JobCoordinator, KeyedGuard, KeyedLocks};
use vpnfib_types::{IpPrefix, NodeId, RouteDistinguisher, VpnId};

/// Upper bound on waiting for a routing domain's lock.
const DOMAIN_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct ReconcilerStats {
    routes_added: AtomicU64,
    routes_updated: AtomicU64,
    updates_ignored: AtomicU64,
    routes_removed: AtomicU64,
    failures: AtomicU64,
    node_replays: AtomicU64,
    node_cleanups: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub routes_added: u64,
    pub routes_updated: u64,
    pub updates_ignored: u64,
    pub routes_removed: u64,
    pub failures: u64,
    pub node_replays: u64,
    pub node_cleanups: u64,
}

impl ReconcilerStats {
    pub fn route_added(&self) {
        self.routes_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_updated(&self) {
        self.routes_updated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_ignored(&self) {
        self.updates_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_removed(&self) {
        self.routes_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_replay(&self) {
        self.node_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_cleanup(&self) {
        self.node_cleanups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            routes_added: self.routes_added.load(Ordering::Relaxed),
            routes_updated: self.routes_updated.load(Ordering::Relaxed),
            updates_ignored: self.updates_ignored.load(Ordering::Relaxed),
            routes_removed: self.routes_removed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            node_replays: self.node_replays.load(Ordering::Relaxed),
            node_cleanups: self.node_cleanups.load(Ordering::Relaxed),
        }
    }
}

pub struct FibContext {
    pub config: FibConfig,
    pub collab: Collaborators,
    pub jobs: JobCoordinator,
    pub tx: TransactionRunner,
    pub resolver: AdjacencyResolver,
    pub nexthops: NextHopGroupManager,
    pub labels: LabelRouteRegistry,
    pub interface_wait: InterfaceWaiter,
    pub stats: ReconcilerStats,
    domain_locks: KeyedLocks<String>,
    local_locks: KeyedLocks<String>,
}

impl FibContext {
    pub fn new(config: FibConfig, collab: Collaborators) -> Self {
        let tx = TransactionRunner::new(
            collab.store.clone(),
            config.store.tx_max_retries,
            config.tx_retry_backoff(),
        );
        let nexthops = NextHopGroupManager::new(
            collab.clone(),
            tx.clone(),
            NextHopConfig {
                pool: config.nexthop.pool_name.clone(),
                settle_wait: config.group_settle_wait(),
                lock_timeout: config.cluster_lock_timeout(),
            },
        );
        Self {
            jobs: JobCoordinator::new(config.job_coordinator_config()),
            resolver: AdjacencyResolver::new(collab.directory.clone(), collab.egress.clone()),
            labels: LabelRouteRegistry::new(collab.ids.clone(), config.labels.pool_name.clone()),
            interface_wait: InterfaceWaiter::new(
                collab.egress.clone(),
                config.upgrade.upgrade_in_progress,
                config.interface_wait_timeout(),
            ),
            stats: ReconcilerStats::default(),
            domain_locks: KeyedLocks::new(),
            local_locks: KeyedLocks::new(),
            nexthops,
            tx,
            collab,
            config,
        }
    }

    /// The routing domain of `rd`, or `DomainNotFound`.
    pub async fn domain(&self, rd: &RouteDistinguisher) -> Result<RoutingDomain> {
        self.collab
            .directory
            .resolve_routing_domain(rd)
            .await?
            .ok_or_else(|| FibError::DomainNotFound(rd.clone()))
    }

    /// Serializes per-route work against whole-domain replays.
    pub async fn lock_domain(&self, name: &str) -> Result<KeyedGuard<String>> {
        self.domain_locks
            .lock_timeout(name.to_string(), DOMAIN_LOCK_TIMEOUT)
            .await
            .ok_or_else(|| FibError::LockTimeout(format!("domain {}", name)))
    }

    /// Serializes local-entry work for one prefix on one node.
    pub async fn lock_local(&self, vpn: VpnId, node: NodeId, prefix: &IpPrefix) -> KeyedGuard<String> {
        self.local_locks
            .lock(format!("{}/{}/{}", vpn, node, prefix))
            .await
    }
}
