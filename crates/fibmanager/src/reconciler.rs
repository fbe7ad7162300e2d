//! Entry point for route table and membership changes.
//!
//! Every change becomes a job keyed by `(distinguisher, prefix)`, so work on
//! one route never interleaves; node replays are keyed by the routing
//! domain name. Externally learned routes pass through a batching queue
//! first to absorb bursts. While a key has changes waiting in that queue,
//! later changes for the key queue behind them whatever their origin.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::collaborators::Collaborators;
use crate::config::FibConfig;
use crate::context::{FibContext, StatsSnapshot};
use crate::error::{settle, FibError, Result};
use crate::handlers::{HandlerSet, RouteStrategy};
use crate::label::LabelRouteInfo;
use crate::nexthop::NextHopSummary;
use crate::types::{OperState, Route, RouteKey, RouteOrigin};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use vpnfib_orch_common::{BatchHandler, BatchingQueue, JobHandle, KeyedMutation};
use vpnfib_types::{NodeId, RouteDistinguisher};

const COMPONENT: &str = "RouteReconciler";

/// One notification from the route table.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteChange {
    Added(Route),
    Updated { original: Route, update: Route },
    Removed(Route),
}

impl RouteChange {
    pub fn route(&self) -> &Route {
        match self {
            RouteChange::Added(route) | RouteChange::Removed(route) => route,
            RouteChange::Updated { update, .. } => update,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RouteChange::Added(_) => "add",
            RouteChange::Updated { .. } => "update",
            RouteChange::Removed(_) => "remove",
        }
    }

    fn is_external(&self) -> bool {
        match self {
            RouteChange::Updated { original, update } => {
                original.origin == RouteOrigin::Bgp || update.origin == RouteOrigin::Bgp
            }
            other => other.route().origin == RouteOrigin::Bgp,
        }
    }
}

impl fmt::Display for RouteChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.route().prefix)
    }
}

/// Payload of the external route batching queue.
#[derive(Debug, Clone, PartialEq)]
pub struct BgpRouteChange {
    pub rd: RouteDistinguisher,
    pub change: RouteChange,
}

struct Engine {
    ctx: Arc<FibContext>,
    handlers: Arc<HandlerSet>,
}

impl Engine {
    fn submit(&self, rd: RouteDistinguisher, change: RouteChange) -> JobHandle {
        let key = RouteKey::new(rd.clone(), change.route().prefix).to_string();
        let name = format!("{}-route", change.kind());
        let ctx = self.ctx.clone();
        let handlers = self.handlers.clone();
        self.ctx.jobs.enqueue(key, name, move || {
            let ctx = ctx.clone();
            let handlers = handlers.clone();
            let rd = rd.clone();
            let change = change.clone();
            async move { run_route_change(&ctx, &handlers, &rd, &change).await }
        })
    }
}

/// Changes per route key pushed to the batching queue and not yet handed
/// to the job coordinator.
type QueuedKeys = Arc<DashMap<String, usize>>;

fn unqueue(queued: &DashMap<String, usize>, key: &str) {
    queued.remove_if_mut(key, |_, count| {
        *count = count.saturating_sub(1);
        *count == 0
    });
}

struct BgpBatchHandler {
    engine: Engine,
    queued: QueuedKeys,
}

#[async_trait]
impl BatchHandler<BgpRouteChange> for BgpBatchHandler {
    async fn process_batch(&self, batch: Vec<KeyedMutation<BgpRouteChange>>) {
        debug!("{}: {} external route changes", COMPONENT, batch.len());
        for mutation in batch {
            let BgpRouteChange { rd, change } = mutation.payload;
            // Completion is observed through the coordinator, not the handle.
            drop(self.engine.submit(rd, change));
            unqueue(&self.queued, &mutation.key);
        }
    }
}

async fn run_route_change(
    ctx: &FibContext,
    handlers: &HandlerSet,
    rd: &RouteDistinguisher,
    change: &RouteChange,
) -> vpnfib_orch_common::TaskResult<()> {
    let correlation = Uuid::new_v4().to_string();
    let context = format!("{} in {}", change, rd);
    let result = apply(ctx, handlers, rd, change, &correlation).await;
    if let Err(e) = &result {
        if !e.is_benign() && !e.is_retryable() {
            ctx.stats.failure();
            audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, COMPONENT, change.kind())
                .with_object_id(RouteKey::new(rd.clone(), change.route().prefix).to_string())
                .with_object_type("route")
                .with_error(e.to_string())
                .with_correlation_id(correlation.clone()));
        }
    }
    settle(COMPONENT, &context, result)
}

async fn apply(
    ctx: &FibContext,
    handlers: &HandlerSet,
    rd: &RouteDistinguisher,
    change: &RouteChange,
    correlation: &str,
) -> Result<()> {
    let domain = ctx.domain(rd).await?;
    let key = RouteKey::new(rd.clone(), change.route().prefix).to_string();

    match change {
        RouteChange::Added(route) => {
            let handler = handlers.for_route(route);
            handler.create(&domain, rd, route).await?;
            ctx.stats.route_added();
            audit_log!(AuditRecord::new(AuditCategory::RouteProgram, COMPONENT, "route_added")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(key)
                .with_object_type("route")
                .with_details(serde_json::json!({
                    "handler": handler.name(),
                    "origin": route.origin.to_string(),
                }))
                .with_correlation_id(correlation));
        }
        RouteChange::Updated { original, update } => {
            let before = RouteStrategy::classify(original);
            let after = RouteStrategy::classify(update);
            if before != after {
                info!(
                    "{}: {} moves from {} to {} handling",
                    COMPONENT, key, before, after
                );
                handlers.get(before).remove(&domain, rd, original).await?;
                handlers.get(after).create(&domain, rd, update).await?;
                ctx.stats.route_updated();
            } else if handlers.get(after).update(&domain, rd, original, update).await? {
                ctx.stats.route_updated();
            } else {
                debug!("{}: update of {} ignored", COMPONENT, key);
                ctx.stats.update_ignored();
            }
        }
        RouteChange::Removed(route) => {
            let handler = handlers.for_route(route);
            handler.remove(&domain, rd, route).await?;
            ctx.stats.route_removed();
            audit_log!(AuditRecord::new(AuditCategory::RouteRemove, COMPONENT, "route_removed")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(key)
                .with_object_type("route")
                .with_details(serde_json::json!({ "handler": handler.name() }))
                .with_correlation_id(correlation));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Serializable view of the engine state.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerDump {
    pub stats: StatsSnapshot,
    pub nexthops: NextHopSummary,
    pub labels: Vec<LabelRouteInfo>,
    pub jobs: JobCounts,
    pub bgp_batches: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeEvent {
    Joined,
    Left,
}

pub struct RouteReconciler {
    ctx: Arc<FibContext>,
    handlers: Arc<HandlerSet>,
    bgp_queue: BatchingQueue<BgpRouteChange>,
    queued: QueuedKeys,
}

impl RouteReconciler {
    /// Builds the engine on top of `collab`. Must be called from within a
    /// tokio runtime.
    pub fn new(config: FibConfig, collab: Collaborators) -> Self {
        let batching = config.bgp_batching_config();
        let ctx = Arc::new(FibContext::new(config, collab));
        let handlers = Arc::new(HandlerSet::new(ctx.clone()));
        let queued = QueuedKeys::default();
        let bgp_queue = BatchingQueue::spawn(
            batching,
            Arc::new(BgpBatchHandler {
                engine: Engine {
                    ctx: ctx.clone(),
                    handlers: handlers.clone(),
                },
                queued: queued.clone(),
            }),
        );
        Self {
            ctx,
            handlers,
            bgp_queue,
            queued,
        }
    }

    pub fn context(&self) -> &Arc<FibContext> {
        &self.ctx
    }

    fn engine(&self) -> Engine {
        Engine {
            ctx: self.ctx.clone(),
            handlers: self.handlers.clone(),
        }
    }

    async fn submit(&self, rd: RouteDistinguisher, change: RouteChange) -> Result<()> {
        let key = RouteKey::new(rd.clone(), change.route().prefix).to_string();
        let batched = match self.queued.entry(key.clone()) {
            Entry::Occupied(mut waiting) => {
                *waiting.get_mut() += 1;
                true
            }
            Entry::Vacant(slot) if change.is_external() => {
                slot.insert(1);
                true
            }
            Entry::Vacant(_) => false,
        };
        if !batched {
            drop(self.engine().submit(rd, change));
            return Ok(());
        }

        let removal = matches!(change, RouteChange::Removed(_));
        let payload = BgpRouteChange { rd, change };
        let mutation = if removal {
            KeyedMutation::del(key.clone(), payload)
        } else {
            KeyedMutation::set(key.clone(), payload)
        };
        self.bgp_queue.push(mutation).await.map_err(|e| {
            unqueue(&self.queued, &key);
            FibError::QueueClosed(e.to_string())
        })
    }

    pub async fn on_route_added(&self, rd: RouteDistinguisher, route: Route) -> Result<()> {
        self.submit(rd, RouteChange::Added(route)).await
    }

    pub async fn on_route_updated(
        &self,
        rd: RouteDistinguisher,
        original: Route,
        update: Route,
    ) -> Result<()> {
        self.submit(rd, RouteChange::Updated { original, update })
            .await
    }

    pub async fn on_route_removed(&self, rd: RouteDistinguisher, route: Route) -> Result<()> {
        self.submit(rd, RouteChange::Removed(route)).await
    }

    /// Replays every route of the domain of `rd` onto `node`.
    pub async fn on_node_joined(&self, rd: RouteDistinguisher, node: NodeId) -> Result<JobHandle> {
        self.submit_node_event(rd, node, NodeEvent::Joined).await
    }

    /// Tears down the state of every route of the domain of `rd` on `node`.
    pub async fn on_node_left(&self, rd: RouteDistinguisher, node: NodeId) -> Result<JobHandle> {
        self.submit_node_event(rd, node, NodeEvent::Left).await
    }

    async fn submit_node_event(
        &self,
        rd: RouteDistinguisher,
        node: NodeId,
        event: NodeEvent,
    ) -> Result<JobHandle> {
        let domain = self.ctx.domain(&rd).await?;
        let name = match event {
            NodeEvent::Joined => "node-joined",
            NodeEvent::Left => "node-left",
        };
        let ctx = self.ctx.clone();
        let handlers = self.handlers.clone();
        Ok(self.ctx.jobs.enqueue(domain.name, name, move || {
            let ctx = ctx.clone();
            let handlers = handlers.clone();
            let rd = rd.clone();
            async move {
                let context = format!("node {} in {}", node, rd);
                let result = replay_node(&ctx, &handlers, &rd, node, event).await;
                settle(COMPONENT, &context, result)
            }
        }))
    }

    /// Adds or removes the gateway buckets reached through `interface`.
    pub fn on_tunnel_state(&self, interface: impl Into<String>, state: OperState) -> JobHandle {
        let interface = interface.into();
        let ctx = self.ctx.clone();
        let key = format!("tunnel/{}", interface);
        self.ctx.jobs.enqueue(key, "tunnel-state", move || {
            let ctx = ctx.clone();
            let interface = interface.clone();
            async move {
                let result = ctx
                    .nexthops
                    .on_tunnel_state(&interface, state)
                    .await
                    .map(|changed| {
                        debug!(
                            "{}: tunnel {} {} changed {} buckets",
                            COMPONENT, interface, state, changed
                        );
                    });
                settle(COMPONENT, &format!("tunnel {}", interface), result)
            }
        })
    }

    pub fn set_upgrade_in_progress(&self, in_progress: bool) {
        self.ctx.interface_wait.set_upgrade_in_progress(in_progress);
    }

    /// Resolves once queued external changes have been handed over and no
    /// job is pending.
    pub async fn wait_idle(&self) {
        if let Err(e) = self.bgp_queue.flush().await {
            warn!("{}: {}", COMPONENT, e);
        }
        self.ctx.jobs.wait_idle().await;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn dump(&self) -> ReconcilerDump {
        let jobs = self.ctx.jobs.stats();
        ReconcilerDump {
            stats: self.stats(),
            nexthops: self.ctx.nexthops.summary(),
            labels: self.ctx.labels.entries(),
            jobs: JobCounts {
                pending: self.ctx.jobs.pending(),
                submitted: jobs.submitted,
                completed: jobs.completed,
                failed: jobs.failed,
                retried: jobs.retried,
            },
            bgp_batches: self.bgp_queue.batches_processed(),
        }
    }
}

async fn replay_node(
    ctx: &FibContext,
    handlers: &HandlerSet,
    rd: &RouteDistinguisher,
    node: NodeId,
    event: NodeEvent,
) -> Result<()> {
    let domain = ctx.domain(rd).await?;
    let _domain_guard = ctx.lock_domain(&domain.name).await?;
    let routes = ctx.collab.store.read_route_table(rd).await?;

    let mut applied = 0usize;
    let mut skipped = 0usize;
    for route in &routes {
        let handler = handlers.for_route(route);
        let result = match event {
            NodeEvent::Joined => handler.create_remote_only(&domain, rd, route, node).await,
            NodeEvent::Left => handler.remove_from_node(&domain, rd, route, node).await,
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) if e.is_benign() || matches!(e, FibError::Malformed(_)) => {
                e.log(COMPONENT, &format!("{} on node {}", route.prefix, node));
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    let (category, action) = match event {
        NodeEvent::Joined => {
            ctx.stats.node_replay();
            (AuditCategory::NodeReplay, "node_joined")
        }
        NodeEvent::Left => {
            ctx.stats.node_cleanup();
            (AuditCategory::NodeCleanup, "node_left")
        }
    };
    info!(
        "{}: {} for node {} in {}: {} routes applied, {} skipped",
        COMPONENT, action, node, domain.name, applied, skipped
    );
    audit_log!(AuditRecord::new(category, COMPONENT, action)
        .with_outcome(AuditOutcome::Success)
        .with_object_id(domain.name.clone())
        .with_object_type("routing_domain")
        .with_details(serde_json::json!({
            "node": node.value(),
            "routes": routes.len(),
            "applied": applied,
            "skipped": skipped,
        })));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::InMemoryFabric;
    use crate::types::{NodeState, PrefixInfo, RoutingDomain};
    use pretty_assertions::assert_eq;
    use vpnfib_types::{IpPrefix, VpnId};

    fn setup() -> (InMemoryFabric, RouteReconciler, RoutingDomain) {
        let fabric = InMemoryFabric::new();
        let domain = RoutingDomain::new("vpnA", VpnId::new(1), "100:1".parse().unwrap())
            .with_node(NodeId::new(1), NodeState::Active)
            .with_node(NodeId::new(2), NodeState::Active);
        fabric.add_domain(domain.clone());
        fabric.set_tunnel_endpoint(NodeId::new(1), "192.168.1.5".parse().unwrap());
        fabric.set_tunnel_endpoint(NodeId::new(2), "192.168.1.6".parse().unwrap());
        let reconciler = RouteReconciler::new(FibConfig::default(), fabric.collaborators());
        (fabric, reconciler, domain)
    }

    #[tokio::test]
    async fn test_unknown_domain_is_not_a_failure() {
        let (_fabric, reconciler, _domain) = setup();
        let route = Route::new("10.0.0.0/24".parse().unwrap(), RouteOrigin::Connected);
        reconciler
            .on_route_added("999:9".parse().unwrap(), route)
            .await
            .unwrap();
        reconciler.wait_idle().await;

        let stats = reconciler.stats();
        assert_eq!(stats.routes_added, 0);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_changed_connected_update_is_ignored() {
        let (fabric, reconciler, domain) = setup();
        let prefix = "10.0.0.0/24".parse().unwrap();
        fabric.add_prefix(domain.id, PrefixInfo::new(prefix, NodeId::new(1), "tap1"));
        let original =
            Route::new(prefix, RouteOrigin::Connected).with_path("192.168.1.5".parse().unwrap(), None);
        let changed = original
            .clone()
            .with_path("192.168.1.6".parse().unwrap(), None);

        reconciler
            .on_route_updated(domain.rd.clone(), original.clone(), changed)
            .await
            .unwrap();
        reconciler
            .on_route_updated(domain.rd.clone(), original.clone(), original)
            .await
            .unwrap();
        reconciler.wait_idle().await;

        let stats = reconciler.stats();
        assert_eq!(stats.updates_ignored, 1);
        assert_eq!(stats.routes_updated, 1);
    }

    #[tokio::test]
    async fn test_external_routes_are_batched() {
        let (fabric, reconciler, domain) = setup();
        fabric.add_external_gateway(NodeId::new(1), "10.200.0.1".parse().unwrap());
        fabric.add_external_gateway(NodeId::new(2), "10.200.0.1".parse().unwrap());
        let route = Route::new("50.0.0.0/16".parse().unwrap(), RouteOrigin::Bgp)
            .with_path("10.200.0.1".parse().unwrap(), Some(vpnfib_types::MplsLabel::new(700).unwrap()));

        reconciler
            .on_route_added(domain.rd.clone(), route)
            .await
            .unwrap();
        reconciler.wait_idle().await;

        assert_eq!(reconciler.stats().routes_added, 1);
        assert!(reconciler.dump().bgp_batches >= 1);
        assert_eq!(fabric.flows_on(NodeId::new(1)).len(), 1);
        assert_eq!(fabric.flows_on(NodeId::new(2)).len(), 1);
    }

    #[tokio::test]
    async fn test_changes_queue_behind_pending_external_change() {
        let (fabric, reconciler, domain) = setup();
        let prefix: IpPrefix = "50.0.0.0/16".parse().unwrap();
        let gateway = "10.200.0.1".parse().unwrap();
        fabric.add_external_gateway(NodeId::new(1), gateway);
        fabric.add_external_gateway(NodeId::new(2), gateway);
        fabric.add_prefix(domain.id, PrefixInfo::new(prefix, NodeId::new(1), "tap1"));
        let external = Route::new(prefix, RouteOrigin::Bgp)
            .with_path(gateway, Some(vpnfib_types::MplsLabel::new(700).unwrap()));
        let connected = Route::new(prefix, RouteOrigin::Connected)
            .with_path("192.168.1.5".parse().unwrap(), None);

        reconciler
            .on_route_added(domain.rd.clone(), external.clone())
            .await
            .unwrap();
        reconciler
            .on_route_updated(domain.rd.clone(), external, connected.clone())
            .await
            .unwrap();
        // Not external itself, but must not overtake the queued update.
        reconciler
            .on_route_removed(domain.rd.clone(), connected)
            .await
            .unwrap();
        reconciler.wait_idle().await;

        assert_eq!(fabric.flow_count(), 0);
        assert_eq!(fabric.group_count(), 0);
        assert!(reconciler.queued.is_empty());
        let stats = reconciler.stats();
        assert_eq!(stats.routes_updated, 1);
        assert_eq!(stats.routes_removed, 1);
    }

    #[tokio::test]
    async fn test_inline_changes_skip_the_queue() {
        let (fabric, reconciler, domain) = setup();
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        fabric.add_prefix(domain.id, PrefixInfo::new(prefix, NodeId::new(1), "tap1"));
        let route = Route::new(prefix, RouteOrigin::Connected)
            .with_path("192.168.1.5".parse().unwrap(), None);

        reconciler
            .on_route_added(domain.rd.clone(), route)
            .await
            .unwrap();
        assert!(reconciler.queued.is_empty());
        reconciler.wait_idle().await;
        assert_eq!(reconciler.dump().bgp_batches, 0);
    }

    #[test]
    fn test_change_display() {
        let route = Route::new("10.0.0.0/24".parse().unwrap(), RouteOrigin::Static);
        assert_eq!(RouteChange::Removed(route).to_string(), "remove 10.0.0.0/24");
    }
}
