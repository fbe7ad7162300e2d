//! Interfaces of the services the engine consumes.
//!
//! None of these are implemented here; production wires them to the data
//! store, the interface manager, the id manager and the southbound plugin.
//! [`crate::sim::InMemoryFabric`] implements all of them for tests and
//! scenario replay.

use crate::error::{FibError, Result, StoreError};
use crate::flow::{Action, Bucket, FlowEntity, FlowKey, GroupEntity, GroupKey};
use crate::txn::Transaction;
use crate::types::{
    ExtraRoute, OperState, PrefixInfo, Route, RoutingDomain, SubnetSegment, TunnelType,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;
use vpnfib_types::{IpAddress, IpPrefix, NodeId, RouteDistinguisher, VpnId};

/// Transactional hierarchical store holding routes, extra routes and the
/// flow/group records.
#[async_trait]
pub trait FibStore: Send + Sync {
    /// Every route of the table identified by `rd`.
    async fn read_route_table(&self, rd: &RouteDistinguisher) -> Result<Vec<Route>>;

    async fn read_route(&self, rd: &RouteDistinguisher, prefix: &IpPrefix) -> Result<Option<Route>>;

    async fn read_extra_route(
        &self,
        vpn_name: &str,
        rd: &RouteDistinguisher,
        prefix: &IpPrefix,
    ) -> Result<Option<ExtraRoute>>;

    async fn write_extra_route(
        &self,
        vpn_name: &str,
        rd: &RouteDistinguisher,
        extra: ExtraRoute,
    ) -> Result<()>;

    async fn delete_extra_route(
        &self,
        vpn_name: &str,
        rd: &RouteDistinguisher,
        prefix: &IpPrefix,
    ) -> Result<()>;

    /// Distinguishers currently anchoring next hops of the extra route for
    /// `prefix`.
    async fn read_used_rds(&self, vpn: VpnId, prefix: &IpPrefix) -> Result<Vec<RouteDistinguisher>>;

    async fn remove_used_rd(&self, vpn: VpnId, prefix: &IpPrefix, rd: &RouteDistinguisher) -> Result<()>;

    /// Applies every operation of `tx` or none of them.
    async fn commit(&self, tx: Transaction) -> std::result::Result<(), StoreError>;
}

/// VPN and interface directory.
#[async_trait]
pub trait VpnDirectory: Send + Sync {
    async fn resolve_routing_domain(&self, rd: &RouteDistinguisher) -> Result<Option<RoutingDomain>>;

    async fn resolve_prefix(&self, vpn: VpnId, prefix: &IpPrefix) -> Result<Option<PrefixInfo>>;

    async fn resolve_subnet_segment(&self, subnet: &Uuid) -> Result<Option<SubnetSegment>>;

    /// Provider port of `node` used to reach `next_hop` over a flat or VLAN
    /// segment.
    async fn external_port(&self, node: NodeId, next_hop: &IpAddress) -> Result<Option<String>>;
}

/// Egress actions and tunnel lookups.
#[async_trait]
pub trait EgressService: Send + Sync {
    /// Ordered actions that send a packet out of `interface`. Empty when
    /// the interface is unknown.
    async fn egress_actions(&self, interface: &str, is_tunnel: bool) -> Result<Vec<Action>>;

    async fn tunnel_between(
        &self,
        source: NodeId,
        destination: &IpAddress,
        tunnel_type: TunnelType,
    ) -> Result<Option<String>>;

    async fn tunnel_oper_state(&self, interface: &str) -> Result<OperState>;

    /// Tunnel endpoint address of `node`.
    async fn tunnel_endpoint(&self, node: NodeId) -> Result<Option<IpAddress>>;

    /// Subscribes to operational state changes of `interface`.
    async fn watch_interface_state(&self, interface: &str) -> Option<watch::Receiver<OperState>>;
}

/// Distributed id allocator. Allocation is idempotent per key.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    async fn allocate(&self, pool: &str, key: &str) -> Result<u32>;

    async fn release(&self, pool: &str, key: &str) -> Result<()>;
}

/// Programs flows and groups onto a forwarding node without going through
/// the store.
#[async_trait]
pub trait SouthboundInstaller: Send + Sync {
    async fn install_flow(&self, flow: FlowEntity) -> Result<()>;

    async fn remove_flow(&self, key: &FlowKey) -> Result<()>;

    async fn install_group(&self, group: GroupEntity) -> Result<()>;

    /// Writes the group straight to the switch, skipping any queueing.
    async fn install_group_direct(&self, group: GroupEntity) -> Result<()>;

    async fn remove_group(&self, key: &GroupKey) -> Result<()>;

    async fn add_bucket(&self, key: &GroupKey, bucket: Bucket) -> Result<()>;

    async fn remove_bucket(&self, key: &GroupKey, bucket_id: u32) -> Result<()>;
}

/// Cluster-wide named locks.
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Returns false if the lock could not be taken within `timeout`.
    async fn try_lock(&self, name: &str, timeout: Duration) -> bool;

    async fn unlock(&self, name: &str);
}

/// Runs `f` while holding the cluster lock `name`.
pub async fn with_cluster_lock<T, F, Fut>(
    lock: &dyn ClusterLock,
    name: &str,
    timeout: Duration,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !lock.try_lock(name, timeout).await {
        return Err(FibError::LockTimeout(name.to_string()));
    }
    let result = f().await;
    lock.unlock(name).await;
    result
}

/// The set of services the engine is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn FibStore>,
    pub directory: Arc<dyn VpnDirectory>,
    pub egress: Arc<dyn EgressService>,
    pub ids: Arc<dyn IdAllocator>,
    pub installer: Arc<dyn SouthboundInstaller>,
    pub cluster_lock: Arc<dyn ClusterLock>,
}
