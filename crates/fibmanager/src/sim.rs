//! In-memory fabric implementing every collaborator.
//!
//! Used by the unit and integration tests and by the scenario replay mode
//! of the binary. It keeps the programmed flows and groups per node and
//! records allocator releases and bucket operations so callers can assert
//! on them.
//!
//! Tunnel names are derived from the endpoints: `tun-{src}-{dst}` towards
//! another node's tunnel endpoint, `tun-{src}-{ip}` towards an external
//! gateway.

use crate::collaborators::{
    ClusterLock, Collaborators, EgressService, FibStore, IdAllocator, SouthboundInstaller,
    VpnDirectory,
};
use crate::daemon::FibEvent;
use crate::error::{FibError, Result, StoreError};
use crate::flow::builder::fib_flow_key;
use crate::flow::{Action, Bucket, FlowEntity, FlowKey, GroupEntity, GroupKey};
use crate::txn::{StoreOp, Transaction};
use crate::types::{
    ExtraRoute, NodeState as DomainNodeState, OperState, PrefixInfo, Route, RoutingDomain,
    SubnetSegment, TunnelType,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;
use vpnfib_types::{IpAddress, IpPrefix, NodeId, RouteDistinguisher, VpnId};

/// Southbound bucket change, in the order it was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketOp {
    Add { group: GroupKey, bucket_id: u32 },
    Remove { group: GroupKey, bucket_id: u32 },
}

#[derive(Debug, Default)]
struct Pool {
    next: u32,
    end: u32,
    allocated: HashMap<String, u32>,
    free: Vec<u32>,
}

impl Pool {
    fn with_range(start: u32, end: u32) -> Self {
        Self {
            next: start,
            end,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct State {
    domains: BTreeMap<RouteDistinguisher, RoutingDomain>,
    prefixes: BTreeMap<(VpnId, IpPrefix), PrefixInfo>,
    segments: HashMap<Uuid, SubnetSegment>,
    tunnel_endpoints: BTreeMap<NodeId, IpAddress>,
    external_ports: BTreeMap<NodeId, String>,
    external_gateways: BTreeSet<(NodeId, IpAddress)>,
    extra_routes: BTreeMap<(String, RouteDistinguisher, IpPrefix), ExtraRoute>,
    used_rds: BTreeMap<(VpnId, IpPrefix), Vec<RouteDistinguisher>>,
    routes: BTreeMap<RouteDistinguisher, BTreeMap<IpPrefix, Route>>,

    flows: BTreeMap<FlowKey, FlowEntity>,
    groups: BTreeMap<GroupKey, GroupEntity>,
    bucket_ops: Vec<BucketOp>,
    direct_group_installs: usize,

    interfaces: HashMap<String, watch::Sender<OperState>>,
    forgotten: HashSet<String>,

    pools: HashMap<String, Pool>,
    released: HashMap<String, Vec<String>>,
    fail_allocations: bool,

    fail_commits: u32,
    commits: usize,
    prefix_lookups: usize,

    cluster_locks: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryFabric {
    state: Arc<Mutex<State>>,
}

impl InMemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every collaborator backed by this fabric.
    pub fn collaborators(&self) -> Collaborators {
        let shared = Arc::new(self.clone());
        Collaborators {
            store: shared.clone(),
            directory: shared.clone(),
            egress: shared.clone(),
            ids: shared.clone(),
            installer: shared.clone(),
            cluster_lock: shared,
        }
    }

    // Setup

    pub fn add_domain(&self, domain: RoutingDomain) {
        self.state.lock().domains.insert(domain.rd.clone(), domain);
    }

    /// Applies `f` to the domain of `rd`. Returns false if there is none.
    pub fn update_domain(&self, rd: &RouteDistinguisher, f: impl FnOnce(&mut RoutingDomain)) -> bool {
        match self.state.lock().domains.get_mut(rd) {
            Some(domain) => {
                f(domain);
                true
            }
            None => false,
        }
    }

    pub fn add_prefix(&self, vpn: VpnId, info: PrefixInfo) {
        self.state.lock().prefixes.insert((vpn, info.prefix), info);
    }

    pub fn remove_prefix(&self, vpn: VpnId, prefix: &IpPrefix) {
        self.state.lock().prefixes.remove(&(vpn, *prefix));
    }

    pub fn add_segment(&self, subnet: Uuid, segment: SubnetSegment) {
        self.state.lock().segments.insert(subnet, segment);
    }

    pub fn set_tunnel_endpoint(&self, node: NodeId, endpoint: IpAddress) {
        self.state.lock().tunnel_endpoints.insert(node, endpoint);
    }

    pub fn set_external_port(&self, node: NodeId, port: impl Into<String>) {
        self.state.lock().external_ports.insert(node, port.into());
    }

    /// Makes `gateway` reachable from `node` over a tunnel.
    pub fn add_external_gateway(&self, node: NodeId, gateway: IpAddress) {
        self.state.lock().external_gateways.insert((node, gateway));
    }

    pub fn add_extra_route(&self, vpn_name: &str, rd: &RouteDistinguisher, extra: ExtraRoute) {
        self.state
            .lock()
            .extra_routes
            .insert((vpn_name.to_string(), rd.clone(), extra.prefix), extra);
    }

    pub fn add_used_rd(&self, vpn: VpnId, prefix: IpPrefix, rd: RouteDistinguisher) {
        let mut state = self.state.lock();
        let rds = state.used_rds.entry((vpn, prefix)).or_default();
        if !rds.contains(&rd) {
            rds.push(rd);
        }
    }

    /// Stores `route` in the route table of `rd`, as read by node replays.
    pub fn put_route(&self, rd: &RouteDistinguisher, route: Route) {
        self.state
            .lock()
            .routes
            .entry(rd.clone())
            .or_default()
            .insert(route.prefix, route);
    }

    pub fn delete_route(&self, rd: &RouteDistinguisher, prefix: &IpPrefix) {
        if let Some(table) = self.state.lock().routes.get_mut(rd) {
            table.remove(prefix);
        }
    }

    pub fn set_interface_state(&self, interface: &str, oper: OperState) {
        let mut state = self.state.lock();
        match state.interfaces.get(interface) {
            Some(sender) => {
                sender.send_replace(oper);
            }
            None => {
                let (sender, _) = watch::channel(oper);
                state.interfaces.insert(interface.to_string(), sender);
            }
        }
    }

    /// Makes `interface` unknown: no egress actions, nothing to watch.
    pub fn forget_interface(&self, interface: &str) {
        let mut state = self.state.lock();
        state.interfaces.remove(interface);
        state.forgotten.insert(interface.to_string());
    }

    /// Fails the next `count` commits with a transient error.
    pub fn fail_next_commits(&self, count: u32) {
        self.state.lock().fail_commits = count;
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }

    pub fn set_pool_range(&self, pool: &str, start: u32, end: u32) {
        self.state
            .lock()
            .pools
            .insert(pool.to_string(), Pool::with_range(start, end));
    }

    // Inspection

    /// Keys released to `pool`, in release order.
    pub fn released_ids(&self, pool: &str) -> Vec<String> {
        self.state
            .lock()
            .released
            .get(pool)
            .cloned()
            .unwrap_or_default()
    }

    /// Id currently held by `key` in `pool`.
    pub fn allocated_id(&self, pool: &str, key: &str) -> Option<u32> {
        self.state
            .lock()
            .pools
            .get(pool)
            .and_then(|p| p.allocated.get(key).copied())
    }

    pub fn bucket_ops(&self) -> Vec<BucketOp> {
        self.state.lock().bucket_ops.clone()
    }

    pub fn clear_bucket_ops(&self) {
        self.state.lock().bucket_ops.clear();
    }

    pub fn direct_group_installs(&self) -> usize {
        self.state.lock().direct_group_installs
    }

    pub fn prefix_lookups(&self) -> usize {
        self.state.lock().prefix_lookups
    }

    pub fn flows_on(&self, node: NodeId) -> Vec<FlowEntity> {
        self.state
            .lock()
            .flows
            .values()
            .filter(|f| f.key.node == node)
            .cloned()
            .collect()
    }

    pub fn flow(&self, key: &FlowKey) -> Option<FlowEntity> {
        self.state.lock().flows.get(key).cloned()
    }

    /// The L3 FIB entry of `prefix` in `vpn` on `node`.
    pub fn fib_entry(&self, node: NodeId, vpn: VpnId, prefix: &IpPrefix) -> Option<FlowEntity> {
        self.flow(&fib_flow_key(node, vpn, prefix))
    }

    pub fn groups_on(&self, node: NodeId) -> Vec<GroupEntity> {
        self.state
            .lock()
            .groups
            .values()
            .filter(|g| g.key.node == node)
            .cloned()
            .collect()
    }

    pub fn group(&self, key: &GroupKey) -> Option<GroupEntity> {
        self.state.lock().groups.get(key).cloned()
    }

    pub fn flow_count(&self) -> usize {
        self.state.lock().flows.len()
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits
    }

    /// Forwarding state per node.
    pub fn snapshot(&self) -> FabricSnapshot {
        let state = self.state.lock();
        let mut nodes: BTreeMap<NodeId, NodeForwarding> = BTreeMap::new();
        for flow in state.flows.values() {
            nodes.entry(flow.key.node).or_default().flows.push(flow.clone());
        }
        for group in state.groups.values() {
            nodes
                .entry(group.key.node)
                .or_default()
                .groups
                .push(group.clone());
        }
        FabricSnapshot { nodes }
    }

    /// Builds a fabric from a scenario topology.
    pub fn from_topology(topology: &Topology) -> Self {
        let fabric = Self::new();
        for domain in &topology.domains {
            fabric.add_domain(domain.clone());
        }
        for endpoint in &topology.tunnel_endpoints {
            fabric.set_tunnel_endpoint(endpoint.node, endpoint.ip);
        }
        for port in &topology.external_ports {
            fabric.set_external_port(port.node, port.port.clone());
        }
        for gateway in &topology.external_gateways {
            fabric.add_external_gateway(gateway.node, gateway.ip);
        }
        for prefix in &topology.prefixes {
            fabric.add_prefix(prefix.vpn, prefix.info.clone());
        }
        for segment in &topology.segments {
            fabric.add_segment(segment.subnet, segment.segment);
        }
        for extra in &topology.extra_routes {
            fabric.add_extra_route(
                &extra.vpn_name,
                &extra.rd,
                ExtraRoute {
                    prefix: extra.prefix,
                    next_hops: extra.next_hops.clone(),
                },
            );
            fabric.add_used_rd(extra.vpn, extra.prefix, extra.rd.clone());
        }
        for pool in &topology.pools {
            fabric.set_pool_range(&pool.name, pool.start, pool.end);
        }
        fabric
    }

    /// Reflects `event` in the fabric's own tables the way the store and
    /// the directory would see it before the engine is notified.
    pub fn record_event(&self, event: &FibEvent) {
        match event {
            FibEvent::RouteAdded { rd, route } => self.put_route(rd, route.clone()),
            FibEvent::RouteUpdated { rd, update, .. } => self.put_route(rd, update.clone()),
            FibEvent::RouteRemoved { rd, route } => self.delete_route(rd, &route.prefix),
            FibEvent::NodeJoined { rd, node } => {
                self.update_domain(rd, |d| d.set_node_state(*node, DomainNodeState::Active));
            }
            FibEvent::NodeLeft { rd, node } => {
                self.update_domain(rd, |d| d.remove_node(*node));
            }
            FibEvent::TunnelState { interface, state } => {
                self.set_interface_state(interface, *state)
            }
        }
    }

    fn tunnel_name(state: &State, source: NodeId, destination: &IpAddress) -> Option<String> {
        if let Some(owner) = state
            .tunnel_endpoints
            .iter()
            .find(|(_, endpoint)| *endpoint == destination)
            .map(|(node, _)| *node)
        {
            return (owner != source).then(|| format!("tun-{}-{}", source, owner));
        }
        state
            .external_gateways
            .contains(&(source, *destination))
            .then(|| format!("tun-{}-{}", source, destination))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeForwarding {
    pub flows: Vec<FlowEntity>,
    pub groups: Vec<GroupEntity>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FabricSnapshot {
    pub nodes: BTreeMap<NodeId, NodeForwarding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub node: NodeId,
    pub ip: IpAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalPort {
    pub node: NodeId,
    pub port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixBinding {
    pub vpn: VpnId,
    #[serde(flatten)]
    pub info: PrefixInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentBinding {
    pub subnet: Uuid,
    #[serde(flatten)]
    pub segment: SubnetSegment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraRouteBinding {
    pub vpn: VpnId,
    pub vpn_name: String,
    pub rd: RouteDistinguisher,
    pub prefix: IpPrefix,
    pub next_hops: Vec<IpAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRange {
    pub name: String,
    pub start: u32,
    pub end: u32,
}

/// Scenario file: the fabric layout plus the events to feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub domains: Vec<RoutingDomain>,
    #[serde(default)]
    pub tunnel_endpoints: Vec<TunnelEndpoint>,
    #[serde(default)]
    pub external_ports: Vec<ExternalPort>,
    #[serde(default)]
    pub external_gateways: Vec<TunnelEndpoint>,
    #[serde(default)]
    pub prefixes: Vec<PrefixBinding>,
    #[serde(default)]
    pub segments: Vec<SegmentBinding>,
    #[serde(default)]
    pub extra_routes: Vec<ExtraRouteBinding>,
    #[serde(default)]
    pub pools: Vec<PoolRange>,
    #[serde(default)]
    pub events: Vec<FibEvent>,
}

#[async_trait]
impl FibStore for InMemoryFabric {
    async fn read_route_table(&self, rd: &RouteDistinguisher) -> Result<Vec<Route>> {
        Ok(self
            .state
            .lock()
            .routes
            .get(rd)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn read_route(&self, rd: &RouteDistinguisher, prefix: &IpPrefix) -> Result<Option<Route>> {
        Ok(self
            .state
            .lock()
            .routes
            .get(rd)
            .and_then(|table| table.get(prefix).cloned()))
    }

    async fn read_extra_route(
        &self,
        vpn_name: &str,
        rd: &RouteDistinguisher,
        prefix: &IpPrefix,
    ) -> Result<Option<ExtraRoute>> {
        Ok(self
            .state
            .lock()
            .extra_routes
            .get(&(vpn_name.to_string(), rd.clone(), *prefix))
            .cloned())
    }

    async fn write_extra_route(
        &self,
        vpn_name: &str,
        rd: &RouteDistinguisher,
        extra: ExtraRoute,
    ) -> Result<()> {
        self.add_extra_route(vpn_name, rd, extra);
        Ok(())
    }

    async fn delete_extra_route(
        &self,
        vpn_name: &str,
        rd: &RouteDistinguisher,
        prefix: &IpPrefix,
    ) -> Result<()> {
        self.state
            .lock()
            .extra_routes
            .remove(&(vpn_name.to_string(), rd.clone(), *prefix));
        Ok(())
    }

    async fn read_used_rds(&self, vpn: VpnId, prefix: &IpPrefix) -> Result<Vec<RouteDistinguisher>> {
        Ok(self
            .state
            .lock()
            .used_rds
            .get(&(vpn, *prefix))
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_used_rd(&self, vpn: VpnId, prefix: &IpPrefix, rd: &RouteDistinguisher) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(rds) = state.used_rds.get_mut(&(vpn, *prefix)) {
            rds.retain(|r| r != rd);
            if rds.is_empty() {
                state.used_rds.remove(&(vpn, *prefix));
            }
        }
        Ok(())
    }

    async fn commit(&self, tx: Transaction) -> std::result::Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(StoreError::Transient("injected commit conflict".to_string()));
        }
        for op in tx.into_ops() {
            match op {
                StoreOp::PutFlow(flow) => {
                    state.flows.insert(flow.key.clone(), flow);
                }
                StoreOp::DeleteFlow(key) => {
                    state.flows.remove(&key);
                }
                StoreOp::PutGroup(group) => {
                    state.groups.insert(group.key, group);
                }
                StoreOp::DeleteGroup(key) => {
                    state.groups.remove(&key);
                }
            }
        }
        state.commits += 1;
        Ok(())
    }
}

#[async_trait]
impl VpnDirectory for InMemoryFabric {
    async fn resolve_routing_domain(&self, rd: &RouteDistinguisher) -> Result<Option<RoutingDomain>> {
        Ok(self.state.lock().domains.get(rd).cloned())
    }

    async fn resolve_prefix(&self, vpn: VpnId, prefix: &IpPrefix) -> Result<Option<PrefixInfo>> {
        let mut state = self.state.lock();
        state.prefix_lookups += 1;
        Ok(state.prefixes.get(&(vpn, *prefix)).cloned())
    }

    async fn resolve_subnet_segment(&self, subnet: &Uuid) -> Result<Option<SubnetSegment>> {
        Ok(self.state.lock().segments.get(subnet).copied())
    }

    async fn external_port(&self, node: NodeId, _next_hop: &IpAddress) -> Result<Option<String>> {
        Ok(self.state.lock().external_ports.get(&node).cloned())
    }
}

#[async_trait]
impl EgressService for InMemoryFabric {
    async fn egress_actions(&self, interface: &str, _is_tunnel: bool) -> Result<Vec<Action>> {
        if self.state.lock().forgotten.contains(interface) {
            return Ok(Vec::new());
        }
        Ok(vec![Action::Output {
            port: interface.to_string(),
        }])
    }

    async fn tunnel_between(
        &self,
        source: NodeId,
        destination: &IpAddress,
        _tunnel_type: TunnelType,
    ) -> Result<Option<String>> {
        Ok(Self::tunnel_name(&self.state.lock(), source, destination))
    }

    async fn tunnel_oper_state(&self, interface: &str) -> Result<OperState> {
        Ok(self
            .state
            .lock()
            .interfaces
            .get(interface)
            .map(|sender| *sender.borrow())
            .unwrap_or(OperState::Up))
    }

    async fn tunnel_endpoint(&self, node: NodeId) -> Result<Option<IpAddress>> {
        Ok(self.state.lock().tunnel_endpoints.get(&node).copied())
    }

    async fn watch_interface_state(&self, interface: &str) -> Option<watch::Receiver<OperState>> {
        self.state
            .lock()
            .interfaces
            .get(interface)
            .map(|sender| sender.subscribe())
    }
}

#[async_trait]
impl IdAllocator for InMemoryFabric {
    async fn allocate(&self, pool: &str, key: &str) -> Result<u32> {
        let mut state = self.state.lock();
        if state.fail_allocations {
            return Err(FibError::Allocation {
                pool: pool.to_string(),
                key: key.to_string(),
                reason: "allocator unavailable".to_string(),
            });
        }
        let entry = state
            .pools
            .entry(pool.to_string())
            .or_insert_with(|| Pool::with_range(1, u32::MAX));
        if let Some(id) = entry.allocated.get(key) {
            return Ok(*id);
        }
        let id = match entry.free.pop() {
            Some(id) => id,
            None if entry.next <= entry.end => {
                let id = entry.next;
                entry.next += 1;
                id
            }
            None => {
                return Err(FibError::Allocation {
                    pool: pool.to_string(),
                    key: key.to_string(),
                    reason: "pool exhausted".to_string(),
                })
            }
        };
        entry.allocated.insert(key.to_string(), id);
        Ok(id)
    }

    async fn release(&self, pool: &str, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.pools.get_mut(pool) {
            if let Some(id) = entry.allocated.remove(key) {
                entry.free.push(id);
            }
        }
        state
            .released
            .entry(pool.to_string())
            .or_default()
            .push(key.to_string());
        Ok(())
    }
}

#[async_trait]
impl SouthboundInstaller for InMemoryFabric {
    async fn install_flow(&self, flow: FlowEntity) -> Result<()> {
        self.state.lock().flows.insert(flow.key.clone(), flow);
        Ok(())
    }

    async fn remove_flow(&self, key: &FlowKey) -> Result<()> {
        self.state.lock().flows.remove(key);
        Ok(())
    }

    async fn install_group(&self, group: GroupEntity) -> Result<()> {
        self.state.lock().groups.insert(group.key, group);
        Ok(())
    }

    async fn install_group_direct(&self, group: GroupEntity) -> Result<()> {
        let mut state = self.state.lock();
        state.direct_group_installs += 1;
        state.groups.insert(group.key, group);
        Ok(())
    }

    async fn remove_group(&self, key: &GroupKey) -> Result<()> {
        self.state.lock().groups.remove(key);
        Ok(())
    }

    async fn add_bucket(&self, key: &GroupKey, bucket: Bucket) -> Result<()> {
        let mut state = self.state.lock();
        let bucket_id = bucket.id;
        let group = state
            .groups
            .get_mut(key)
            .ok_or_else(|| FibError::southbound(format!("group {} not installed", key)))?;
        group.buckets.retain(|b| b.id != bucket_id);
        group.buckets.push(bucket);
        group.buckets.sort_by_key(|b| b.id);
        state.bucket_ops.push(BucketOp::Add {
            group: *key,
            bucket_id,
        });
        Ok(())
    }

    async fn remove_bucket(&self, key: &GroupKey, bucket_id: u32) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(group) = state.groups.get_mut(key) {
            group.buckets.retain(|b| b.id != bucket_id);
        }
        state.bucket_ops.push(BucketOp::Remove {
            group: *key,
            bucket_id,
        });
        Ok(())
    }
}

#[async_trait]
impl ClusterLock for InMemoryFabric {
    async fn try_lock(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.lock().cluster_locks.insert(name.to_string()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn unlock(&self, name: &str) {
        self.state.lock().cluster_locks.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::builder::fib_flow;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_tunnel_names() {
        let fabric = InMemoryFabric::new();
        fabric.set_tunnel_endpoint(NodeId::new(1), ip("192.168.1.5"));
        fabric.set_tunnel_endpoint(NodeId::new(2), ip("192.168.1.6"));
        fabric.add_external_gateway(NodeId::new(1), ip("10.200.0.1"));

        let to = |src: u64, dst: &str| {
            let fabric = fabric.clone();
            let dst = ip(dst);
            async move {
                fabric
                    .tunnel_between(NodeId::new(src), &dst, TunnelType::MplsOverGre)
                    .await
                    .unwrap()
            }
        };
        assert_eq!(to(2, "192.168.1.5").await, Some("tun-2-1".to_string()));
        assert_eq!(to(1, "192.168.1.5").await, None);
        assert_eq!(to(1, "10.200.0.1").await, Some("tun-1-10.200.0.1".to_string()));
        assert_eq!(to(2, "10.200.0.1").await, None);
    }

    #[tokio::test]
    async fn test_allocation_is_idempotent_per_key() {
        let fabric = InMemoryFabric::new();
        fabric.set_pool_range("p", 10, 11);
        assert_eq!(fabric.allocate("p", "a").await.unwrap(), 10);
        assert_eq!(fabric.allocate("p", "a").await.unwrap(), 10);
        assert_eq!(fabric.allocate("p", "b").await.unwrap(), 11);
        assert!(matches!(
            fabric.allocate("p", "c").await,
            Err(FibError::Allocation { .. })
        ));

        fabric.release("p", "a").await.unwrap();
        assert_eq!(fabric.allocate("p", "c").await.unwrap(), 10);
        assert_eq!(fabric.released_ids("p"), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_applies_all_ops() {
        let fabric = InMemoryFabric::new();
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        let mut tx = Transaction::new();
        tx.put_flow(fib_flow(NodeId::new(1), VpnId::new(1), &prefix, vec![]));
        tx.put_flow(fib_flow(NodeId::new(2), VpnId::new(1), &prefix, vec![]));
        fabric.commit(tx).await.unwrap();
        assert_eq!(fabric.flow_count(), 2);
        assert!(fabric.fib_entry(NodeId::new(2), VpnId::new(1), &prefix).is_some());

        let mut tx = Transaction::new();
        tx.delete_flow(fib_flow_key(NodeId::new(1), VpnId::new(1), &prefix));
        tx.delete_flow(fib_flow_key(NodeId::new(3), VpnId::new(1), &prefix));
        fabric.commit(tx).await.unwrap();
        assert_eq!(fabric.flows_on(NodeId::new(1)).len(), 0);
        assert_eq!(fabric.snapshot().nodes.len(), 1);
    }

    #[test]
    fn test_topology_from_json() {
        let json = r#"{
            "domains": [{"name": "vpnA", "id": 1, "rd": "100:1",
                         "nodes": [{"node": 1, "state": "active"}]}],
            "tunnel_endpoints": [{"node": 1, "ip": "192.168.1.5"}],
            "prefixes": [{"vpn": 1, "prefix": "10.0.0.0/24", "node": 1, "interface": "tap1"}],
            "events": [{"event": "node_joined", "rd": "100:1", "node": 1}]
        }"#;
        let topology: Topology = serde_json::from_str(json).unwrap();
        let fabric = InMemoryFabric::from_topology(&topology);
        assert_eq!(topology.events.len(), 1);
        assert_eq!(fabric.state.lock().domains.len(), 1);
        assert_eq!(fabric.state.lock().prefixes.len(), 1);
    }
}
