use super::types::{
    encap_actions, gateway_key, EcmpEncap, EcmpKey, EcmpMember, EcmpRecord, GatewayGroup,
    LocalNextHop, LocalNextHopKey, NextHopSummary,
};
use crate::adjacency::AdjacencyResult;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::collaborators::{with_cluster_lock, Collaborators};
use crate::error::{FibError, Result};
use crate::flow::{Action, Bucket, GroupEntity, GroupKey, GroupType};
use crate::txn::{Transaction, TransactionRunner};
use crate::types::OperState;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use vpnfib_orch_common::{KeyedLocks, RefRelease, SyncMap, SyncMapError};
use vpnfib_types::{IpAddress, IpPrefix, MacAddress, NodeId, VpnId};

const COMPONENT: &str = "NextHopGroupManager";

#[derive(Debug, Clone)]
pub struct NextHopConfig {
    pub pool: String,
    pub settle_wait: Duration,
    pub lock_timeout: Duration,
}

#[derive(Default)]
struct GatewayState {
    groups: HashMap<(NodeId, String), GatewayGroup>,
    /// Gateway group used by each route on each node.
    route_refs: HashMap<(NodeId, String), String>,
}

/// Owns every group the engine programs: local next-hop pointers, extra
/// route ECMP groups and gateway load-balancing groups.
pub struct NextHopGroupManager {
    collab: Collaborators,
    tx: TransactionRunner,
    config: NextHopConfig,
    locks: KeyedLocks<String>,
    local: Mutex<SyncMap<LocalNextHopKey, LocalNextHop>>,
    ecmp: Mutex<HashMap<EcmpKey, EcmpRecord>>,
    gateways: Mutex<GatewayState>,
}

impl NextHopGroupManager {
    pub fn new(collab: Collaborators, tx: TransactionRunner, config: NextHopConfig) -> Self {
        Self {
            collab,
            tx,
            config,
            locks: KeyedLocks::new(),
            local: Mutex::new(SyncMap::new()),
            ecmp: Mutex::new(HashMap::new()),
            gateways: Mutex::new(GatewayState::default()),
        }
    }

    async fn allocate(&self, key: &str) -> Result<u32> {
        self.collab
            .ids
            .allocate(&self.config.pool, key)
            .await
            .map_err(|e| FibError::Allocation {
                pool: self.config.pool.clone(),
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn release_id(&self, key: &str) {
        if let Err(e) = self.collab.ids.release(&self.config.pool, key).await {
            warn!("{}: failed to release id {}: {}", COMPONENT, key, e);
        }
    }

    // Local next hops

    /// Returns the group of the local next hop `(vpn, primary)`, creating it
    /// on `node` if needed, and records `destination` as one of its users.
    pub async fn create_local_next_hop(
        &self,
        vpn: VpnId,
        node: NodeId,
        primary: IpPrefix,
        interface: &str,
        mac: Option<MacAddress>,
        destination: IpPrefix,
    ) -> Result<u32> {
        let key = LocalNextHopKey::new(vpn, primary);
        let _guard = self.locks.lock(key.lock_name()).await;
        with_cluster_lock(
            self.collab.cluster_lock.as_ref(),
            &key.lock_name(),
            self.config.lock_timeout,
            || self.create_local_locked(&key, node, interface, mac, destination),
        )
        .await
    }

    async fn create_local_locked(
        &self,
        key: &LocalNextHopKey,
        node: NodeId,
        interface: &str,
        mac: Option<MacAddress>,
        destination: IpPrefix,
    ) -> Result<u32> {
        {
            let mut local = self.local.lock();
            if local.add_ref(key, destination).is_ok() {
                if let Some(entry) = local.get(key) {
                    debug!(
                        "{}: next hop {} reused for {}, {} users",
                        COMPONENT,
                        key,
                        destination,
                        entry.adjacencies.len()
                    );
                    return Ok(entry.group_id);
                }
            }
        }

        let pool_key = key.pool_key();
        let group_id = self.allocate(&pool_key).await?;

        let egress = self.collab.egress.egress_actions(interface, false).await?;
        if egress.is_empty() {
            self.release_id(&pool_key).await;
            return Err(FibError::resolution_miss(format!(
                "no egress actions for {} on node {}",
                interface, node
            )));
        }

        let mut actions = Vec::with_capacity(egress.len() + 1);
        if let Some(mac) = mac {
            actions.push(Action::SetEthDst(mac));
        }
        actions.extend(egress);

        let group = GroupEntity {
            key: GroupKey::new(node, group_id),
            name: pool_key.clone(),
            group_type: GroupType::All,
            buckets: vec![Bucket {
                id: 0,
                weight: 1,
                actions,
            }],
        };

        self.collab.installer.install_group_direct(group.clone()).await?;
        let mut tx = Transaction::new();
        tx.put_group(group);
        self.tx.submit(tx).await?;

        self.local.lock().insert(
            *key,
            LocalNextHop {
                group_id,
                node,
                interface: interface.to_string(),
                mac,
                adjacencies: BTreeSet::from([destination]),
            },
        );

        audit_log!(AuditRecord::new(
            AuditCategory::GroupCreate,
            COMPONENT,
            "create_local_next_hop"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(GroupKey::new(node, group_id).to_string())
        .with_object_type("local_next_hop")
        .with_details(serde_json::json!({
            "next_hop": key.to_string(),
            "interface": interface,
            "destination": destination.to_string(),
        })));
        Ok(group_id)
    }

    /// Drops `destination` from the users of `(vpn, primary)`. The group and
    /// its id go away with the last user. Missing entries are not an error.
    pub async fn remove_local_next_hop(
        &self,
        vpn: VpnId,
        primary: IpPrefix,
        destination: IpPrefix,
    ) -> Result<()> {
        let key = LocalNextHopKey::new(vpn, primary);
        let _guard = self.locks.lock(key.lock_name()).await;
        with_cluster_lock(
            self.collab.cluster_lock.as_ref(),
            &key.lock_name(),
            self.config.lock_timeout,
            || self.remove_local_locked(&key, destination),
        )
        .await
    }

    async fn remove_local_locked(&self, key: &LocalNextHopKey, destination: IpPrefix) -> Result<()> {
        let released = self.local.lock().release_ref(key, &destination);
        let entry = match released {
            Ok(RefRelease::Remaining(n)) => {
                debug!("{}: next hop {} still used by {} prefixes", COMPONENT, key, n);
                return Ok(());
            }
            Ok(RefRelease::Last(entry)) => entry,
            Err(SyncMapError::KeyNotFound) | Err(SyncMapError::NotReferenced) => {
                debug!(
                    "{}: next hop {} not held by {}, nothing to remove",
                    COMPONENT, key, destination
                );
                return Ok(());
            }
        };

        let group_key = GroupKey::new(entry.node, entry.group_id);
        let mut tx = Transaction::new();
        tx.delete_group(group_key);
        if let Err(e) = self.tx.submit(tx).await {
            self.local.lock().insert(*key, entry);
            return Err(e);
        }
        self.release_id(&key.pool_key()).await;

        audit_log!(AuditRecord::new(
            AuditCategory::GroupRemove,
            COMPONENT,
            "remove_local_next_hop"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(group_key.to_string())
        .with_object_type("local_next_hop"));
        Ok(())
    }

    pub fn local_next_hop(&self, vpn: VpnId, primary: &IpPrefix) -> Option<LocalNextHop> {
        self.local
            .lock()
            .get(&LocalNextHopKey::new(vpn, *primary))
            .cloned()
    }

    /// Local next hops of `vpn` that `destination` is one of the users of.
    pub fn local_next_hops_serving(
        &self,
        vpn: VpnId,
        destination: &IpPrefix,
    ) -> Vec<(IpPrefix, LocalNextHop)> {
        self.local
            .lock()
            .iter()
            .filter(|(key, entry)| key.vpn == vpn && entry.adjacencies.contains(destination))
            .map(|(key, entry)| (key.primary, entry.clone()))
            .collect()
    }

    // ECMP groups

    /// Creates or updates the select group of an extra route on `node`.
    ///
    /// Members owned by `node` are reached through their local next hop,
    /// the others through a tunnel to their owner. An existing group is
    /// updated bucket by bucket; bucket ids of unchanged members are kept.
    pub async fn ensure_ecmp_group(
        &self,
        node: NodeId,
        vpn: VpnId,
        prefix: IpPrefix,
        encap: EcmpEncap,
        members: &[EcmpMember],
    ) -> Result<u32> {
        let key = EcmpKey { node, vpn, prefix };
        let _guard = self.locks.lock(key.lock_name()).await;

        let mut desired: BTreeMap<IpAddress, Vec<Action>> = BTreeMap::new();
        let mut local_members = BTreeSet::new();
        for member in members {
            if desired.contains_key(&member.next_hop) {
                continue;
            }
            if member.owner == node {
                let group_id = self
                    .create_local_next_hop(
                        vpn,
                        node,
                        member.next_hop.host_prefix(),
                        &member.interface,
                        member.mac,
                        prefix,
                    )
                    .await?;
                local_members.insert(member.next_hop);
                desired.insert(member.next_hop, vec![Action::Group(group_id)]);
            } else if let Some(actions) = self.remote_bucket_actions(node, member, encap).await? {
                desired.insert(member.next_hop, actions);
            }
        }

        if desired.is_empty() {
            return Err(FibError::resolution_miss(format!(
                "no reachable member for {} in vpn {} on node {}",
                prefix, vpn, node
            )));
        }

        let existing = self.ecmp.lock().get(&key).cloned();
        match existing {
            Some(record) => self.update_ecmp_group(key, record, desired, local_members).await,
            None => self.create_ecmp_group(key, desired, local_members).await,
        }
    }

    async fn remote_bucket_actions(
        &self,
        node: NodeId,
        member: &EcmpMember,
        encap: EcmpEncap,
    ) -> Result<Option<Vec<Action>>> {
        let Some(endpoint) = self.collab.egress.tunnel_endpoint(member.owner).await? else {
            debug!("{}: node {} has no tunnel endpoint", COMPONENT, member.owner);
            return Ok(None);
        };
        let Some(tunnel) = self
            .collab
            .egress
            .tunnel_between(node, &endpoint, encap.tunnel_type)
            .await?
        else {
            debug!(
                "{}: no tunnel from node {} to {} for member {}",
                COMPONENT, node, endpoint, member.next_hop
            );
            return Ok(None);
        };
        let egress = self.collab.egress.egress_actions(&tunnel, true).await?;
        if egress.is_empty() {
            return Ok(None);
        }
        let mut actions = encap_actions(encap.tunnel_type, member.label, encap.tunnel_id);
        actions.extend(egress);
        Ok(Some(actions))
    }

    async fn create_ecmp_group(
        &self,
        key: EcmpKey,
        desired: BTreeMap<IpAddress, Vec<Action>>,
        local_members: BTreeSet<IpAddress>,
    ) -> Result<u32> {
        let group_id = self.allocate(&key.pool_key()).await?;

        let mut buckets = Vec::with_capacity(desired.len());
        let mut bucket_ids = BTreeMap::new();
        for (id, (next_hop, actions)) in (0u32..).zip(desired) {
            bucket_ids.insert(next_hop, id);
            buckets.push(Bucket {
                id,
                weight: 1,
                actions,
            });
        }
        let bucket_count = buckets.len();

        let group_key = GroupKey::new(key.node, group_id);
        let mut tx = Transaction::new();
        tx.put_group(GroupEntity {
            key: group_key,
            name: key.pool_key(),
            group_type: GroupType::Select,
            buckets,
        });
        self.tx.submit(tx).await?;

        self.ecmp.lock().insert(
            key,
            EcmpRecord {
                group_id,
                buckets: bucket_ids,
                local_members,
            },
        );

        audit_log!(AuditRecord::new(AuditCategory::GroupCreate, COMPONENT, "create_ecmp_group")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(group_key.to_string())
            .with_object_type("ecmp_group")
            .with_details(serde_json::json!({
                "prefix": key.prefix.to_string(),
                "buckets": bucket_count,
            })));
        Ok(group_id)
    }

    async fn update_ecmp_group(
        &self,
        key: EcmpKey,
        mut record: EcmpRecord,
        desired: BTreeMap<IpAddress, Vec<Action>>,
        local_members: BTreeSet<IpAddress>,
    ) -> Result<u32> {
        let group_key = GroupKey::new(key.node, record.group_id);

        let stale: Vec<(IpAddress, u32)> = record
            .buckets
            .iter()
            .filter(|(next_hop, _)| !desired.contains_key(*next_hop))
            .map(|(next_hop, id)| (*next_hop, *id))
            .collect();
        for (next_hop, bucket_id) in &stale {
            self.collab.installer.remove_bucket(&group_key, *bucket_id).await?;
            record.buckets.remove(next_hop);
            if record.local_members.remove(next_hop) {
                self.remove_local_next_hop(key.vpn, next_hop.host_prefix(), key.prefix)
                    .await?;
            }
        }

        let mut added = 0;
        for (next_hop, actions) in desired {
            if record.buckets.contains_key(&next_hop) {
                continue;
            }
            let id = record.next_bucket_id();
            self.collab
                .installer
                .add_bucket(
                    &group_key,
                    Bucket {
                        id,
                        weight: 1,
                        actions,
                    },
                )
                .await?;
            record.buckets.insert(next_hop, id);
            added += 1;
        }
        record.local_members.extend(local_members);

        let group_id = record.group_id;
        self.ecmp.lock().insert(key, record);

        if added > 0 || !stale.is_empty() {
            audit_log!(AuditRecord::new(AuditCategory::GroupModify, COMPONENT, "update_ecmp_group")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(group_key.to_string())
                .with_object_type("ecmp_group")
                .with_details(serde_json::json!({
                    "added": added,
                    "removed": stale.len(),
                })));
        }
        Ok(group_id)
    }

    /// Removes the select group of an extra route on `node` together with
    /// the local next-hop references it held.
    pub async fn remove_ecmp_group(&self, node: NodeId, vpn: VpnId, prefix: IpPrefix) -> Result<()> {
        let key = EcmpKey { node, vpn, prefix };
        let _guard = self.locks.lock(key.lock_name()).await;

        let Some(record) = self.ecmp.lock().remove(&key) else {
            debug!("{}: no ECMP group for {} on node {}", COMPONENT, prefix, node);
            return Ok(());
        };

        let group_key = GroupKey::new(node, record.group_id);
        let mut tx = Transaction::new();
        tx.delete_group(group_key);
        if let Err(e) = self.tx.submit(tx).await {
            self.ecmp.lock().insert(key, record);
            return Err(e);
        }

        for next_hop in &record.local_members {
            self.remove_local_next_hop(vpn, next_hop.host_prefix(), prefix)
                .await?;
        }

        let still_used = self
            .ecmp
            .lock()
            .keys()
            .any(|k| k.vpn == vpn && k.prefix == prefix);
        if !still_used {
            self.release_id(&key.pool_key()).await;
        }

        audit_log!(AuditRecord::new(AuditCategory::GroupRemove, COMPONENT, "remove_ecmp_group")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(group_key.to_string())
            .with_object_type("ecmp_group"));
        Ok(())
    }

    pub fn ecmp_group(&self, node: NodeId, vpn: VpnId, prefix: &IpPrefix) -> Option<EcmpRecord> {
        self.ecmp
            .lock()
            .get(&EcmpKey {
                node,
                vpn,
                prefix: *prefix,
            })
            .cloned()
    }

    /// Nodes holding an ECMP group for the extra route.
    pub fn ecmp_nodes(&self, vpn: VpnId, prefix: &IpPrefix) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .ecmp
            .lock()
            .keys()
            .filter(|k| k.vpn == vpn && k.prefix == *prefix)
            .map(|k| k.node)
            .collect();
        nodes.sort();
        nodes
    }

    // Gateway load balancing

    /// Returns the group balancing over the gateways of `adjacencies` on
    /// `node`, creating it if needed, and records `route_ref` as a user.
    ///
    /// A new group waits for the configured settle time before returning so
    /// dependent flows do not race the group programming.
    pub async fn ensure_gateway_group(
        &self,
        node: NodeId,
        adjacencies: &[AdjacencyResult],
        route_ref: &str,
    ) -> Result<u32> {
        let mut gateways: Vec<(IpAddress, String)> = adjacencies
            .iter()
            .filter_map(|a| a.next_hop.map(|ip| (ip, a.interface.clone())))
            .collect();
        gateways.sort();
        gateways.dedup_by(|a, b| a.0 == b.0);
        let ips: Vec<IpAddress> = gateways.iter().map(|(ip, _)| *ip).collect();
        let key = gateway_key(&ips);

        let previous = self
            .gateways
            .lock()
            .route_refs
            .get(&(node, route_ref.to_string()))
            .cloned();
        if let Some(previous) = previous {
            if previous != key {
                self.release_gateway_ref(node, route_ref).await?;
            }
        }

        let _guard = self.locks.lock(format!("{}.{}", key, node)).await;

        {
            let mut state = self.gateways.lock();
            if let Some(group) = state.groups.get_mut(&(node, key.clone())) {
                group.referrers.insert(route_ref.to_string());
                let group_id = group.group_id;
                state
                    .route_refs
                    .insert((node, route_ref.to_string()), key.clone());
                return Ok(group_id);
            }
        }

        let group_id = self.allocate(&key).await?;
        let mut buckets = Vec::new();
        let mut live = BTreeSet::new();
        for (id, (_, tunnel)) in (0u32..).zip(gateways.iter()) {
            if let Some(bucket) = self.gateway_bucket(id, tunnel).await? {
                live.insert(id);
                buckets.push(bucket);
            }
        }

        let group_key = GroupKey::new(node, group_id);
        let mut tx = Transaction::new();
        tx.put_group(GroupEntity {
            key: group_key,
            name: key.clone(),
            group_type: GroupType::Select,
            buckets,
        });
        self.tx.submit(tx).await?;
        tokio::time::sleep(self.config.settle_wait).await;

        {
            let mut state = self.gateways.lock();
            state.groups.insert(
                (node, key.clone()),
                GatewayGroup {
                    key: key.clone(),
                    group_id,
                    gateways,
                    live,
                    referrers: BTreeSet::from([route_ref.to_string()]),
                },
            );
            state
                .route_refs
                .insert((node, route_ref.to_string()), key.clone());
        }

        audit_log!(AuditRecord::new(AuditCategory::GroupCreate, COMPONENT, "create_gateway_group")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(group_key.to_string())
            .with_object_type("gateway_group")
            .with_details(serde_json::json!({ "gateways": key })));
        Ok(group_id)
    }

    /// Bucket for gateway `id`, or `None` while its tunnel is down.
    async fn gateway_bucket(&self, id: u32, tunnel: &str) -> Result<Option<Bucket>> {
        if self.collab.egress.tunnel_oper_state(tunnel).await? != OperState::Up {
            debug!("{}: tunnel {} is down, bucket {} left out", COMPONENT, tunnel, id);
            return Ok(None);
        }
        let actions = self.collab.egress.egress_actions(tunnel, true).await?;
        if actions.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bucket {
            id,
            weight: 1,
            actions,
        }))
    }

    /// Drops `route_ref` from the gateway group it uses on `node`. Returns
    /// false if it held none.
    pub async fn release_gateway_ref(&self, node: NodeId, route_ref: &str) -> Result<bool> {
        let Some(key) = self
            .gateways
            .lock()
            .route_refs
            .remove(&(node, route_ref.to_string()))
        else {
            return Ok(false);
        };

        let _guard = self.locks.lock(format!("{}.{}", key, node)).await;

        let emptied = {
            let mut state = self.gateways.lock();
            let empty = match state.groups.get_mut(&(node, key.clone())) {
                Some(group) => {
                    group.referrers.remove(route_ref);
                    group.referrers.is_empty()
                }
                None => false,
            };
            if empty {
                state.groups.remove(&(node, key.clone()))
            } else {
                None
            }
        };

        if let Some(group) = emptied {
            let group_key = GroupKey::new(node, group.group_id);
            let mut tx = Transaction::new();
            tx.delete_group(group_key);
            self.tx.submit(tx).await?;

            let still_used = self.gateways.lock().groups.keys().any(|(_, k)| *k == key);
            if !still_used {
                self.release_id(&key).await;
            }
            audit_log!(AuditRecord::new(AuditCategory::GroupRemove, COMPONENT, "remove_gateway_group")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(group_key.to_string())
                .with_object_type("gateway_group"));
        }
        Ok(true)
    }

    /// Routes holding a gateway group on `node`.
    pub fn gateway_refs(&self, node: NodeId) -> Vec<String> {
        let mut refs: Vec<String> = self
            .gateways
            .lock()
            .route_refs
            .keys()
            .filter(|(n, _)| *n == node)
            .map(|(_, r)| r.clone())
            .collect();
        refs.sort();
        refs
    }

    pub fn gateway_group(&self, node: NodeId, key: &str) -> Option<GatewayGroup> {
        self.gateways
            .lock()
            .groups
            .get(&(node, key.to_string()))
            .cloned()
    }

    /// Adds or removes the bucket of every gateway group reached through
    /// `interface`. Additions wait for the settle time first; removals are
    /// immediate. Returns the number of buckets changed.
    pub async fn on_tunnel_state(&self, interface: &str, state: OperState) -> Result<usize> {
        let targets: Vec<(NodeId, String, u32)> = self
            .gateways
            .lock()
            .groups
            .iter()
            .filter_map(|((node, key), group)| {
                group
                    .bucket_for(interface)
                    .map(|id| (*node, key.clone(), id))
            })
            .collect();

        let mut changed = 0;
        for (node, key, bucket_id) in targets {
            let _guard = self.locks.lock(format!("{}.{}", key, node)).await;
            let Some(group) = self.gateway_group(node, &key) else {
                continue;
            };
            let group_key = GroupKey::new(node, group.group_id);
            let live = group.live.contains(&bucket_id);

            match state {
                OperState::Up if !live => {
                    tokio::time::sleep(self.config.settle_wait).await;
                    let actions = self.collab.egress.egress_actions(interface, true).await?;
                    if actions.is_empty() {
                        warn!(
                            "{}: tunnel {} is up but has no egress actions",
                            COMPONENT, interface
                        );
                        continue;
                    }
                    self.collab
                        .installer
                        .add_bucket(
                            &group_key,
                            Bucket {
                                id: bucket_id,
                                weight: 1,
                                actions,
                            },
                        )
                        .await?;
                    self.set_live(node, &key, bucket_id, true);
                    changed += 1;
                }
                OperState::Down if live => {
                    self.collab
                        .installer
                        .remove_bucket(&group_key, bucket_id)
                        .await?;
                    self.set_live(node, &key, bucket_id, false);
                    changed += 1;
                }
                _ => continue,
            }

            info!(
                "{}: tunnel {} {}, bucket {} of {} updated",
                COMPONENT, interface, state, bucket_id, group_key
            );
            audit_log!(AuditRecord::new(AuditCategory::GroupModify, COMPONENT, "tunnel_state_change")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(group_key.to_string())
                .with_object_type("gateway_group")
                .with_details(serde_json::json!({
                    "interface": interface,
                    "state": state.to_string(),
                    "bucket": bucket_id,
                })));
        }
        Ok(changed)
    }

    fn set_live(&self, node: NodeId, key: &str, bucket_id: u32, live: bool) {
        if let Some(group) = self.gateways.lock().groups.get_mut(&(node, key.to_string())) {
            if live {
                group.live.insert(bucket_id);
            } else {
                group.live.remove(&bucket_id);
            }
        }
    }

    pub fn summary(&self) -> NextHopSummary {
        NextHopSummary {
            local_next_hops: self.local.lock().len(),
            ecmp_groups: self.ecmp.lock().len(),
            gateway_groups: self.gateways.lock().groups.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BucketOp, InMemoryFabric};
    use crate::types::InterfaceClass;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const NH_POOL: &str = "nextHopPointerPool";

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    fn manager(fabric: &InMemoryFabric) -> NextHopGroupManager {
        let collab = fabric.collaborators();
        let tx = TransactionRunner::new(collab.store.clone(), 3, Duration::from_millis(1));
        NextHopGroupManager::new(
            collab,
            tx,
            NextHopConfig {
                pool: NH_POOL.to_string(),
                settle_wait: Duration::from_millis(1),
                lock_timeout: Duration::from_millis(100),
            },
        )
    }

    fn fabric() -> InMemoryFabric {
        let fabric = InMemoryFabric::new();
        fabric.set_pool_range(NH_POOL, 150_000, 175_000);
        fabric.set_tunnel_endpoint(NodeId::new(1), ip("192.168.1.5"));
        fabric.set_tunnel_endpoint(NodeId::new(2), ip("192.168.1.6"));
        fabric.set_tunnel_endpoint(NodeId::new(3), ip("192.168.1.7"));
        fabric
    }

    fn member(next_hop: &str, owner: u64, interface: &str) -> EcmpMember {
        EcmpMember {
            next_hop: ip(next_hop),
            owner: NodeId::new(owner),
            interface: interface.to_string(),
            mac: None,
            label: None,
        }
    }

    #[tokio::test]
    async fn test_local_next_hop_shared_until_last_user() {
        let fabric = fabric();
        let manager = manager(&fabric);
        let vpn = VpnId::new(1);
        let primary: IpPrefix = "10.0.0.5/32".parse().unwrap();
        let a: IpPrefix = "10.0.0.5/32".parse().unwrap();
        let b: IpPrefix = "20.0.0.0/24".parse().unwrap();

        let first = manager
            .create_local_next_hop(vpn, NodeId::new(1), primary, "tap1", None, a)
            .await
            .unwrap();
        let second = manager
            .create_local_next_hop(vpn, NodeId::new(1), primary, "tap1", None, b)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fabric.groups_on(NodeId::new(1)).len(), 1);
        assert_eq!(fabric.direct_group_installs(), 1);

        manager.remove_local_next_hop(vpn, primary, a).await.unwrap();
        assert!(fabric.group(&GroupKey::new(NodeId::new(1), first)).is_some());
        assert!(fabric.released_ids(NH_POOL).is_empty());

        manager.remove_local_next_hop(vpn, primary, b).await.unwrap();
        assert!(fabric.group(&GroupKey::new(NodeId::new(1), first)).is_none());
        assert_eq!(fabric.released_ids(NH_POOL), vec!["nh.1.10.0.0.5/32".to_string()]);

        // A second removal is tolerated.
        manager.remove_local_next_hop(vpn, primary, b).await.unwrap();
        assert_eq!(fabric.released_ids(NH_POOL).len(), 1);
    }

    #[tokio::test]
    async fn test_local_next_hop_unknown_interface() {
        let fabric = fabric();
        fabric.forget_interface("tap9");
        let manager = manager(&fabric);
        let result = manager
            .create_local_next_hop(
                VpnId::new(1),
                NodeId::new(1),
                "10.0.0.9/32".parse().unwrap(),
                "tap9",
                None,
                "10.0.0.9/32".parse().unwrap(),
            )
            .await;
        assert!(matches!(result, Err(FibError::ResolutionMiss(_))));
        assert_eq!(fabric.released_ids(NH_POOL).len(), 1);
        assert_eq!(manager.summary().local_next_hops, 0);
    }

    #[tokio::test]
    async fn test_ecmp_member_removal_touches_one_bucket() {
        let fabric = fabric();
        let manager = manager(&fabric);
        let node = NodeId::new(1);
        let vpn = VpnId::new(1);
        let prefix: IpPrefix = "10.0.2.5/32".parse().unwrap();
        let members = vec![
            member("10.0.2.1", 1, "tapA"),
            member("10.0.2.2", 2, "tapB"),
            member("10.0.2.3", 3, "tapC"),
        ];

        let group_id = manager
            .ensure_ecmp_group(node, vpn, prefix, EcmpEncap::default(), &members)
            .await
            .unwrap();
        let group = fabric.group(&GroupKey::new(node, group_id)).unwrap();
        assert_eq!(group.group_type, GroupType::Select);
        assert_eq!(group.buckets.len(), 3);

        let before = manager.ecmp_group(node, vpn, &prefix).unwrap();
        let again = manager
            .ensure_ecmp_group(node, vpn, prefix, EcmpEncap::default(), &members[..2])
            .await
            .unwrap();
        assert_eq!(again, group_id);

        let after = manager.ecmp_group(node, vpn, &prefix).unwrap();
        assert_eq!(after.buckets.len(), 2);
        for (next_hop, id) in &after.buckets {
            assert_eq!(before.buckets.get(next_hop), Some(id));
        }
        assert_eq!(
            fabric.bucket_ops(),
            vec![BucketOp::Remove {
                group: GroupKey::new(node, group_id),
                bucket_id: before.buckets[&ip("10.0.2.3")],
            }]
        );
        assert_eq!(fabric.group(&GroupKey::new(node, group_id)).unwrap().buckets.len(), 2);
    }

    #[tokio::test]
    async fn test_ecmp_idempotent_and_removed() {
        let fabric = fabric();
        let manager = manager(&fabric);
        let node = NodeId::new(1);
        let vpn = VpnId::new(1);
        let prefix: IpPrefix = "10.0.2.5/32".parse().unwrap();
        let members = vec![member("10.0.2.1", 1, "tapA"), member("10.0.2.2", 2, "tapB")];

        manager
            .ensure_ecmp_group(node, vpn, prefix, EcmpEncap::default(), &members)
            .await
            .unwrap();
        manager
            .ensure_ecmp_group(node, vpn, prefix, EcmpEncap::default(), &members)
            .await
            .unwrap();
        assert!(fabric.bucket_ops().is_empty());
        assert_eq!(manager.summary().local_next_hops, 1);

        manager.remove_ecmp_group(node, vpn, prefix).await.unwrap();
        assert!(fabric.groups_on(node).is_empty());
        assert_eq!(manager.summary(), NextHopSummary::default());
        assert!(manager.ecmp_nodes(vpn, &prefix).is_empty());
    }

    fn gateway_adjacency(gateway: &str, tunnel: &str) -> AdjacencyResult {
        AdjacencyResult {
            interface: tunnel.to_string(),
            class: InterfaceClass::Tunnel,
            next_hop: Some(ip(gateway)),
            prefix: "30.0.0.0/24".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_gateway_group_follows_tunnel_state() {
        let fabric = fabric();
        let manager = manager(&fabric);
        let node = NodeId::new(1);
        let adjacencies = vec![
            gateway_adjacency("172.16.0.2", "tun-gw2"),
            gateway_adjacency("172.16.0.1", "tun-gw1"),
        ];
        fabric.set_interface_state("tun-gw2", OperState::Down);

        let group_id = manager
            .ensure_gateway_group(node, &adjacencies, "100:1/30.0.0.0/24")
            .await
            .unwrap();
        let key = gateway_key(&[ip("172.16.0.1"), ip("172.16.0.2")]);
        let group = manager.gateway_group(node, &key).unwrap();
        assert_eq!(group.live, BTreeSet::from([0]));

        fabric.set_interface_state("tun-gw2", OperState::Up);
        assert_eq!(manager.on_tunnel_state("tun-gw2", OperState::Up).await.unwrap(), 1);
        assert_eq!(manager.on_tunnel_state("tun-gw2", OperState::Up).await.unwrap(), 0);
        assert_eq!(manager.on_tunnel_state("tun-gw1", OperState::Down).await.unwrap(), 1);

        let buckets: Vec<u32> = fabric
            .group(&GroupKey::new(node, group_id))
            .unwrap()
            .buckets
            .iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(buckets, vec![1]);

        assert!(manager.release_gateway_ref(node, "100:1/30.0.0.0/24").await.unwrap());
        assert!(manager.gateway_group(node, &key).is_none());
        assert_eq!(fabric.released_ids(NH_POOL), vec![key]);
        assert!(!manager.release_gateway_ref(node, "100:1/30.0.0.0/24").await.unwrap());
    }

    #[tokio::test]
    async fn test_gateway_group_shared_by_routes() {
        let fabric = fabric();
        let manager = manager(&fabric);
        let node = NodeId::new(1);
        let adjacencies = vec![
            gateway_adjacency("172.16.0.1", "tun-gw1"),
            gateway_adjacency("172.16.0.2", "tun-gw2"),
        ];
        let a = manager.ensure_gateway_group(node, &adjacencies, "r1").await.unwrap();
        let b = manager.ensure_gateway_group(node, &adjacencies, "r2").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.summary().gateway_groups, 1);

        manager.release_gateway_ref(node, "r1").await.unwrap();
        assert_eq!(manager.summary().gateway_groups, 1);
        manager.release_gateway_ref(node, "r2").await.unwrap();
        assert_eq!(manager.summary().gateway_groups, 0);
    }
}
