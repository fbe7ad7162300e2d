//! Local and remote forwarding entries shared by the route handlers.
//!
//! A route is programmed as at most one local entry (on the node hosting
//! the destination, or an ECMP group on every node hosting one of its extra
//! route next hops) plus one remote entry per other active node of the
//! routing domain, pointing at a tunnel or provider port towards the owner.

use crate::adjacency::{AdjacencyResult, Reachability};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::FibContext;
use crate::error::{FibError, Result};
use crate::flow::builder::{
    fib_flow, fib_flow_key, lfib_flow, lfib_flow_key, tunnel_flow, tunnel_flow_key,
};
use crate::flow::Action;
use crate::label::{ImporterRelease, LabelRouteInfo};
use crate::nexthop::{encap_actions, EcmpEncap, EcmpMember};
use crate::txn::Transaction;
use crate::types::{PrefixCue, Route, RouteOrigin, RoutingDomain, TunnelType};
use log::{debug, info};
use std::collections::BTreeSet;
use vpnfib_types::{IpAddress, MacAddress, MplsLabel, NodeId, RouteDistinguisher, VpnId};

const COMPONENT: &str = "FibProgrammer";

/// Where and through which next hop a route is installed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub node: NodeId,
    /// Routing domain owning the local next hop. Differs from the route's
    /// own domain for leaked and self-imported routes.
    pub vpn: VpnId,
    pub primary: vpnfib_types::IpPrefix,
    pub interface: String,
    pub mac: Option<MacAddress>,
    /// Set when the forwarding state of an existing label owner is reused
    /// instead of creating a next hop.
    pub reused_label: Option<MplsLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalPlan {
    /// The destination is not hosted on any node.
    None,
    Single(LocalTarget),
    /// Extra route with several locally hosted next hops.
    Ecmp(Vec<EcmpMember>),
}

impl LocalPlan {
    /// Nodes holding the local part of the route, in order.
    pub fn nodes(&self) -> Vec<NodeId> {
        match self {
            LocalPlan::None => Vec::new(),
            LocalPlan::Single(target) => vec![target.node],
            LocalPlan::Ecmp(members) => members
                .iter()
                .map(|m| m.owner)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        }
    }

    pub fn owner(&self) -> Option<NodeId> {
        self.nodes().first().copied()
    }

    pub fn is_local(&self, node: NodeId) -> bool {
        self.nodes().contains(&node)
    }
}

/// Collects per-node failures so one bad node does not stop the others.
///
/// Benign errors are logged and dropped; the first other error is
/// returned by [`NodeErrors::finish`].
#[derive(Debug, Default)]
pub struct NodeErrors {
    first: Option<FibError>,
}

impl NodeErrors {
    pub fn record(&mut self, component: &str, context: &str, result: Result<()>) {
        let Err(e) = result else {
            return;
        };
        if e.is_benign() {
            e.log(component, context);
        } else if self.first.is_none() {
            self.first = Some(e);
        } else {
            e.log(component, context);
        }
    }

    pub fn finish(self) -> Result<()> {
        self.first.map_or(Ok(()), Err)
    }
}

/// Label of `route` that gets a label-switch entry on the owning node.
fn switched_label(domain: &RoutingDomain, route: &Route) -> Option<MplsLabel> {
    if domain.bgp_vpn && route.origin != RouteOrigin::SelfImported {
        route.label()
    } else {
        None
    }
}

// Planning

/// Works out where `route` lives locally.
///
/// A self-imported route whose label is already owned by a matching route
/// reuses the owner without consulting the directory. Otherwise the
/// destination itself is looked up, then the next hops of its extra route.
pub async fn plan_local(
    ctx: &FibContext,
    domain: &RoutingDomain,
    rd: &RouteDistinguisher,
    route: &Route,
) -> Result<LocalPlan> {
    if route.origin == RouteOrigin::SelfImported {
        if let Some(target) = reuse_target(ctx, route) {
            debug!(
                "{}: {} in {} reuses label owner on node {}",
                COMPONENT, route.prefix, domain.name, target.node
            );
            return Ok(LocalPlan::Single(target));
        }
    }

    let lookup_vpn = match (route.origin, &route.parent_rd) {
        (RouteOrigin::InterVpn, Some(parent)) => ctx.domain(parent).await?.id,
        _ => domain.id,
    };
    if let Some(info) = ctx
        .collab
        .directory
        .resolve_prefix(lookup_vpn, &route.prefix)
        .await?
    {
        if let Some((node, interface)) = info.location() {
            return Ok(LocalPlan::Single(LocalTarget {
                node,
                vpn: lookup_vpn,
                primary: route.prefix,
                interface: interface.to_string(),
                mac: info.mac,
                reused_label: None,
            }));
        }
    }

    let mut members = extra_route_members(ctx, domain, rd, route).await?;
    Ok(match members.len() {
        0 => LocalPlan::None,
        1 => {
            let member = members.remove(0);
            LocalPlan::Single(LocalTarget {
                node: member.owner,
                vpn: domain.id,
                primary: member.next_hop.host_prefix(),
                interface: member.interface,
                mac: member.mac,
                reused_label: None,
            })
        }
        _ => LocalPlan::Ecmp(members),
    })
}

/// Like [`plan_local`], but falls back to the next hops already holding
/// the route so state can be removed after the directory forgot it.
pub async fn plan_removal(
    ctx: &FibContext,
    domain: &RoutingDomain,
    rd: &RouteDistinguisher,
    route: &Route,
) -> Result<LocalPlan> {
    let plan = plan_local(ctx, domain, rd, route).await?;
    if plan != LocalPlan::None {
        return Ok(plan);
    }
    let serving = ctx
        .nexthops
        .local_next_hops_serving(domain.id, &route.prefix);
    Ok(match serving.into_iter().next() {
        Some((primary, entry)) => LocalPlan::Single(LocalTarget {
            node: entry.node,
            vpn: domain.id,
            primary,
            interface: entry.interface,
            mac: entry.mac,
            reused_label: None,
        }),
        None => LocalPlan::None,
    })
}

fn reuse_target(ctx: &FibContext, route: &Route) -> Option<LocalTarget> {
    let label = route.label()?;
    let info = ctx
        .labels
        .lookup_matching(label, &route.prefix, &route.next_hops())?;
    let primary = if ctx.nexthops.local_next_hop(info.vpn_id, &info.prefix).is_some() {
        info.prefix
    } else {
        info.next_hops
            .first()
            .map(IpAddress::host_prefix)
            .unwrap_or(info.prefix)
    };
    Some(LocalTarget {
        node: info.node,
        vpn: info.vpn_id,
        primary,
        interface: info.interface.clone().unwrap_or_default(),
        mac: None,
        reused_label: Some(label),
    })
}

/// Next hops of the extra route for `route.prefix` that are hosted on a
/// node, across every distinguisher anchoring it.
pub async fn extra_route_members(
    ctx: &FibContext,
    domain: &RoutingDomain,
    rd: &RouteDistinguisher,
    route: &Route,
) -> Result<Vec<EcmpMember>> {
    let store = &ctx.collab.store;
    let mut rds = store.read_used_rds(domain.id, &route.prefix).await?;
    if rds.is_empty() {
        rds.push(rd.clone());
    }

    let mut next_hops: Vec<IpAddress> = Vec::new();
    for anchor in &rds {
        if let Some(extra) = store
            .read_extra_route(&domain.name, anchor, &route.prefix)
            .await?
        {
            for next_hop in extra.next_hops {
                if !next_hops.contains(&next_hop) {
                    next_hops.push(next_hop);
                }
            }
        }
    }
    if next_hops.is_empty() && route.origin == RouteOrigin::Static {
        next_hops = route.next_hops();
    }

    let mut members = Vec::new();
    for next_hop in next_hops {
        let info = ctx
            .collab
            .directory
            .resolve_prefix(domain.id, &next_hop.host_prefix())
            .await?;
        let Some((owner, interface)) = info.as_ref().and_then(|i| i.location()) else {
            debug!(
                "{}: next hop {} of {} is not hosted anywhere",
                COMPONENT, next_hop, route.prefix
            );
            continue;
        };
        members.push(EcmpMember {
            next_hop,
            owner,
            interface: interface.to_string(),
            mac: info.as_ref().and_then(|i| i.mac),
            label: route.label_for(&next_hop).or_else(|| route.label()),
        });
    }
    Ok(members)
}

// Local entries

/// Installs the local entry of `route` on `target.node`, plus the
/// label-switch and tunnel-demultiplex entries when `with_label_switch` is
/// set and the domain is externally advertised.
pub async fn install_local_entry(
    ctx: &FibContext,
    domain: &RoutingDomain,
    rd: &RouteDistinguisher,
    route: &Route,
    target: &LocalTarget,
    with_label_switch: bool,
) -> Result<()> {
    if !target.interface.is_empty() {
        ctx.interface_wait.wait_until_up(&target.interface).await;
    }
    let _local = ctx.lock_local(domain.id, target.node, &route.prefix).await;

    let group_id = match target.reused_label {
        Some(label) => ctx
            .nexthops
            .local_next_hop(target.vpn, &target.primary)
            .map(|nh| nh.group_id)
            .or_else(|| {
                ctx.nexthops
                    .ecmp_group(target.node, target.vpn, &route.prefix)
                    .map(|record| record.group_id)
            })
            .ok_or_else(|| {
                FibError::resolution_miss(format!(
                    "owner of label {} has no next hop on node {}",
                    label, target.node
                ))
            })?,
        None => {
            ctx.nexthops
                .create_local_next_hop(
                    target.vpn,
                    target.node,
                    target.primary,
                    &target.interface,
                    target.mac,
                    route.prefix,
                )
                .await?
        }
    };

    let mut tx = Transaction::new();
    tx.put_flow(fib_flow(
        target.node,
        domain.id,
        &route.prefix,
        vec![Action::Group(group_id)],
    ));
    if with_label_switch {
        if let Some(label) = switched_label(domain, route) {
            tx.put_flow(lfib_flow(
                target.node,
                label,
                route.prefix.ethertype(),
                vec![Action::Group(group_id)],
            ));
            tx.put_flow(tunnel_flow(
                target.node,
                u64::from(label.value()),
                vec![Action::Group(group_id)],
            ));
        }
    }
    ctx.tx.submit(tx).await?;

    if let Some(label) = route.label() {
        match target.reused_label {
            Some(_) => {
                if ctx.labels.add_importer(label, &domain.name).await.is_none() {
                    debug!("{}: label {} vanished before import", COMPONENT, label);
                }
            }
            None => {
                ctx.labels
                    .register(LabelRouteInfo {
                        label,
                        prefix: route.prefix,
                        next_hops: route.next_hops(),
                        node: target.node,
                        interface: Some(target.interface.clone()),
                        parent_rd: route.label_owner_rd(rd).clone(),
                        vpn_id: target.vpn,
                        vpn_name: domain.name.clone(),
                        importers: BTreeSet::from([domain.name.clone()]),
                    })
                    .await;
            }
        }
    }

    audit_log!(AuditRecord::new(AuditCategory::RouteProgram, COMPONENT, "install_local_entry")
        .with_outcome(AuditOutcome::Success)
        .with_object_id(fib_flow_key(target.node, domain.id, &route.prefix).to_string())
        .with_object_type("fib_entry")
        .with_details(serde_json::json!({
            "group": group_id,
            "interface": target.interface,
            "reused": target.reused_label.is_some(),
        })));
    Ok(())
}

/// Removes what [`install_local_entry`] installed and drops the domain as
/// an importer of the route's label.
///
/// The label-switch entries and the next hop are shared by every domain
/// importing the label: while importers remain only this domain's entry
/// goes, and the last importer out removes the rest, whichever domain it is.
pub async fn remove_local_entry(
    ctx: &FibContext,
    domain: &RoutingDomain,
    route: &Route,
    target: &LocalTarget,
) -> Result<()> {
    let _local = ctx.lock_local(domain.id, target.node, &route.prefix).await;

    let release = match route.label() {
        Some(label) => Some((label, release_label(ctx, domain, label).await?)),
        None => None,
    };
    let shared_kept = matches!(release, Some((_, ImporterRelease::Remaining(_))));

    let mut tx = Transaction::new();
    tx.delete_flow(fib_flow_key(target.node, domain.id, &route.prefix));
    if !shared_kept {
        match (target.reused_label, release) {
            (Some(label), _) | (None, Some((label, ImporterRelease::Released))) => {
                tx.delete_flow(lfib_flow_key(target.node, label));
                tx.delete_flow(tunnel_flow_key(target.node, u64::from(label.value())));
            }
            _ => {
                if let Some(label) = switched_label(domain, route) {
                    tx.delete_flow(lfib_flow_key(target.node, label));
                    tx.delete_flow(tunnel_flow_key(target.node, u64::from(label.value())));
                }
            }
        }
    }
    ctx.tx.submit(tx).await?;

    if shared_kept {
        debug!(
            "{}: {} leaves {} to the remaining importers",
            COMPONENT, domain.name, route.prefix
        );
    } else {
        ctx.nexthops
            .remove_local_next_hop(target.vpn, target.primary, route.prefix)
            .await?;
    }

    audit_log!(AuditRecord::new(AuditCategory::RouteRemove, COMPONENT, "remove_local_entry")
        .with_outcome(AuditOutcome::Success)
        .with_object_id(fib_flow_key(target.node, domain.id, &route.prefix).to_string())
        .with_object_type("fib_entry")
        .with_details(serde_json::json!({ "shared_state_kept": shared_kept })));
    Ok(())
}

/// Drops `domain` as an importer of `label`.
pub async fn release_label(
    ctx: &FibContext,
    domain: &RoutingDomain,
    label: MplsLabel,
) -> Result<ImporterRelease> {
    let outcome = ctx.labels.remove_importer(label, &domain.name).await?;
    if outcome == ImporterRelease::Released {
        info!("{}: label {} released by {}", COMPONENT, label, domain.name);
        audit_log!(AuditRecord::new(AuditCategory::LabelRelease, COMPONENT, "release_label")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(label.to_string())
            .with_object_type("label")
            .with_details(serde_json::json!({ "vpn": domain.name })));
    }
    Ok(outcome)
}

/// Registers the label of an extra route spread over several nodes.
pub async fn register_ecmp_label(
    ctx: &FibContext,
    domain: &RoutingDomain,
    rd: &RouteDistinguisher,
    route: &Route,
    members: &[EcmpMember],
) {
    let (Some(label), Some(owner)) = (route.label(), members.iter().map(|m| m.owner).min()) else {
        return;
    };
    ctx.labels
        .register(LabelRouteInfo {
            label,
            prefix: route.prefix,
            next_hops: members.iter().map(|m| m.next_hop).collect(),
            node: owner,
            interface: None,
            parent_rd: route.label_owner_rd(rd).clone(),
            vpn_id: domain.id,
            vpn_name: domain.name.clone(),
            importers: BTreeSet::from([domain.name.clone()]),
        })
        .await;
}

// ECMP entries

async fn ecmp_encap(ctx: &FibContext, domain: &RoutingDomain, route: &Route) -> Result<EcmpEncap> {
    let tunnel_id = if domain.enforce_vxlan_semantics {
        route.l3vni.or(domain.l3vni).map(u64::from)
    } else {
        None
    };
    Ok(match ctx.resolver.reachability(domain, route).await? {
        Reachability::Tunnel(tunnel_type) => EcmpEncap {
            tunnel_type,
            tunnel_id,
        },
        Reachability::L2 => EcmpEncap::default(),
    })
}

/// Points the entry of an extra route on `node` at its select group,
/// creating or updating the group as needed.
pub async fn program_ecmp_entry(
    ctx: &FibContext,
    domain: &RoutingDomain,
    route: &Route,
    members: &[EcmpMember],
    node: NodeId,
) -> Result<()> {
    let owner = members.iter().any(|m| m.owner == node);
    for member in members.iter().filter(|m| m.owner == node) {
        ctx.interface_wait.wait_until_up(&member.interface).await;
    }

    let _local = ctx.lock_local(domain.id, node, &route.prefix).await;
    let encap = ecmp_encap(ctx, domain, route).await?;
    let group_id = ctx
        .nexthops
        .ensure_ecmp_group(node, domain.id, route.prefix, encap, members)
        .await?;

    let mut tx = Transaction::new();
    tx.put_flow(fib_flow(
        node,
        domain.id,
        &route.prefix,
        vec![Action::Group(group_id)],
    ));
    if owner {
        if let Some(label) = switched_label(domain, route) {
            tx.put_flow(lfib_flow(
                node,
                label,
                route.prefix.ethertype(),
                vec![Action::Group(group_id)],
            ));
            tx.put_flow(tunnel_flow(
                node,
                u64::from(label.value()),
                vec![Action::Group(group_id)],
            ));
        }
    }
    ctx.tx.submit(tx).await?;
    debug!(
        "{}: {} on node {} points at select group {}",
        COMPONENT, route.prefix, node, group_id
    );
    Ok(())
}

pub async fn remove_ecmp_entry(
    ctx: &FibContext,
    domain: &RoutingDomain,
    route: &Route,
    node: NodeId,
) -> Result<()> {
    let _local = ctx.lock_local(domain.id, node, &route.prefix).await;
    let mut tx = Transaction::new();
    tx.delete_flow(fib_flow_key(node, domain.id, &route.prefix));
    if let Some(label) = switched_label(domain, route) {
        tx.delete_flow(lfib_flow_key(node, label));
        tx.delete_flow(tunnel_flow_key(node, u64::from(label.value())));
    }
    ctx.tx.submit(tx).await?;
    ctx.nexthops
        .remove_ecmp_group(node, domain.id, route.prefix)
        .await
}

// Remote entries

/// Tunnel id written on packets leaving towards the owner of `route` over
/// VXLAN.
///
/// A NAT or physical network function destination keeps its own segment
/// id. Otherwise domains enforcing VXLAN semantics use the L3 VNI, and the
/// rest the route label, falling back to the L3 VNI.
pub async fn select_tunnel_id(
    ctx: &FibContext,
    domain: &RoutingDomain,
    route: &Route,
) -> Result<Option<u64>> {
    let directory = &ctx.collab.directory;
    if let Some(info) = directory.resolve_prefix(domain.id, &route.prefix).await? {
        if matches!(info.cue, PrefixCue::Nat | PrefixCue::PhysNetFunc) {
            if let Some(subnet) = info.subnet {
                let segment = directory.resolve_subnet_segment(&subnet).await?;
                if let Some(vni) = segment.and_then(|s| s.vxlan_id()) {
                    return Ok(Some(u64::from(vni)));
                }
            }
        }
    }

    let l3vni = route.l3vni.or(domain.l3vni).map(u64::from);
    if domain.enforce_vxlan_semantics {
        return Ok(l3vni);
    }
    Ok(route
        .label()
        .map(|label| u64::from(label.value()))
        .or(l3vni))
}

/// Egress actions of `adjacency`; an interface without any is a miss.
pub async fn egress_for(ctx: &FibContext, adjacency: &AdjacencyResult) -> Result<Vec<Action>> {
    let actions = ctx
        .collab
        .egress
        .egress_actions(&adjacency.interface, adjacency.is_tunnel())
        .await?;
    if actions.is_empty() {
        return Err(FibError::resolution_miss(format!(
            "no egress actions for {}",
            adjacency.interface
        )));
    }
    Ok(actions)
}

/// Adjacency from `node` towards the owner of `route`: the route's own
/// paths first, then the tunnel endpoint of the owning node.
pub async fn remote_adjacency(
    ctx: &FibContext,
    domain: &RoutingDomain,
    rd: &RouteDistinguisher,
    route: &Route,
    node: NodeId,
    owner: Option<NodeId>,
) -> Result<Option<AdjacencyResult>> {
    if let Some(adjacency) = ctx
        .resolver
        .resolve(node, domain, route, rd)
        .await?
        .into_iter()
        .next()
    {
        return Ok(Some(adjacency));
    }
    let Some(owner) = owner.filter(|owner| *owner != node) else {
        return Ok(None);
    };
    let Some(endpoint) = ctx.collab.egress.tunnel_endpoint(owner).await? else {
        return Ok(None);
    };
    ctx.resolver
        .resolve_towards(node, domain, route, endpoint)
        .await
}

async fn remote_actions(
    ctx: &FibContext,
    domain: &RoutingDomain,
    route: &Route,
    adjacency: &AdjacencyResult,
) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    if adjacency.is_tunnel() {
        match ctx.resolver.reachability(domain, route).await? {
            Reachability::Tunnel(TunnelType::Vxlan) => {
                if let Some(id) = select_tunnel_id(ctx, domain, route).await? {
                    actions.push(Action::SetTunnelId(id));
                }
            }
            _ => actions.extend(encap_actions(TunnelType::MplsOverGre, route.label(), None)),
        }
    }
    actions.extend(egress_for(ctx, adjacency).await?);
    Ok(actions)
}

/// Installs the remote entry of `route` on `node`.
pub async fn install_remote_entry(
    ctx: &FibContext,
    domain: &RoutingDomain,
    rd: &RouteDistinguisher,
    route: &Route,
    node: NodeId,
    plan: &LocalPlan,
) -> Result<()> {
    if let LocalPlan::Ecmp(members) = plan {
        return program_ecmp_entry(ctx, domain, route, members, node).await;
    }

    let adjacency = remote_adjacency(ctx, domain, rd, route, node, plan.owner())
        .await?
        .ok_or_else(|| {
            FibError::resolution_miss(format!(
                "no adjacency for {} in {} on node {}",
                route.prefix, domain.name, node
            ))
        })?;
    let actions = remote_actions(ctx, domain, route, &adjacency).await?;

    let mut tx = Transaction::new();
    tx.put_flow(fib_flow(node, domain.id, &route.prefix, actions));
    ctx.tx.submit(tx).await?;
    debug!(
        "{}: remote entry for {} in {} on node {} via {}",
        COMPONENT, route.prefix, domain.name, node, adjacency.interface
    );
    Ok(())
}

/// Removes the remote entry of `route` on `node`, with its select group if
/// it had one.
pub async fn remove_remote_entry(
    ctx: &FibContext,
    domain: &RoutingDomain,
    route: &Route,
    node: NodeId,
) -> Result<()> {
    let mut tx = Transaction::new();
    tx.delete_flow(fib_flow_key(node, domain.id, &route.prefix));
    ctx.tx.submit(tx).await?;
    if ctx
        .nexthops
        .ecmp_group(node, domain.id, &route.prefix)
        .is_some()
    {
        ctx.nexthops
            .remove_ecmp_group(node, domain.id, route.prefix)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::config::FibConfig;
    use crate::sim::InMemoryFabric;
    use crate::types::{ExtraRoute, NodeState, OperState, PrefixInfo};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use vpnfib_types::IpPrefix;

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    fn setup() -> (InMemoryFabric, FibContext, RoutingDomain) {
        let fabric = InMemoryFabric::new();
        let domain = RoutingDomain::new("vpnA", VpnId::new(1), "100:1".parse().unwrap())
            .with_node(NodeId::new(1), NodeState::Active)
            .with_node(NodeId::new(2), NodeState::Active);
        fabric.add_domain(domain.clone());
        fabric.set_tunnel_endpoint(NodeId::new(1), ip("192.168.1.5"));
        fabric.set_tunnel_endpoint(NodeId::new(2), ip("192.168.1.6"));
        let collab: Collaborators = fabric.collaborators();
        let ctx = FibContext::new(FibConfig::default(), collab);
        (fabric, ctx, domain)
    }

    #[tokio::test]
    async fn test_plan_prefers_directory_owner() {
        let (fabric, ctx, domain) = setup();
        let prefix = "10.0.0.0/24".parse().unwrap();
        fabric.add_prefix(domain.id, PrefixInfo::new(prefix, NodeId::new(1), "tap1"));
        let route = Route::new(prefix, RouteOrigin::Connected).with_path(ip("192.168.1.5"), None);

        let plan = plan_local(&ctx, &domain, &domain.rd, &route).await.unwrap();
        let LocalPlan::Single(target) = plan else {
            panic!("expected a single local target, got {:?}", plan);
        };
        assert_eq!(target.node, NodeId::new(1));
        assert_eq!(target.primary, prefix);
        assert_eq!(target.interface, "tap1");
    }

    #[tokio::test]
    async fn test_plan_spreads_extra_route_over_owners() {
        let (fabric, ctx, domain) = setup();
        let prefix = "10.0.2.5/32".parse().unwrap();
        fabric.add_prefix(
            domain.id,
            PrefixInfo::new("10.0.2.1/32".parse().unwrap(), NodeId::new(1), "tap1"),
        );
        fabric.add_prefix(
            domain.id,
            PrefixInfo::new("10.0.2.2/32".parse().unwrap(), NodeId::new(2), "tap2"),
        );
        fabric.add_extra_route(
            &domain.name,
            &domain.rd,
            ExtraRoute {
                prefix,
                next_hops: vec![ip("10.0.2.1"), ip("10.0.2.2")],
            },
        );
        let route = Route::new(prefix, RouteOrigin::Static)
            .with_path(ip("10.0.2.1"), None)
            .with_path(ip("10.0.2.2"), None);

        let plan = plan_local(&ctx, &domain, &domain.rd, &route).await.unwrap();
        assert_eq!(plan.nodes(), vec![NodeId::new(1), NodeId::new(2)]);
        assert!(matches!(plan, LocalPlan::Ecmp(ref members) if members.len() == 2));
    }

    #[tokio::test]
    async fn test_plan_none_without_owner() {
        let (_fabric, ctx, domain) = setup();
        let route = Route::new("10.7.0.0/24".parse().unwrap(), RouteOrigin::Connected);
        let plan = plan_local(&ctx, &domain, &domain.rd, &route).await.unwrap();
        assert_eq!(plan, LocalPlan::None);
        assert_eq!(plan.owner(), None);
    }

    #[tokio::test]
    async fn test_tunnel_id_selection() {
        let (_fabric, ctx, mut domain) = setup();
        domain.l3vni = Some(9000);
        let labelled = Route::new("10.0.0.0/24".parse().unwrap(), RouteOrigin::Connected)
            .with_label(MplsLabel::new(300).unwrap());

        assert_eq!(
            select_tunnel_id(&ctx, &domain, &labelled).await.unwrap(),
            Some(300)
        );

        domain.enforce_vxlan_semantics = true;
        assert_eq!(
            select_tunnel_id(&ctx, &domain, &labelled).await.unwrap(),
            Some(9000)
        );

        domain.enforce_vxlan_semantics = false;
        let unlabelled = Route::new("10.0.1.0/24".parse().unwrap(), RouteOrigin::Connected);
        assert_eq!(
            select_tunnel_id(&ctx, &domain, &unlabelled).await.unwrap(),
            Some(9000)
        );
    }

    #[tokio::test]
    async fn test_upgrade_wait_leaves_local_entry_unlocked() {
        let (fabric, ctx, domain) = setup();
        let ctx = Arc::new(ctx);
        ctx.interface_wait.set_upgrade_in_progress(true);
        fabric.set_interface_state("tap1", OperState::Down);
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        fabric.add_prefix(domain.id, PrefixInfo::new(prefix, NodeId::new(1), "tap1"));
        let route = Route::new(prefix, RouteOrigin::Connected).with_path(ip("192.168.1.5"), None);
        let LocalPlan::Single(target) = plan_local(&ctx, &domain, &domain.rd, &route).await.unwrap()
        else {
            panic!("expected a single local target");
        };

        let install = {
            let ctx = ctx.clone();
            let domain = domain.clone();
            tokio::spawn(async move {
                install_local_entry(&ctx, &domain, &domain.rd, &route, &target, false).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!install.is_finished());
        let guard = tokio::time::timeout(
            Duration::from_millis(100),
            ctx.lock_local(domain.id, NodeId::new(1), &prefix),
        )
        .await;
        assert!(guard.is_ok());
        drop(guard);

        fabric.set_interface_state("tap1", OperState::Up);
        install.await.unwrap().unwrap();
        assert!(fabric.fib_entry(NodeId::new(1), domain.id, &prefix).is_some());
    }

    #[test]
    fn test_node_errors_keep_first_hard_failure() {
        let mut errors = NodeErrors::default();
        errors.record("test", "node 1", Err(FibError::resolution_miss("no tunnel")));
        errors.record("test", "node 2", Ok(()));
        assert!(errors.finish().is_ok());

        let mut errors = NodeErrors::default();
        errors.record("test", "node 1", Err(FibError::malformed("first")));
        errors.record("test", "node 2", Err(FibError::malformed("second")));
        assert!(matches!(errors.finish(), Err(FibError::Malformed(m)) if m == "first"));
    }
}
