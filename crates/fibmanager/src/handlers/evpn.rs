//! VXLAN encapsulated routes exchanged over EVPN.

use super::subnet::SubnetRouteHandler;
use super::RouteHandler;
use crate::adjacency::AdjacencyResult;
use crate::context::FibContext;
use crate::error::Result;
use crate::flow::builder::{fib_flow, fib_flow_key};
use crate::flow::Action;
use crate::programmer::{self, LocalPlan, LocalTarget, NodeErrors};
use crate::txn::Transaction;
use crate::types::{PrefixCue, Route, RouteOrigin, RoutingDomain};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use vpnfib_types::{NodeId, RouteDistinguisher};

const COMPONENT: &str = "EvpnRouteHandler";

pub struct EvpnRouteHandler {
    ctx: Arc<FibContext>,
    subnet: SubnetRouteHandler,
}

impl EvpnRouteHandler {
    pub fn new(ctx: Arc<FibContext>) -> Self {
        Self {
            subnet: SubnetRouteHandler::new(ctx.clone()),
            ctx,
        }
    }

    /// The local owner of the route: its directory entry, or the first
    /// locally hosted next hop of its extra route.
    async fn local_target(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<Option<LocalTarget>> {
        Ok(match programmer::plan_local(&self.ctx, domain, rd, route).await? {
            LocalPlan::None => None,
            LocalPlan::Single(target) => Some(target),
            LocalPlan::Ecmp(members) => members.into_iter().next().map(|member| LocalTarget {
                node: member.owner,
                vpn: domain.id,
                primary: member.next_hop.host_prefix(),
                interface: member.interface,
                mac: member.mac,
                reused_label: None,
            }),
        })
    }

    /// VNI written on packets towards the owner.
    ///
    /// External and NAT destinations use the domain's L3 VNI; others use the
    /// VNI of their own segment, falling back to the route label.
    async fn tunnel_id(&self, domain: &RoutingDomain, route: &Route) -> Result<Option<u64>> {
        let directory = &self.ctx.collab.directory;
        let info = directory.resolve_prefix(domain.id, &route.prefix).await?;
        let l3vni = route.l3vni.or(domain.l3vni).map(u64::from);

        let nat = info.as_ref().map(|i| i.cue) == Some(PrefixCue::Nat);
        if route.origin == RouteOrigin::Bgp || nat {
            return Ok(l3vni);
        }
        if let Some(subnet) = info.and_then(|i| i.subnet) {
            if let Some(vni) = directory
                .resolve_subnet_segment(&subnet)
                .await?
                .and_then(|segment| segment.vxlan_id())
            {
                return Ok(Some(u64::from(vni)));
            }
        }
        Ok(route
            .label()
            .map(|label| u64::from(label.value()))
            .or(l3vni))
    }

    async fn remote_actions(
        &self,
        domain: &RoutingDomain,
        route: &Route,
        adjacency: &AdjacencyResult,
    ) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        if let Some(mac) = route.gateway_mac {
            actions.push(Action::SetEthDst(mac));
        }
        if let Some(id) = self.tunnel_id(domain, route).await? {
            actions.push(Action::SetTunnelId(id));
        }
        actions.extend(programmer::egress_for(&self.ctx, adjacency).await?);
        Ok(actions)
    }

    async fn install_remote(
        &self,
        domain: &RoutingDomain,
        route: &Route,
        node: NodeId,
        adjacency: &AdjacencyResult,
    ) -> Result<()> {
        let actions = self.remote_actions(domain, route, adjacency).await?;
        let mut tx = Transaction::new();
        tx.put_flow(fib_flow(node, domain.id, &route.prefix, actions));
        self.ctx.tx.submit(tx).await
    }

    async fn remove_entry(&self, domain: &RoutingDomain, route: &Route, node: NodeId) -> Result<()> {
        let mut tx = Transaction::new();
        tx.delete_flow(fib_flow_key(node, domain.id, &route.prefix));
        self.ctx.tx.submit(tx).await
    }
}

#[async_trait]
impl RouteHandler for EvpnRouteHandler {
    fn name(&self) -> &'static str {
        "evpn"
    }

    async fn create(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        if route.subnet_route.is_some() {
            return self.subnet.create(domain, rd, route).await;
        }

        let local = self.local_target(domain, rd, route).await?;
        let owner = local.as_ref().map(|target| target.node);

        let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
        let mut remote = Vec::new();
        for node in domain.active_nodes() {
            if Some(node) == owner {
                continue;
            }
            if let Some(adjacency) =
                programmer::remote_adjacency(&self.ctx, domain, rd, route, node, owner).await?
            {
                remote.push((node, adjacency));
            }
        }

        if local.is_none() && remote.is_empty() {
            warn!(
                "{}: no local or remote adjacency for {} in {}, not installing",
                COMPONENT, route.prefix, domain.name
            );
            return Ok(());
        }

        let mut errors = NodeErrors::default();
        if let Some(target) = &local {
            let result =
                programmer::install_local_entry(&self.ctx, domain, rd, route, target, false).await;
            errors.record(COMPONENT, &format!("{} on node {}", route.prefix, target.node), result);
        }
        for (node, adjacency) in &remote {
            let result = self.install_remote(domain, route, *node, adjacency).await;
            errors.record(COMPONENT, &format!("{} on node {}", route.prefix, node), result);
        }
        debug!(
            "{}: {} in {} local on {:?}, remote on {} nodes",
            COMPONENT,
            route.prefix,
            domain.name,
            owner,
            remote.len()
        );
        errors.finish()
    }

    async fn remove(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        if route.subnet_route.is_some() {
            return self.subnet.remove(domain, rd, route).await;
        }

        let owner = match programmer::plan_removal(&self.ctx, domain, rd, route).await? {
            LocalPlan::Single(target) => {
                programmer::remove_local_entry(&self.ctx, domain, route, &target).await?;
                Some(target.node)
            }
            LocalPlan::Ecmp(_) | LocalPlan::None => {
                if let Some(label) = route.label() {
                    programmer::release_label(&self.ctx, domain, label).await?;
                }
                None
            }
        };

        let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
        let mut errors = NodeErrors::default();
        for membership in &domain.nodes {
            if Some(membership.node) == owner {
                continue;
            }
            let result = self.remove_entry(domain, route, membership.node).await;
            errors.record(
                COMPONENT,
                &format!("{} on node {}", route.prefix, membership.node),
                result,
            );
        }
        errors.finish()
    }

    async fn create_remote_only(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        if route.subnet_route.is_some() {
            return self.subnet.create_remote_only(domain, rd, route, node).await;
        }
        let owner = self
            .local_target(domain, rd, route)
            .await?
            .map(|target| target.node);
        if owner == Some(node) {
            return Ok(());
        }
        match programmer::remote_adjacency(&self.ctx, domain, rd, route, node, owner).await? {
            Some(adjacency) => self.install_remote(domain, route, node, &adjacency).await,
            None => {
                warn!(
                    "{}: no adjacency for {} from node {}",
                    COMPONENT, route.prefix, node
                );
                Ok(())
            }
        }
    }

    async fn remove_from_node(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        if route.subnet_route.is_some() {
            return self.subnet.remove_from_node(domain, rd, route, node).await;
        }
        let owner = self
            .local_target(domain, rd, route)
            .await?
            .map(|target| target.node);
        if owner == Some(node) {
            return Ok(());
        }
        self.remove_entry(domain, route, node).await
    }
}
