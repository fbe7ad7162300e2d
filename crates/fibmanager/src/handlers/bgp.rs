//! Routes learned from external BGP peers.
//!
//! Every active node gets an entry towards the data center gateways; with
//! more than one gateway the entry points at a load-balancing group shared
//! by every route using the same gateway set.

use super::RouteHandler;
use crate::context::FibContext;
use crate::error::{FibError, Result};
use crate::flow::builder::{fib_flow, fib_flow_key};
use crate::flow::Action;
use crate::nexthop::encap_actions;
use crate::programmer::{self, NodeErrors};
use crate::txn::Transaction;
use crate::types::{Route, RouteKey, RoutingDomain, TunnelType};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use vpnfib_types::{NodeId, RouteDistinguisher};

const COMPONENT: &str = "BgpRouteHandler";

pub struct BgpRouteHandler {
    ctx: Arc<FibContext>,
}

impl BgpRouteHandler {
    pub fn new(ctx: Arc<FibContext>) -> Self {
        Self { ctx }
    }

    fn route_ref(rd: &RouteDistinguisher, route: &Route) -> String {
        RouteKey::new(rd.clone(), route.prefix).to_string()
    }

    async fn program_node(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        let adjacencies = self.ctx.resolver.resolve(node, domain, route, rd).await?;
        let route_ref = Self::route_ref(rd, route);

        let actions = match adjacencies.as_slice() {
            [] => {
                return Err(FibError::resolution_miss(format!(
                    "no gateway reachable from node {} for {}",
                    node, route_ref
                )))
            }
            [adjacency] => {
                let label = adjacency
                    .next_hop
                    .and_then(|hop| route.label_for(&hop))
                    .or_else(|| route.label());
                let mut actions = encap_actions(TunnelType::MplsOverGre, label, None);
                actions.extend(programmer::egress_for(&self.ctx, adjacency).await?);
                actions
            }
            _ => {
                let group_id = self
                    .ctx
                    .nexthops
                    .ensure_gateway_group(node, &adjacencies, &route_ref)
                    .await?;
                let mut actions = encap_actions(TunnelType::MplsOverGre, route.label(), None);
                actions.push(Action::Group(group_id));
                actions
            }
        };

        let mut tx = Transaction::new();
        tx.put_flow(fib_flow(node, domain.id, &route.prefix, actions));
        self.ctx.tx.submit(tx).await?;

        if adjacencies.len() == 1 {
            // A route that shrank to a single gateway no longer needs its group.
            self.ctx.nexthops.release_gateway_ref(node, &route_ref).await?;
        }
        debug!(
            "{}: {} on node {} via {} gateways",
            COMPONENT,
            route_ref,
            node,
            adjacencies.len()
        );
        Ok(())
    }

    async fn unprogram_node(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        let mut tx = Transaction::new();
        tx.delete_flow(fib_flow_key(node, domain.id, &route.prefix));
        self.ctx.tx.submit(tx).await?;
        self.ctx
            .nexthops
            .release_gateway_ref(node, &Self::route_ref(rd, route))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RouteHandler for BgpRouteHandler {
    fn name(&self) -> &'static str {
        "bgp"
    }

    async fn create(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
        let mut errors = NodeErrors::default();
        for node in domain.active_nodes() {
            let result = self.program_node(domain, rd, route, node).await;
            errors.record(COMPONENT, &format!("{} on node {}", route.prefix, node), result);
        }
        errors.finish()
    }

    /// A changed external route replaces the previous one wholesale.
    async fn update(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        _original: &Route,
        update: &Route,
    ) -> Result<bool> {
        self.create(domain, rd, update).await?;
        Ok(true)
    }

    async fn remove(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        {
            let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
            let mut errors = NodeErrors::default();
            for membership in &domain.nodes {
                let node = membership.node;
                let result = self.unprogram_node(domain, rd, route, node).await;
                errors.record(COMPONENT, &format!("{} on node {}", route.prefix, node), result);
            }
            errors.finish()?;
        }
        if let Some(label) = route.label() {
            programmer::release_label(&self.ctx, domain, label).await?;
        }
        Ok(())
    }

    async fn create_remote_only(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        self.program_node(domain, rd, route, node).await
    }

    async fn remove_from_node(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        self.unprogram_node(domain, rd, route, node).await
    }
}
