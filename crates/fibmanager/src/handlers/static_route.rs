//! Statically configured routes, possibly spread over several next hops
//! as an extra route.

use super::inline::InlineRouteHandler;
use super::RouteHandler;
use crate::context::FibContext;
use crate::error::Result;
use crate::programmer::{self, NodeErrors};
use crate::types::{Route, RoutingDomain};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use vpnfib_types::{IpAddress, NodeId, RouteDistinguisher};

const COMPONENT: &str = "StaticRouteHandler";

pub struct StaticRouteHandler {
    ctx: Arc<FibContext>,
    inline: InlineRouteHandler,
}

impl StaticRouteHandler {
    pub fn new(ctx: Arc<FibContext>) -> Self {
        Self {
            inline: InlineRouteHandler::new(ctx.clone()),
            ctx,
        }
    }

    /// Drops `next_hop` from the extra-route record anchoring it and
    /// releases its local adjacency for `route`.
    async fn forget_next_hop(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        next_hop: IpAddress,
    ) -> Result<()> {
        let store = &self.ctx.collab.store;
        let mut anchors = store.read_used_rds(domain.id, &route.prefix).await?;
        if anchors.is_empty() {
            anchors.push(rd.clone());
        }

        for anchor in &anchors {
            let Some(mut extra) = store
                .read_extra_route(&domain.name, anchor, &route.prefix)
                .await?
            else {
                continue;
            };
            if !extra.next_hops.contains(&next_hop) {
                continue;
            }
            extra.next_hops.retain(|hop| *hop != next_hop);
            if extra.next_hops.is_empty() {
                store
                    .delete_extra_route(&domain.name, anchor, &route.prefix)
                    .await?;
                store
                    .remove_used_rd(domain.id, &route.prefix, anchor)
                    .await?;
                debug!(
                    "{}: extra route {} under {} is now empty",
                    COMPONENT, route.prefix, anchor
                );
            } else {
                store.write_extra_route(&domain.name, anchor, extra).await?;
            }
            break;
        }

        self.ctx
            .nexthops
            .remove_local_next_hop(domain.id, next_hop.host_prefix(), route.prefix)
            .await
    }
}

#[async_trait]
impl RouteHandler for StaticRouteHandler {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn create(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        self.inline.create(domain, rd, route).await
    }

    async fn remove(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        self.inline.remove(domain, rd, route).await
    }

    /// Applies the next-hop delta: bookkeeping for removed next hops first,
    /// then the route is re-created for the new set.
    async fn update(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        original: &Route,
        update: &Route,
    ) -> Result<bool> {
        let used_rds = self
            .ctx
            .collab
            .store
            .read_used_rds(domain.id, &original.prefix)
            .await?;
        if used_rds.is_empty() && (original.paths.is_empty() || update.paths.is_empty()) {
            debug!(
                "{}: nothing to reconcile for {} in {}",
                COMPONENT, update.prefix, domain.name
            );
            return Ok(false);
        }

        let before = original.next_hops();
        let after = update.next_hops();
        let removed: Vec<IpAddress> = before
            .iter()
            .filter(|hop| !after.contains(hop))
            .copied()
            .collect();
        for next_hop in &removed {
            self.forget_next_hop(domain, rd, original, *next_hop).await?;
        }

        if before.len() > 1 && after.len() <= 1 {
            let mut errors = NodeErrors::default();
            for node in self.ctx.nexthops.ecmp_nodes(domain.id, &original.prefix) {
                let result = programmer::remove_ecmp_entry(&self.ctx, domain, original, node).await;
                errors.record(COMPONENT, &format!("{} on node {}", original.prefix, node), result);
            }
            errors.finish()?;
        }

        if !removed.is_empty() {
            info!(
                "{}: {} in {} lost {} next hops",
                COMPONENT,
                update.prefix,
                domain.name,
                removed.len()
            );
        }
        self.inline.create(domain, rd, update).await?;
        Ok(true)
    }

    async fn create_remote_only(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        self.inline.create_remote_only(domain, rd, route, node).await
    }

    async fn remove_from_node(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        self.inline.remove_from_node(domain, rd, route, node).await
    }
}
