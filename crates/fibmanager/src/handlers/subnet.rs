//! Subnet routes: traffic for the subnet is handed to its broadcast domain
//! on every node instead of being routed to a single owner.

use super::RouteHandler;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::FibContext;
use crate::error::{FibError, Result};
use crate::flow::builder::{
    fib_flow_key, lfib_flow_key, subnet_broadcast_drop_flow, subnet_drop_flow_key,
    subnet_lfib_flow, subnet_route_flow,
};
use crate::label::{label_allocation_key, ImporterRelease};
use crate::txn::Transaction;
use crate::types::{Route, RouteOrigin, RoutingDomain};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use vpnfib_types::{NodeId, RouteDistinguisher};

const COMPONENT: &str = "SubnetRouteHandler";

pub struct SubnetRouteHandler {
    ctx: Arc<FibContext>,
}

impl SubnetRouteHandler {
    pub fn new(ctx: Arc<FibContext>) -> Self {
        Self { ctx }
    }

    fn elan_tag(route: &Route) -> Result<u32> {
        route
            .subnet_route
            .map(|marker| marker.elan_tag)
            .ok_or_else(|| FibError::malformed(format!("{} has no subnet marker", route.prefix)))
    }

    fn install_on(
        &self,
        tx: &mut Transaction,
        domain: &RoutingDomain,
        route: &Route,
        node: NodeId,
        elan_tag: u32,
    ) {
        tx.put_flow(subnet_route_flow(node, domain.id, &route.prefix, elan_tag));
        if let Some(broadcast) = route.prefix.broadcast() {
            tx.put_flow(subnet_broadcast_drop_flow(node, domain.id, &broadcast));
        }
        if route.origin != RouteOrigin::SelfImported {
            for label in route.labels() {
                tx.put_flow(subnet_lfib_flow(
                    node,
                    label,
                    route.prefix.ethertype(),
                    domain.id,
                    elan_tag,
                ));
            }
        }
    }

    /// Drops the domain's hold on the route labels. Labels that never made
    /// it into the registry go straight back to the allocator.
    async fn release_labels(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        for label in route.labels() {
            match self.ctx.labels.remove_importer(label, &domain.name).await? {
                ImporterRelease::NotRegistered => {
                    let key = label_allocation_key(route.label_owner_rd(rd), &route.prefix);
                    self.ctx
                        .collab
                        .ids
                        .release(self.ctx.labels.pool(), &key)
                        .await?;
                    info!("{}: label {} of {} released", COMPONENT, label, route.prefix);
                    audit_log!(AuditRecord::new(AuditCategory::LabelRelease, COMPONENT, "release_label")
                        .with_outcome(AuditOutcome::Success)
                        .with_object_id(label.to_string())
                        .with_object_type("label")
                        .with_details(serde_json::json!({ "prefix": route.prefix.to_string() })));
                }
                ImporterRelease::Remaining(n) => {
                    debug!("{}: label {} still imported {} times", COMPONENT, label, n);
                }
                ImporterRelease::Released => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RouteHandler for SubnetRouteHandler {
    fn name(&self) -> &'static str {
        "subnet-route"
    }

    async fn create(
        &self,
        domain: &RoutingDomain,
        _rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        let elan_tag = Self::elan_tag(route)?;
        let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
        let mut tx = Transaction::new();
        for node in domain.active_nodes() {
            self.install_on(&mut tx, domain, route, node, elan_tag);
        }
        self.ctx.tx.submit(tx).await?;
        debug!(
            "{}: {} in {} handed to broadcast domain {}",
            COMPONENT, route.prefix, domain.name, elan_tag
        );
        Ok(())
    }

    async fn remove(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        {
            let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
            let mut tx = Transaction::new();
            for membership in &domain.nodes {
                let node = membership.node;
                tx.delete_flow(fib_flow_key(node, domain.id, &route.prefix));
                if let Some(broadcast) = route.prefix.broadcast() {
                    tx.delete_flow(subnet_drop_flow_key(node, domain.id, &broadcast));
                }
                if route.origin != RouteOrigin::SelfImported {
                    for label in route.labels() {
                        tx.delete_flow(lfib_flow_key(node, label));
                    }
                }
            }
            self.ctx.tx.submit(tx).await?;
        }

        if route.origin != RouteOrigin::SelfImported {
            self.release_labels(domain, rd, route).await?;
        }
        Ok(())
    }

    async fn create_remote_only(
        &self,
        domain: &RoutingDomain,
        _rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        let elan_tag = Self::elan_tag(route)?;
        let mut tx = Transaction::new();
        self.install_on(&mut tx, domain, route, node, elan_tag);
        self.ctx.tx.submit(tx).await
    }

    /// The subnet entry itself stays while the node is still part of the
    /// domain.
    async fn remove_from_node(
        &self,
        domain: &RoutingDomain,
        _rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        let mut tx = Transaction::new();
        if let Some(broadcast) = route.prefix.broadcast() {
            tx.delete_flow(subnet_drop_flow_key(node, domain.id, &broadcast));
        }
        if route.origin != RouteOrigin::SelfImported {
            for label in route.labels() {
                tx.delete_flow(lfib_flow_key(node, label));
            }
        }
        if !domain.contains(node) {
            tx.delete_flow(fib_flow_key(node, domain.id, &route.prefix));
        }
        self.ctx.tx.submit(tx).await
    }
}
