//! Gateway addresses of router interfaces: instead of forwarding, every
//! node classifies the router MAC into the FIB and answers pings to the
//! gateway address.

use super::RouteHandler;
use crate::context::FibContext;
use crate::error::{FibError, Result};
use crate::flow::builder::{
    gateway_mac_flow, gateway_mac_flow_key, ping_responder_flow, ping_responder_flow_key,
};
use crate::programmer::NodeErrors;
use crate::types::{Route, RouterInterfaceMarker, RoutingDomain};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use vpnfib_types::{NodeId, RouteDistinguisher};

const COMPONENT: &str = "RouterInterfaceHandler";

pub struct RouterInterfaceHandler {
    ctx: Arc<FibContext>,
}

impl RouterInterfaceHandler {
    pub fn new(ctx: Arc<FibContext>) -> Self {
        Self { ctx }
    }

    fn marker(route: &Route) -> Result<RouterInterfaceMarker> {
        route.router_interface.ok_or_else(|| {
            FibError::malformed(format!("{} has no router interface marker", route.prefix))
        })
    }

    async fn install_on(
        &self,
        domain: &RoutingDomain,
        route: &Route,
        marker: &RouterInterfaceMarker,
        node: NodeId,
    ) -> Result<()> {
        let installer = &self.ctx.collab.installer;
        installer
            .install_flow(gateway_mac_flow(node, domain.id, &marker.mac))
            .await?;
        match route.label() {
            Some(label) => {
                installer
                    .install_flow(ping_responder_flow(
                        node,
                        domain.id,
                        label,
                        &marker.ip,
                        &marker.mac,
                    ))
                    .await?;
            }
            None => warn!(
                "{}: router interface {} has no label, no ping responder on node {}",
                COMPONENT, marker.uuid, node
            ),
        }
        Ok(())
    }

    async fn remove_from(
        &self,
        domain: &RoutingDomain,
        route: &Route,
        marker: &RouterInterfaceMarker,
        node: NodeId,
    ) -> Result<()> {
        let installer = &self.ctx.collab.installer;
        installer
            .remove_flow(&gateway_mac_flow_key(node, domain.id, &marker.mac))
            .await?;
        if let Some(label) = route.label() {
            installer
                .remove_flow(&ping_responder_flow_key(node, domain.id, label))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RouteHandler for RouterInterfaceHandler {
    fn name(&self) -> &'static str {
        "router-interface"
    }

    async fn create(
        &self,
        domain: &RoutingDomain,
        _rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        let marker = Self::marker(route)?;
        let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
        let mut errors = NodeErrors::default();
        for node in domain.active_nodes() {
            let result = self.install_on(domain, route, &marker, node).await;
            errors.record(COMPONENT, &format!("{} on node {}", marker.ip, node), result);
        }
        debug!(
            "{}: gateway {} of {} installed in {}",
            COMPONENT, marker.ip, marker.uuid, domain.name
        );
        errors.finish()
    }

    async fn remove(
        &self,
        domain: &RoutingDomain,
        _rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        let marker = Self::marker(route)?;
        let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
        let mut errors = NodeErrors::default();
        for membership in &domain.nodes {
            let node = membership.node;
            let result = self.remove_from(domain, route, &marker, node).await;
            errors.record(COMPONENT, &format!("{} on node {}", marker.ip, node), result);
        }
        errors.finish()
    }

    async fn create_remote_only(
        &self,
        domain: &RoutingDomain,
        _rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        let marker = Self::marker(route)?;
        self.install_on(domain, route, &marker, node).await
    }

    async fn remove_from_node(
        &self,
        domain: &RoutingDomain,
        _rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        let marker = Self::marker(route)?;
        self.remove_from(domain, route, &marker, node).await
    }
}
