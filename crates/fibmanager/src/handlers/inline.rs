//! Connected, self-imported and leaked routes: one local entry on the
//! owner plus one remote entry per other active node.

use super::RouteHandler;
use crate::context::FibContext;
use crate::error::{FibError, Result};
use crate::programmer::{self, LocalPlan, NodeErrors};
use crate::types::{Route, RouteOrigin, RoutingDomain};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use vpnfib_types::{NodeId, RouteDistinguisher};

const COMPONENT: &str = "InlineRouteHandler";

pub struct InlineRouteHandler {
    ctx: Arc<FibContext>,
}

impl InlineRouteHandler {
    pub fn new(ctx: Arc<FibContext>) -> Self {
        Self { ctx }
    }

    async fn install_local(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        plan: &LocalPlan,
        errors: &mut NodeErrors,
    ) -> Result<()> {
        match plan {
            LocalPlan::None => {
                debug!(
                    "{}: {} in {} has no local owner",
                    COMPONENT, route.prefix, domain.name
                );
            }
            LocalPlan::Single(target) => {
                programmer::install_local_entry(&self.ctx, domain, rd, route, target, true).await?;
            }
            LocalPlan::Ecmp(members) => {
                for node in plan.nodes() {
                    let result =
                        programmer::program_ecmp_entry(&self.ctx, domain, route, members, node)
                            .await;
                    errors.record(COMPONENT, &format!("{} on node {}", route.prefix, node), result);
                }
                programmer::register_ecmp_label(&self.ctx, domain, rd, route, members).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RouteHandler for InlineRouteHandler {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn create(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        let plan = programmer::plan_local(&self.ctx, domain, rd, route).await?;
        let mut errors = NodeErrors::default();
        self.install_local(domain, rd, route, &plan, &mut errors).await?;

        let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
        for node in domain.active_nodes() {
            if plan.is_local(node) {
                continue;
            }
            let result =
                programmer::install_remote_entry(&self.ctx, domain, rd, route, node, &plan).await;
            errors.record(COMPONENT, &format!("{} on node {}", route.prefix, node), result);
        }
        info!(
            "{}: programmed {} in {} ({} local nodes)",
            COMPONENT,
            route.prefix,
            domain.name,
            plan.nodes().len()
        );
        errors.finish()
    }

    async fn remove(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
    ) -> Result<()> {
        let mut errors = NodeErrors::default();
        let mut handled: Vec<NodeId> = self.ctx.nexthops.ecmp_nodes(domain.id, &route.prefix);
        for node in &handled {
            let result = programmer::remove_ecmp_entry(&self.ctx, domain, route, *node).await;
            errors.record(COMPONENT, &format!("{} on node {}", route.prefix, node), result);
        }

        match programmer::plan_removal(&self.ctx, domain, rd, route).await? {
            LocalPlan::Single(target) if !handled.contains(&target.node) => {
                programmer::remove_local_entry(&self.ctx, domain, route, &target).await?;
                handled.push(target.node);
            }
            LocalPlan::Single(_) | LocalPlan::None => {}
            LocalPlan::Ecmp(_) => {
                if let Some(label) = route.label() {
                    programmer::release_label(&self.ctx, domain, label).await?;
                }
            }
        }

        let _domain_guard = self.ctx.lock_domain(&domain.name).await?;
        for membership in &domain.nodes {
            if handled.contains(&membership.node) {
                continue;
            }
            let result =
                programmer::remove_remote_entry(&self.ctx, domain, route, membership.node).await;
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
        let plan = programmer::plan_local(&self.ctx, domain, rd, route).await?;
        match &plan {
            LocalPlan::Ecmp(members) => {
                programmer::program_ecmp_entry(&self.ctx, domain, route, members, node).await
            }
            LocalPlan::Single(target) if target.node == node => {
                if route.origin == RouteOrigin::SelfImported {
                    programmer::install_local_entry(&self.ctx, domain, rd, route, target, true)
                        .await
                } else {
                    debug!(
                        "{}: node {} owns {}, no remote entry",
                        COMPONENT, node, route.prefix
                    );
                    Ok(())
                }
            }
            _ => programmer::install_remote_entry(&self.ctx, domain, rd, route, node, &plan).await,
        }
    }

    async fn remove_from_node(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()> {
        let used_rds = self
            .ctx
            .collab
            .store
            .read_used_rds(domain.id, &route.prefix)
            .await?;
        if used_rds.len() > 1 {
            return Err(FibError::malformed(format!(
                "extra route {} in {} is anchored by {} distinguishers",
                route.prefix,
                domain.name,
                used_rds.len()
            )));
        }

        if self
            .ctx
            .nexthops
            .ecmp_group(node, domain.id, &route.prefix)
            .is_some()
        {
            return programmer::remove_ecmp_entry(&self.ctx, domain, route, node).await;
        }

        match programmer::plan_removal(&self.ctx, domain, rd, route).await? {
            LocalPlan::Single(target) if target.node == node => {
                if route.origin == RouteOrigin::SelfImported {
                    programmer::remove_local_entry(&self.ctx, domain, route, &target).await
                } else {
                    debug!(
                        "{}: node {} still owns {}, keeping its entry",
                        COMPONENT, node, route.prefix
                    );
                    Ok(())
                }
            }
            _ => programmer::remove_remote_entry(&self.ctx, domain, route, node).await,
        }
    }
}
