//! Per-origin programming strategies.
//!
//! Every route is classified into one [`RouteStrategy`] and handed to the
//! matching [`RouteHandler`]. Handlers share [`FibContext`] and the helpers
//! of [`crate::programmer`].

mod bgp;
mod evpn;
mod inline;
mod router_interface;
mod static_route;
mod subnet;

pub use bgp::BgpRouteHandler;
pub use evpn::EvpnRouteHandler;
pub use inline::InlineRouteHandler;
pub use router_interface::RouterInterfaceHandler;
pub use static_route::StaticRouteHandler;
pub use subnet::SubnetRouteHandler;

use crate::context::FibContext;
use crate::error::Result;
use crate::types::{Route, RouteOrigin, RoutingDomain};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use vpnfib_types::{NodeId, RouteDistinguisher};

#[async_trait]
pub trait RouteHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Programs `route` on every node of `domain` that should carry it.
    async fn create(&self, domain: &RoutingDomain, rd: &RouteDistinguisher, route: &Route)
        -> Result<()>;

    /// Removes everything [`RouteHandler::create`] programmed.
    async fn remove(&self, domain: &RoutingDomain, rd: &RouteDistinguisher, route: &Route)
        -> Result<()>;

    /// Applies a change of `original` into `update`. Returns false when the
    /// change was ignored.
    ///
    /// Only a replay of an unchanged route is acted upon by default.
    async fn update(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        original: &Route,
        update: &Route,
    ) -> Result<bool> {
        if original != update {
            return Ok(false);
        }
        self.create(domain, rd, update).await?;
        Ok(true)
    }

    /// Programs `route` on `node` only, as part of a node join replay.
    async fn create_remote_only(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()>;

    /// Removes `route` from `node` only, as part of a node leave cleanup.
    async fn remove_from_node(
        &self,
        domain: &RoutingDomain,
        rd: &RouteDistinguisher,
        route: &Route,
        node: NodeId,
    ) -> Result<()>;
}

/// Programming strategy of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteStrategy {
    Connected,
    Static,
    Bgp,
    SelfImported,
    InterVpn,
    RouterInterface,
    SubnetRoute,
    Evpn,
}

impl RouteStrategy {
    /// VXLAN encapsulation wins over every other property, then external
    /// origin, then the router-interface and subnet markers.
    pub fn classify(route: &Route) -> Self {
        if route.is_vxlan() {
            return RouteStrategy::Evpn;
        }
        if route.origin == RouteOrigin::Bgp {
            return RouteStrategy::Bgp;
        }
        if route.router_interface.is_some() {
            return RouteStrategy::RouterInterface;
        }
        if route.subnet_route.is_some() {
            return RouteStrategy::SubnetRoute;
        }
        match route.origin {
            RouteOrigin::Static => RouteStrategy::Static,
            RouteOrigin::SelfImported => RouteStrategy::SelfImported,
            RouteOrigin::InterVpn => RouteStrategy::InterVpn,
            RouteOrigin::Connected | RouteOrigin::RouterInterface | RouteOrigin::Bgp => {
                RouteStrategy::Connected
            }
        }
    }
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteStrategy::Connected => "connected",
            RouteStrategy::Static => "static",
            RouteStrategy::Bgp => "bgp",
            RouteStrategy::SelfImported => "self-imported",
            RouteStrategy::InterVpn => "inter-vpn",
            RouteStrategy::RouterInterface => "router-interface",
            RouteStrategy::SubnetRoute => "subnet-route",
            RouteStrategy::Evpn => "evpn",
        };
        f.write_str(s)
    }
}

/// One handler per strategy, built once per context.
pub struct HandlerSet {
    inline: InlineRouteHandler,
    static_route: StaticRouteHandler,
    bgp: BgpRouteHandler,
    router_interface: RouterInterfaceHandler,
    subnet: SubnetRouteHandler,
    evpn: EvpnRouteHandler,
}

impl HandlerSet {
    pub fn new(ctx: Arc<FibContext>) -> Self {
        Self {
            inline: InlineRouteHandler::new(ctx.clone()),
            static_route: StaticRouteHandler::new(ctx.clone()),
            bgp: BgpRouteHandler::new(ctx.clone()),
            router_interface: RouterInterfaceHandler::new(ctx.clone()),
            subnet: SubnetRouteHandler::new(ctx.clone()),
            evpn: EvpnRouteHandler::new(ctx),
        }
    }

    pub fn get(&self, strategy: RouteStrategy) -> &dyn RouteHandler {
        match strategy {
            RouteStrategy::Connected | RouteStrategy::SelfImported | RouteStrategy::InterVpn => {
                &self.inline
            }
            RouteStrategy::Static => &self.static_route,
            RouteStrategy::Bgp => &self.bgp,
            RouteStrategy::RouterInterface => &self.router_interface,
            RouteStrategy::SubnetRoute => &self.subnet,
            RouteStrategy::Evpn => &self.evpn,
        }
    }

    pub fn for_route(&self, route: &Route) -> &dyn RouteHandler {
        self.get(RouteStrategy::classify(route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EncapType, RouterInterfaceMarker};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn route(origin: RouteOrigin) -> Route {
        Route::new("10.0.0.0/24".parse().unwrap(), origin)
    }

    #[test]
    fn test_classification_by_origin() {
        assert_eq!(
            RouteStrategy::classify(&route(RouteOrigin::Connected)),
            RouteStrategy::Connected
        );
        assert_eq!(
            RouteStrategy::classify(&route(RouteOrigin::Static)),
            RouteStrategy::Static
        );
        assert_eq!(
            RouteStrategy::classify(&route(RouteOrigin::SelfImported)),
            RouteStrategy::SelfImported
        );
        assert_eq!(
            RouteStrategy::classify(&route(RouteOrigin::RouterInterface)),
            RouteStrategy::Connected
        );
    }

    #[test]
    fn test_markers_and_encap_take_precedence() {
        let vxlan_bgp = route(RouteOrigin::Bgp).with_encap(EncapType::Vxlan);
        assert_eq!(RouteStrategy::classify(&vxlan_bgp), RouteStrategy::Evpn);

        let subnet_bgp = route(RouteOrigin::Bgp).with_subnet_route(7);
        assert_eq!(RouteStrategy::classify(&subnet_bgp), RouteStrategy::Bgp);

        let subnet = route(RouteOrigin::Connected).with_subnet_route(7);
        assert_eq!(RouteStrategy::classify(&subnet), RouteStrategy::SubnetRoute);

        let gateway = route(RouteOrigin::Connected).with_router_interface(RouterInterfaceMarker {
            uuid: Uuid::nil(),
            ip: "10.0.0.1".parse().unwrap(),
            mac: "fa:16:3e:00:00:01".parse().unwrap(),
        });
        assert_eq!(
            RouteStrategy::classify(&gateway),
            RouteStrategy::RouterInterface
        );
    }
}
