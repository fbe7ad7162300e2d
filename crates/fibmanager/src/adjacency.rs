//! Resolution of a route's next hops into egress interfaces on a node.

use crate::collaborators::{EgressService, VpnDirectory};
use crate::error::Result;
use crate::types::{EncapType, InterfaceClass, Route, RouteOrigin, RoutingDomain, TunnelType};
use log::{debug, trace};
use std::sync::Arc;
use vpnfib_types::{IpAddress, IpPrefix, NodeId, RouteDistinguisher};

/// One resolved egress for a route on a node. Computed per job, never
/// stored.
///
/// Two results with the same interface are the same adjacency.
#[derive(Debug, Clone, Eq)]
pub struct AdjacencyResult {
    pub interface: String,
    pub class: InterfaceClass,
    /// The path next hop, or `None` when resolved against the bare prefix.
    pub next_hop: Option<IpAddress>,
    pub prefix: IpPrefix,
}

impl PartialEq for AdjacencyResult {
    fn eq(&self, other: &Self) -> bool {
        self.interface == other.interface
    }
}

impl AdjacencyResult {
    pub fn is_tunnel(&self) -> bool {
        self.class == InterfaceClass::Tunnel
    }
}

/// How a route's next hops are reached from a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Tunnel(TunnelType),
    L2,
}

pub struct AdjacencyResolver {
    directory: Arc<dyn VpnDirectory>,
    egress: Arc<dyn EgressService>,
}

impl AdjacencyResolver {
    pub fn new(directory: Arc<dyn VpnDirectory>, egress: Arc<dyn EgressService>) -> Self {
        Self { directory, egress }
    }

    /// Resolves the adjacencies of `route` as seen from `node`.
    ///
    /// Paths that cannot be resolved are skipped; an empty result is left to
    /// the caller to judge.
    pub async fn resolve(
        &self,
        node: NodeId,
        domain: &RoutingDomain,
        route: &Route,
        rd: &RouteDistinguisher,
    ) -> Result<Vec<AdjacencyResult>> {
        let reachability = self.reachability(domain, route).await?;

        let targets: Vec<Option<IpAddress>> = if route.paths.is_empty() {
            vec![None]
        } else {
            route.paths.iter().map(|p| p.next_hop).collect()
        };

        let mut results: Vec<AdjacencyResult> = Vec::new();
        for next_hop in targets {
            let destination = next_hop.unwrap_or(*route.prefix.address());
            let resolved = match reachability {
                Reachability::Tunnel(tunnel_type) => self
                    .egress
                    .tunnel_between(node, &destination, tunnel_type)
                    .await?
                    .map(|interface| (interface, InterfaceClass::Tunnel)),
                Reachability::L2 => self
                    .directory
                    .external_port(node, &destination)
                    .await?
                    .map(|interface| (interface, InterfaceClass::L2Vlan)),
            };

            let Some((interface, class)) = resolved else {
                debug!(
                    "AdjacencyResolver: no egress from node {} towards {} for {} in {}",
                    node, destination, route.prefix, rd
                );
                continue;
            };

            let result = AdjacencyResult {
                interface,
                class,
                next_hop,
                prefix: route.prefix,
            };
            if !results.contains(&result) {
                results.push(result);
            }
        }

        trace!(
            "AdjacencyResolver: {} in {} resolved to {} adjacencies on node {}",
            route.prefix,
            rd,
            results.len(),
            node
        );
        Ok(results)
    }

    /// Resolves a single adjacency from `node` towards `endpoint`, the
    /// tunnel endpoint of the node owning the route. Used when the route's
    /// own paths do not lead anywhere from `node`.
    pub async fn resolve_towards(
        &self,
        node: NodeId,
        domain: &RoutingDomain,
        route: &Route,
        endpoint: IpAddress,
    ) -> Result<Option<AdjacencyResult>> {
        let resolved = match self.reachability(domain, route).await? {
            Reachability::Tunnel(tunnel_type) => self
                .egress
                .tunnel_between(node, &endpoint, tunnel_type)
                .await?
                .map(|interface| (interface, InterfaceClass::Tunnel)),
            Reachability::L2 => self
                .directory
                .external_port(node, &endpoint)
                .await?
                .map(|interface| (interface, InterfaceClass::L2Vlan)),
        };
        Ok(resolved.map(|(interface, class)| AdjacencyResult {
            interface,
            class,
            next_hop: None,
            prefix: route.prefix,
        }))
    }

    /// Tunnel technology (or L2 egress) used to reach the route's owner.
    ///
    /// The route's own encapsulation wins. Otherwise externally learned
    /// routes use MPLS over GRE, and other routes follow the segment type of
    /// the broadcast domain the destination lives in.
    pub async fn reachability(&self, domain: &RoutingDomain, route: &Route) -> Result<Reachability> {
        if let Some(encap) = route.encap {
            return Ok(Reachability::Tunnel(tunnel_type_for(encap)));
        }
        if route.origin == RouteOrigin::Bgp {
            return Ok(Reachability::Tunnel(TunnelType::MplsOverGre));
        }

        let subnet = self
            .directory
            .resolve_prefix(domain.id, &route.prefix)
            .await?
            .and_then(|info| info.subnet);
        let segment = match subnet {
            Some(subnet) => self.directory.resolve_subnet_segment(&subnet).await?,
            None => None,
        };

        Ok(match segment {
            Some(segment) if segment.is_l2() => Reachability::L2,
            Some(segment) if segment.vxlan_id().is_some() => Reachability::Tunnel(TunnelType::Vxlan),
            _ => Reachability::Tunnel(TunnelType::MplsOverGre),
        })
    }
}

pub fn tunnel_type_for(encap: EncapType) -> TunnelType {
    match encap {
        EncapType::MplsOverGre => TunnelType::MplsOverGre,
        EncapType::Vxlan => TunnelType::Vxlan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::InMemoryFabric;
    use crate::types::{NodeState, PrefixInfo, SegmentType, SubnetSegment};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use vpnfib_types::VpnId;

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    fn setup() -> (InMemoryFabric, AdjacencyResolver, RoutingDomain) {
        let fabric = InMemoryFabric::new();
        let domain = RoutingDomain::new("vpnA", VpnId::new(1), "100:1".parse().unwrap())
            .with_node(NodeId::new(1), NodeState::Active)
            .with_node(NodeId::new(2), NodeState::Active);
        fabric.add_domain(domain.clone());
        fabric.set_tunnel_endpoint(NodeId::new(1), ip("192.168.1.5"));
        fabric.set_tunnel_endpoint(NodeId::new(2), ip("192.168.1.6"));
        let resolver = AdjacencyResolver::new(Arc::new(fabric.clone()), Arc::new(fabric.clone()));
        (fabric, resolver, domain)
    }

    #[tokio::test]
    async fn test_duplicate_interfaces_collapse() {
        let (_fabric, resolver, domain) = setup();
        let route = Route::new("10.0.0.0/24".parse().unwrap(), RouteOrigin::Connected)
            .with_path(ip("192.168.1.5"), None)
            .with_path(ip("192.168.1.5"), None);

        let results = resolver
            .resolve(NodeId::new(2), &domain, &route, &domain.rd)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_tunnel());
        assert_eq!(results[0].next_hop, Some(ip("192.168.1.5")));
    }

    #[tokio::test]
    async fn test_unresolvable_paths_are_skipped() {
        let (_fabric, resolver, domain) = setup();
        let route = Route::new("10.0.0.0/24".parse().unwrap(), RouteOrigin::Connected)
            .with_path(ip("172.16.0.1"), None);

        let results = resolver
            .resolve(NodeId::new(2), &domain, &route, &domain.rd)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_no_paths_resolves_bare_prefix() {
        let (_fabric, resolver, domain) = setup();
        let route = Route::new("192.168.1.5/32".parse().unwrap(), RouteOrigin::Connected);

        let results = resolver
            .resolve(NodeId::new(2), &domain, &route, &domain.rd)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].next_hop, None);
    }

    #[tokio::test]
    async fn test_flat_segment_uses_external_port() {
        let (fabric, resolver, domain) = setup();
        let subnet = Uuid::new_v4();
        let prefix: IpPrefix = "10.9.0.0/24".parse().unwrap();
        fabric.add_segment(
            subnet,
            SubnetSegment {
                segment_type: SegmentType::Flat,
                segmentation_id: None,
            },
        );
        fabric.add_prefix(
            domain.id,
            PrefixInfo::new(prefix, NodeId::new(1), "tap9").with_subnet(subnet),
        );
        fabric.set_external_port(NodeId::new(2), "br-ext-2");

        let route = Route::new(prefix, RouteOrigin::Connected).with_path(ip("10.9.0.1"), None);
        let results = resolver
            .resolve(NodeId::new(2), &domain, &route, &domain.rd)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].class, InterfaceClass::L2Vlan);
        assert_eq!(results[0].interface, "br-ext-2");
    }

    #[tokio::test]
    async fn test_route_encap_wins() {
        let (_fabric, resolver, domain) = setup();
        let route = Route::new("10.0.0.0/24".parse().unwrap(), RouteOrigin::Connected)
            .with_encap(EncapType::Vxlan);
        assert_eq!(
            resolver.reachability(&domain, &route).await.unwrap(),
            Reachability::Tunnel(TunnelType::Vxlan)
        );
    }

    #[tokio::test]
    async fn test_resolve_towards_owner_endpoint() {
        let (_fabric, resolver, domain) = setup();
        let route = Route::new("10.0.0.0/24".parse().unwrap(), RouteOrigin::Static)
            .with_path(ip("10.0.0.7"), None);

        let towards = resolver
            .resolve_towards(NodeId::new(2), &domain, &route, ip("192.168.1.5"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(towards.interface, "tun-2-1");
        assert!(towards.is_tunnel());

        let nowhere = resolver
            .resolve_towards(NodeId::new(2), &domain, &route, ip("172.16.9.9"))
            .await
            .unwrap();
        assert!(nowhere.is_none());
    }
}
