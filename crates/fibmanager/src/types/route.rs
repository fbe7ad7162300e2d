//! Route entries as delivered by the route table.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use vpnfib_types::{IpAddress, IpPrefix, MacAddress, MplsLabel, RouteDistinguisher};

/// Where a route came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOrigin {
    Connected,
    Static,
    /// Learned from an external BGP peer.
    Bgp,
    /// Imported from another routing domain, reusing that domain's label.
    SelfImported,
    InterVpn,
    RouterInterface,
}

impl fmt::Display for RouteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteOrigin::Connected => "connected",
            RouteOrigin::Static => "static",
            RouteOrigin::Bgp => "bgp",
            RouteOrigin::SelfImported => "self-imported",
            RouteOrigin::InterVpn => "inter-vpn",
            RouteOrigin::RouterInterface => "router-interface",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncapType {
    MplsOverGre,
    Vxlan,
}

/// One next hop of a route. The next hop is the tunnel endpoint of the
/// node hosting the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutePath {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<IpAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<MplsLabel>,
}

/// Marks an ARP-less subnet route forwarded into a broadcast domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubnetRouteMarker {
    pub elan_tag: u32,
}

/// Marks the gateway address of a router interface; such routes install
/// ping responders instead of forwarding entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouterInterfaceMarker {
    pub uuid: Uuid,
    pub ip: IpAddress,
    pub mac: MacAddress,
}

/// A route of one routing domain, keyed by (route distinguisher, prefix).
///
/// Equality is field by field; an update whose original equals the new
/// value is how a full reconciliation replay shows up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: IpPrefix,
    pub origin: RouteOrigin,
    #[serde(default)]
    pub paths: Vec<RoutePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encap: Option<EncapType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3vni: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_mac: Option<MacAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_rd: Option<RouteDistinguisher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_route: Option<SubnetRouteMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_interface: Option<RouterInterfaceMarker>,
}

impl Route {
    pub fn new(prefix: IpPrefix, origin: RouteOrigin) -> Self {
        Self {
            prefix,
            origin,
            paths: Vec::new(),
            encap: None,
            l3vni: None,
            gateway_mac: None,
            parent_rd: None,
            subnet_route: None,
            router_interface: None,
        }
    }

    pub fn with_path(mut self, next_hop: IpAddress, label: Option<MplsLabel>) -> Self {
        self.paths.push(RoutePath {
            next_hop: Some(next_hop),
            label,
        });
        self
    }

    /// A path carrying only a label, as used by subnet routes.
    pub fn with_label(mut self, label: MplsLabel) -> Self {
        self.paths.push(RoutePath {
            next_hop: None,
            label: Some(label),
        });
        self
    }

    pub fn with_encap(mut self, encap: EncapType) -> Self {
        self.encap = Some(encap);
        self
    }

    pub fn with_l3vni(mut self, l3vni: u32) -> Self {
        self.l3vni = Some(l3vni);
        self
    }

    pub fn with_gateway_mac(mut self, mac: MacAddress) -> Self {
        self.gateway_mac = Some(mac);
        self
    }

    pub fn with_parent_rd(mut self, rd: RouteDistinguisher) -> Self {
        self.parent_rd = Some(rd);
        self
    }

    pub fn with_subnet_route(mut self, elan_tag: u32) -> Self {
        self.subnet_route = Some(SubnetRouteMarker { elan_tag });
        self
    }

    pub fn with_router_interface(mut self, marker: RouterInterfaceMarker) -> Self {
        self.router_interface = Some(marker);
        self
    }

    /// Label of the first labelled path.
    pub fn label(&self) -> Option<MplsLabel> {
        self.paths.iter().find_map(|p| p.label)
    }

    /// Every distinct label carried by the route, in path order.
    pub fn labels(&self) -> Vec<MplsLabel> {
        let mut labels = Vec::new();
        for label in self.paths.iter().filter_map(|p| p.label) {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        labels
    }

    /// Next hops in path order, without duplicates.
    pub fn next_hops(&self) -> Vec<IpAddress> {
        let mut hops = Vec::new();
        for hop in self.paths.iter().filter_map(|p| p.next_hop) {
            if !hops.contains(&hop) {
                hops.push(hop);
            }
        }
        hops
    }

    pub fn label_for(&self, next_hop: &IpAddress) -> Option<MplsLabel> {
        self.paths
            .iter()
            .find(|p| p.next_hop.as_ref() == Some(next_hop))
            .and_then(|p| p.label)
    }

    pub fn is_vxlan(&self) -> bool {
        self.encap == Some(EncapType::Vxlan)
    }

    /// The distinguisher the route's label was allocated under.
    pub fn label_owner_rd<'a>(&'a self, rd: &'a RouteDistinguisher) -> &'a RouteDistinguisher {
        self.parent_rd.as_ref().unwrap_or(rd)
    }
}

/// Key of a route notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub rd: RouteDistinguisher,
    pub prefix: IpPrefix,
}

impl RouteKey {
    pub fn new(rd: RouteDistinguisher, prefix: IpPrefix) -> Self {
        Self { rd, prefix }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rd, self.prefix)
    }
}
