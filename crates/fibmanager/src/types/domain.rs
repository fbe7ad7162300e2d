//! Directory records read by the engine: routing domains, prefix ownership,
//! subnet segments and extra routes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use vpnfib_types::{IpAddress, IpPrefix, MacAddress, NodeId, RouteDistinguisher, VpnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMembership {
    pub node: NodeId,
    pub state: NodeState,
}

/// Operational view of a routing domain: its id, distinguisher and the
/// forwarding nodes it currently spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDomain {
    pub name: String,
    pub id: VpnId,
    pub rd: RouteDistinguisher,
    #[serde(default)]
    pub nodes: Vec<NodeMembership>,
    /// Routes of the domain are advertised over BGP, so local routes also
    /// get label-switch entries.
    #[serde(default)]
    pub bgp_vpn: bool,
    /// Remote entries carry the L3 VNI as tunnel id.
    #[serde(default)]
    pub enforce_vxlan_semantics: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3vni: Option<u32>,
}

impl RoutingDomain {
    pub fn new(name: impl Into<String>, id: VpnId, rd: RouteDistinguisher) -> Self {
        Self {
            name: name.into(),
            id,
            rd,
            nodes: Vec::new(),
            bgp_vpn: false,
            enforce_vxlan_semantics: false,
            l3vni: None,
        }
    }

    pub fn with_node(mut self, node: NodeId, state: NodeState) -> Self {
        self.set_node_state(node, state);
        self
    }

    pub fn set_node_state(&mut self, node: NodeId, state: NodeState) {
        match self.nodes.iter_mut().find(|m| m.node == node) {
            Some(member) => member.state = state,
            None => self.nodes.push(NodeMembership { node, state }),
        }
    }

    pub fn remove_node(&mut self, node: NodeId) {
        self.nodes.retain(|m| m.node != node);
    }

    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|m| m.state == NodeState::Active)
            .map(|m| m.node)
            .collect()
    }

    pub fn is_active(&self, node: NodeId) -> bool {
        self.nodes
            .iter()
            .any(|m| m.node == node && m.state == NodeState::Active)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.iter().any(|m| m.node == node)
    }
}

/// How a locally hosted prefix is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixCue {
    #[default]
    Normal,
    Nat,
    PhysNetFunc,
}

/// Owner of a prefix inside a routing domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixInfo {
    pub prefix: IpPrefix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub cue: PrefixCue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Uuid>,
    /// MAC of the endpoint behind the interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddress>,
}

impl PrefixInfo {
    pub fn new(prefix: IpPrefix, node: NodeId, interface: impl Into<String>) -> Self {
        Self {
            prefix,
            node: Some(node),
            interface: Some(interface.into()),
            cue: PrefixCue::Normal,
            subnet: None,
            mac: None,
        }
    }

    pub fn with_cue(mut self, cue: PrefixCue) -> Self {
        self.cue = cue;
        self
    }

    pub fn with_subnet(mut self, subnet: Uuid) -> Self {
        self.subnet = Some(subnet);
        self
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Node and interface, when the prefix is bound to a local port.
    pub fn location(&self) -> Option<(NodeId, &str)> {
        Some((self.node?, self.interface.as_deref()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Flat,
    Vlan,
    Vxlan,
    Gre,
}

/// Network segment of a subnet's broadcast domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSegment {
    pub segment_type: SegmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation_id: Option<u32>,
}

impl SubnetSegment {
    /// Flat and VLAN segments are reached through an L2 port rather than a
    /// tunnel.
    pub fn is_l2(&self) -> bool {
        matches!(self.segment_type, SegmentType::Flat | SegmentType::Vlan)
    }

    pub fn vxlan_id(&self) -> Option<u32> {
        match self.segment_type {
            SegmentType::Vxlan => self.segmentation_id,
            _ => None,
        }
    }
}

/// Static route with one or more next hops, recorded per anchoring
/// distinguisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraRoute {
    pub prefix: IpPrefix,
    pub next_hops: Vec<IpAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    MplsOverGre,
    Vxlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceClass {
    Tunnel,
    L2Vlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperState {
    Up,
    Down,
}

impl fmt::Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperState::Up => f.write_str("up"),
            OperState::Down => f.write_str("down"),
        }
    }
}
