//! Next-hop group records.

use crate::flow::Action;
use crate::flow::builder::ETHTYPE_MPLS_UNICAST;
use crate::types::TunnelType;
use itertools::Itertools;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use vpnfib_orch_common::HasRefCount;
use vpnfib_types::{IpAddress, IpPrefix, MacAddress, MplsLabel, NodeId, VpnId};

/// Local next hops are shared per (routing domain, primary address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalNextHopKey {
    pub vpn: VpnId,
    pub primary: IpPrefix,
}

impl LocalNextHopKey {
    pub fn new(vpn: VpnId, primary: IpPrefix) -> Self {
        Self { vpn, primary }
    }

    /// Key of the group id in the next-hop pool.
    pub fn pool_key(&self) -> String {
        format!("nh.{}.{}", self.vpn, self.primary)
    }

    /// Name of the cluster-wide lock around the entry.
    pub fn lock_name(&self) -> String {
        format!("{}{}", self.vpn, self.primary)
    }
}

impl fmt::Display for LocalNextHopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vpn, self.primary)
    }
}

/// Indirect group pointing at a local port, shared by every destination
/// prefix reached through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalNextHop {
    pub group_id: u32,
    pub node: NodeId,
    pub interface: String,
    pub mac: Option<MacAddress>,
    /// Destination prefixes using this next hop.
    pub adjacencies: BTreeSet<IpPrefix>,
}

impl HasRefCount for LocalNextHop {
    type Ref = IpPrefix;

    fn add_ref(&mut self, reference: IpPrefix) -> usize {
        self.adjacencies.insert(reference);
        self.adjacencies.len()
    }

    fn remove_ref(&mut self, reference: &IpPrefix) -> Option<usize> {
        self.adjacencies
            .remove(reference)
            .then_some(self.adjacencies.len())
    }

    fn ref_count(&self) -> usize {
        self.adjacencies.len()
    }
}

/// One next hop of an extra route, located on its owning node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcmpMember {
    pub next_hop: IpAddress,
    pub owner: NodeId,
    pub interface: String,
    pub mac: Option<MacAddress>,
    pub label: Option<MplsLabel>,
}

/// How remote buckets reach the owner of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcmpEncap {
    pub tunnel_type: TunnelType,
    /// Tunnel id for VXLAN buckets; falls back to the member label.
    pub tunnel_id: Option<u64>,
}

impl Default for EcmpEncap {
    fn default() -> Self {
        Self {
            tunnel_type: TunnelType::MplsOverGre,
            tunnel_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EcmpKey {
    pub node: NodeId,
    pub vpn: VpnId,
    pub prefix: IpPrefix,
}

impl EcmpKey {
    pub fn pool_key(&self) -> String {
        format!("ecmp.{}.{}", self.vpn, self.prefix)
    }

    pub fn lock_name(&self) -> String {
        format!("ecmp.{}.{}.{}", self.node, self.vpn, self.prefix)
    }
}

/// Select group of one extra route on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EcmpRecord {
    pub group_id: u32,
    /// Bucket id per member next hop.
    pub buckets: BTreeMap<IpAddress, u32>,
    /// Members served through a local next hop on this node.
    pub local_members: BTreeSet<IpAddress>,
}

impl EcmpRecord {
    /// Smallest bucket id not in use.
    pub fn next_bucket_id(&self) -> u32 {
        let used: BTreeSet<u32> = self.buckets.values().copied().collect();
        (0..).find(|id| !used.contains(id)).unwrap_or(0)
    }
}

/// Select group balancing over a set of external gateways on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayGroup {
    pub key: String,
    pub group_id: u32,
    /// Gateways in key order with the tunnel reaching each. The index is
    /// the bucket id.
    pub gateways: Vec<(IpAddress, String)>,
    /// Buckets currently installed.
    pub live: BTreeSet<u32>,
    /// Routes using the group.
    pub referrers: BTreeSet<String>,
}

impl GatewayGroup {
    pub fn bucket_for(&self, interface: &str) -> Option<u32> {
        self.gateways
            .iter()
            .position(|(_, tunnel)| tunnel == interface)
            .and_then(|idx| u32::try_from(idx).ok())
    }
}

/// Key of the gateway group for a set of gateway addresses.
pub fn gateway_key(gateways: &[IpAddress]) -> String {
    format!("gw.{}", gateways.iter().sorted().dedup().join(","))
}

/// Actions that put a packet into the tunnel towards a remote owner,
/// ahead of the tunnel's own egress actions.
pub fn encap_actions(
    tunnel_type: TunnelType,
    label: Option<MplsLabel>,
    tunnel_id: Option<u64>,
) -> Vec<Action> {
    match tunnel_type {
        TunnelType::MplsOverGre => match label {
            Some(label) => vec![
                Action::PushMpls {
                    ethertype: ETHTYPE_MPLS_UNICAST,
                },
                Action::SetMplsLabel(label.value()),
            ],
            None => Vec::new(),
        },
        TunnelType::Vxlan => tunnel_id
            .or_else(|| label.map(|l| u64::from(l.value())))
            .map(|id| vec![Action::SetTunnelId(id)])
            .unwrap_or_default(),
    }
}

/// Counts exposed in dumps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NextHopSummary {
    pub local_next_hops: usize,
    pub ecmp_groups: usize,
    pub gateway_groups: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_local_next_hop_refs() {
        let mut nh = LocalNextHop {
            group_id: 1,
            node: NodeId::new(1),
            interface: "tap1".to_string(),
            mac: None,
            adjacencies: BTreeSet::new(),
        };
        let a: IpPrefix = "10.0.0.0/24".parse().unwrap();
        let b: IpPrefix = "10.0.1.0/24".parse().unwrap();
        assert_eq!(nh.add_ref(a), 1);
        assert_eq!(nh.add_ref(a), 1);
        assert_eq!(nh.add_ref(b), 2);
        assert_eq!(nh.remove_ref(&a), Some(1));
        assert_eq!(nh.remove_ref(&a), None);
    }

    #[test]
    fn test_gateway_key_is_order_independent() {
        let a: IpAddress = "172.16.0.2".parse().unwrap();
        let b: IpAddress = "172.16.0.1".parse().unwrap();
        assert_eq!(gateway_key(&[a, b]), gateway_key(&[b, a]));
        assert_eq!(gateway_key(&[a, b]), "gw.172.16.0.1,172.16.0.2");
    }

    #[test]
    fn test_next_bucket_id_fills_gaps() {
        let mut record = EcmpRecord {
            group_id: 9,
            buckets: BTreeMap::new(),
            local_members: BTreeSet::new(),
        };
        assert_eq!(record.next_bucket_id(), 0);
        record.buckets.insert("10.0.0.1".parse().unwrap(), 0);
        record.buckets.insert("10.0.0.3".parse().unwrap(), 2);
        assert_eq!(record.next_bucket_id(), 1);
    }

    #[test]
    fn test_encap_actions() {
        let label = MplsLabel::new(300).unwrap();
        assert_eq!(
            encap_actions(TunnelType::MplsOverGre, Some(label), None),
            vec![
                Action::PushMpls { ethertype: 0x8847 },
                Action::SetMplsLabel(300)
            ]
        );
        assert_eq!(
            encap_actions(TunnelType::Vxlan, Some(label), Some(5001)),
            vec![Action::SetTunnelId(5001)]
        );
        assert!(encap_actions(TunnelType::MplsOverGre, None, Some(1)).is_empty());
    }
}
