//! Pipeline constants and builders for the flows the engine programs.

use super::entity::{Action, FlowEntity, FlowKey, Instruction, MatchField};
use vpnfib_types::{IpAddress, IpPrefix, MacAddress, MplsLabel, NodeId, VpnId};

pub const L3_GW_MAC_TABLE: u8 = 19;
pub const LFIB_TABLE: u8 = 20;
pub const L3_FIB_TABLE: u8 = 21;
pub const L3_SUBNET_ROUTE_TABLE: u8 = 22;
pub const INTERNAL_TUNNEL_TABLE: u8 = 36;

pub const DEFAULT_FIB_FLOW_PRIORITY: u16 = 10;
pub const SUBNET_BROADCAST_DROP_PRIORITY: u16 = 100;
pub const PING_RESPONDER_PRIORITY: u16 = 200;

pub const COOKIE_VM_LFIB_TABLE: u64 = 0x0800_0002;
pub const COOKIE_VM_FIB_TABLE: u64 = 0x0800_0003;
pub const COOKIE_TUNNEL: u64 = 0x0900_0000;
pub const COOKIE_SUBNET_ROUTE: u64 = 0x0800_0004;
pub const COOKIE_ROUTER_INTERFACE: u64 = 0x0800_0005;

pub const ETHTYPE_MPLS_UNICAST: u16 = 0x8847;

pub const METADATA_MASK_VRF_ID: u64 = 0x0000_0000_00FF_FFFE;
pub const METADATA_MASK_SUBNET_ROUTE: u64 = 0xFFFF_FF00_00FF_FFFE;

const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_ICMPV6: u8 = 58;
const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Metadata identifying a routing domain inside the pipeline.
pub fn vpn_metadata(vpn: VpnId) -> u64 {
    u64::from(vpn.value()) << 1
}

/// Metadata handing a packet to the broadcast domain of a subnet route.
pub fn subnet_route_metadata(elan_tag: u32, vpn: VpnId) -> u64 {
    (u64::from(elan_tag) << 24) | vpn_metadata(vpn)
}

/// Longer prefixes win.
pub fn fib_priority(prefix: &IpPrefix) -> u16 {
    DEFAULT_FIB_FLOW_PRIORITY + u16::from(prefix.prefix_len())
}

pub fn fib_flow_ref(node: NodeId, vpn: VpnId, prefix: &IpPrefix) -> String {
    format!("fib.{}.{}.{}", node, vpn, prefix)
}

pub fn lfib_flow_ref(node: NodeId, label: MplsLabel) -> String {
    format!("lfib.{}.{}", node, label)
}

pub fn tunnel_flow_ref(node: NodeId, tunnel_id: u64) -> String {
    format!("tunnel.{}.{}", node, tunnel_id)
}

pub fn fib_flow_key(node: NodeId, vpn: VpnId, prefix: &IpPrefix) -> FlowKey {
    FlowKey::new(node, L3_FIB_TABLE, fib_flow_ref(node, vpn, prefix))
}

pub fn lfib_flow_key(node: NodeId, label: MplsLabel) -> FlowKey {
    FlowKey::new(node, LFIB_TABLE, lfib_flow_ref(node, label))
}

pub fn tunnel_flow_key(node: NodeId, tunnel_id: u64) -> FlowKey {
    FlowKey::new(node, INTERNAL_TUNNEL_TABLE, tunnel_flow_ref(node, tunnel_id))
}

pub fn subnet_drop_flow_key(node: NodeId, vpn: VpnId, broadcast: &IpAddress) -> FlowKey {
    FlowKey::new(
        node,
        L3_FIB_TABLE,
        format!("subnetdrop.{}.{}.{}", node, vpn, broadcast),
    )
}

pub fn gateway_mac_flow_key(node: NodeId, vpn: VpnId, mac: &MacAddress) -> FlowKey {
    FlowKey::new(
        node,
        L3_GW_MAC_TABLE,
        format!("gwmac.{}.{}.{}", node, vpn, mac),
    )
}

pub fn ping_responder_flow_key(node: NodeId, vpn: VpnId, label: MplsLabel) -> FlowKey {
    FlowKey::new(
        node,
        L3_FIB_TABLE,
        format!("ping.{}.{}.{}", node, vpn, label),
    )
}

fn vpn_match(vpn: VpnId) -> MatchField {
    MatchField::Metadata {
        value: vpn_metadata(vpn),
        mask: METADATA_MASK_VRF_ID,
    }
}

/// L3 FIB entry for `prefix` in `vpn` applying `actions`.
pub fn fib_flow(node: NodeId, vpn: VpnId, prefix: &IpPrefix, actions: Vec<Action>) -> FlowEntity {
    FlowEntity {
        key: fib_flow_key(node, vpn, prefix),
        priority: fib_priority(prefix),
        cookie: COOKIE_VM_FIB_TABLE + u64::from(vpn.value()),
        matches: vec![
            vpn_match(vpn),
            MatchField::EthType(prefix.ethertype()),
            MatchField::IpDst(*prefix),
        ],
        instructions: vec![Instruction::ApplyActions(actions)],
    }
}

/// Label-switch entry popping `label` and applying `actions`.
pub fn lfib_flow(node: NodeId, label: MplsLabel, ethertype: u16, actions: Vec<Action>) -> FlowEntity {
    let mut applied = vec![Action::PopMpls { ethertype }];
    applied.extend(actions);
    FlowEntity {
        key: lfib_flow_key(node, label),
        priority: DEFAULT_FIB_FLOW_PRIORITY,
        cookie: COOKIE_VM_LFIB_TABLE,
        matches: vec![
            MatchField::EthType(ETHTYPE_MPLS_UNICAST),
            MatchField::MplsLabel(label.value()),
        ],
        instructions: vec![Instruction::ApplyActions(applied)],
    }
}

/// Tunnel demultiplex entry for traffic arriving with `tunnel_id`.
pub fn tunnel_flow(node: NodeId, tunnel_id: u64, actions: Vec<Action>) -> FlowEntity {
    FlowEntity {
        key: tunnel_flow_key(node, tunnel_id),
        priority: DEFAULT_FIB_FLOW_PRIORITY + 5,
        cookie: COOKIE_TUNNEL + tunnel_id,
        matches: vec![MatchField::TunnelId(tunnel_id)],
        instructions: vec![Instruction::ApplyActions(actions)],
    }
}

/// FIB entry sending `prefix` into the broadcast domain `elan_tag`.
pub fn subnet_route_flow(node: NodeId, vpn: VpnId, prefix: &IpPrefix, elan_tag: u32) -> FlowEntity {
    FlowEntity {
        key: fib_flow_key(node, vpn, prefix),
        priority: fib_priority(prefix),
        cookie: COOKIE_SUBNET_ROUTE + u64::from(vpn.value()),
        matches: vec![
            vpn_match(vpn),
            MatchField::EthType(prefix.ethertype()),
            MatchField::IpDst(*prefix),
        ],
        instructions: vec![
            Instruction::WriteMetadata {
                value: subnet_route_metadata(elan_tag, vpn),
                mask: METADATA_MASK_SUBNET_ROUTE,
            },
            Instruction::GotoTable(L3_SUBNET_ROUTE_TABLE),
        ],
    }
}

/// Label-switch entry for a subnet route: pop and hand to the broadcast
/// domain.
pub fn subnet_lfib_flow(
    node: NodeId,
    label: MplsLabel,
    ethertype: u16,
    vpn: VpnId,
    elan_tag: u32,
) -> FlowEntity {
    FlowEntity {
        key: lfib_flow_key(node, label),
        priority: DEFAULT_FIB_FLOW_PRIORITY,
        cookie: COOKIE_VM_LFIB_TABLE,
        matches: vec![
            MatchField::EthType(ETHTYPE_MPLS_UNICAST),
            MatchField::MplsLabel(label.value()),
        ],
        instructions: vec![
            Instruction::ApplyActions(vec![Action::PopMpls { ethertype }]),
            Instruction::WriteMetadata {
                value: subnet_route_metadata(elan_tag, vpn),
                mask: METADATA_MASK_SUBNET_ROUTE,
            },
            Instruction::GotoTable(L3_SUBNET_ROUTE_TABLE),
        ],
    }
}

/// Drops traffic to the directed broadcast address of a subnet.
pub fn subnet_broadcast_drop_flow(node: NodeId, vpn: VpnId, broadcast: &IpAddress) -> FlowEntity {
    let host = broadcast.host_prefix();
    FlowEntity {
        key: subnet_drop_flow_key(node, vpn, broadcast),
        priority: SUBNET_BROADCAST_DROP_PRIORITY,
        cookie: COOKIE_SUBNET_ROUTE + u64::from(vpn.value()),
        matches: vec![
            vpn_match(vpn),
            MatchField::EthType(host.ethertype()),
            MatchField::IpDst(host),
        ],
        instructions: vec![Instruction::ApplyActions(vec![Action::Drop])],
    }
}

/// Classifies traffic addressed to the router MAC into the L3 FIB.
pub fn gateway_mac_flow(node: NodeId, vpn: VpnId, mac: &MacAddress) -> FlowEntity {
    FlowEntity {
        key: gateway_mac_flow_key(node, vpn, mac),
        priority: DEFAULT_FIB_FLOW_PRIORITY + 10,
        cookie: COOKIE_ROUTER_INTERFACE + u64::from(vpn.value()),
        matches: vec![vpn_match(vpn), MatchField::EthDst(*mac)],
        instructions: vec![Instruction::GotoTable(L3_FIB_TABLE)],
    }
}

/// Answers echo requests addressed to a router interface.
pub fn ping_responder_flow(
    node: NodeId,
    vpn: VpnId,
    label: MplsLabel,
    ip: &IpAddress,
    mac: &MacAddress,
) -> FlowEntity {
    let host = ip.host_prefix();
    let (proto, icmp, reply) = if ip.is_ipv4() {
        (
            IP_PROTO_ICMP,
            MatchField::Icmpv4 {
                icmp_type: ICMPV4_ECHO_REQUEST,
                code: 0,
            },
            ICMPV4_ECHO_REPLY,
        )
    } else {
        (
            IP_PROTO_ICMPV6,
            MatchField::Icmpv6 {
                icmp_type: ICMPV6_ECHO_REQUEST,
                code: 0,
            },
            ICMPV6_ECHO_REPLY,
        )
    };

    FlowEntity {
        key: ping_responder_flow_key(node, vpn, label),
        priority: PING_RESPONDER_PRIORITY,
        cookie: COOKIE_ROUTER_INTERFACE + u64::from(label.value()),
        matches: vec![
            vpn_match(vpn),
            MatchField::EthType(host.ethertype()),
            MatchField::IpDst(host),
            MatchField::IpProto(proto),
            icmp,
        ],
        instructions: vec![Instruction::ApplyActions(vec![
            Action::MoveIpSrcToDst,
            Action::SetIpSrc(*ip),
            Action::SetEthSrc(*mac),
            Action::SetIcmpType(reply),
            Action::InPort,
        ])],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_metadata_layout() {
        assert_eq!(vpn_metadata(VpnId::new(5)), 10);
        assert_eq!(subnet_route_metadata(3, VpnId::new(5)), (3 << 24) | 10);
        assert_eq!(vpn_metadata(VpnId::new(5)) & METADATA_MASK_VRF_ID, 10);
    }

    #[test]
    fn test_fib_flow_matches_prefix() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        let flow = fib_flow(NodeId::new(1), VpnId::new(5), &prefix, vec![Action::Group(7)]);
        assert_eq!(flow.key.table, L3_FIB_TABLE);
        assert_eq!(flow.priority, 34);
        assert!(flow.matches.contains(&MatchField::IpDst(prefix)));
        assert!(flow.matches.contains(&MatchField::EthType(0x0800)));
        assert_eq!(flow.group_id(), Some(7));
    }

    #[test]
    fn test_lfib_flow_pops_first() {
        let label = MplsLabel::new(5000).unwrap();
        let flow = lfib_flow(NodeId::new(1), label, 0x0800, vec![Action::Group(7)]);
        assert_eq!(
            flow.actions(),
            &[Action::PopMpls { ethertype: 0x0800 }, Action::Group(7)]
        );
        assert!(flow.matches.contains(&MatchField::MplsLabel(5000)));
    }

    #[test]
    fn test_subnet_route_flow_writes_elan_tag() {
        let prefix: IpPrefix = "10.1.0.0/24".parse().unwrap();
        let flow = subnet_route_flow(NodeId::new(2), VpnId::new(4), &prefix, 9);
        assert!(flow.instructions.contains(&Instruction::GotoTable(L3_SUBNET_ROUTE_TABLE)));
        assert!(flow.instructions.contains(&Instruction::WriteMetadata {
            value: (9 << 24) | 8,
            mask: METADATA_MASK_SUBNET_ROUTE,
        }));
    }

    #[test]
    fn test_ping_responder_family() {
        let label = MplsLabel::new(77).unwrap();
        let mac: MacAddress = "fa:16:3e:00:00:01".parse().unwrap();
        let v6: IpAddress = "2001:db8::1".parse().unwrap();
        let flow = ping_responder_flow(NodeId::new(1), VpnId::new(1), label, &v6, &mac);
        assert!(flow.matches.contains(&MatchField::IpProto(58)));
        assert!(flow.actions().contains(&Action::SetIcmpType(129)));
    }
}
