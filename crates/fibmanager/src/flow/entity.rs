//! Flow and group entities as handed to the store and the installer.

use serde::{Deserialize, Serialize};
use std::fmt;
use vpnfib_types::{IpAddress, IpPrefix, MacAddress, NodeId};

/// Identity of a flow: node, table and a reference string unique within the
/// table. Installing a flow with an existing key replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub node: NodeId,
    pub table: u8,
    pub flow_ref: String,
}

impl FlowKey {
    pub fn new(node: NodeId, table: u8, flow_ref: impl Into<String>) -> Self {
        Self {
            node,
            table,
            flow_ref: flow_ref.into(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node, self.table, self.flow_ref)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Metadata { value: u64, mask: u64 },
    EthType(u16),
    EthDst(MacAddress),
    IpDst(IpPrefix),
    IpProto(u8),
    Icmpv4 { icmp_type: u8, code: u8 },
    Icmpv6 { icmp_type: u8, code: u8 },
    MplsLabel(u32),
    TunnelId(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Group(u32),
    PushMpls { ethertype: u16 },
    PopMpls { ethertype: u16 },
    SetMplsLabel(u32),
    SetTunnelId(u64),
    SetEthSrc(MacAddress),
    SetEthDst(MacAddress),
    /// Swaps the IP source into the destination.
    MoveIpSrcToDst,
    SetIpSrc(IpAddress),
    SetIcmpType(u8),
    /// Sends the packet back out of its ingress port.
    InPort,
    Output { port: String },
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    ApplyActions(Vec<Action>),
    WriteMetadata { value: u64, mask: u64 },
    GotoTable(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntity {
    pub key: FlowKey,
    pub priority: u16,
    pub cookie: u64,
    pub matches: Vec<MatchField>,
    pub instructions: Vec<Instruction>,
}

impl FlowEntity {
    pub fn node(&self) -> NodeId {
        self.key.node
    }

    /// Actions of the first apply-actions instruction.
    pub fn actions(&self) -> &[Action] {
        self.instructions
            .iter()
            .find_map(|i| match i {
                Instruction::ApplyActions(actions) => Some(actions.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Group the flow forwards to, if any.
    pub fn group_id(&self) -> Option<u32> {
        self.actions().iter().find_map(|a| match a {
            Action::Group(id) => Some(*id),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// Every bucket is executed; used with one bucket as an indirect pointer.
    All,
    /// One bucket is selected per flow.
    Select,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: u32,
    pub weight: u16,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub node: NodeId,
    pub group_id: u32,
}

impl GroupKey {
    pub fn new(node: NodeId, group_id: u32) -> Self {
        Self { node, group_id }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:group:{}", self.node, self.group_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntity {
    pub key: GroupKey,
    pub name: String,
    pub group_type: GroupType,
    pub buckets: Vec<Bucket>,
}

impl GroupEntity {
    pub fn bucket(&self, id: u32) -> Option<&Bucket> {
        self.buckets.iter().find(|b| b.id == id)
    }
}
