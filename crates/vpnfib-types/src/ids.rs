//! Identifiers that key forwarding state.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A forwarding node (datapath) participating in routing domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        NodeId(id)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(NodeId)
            .map_err(|_| ParseError::InvalidNodeId(s.to_string()))
    }
}

/// Numeric identifier of a routing domain, written into flow metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VpnId(u32);

impl VpnId {
    pub const fn new(id: u32) -> Self {
        VpnId(id)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VpnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Route distinguisher in `<admin>:<assigned>` form, e.g. "100:1" or
/// "10.1.1.1:7".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteDistinguisher(String);

impl RouteDistinguisher {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RouteDistinguisher {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((admin, assigned))
                if !admin.is_empty() && assigned.parse::<u32>().is_ok() =>
            {
                Ok(RouteDistinguisher(s.to_string()))
            }
            _ => Err(ParseError::InvalidRouteDistinguisher(s.to_string())),
        }
    }
}

impl TryFrom<String> for RouteDistinguisher {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RouteDistinguisher> for String {
    fn from(rd: RouteDistinguisher) -> Self {
        rd.0
    }
}

/// A 20-bit MPLS label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct MplsLabel(u32);

impl MplsLabel {
    pub const MAX: u32 = (1 << 20) - 1;

    pub fn new(value: u32) -> Result<Self, ParseError> {
        if value > Self::MAX {
            return Err(ParseError::InvalidMplsLabel(value));
        }
        Ok(MplsLabel(value))
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MplsLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<u32> for MplsLabel {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        MplsLabel::new(value)
    }
}

impl From<MplsLabel> for u32 {
    fn from(label: MplsLabel) -> Self {
        label.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_route_distinguisher_forms() {
        let rd: RouteDistinguisher = "100:1".parse().unwrap();
        assert_eq!(rd.as_str(), "100:1");
        assert!("10.1.1.1:7".parse::<RouteDistinguisher>().is_ok());
        assert!("100".parse::<RouteDistinguisher>().is_err());
        assert!(":1".parse::<RouteDistinguisher>().is_err());
        assert!("100:x".parse::<RouteDistinguisher>().is_err());
    }

    #[test]
    fn test_mpls_label_range() {
        assert_eq!(MplsLabel::new(5000).unwrap().value(), 5000);
        assert!(MplsLabel::new(MplsLabel::MAX).is_ok());
        assert_eq!(
            MplsLabel::new(MplsLabel::MAX + 1),
            Err(ParseError::InvalidMplsLabel(MplsLabel::MAX + 1))
        );
    }

    #[test]
    fn test_label_deserialize_rejects_out_of_range() {
        let ok: MplsLabel = serde_json::from_str("5000").unwrap();
        assert_eq!(ok.value(), 5000);
        assert!(serde_json::from_str::<MplsLabel>("2000000").is_err());
    }

    #[test]
    fn test_node_id_parse() {
        let node: NodeId = "42".parse().unwrap();
        assert_eq!(node, NodeId::new(42));
        assert!("n42".parse::<NodeId>().is_err());
    }
}
