//! Value types shared by the vpnfib crates.
//!
//! - [`IpAddress`], [`IpPrefix`]: IPv4/IPv6 addresses and CIDR prefixes
//! - [`MacAddress`]: 48-bit Ethernet addresses
//! - [`NodeId`], [`VpnId`], [`RouteDistinguisher`], [`MplsLabel`]: identifiers
//!   used to key forwarding state

mod ids;
mod ip;
mod mac;

pub use ids::{MplsLabel, NodeId, RouteDistinguisher, VpnId};
pub use ip::{IpAddress, IpPrefix};
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid route distinguisher: {0}")]
    InvalidRouteDistinguisher(String),

    #[error("invalid MPLS label: {0} (must be 0-1048575)")]
    InvalidMplsLabel(u32),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}
