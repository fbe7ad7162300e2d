//! Group lifecycle for local next hops, extra-route ECMP and gateway load
//! balancing.

mod manager;
mod types;

pub use manager::{NextHopConfig, NextHopGroupManager};
pub use types::{
    encap_actions, gateway_key, EcmpEncap, EcmpKey, EcmpMember, EcmpRecord, GatewayGroup,
    LocalNextHop, LocalNextHopKey, NextHopSummary,
};
