//! Data model of the FIB engine.

mod domain;
mod route;

pub use domain::{
    ExtraRoute, InterfaceClass, NodeMembership, NodeState, OperState, PrefixCue, PrefixInfo,
    RoutingDomain, SegmentType, SubnetSegment, TunnelType,
};
pub use route::{
    EncapType, Route, RouteKey, RouteOrigin, RoutePath, RouterInterfaceMarker, SubnetRouteMarker,
};
