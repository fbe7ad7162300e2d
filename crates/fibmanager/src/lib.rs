//! vpnfib FIB manager - L3VPN forwarding state reconciliation
//!
//! Converts route table changes of L3VPN routing domains into forwarding
//! state on every node the domain spans: local and remote FIB entries,
//! MPLS label-switch entries, load-balancing groups and tunnel
//! encapsulation.
//!
//! # Architecture
//!
//! ```text
//! [route table] ──> [FibOrch] ──> [RouteReconciler] ──> [handlers] ──> [store / installer]
//!                                       │                   │
//!                                 [JobCoordinator]   [AdjacencyResolver]
//!                                                    [NextHopGroupManager]
//!                                                    [LabelRouteRegistry]
//! ```
//!
//! # Key Components
//!
//! - [`reconciler::RouteReconciler`]: classifies changes and runs them as
//!   keyed jobs
//! - [`handlers`]: one strategy per route origin
//! - [`adjacency::AdjacencyResolver`]: next hop to egress per target node
//! - [`nexthop::NextHopGroupManager`]: local next hops and ECMP groups
//! - [`label::LabelRouteRegistry`]: label ownership shared across domains
//! - [`daemon::FibDaemon`]: tick loop driving the orchs
//! - [`sim::InMemoryFabric`]: in-memory implementation of every
//!   collaborator

pub mod adjacency;
pub mod audit;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod flow;
pub mod handlers;
pub mod interface_wait;
pub mod label;
pub mod nexthop;
pub mod programmer;
pub mod reconciler;
pub mod sim;
pub mod txn;
pub mod types;

pub use config::FibConfig;
pub use error::{FibError, Result};
pub use reconciler::RouteReconciler;
