//! Daemon layer: the tick loop driving orchs and the orch feeding route
//! events into the reconciler.

mod fibdaemon;
mod orch;

pub use fibdaemon::{FibDaemon, FibDaemonConfig};
pub use orch::{FibEvent, FibEventSender, FibOrch};
