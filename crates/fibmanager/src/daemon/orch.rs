//! Orch feeding route table, membership and tunnel events into the
//! reconciler.

use crate::error::{FibError, Result};
use crate::reconciler::RouteReconciler;
use crate::types::{OperState, Route, RouteKey};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use vpnfib_orch_common::{Consumer, ConsumerConfig, KeyedMutation, Orch};
use vpnfib_types::{NodeId, RouteDistinguisher};

/// A change observed by the engine's listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FibEvent {
    RouteAdded {
        rd: RouteDistinguisher,
        route: Route,
    },
    RouteUpdated {
        rd: RouteDistinguisher,
        original: Route,
        update: Route,
    },
    RouteRemoved {
        rd: RouteDistinguisher,
        route: Route,
    },
    NodeJoined {
        rd: RouteDistinguisher,
        node: NodeId,
    },
    NodeLeft {
        rd: RouteDistinguisher,
        node: NodeId,
    },
    TunnelState {
        interface: String,
        state: OperState,
    },
}

impl FibEvent {
    pub fn key(&self) -> String {
        match self {
            FibEvent::RouteAdded { rd, route } | FibEvent::RouteRemoved { rd, route } => {
                RouteKey::new(rd.clone(), route.prefix).to_string()
            }
            FibEvent::RouteUpdated { rd, update, .. } => {
                RouteKey::new(rd.clone(), update.prefix).to_string()
            }
            FibEvent::NodeJoined { rd, node } | FibEvent::NodeLeft { rd, node } => {
                format!("node/{}/{}", rd, node)
            }
            FibEvent::TunnelState { interface, .. } => format!("tunnel/{}", interface),
        }
    }

    fn is_removal(&self) -> bool {
        matches!(self, FibEvent::RouteRemoved { .. } | FibEvent::NodeLeft { .. })
    }

    pub fn into_mutation(self) -> KeyedMutation<FibEvent> {
        let key = self.key();
        if self.is_removal() {
            KeyedMutation::del(key, self)
        } else {
            KeyedMutation::set(key, self)
        }
    }
}

impl fmt::Display for FibEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FibEvent::RouteAdded { .. } => write!(f, "route added {}", self.key()),
            FibEvent::RouteUpdated { .. } => write!(f, "route updated {}", self.key()),
            FibEvent::RouteRemoved { .. } => write!(f, "route removed {}", self.key()),
            FibEvent::NodeJoined { rd, node } => write!(f, "node {} joined {}", node, rd),
            FibEvent::NodeLeft { rd, node } => write!(f, "node {} left {}", node, rd),
            FibEvent::TunnelState { interface, state } => {
                write!(f, "tunnel {} {}", interface, state)
            }
        }
    }
}

/// Producer side of a [`FibOrch`].
#[derive(Debug, Clone)]
pub struct FibEventSender {
    tx: mpsc::UnboundedSender<FibEvent>,
}

impl FibEventSender {
    pub fn send(&self, event: FibEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| FibError::QueueClosed(format!("FibOrch stopped, dropped {}", e.0)))
    }
}

pub struct FibOrch {
    reconciler: Arc<RouteReconciler>,
    rx: mpsc::UnboundedReceiver<FibEvent>,
    consumer: Consumer<FibEvent>,
    priority: i32,
}

impl FibOrch {
    /// Events for the same route are never coalesced: an add followed by
    /// a remove must reach the reconciler as two changes.
    pub fn new(reconciler: Arc<RouteReconciler>, batch_size: usize) -> (Self, FibEventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = Consumer::new(
            ConsumerConfig::new("FIB_EVENTS")
                .with_batch_size(batch_size)
                .without_coalescing(),
        );
        (
            Self {
                reconciler,
                rx,
                consumer,
                priority: 0,
            },
            FibEventSender { tx },
        )
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn reconciler(&self) -> &Arc<RouteReconciler> {
        &self.reconciler
    }

    /// Moves events waiting on the channel into the consumer.
    fn collect(&mut self) -> usize {
        let mut received = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            received.push(event.into_mutation());
        }
        let count = received.len();
        self.consumer.add_to_sync(received);
        count
    }

    async fn dispatch(&self, event: FibEvent) -> Result<()> {
        let reconciler = &self.reconciler;
        match event {
            FibEvent::RouteAdded { rd, route } => reconciler.on_route_added(rd, route).await,
            FibEvent::RouteUpdated {
                rd,
                original,
                update,
            } => reconciler.on_route_updated(rd, original, update).await,
            FibEvent::RouteRemoved { rd, route } => reconciler.on_route_removed(rd, route).await,
            FibEvent::NodeJoined { rd, node } => {
                reconciler.on_node_joined(rd, node).await.map(drop)
            }
            FibEvent::NodeLeft { rd, node } => reconciler.on_node_left(rd, node).await.map(drop),
            FibEvent::TunnelState { interface, state } => {
                drop(reconciler.on_tunnel_state(interface, state));
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Orch for FibOrch {
    fn name(&self) -> &str {
        "FibOrch"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn do_task(&mut self) {
        let batch = self.consumer.drain_batch();
        debug!("FibOrch: dispatching {} events", batch.len());
        for entry in batch {
            let description = entry.payload.to_string();
            match self.dispatch(entry.payload.clone()).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    warn!("FibOrch: {} will be retried: {}", description, e);
                    self.consumer.retry(entry);
                }
                Err(e) => e.log("FibOrch", &description),
            }
        }
    }

    fn has_pending_tasks(&self) -> bool {
        self.consumer.has_pending()
    }

    fn dump_pending_tasks(&self) -> Vec<String> {
        self.consumer.dump()
    }

    async fn on_timer(&mut self) {
        let received = self.collect();
        if received > 0 {
            debug!("FibOrch: {} events queued", received);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FibConfig;
    use crate::sim::InMemoryFabric;
    use crate::types::{NodeState, PrefixInfo, RouteOrigin, RoutingDomain};
    use pretty_assertions::assert_eq;
    use vpnfib_orch_common::Operation;
    use vpnfib_types::VpnId;

    fn route() -> Route {
        Route::new("10.0.0.0/24".parse().unwrap(), RouteOrigin::Connected)
            .with_path("192.168.1.5".parse().unwrap(), None)
    }

    #[test]
    fn test_event_keys() {
        let rd: RouteDistinguisher = "100:1".parse().unwrap();
        let added = FibEvent::RouteAdded {
            rd: rd.clone(),
            route: route(),
        };
        assert_eq!(added.key(), "100:1/10.0.0.0/24");
        assert_eq!(
            FibEvent::NodeLeft {
                rd,
                node: NodeId::new(3)
            }
            .into_mutation()
            .op,
            Operation::Del
        );
        assert_eq!(
            FibEvent::TunnelState {
                interface: "tun-1-2".to_string(),
                state: OperState::Down
            }
            .to_string(),
            "tunnel tun-1-2 down"
        );
    }

    #[test]
    fn test_event_json() {
        let json = r#"{"event": "node_joined", "rd": "100:1", "node": 4}"#;
        let event: FibEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            FibEvent::NodeJoined {
                rd: "100:1".parse().unwrap(),
                node: NodeId::new(4)
            }
        );
    }

    #[tokio::test]
    async fn test_events_reach_the_reconciler() {
        let fabric = InMemoryFabric::new();
        let domain = RoutingDomain::new("vpnA", VpnId::new(1), "100:1".parse().unwrap())
            .with_node(NodeId::new(1), NodeState::Active)
            .with_node(NodeId::new(2), NodeState::Active);
        fabric.add_domain(domain.clone());
        fabric.set_tunnel_endpoint(NodeId::new(1), "192.168.1.5".parse().unwrap());
        fabric.set_tunnel_endpoint(NodeId::new(2), "192.168.1.6".parse().unwrap());
        fabric.add_prefix(
            domain.id,
            PrefixInfo::new("10.0.0.0/24".parse().unwrap(), NodeId::new(1), "tap1"),
        );

        let reconciler = Arc::new(RouteReconciler::new(
            FibConfig::default(),
            fabric.collaborators(),
        ));
        let (mut orch, sender) = FibOrch::new(reconciler.clone(), 16);

        sender
            .send(FibEvent::RouteAdded {
                rd: domain.rd.clone(),
                route: route(),
            })
            .unwrap();
        sender
            .send(FibEvent::RouteRemoved {
                rd: domain.rd.clone(),
                route: route(),
            })
            .unwrap();
        assert!(!orch.has_pending_tasks());

        orch.on_timer().await;
        assert_eq!(orch.dump_pending_tasks().len(), 2);
        orch.do_task().await;
        assert!(!orch.has_pending_tasks());
        reconciler.wait_idle().await;

        let stats = reconciler.stats();
        assert_eq!(stats.routes_added, 1);
        assert_eq!(stats.routes_removed, 1);
        assert_eq!(fabric.flow_count(), 0);
    }
}
