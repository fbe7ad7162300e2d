//! Store transactions and the runner that commits them.

use crate::collaborators::FibStore;
use crate::error::{FibError, Result};
use crate::flow::{FlowEntity, FlowKey, GroupEntity, GroupKey};
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    PutFlow(FlowEntity),
    DeleteFlow(FlowKey),
    PutGroup(GroupEntity),
    DeleteGroup(GroupKey),
}

/// Write-only batch of flow and group mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<StoreOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_flow(&mut self, flow: FlowEntity) {
        self.ops.push(StoreOp::PutFlow(flow));
    }

    pub fn delete_flow(&mut self, key: FlowKey) {
        self.ops.push(StoreOp::DeleteFlow(key));
    }

    pub fn put_group(&mut self, group: GroupEntity) {
        self.ops.push(StoreOp::PutGroup(group));
    }

    pub fn delete_group(&mut self, key: GroupKey) {
        self.ops.push(StoreOp::DeleteGroup(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Commits transactions, retrying transient failures a bounded number of
/// times.
#[derive(Clone)]
pub struct TransactionRunner {
    store: Arc<dyn FibStore>,
    max_retries: u32,
    backoff: Duration,
}

impl TransactionRunner {
    pub fn new(store: Arc<dyn FibStore>, max_retries: u32, backoff: Duration) -> Self {
        Self {
            store,
            max_retries,
            backoff,
        }
    }

    pub async fn submit(&self, tx: Transaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.store.commit(tx.clone()).await {
                Ok(()) => {
                    debug!("TransactionRunner: committed {} ops", tx.len());
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "TransactionRunner: commit attempt {} failed, retrying: {}",
                        attempt, e
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => {
                    error!(
                        "TransactionRunner: commit of {} ops failed after {} retries: {}",
                        tx.len(),
                        attempt,
                        e
                    );
                    return Err(FibError::Store(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::builder::fib_flow;
    use crate::sim::InMemoryFabric;
    use pretty_assertions::assert_eq;
    use vpnfib_types::{NodeId, VpnId};

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new();
        tx.put_flow(fib_flow(
            NodeId::new(1),
            VpnId::new(1),
            &"10.0.0.0/24".parse().unwrap(),
            vec![],
        ));
        tx
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fabric = InMemoryFabric::new();
        fabric.fail_next_commits(2);
        let runner = TransactionRunner::new(Arc::new(fabric.clone()), 3, Duration::from_millis(1));

        runner.submit(sample_tx()).await.unwrap();
        assert_eq!(fabric.flow_count(), 1);
        assert_eq!(fabric.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let fabric = InMemoryFabric::new();
        fabric.fail_next_commits(5);
        let runner = TransactionRunner::new(Arc::new(fabric.clone()), 2, Duration::from_millis(1));

        let result = runner.submit(sample_tx()).await;
        assert!(matches!(result, Err(FibError::Store(_))));
        assert_eq!(fabric.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_transaction_is_not_committed() {
        let fabric = InMemoryFabric::new();
        let runner = TransactionRunner::new(Arc::new(fabric.clone()), 2, Duration::from_millis(1));
        runner.submit(Transaction::new()).await.unwrap();
        assert_eq!(fabric.commit_count(), 0);
    }
}
