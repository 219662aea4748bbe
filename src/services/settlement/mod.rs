//! On-chain settlement of staged order groups.
//!
//! Groups move through a small state machine: staged, in flight, at most one
//! retry after a fixed delay, then executed or terminally failed. The
//! coordinator is a stateless executor over engine-held pending groups;
//! every error is absorbed here and surfaces only as the group's terminal
//! state.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::H256;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blockchain::{Clearinghouse, TxStatus};
use crate::constants;
use crate::models::LimitOrder;
use crate::services::matching::MatchingEngine;

/// A staged settlement group held by its engine.
#[derive(Debug, Clone)]
pub struct PendingSettlement {
    pub order_ids: Vec<Uuid>,
    pub retry_count: u32,
    /// Hash of the last submitted settlement transaction
    pub tx_hash: Option<H256>,
    /// Claimed by the coordinator; not re-enqueued by the pump
    pub in_flight: bool,
}

/// Terminal result applied back to a settlement group.
#[derive(Debug, Clone, Copy)]
pub enum SettlementOutcome {
    Executed(H256),
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Chain error: {0}")]
    Chain(#[from] crate::blockchain::ChainError),

    #[error("Settlement infeasible: {0}")]
    Infeasible(String),

    #[error("Settlement transaction {0:?} ended {1}")]
    NotConfirmed(H256, TxStatus),
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_retries: constants::SETTLEMENT_MAX_RETRIES,
            retry_delay: constants::SETTLEMENT_RETRY_DELAY,
        }
    }
}

/// One settlement attempt handed from an engine to the coordinator.
pub struct SettleJob {
    pub engine: Arc<MatchingEngine>,
    pub settlement_id: H256,
    pub orders: Vec<LimitOrder>,
}

/// Drives claimed settlement groups to a terminal state.
pub struct SettlementCoordinator {
    clearinghouse: Arc<dyn Clearinghouse>,
    config: SettlementConfig,
}

impl SettlementCoordinator {
    pub fn new(clearinghouse: Arc<dyn Clearinghouse>, config: SettlementConfig) -> Self {
        Self {
            clearinghouse,
            config,
        }
    }

    /// Consume jobs from the queue, each on its own task so a retry delay
    /// never stalls the queue.
    pub fn start_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SettleJob>) {
        tokio::spawn(async move {
            info!("settlement worker started");
            while let Some(job) = rx.recv().await {
                let coordinator = self.clone();
                tokio::spawn(async move {
                    coordinator.process(job).await;
                });
            }
            info!("settlement worker stopped");
        });
    }

    /// Attempt the group, retry once after the configured delay, then mark
    /// the terminal outcome on the engine.
    pub async fn process(&self, job: SettleJob) {
        let sid = job.settlement_id;

        for attempt in 0..=self.config.max_retries {
            match self.attempt(&job).await {
                Ok(tx_hash) => {
                    self.finish(&job, SettlementOutcome::Executed(tx_hash));
                    return;
                }
                Err(e) if attempt < self.config.max_retries => {
                    warn!(
                        settlement_id = ?sid,
                        attempt,
                        error = %e,
                        "settlement attempt failed, retrying"
                    );
                    job.engine.note_settlement_retry(sid);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    error!(settlement_id = ?sid, error = %e, "settlement failed");
                    self.finish(&job, SettlementOutcome::Failed);
                    return;
                }
            }
        }
    }

    async fn attempt(&self, job: &SettleJob) -> Result<H256, SettlementError> {
        // Simulate first; an infeasible group never reaches the chain
        let response = self.clearinghouse.can_settle(&job.orders).await?;
        if !response.success {
            return Err(SettlementError::Infeasible(format!(
                "0x{}",
                ethers::utils::hex::encode(&response.data)
            )));
        }

        let tx_hash = self.clearinghouse.settle(&job.orders).await?;
        job.engine.record_settlement_tx(job.settlement_id, tx_hash);

        match self.clearinghouse.wait_for_receipt(tx_hash).await? {
            TxStatus::Confirmed => Ok(tx_hash),
            status => Err(SettlementError::NotConfirmed(tx_hash, status)),
        }
    }

    fn finish(&self, job: &SettleJob, outcome: SettlementOutcome) {
        job.engine.complete_settlement(job.settlement_id, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use crate::testkit::{submission, test_engine, MockClearinghouse};
    use ethers::types::U256;
    use std::sync::atomic::Ordering;

    async fn engine_with_staged_pair() -> (Arc<MatchingEngine>, SettleJob, Arc<MockClearinghouse>) {
        let engine = test_engine();
        engine
            .add_order(submission(1, 10, U256::from(100)))
            .await
            .unwrap();
        engine
            .add_order(submission(2, -10, U256::from(90)))
            .await
            .unwrap();
        let mut jobs = engine.claim_settlements();
        assert_eq!(jobs.len(), 1);
        let (settlement_id, orders) = jobs.pop().unwrap();
        let clearinghouse = Arc::new(MockClearinghouse::default());
        let job = SettleJob {
            engine: engine.clone(),
            settlement_id,
            orders,
        };
        (engine, job, clearinghouse)
    }

    fn coordinator(clearinghouse: Arc<MockClearinghouse>) -> SettlementCoordinator {
        SettlementCoordinator::new(
            clearinghouse,
            SettlementConfig {
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn feasible_group_executes_participants() {
        let (engine, job, clearinghouse) = engine_with_staged_pair().await;
        let ids = job.orders.iter().map(|o| o.id).collect::<Vec<_>>();

        coordinator(clearinghouse.clone()).process(job).await;

        assert_eq!(engine.pending_settlement_count(), 0);
        for id in ids {
            let order = engine.order(&id).unwrap();
            assert_eq!(order.status, OrderStatus::Executed);
            assert!(order.tx_hash.is_some());
        }
        assert_eq!(clearinghouse.can_settle_calls.load(Ordering::SeqCst), 1);
        assert_eq!(clearinghouse.settle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn infeasible_group_retries_exactly_once_then_fails() {
        let (engine, job, clearinghouse) = engine_with_staged_pair().await;
        clearinghouse.reject_can_settle();
        let ids = job.orders.iter().map(|o| o.id).collect::<Vec<_>>();

        coordinator(clearinghouse.clone()).process(job).await;

        // One initial attempt plus exactly one retry, no transaction sent
        assert_eq!(clearinghouse.can_settle_calls.load(Ordering::SeqCst), 2);
        assert_eq!(clearinghouse.settle_calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.pending_settlement_count(), 0);
        for id in ids {
            assert_eq!(engine.order(&id).unwrap().status, OrderStatus::Failed);
        }
    }

    #[tokio::test]
    async fn reverted_transaction_counts_as_failure() {
        let (engine, job, clearinghouse) = engine_with_staged_pair().await;
        clearinghouse.set_receipt_status(TxStatus::Reverted);
        let ids = job.orders.iter().map(|o| o.id).collect::<Vec<_>>();

        coordinator(clearinghouse.clone()).process(job).await;

        assert_eq!(clearinghouse.settle_calls.load(Ordering::SeqCst), 2);
        for id in ids {
            assert_eq!(engine.order(&id).unwrap().status, OrderStatus::Failed);
        }
    }

    #[tokio::test]
    async fn failed_participants_are_not_paired_again() {
        let (engine, job, clearinghouse) = engine_with_staged_pair().await;
        clearinghouse.reject_can_settle();

        coordinator(clearinghouse).process(job).await;

        // A fresh sell crosses the failed buy on price, but terminally
        // marked orders are never paired again
        engine
            .add_order(submission(3, -10, U256::from(90)))
            .await
            .unwrap();
        assert_eq!(engine.pending_settlement_count(), 0);
    }
}
