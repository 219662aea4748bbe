//! Engine registry and maintenance loops.
//!
//! One engine per listed market. The registry owns the periodic loops:
//! reconciling engines against the on-chain listing, pumping staged
//! settlements to the coordinator, flushing dirty books, and flushing dirty
//! nonces. Loops are fixed-delay and self-contained; a slow pass delays the
//! next one rather than overlapping it.

use std::sync::Arc;

use dashmap::DashMap;
use ethers::types::{Bytes, U256};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::OrderVerifier;
use crate::blockchain::MarketCatalog;
use crate::constants;
use crate::models::{LimitOrder, OrderSubmission, Side};
use crate::persistence::PersistenceHandle;
use crate::services::matching::{MatchingEngine, OrderError};
use crate::services::nonce::NonceRegistry;
use crate::services::price_feed::PriceFeed;
use crate::services::settlement::SettleJob;
use crate::services::stops::run_stop_trigger_loop;

pub struct EngineRegistry {
    engines: DashMap<u128, Arc<MatchingEngine>>,
    catalog: Arc<MarketCatalog>,
    verifier: Arc<dyn OrderVerifier>,
    nonces: Arc<NonceRegistry>,
    persistence: PersistenceHandle,
    feed: Arc<dyn PriceFeed>,
    settle_tx: mpsc::UnboundedSender<SettleJob>,
}

impl EngineRegistry {
    pub fn new(
        catalog: Arc<MarketCatalog>,
        verifier: Arc<dyn OrderVerifier>,
        nonces: Arc<NonceRegistry>,
        persistence: PersistenceHandle,
        feed: Arc<dyn PriceFeed>,
        settle_tx: mpsc::UnboundedSender<SettleJob>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            catalog,
            verifier,
            nonces,
            persistence,
            feed,
            settle_tx,
        }
    }

    // ========================================================================
    // Order Intake
    // ========================================================================

    pub fn engine(&self, market_id: u128) -> Option<Arc<MatchingEngine>> {
        self.engines.get(&market_id).map(|e| e.value().clone())
    }

    fn engine_or_err(&self, market_id: u128) -> Result<Arc<MatchingEngine>, OrderError> {
        self.engine(market_id)
            .ok_or(OrderError::MarketNotFound(market_id))
    }

    /// Admit an order into its market's engine and hand any settlements it
    /// staged straight to the coordinator.
    pub async fn submit_order(&self, submission: OrderSubmission) -> Result<Uuid, OrderError> {
        let engine = self.engine_or_err(submission.order.trade.market_id)?;
        let id = engine.add_order(submission).await?;
        self.enqueue_claimable(&engine);
        Ok(id)
    }

    pub async fn cancel_order(
        &self,
        market_id: u128,
        id: Uuid,
        signature: &Bytes,
    ) -> Result<(), OrderError> {
        let engine = self.engine_or_err(market_id)?;
        engine.delete_order(id, signature).await
    }

    pub async fn replace_order(
        &self,
        market_id: u128,
        id: Uuid,
        replacement: OrderSubmission,
    ) -> Result<Uuid, OrderError> {
        let engine = self.engine_or_err(market_id)?;
        let new_id = engine.update_order(id, replacement).await?;
        self.enqueue_claimable(&engine);
        Ok(new_id)
    }

    pub fn orders(
        &self,
        market_id: u128,
        side: Side,
        price: Option<U256>,
    ) -> Result<Vec<LimitOrder>, OrderError> {
        Ok(self.engine_or_err(market_id)?.orders_without_sigs(side, price))
    }

    /// Drop every order the account holds across all markets. Driven by
    /// liquidation events.
    pub fn remove_account_orders(&self, account_id: u128) -> usize {
        self.engines
            .iter()
            .map(|e| e.value().remove_account_orders(account_id))
            .sum()
    }

    fn enqueue_claimable(&self, engine: &Arc<MatchingEngine>) {
        for (settlement_id, orders) in engine.claim_settlements() {
            let job = SettleJob {
                engine: engine.clone(),
                settlement_id,
                orders,
            };
            if self.settle_tx.send(job).is_err() {
                error!("settlement worker is gone, job dropped");
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Reconcile engines against the on-chain market listing: build and
    /// hydrate engines for new markets, close engines whose market vanished.
    pub async fn add_missing(self: &Arc<Self>) {
        let markets = match self.catalog.load_markets().await {
            Ok(markets) => markets,
            Err(e) => {
                error!(error = %e, "market listing unavailable");
                return;
            }
        };

        for market in &markets {
            if self.engines.contains_key(&market.id) {
                continue;
            }
            let engine = Arc::new(MatchingEngine::new(
                market.clone(),
                self.verifier.clone(),
                self.nonces.clone(),
                self.persistence.clone(),
            ));
            engine.hydrate().await;
            self.engines.insert(market.id, engine.clone());
            info!(market_id = market.id, symbol = %market.symbol, "engine started");

            tokio::spawn(run_stop_trigger_loop(
                engine,
                self.feed.clone(),
                constants::FEED_RECONNECT_DELAY,
            ));
        }

        for entry in self.engines.iter() {
            let market_id = *entry.key();
            if !markets.iter().any(|m| m.id == market_id) {
                entry.value().close();
            }
        }
    }

    /// Hand every unclaimed staged settlement to the coordinator. Safety
    /// net behind the immediate post-admission enqueue.
    pub fn pump_settlements(&self) {
        for entry in self.engines.iter() {
            self.enqueue_claimable(entry.value());
        }
    }

    /// Run the full settle scan on every engine.
    pub async fn check_all_for_possible_settles(&self) {
        let engines: Vec<Arc<MatchingEngine>> =
            self.engines.iter().map(|e| e.value().clone()).collect();
        for engine in engines {
            engine.check_for_possible_settles().await;
        }
    }

    /// Flush every dirty book to the persistence worker.
    pub fn persist_all(&self) {
        for entry in self.engines.iter() {
            entry.value().persist_if_dirty();
        }
    }

    fn persist_nonces(&self) {
        if self.nonces.take_dirty() {
            self.persistence.save_nonces(self.nonces.snapshot());
        }
    }

    /// Restore nonces, build the initial engine set, and start the periodic
    /// loops.
    pub async fn run(self: Arc<Self>) {
        self.nonces.restore(self.persistence.load_nonces().await);
        self.add_missing().await;

        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(constants::RECHECK_ENGINES).await;
                registry.add_missing().await;
                registry.check_all_for_possible_settles().await;
            }
        });

        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(constants::RECHECK_SETTLES).await;
                registry.pump_settlements();
            }
        });

        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(constants::PERSIST_ALL_BOOKS).await;
                registry.persist_all();
            }
        });

        let registry = self;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(constants::PERSIST_NONCES).await;
                registry.persist_nonces();
            }
        });
    }

    /// Close every engine, flushing final snapshots and the nonce table.
    pub fn shutdown(&self) {
        for entry in self.engines.iter() {
            entry.value().close();
        }
        self.persistence.save_nonces(self.nonces.snapshot());
        info!("engine registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{submission, test_registry};

    #[tokio::test]
    async fn add_missing_builds_engines_for_listed_markets() {
        let (registry, markets) = test_registry(vec![1, 2]).await;
        registry.add_missing().await;

        assert!(registry.engine(1).is_some());
        assert!(registry.engine(2).is_some());
        assert!(registry.engine(3).is_none());
        drop(markets);
    }

    #[tokio::test]
    async fn vanished_market_closes_its_engine() {
        let (registry, markets) = test_registry(vec![1, 2]).await;
        registry.add_missing().await;

        markets.set_markets(vec![crate::testkit::market(1)]);
        registry.add_missing().await;

        assert!(registry.engine(2).unwrap().is_closed());
        assert!(!registry.engine(1).unwrap().is_closed());
    }

    #[tokio::test]
    async fn submit_routes_to_the_market_engine() {
        let (registry, _markets) = test_registry(vec![1]).await;
        registry.add_missing().await;

        let id = registry
            .submit_order(submission(1, 10, U256::from(100)))
            .await
            .unwrap();
        assert!(registry.engine(1).unwrap().order(&id).is_some());

        let mut other = submission(2, 10, U256::from(100));
        other.order.trade.market_id = 9;
        let err = registry.submit_order(other).await.unwrap_err();
        assert!(matches!(err, OrderError::MarketNotFound(9)));
    }

    #[tokio::test]
    async fn read_surface_redacts_signatures() {
        let (registry, _markets) = test_registry(vec![1]).await;
        registry.add_missing().await;
        registry
            .submit_order(submission(1, 10, U256::from(100)))
            .await
            .unwrap();

        let orders = registry.orders(1, Side::Buy, None).unwrap();
        assert_eq!(orders.len(), 1);
        assert!(orders[0].signature.is_empty());
    }

    #[tokio::test]
    async fn liquidation_removes_account_orders_across_markets() {
        let (registry, _markets) = test_registry(vec![1, 2]).await;
        registry.add_missing().await;
        registry
            .submit_order(submission(7, 10, U256::from(100)))
            .await
            .unwrap();
        let mut second = submission(7, 10, U256::from(100));
        second.order.trade.market_id = 2;
        second.order.trader.nonce = U256::one();
        registry.submit_order(second).await.unwrap();

        assert_eq!(registry.remove_account_orders(7), 2);
        assert!(registry.orders(1, Side::Buy, None).unwrap().is_empty());
        assert!(registry.orders(2, Side::Buy, None).unwrap().is_empty());
    }
}
