//! Shared test fixtures: permissive collaborators and order builders.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::auth::eip712::AuthError;
use crate::auth::OrderVerifier;
use crate::blockchain::market_registry::MarketRegistry;
use crate::blockchain::types::SettleResponse;
use crate::blockchain::{ChainError, Clearinghouse, MarketCatalog, TxStatus};
use crate::models::order::{OrderCondition, OrderMetadata, OrderTrade, OrderTrader};
use crate::models::{LimitOrder, Market, Order, OrderStatus, OrderSubmission, OrderType};
use crate::persistence::spawn_memory_store;
use crate::services::matching::MatchingEngine;
use crate::services::nonce::NonceRegistry;
use crate::services::price_feed::{FeedError, PriceFeed, PriceTick};
use crate::services::registry::EngineRegistry;
use crate::services::settlement::SettleJob;

pub const TEST_MARKET_ID: u128 = 1;

// ============================================================================
// Builders
// ============================================================================

pub fn market(id: u128) -> Market {
    Market {
        id,
        symbol: format!("sTEST{id}"),
        feed_id: H256::repeat_byte(id as u8),
    }
}

/// A well-formed order: far-future expiration, current-time genesis,
/// nonce zero.
pub fn order(order_type: OrderType, size: i128, price: U256) -> Order {
    let now = chrono::Utc::now().timestamp() as u64;
    Order {
        metadata: OrderMetadata {
            genesis: U256::from(now),
            expiration: U256::from(now + 3600),
            tracking_code: H256::zero(),
            referrer: Address::zero(),
        },
        trader: OrderTrader {
            nonce: U256::zero(),
            account_id: 1,
            signer: Address::zero(),
        },
        trade: OrderTrade {
            order_type,
            market_id: TEST_MARKET_ID,
            size,
            price,
        },
        conditions: vec![OrderCondition {
            target: Address::zero(),
            selector: [0u8; 4],
            data: Bytes::default(),
            expected: H256::zero(),
        }],
    }
}

pub fn submission(account_id: u128, size: i128, price: U256) -> OrderSubmission {
    submission_with_nonce(account_id, size, price, 0)
}

pub fn submission_with_nonce(
    account_id: u128,
    size: i128,
    price: U256,
    nonce: u64,
) -> OrderSubmission {
    let mut order = order(OrderType::Limit, size, price);
    order.trader.account_id = account_id;
    order.trader.nonce = U256::from(nonce);
    OrderSubmission {
        order,
        signature: Bytes::from(vec![1u8; 65]),
    }
}

pub fn market_submission(account_id: u128, size: i128, price: U256) -> OrderSubmission {
    let mut sub = submission(account_id, size, price);
    sub.order.trade.order_type = OrderType::Market;
    sub
}

pub fn stop_submission(
    account_id: u128,
    order_type: OrderType,
    size: i128,
    trigger: U256,
) -> OrderSubmission {
    let mut sub = submission(account_id, size, trigger);
    sub.order.trade.order_type = order_type;
    sub
}

/// A book-resident order, bypassing admission.
pub fn limit_order(account_id: u128, size: i128, price: U256) -> LimitOrder {
    let sub = submission(account_id, size, price);
    LimitOrder {
        order: sub.order,
        signature: sub.signature,
        id: uuid::Uuid::new_v4(),
        timestamp: chrono::Utc::now().timestamp() as u64,
        status: OrderStatus::Active,
        stopped: false,
        tx_hash: None,
    }
}

pub fn stop_order(
    account_id: u128,
    order_type: OrderType,
    size: i128,
    trigger: U256,
) -> LimitOrder {
    let mut order = limit_order(account_id, size, trigger);
    order.order.trade.order_type = order_type;
    order
}

// ============================================================================
// Mock Collaborators
// ============================================================================

/// Accepts every signature.
pub struct AllowAllVerifier;

#[async_trait]
impl OrderVerifier for AllowAllVerifier {
    async fn check_order_signature(
        &self,
        _order: &Order,
        _signature: &Bytes,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn check_delete_signature(
        &self,
        _order: &Order,
        _signature: &Bytes,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }
}

/// Scriptable clearinghouse that counts calls.
#[derive(Default)]
pub struct MockClearinghouse {
    pub can_settle_calls: AtomicUsize,
    pub settle_calls: AtomicUsize,
    reject: Mutex<bool>,
    receipt_status: Mutex<Option<TxStatus>>,
}

impl MockClearinghouse {
    /// Make every feasibility check come back unsuccessful.
    pub fn reject_can_settle(&self) {
        *self.reject.lock() = true;
    }

    pub fn set_receipt_status(&self, status: TxStatus) {
        *self.receipt_status.lock() = Some(status);
    }
}

#[async_trait]
impl Clearinghouse for MockClearinghouse {
    async fn can_settle(&self, _orders: &[LimitOrder]) -> Result<SettleResponse, ChainError> {
        self.can_settle_calls.fetch_add(1, Ordering::SeqCst);
        let reject = *self.reject.lock();
        Ok(SettleResponse {
            success: !reject,
            data: Bytes::default(),
        })
    }

    async fn settle(&self, _orders: &[LimitOrder]) -> Result<H256, ChainError> {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        Ok(H256::repeat_byte(0xAB))
    }

    async fn wait_for_receipt(&self, _tx_hash: H256) -> Result<TxStatus, ChainError> {
        Ok(self.receipt_status.lock().unwrap_or(TxStatus::Confirmed))
    }
}

/// In-memory market listing with swappable contents.
pub struct StaticMarketRegistry {
    markets: Mutex<Vec<Market>>,
}

impl StaticMarketRegistry {
    pub fn new(markets: Vec<Market>) -> Self {
        Self {
            markets: Mutex::new(markets),
        }
    }

    pub fn set_markets(&self, markets: Vec<Market>) {
        *self.markets.lock() = markets;
    }
}

#[async_trait]
impl MarketRegistry for StaticMarketRegistry {
    async fn market_ids(&self) -> Result<Vec<u128>, ChainError> {
        Ok(self.markets.lock().iter().map(|m| m.id).collect())
    }

    async fn symbol(&self, market_id: u128) -> Result<String, ChainError> {
        self.markets
            .lock()
            .iter()
            .find(|m| m.id == market_id)
            .map(|m| m.symbol.clone())
            .ok_or_else(|| ChainError::Contract(format!("unknown market {market_id}")))
    }

    async fn price_feed_id(&self, market_id: u128) -> Result<H256, ChainError> {
        self.markets
            .lock()
            .iter()
            .find(|m| m.id == market_id)
            .map(|m| m.feed_id)
            .ok_or_else(|| ChainError::Contract(format!("unknown market {market_id}")))
    }
}

/// Feeds a fixed tick sequence once, then fails further subscriptions.
pub struct ScriptedPriceFeed {
    ticks: Mutex<VecDeque<i64>>,
}

impl ScriptedPriceFeed {
    pub fn new(prices: Vec<i64>) -> Self {
        Self {
            ticks: Mutex::new(prices.into_iter().collect()),
        }
    }
}

#[async_trait]
impl PriceFeed for ScriptedPriceFeed {
    async fn subscribe(&self, feed_id: H256) -> Result<mpsc::Receiver<PriceTick>, FeedError> {
        let prices: Vec<i64> = self.ticks.lock().drain(..).collect();
        if prices.is_empty() {
            return Err(FeedError::Empty(feed_id));
        }
        let (tx, rx) = mpsc::channel(prices.len());
        for (i, price) in prices.into_iter().enumerate() {
            let _ = tx
                .send(PriceTick {
                    price,
                    expo: 0,
                    publish_time: i as u64,
                })
                .await;
        }
        Ok(rx)
    }
}

// ============================================================================
// Assembled Fixtures
// ============================================================================

/// An engine for the test market with permissive collaborators.
pub fn test_engine() -> Arc<MatchingEngine> {
    Arc::new(MatchingEngine::new(
        market(TEST_MARKET_ID),
        Arc::new(AllowAllVerifier),
        Arc::new(NonceRegistry::new()),
        spawn_memory_store(),
    ))
}

/// A registry over the given market ids, with the raw listing handle so
/// tests can change it. The settlement queue is drained into the void.
pub async fn test_registry(
    market_ids: Vec<u128>,
) -> (Arc<EngineRegistry>, Arc<StaticMarketRegistry>) {
    let listing = Arc::new(StaticMarketRegistry::new(
        market_ids.into_iter().map(market).collect(),
    ));
    let catalog = Arc::new(MarketCatalog::new(
        listing.clone(),
        Duration::from_millis(0),
    ));
    let (settle_tx, mut settle_rx) = mpsc::unbounded_channel::<SettleJob>();
    tokio::spawn(async move { while settle_rx.recv().await.is_some() {} });

    let registry = Arc::new(EngineRegistry::new(
        catalog,
        Arc::new(AllowAllVerifier),
        Arc::new(NonceRegistry::new()),
        spawn_memory_store(),
        Arc::new(ScriptedPriceFeed::new(vec![])),
        settle_tx,
    ));
    (registry, listing)
}
