//! Per-market matching engine.
//!
//! One engine owns one market's book, its pending settlement groups, and the
//! flags that make repeated maintenance passes cheap. All mutable state sits
//! behind a single mutex whose scopes are synchronous and never cross an
//! await; signature checks and chain calls happen outside it, and concurrent
//! outstanding work is reconciled by the pending-order guard and the
//! book-clean flag rather than by long-held locks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ethers::types::{Bytes, H256, U256};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::OrderVerifier;
use crate::models::{LimitOrder, Market, Order, OrderStatus, OrderSubmission, OrderType, Side};
use crate::persistence::PersistenceHandle;
use crate::services::matching::book::OrderBook;
use crate::services::matching::{settlement_id, OrderError};
use crate::services::nonce::NonceRegistry;
use crate::services::settlement::{PendingSettlement, SettlementOutcome};

struct EngineState {
    book: OrderBook,
    pending: HashMap<H256, PendingSettlement>,
    /// Orders claimed by some pending settlement; pairwise disjoint by
    /// construction since claimed orders are never paired again
    pending_orders: HashSet<Uuid>,
    /// Set when a full settle scan has run with no mutation since
    book_clean: bool,
    /// Set when the persisted snapshot reflects the current book
    in_sync: bool,
    closed: bool,
}

impl EngineState {
    fn new() -> Self {
        Self {
            book: OrderBook::new(),
            pending: HashMap::new(),
            pending_orders: HashSet::new(),
            book_clean: false,
            in_sync: true,
            closed: false,
        }
    }

    fn touch(&mut self) {
        self.book_clean = false;
        self.in_sync = false;
    }
}

pub struct MatchingEngine {
    market: Market,
    verifier: Arc<dyn OrderVerifier>,
    nonces: Arc<NonceRegistry>,
    persistence: PersistenceHandle,
    state: Mutex<EngineState>,
}

impl MatchingEngine {
    pub fn new(
        market: Market,
        verifier: Arc<dyn OrderVerifier>,
        nonces: Arc<NonceRegistry>,
        persistence: PersistenceHandle,
    ) -> Self {
        Self {
            market,
            verifier,
            nonces,
            persistence,
            state: Mutex::new(EngineState::new()),
        }
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Validate and admit a signed order. Validation runs in full before the
    /// book is touched; nothing about a rejected order is recorded.
    pub async fn add_order(&self, submission: OrderSubmission) -> Result<Uuid, OrderError> {
        let OrderSubmission { order, signature } = submission;
        self.validate(&order, &signature).await?;

        let now = chrono::Utc::now().timestamp() as u64;
        let resting = LimitOrder {
            order,
            signature,
            id: Uuid::new_v4(),
            timestamp: now,
            status: OrderStatus::Active,
            stopped: false,
            tx_hash: None,
        };
        let id = resting.id;
        let order_type = resting.order.trade.order_type;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(OrderError::MarketClosed);
            }
            // The nonce may have advanced while the signature was verified
            let account = resting.order.trader.account_id;
            if !self.nonces.matches(account, resting.order.trader.nonce) {
                return Err(OrderError::InvalidNonce);
            }

            match order_type {
                OrderType::Limit => {
                    state.book.insert_live(resting);
                    state.touch();
                }
                OrderType::Stop | OrderType::StopLimit => {
                    state.book.insert_stop(resting);
                    state.touch();
                }
                OrderType::Market => {
                    // Pair immediately against resting liquidity; an
                    // unclaimed remainder never rests
                    state.book.insert_live(resting);
                    state.touch();
                    Self::pair_crossing(&mut state, Side::Buy);
                    Self::pair_crossing(&mut state, Side::Sell);
                    if state.book.contains(&id) && !state.pending_orders.contains(&id) {
                        state.book.remove(&id);
                    }
                }
            }

            self.nonces.increment(account);
        }

        debug!(
            market_id = self.market.id,
            order_id = %id,
            order_type = %order_type,
            "order admitted"
        );
        self.check_for_possible_settles().await;
        Ok(id)
    }

    async fn validate(&self, order: &Order, signature: &Bytes) -> Result<(), OrderError> {
        if order.trade.market_id != self.market.id {
            return Err(OrderError::WrongMarket);
        }
        let now = chrono::Utc::now().timestamp() as u64;
        if order.is_expired(now) {
            return Err(OrderError::Expired);
        }
        if !self.nonces.matches(order.trader.account_id, order.trader.nonce) {
            return Err(OrderError::InvalidNonce);
        }
        match self.verifier.check_order_signature(order, signature).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(OrderError::InvalidSignature),
            Err(e) => {
                warn!(market_id = self.market.id, error = %e, "signature check failed");
                Err(OrderError::InvalidSignature)
            }
        }
    }

    // ========================================================================
    // Cancel / Update
    // ========================================================================

    /// Remove an order on presentation of a cancellation attestation: the
    /// same order re-signed with the trade size zeroed.
    pub async fn delete_order(&self, id: Uuid, signature: &Bytes) -> Result<(), OrderError> {
        let order = {
            let state = self.state.lock();
            state
                .book
                .get(&id)
                .map(|o| o.order.clone())
                .ok_or(OrderError::OrderNotFound)?
        };

        match self.verifier.check_delete_signature(&order, signature).await {
            Ok(true) => {}
            Ok(false) => return Err(OrderError::InvalidSignature),
            Err(e) => {
                warn!(market_id = self.market.id, error = %e, "delete signature check failed");
                return Err(OrderError::InvalidSignature);
            }
        }

        let mut state = self.state.lock();
        // The order may have been removed while the attestation was checked
        if state.book.remove(&id).is_none() {
            return Err(OrderError::OrderNotFound);
        }
        state.touch();
        info!(market_id = self.market.id, order_id = %id, "order deleted");
        Ok(())
    }

    /// Replace an order with a fully validated successor. The remove and
    /// insert happen in one lock scope, so no observer sees the book without
    /// either version.
    pub async fn update_order(
        &self,
        id: Uuid,
        replacement: OrderSubmission,
    ) -> Result<Uuid, OrderError> {
        let OrderSubmission { order, signature } = replacement;
        self.validate(&order, &signature).await?;

        let now = chrono::Utc::now().timestamp() as u64;
        let resting = LimitOrder {
            order,
            signature,
            id: Uuid::new_v4(),
            timestamp: now,
            status: OrderStatus::Active,
            stopped: false,
            tx_hash: None,
        };
        let new_id = resting.id;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(OrderError::MarketClosed);
            }
            let account = resting.order.trader.account_id;
            if !self.nonces.matches(account, resting.order.trader.nonce) {
                return Err(OrderError::InvalidNonce);
            }
            let existing = state.book.get(&id).ok_or(OrderError::OrderNotFound)?;
            // Only the original signer may replace their order
            if existing.order.trader.signer != resting.order.trader.signer {
                return Err(OrderError::InvalidSignature);
            }
            if state.pending_orders.contains(&id) {
                // Claimed by an in-flight settlement; too late to replace
                return Err(OrderError::OrderNotFound);
            }

            state.book.remove(&id);
            match resting.order.trade.order_type {
                OrderType::Stop | OrderType::StopLimit => state.book.insert_stop(resting),
                _ => state.book.insert_live(resting),
            }
            state.touch();
            self.nonces.increment(account);
        }

        info!(
            market_id = self.market.id,
            old_order_id = %id,
            new_order_id = %new_id,
            "order replaced"
        );
        self.check_for_possible_settles().await;
        Ok(new_id)
    }

    /// Drop every order belonging to the account, live or dormant. Called
    /// when the account is liquidated out from under its intents.
    pub fn remove_account_orders(&self, account_id: u128) -> usize {
        let mut state = self.state.lock();
        let removed = state.book.remove_account_orders(account_id);
        if !removed.is_empty() {
            state.touch();
            info!(
                market_id = self.market.id,
                account_id,
                count = removed.len(),
                "account orders removed"
            );
        }
        removed.len()
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Re-validate every live order and remove those that expired or whose
    /// signature no longer verifies. Nonces are deliberately not re-checked;
    /// admission consumes the nonce, so every resting order is stale by that
    /// measure.
    pub async fn prune(&self) {
        let candidates = {
            let state = self.state.lock();
            state.book.all_live_orders()
        };
        if candidates.is_empty() {
            return;
        }

        let now = chrono::Utc::now().timestamp() as u64;
        let mut stale = Vec::new();
        for candidate in candidates {
            if candidate.order.is_expired(now) {
                stale.push(candidate.id);
                continue;
            }
            let valid = self
                .verifier
                .check_order_signature(&candidate.order, &candidate.signature)
                .await
                .unwrap_or(false);
            if !valid {
                stale.push(candidate.id);
            }
        }

        if stale.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for id in stale {
            if state.book.remove(&id).is_some() {
                state.touch();
                debug!(market_id = self.market.id, order_id = %id, "stale order pruned");
            }
        }
    }

    // ========================================================================
    // Matching
    // ========================================================================

    /// Scan for crossing orders and stage settlement groups: buy-major scan,
    /// prune, then the symmetric sell-major scan. A no-op while the book is
    /// unchanged since the last scan, so repeated calls are free.
    pub async fn check_for_possible_settles(&self) -> usize {
        let mut created = {
            let mut state = self.state.lock();
            if state.closed || state.book_clean {
                return 0;
            }
            Self::pair_crossing(&mut state, Side::Buy)
        };

        self.prune().await;

        let mut state = self.state.lock();
        created += Self::pair_crossing(&mut state, Side::Sell);
        state.book_clean = true;
        created
    }

    /// Pair crossing orders with the given major side and stage one pending
    /// settlement per pair. Returns the number of groups staged.
    fn pair_crossing(state: &mut EngineState, major: Side) -> usize {
        let pairs = Self::crossing_pairs(&state.book, &state.pending_orders, major);
        let mut created = 0;
        for (buy_id, sell_id) in pairs {
            let sid = settlement_id(&[buy_id, sell_id]);
            if state.pending.contains_key(&sid) {
                continue;
            }
            state.pending.insert(
                sid,
                PendingSettlement {
                    order_ids: vec![buy_id, sell_id],
                    retry_count: 0,
                    tx_hash: None,
                    in_flight: false,
                },
            );
            state.pending_orders.insert(buy_id);
            state.pending_orders.insert(sell_id);
            created += 1;
            info!(
                settlement_id = ?sid,
                buy_order_id = %buy_id,
                sell_order_id = %sell_id,
                "settlement staged"
            );
        }
        created
    }

    /// Collect (buy, sell) pairs among eligible crossing orders. A buy and a
    /// sell cross when the sell's level is at or below the buy's. Each level
    /// pairing sorts both sides by declared creation time and pairs
    /// positionally up to the shorter side.
    fn crossing_pairs(
        book: &OrderBook,
        pending: &HashSet<Uuid>,
        major: Side,
    ) -> Vec<(Uuid, Uuid)> {
        let mut claimed: HashSet<Uuid> = HashSet::new();
        let mut pairs = Vec::new();

        let eligible = |order: &LimitOrder, claimed: &HashSet<Uuid>| {
            order.status == OrderStatus::Active
                && !pending.contains(&order.id)
                && !claimed.contains(&order.id)
        };

        match major {
            Side::Buy => {
                for (buy_price, buy_level) in book.buy_levels() {
                    let mut buys: Vec<&LimitOrder> = buy_level
                        .values()
                        .filter(|o| eligible(o, &claimed))
                        .collect();
                    if buys.is_empty() {
                        continue;
                    }
                    let mut sells: Vec<&LimitOrder> = book
                        .sell_levels()
                        .take_while(|(price, _)| *price <= buy_price)
                        .flat_map(|(_, level)| level.values())
                        .filter(|o| eligible(o, &claimed))
                        .collect();
                    if sells.is_empty() {
                        continue;
                    }
                    Self::sort_by_priority(&mut buys);
                    Self::sort_by_priority(&mut sells);
                    for (buy, sell) in buys.iter().zip(sells.iter()) {
                        claimed.insert(buy.id);
                        claimed.insert(sell.id);
                        pairs.push((buy.id, sell.id));
                    }
                }
            }
            Side::Sell => {
                for (sell_price, sell_level) in book.sell_levels() {
                    let mut sells: Vec<&LimitOrder> = sell_level
                        .values()
                        .filter(|o| eligible(o, &claimed))
                        .collect();
                    if sells.is_empty() {
                        continue;
                    }
                    let mut buys: Vec<&LimitOrder> = book
                        .buy_levels()
                        .skip_while(|(price, _)| *price < sell_price)
                        .flat_map(|(_, level)| level.values())
                        .filter(|o| eligible(o, &claimed))
                        .collect();
                    if buys.is_empty() {
                        continue;
                    }
                    Self::sort_by_priority(&mut buys);
                    Self::sort_by_priority(&mut sells);
                    for (buy, sell) in buys.iter().zip(sells.iter()) {
                        claimed.insert(buy.id);
                        claimed.insert(sell.id);
                        pairs.push((buy.id, sell.id));
                    }
                }
            }
        }

        pairs
    }

    /// Declared creation time first; admission time and id break ties
    /// deterministically.
    fn sort_by_priority(orders: &mut [&LimitOrder]) {
        orders.sort_by(|a, b| {
            a.order
                .metadata
                .genesis
                .cmp(&b.order.metadata.genesis)
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.id.cmp(&b.id))
        });
    }

    // ========================================================================
    // Stop Promotion
    // ========================================================================

    /// React to a reference price tick: promote crossed dormant stops and
    /// rescan. A promoted stop becomes an immediate-or-cancel market order;
    /// a promoted stop-limit rests at its price. Promotion does not re-run
    /// admission validation; the intent already passed it once.
    pub fn on_price_tick(&self, tick: U256) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let triggered = state.book.drain_triggered_stops(tick);
        if triggered.is_empty() {
            return;
        }

        for mut order in triggered {
            order.stopped = true;
            let id = order.id;
            let order_type = order.order.trade.order_type;
            info!(
                market_id = self.market.id,
                order_id = %id,
                order_type = %order_type,
                tick = %tick,
                "stop promoted"
            );

            state.book.insert_live(order);
            state.touch();
            if order_type == OrderType::Stop {
                Self::pair_crossing(&mut state, Side::Buy);
                Self::pair_crossing(&mut state, Side::Sell);
                if state.book.contains(&id) && !state.pending_orders.contains(&id) {
                    state.book.remove(&id);
                }
            }
        }

        Self::pair_crossing(&mut state, Side::Buy);
        Self::pair_crossing(&mut state, Side::Sell);
    }

    // ========================================================================
    // Settlement Interface
    // ========================================================================

    /// Hand out every staged settlement not already being worked, marking
    /// each as in flight. Groups whose participants have vanished from the
    /// book are abandoned here.
    pub fn claim_settlements(&self) -> Vec<(H256, Vec<LimitOrder>)> {
        let mut state = self.state.lock();
        let claimable: Vec<H256> = state
            .pending
            .iter()
            .filter(|(_, p)| !p.in_flight)
            .map(|(sid, _)| *sid)
            .collect();

        let mut jobs = Vec::new();
        for sid in claimable {
            let order_ids = match state.pending.get(&sid) {
                Some(p) => p.order_ids.clone(),
                None => continue,
            };
            let orders: Option<Vec<LimitOrder>> = order_ids
                .iter()
                .map(|id| state.book.get(id).cloned())
                .collect();
            match orders {
                Some(orders) => {
                    if let Some(p) = state.pending.get_mut(&sid) {
                        p.in_flight = true;
                    }
                    jobs.push((sid, orders));
                }
                None => {
                    warn!(settlement_id = ?sid, "participant vanished, settlement abandoned");
                    state.pending.remove(&sid);
                    for id in &order_ids {
                        state.pending_orders.remove(id);
                    }
                }
            }
        }
        jobs
    }

    /// Record the submitted settlement transaction against its group.
    pub fn record_settlement_tx(&self, sid: H256, tx_hash: H256) {
        let mut state = self.state.lock();
        if let Some(p) = state.pending.get_mut(&sid) {
            p.tx_hash = Some(tx_hash);
        }
    }

    /// Count a settlement retry against its group.
    pub fn note_settlement_retry(&self, sid: H256) {
        let mut state = self.state.lock();
        if let Some(p) = state.pending.get_mut(&sid) {
            p.retry_count += 1;
        }
    }

    /// Resolve a settlement group. Success marks every participant executed
    /// with the transaction hash; failure marks them failed. Either way the
    /// group is dissolved and its participants released from the guard, and
    /// the orders stay in the book until a prune removes them.
    pub fn complete_settlement(&self, sid: H256, outcome: SettlementOutcome) {
        let mut state = self.state.lock();
        let Some(settled) = state.pending.remove(&sid) else {
            return;
        };
        for id in &settled.order_ids {
            state.pending_orders.remove(id);
            if let Some(order) = state.book.get_mut(id) {
                match outcome {
                    SettlementOutcome::Executed(tx_hash) => {
                        order.status = OrderStatus::Executed;
                        order.tx_hash = Some(tx_hash);
                    }
                    SettlementOutcome::Failed => {
                        order.status = OrderStatus::Failed;
                    }
                }
            }
        }
        state.in_sync = false;
        match outcome {
            SettlementOutcome::Executed(tx_hash) => {
                info!(settlement_id = ?sid, tx_hash = ?tx_hash, "settlement executed")
            }
            SettlementOutcome::Failed => {
                warn!(settlement_id = ?sid, "settlement failed terminally")
            }
        }
    }

    // ========================================================================
    // Persistence / Lifecycle
    // ========================================================================

    /// Restore the book from the last persisted snapshot, if any.
    pub async fn hydrate(&self) {
        if let Some(snapshot) = self.persistence.load_book(self.market.id).await {
            let mut state = self.state.lock();
            let count = snapshot.orders.len() + snapshot.stops.len();
            state.book.restore(snapshot);
            state.book_clean = false;
            state.in_sync = true;
            info!(market_id = self.market.id, count, "book hydrated");
        }
    }

    /// Flush a snapshot to the persistence worker if the book changed since
    /// the last flush.
    pub fn persist_if_dirty(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.in_sync {
                return;
            }
            state.in_sync = true;
            state.book.snapshot(self.market.id)
        };
        self.persistence.save_book(self.market.id, snapshot);
    }

    /// Stop admitting orders and flush a final snapshot. Used when the
    /// market disappears from the on-chain listing.
    pub fn close(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.book.snapshot(self.market.id)
        };
        self.persistence.save_book(self.market.id, snapshot);
        info!(market_id = self.market.id, "engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ========================================================================
    // Read Surface
    // ========================================================================

    pub fn order(&self, id: &Uuid) -> Option<LimitOrder> {
        self.state.lock().book.get(id).cloned()
    }

    /// Live orders on one side, optionally filtered to a price level.
    pub fn orders(&self, side: Side, price: Option<U256>) -> Vec<LimitOrder> {
        self.state.lock().book.live_orders(side, price)
    }

    /// Same as [`orders`](Self::orders) with signatures cleared, for read
    /// surfaces that must not leak reusable signatures.
    pub fn orders_without_sigs(&self, side: Side, price: Option<U256>) -> Vec<LimitOrder> {
        self.orders(side, price)
            .into_iter()
            .map(|o| o.redacted())
            .collect()
    }

    pub fn pending_settlement_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_order_pending(&self, id: &Uuid) -> bool {
        self.state.lock().pending_orders.contains(id)
    }
}
