//! Price-indexed order book for one market.
//!
//! Live orders sit in per-side price-level maps; dormant stops sit in
//! parallel maps keyed by trigger price. A reverse index maps every admitted
//! order id to the single slot that holds it.

use std::collections::{BTreeMap, HashMap};

use ethers::types::U256;
use uuid::Uuid;

use crate::models::{LimitOrder, Side};
use crate::services::matching::BookSnapshot;

type PriceMap = BTreeMap<U256, HashMap<Uuid, LimitOrder>>;

/// Where an order id currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub side: Side,
    pub stop: bool,
    pub price: U256,
}

#[derive(Debug, Default)]
pub struct OrderBook {
    buys: PriceMap,
    sells: PriceMap,
    buy_stops: PriceMap,
    sell_stops: PriceMap,
    index: HashMap<Uuid, Slot>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, side: Side, stop: bool) -> &PriceMap {
        match (side, stop) {
            (Side::Buy, false) => &self.buys,
            (Side::Sell, false) => &self.sells,
            (Side::Buy, true) => &self.buy_stops,
            (Side::Sell, true) => &self.sell_stops,
        }
    }

    fn map_mut(&mut self, side: Side, stop: bool) -> &mut PriceMap {
        match (side, stop) {
            (Side::Buy, false) => &mut self.buys,
            (Side::Sell, false) => &mut self.sells,
            (Side::Buy, true) => &mut self.buy_stops,
            (Side::Sell, true) => &mut self.sell_stops,
        }
    }

    /// Insert a live order at its limit price.
    pub fn insert_live(&mut self, order: LimitOrder) {
        self.insert(order, false)
    }

    /// Insert a dormant stop at its trigger price.
    pub fn insert_stop(&mut self, order: LimitOrder) {
        self.insert(order, true)
    }

    fn insert(&mut self, order: LimitOrder, stop: bool) {
        let slot = Slot {
            side: order.side(),
            stop,
            price: order.price(),
        };
        let id = order.id;
        self.map_mut(slot.side, stop)
            .entry(slot.price)
            .or_default()
            .insert(id, order);
        self.index.insert(id, slot);
    }

    /// Remove an order from whichever map holds it.
    pub fn remove(&mut self, id: &Uuid) -> Option<LimitOrder> {
        let slot = self.index.remove(id)?;
        let map = self.map_mut(slot.side, slot.stop);
        let level = map.get_mut(&slot.price)?;
        let order = level.remove(id);
        if level.is_empty() {
            map.remove(&slot.price);
        }
        order
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.index.contains_key(id)
    }

    pub fn slot(&self, id: &Uuid) -> Option<Slot> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &Uuid) -> Option<&LimitOrder> {
        let slot = self.index.get(id)?;
        self.map(slot.side, slot.stop).get(&slot.price)?.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut LimitOrder> {
        let slot = *self.index.get(id)?;
        self.map_mut(slot.side, slot.stop)
            .get_mut(&slot.price)?
            .get_mut(id)
    }

    /// Live buy levels, ascending by price.
    pub fn buy_levels(&self) -> impl Iterator<Item = (&U256, &HashMap<Uuid, LimitOrder>)> {
        self.buys.iter()
    }

    /// Live sell levels, ascending by price.
    pub fn sell_levels(&self) -> impl Iterator<Item = (&U256, &HashMap<Uuid, LimitOrder>)> {
        self.sells.iter()
    }

    /// All live orders on one side, optionally at a single price level.
    pub fn live_orders(&self, side: Side, price: Option<U256>) -> Vec<LimitOrder> {
        let map = self.map(side, false);
        match price {
            Some(price) => map
                .get(&price)
                .map(|level| level.values().cloned().collect())
                .unwrap_or_default(),
            None => map
                .values()
                .flat_map(|level| level.values().cloned())
                .collect(),
        }
    }

    /// All live orders on both sides.
    pub fn all_live_orders(&self) -> Vec<LimitOrder> {
        let mut orders = self.live_orders(Side::Buy, None);
        orders.extend(self.live_orders(Side::Sell, None));
        orders
    }

    /// All dormant stops on both sides.
    pub fn all_stops(&self) -> Vec<LimitOrder> {
        self.buy_stops
            .values()
            .chain(self.sell_stops.values())
            .flat_map(|level| level.values().cloned())
            .collect()
    }

    /// Drain dormant stops whose trigger has been crossed by the tick:
    /// buy stops with trigger below the tick, sell stops with trigger above.
    pub fn drain_triggered_stops(&mut self, tick: U256) -> Vec<LimitOrder> {
        let mut triggered = Vec::new();

        let buy_prices: Vec<U256> = self
            .buy_stops
            .range(..tick)
            .map(|(price, _)| *price)
            .collect();
        for price in buy_prices {
            if let Some(level) = self.buy_stops.remove(&price) {
                for (id, order) in level {
                    self.index.remove(&id);
                    triggered.push(order);
                }
            }
        }

        let sell_prices: Vec<U256> = self
            .sell_stops
            .range(tick + U256::one()..)
            .map(|(price, _)| *price)
            .collect();
        for price in sell_prices {
            if let Some(level) = self.sell_stops.remove(&price) {
                for (id, order) in level {
                    self.index.remove(&id);
                    triggered.push(order);
                }
            }
        }

        triggered
    }

    /// Remove every order, live or dormant, belonging to the account.
    /// Used when an account is liquidated out from under its intents.
    pub fn remove_account_orders(&mut self, account_id: u128) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .index
            .keys()
            .copied()
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|id| {
                self.get(id)
                    .map(|o| o.order.trader.account_id == account_id)
                    .unwrap_or(false)
            })
            .collect();

        for id in &ids {
            self.remove(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn snapshot(&self, market_id: u128) -> BookSnapshot {
        BookSnapshot {
            market_id,
            orders: self.all_live_orders(),
            stops: self.all_stops(),
        }
    }

    pub fn restore(&mut self, snapshot: BookSnapshot) {
        for order in snapshot.orders {
            self.insert_live(order);
        }
        for stop in snapshot.stops {
            self.insert_stop(stop);
        }
    }

    /// Index consistency check: every indexed id resolves to exactly the
    /// slot the index claims, and no map holds an unindexed order.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut seen = 0usize;
        for (side, stop) in [
            (Side::Buy, false),
            (Side::Sell, false),
            (Side::Buy, true),
            (Side::Sell, true),
        ] {
            for (price, level) in self.map(side, stop) {
                assert!(!level.is_empty(), "empty price level left behind");
                for (id, order) in level {
                    seen += 1;
                    let slot = self.index.get(id).expect("order missing from index");
                    assert_eq!(slot.side, side);
                    assert_eq!(slot.stop, stop);
                    assert_eq!(slot.price, *price);
                    assert_eq!(order.id, *id);
                }
            }
        }
        assert_eq!(seen, self.index.len(), "index size mismatch");
    }
}
