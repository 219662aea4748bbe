//! Signed order intents and book-resident order records.

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Order Side / Type / Status
// ============================================================================

/// Order side, derived from the sign of the trade size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order type, carried on the wire as a uint8 discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OrderType {
    /// Fills immediately against resting liquidity or is discarded (IOC).
    Market,
    /// Rests in the book at its limit price.
    Limit,
    /// Dormant until the reference price crosses the trigger, then market.
    Stop,
    /// Dormant until the reference price crosses the trigger, then limit.
    StopLimit,
}

impl From<OrderType> for u8 {
    fn from(t: OrderType) -> u8 {
        match t {
            OrderType::Market => 1,
            OrderType::Limit => 2,
            OrderType::Stop => 3,
            OrderType::StopLimit => 4,
        }
    }
}

impl TryFrom<u8> for OrderType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OrderType::Market),
            2 => Ok(OrderType::Limit),
            3 => Ok(OrderType::Stop),
            4 => Ok(OrderType::StopLimit),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
            OrderType::Stop => write!(f, "stop"),
            OrderType::StopLimit => write!(f, "stop_limit"),
        }
    }
}

/// Lifecycle status of an order resting in a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Eligible for matching
    Active,
    /// Settled on-chain; retained until pruned
    Executed,
    /// Settlement terminally failed; retained until pruned
    Failed,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Active => write!(f, "active"),
            OrderStatus::Executed => write!(f, "executed"),
            OrderStatus::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Signed Order Intent
// ============================================================================

/// Order provenance and lifetime bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMetadata {
    /// Declared creation time (unix seconds); matching priority key
    pub genesis: U256,
    /// Expiration time (unix seconds); the order is invalid at or after this
    pub expiration: U256,
    pub tracking_code: H256,
    pub referrer: Address,
}

/// The signing account and its replay protection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTrader {
    pub nonce: U256,
    pub account_id: u128,
    pub signer: Address,
}

/// The economic terms of the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTrade {
    /// Wire name is `t` in the signed struct
    #[serde(rename = "t")]
    pub order_type: OrderType,
    pub market_id: u128,
    /// Signed size; positive buys, negative sells
    pub size: i128,
    /// Limit price for limit orders, trigger price for dormant stops
    pub price: U256,
}

/// An on-chain condition the clearinghouse evaluates at settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCondition {
    pub target: Address,
    pub selector: [u8; 4],
    pub data: Bytes,
    pub expected: H256,
}

/// A complete EIP-712 signed order intent as submitted by a trader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub metadata: OrderMetadata,
    pub trader: OrderTrader,
    pub trade: OrderTrade,
    pub conditions: Vec<OrderCondition>,
}

impl Order {
    /// Side implied by the sign of the trade size.
    pub fn side(&self) -> Side {
        if self.trade.size > 0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    /// Whether the order is expired at the given unix time.
    pub fn is_expired(&self, now: u64) -> bool {
        self.metadata.expiration <= U256::from(now)
    }

    /// Copy of this order with the trade size zeroed, the form a trader
    /// re-signs to attest a cancellation.
    pub fn zeroed(&self) -> Order {
        let mut order = self.clone();
        order.trade.size = 0;
        order
    }
}

/// An order plus its signature, as received from a trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSubmission {
    pub order: Order,
    pub signature: Bytes,
}

// ============================================================================
// Book-resident Order
// ============================================================================

/// An admitted order resting in a book, live or dormant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitOrder {
    pub order: Order,
    pub signature: Bytes,
    /// Engine-assigned identity, random and unique per admission
    pub id: Uuid,
    /// Admission time (unix seconds)
    pub timestamp: u64,
    pub status: OrderStatus,
    /// Set once a stop has been promoted to its executable form
    pub stopped: bool,
    /// Settlement transaction, once one succeeds
    pub tx_hash: Option<H256>,
}

impl LimitOrder {
    pub fn side(&self) -> Side {
        self.order.side()
    }

    pub fn price(&self) -> U256 {
        self.order.trade.price
    }

    /// Copy with the signature cleared, for read surfaces that must not
    /// leak reusable signatures.
    pub fn redacted(&self) -> LimitOrder {
        let mut order = self.clone();
        order.signature = Bytes::default();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_type_discriminants_round_trip() {
        for t in [
            OrderType::Market,
            OrderType::Limit,
            OrderType::Stop,
            OrderType::StopLimit,
        ] {
            let raw: u8 = t.into();
            assert_eq!(OrderType::try_from(raw).unwrap(), t);
        }
        assert!(OrderType::try_from(0).is_err());
        assert!(OrderType::try_from(5).is_err());
    }

    #[test]
    fn side_follows_size_sign() {
        let mut order = crate::testkit::order(OrderType::Limit, 10, U256::from(100));
        assert_eq!(order.side(), Side::Buy);
        order.trade.size = -10;
        assert_eq!(order.side(), Side::Sell);
    }

    #[test]
    fn zeroed_clears_only_size() {
        let order = crate::testkit::order(OrderType::Limit, 25, U256::from(100));
        let zeroed = order.zeroed();
        assert_eq!(zeroed.trade.size, 0);
        assert_eq!(zeroed.trade.price, order.trade.price);
        assert_eq!(zeroed.trader, order.trader);
    }
}
