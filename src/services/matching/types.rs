//! Matching engine types and errors.

use ethers::types::H256;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::LimitOrder;

// ============================================================================
// Errors
// ============================================================================

/// Order admission and mutation errors
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order has expired")]
    Expired,

    #[error("Invalid nonce")]
    InvalidNonce,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Order not found")]
    OrderNotFound,

    #[error("Order is for a different market")]
    WrongMarket,

    #[error("Market not found: {0}")]
    MarketNotFound(u128),

    #[error("Market is closed")]
    MarketClosed,
}

// ============================================================================
// Settlement Identity
// ============================================================================

/// Deterministic identity of a settlement group: the keccak of the sorted
/// participant order ids. The same set of orders always names the same
/// settlement.
pub fn settlement_id(order_ids: &[Uuid]) -> H256 {
    let mut sorted: Vec<&Uuid> = order_ids.iter().collect();
    sorted.sort();

    let mut data = Vec::with_capacity(sorted.len() * 16);
    for id in sorted {
        data.extend_from_slice(id.as_bytes());
    }
    H256::from(keccak256(&data))
}

// ============================================================================
// Book Snapshot
// ============================================================================

/// Serializable image of one market's book, live and dormant orders both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub market_id: u128,
    pub orders: Vec<LimitOrder>,
    pub stops: Vec<LimitOrder>,
}
