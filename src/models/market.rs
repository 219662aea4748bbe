use ethers::types::H256;
use serde::{Deserialize, Serialize};

/// A perpetual futures market as listed by the on-chain market proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: u128,
    pub symbol: String,
    /// Price feed identifier from the market's settlement strategy
    pub feed_id: H256,
}
