//! On-chain market listing.
//!
//! Markets, their symbols, and their price feed ids come from the perps
//! market proxy. The assembled catalog is cached; listings change rarely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::types::{Address, H256, U256};
use parking_lot::Mutex;
use tracing::info;

use crate::blockchain::clearinghouse::ChainClient;
use crate::blockchain::types::ChainError;
use crate::models::Market;

abigen!(
    IPerpsMarketProxy,
    r#"[
        struct SettlementStrategy { uint8 strategyType; uint256 settlementDelay; uint256 settlementWindowDuration; address priceVerificationContract; bytes32 feedId; uint256 settlementReward; bool disabled; }
        function getMarkets() external view returns (uint256[] memory marketIds)
        function metadata(uint128 marketId) external view returns (string memory name, string memory symbol)
        function getSettlementStrategy(uint128 marketId, uint256 strategyId) external view returns (SettlementStrategy memory settlementStrategy)
    ]"#
);

/// Read surface of the market proxy.
#[async_trait]
pub trait MarketRegistry: Send + Sync {
    async fn market_ids(&self) -> Result<Vec<u128>, ChainError>;
    async fn symbol(&self, market_id: u128) -> Result<String, ChainError>;
    async fn price_feed_id(&self, market_id: u128) -> Result<H256, ChainError>;
}

pub struct EthersMarketRegistry {
    contract: IPerpsMarketProxy<ChainClient>,
}

impl EthersMarketRegistry {
    pub fn new(address: Address, client: Arc<ChainClient>) -> Self {
        Self {
            contract: IPerpsMarketProxy::new(address, client),
        }
    }
}

#[async_trait]
impl MarketRegistry for EthersMarketRegistry {
    async fn market_ids(&self) -> Result<Vec<u128>, ChainError> {
        let ids: Vec<U256> = self
            .contract
            .get_markets()
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(ids.into_iter().map(|id| id.as_u128()).collect())
    }

    async fn symbol(&self, market_id: u128) -> Result<String, ChainError> {
        let (_name, symbol) = self
            .contract
            .metadata(market_id)
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(symbol)
    }

    async fn price_feed_id(&self, market_id: u128) -> Result<H256, ChainError> {
        // Strategy 0 is the default settlement strategy
        let strategy = self
            .contract
            .get_settlement_strategy(market_id, U256::zero())
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        // The strategy flattens to a tuple; feedId is its fifth field
        Ok(H256::from(strategy.4))
    }
}

/// Caching view over a [`MarketRegistry`].
pub struct MarketCatalog {
    registry: Arc<dyn MarketRegistry>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<Market>)>>,
}

impl MarketCatalog {
    pub fn new(registry: Arc<dyn MarketRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Assembled market list, served from cache while fresh.
    pub async fn load_markets(&self) -> Result<Vec<Market>, ChainError> {
        if let Some((fetched_at, markets)) = self.cache.lock().as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(markets.clone());
            }
        }

        let ids = self.registry.market_ids().await?;
        let mut markets = Vec::with_capacity(ids.len());
        for id in ids {
            let symbol = self.registry.symbol(id).await?;
            let feed_id = self.registry.price_feed_id(id).await?;
            markets.push(Market {
                id,
                symbol,
                feed_id,
            });
        }

        info!(count = markets.len(), "market catalog refreshed");
        *self.cache.lock() = Some((Instant::now(), markets.clone()));
        Ok(markets)
    }
}
