mod auth;
mod blockchain;
mod config;
mod constants;
mod models;
mod persistence;
mod services;
#[cfg(test)]
mod testkit;

use std::str::FromStr;
use std::sync::Arc;

use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::auth::Eip712Verifier;
use crate::blockchain::{EthersClearinghouse, EthersMarketRegistry, MarketCatalog};
use crate::config::AppConfig;
use crate::services::nonce::NonceRegistry;
use crate::services::price_feed::HermesPriceFeed;
use crate::services::registry::EngineRegistry;
use crate::services::settlement::SettlementCoordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perp_orderbook=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;
    info!(environment = %config.environment, "starting orderbook");

    let provider = Provider::<Http>::try_from(config.rpc_url.as_str())?;
    let wallet: LocalWallet = config
        .settlement_signer_private_key
        .parse::<LocalWallet>()?
        .with_chain_id(config.chain_id);
    let client = Arc::new(SignerMiddleware::new(provider, wallet));

    let clearinghouse_address = Address::from_str(&config.clearinghouse_address)?;
    let market_proxy_address = Address::from_str(&config.market_proxy_address)?;

    let verifier = Arc::new(Eip712Verifier::new(config.chain_id, clearinghouse_address));
    let clearinghouse = Arc::new(EthersClearinghouse::new(
        clearinghouse_address,
        client.clone(),
        constants::RECEIPT_POLL_INTERVAL,
        constants::RECEIPT_POLL_ATTEMPTS,
    ));
    let catalog = Arc::new(MarketCatalog::new(
        Arc::new(EthersMarketRegistry::new(market_proxy_address, client)),
        constants::MARKET_CACHE_TTL,
    ));
    let feed = Arc::new(HermesPriceFeed::new(
        config.hermes_endpoint.clone(),
        config.hermes_poll_interval(),
    ));
    let nonces = Arc::new(NonceRegistry::new());
    let persistence = persistence::spawn_memory_store();

    let (settle_tx, settle_rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(SettlementCoordinator::new(
        clearinghouse,
        config.settlement_config(),
    ));
    coordinator.start_worker(settle_rx);

    let registry = Arc::new(EngineRegistry::new(
        catalog,
        verifier,
        nonces,
        persistence,
        feed,
        settle_tx,
    ));
    registry.clone().run().await;
    info!("orderbook running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    registry.shutdown();
    Ok(())
}
