use std::time::Duration;

use serde::Deserialize;

use crate::constants;
use crate::services::settlement::SettlementConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    // Blockchain settings
    pub rpc_url: String,
    pub chain_id: u64,
    pub clearinghouse_address: String,
    pub market_proxy_address: String,

    // Settlement transactions are signed by this key
    pub settlement_signer_private_key: String,

    // Price feed settings
    #[serde(default = "default_hermes_endpoint")]
    pub hermes_endpoint: String,

    #[serde(default = "default_hermes_poll_interval")]
    pub hermes_poll_interval_secs: u64,

    // Settlement retry tuning
    #[serde(default = "default_settlement_max_retries")]
    pub settlement_max_retries: u32,

    #[serde(default = "default_settlement_retry_delay")]
    pub settlement_retry_delay_secs: u64,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_hermes_endpoint() -> String {
    "https://hermes.pyth.network".to_string()
}

fn default_hermes_poll_interval() -> u64 {
    1
}

fn default_settlement_max_retries() -> u32 {
    constants::SETTLEMENT_MAX_RETRIES
}

fn default_settlement_retry_delay() -> u64 {
    constants::SETTLEMENT_RETRY_DELAY.as_secs()
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    pub fn hermes_poll_interval(&self) -> Duration {
        Duration::from_secs(self.hermes_poll_interval_secs)
    }

    pub fn settlement_config(&self) -> SettlementConfig {
        SettlementConfig {
            max_retries: self.settlement_max_retries,
            retry_delay: Duration::from_secs(self.settlement_retry_delay_secs),
        }
    }
}
