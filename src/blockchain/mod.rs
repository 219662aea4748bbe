pub mod clearinghouse;
pub mod market_registry;
pub mod types;

pub use clearinghouse::{Clearinghouse, EthersClearinghouse};
pub use market_registry::{EthersMarketRegistry, MarketCatalog};
pub use types::{ChainError, TxStatus};
