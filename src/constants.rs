//! Shared timing and retry constants.

use std::time::Duration;

/// How often the registry rechecks the market list for engines to add or close
pub const RECHECK_ENGINES: Duration = Duration::from_secs(30);

/// How often pending settlements are pumped to the coordinator
pub const RECHECK_SETTLES: Duration = Duration::from_secs(1);

/// How often dirty books are flushed to the persistence worker
pub const PERSIST_ALL_BOOKS: Duration = Duration::from_secs(1);

/// How often dirty nonces are flushed to the persistence worker
pub const PERSIST_NONCES: Duration = Duration::from_secs(30);

/// On-chain market metadata cache lifetime
pub const MARKET_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A failed settlement is retried at most this many times
pub const SETTLEMENT_MAX_RETRIES: u32 = 1;

/// Fixed delay before the settlement retry
pub const SETTLEMENT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Fixed delay before resubscribing to a dropped price stream
pub const FEED_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Receipt polling cadence and cap for submitted settlement transactions
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const RECEIPT_POLL_ATTEMPTS: u32 = 30;

/// Reference prices are normalized to this fixed-point scale
pub const PRICE_DECIMALS: u32 = 18;
