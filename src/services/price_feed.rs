//! Reference price streams.
//!
//! Each market's settlement strategy names a price feed id; ticks from that
//! feed drive stop promotion. The production feed polls the Pyth Hermes
//! HTTP API and fans ticks out over a channel.

use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{H256, U256};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::constants::PRICE_DECIMALS;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed returned no price for {0:?}")]
    Empty(H256),
}

/// One observation from a reference price feed.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PriceTick {
    /// Fixed-point mantissa
    #[serde(with = "string_i64")]
    pub price: i64,
    /// Decimal exponent; the value is `price * 10^expo`
    pub expo: i32,
    pub publish_time: u64,
}

impl PriceTick {
    /// Normalize to the book's 18-decimal fixed-point scale. Non-positive
    /// observations and values that do not fit the scale normalize to zero;
    /// callers treat a zero tick as a dropped observation.
    pub fn to_wei(&self) -> U256 {
        if self.price <= 0 {
            return U256::zero();
        }
        let price = U256::from(self.price as u64);
        let shift = PRICE_DECIMALS as i64 + self.expo as i64;
        let scale = match U256::from(10u64).checked_pow(U256::from(shift.unsigned_abs())) {
            Some(scale) => scale,
            None => {
                warn!(price = self.price, expo = self.expo, "price exponent out of range, tick dropped");
                return U256::zero();
            }
        };
        if shift >= 0 {
            match price.checked_mul(scale) {
                Some(wei) => wei,
                None => {
                    warn!(price = self.price, expo = self.expo, "price exponent out of range, tick dropped");
                    U256::zero()
                }
            }
        } else {
            price / scale
        }
    }
}

/// A subscribable source of reference prices.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Open a tick stream for the feed id. The stream ends when the feed
    /// drops it; callers resubscribe after a fixed delay.
    async fn subscribe(&self, feed_id: H256) -> Result<mpsc::Receiver<PriceTick>, FeedError>;
}

/// Pyth Hermes polling client.
pub struct HermesPriceFeed {
    http: reqwest::Client,
    endpoint: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct LatestPriceResponse {
    parsed: Vec<ParsedFeed>,
}

#[derive(Debug, Deserialize)]
struct ParsedFeed {
    price: PriceTick,
}

impl HermesPriceFeed {
    pub fn new(endpoint: String, poll_interval: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            poll_interval,
        }
    }

    async fn fetch_latest(&self, feed_id: H256) -> Result<PriceTick, FeedError> {
        let url = format!(
            "{}/v2/updates/price/latest?ids[]={:#x}",
            self.endpoint, feed_id
        );
        let response: LatestPriceResponse =
            self.http.get(&url).send().await?.error_for_status()?.json().await?;

        response
            .parsed
            .into_iter()
            .next()
            .map(|feed| feed.price)
            .ok_or(FeedError::Empty(feed_id))
    }
}

#[async_trait]
impl PriceFeed for HermesPriceFeed {
    async fn subscribe(&self, feed_id: H256) -> Result<mpsc::Receiver<PriceTick>, FeedError> {
        // Fail the subscription up front if the feed id is unknown
        let first = self.fetch_latest(feed_id).await?;

        let (tx, rx) = mpsc::channel(64);
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let feed = HermesPriceFeed {
                http,
                endpoint,
                poll_interval,
            };
            let mut last_publish = first.publish_time;
            if tx.send(first).await.is_err() {
                return;
            }
            loop {
                tokio::time::sleep(poll_interval).await;
                match feed.fetch_latest(feed_id).await {
                    Ok(tick) => {
                        if tick.publish_time <= last_publish {
                            continue;
                        }
                        last_publish = tick.publish_time;
                        if tx.send(tick).await.is_err() {
                            debug!(feed_id = ?feed_id, "price subscriber gone");
                            return;
                        }
                    }
                    Err(e) => {
                        // Drop the stream; the subscriber reconnects after
                        // its fixed backoff
                        warn!(feed_id = ?feed_id, error = %e, "price poll failed");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Hermes serializes price mantissas as decimal strings.
mod string_i64 {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: i64, expo: i32) -> PriceTick {
        PriceTick {
            price,
            expo,
            publish_time: 0,
        }
    }

    #[test]
    fn negative_expo_scales_up_to_wei() {
        // 6_500_000_000 * 10^-8 = 65; normalized to 65e18
        let wei = tick(6_500_000_000, -8).to_wei();
        assert_eq!(wei, U256::from(65u64) * U256::exp10(18));
    }

    #[test]
    fn zero_expo_scales_by_eighteen() {
        assert_eq!(tick(42, 0).to_wei(), U256::from(42u64) * U256::exp10(18));
    }

    #[test]
    fn expo_below_scale_divides() {
        // 123 * 10^-20 → 1 at the 18-decimal scale (truncated)
        assert_eq!(tick(123, -20).to_wei(), U256::one());
    }

    #[test]
    fn non_positive_prices_normalize_to_zero() {
        assert_eq!(tick(0, -8).to_wei(), U256::zero());
        assert_eq!(tick(-100, -8).to_wei(), U256::zero());
    }

    #[test]
    fn out_of_range_exponents_normalize_to_zero() {
        // 10^78 exceeds the 256-bit range
        assert_eq!(tick(1, 60).to_wei(), U256::zero());
        // The scaled product overflows even when the scale alone fits
        assert_eq!(tick(i64::MAX, 41).to_wei(), U256::zero());
        // Far-negative exponents divide everything down to zero
        assert_eq!(tick(i64::MAX, -100).to_wei(), U256::zero());
    }

    #[test]
    fn hermes_payload_parses() {
        let payload = r#"{
            "parsed": [
                { "id": "ff61", "price": { "price": "6500000000", "expo": -8, "publish_time": 1700000000 } }
            ]
        }"#;
        let response: LatestPriceResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(response.parsed[0].price.price, 6_500_000_000);
        assert_eq!(response.parsed[0].price.expo, -8);
    }
}
