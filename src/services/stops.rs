//! Stop-trigger loop.
//!
//! One loop per market engine: subscribe to the market's price feed, push
//! each tick through the engine's stop promotion, and resubscribe after a
//! fixed delay whenever the stream drops. Missed ticks are not replayed;
//! stops whose trigger was crossed during an outage promote on the first
//! tick after reconnection.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::services::matching::MatchingEngine;
use crate::services::price_feed::PriceFeed;

pub async fn run_stop_trigger_loop(
    engine: Arc<MatchingEngine>,
    feed: Arc<dyn PriceFeed>,
    reconnect_delay: Duration,
) {
    let market = engine.market().clone();
    info!(market_id = market.id, symbol = %market.symbol, "stop trigger loop started");

    loop {
        if engine.is_closed() {
            break;
        }

        match feed.subscribe(market.feed_id).await {
            Ok(mut ticks) => {
                while let Some(tick) = ticks.recv().await {
                    if engine.is_closed() {
                        info!(market_id = market.id, "stop trigger loop stopping");
                        return;
                    }
                    let price = tick.to_wei();
                    if price.is_zero() {
                        // A dropped observation, not a price
                        continue;
                    }
                    engine.on_price_tick(price);
                }
                debug!(market_id = market.id, "price stream ended");
            }
            Err(e) => {
                warn!(market_id = market.id, error = %e, "price subscription failed");
            }
        }

        tokio::time::sleep(reconnect_delay).await;
    }

    info!(market_id = market.id, "stop trigger loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderType;
    use crate::testkit::{stop_submission, ScriptedPriceFeed, test_engine};
    use ethers::types::U256;

    #[tokio::test]
    async fn ticks_from_the_feed_promote_stops() {
        let engine = test_engine();
        let id = engine
            .add_order(stop_submission(1, OrderType::StopLimit, 10, U256::from(90)))
            .await
            .unwrap();

        // One tick well above the trigger, then the stream ends
        let feed = Arc::new(ScriptedPriceFeed::new(vec![95]));
        let handle = tokio::spawn(run_stop_trigger_loop(
            engine.clone(),
            feed,
            Duration::from_millis(5),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.close();
        handle.await.unwrap();

        let promoted = engine.order(&id).unwrap();
        assert!(promoted.stopped);
    }

    #[tokio::test]
    async fn unusable_ticks_do_not_touch_stops() {
        let engine = test_engine();
        // A sell stop triggers on any tick below it, so a zero tick must
        // never reach the engine
        let id = engine
            .add_order(stop_submission(1, OrderType::Stop, -10, U256::from(90)))
            .await
            .unwrap();

        let feed = Arc::new(ScriptedPriceFeed::new(vec![0]));
        let handle = tokio::spawn(run_stop_trigger_loop(
            engine.clone(),
            feed,
            Duration::from_millis(5),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.close();
        handle.await.unwrap();

        let dormant = engine.order(&id).unwrap();
        assert!(!dormant.stopped);
    }
}
