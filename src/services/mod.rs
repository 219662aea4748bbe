pub mod matching;
pub mod nonce;
pub mod price_feed;
pub mod registry;
pub mod settlement;
pub mod stops;
