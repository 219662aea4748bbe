pub mod book;
pub mod engine;
pub mod types;

pub use engine::MatchingEngine;
pub use types::{settlement_id, BookSnapshot, OrderError};
