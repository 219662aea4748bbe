pub mod market;
pub mod order;

pub use market::Market;
pub use order::{LimitOrder, Order, OrderStatus, OrderSubmission, OrderType, Side};
