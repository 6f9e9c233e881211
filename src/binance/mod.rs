pub mod client;
pub mod rate_limit;

pub use client::{ApiError, BinanceClient, FillRecord, OrderAck, OrderInfo, PositionInfo};
pub use rate_limit::RateLimitTracker;
