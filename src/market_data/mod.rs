pub mod cache;
pub mod stream;

pub use cache::{BandName, Candle, CandleKey, MarketDataCache};
