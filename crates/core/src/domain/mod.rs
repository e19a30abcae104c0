pub mod entity;

pub use entity::{Candle, CandleSeries, OrderBookSnapshot, PriceLevel, Side, Ticker, Trade};
