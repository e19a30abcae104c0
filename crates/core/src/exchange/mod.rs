pub mod error;
pub mod port;

pub use error::ExchangeError;
pub use port::{ExchangeCapability, MarketInfo, OrderBookStream, TickerStream, TradeStream};
