use crate::common::Market;
use crate::domain::{Candle, OrderBookSnapshot, Ticker, Trade};
use crate::exchange::error::ExchangeError;
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// # Summary
/// 交易所静态信息，至少包含价格精度与限频间隔。
#[derive(Debug, Clone, Copy)]
pub struct MarketInfo {
    pub price_precision: u8,
    pub rate_limit_millis: u32,
}

pub type TradeStream = Pin<Box<dyn Stream<Item = Trade> + Send>>;
pub type OrderBookStream = Pin<Box<dyn Stream<Item = OrderBookSnapshot> + Send>>;
pub type TickerStream = Pin<Box<dyn Stream<Item = Ticker> + Send>>;

/// # Summary
/// 对底层行情数据供给商的最小抽象，核心域只通过此接口与交易所通讯。
///
/// # Invariants
/// - `watch_*` 返回的流只在发生致命错误时才会结束；瞬时错误由实现者内部处理。
/// - 所有操作必须将失败归类为 `ExchangeError` 的某一变体，以便调用方区分是否重试。
#[async_trait]
pub trait ExchangeCapability: Send + Sync {
    /// # Summary
    /// 列出该交易所支持的全部市场及其静态信息。
    async fn list_markets(&self) -> Result<HashMap<String, MarketInfo>, ExchangeError>;

    /// # Summary
    /// 拉取一页历史 K 线。
    ///
    /// # Invariants
    /// - 返回行按 `timestamp_millis` 非递减排序。
    /// - 返回行数不超过 `limit`。
    async fn fetch_ohlcv_page(
        &self,
        symbol: &str,
        timeframe: crate::common::Timeframe,
        since_millis: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// # Summary
    /// 订阅逐笔成交流。流只在致命错误时结束，可被重新打开。
    async fn watch_trades(&self, market: &Market) -> Result<TradeStream, ExchangeError>;

    /// # Summary
    /// 订阅订单簿快照流。
    async fn watch_order_book(&self, market: &Market) -> Result<OrderBookStream, ExchangeError>;

    /// # Summary
    /// 订阅 Ticker 摘要流。
    async fn watch_ticker(&self, market: &Market) -> Result<TickerStream, ExchangeError>;
}
