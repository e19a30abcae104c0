use crate::common::{Market, StreamKey, Timeframe};
use crate::domain::{Candle, CandleSeries, OrderBookSnapshot, Ticker, Trade};

/// # Summary
/// `TASK_ERROR` 信号携带的错误分类，覆盖整个核心的错误分类法（§7）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    AuthenticationFailed,
    BadRequest,
    NotSupported,
    CacheCorrupt,
    IntegrityError(IntegrityKind),
    Backpressure,
    Internal,
}

/// # Summary
/// `IntegrityError` 的具体子类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    CandleOrdering,
    TimestampAlignment,
    PriceOrdering,
}

/// # Summary
/// SignalBus 上流转的全部信号类型，负载以具名字段表达而非位置参数。
#[derive(Debug, Clone)]
pub enum Signal {
    NewTrade { market: Market, trade: Trade },
    OrderBookUpdate { market: Market, snapshot: OrderBookSnapshot },
    NewTicker { market: Market, ticker: Ticker },
    InitialCandles {
        market: Market,
        timeframe: Timeframe,
        series: CandleSeries,
    },
    UpdatedCandle {
        market: Market,
        timeframe: Timeframe,
        candle: Candle,
    },
    TaskError {
        stream_key: StreamKey,
        kind: ErrorKind,
        message: String,
    },
}
