use async_trait::async_trait;
use marketcore_core::common::{Market, Timeframe};
use marketcore_core::domain::{Candle, OrderBookSnapshot, PriceLevel, Side, Ticker, Trade};
use marketcore_core::exchange::error::ExchangeError;
use marketcore_core::exchange::port::{
    ExchangeCapability, MarketInfo, OrderBookStream, TickerStream, TradeStream,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// # Summary
/// 内置的确定性 "纸面市场" 行情源，不依赖任何真实网络连接。
///
/// # Invariants
/// - 同一 `(symbol, bucket)` 永远生成同一根 K 线，供历史分页与缓存幂等性测试使用。
/// - `fetch_ohlcv_page` 只返回已经收盘的 bar，绝不提前返回当前正在形成的 bar。
pub struct PaperExchange {
    markets: HashMap<String, MarketInfo>,
}

impl PaperExchange {
    /// # Summary
    /// 构造一个携带若干演示市场的纸面交易所。
    pub fn new() -> Self {
        let mut markets = HashMap::new();
        for symbol in ["BTC/USD", "ETH/USD", "SOL/USD"] {
            markets.insert(
                symbol.to_string(),
                MarketInfo {
                    price_precision: 2,
                    rate_limit_millis: 200,
                },
            );
        }
        Self { markets }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

fn seed_for(symbol: &str, bucket: i64) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    bucket.hash(&mut hasher);
    hasher.finish()
}

fn base_price(symbol: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    let bucket = u32::try_from(hasher.finish() % 50_000).unwrap_or(0);
    10.0 + f64::from(bucket)
}

/// # Summary
/// 为给定市场与 bar 编号生成一根确定性的合成 K 线。
///
/// # Logic
/// 1. 以 `(symbol, bucket)` 播种随机数生成器，保证可重放。
/// 2. 围绕该 symbol 的基准价做小幅扰动，构造合法的 OHLC 包络。
fn synth_candle(symbol: &str, bucket: i64, tf_seconds: i64) -> Candle {
    let mut rng = ChaCha8Rng::seed_from_u64(seed_for(symbol, bucket));
    let base = base_price(symbol);
    let open = base * (1.0 + rng.gen_range(-0.01..0.01));
    let close = base * (1.0 + rng.gen_range(-0.01..0.01));
    let swing = rng.gen_range(0.0..0.004);
    let high = open.max(close) * (1.0 + swing);
    let low = open.min(close) * (1.0 - swing);
    let volume = rng.gen_range(0.1..10.0);
    Candle {
        timestamp_seconds: bucket * tf_seconds,
        open,
        high,
        low,
        close,
        volume,
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl ExchangeCapability for PaperExchange {
    async fn list_markets(&self) -> Result<HashMap<String, MarketInfo>, ExchangeError> {
        Ok(self.markets.clone())
    }

    async fn fetch_ohlcv_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_millis: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        if !self.markets.contains_key(symbol) {
            return Err(ExchangeError::BadRequest(format!("unknown symbol: {symbol}")));
        }
        let tf_seconds = timeframe.tf_seconds();
        let tf_millis = tf_seconds * 1_000;
        let since_bucket = since_millis.div_euclid(tf_millis);
        let now_bucket = now_millis().div_euclid(tf_millis);
        if since_bucket >= now_bucket {
            return Ok(Vec::new());
        }
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let last_bucket = (since_bucket + limit_i64 - 1).min(now_bucket - 1);
        let rows = (since_bucket..=last_bucket)
            .map(|bucket| synth_candle(symbol, bucket, tf_seconds))
            .collect();
        Ok(rows)
    }

    async fn watch_trades(&self, market: &Market) -> Result<TradeStream, ExchangeError> {
        if !self.markets.contains_key(&market.symbol) {
            return Err(ExchangeError::BadRequest(format!(
                "unknown symbol: {}",
                market.symbol
            )));
        }
        let symbol = market.symbol.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            let mut tick: i64 = 0;
            loop {
                ticker.tick().await;
                let bucket = now_millis() / 1_000;
                let candle = synth_candle(&symbol, bucket * 1_000 + tick, 1);
                let trade = Trade {
                    timestamp_millis: now_millis(),
                    price: candle.close,
                    amount: candle.volume.max(0.01),
                    side: if tick % 2 == 0 { Side::Buy } else { Side::Sell },
                };
                tick += 1;
                if tx.send(trade).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn watch_order_book(&self, market: &Market) -> Result<OrderBookStream, ExchangeError> {
        if !self.markets.contains_key(&market.symbol) {
            return Err(ExchangeError::BadRequest(format!(
                "unknown symbol: {}",
                market.symbol
            )));
        }
        let symbol = market.symbol.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            let mut tick: i64 = 0;
            loop {
                ticker.tick().await;
                let candle = synth_candle(&symbol, now_millis() / 1_000 + tick, 1);
                let snapshot = OrderBookSnapshot {
                    bids: vec![PriceLevel {
                        price: candle.low,
                        amount: candle.volume,
                    }],
                    asks: vec![PriceLevel {
                        price: candle.high,
                        amount: candle.volume,
                    }],
                    timestamp_millis: now_millis(),
                };
                tick += 1;
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn watch_ticker(&self, market: &Market) -> Result<TickerStream, ExchangeError> {
        if !self.markets.contains_key(&market.symbol) {
            return Err(ExchangeError::BadRequest(format!(
                "unknown symbol: {}",
                market.symbol
            )));
        }
        let symbol = market.symbol.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            let mut ticker_interval = tokio::time::interval(TICK_INTERVAL);
            let mut tick: i64 = 0;
            loop {
                ticker_interval.tick().await;
                let candle = synth_candle(&symbol, now_millis() / 1_000 + tick, 1);
                let ticker = Ticker {
                    bid: Some(candle.low),
                    ask: Some(candle.high),
                    last: Some(candle.close),
                    timestamp_millis: now_millis(),
                };
                tick += 1;
                if tx.send(ticker).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
