use crate::buffer::RollingBuffer;
use dashmap::DashMap;
use marketcore_core::common::Timeframe;
use marketcore_core::domain::{Candle, Trade};
use std::sync::Mutex;

const CLOSED_BAR_HISTORY: usize = 512;

/// # Summary
/// 单个 `(market, timeframe)` 的聚合状态：当前正在形成的 bar 与最近收盘的 bar 历史。
struct FactoryState {
    forming: Option<Candle>,
    closed: RollingBuffer<Candle>,
}

/// # Summary
/// 按 `(exchange, symbol, timeframe)` 对逐笔成交做 OHLCV 聚合的工厂。
///
/// # Invariants
/// - `bar_start = floor(trade.timestamp_seconds / tf_seconds) * tf_seconds`。
/// - 属于已经收盘 bar 的乱序成交被拒绝，不会修改历史。
/// - 每一笔被接受的成交都会产出一次"当前 bar"快照，供 `UpdatedCandle` 信号使用。
pub struct CandleFactory {
    state: DashMap<(String, String, Timeframe), Mutex<FactoryState>>,
}

impl CandleFactory {
    pub fn new() -> Self {
        Self {
            state: DashMap::new(),
        }
    }

    /// # Summary
    /// 用历史收盘 K 线预热工厂，不产生任何 `UpdatedCandle` 事件。
    pub fn seed(&self, exchange: &str, symbol: &str, timeframe: Timeframe, history: &[Candle]) {
        let entry = self
            .state
            .entry((exchange.to_string(), symbol.to_string(), timeframe))
            .or_insert_with(|| {
                Mutex::new(FactoryState {
                    forming: None,
                    closed: RollingBuffer::new(CLOSED_BAR_HISTORY),
                })
            });
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        for candle in history {
            guard.closed.push(*candle);
        }
    }

    /// # Summary
    /// 用一笔新成交推进聚合状态。
    ///
    /// # Logic
    /// 1. 计算该成交所属的 bar 起始时间。
    /// 2. 若没有正在形成的 bar，或成交属于比当前 bar 更新的 bar：先把旧 bar 归档进 `closed`，
    ///    再以该成交开启一根新 bar。
    /// 3. 若成交属于当前正在形成的 bar：原地更新 high/low/close/volume。
    /// 4. 若成交的 bar 起始时间早于当前正在形成的 bar：判定为乱序，拒绝且不修改任何状态。
    ///
    /// # Returns
    /// 本次成交生效后的"当前 bar"快照；若成交被拒绝则返回 `None`。
    pub fn on_trade(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        trade: &Trade,
    ) -> Option<Candle> {
        let entry = self
            .state
            .entry((exchange.to_string(), symbol.to_string(), timeframe))
            .or_insert_with(|| {
                Mutex::new(FactoryState {
                    forming: None,
                    closed: RollingBuffer::new(CLOSED_BAR_HISTORY),
                })
            });
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());

        let tf_seconds = timeframe.tf_seconds();
        let trade_seconds = trade.timestamp_millis.div_euclid(1_000);
        let bar_start = trade_seconds.div_euclid(tf_seconds) * tf_seconds;

        match guard.forming {
            Some(current) if bar_start < current.timestamp_seconds => None,
            Some(current) if bar_start == current.timestamp_seconds => {
                let mut updated = current;
                updated.high = updated.high.max(trade.price);
                updated.low = updated.low.min(trade.price);
                updated.close = trade.price;
                updated.volume += trade.amount;
                guard.forming = Some(updated);
                Some(updated)
            }
            _ => {
                if let Some(previous) = guard.forming.take() {
                    guard.closed.push(previous);
                }
                let fresh = Candle {
                    timestamp_seconds: bar_start,
                    open: trade.price,
                    high: trade.price,
                    low: trade.price,
                    close: trade.price,
                    volume: trade.amount,
                };
                guard.forming = Some(fresh);
                Some(fresh)
            }
        }
    }

    /// # Summary
    /// 返回最近收盘 bar 的历史（不含当前正在形成的 bar）。
    pub fn closed_history(&self, exchange: &str, symbol: &str, timeframe: Timeframe) -> Vec<Candle> {
        self.state
            .get(&(exchange.to_string(), symbol.to_string(), timeframe))
            .map(|entry| entry.lock().unwrap_or_else(|e| e.into_inner()).closed.to_vec())
            .unwrap_or_default()
    }

    /// # Summary
    /// 撤销该 `(market, timeframe)` 的聚合状态，释放其缓冲区；幂等，重复调用是空操作。
    pub fn close(&self, exchange: &str, symbol: &str, timeframe: Timeframe) {
        self.state.remove(&(exchange.to_string(), symbol.to_string(), timeframe));
    }
}

impl Default for CandleFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketcore_core::domain::Side;

    fn trade(timestamp_millis: i64, price: f64, amount: f64) -> Trade {
        Trade {
            timestamp_millis,
            price,
            amount,
            side: Side::Buy,
        }
    }

    #[test]
    fn first_trade_opens_a_new_bar() {
        let factory = CandleFactory::new();
        let candle = factory
            .on_trade("coinbase", "BTC/USD", Timeframe::Minute1, &trade(0, 100.0, 1.0))
            .unwrap();
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.close, 100.0);
        assert_eq!(candle.volume, 1.0);
    }

    #[test]
    fn trades_within_same_bar_update_in_place() {
        let factory = CandleFactory::new();
        factory.on_trade("coinbase", "BTC/USD", Timeframe::Minute1, &trade(0, 100.0, 1.0));
        let candle = factory
            .on_trade(
                "coinbase",
                "BTC/USD",
                Timeframe::Minute1,
                &trade(30_000, 105.0, 2.0),
            )
            .unwrap();
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.close, 105.0);
        assert_eq!(candle.volume, 3.0);
    }

    #[test]
    fn trade_in_next_bar_closes_the_previous_one() {
        let factory = CandleFactory::new();
        factory.on_trade("coinbase", "BTC/USD", Timeframe::Minute1, &trade(0, 100.0, 1.0));
        let candle = factory
            .on_trade(
                "coinbase",
                "BTC/USD",
                Timeframe::Minute1,
                &trade(60_000, 110.0, 1.0),
            )
            .unwrap();
        assert_eq!(candle.timestamp_seconds, 60);
        assert_eq!(candle.open, 110.0);
        let history = factory.closed_history("coinbase", "BTC/USD", Timeframe::Minute1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp_seconds, 0);
    }

    #[test]
    fn out_of_order_trade_is_rejected_without_mutation() {
        let factory = CandleFactory::new();
        factory.on_trade("coinbase", "BTC/USD", Timeframe::Minute1, &trade(60_000, 110.0, 1.0));
        let rejected = factory.on_trade(
            "coinbase",
            "BTC/USD",
            Timeframe::Minute1,
            &trade(0, 999.0, 50.0),
        );
        assert!(rejected.is_none());
        let history = factory.closed_history("coinbase", "BTC/USD", Timeframe::Minute1);
        assert!(history.is_empty());
    }

    #[test]
    fn seed_populates_closed_history_without_forming_bar_events() {
        let factory = CandleFactory::new();
        let history = vec![Candle {
            timestamp_seconds: 0,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        }];
        factory.seed("coinbase", "BTC/USD", Timeframe::Minute1, &history);
        assert_eq!(
            factory.closed_history("coinbase", "BTC/USD", Timeframe::Minute1).len(),
            1
        );
    }
}
