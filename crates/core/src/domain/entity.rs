use serde::{Deserialize, Serialize};

/// # Summary
/// 单根 K 线数据实体，记录特定周期窗口内的行情波动。
///
/// # Invariants
/// - `low` 必须小于或等于 `open`, `close`, `high`。
/// - `timestamp_seconds` 必须对齐到所属周期的 `tf_seconds`。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    // bar 起始时间，单位为秒
    pub timestamp_seconds: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// # Summary
    /// 校验 K 线自身的价格结构是否合法。
    ///
    /// # Logic
    /// 1. 拒绝 NaN 或非正价格。
    /// 2. 拒绝负成交量。
    /// 3. 校验 low/high 对 open/close 的包络关系。
    pub fn is_valid(&self) -> bool {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| v.is_nan() || !v.is_finite()) {
            return false;
        }
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return false;
        }
        if self.volume < 0.0 {
            return false;
        }
        self.low <= self.open
            && self.low <= self.close
            && self.low <= self.high
            && self.high >= self.open
            && self.high >= self.close
    }
}

/// # Summary
/// 一个 `(exchange, symbol, timeframe)` 三元组下有序的 K 线序列。
///
/// # Invariants
/// - 时间戳严格递增，且不含重复项。
/// - 允许缺口（不回填合成 bar）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self { candles: Vec::new() }
    }

    /// # Summary
    /// 从任意顺序、可能重复的行构造一个合法序列。
    ///
    /// # Logic
    /// 1. 按时间戳排序。
    /// 2. 去重，相同时间戳保留先出现的一条。
    pub fn from_rows(mut rows: Vec<Candle>) -> Self {
        rows.sort_by_key(|c| c.timestamp_seconds);
        rows.dedup_by_key(|c| c.timestamp_seconds);
        Self { candles: rows }
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    pub fn into_rows(self) -> Vec<Candle> {
        self.candles
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// # Summary
    /// 将另一批行合并进当前序列，按时间戳去重（保留先到者），并保持有序。
    ///
    /// # Arguments
    /// * `rows`: 待合并的新行，顺序任意。
    pub fn merge(&mut self, rows: impl IntoIterator<Item = Candle>) {
        self.candles.extend(rows);
        self.candles.sort_by_key(|c| c.timestamp_seconds);
        self.candles.dedup_by_key(|c| c.timestamp_seconds);
    }

    /// # Summary
    /// 返回时间戳大于等于 `since_seconds` 的子序列。
    pub fn filtered_from(&self, since_seconds: i64) -> Vec<Candle> {
        self.candles
            .iter()
            .copied()
            .filter(|c| c.timestamp_seconds >= since_seconds)
            .collect()
    }
}

/// # Summary
/// 成交方向，交易所未提供时允许为 `Unknown`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

/// # Summary
/// 单笔成交记录。
///
/// # Invariants
/// - `price` 和 `amount` 必须严格为正。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp_millis: i64,
    pub price: f64,
    pub amount: f64,
    pub side: Side,
}

impl Trade {
    pub fn is_valid(&self) -> bool {
        self.price.is_finite()
            && self.amount.is_finite()
            && self.price > 0.0
            && self.amount > 0.0
    }
}

/// # Summary
/// 单个价位上的挂单量。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub amount: f64,
}

/// # Summary
/// 订单簿快照，买盘价格降序，卖盘价格升序，价格互不重复。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp_millis: i64,
}

/// # Summary
/// 行情摘要，所有数值字段均为可选，以容忍交易所部分字段缺失。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub timestamp_millis: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64) -> Candle {
        Candle {
            timestamp_seconds: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        }
    }

    #[test]
    fn valid_candle_passes_envelope_check() {
        assert!(candle(0).is_valid());
    }

    #[test]
    fn candle_with_high_below_open_is_invalid() {
        let mut c = candle(0);
        c.high = 0.1;
        assert!(!c.is_valid());
    }

    #[test]
    fn candle_with_negative_volume_is_invalid() {
        let mut c = candle(0);
        c.volume = -1.0;
        assert!(!c.is_valid());
    }

    #[test]
    fn from_rows_sorts_and_dedups() {
        let series = CandleSeries::from_rows(vec![candle(120), candle(0), candle(120), candle(60)]);
        let rows = series.as_slice();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].timestamp_seconds, 0);
        assert_eq!(rows[1].timestamp_seconds, 60);
        assert_eq!(rows[2].timestamp_seconds, 120);
    }

    #[test]
    fn merge_keeps_series_sorted_and_unique() {
        let mut series = CandleSeries::from_rows(vec![candle(0), candle(60)]);
        series.merge(vec![candle(180), candle(60), candle(240)]);
        let timestamps: Vec<i64> = series.as_slice().iter().map(|c| c.timestamp_seconds).collect();
        assert_eq!(timestamps, vec![0, 60, 180, 240]);
    }

    #[test]
    fn filtered_from_drops_earlier_rows() {
        let series = CandleSeries::from_rows(vec![candle(0), candle(60), candle(120)]);
        let filtered = series.filtered_from(60);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].timestamp_seconds, 60);
    }
}
