use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// # Summary
/// 一个市场的唯一标识：交易所与交易对的组合。
///
/// # Invariants
/// - `symbol` 必须原样保留交易所提供的大小写与分隔符，不做归一化改写。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Market {
    // 交易所标识 (例如: "coinbase", "binance")
    pub exchange: String,
    // 交易对符号 (例如: "BTC/USD")
    pub symbol: String,
}

impl Market {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
        }
    }

    /// # Summary
    /// 生成可安全用于文件名的 symbol 表示，将 `/` 替换为 `-`。
    pub fn safe_symbol(&self) -> String {
        self.symbol.replace('/', "-")
    }
}

/// # Summary
/// K 线周期枚举，映射到一个确定的秒数。
///
/// # Invariants
/// - `tf_seconds()` 必须对任意取值返回一个严格正整数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Minute1,
    Minute5,
    Minute15,
    Hour1,
    Hour4,
    Day1,
}

impl Timeframe {
    /// # Summary
    /// 周期对应的秒数，用于对齐 bar 起始时间与生成缓存文件名。
    pub fn tf_seconds(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 60,
            Timeframe::Minute5 => 300,
            Timeframe::Minute15 => 900,
            Timeframe::Hour1 => 3_600,
            Timeframe::Hour4 => 14_400,
            Timeframe::Day1 => 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::Minute1),
            "5m" => Ok(Timeframe::Minute5),
            "15m" => Ok(Timeframe::Minute15),
            "1h" => Ok(Timeframe::Hour1),
            "4h" => Ok(Timeframe::Hour4),
            "1d" => Ok(Timeframe::Day1),
            _ => Err(format!("unknown timeframe: {s}")),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// # Summary
/// 内部资源标识，是订阅引用计数的最小单位。
///
/// # Invariants
/// - `Candles` 变体总是隐含对相同 `(exchange, symbol)` 下 `Trades` 变体的依赖。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKey {
    Trades(Market),
    OrderBook(Market),
    Ticker(Market),
    Candles(Market, Timeframe),
}

impl StreamKey {
    /// # Summary
    /// 返回该资源标识所依赖的底层流标识（若有）。
    ///
    /// # Logic
    /// 1. `Candles` 依赖同一市场的 `Trades` 流。
    /// 2. 其余变体没有依赖，返回 `None`。
    pub fn dependency(&self) -> Option<StreamKey> {
        match self {
            StreamKey::Candles(market, _) => Some(StreamKey::Trades(market.clone())),
            _ => None,
        }
    }

    pub fn market(&self) -> &Market {
        match self {
            StreamKey::Trades(m) | StreamKey::OrderBook(m) | StreamKey::Ticker(m) => m,
            StreamKey::Candles(m, _) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candles_key_depends_on_trades_key() {
        let market = Market::new("coinbase", "BTC/USD");
        let key = StreamKey::Candles(market.clone(), Timeframe::Hour1);
        assert_eq!(key.dependency(), Some(StreamKey::Trades(market)));
    }

    #[test]
    fn trades_key_has_no_dependency() {
        let key = StreamKey::Trades(Market::new("coinbase", "BTC/USD"));
        assert_eq!(key.dependency(), None);
    }

    #[test]
    fn safe_symbol_replaces_slash() {
        let market = Market::new("coinbase", "BTC/USD");
        assert_eq!(market.safe_symbol(), "BTC-USD");
    }

    #[test]
    fn timeframe_roundtrips_through_str() {
        for tf in [
            Timeframe::Minute1,
            Timeframe::Minute5,
            Timeframe::Minute15,
            Timeframe::Hour1,
            Timeframe::Hour4,
            Timeframe::Day1,
        ] {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }
}
