use serde::{Deserialize, Serialize};

/// # Summary
/// 全局流式行情核心配置。
///
/// # Invariants
/// - 所有字段都有合理默认值，未提供配置文件或环境变量时退回 `Default`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub stream: StreamRuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    // 缓存文件落盘的根目录
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    // 首次订阅时回溯的默认 bar 数量
    pub default_history_bars: i64,
    // 每页拉取最大重试次数
    pub max_retries: u32,
    // 退避基准时长 (毫秒)
    pub backoff_base_millis: u64,
    // 退避时长上限 (毫秒)
    pub backoff_cap_millis: u64,
    // 缺少服务端提示时的限频退避时长上限 (毫秒)
    pub rate_limit_sleep_cap_millis: u64,
    // 每个交易所允许的并发拉取数
    pub exchange_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRuntimeConfig {
    // 任务收到 stop 信号后，等待其自行退出的宽限期 (毫秒)
    pub shutdown_grace_millis: u64,
    // 订单簿节流窗口 (毫秒)；None 表示不节流
    pub order_book_cadence_millis: Option<u64>,
    // SignalBus 积压超过此长度时开始丢弃订单簿快照；None 表示不设背压策略
    pub backpressure_high_water_mark: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig {
                data_dir: "data/candles".to_string(),
            },
            fetch: FetchConfig {
                default_history_bars: 1000,
                max_retries: 3,
                backoff_base_millis: 200,
                backoff_cap_millis: 10_000,
                rate_limit_sleep_cap_millis: 60_000,
                exchange_concurrency: 5,
            },
            stream: StreamRuntimeConfig {
                shutdown_grace_millis: 2_000,
                order_book_cadence_millis: None,
                backpressure_high_water_mark: None,
            },
        }
    }
}
