use dashmap::DashMap;
use marketcore_core::cache::port::{CacheKey, CacheMetadata, CacheStore};
use marketcore_core::common::Timeframe;
use marketcore_core::config::FetchConfig;
use marketcore_core::domain::{Candle, CandleSeries};
use marketcore_core::exchange::error::ExchangeError;
use marketcore_core::exchange::port::{ExchangeCapability, MarketInfo};
use marketcore_core::fetch::error::FetchError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tracing::warn;

const PAGE_LIMIT: usize = 500;
const DEFAULT_RATE_LIMIT_MILLIS: u32 = 1_000;

/// # Summary
/// 历史 K 线拉取器：向前分页拉取交易所历史数据，与本地磁盘缓存合并。
///
/// # Invariants
/// - 同一交易所的并发拉取数不超过配置的 `exchange_concurrency`。
/// - 分页游标若未能前进，立即中止，防止死循环。
/// - 限频/瞬时错误的退避睡眠发生在信号量许可被释放之后。
pub struct CandleFetcher {
    exchange: Arc<dyn ExchangeCapability>,
    cache: Arc<dyn CacheStore>,
    config: FetchConfig,
    semaphores: DashMap<String, Arc<Semaphore>>,
    market_info: OnceCell<HashMap<String, MarketInfo>>,
}

impl CandleFetcher {
    pub fn new(exchange: Arc<dyn ExchangeCapability>, cache: Arc<dyn CacheStore>, config: FetchConfig) -> Self {
        Self {
            exchange,
            cache,
            config,
            semaphores: DashMap::new(),
            market_info: OnceCell::new(),
        }
    }

    fn semaphore_for(&self, exchange_id: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(exchange_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.exchange_concurrency)))
            .clone()
    }

    async fn rate_limit_millis_for(&self, symbol: &str) -> u32 {
        let info = self
            .market_info
            .get_or_init(|| async { self.exchange.list_markets().await.unwrap_or_default() })
            .await;
        info.get(symbol)
            .map(|m| m.rate_limit_millis)
            .unwrap_or(DEFAULT_RATE_LIMIT_MILLIS)
    }

    async fn backoff_for(&self, error: &ExchangeError, attempt: u32, symbol: &str) -> Duration {
        match error {
            ExchangeError::RateLimited { retry_after_millis } => {
                let millis = match retry_after_millis {
                    Some(hint) => *hint,
                    None => {
                        let base = u64::from(self.rate_limit_millis_for(symbol).await);
                        base.saturating_mul(2u64.saturating_pow(attempt))
                    }
                };
                Duration::from_millis(millis.min(self.config.rate_limit_sleep_cap_millis))
            }
            _ => {
                let millis = self.config.backoff_base_millis.saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(millis.min(self.config.backoff_cap_millis))
            }
        }
    }

    /// # Summary
    /// 拉取一页历史 K 线，遇到可重试错误时在信号量外退避重试。
    async fn fetch_page_with_retry(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        since_millis: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError> {
        let semaphore = self.semaphore_for(exchange_id);
        let mut attempt: u32 = 0;
        loop {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(FetchError::Exchange(ExchangeError::Unknown(
                        "fetch semaphore closed".to_string(),
                    )));
                }
            };
            let result = self
                .exchange
                .fetch_ohlcv_page(symbol, timeframe, since_millis, limit)
                .await;
            drop(permit);

            match result {
                Ok(rows) => return Ok(rows),
                Err(e) if !e.is_retryable() => return Err(FetchError::Exchange(e)),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(FetchError::Exchange(e));
                    }
                    let backoff = self.backoff_for(&e, attempt, symbol).await;
                    let backoff_millis = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
                    warn!(symbol, attempt, backoff_millis, "retrying page fetch after backoff");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// # Summary
    /// 从 `since_millis` 向前分页拉取，直到游标达到 `until_millis` 或数据耗尽。
    ///
    /// # Logic
    /// 1. 每页请求后检查返回的最后一根 bar 的时间戳是否严格前进。
    /// 2. 若未前进，判定为死循环风险，立即以 `PaginationStalled` 中止。
    async fn paginate_forward(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        since_millis: i64,
        until_millis: i64,
    ) -> Result<Vec<Candle>, FetchError> {
        let tf_millis = timeframe.tf_seconds() * 1_000;
        let mut cursor = since_millis;
        let mut collected = Vec::new();
        if cursor >= until_millis {
            return Ok(collected);
        }
        loop {
            let page = self
                .fetch_page_with_retry(exchange_id, symbol, timeframe, cursor, PAGE_LIMIT)
                .await?;
            let Some(last) = page.last() else { break };
            let next_cursor = last.timestamp_seconds * 1_000 + tf_millis;
            collected.extend(page.clone());
            if next_cursor <= cursor {
                return Err(FetchError::PaginationStalled {
                    symbol: symbol.to_string(),
                    cursor_millis: cursor,
                });
            }
            cursor = next_cursor;
            if cursor >= until_millis || page.len() < PAGE_LIMIT {
                break;
            }
        }
        Ok(collected)
    }

    /// # Summary
    /// 拉取 `[since_millis, now_millis)` 区间的历史 K 线，与本地缓存合并落盘。
    ///
    /// # Logic
    /// 1. 持有该 key 的缓存锁直到整个操作结束。
    /// 2. 加载既有缓存；若缓存起点晚于 `since_millis`（或缓存为空），向前补齐 (prepend)。
    /// 3. 若缓存终点早于当前时间，向后追平 (append)。
    /// 4. 合并结果写回缓存，返回时间戳大于等于 `since_millis` 的子序列。
    pub async fn fetch(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        since_millis: i64,
        now_millis: i64,
    ) -> Result<CandleSeries, FetchError> {
        let key = CacheKey::new(exchange_id, symbol, timeframe);
        let _lock = self.cache.lock_for(&key).await;
        let mut merged = match self.cache.load(&key).await {
            Ok(series) => series,
            Err(e) => {
                warn!(exchange = exchange_id, symbol, error = %e, "cache load failed, starting from empty series");
                CandleSeries::new()
            }
        };

        let tf_millis = timeframe.tf_seconds() * 1_000;

        let needs_prepend = match merged.first() {
            Some(first) => first.timestamp_seconds * 1_000 > since_millis,
            None => true,
        };
        if needs_prepend {
            let prepend_until = merged
                .first()
                .map(|c| c.timestamp_seconds * 1_000)
                .unwrap_or(now_millis);
            let rows = self
                .paginate_forward(exchange_id, symbol, timeframe, since_millis, prepend_until)
                .await?;
            merged.merge(rows);
        }

        let append_since = merged
            .last()
            .map(|c| c.timestamp_seconds * 1_000 + tf_millis)
            .unwrap_or(since_millis);
        if append_since < now_millis {
            let rows = self
                .paginate_forward(exchange_id, symbol, timeframe, append_since, now_millis)
                .await?;
            merged.merge(rows);
        }

        self.cache
            .save(
                &key,
                &merged,
                CacheMetadata {
                    exchange: exchange_id.to_string(),
                    symbol: symbol.to_string(),
                    timeframe: timeframe.as_str().to_string(),
                    last_written_at_millis: now_millis,
                },
            )
            .await?;

        let since_seconds = since_millis.div_euclid(1_000);
        Ok(CandleSeries::from_rows(merged.filtered_from(since_seconds)))
    }

    /// # Summary
    /// 确保本地缓存至少覆盖 `bars_wanted` 根历史 bar；是 [`fetch`] 按 bar 数量换算 `since` 的便捷包装，
    /// 供 TaskManager 在首次订阅 K 线时做历史补种。
    pub async fn ensure_history(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        bars_wanted: i64,
        now_millis: i64,
    ) -> Result<CandleSeries, FetchError> {
        let tf_millis = timeframe.tf_seconds() * 1_000;
        let since_millis = now_millis - bars_wanted * tf_millis;
        self.fetch(exchange_id, symbol, timeframe, since_millis, now_millis).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marketcore_cache::FileCacheStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedExchange {
        pages: Mutex<Vec<Vec<Candle>>>,
        calls: AtomicUsize,
    }

    fn candle(ts: i64) -> Candle {
        Candle {
            timestamp_seconds: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        }
    }

    #[async_trait]
    impl ExchangeCapability for ScriptedExchange {
        async fn list_markets(&self) -> Result<HashMap<String, MarketInfo>, ExchangeError> {
            Ok(HashMap::new())
        }

        async fn fetch_ohlcv_page(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _since_millis: i64,
            _limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
            Ok(pages.pop().unwrap_or_default())
        }

        async fn watch_trades(
            &self,
            _market: &marketcore_core::common::Market,
        ) -> Result<marketcore_core::exchange::port::TradeStream, ExchangeError> {
            unimplemented!("not exercised by fetcher tests")
        }

        async fn watch_order_book(
            &self,
            _market: &marketcore_core::common::Market,
        ) -> Result<marketcore_core::exchange::port::OrderBookStream, ExchangeError> {
            unimplemented!("not exercised by fetcher tests")
        }

        async fn watch_ticker(
            &self,
            _market: &marketcore_core::common::Market,
        ) -> Result<marketcore_core::exchange::port::TickerStream, ExchangeError> {
            unimplemented!("not exercised by fetcher tests")
        }
    }

    fn config() -> FetchConfig {
        FetchConfig {
            default_history_bars: 10,
            max_retries: 2,
            backoff_base_millis: 1,
            backoff_cap_millis: 5,
            rate_limit_sleep_cap_millis: 10,
            exchange_concurrency: 2,
        }
    }

    #[tokio::test]
    async fn ensure_history_seeds_from_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCacheStore::new(dir.path()));
        // reverse order: pages are popped from the back, so push in reverse delivery order
        let pages = vec![vec![candle(120), candle(180)], vec![candle(0), candle(60)]];
        let exchange = Arc::new(ScriptedExchange {
            pages: Mutex::new(pages),
            calls: AtomicUsize::new(0),
        });
        let fetcher = CandleFetcher::new(exchange, cache, config());
        let series = fetcher
            .ensure_history("coinbase", "BTC/USD", Timeframe::Minute1, 4, 240_000)
            .await
            .unwrap();
        assert_eq!(series.len(), 4);
    }

    #[tokio::test]
    async fn fetch_appends_new_pages_and_filters_to_since() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCacheStore::new(dir.path()));
        let key = CacheKey::new("coinbase", "BTC/USD", Timeframe::Minute1);
        cache
            .save(
                &key,
                &CandleSeries::from_rows(vec![candle(0), candle(60), candle(120)]),
                CacheMetadata {
                    exchange: "coinbase".to_string(),
                    symbol: "BTC/USD".to_string(),
                    timeframe: "1m".to_string(),
                    last_written_at_millis: 0,
                },
            )
            .await
            .unwrap();
        // reverse order: pages are popped from the back, so push in reverse delivery order
        let pages = vec![Vec::new(), vec![candle(180), candle(240)]];
        let exchange = Arc::new(ScriptedExchange {
            pages: Mutex::new(pages),
            calls: AtomicUsize::new(0),
        });
        let fetcher = CandleFetcher::new(exchange, cache.clone(), config());

        let series = fetcher
            .fetch("coinbase", "BTC/USD", Timeframe::Minute1, 0, 300_000)
            .await
            .unwrap();
        assert_eq!(
            series.as_slice().iter().map(|c| c.timestamp_seconds).collect::<Vec<_>>(),
            vec![0, 60, 120, 180, 240]
        );

        let persisted = cache.load(&key).await.unwrap();
        assert_eq!(persisted.len(), 5);
    }

    #[tokio::test]
    async fn pagination_stalls_when_cursor_does_not_advance() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCacheStore::new(dir.path()));
        let pages = vec![vec![candle(0)], vec![candle(0)]];
        let exchange = Arc::new(ScriptedExchange {
            pages: Mutex::new(pages),
            calls: AtomicUsize::new(0),
        });
        let fetcher = CandleFetcher::new(exchange, cache, config());
        let result = fetcher
            .ensure_history("coinbase", "BTC/USD", Timeframe::Minute1, 5, 600_000)
            .await;
        assert!(matches!(result, Err(FetchError::PaginationStalled { .. })));
    }
}
