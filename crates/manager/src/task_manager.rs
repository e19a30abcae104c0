use dashmap::DashMap;
use marketcore_bus::SignalBus;
use marketcore_core::bus::signal::{ErrorKind, Signal};
use marketcore_core::common::{Market, StreamKey, Timeframe};
use marketcore_core::config::StreamRuntimeConfig;
use marketcore_core::exchange::port::ExchangeCapability;
use marketcore_core::manager::error::TaskManagerError;
use marketcore_fetcher::CandleFetcher;
use marketcore_stream::{CandleFactory, Streamer};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, warn};

// 背压告警的最短间隔，避免每条被丢弃的快照都各产生一条 TASK_ERROR 信号
const BACKPRESSURE_ALERT_COOLDOWN_MILLIS: i64 = 5_000;

/// # Summary
/// 订阅引用计数与订阅者索引，由单把互斥锁统一保护以避免竞态更新。
struct Registry {
    subscriber_keys: HashMap<String, HashSet<StreamKey>>,
    ref_counts: HashMap<StreamKey, usize>,
    stopped: bool,
}

/// # Summary
/// 核心的订阅生命周期编排者：维护 `StreamKey` 引用计数，驱动 Streamer/CandleFactory，
/// 并把结果路由进 SignalBus。
///
/// # Invariants
/// - 同一 `(subscriber, key)` 重复订阅是幂等的，不重复计数。
/// - 只有引用计数从 0 变为 1 时才真正启动底层资源；归零时才真正停止。
/// - `Candles` key 隐式持有对同一市场 `Trades` key 的引用。
pub struct TaskManager {
    exchange_id: String,
    default_history_bars: i64,
    streamer: Arc<Streamer>,
    factory: Arc<CandleFactory>,
    fetcher: Arc<CandleFetcher>,
    bus: Arc<SignalBus>,
    registry: Mutex<Registry>,
    trade_pumps: DashMap<Market, ()>,
    order_book_pumps: DashMap<Market, ()>,
    ticker_pumps: DashMap<Market, ()>,
    candle_timeframes: DashMap<Market, HashSet<Timeframe>>,
    // SignalBus 积压超过此值时开始丢弃订单簿快照；None 表示不设背压策略
    backpressure_high_water_mark: Option<usize>,
    last_backpressure_alert_millis: AtomicI64,
}

impl TaskManager {
    /// # Summary
    /// 构造 TaskManager。`fetcher` 由调用方（通常是 Facade）构造并共享，
    /// 以便实时补种与一次性历史拉取复用同一套信号量与限频状态。
    pub fn new(
        exchange_id: impl Into<String>,
        default_history_bars: i64,
        exchange: Arc<dyn ExchangeCapability>,
        fetcher: Arc<CandleFetcher>,
        bus: Arc<SignalBus>,
        stream_runtime: StreamRuntimeConfig,
    ) -> Arc<Self> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let shutdown_grace = Duration::from_millis(stream_runtime.shutdown_grace_millis);
        let order_book_cadence = stream_runtime.order_book_cadence_millis.map(Duration::from_millis);
        let streamer = Arc::new(Streamer::new(exchange, fatal_tx, shutdown_grace, order_book_cadence));

        let manager = Arc::new(Self {
            exchange_id: exchange_id.into(),
            default_history_bars,
            streamer,
            factory: Arc::new(CandleFactory::new()),
            fetcher,
            bus: bus.clone(),
            registry: Mutex::new(Registry {
                subscriber_keys: HashMap::new(),
                ref_counts: HashMap::new(),
                stopped: false,
            }),
            trade_pumps: DashMap::new(),
            order_book_pumps: DashMap::new(),
            ticker_pumps: DashMap::new(),
            candle_timeframes: DashMap::new(),
            backpressure_high_water_mark: stream_runtime.backpressure_high_water_mark,
            last_backpressure_alert_millis: AtomicI64::new(0),
        });

        tokio::spawn(async move {
            while let Some((key, err)) = fatal_rx.recv().await {
                error!(stream_key = ?key, error = %err, "stream task died");
                bus.enqueue(Signal::TaskError {
                    stream_key: key,
                    kind: ErrorKind::Internal,
                    message: err.to_string(),
                });
            }
        });

        manager
    }

    /// # Summary
    /// 为 `subscriber_id` 订阅 `key`，必要时递归订阅其依赖并在 0→1 转换时启动底层资源。
    pub fn subscribe(self: &Arc<Self>, subscriber_id: &str, key: StreamKey) -> Result<(), TaskManagerError> {
        let is_first = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if registry.stopped {
                return Err(TaskManagerError::Stopped);
            }
            let keys = registry.subscriber_keys.entry(subscriber_id.to_string()).or_default();
            if keys.contains(&key) {
                return Ok(());
            }
            keys.insert(key.clone());
            let count = registry.ref_counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if let Some(dependency) = key.dependency() {
            self.subscribe(subscriber_id, dependency)?;
        }
        if is_first {
            self.start_key(key);
        }
        Ok(())
    }

    /// # Summary
    /// 撤销 `subscriber_id` 对 `key` 的订阅；重复撤销是幂等的空操作。
    pub async fn unsubscribe(self: &Arc<Self>, subscriber_id: &str, key: StreamKey) {
        let should_stop = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let Some(keys) = registry.subscriber_keys.get_mut(subscriber_id) else {
                return;
            };
            if !keys.remove(&key) {
                return;
            }
            let stop = match registry.ref_counts.get_mut(&key) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    *count == 0
                }
                _ => false,
            };
            if stop {
                registry.ref_counts.remove(&key);
            }
            stop
        };
        if should_stop {
            self.stop_key(&key).await;
        }
        if let Some(dependency) = key.dependency() {
            Box::pin(self.unsubscribe(subscriber_id, dependency)).await;
        }
    }

    /// # Summary
    /// 在关停期间置位 stopped 标记并停止全部仍在运行的资源。
    pub async fn stop_all(&self) {
        let keys: Vec<StreamKey> = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.stopped = true;
            registry.ref_counts.keys().cloned().collect()
        };
        for key in keys {
            self.stop_key(&key).await;
        }
    }

    fn start_key(self: &Arc<Self>, key: StreamKey) {
        match key.clone() {
            StreamKey::Trades(market) => {
                self.streamer.ensure_started(&key);
                self.ensure_trade_pump(market);
            }
            StreamKey::OrderBook(market) => {
                self.streamer.ensure_started(&key);
                self.ensure_order_book_pump(market);
            }
            StreamKey::Ticker(market) => {
                self.streamer.ensure_started(&key);
                self.ensure_ticker_pump(market);
            }
            StreamKey::Candles(market, timeframe) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.seed_candles(market, timeframe).await;
                });
            }
        }
    }

    async fn stop_key(&self, key: &StreamKey) {
        match key {
            StreamKey::Trades(market) => {
                self.streamer.stop(key).await;
                self.trade_pumps.remove(market);
            }
            StreamKey::OrderBook(market) => {
                self.streamer.stop(key).await;
                self.order_book_pumps.remove(market);
            }
            StreamKey::Ticker(market) => {
                self.streamer.stop(key).await;
                self.ticker_pumps.remove(market);
            }
            StreamKey::Candles(market, timeframe) => {
                if let Some(mut entry) = self.candle_timeframes.get_mut(market) {
                    entry.value_mut().remove(timeframe);
                }
                self.candle_timeframes.remove_if(market, |_, tfs| tfs.is_empty());
                self.factory.close(&self.exchange_id, &market.symbol, *timeframe);
            }
        }
    }

    /// # Summary
    /// 首次有订阅者要求某 `(market, timeframe)` 的 K 线时，拉取历史并灌入工厂。
    ///
    /// # Logic
    /// 拉取失败不会使订阅整体失败：以 `degraded` 的方式继续，只依赖后续实时成交重建 K 线，
    /// 并通过 `TaskError` 信号通知调用方。
    ///
    /// # Invariants
    /// 只有在对应的 `InitialCandles`（或降级模式下的 `TaskError`）信号已经入队之后，
    /// 才把 `(market, timeframe)` 登记进 `candle_timeframes`——实时成交泵只会路由
    /// 已登记的 timeframe，这保证同一订阅永远不会在 `InitialCandles` 之前观察到
    /// `UpdatedCandle`。
    async fn seed_candles(&self, market: Market, timeframe: Timeframe) {
        let now_millis = chrono::Utc::now().timestamp_millis();
        match self
            .fetcher
            .ensure_history(&self.exchange_id, &market.symbol, timeframe, self.default_history_bars, now_millis)
            .await
        {
            Ok(series) => {
                self.factory.seed(&self.exchange_id, &market.symbol, timeframe, series.as_slice());
                self.bus.enqueue(Signal::InitialCandles {
                    market: market.clone(),
                    timeframe,
                    series,
                });
                self.candle_timeframes.entry(market).or_default().insert(timeframe);
            }
            Err(e) => {
                warn!(symbol = %market.symbol, error = %e, "history seed failed, continuing in degraded mode");
                self.bus.enqueue(Signal::TaskError {
                    stream_key: StreamKey::Candles(market.clone(), timeframe),
                    kind: ErrorKind::Internal,
                    message: e.to_string(),
                });
                self.candle_timeframes.entry(market).or_default().insert(timeframe);
            }
        }
    }

    fn ensure_trade_pump(self: &Arc<Self>, market: Market) {
        if self.trade_pumps.insert(market.clone(), ()).is_some() {
            return;
        }
        let mut rx = self.streamer.subscribe_trades(&market);
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(trade) => {
                        manager.bus.enqueue(Signal::NewTrade {
                            market: market.clone(),
                            trade,
                        });
                        if let Some(timeframes) = manager.candle_timeframes.get(&market) {
                            for timeframe in timeframes.value().iter().copied() {
                                if let Some(candle) =
                                    manager.factory.on_trade(&manager.exchange_id, &market.symbol, timeframe, &trade)
                                {
                                    manager.bus.enqueue(Signal::UpdatedCandle {
                                        market: market.clone(),
                                        timeframe,
                                        candle,
                                    });
                                }
                            }
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn ensure_order_book_pump(self: &Arc<Self>, market: Market) {
        if self.order_book_pumps.insert(market.clone(), ()).is_some() {
            return;
        }
        let mut rx = self.streamer.subscribe_order_book(&market);
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(snapshot) => {
                        if manager.should_drop_for_backpressure() {
                            manager.alert_backpressure(&market);
                            continue;
                        }
                        manager.bus.enqueue(Signal::OrderBookUpdate {
                            market: market.clone(),
                            snapshot,
                        });
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// # Summary
    /// 判断 SignalBus 积压是否已超过背压高水位线；未配置高水位线时恒为 `false`。
    fn should_drop_for_backpressure(&self) -> bool {
        match self.backpressure_high_water_mark {
            Some(high_water_mark) => self.bus.qsize() > high_water_mark,
            None => false,
        }
    }

    /// # Summary
    /// 上报一次背压丢弃事件，按 `BACKPRESSURE_ALERT_COOLDOWN_MILLIS` 限速，避免刷屏。
    fn alert_backpressure(&self, market: &Market) {
        let now = chrono::Utc::now().timestamp_millis();
        let last = self.last_backpressure_alert_millis.load(Ordering::Relaxed);
        if now - last < BACKPRESSURE_ALERT_COOLDOWN_MILLIS {
            return;
        }
        if self
            .last_backpressure_alert_millis
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        warn!(market = ?market, "dropping order book snapshot, SignalBus above backpressure high water mark");
        self.bus.enqueue(Signal::TaskError {
            stream_key: StreamKey::OrderBook(market.clone()),
            kind: ErrorKind::Backpressure,
            message: "order book snapshots are being dropped due to backpressure".to_string(),
        });
    }

    fn ensure_ticker_pump(self: &Arc<Self>, market: Market) {
        if self.ticker_pumps.insert(market.clone(), ()).is_some() {
            return;
        }
        let mut rx = self.streamer.subscribe_ticker(&market);
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ticker) => manager.bus.enqueue(Signal::NewTicker {
                        market: market.clone(),
                        ticker,
                    }),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketcore_cache::FileCacheStore;
    use marketcore_core::config::FetchConfig;
    use marketcore_exchange::PaperExchange;

    fn config() -> FetchConfig {
        FetchConfig {
            default_history_bars: 5,
            max_retries: 2,
            backoff_base_millis: 1,
            backoff_cap_millis: 5,
            rate_limit_sleep_cap_millis: 10,
            exchange_concurrency: 2,
        }
    }

    fn runtime_config() -> StreamRuntimeConfig {
        StreamRuntimeConfig {
            shutdown_grace_millis: 100,
            order_book_cadence_millis: None,
            backpressure_high_water_mark: None,
        }
    }

    fn manager(dir: &tempfile::TempDir) -> Arc<TaskManager> {
        let exchange: Arc<dyn ExchangeCapability> = Arc::new(PaperExchange::new());
        let cache = Arc::new(FileCacheStore::new(dir.path()));
        let fetcher = Arc::new(CandleFetcher::new(exchange.clone(), cache, config()));
        let bus = Arc::new(SignalBus::new());
        TaskManager::new(
            "paper",
            config().default_history_bars,
            exchange,
            fetcher,
            bus,
            runtime_config(),
        )
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let market = Market::new("paper", "BTC/USD");
        let key = StreamKey::Trades(market);
        manager.subscribe("sub-a", key.clone()).unwrap();
        manager.subscribe("sub-a", key.clone()).unwrap();
        let registry = manager.registry.lock().unwrap();
        assert_eq!(registry.ref_counts.get(&key), Some(&1));
    }

    #[tokio::test]
    async fn candles_subscription_also_refcounts_trades_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let market = Market::new("paper", "BTC/USD");
        let candles_key = StreamKey::Candles(market.clone(), Timeframe::Minute1);
        manager.subscribe("sub-a", candles_key).unwrap();
        let registry = manager.registry.lock().unwrap();
        assert_eq!(registry.ref_counts.get(&StreamKey::Trades(market)), Some(&1));
    }

    #[tokio::test]
    async fn unsubscribe_last_reference_stops_underlying_task() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let market = Market::new("paper", "BTC/USD");
        let key = StreamKey::Trades(market.clone());
        manager.subscribe("sub-a", key.clone()).unwrap();
        manager.unsubscribe("sub-a", key.clone()).await;
        let registry = manager.registry.lock().unwrap();
        assert!(!registry.ref_counts.contains_key(&key));
    }

    #[tokio::test]
    async fn unsubscribe_last_candle_reference_closes_the_factory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let market = Market::new("paper", "BTC/USD");
        let key = StreamKey::Candles(market.clone(), Timeframe::Minute1);
        manager.subscribe("sub-a", key.clone()).unwrap();
        let history = [marketcore_core::domain::Candle {
            timestamp_seconds: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        }];
        manager.factory.seed("paper", &market.symbol, Timeframe::Minute1, &history);
        assert_eq!(
            manager
                .factory
                .closed_history("paper", &market.symbol, Timeframe::Minute1)
                .len(),
            1
        );
        manager.unsubscribe("sub-a", key).await;
        assert!(manager
            .factory
            .closed_history("paper", &market.symbol, Timeframe::Minute1)
            .is_empty());
    }

    #[tokio::test]
    async fn subscribe_after_stop_all_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.stop_all().await;
        let market = Market::new("paper", "BTC/USD");
        let result = manager.subscribe("sub-a", StreamKey::Trades(market));
        assert!(matches!(result, Err(TaskManagerError::Stopped)));
    }

    #[tokio::test]
    async fn live_trades_are_routed_to_the_signal_bus() {
        let dir = tempfile::tempdir().unwrap();
        let exchange: Arc<dyn ExchangeCapability> = Arc::new(PaperExchange::new());
        let cache = Arc::new(FileCacheStore::new(dir.path()));
        let fetcher = Arc::new(CandleFetcher::new(exchange.clone(), cache, config()));
        let bus = Arc::new(SignalBus::new());
        let manager = TaskManager::new(
            "paper",
            config().default_history_bars,
            exchange,
            fetcher,
            bus.clone(),
            runtime_config(),
        );
        let market = Market::new("paper", "BTC/USD");
        manager.subscribe("sub-a", StreamKey::Trades(market)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert!(bus.qsize() > 0);
    }

    #[tokio::test]
    async fn initial_candles_always_precedes_updated_candle_even_under_concurrent_trades() {
        let dir = tempfile::tempdir().unwrap();
        let exchange: Arc<dyn ExchangeCapability> = Arc::new(PaperExchange::new());
        let cache = Arc::new(FileCacheStore::new(dir.path()));
        let fetcher = Arc::new(CandleFetcher::new(exchange.clone(), cache, config()));
        let bus = Arc::new(SignalBus::new());
        let manager = TaskManager::new(
            "paper",
            config().default_history_bars,
            exchange,
            fetcher,
            bus.clone(),
            runtime_config(),
        );

        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        bus.register(Arc::new(move |signal: &Signal| match signal {
            Signal::InitialCandles { .. } => order_clone.lock().unwrap().push("initial"),
            Signal::UpdatedCandle { .. } => order_clone.lock().unwrap().push("updated"),
            _ => {}
        }));

        let market = Market::new("paper", "BTC/USD");
        manager
            .subscribe("sub-a", StreamKey::Candles(market, Timeframe::Minute1))
            .unwrap();

        // PaperExchange ticks every 250ms; give it several ticks so live trades race
        // against the async history seed before draining.
        tokio::time::sleep(Duration::from_millis(600)).await;
        bus.drain();

        let recorded = order.lock().unwrap();
        let first_initial = recorded.iter().position(|s| *s == "initial");
        let first_updated = recorded.iter().position(|s| *s == "updated");
        if let (Some(initial_idx), Some(updated_idx)) = (first_initial, first_updated) {
            assert!(
                initial_idx < updated_idx,
                "UpdatedCandle observed before InitialCandles: {recorded:?}"
            );
        }
    }

    #[tokio::test]
    async fn backpressure_high_water_mark_trips_once_queue_is_deep_enough() {
        let dir = tempfile::tempdir().unwrap();
        let exchange: Arc<dyn ExchangeCapability> = Arc::new(PaperExchange::new());
        let cache = Arc::new(FileCacheStore::new(dir.path()));
        let fetcher = Arc::new(CandleFetcher::new(exchange.clone(), cache, config()));
        let bus = Arc::new(SignalBus::new());
        let manager = TaskManager::new(
            "paper",
            config().default_history_bars,
            exchange,
            fetcher,
            bus.clone(),
            StreamRuntimeConfig {
                shutdown_grace_millis: 100,
                order_book_cadence_millis: None,
                backpressure_high_water_mark: Some(1),
            },
        );
        assert!(!manager.should_drop_for_backpressure());
        bus.enqueue(Signal::NewTrade {
            market: Market::new("paper", "BTC/USD"),
            trade: marketcore_core::domain::Trade {
                timestamp_millis: 0,
                price: 1.0,
                amount: 1.0,
                side: marketcore_core::domain::Side::Buy,
            },
        });
        bus.enqueue(Signal::NewTrade {
            market: Market::new("paper", "BTC/USD"),
            trade: marketcore_core::domain::Trade {
                timestamp_millis: 0,
                price: 1.0,
                amount: 1.0,
                side: marketcore_core::domain::Side::Buy,
            },
        });
        assert!(manager.should_drop_for_backpressure());
    }
}
