use marketcore_bus::{SignalBus, SignalHandler};
use marketcore_core::cache::port::CacheStore;
use marketcore_core::common::{StreamKey, Timeframe};
use marketcore_core::config::{FetchConfig, StreamRuntimeConfig};
use marketcore_core::domain::CandleSeries;
use marketcore_core::exchange::port::ExchangeCapability;
use marketcore_core::fetch::error::FetchError;
use marketcore_core::manager::error::TaskManagerError;
use marketcore_fetcher::CandleFetcher;
use marketcore_manager::TaskManager;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tracing::info;

/// # Summary
/// 组合根：把 Streamer/CandleFactory/CandleFetcher/TaskManager/SignalBus 接到一起，
/// 对外暴露一套同步方法，内部自行管理一套 tokio 运行时。
///
/// # Invariants
/// - `start()` 之前调用的 `subscribe`/`fetch_candles_once` 一律失败。
/// - `stop()` 之后任何 `subscribe` 调用返回 `TaskManagerError::Stopped`。
pub struct Facade {
    exchange_id: String,
    exchange: Arc<dyn ExchangeCapability>,
    cache: Arc<dyn CacheStore>,
    fetch_config: FetchConfig,
    stream_runtime: StreamRuntimeConfig,
    bus: Arc<SignalBus>,
    runtime: Mutex<Option<Runtime>>,
    handle: Mutex<Option<Handle>>,
    manager: Mutex<Option<Arc<TaskManager>>>,
    fetcher: Mutex<Option<Arc<CandleFetcher>>>,
}

impl Facade {
    pub fn new(
        exchange_id: impl Into<String>,
        exchange: Arc<dyn ExchangeCapability>,
        cache: Arc<dyn CacheStore>,
        fetch_config: FetchConfig,
        stream_runtime: StreamRuntimeConfig,
    ) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            exchange,
            cache,
            fetch_config,
            stream_runtime,
            bus: Arc::new(SignalBus::new()),
            runtime: Mutex::new(None),
            handle: Mutex::new(None),
            manager: Mutex::new(None),
            fetcher: Mutex::new(None),
        }
    }

    /// # Summary
    /// 启动内部异步运行时并装配 TaskManager。重复调用是幂等的。
    pub fn start(&self) -> Result<(), TaskManagerError> {
        let mut runtime_guard = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        if runtime_guard.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| TaskManagerError::RuntimeInit(e.to_string()))?;

        let fetcher = Arc::new(CandleFetcher::new(
            self.exchange.clone(),
            self.cache.clone(),
            self.fetch_config.clone(),
        ));
        let manager = runtime.block_on(async {
            TaskManager::new(
                self.exchange_id.clone(),
                self.fetch_config.default_history_bars,
                self.exchange.clone(),
                fetcher.clone(),
                self.bus.clone(),
                self.stream_runtime.clone(),
            )
        });

        *self.fetcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(fetcher);
        *self.manager.lock().unwrap_or_else(|e| e.into_inner()) = Some(manager);
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(runtime.handle().clone());
        *runtime_guard = Some(runtime);
        info!(exchange = %self.exchange_id, "facade started");
        Ok(())
    }

    /// # Summary
    /// 停止全部后台任务，drain 一次 SignalBus，并在宽限期内关闭内部运行时。
    ///
    /// # Logic
    /// 1. 通过 TaskManager 置位 stopped 并停止所有底层资源。
    /// 2. 对 SignalBus 做最后一次 drain，确保已入队的信号不丢失。
    /// 3. 在 `timeout` 内等待运行时上的后台任务退出；超时后仍强制关闭。
    pub fn stop(&self, timeout: Duration) {
        let manager = self.manager.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let (Some(manager), Some(handle)) = (manager, handle) {
            handle.block_on(manager.stop_all());
        }
        self.bus.drain();
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(runtime) = self.runtime.lock().unwrap_or_else(|e| e.into_inner()).take() {
            runtime.shutdown_timeout(timeout);
        }
        *self.fetcher.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn subscribe(&self, subscriber_id: &str, key: StreamKey) -> Result<(), TaskManagerError> {
        let manager = self.manager.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match (manager, handle) {
            (Some(manager), Some(handle)) => {
                let _guard = handle.enter();
                manager.subscribe(subscriber_id, key)
            }
            _ => Err(TaskManagerError::Stopped),
        }
    }

    pub fn unsubscribe(&self, subscriber_id: &str, key: StreamKey) {
        let manager = self.manager.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let (Some(manager), Some(handle)) = (manager, handle) {
            handle.block_on(manager.unsubscribe(subscriber_id, key));
        }
    }

    /// # Summary
    /// 不建立任何长驻订阅，仅同步地拉取 `[since_millis, now)` 的历史 K 线并返回。
    pub fn fetch_candles_once(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_millis: i64,
    ) -> Result<CandleSeries, FetchError> {
        let runtime_guard = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let fetcher_guard = self.fetcher.lock().unwrap_or_else(|e| e.into_inner());
        let (Some(runtime), Some(fetcher)) = (runtime_guard.as_ref(), fetcher_guard.as_ref()) else {
            return Err(FetchError::Exchange(
                marketcore_core::exchange::error::ExchangeError::Unknown("facade is not started".to_string()),
            ));
        };
        let now_millis = chrono::Utc::now().timestamp_millis();
        runtime.block_on(fetcher.fetch(&self.exchange_id, symbol, timeframe, since_millis, now_millis))
    }

    /// # Summary
    /// 注册一个信号订阅者，返回其句柄供后续注销使用。
    pub fn register_signal(&self, handler: SignalHandler) -> u64 {
        self.bus.register(handler)
    }

    pub fn deregister_signal(&self, id: u64) {
        self.bus.deregister(id);
    }

    /// # Summary
    /// 手动触发一次 SignalBus drain（通常由宿主程序在固定间隔内调用）。
    pub fn drain_signals(&self) -> usize {
        self.bus.drain()
    }
}
