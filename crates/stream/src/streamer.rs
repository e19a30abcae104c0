use dashmap::DashMap;
use marketcore_core::common::{Market, StreamKey};
use marketcore_core::domain::{OrderBookSnapshot, Ticker, Trade};
use marketcore_core::exchange::port::ExchangeCapability;
use marketcore_core::stream::error::StreamError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const CHANNEL_CAPACITY: usize = 1024;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// # Summary
/// 单个长驻抓取任务的句柄：持有停止信号发送端与后台协程句柄。
struct TaskHandle {
    stop_tx: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

/// # Summary
/// 面向交易所的长驻流任务管理器：每个 `StreamKey` 对应一个后台协程，
/// 通过 broadcast 通道向任意多个订阅者扇出。
///
/// # Invariants
/// - 同一 `StreamKey` 至多一个在运行的后台协程；`ensure_started` 的插入必须是获取式。
/// - 协程只在收到 stop 信号或遭遇致命错误时退出；瞬时错误在内部重连重试。
pub struct Streamer {
    exchange: Arc<dyn ExchangeCapability>,
    trade_channels: DashMap<Market, broadcast::Sender<Trade>>,
    order_book_channels: DashMap<Market, broadcast::Sender<OrderBookSnapshot>>,
    ticker_channels: DashMap<Market, broadcast::Sender<Ticker>>,
    tasks: DashMap<StreamKey, TaskHandle>,
    // 任务进入致命失败状态时上报给 TaskManager 的通道
    fatal_tx: mpsc::UnboundedSender<(StreamKey, StreamError)>,
    // stop() 在强制 abort 之前，等待协程自行退出的宽限期
    shutdown_grace: Duration,
    // 订单簿快照节流窗口；None 表示逐条转发不做合并
    order_book_cadence: Option<Duration>,
}

impl Streamer {
    /// # Summary
    /// 构造一个新的 Streamer。
    ///
    /// # Arguments
    /// * `exchange`: 底层行情数据源驱动。
    /// * `fatal_tx`: 任务进入致命失败状态时的上报通道，通常由 TaskManager 持有接收端。
    /// * `shutdown_grace`: `stop()` 等待协程自行退出的宽限期，超时后强制 abort。
    /// * `order_book_cadence`: 订单簿节流窗口；`None` 表示每条快照都转发。
    pub fn new(
        exchange: Arc<dyn ExchangeCapability>,
        fatal_tx: mpsc::UnboundedSender<(StreamKey, StreamError)>,
        shutdown_grace: Duration,
        order_book_cadence: Option<Duration>,
    ) -> Self {
        Self {
            exchange,
            trade_channels: DashMap::new(),
            order_book_channels: DashMap::new(),
            ticker_channels: DashMap::new(),
            tasks: DashMap::new(),
            fatal_tx,
            shutdown_grace,
            order_book_cadence,
        }
    }

    /// # Summary
    /// 确保给定 `StreamKey` 对应的后台任务正在运行；已运行则是幂等的空操作。
    ///
    /// # Logic
    /// 1. 若 `tasks` 中已存在该 key，直接返回。
    /// 2. 否则按 key 的种类分发到对应的拉取协程。
    /// 3. 若在协程启动期间已有另一次调用抢先注册了该 key，abort 本次多余的协程。
    pub fn ensure_started(&self, key: &StreamKey) {
        if self.tasks.contains_key(key) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let join_handle = match key {
            StreamKey::Trades(market) => self.spawn_trades(market.clone(), stop_rx),
            StreamKey::OrderBook(market) => self.spawn_order_book(market.clone(), stop_rx),
            StreamKey::Ticker(market) => self.spawn_ticker(market.clone(), stop_rx),
            StreamKey::Candles(..) => {
                // Candles 没有独立的拉取协程，依赖 Trades；TaskManager 永远不会为此 key 调用本方法。
                return;
            }
        };
        match self.tasks.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => join_handle.abort(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TaskHandle { stop_tx, join_handle });
            }
        }
    }

    /// # Summary
    /// 请求停止给定 `StreamKey` 的后台任务，在 `shutdown_grace` 内等待其自行退出；
    /// 超时后强制 abort。
    pub async fn stop(&self, key: &StreamKey) {
        if let Some((_, handle)) = self.tasks.remove(key) {
            handle.stop_tx.send(true).ok();
            let abort_handle = handle.join_handle.abort_handle();
            if tokio::time::timeout(self.shutdown_grace, handle.join_handle).await.is_err() {
                warn!(stream_key = ?key, "task did not exit within shutdown grace, aborting");
                abort_handle.abort();
            }
        }
        match key {
            StreamKey::Trades(market) => {
                self.trade_channels.remove(market);
            }
            StreamKey::OrderBook(market) => {
                self.order_book_channels.remove(market);
            }
            StreamKey::Ticker(market) => {
                self.ticker_channels.remove(market);
            }
            StreamKey::Candles(..) => {}
        }
    }

    pub fn subscribe_trades(&self, market: &Market) -> broadcast::Receiver<Trade> {
        self.trade_channels
            .entry(market.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_order_book(&self, market: &Market) -> broadcast::Receiver<OrderBookSnapshot> {
        self.order_book_channels
            .entry(market.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_ticker(&self, market: &Market) -> broadcast::Receiver<Ticker> {
        self.ticker_channels
            .entry(market.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn spawn_trades(&self, market: Market, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let exchange = self.exchange.clone();
        let tx = self
            .trade_channels
            .entry(market.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let fatal_tx = self.fatal_tx.clone();
        let key = StreamKey::Trades(market.clone());
        tokio::spawn(async move {
            info!(market = ?market, "trade stream task started");
            loop {
                if *stop_rx.borrow() {
                    return;
                }
                let mut stream = match exchange.watch_trades(&market).await {
                    Ok(stream) => stream,
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "transient error opening trade stream, retrying");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                    Err(e) => {
                        fatal_tx.send((key.clone(), StreamError::Upstream(e))).ok();
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                return;
                            }
                        }
                        item = futures::StreamExt::next(&mut stream) => {
                            match item {
                                Some(trade) => {
                                    tx.send(trade).ok();
                                }
                                None => break,
                            }
                        }
                    }
                }
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        })
    }

    /// # Summary
    /// 订单簿拉取协程；当 `order_book_cadence` 设置时，在每个节流窗口内至多转发一次快照，
    /// 但窗口内最后一条快照始终会被送达，不会被静默丢弃。
    fn spawn_order_book(&self, market: Market, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let exchange = self.exchange.clone();
        let tx = self
            .order_book_channels
            .entry(market.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let fatal_tx = self.fatal_tx.clone();
        let key = StreamKey::OrderBook(market.clone());
        let cadence = self.order_book_cadence;
        tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    return;
                }
                let mut stream = match exchange.watch_order_book(&market).await {
                    Ok(stream) => stream,
                    Err(e) if e.is_retryable() => {
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                    Err(e) => {
                        fatal_tx.send((key.clone(), StreamError::Upstream(e))).ok();
                        return;
                    }
                };
                let mut pending: Option<OrderBookSnapshot> = None;
                let flush = tokio::time::sleep(Duration::from_secs(3600));
                tokio::pin!(flush);
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                if let Some(snapshot) = pending.take() {
                                    tx.send(snapshot).ok();
                                }
                                return;
                            }
                        }
                        () = &mut flush, if pending.is_some() => {
                            if let Some(snapshot) = pending.take() {
                                tx.send(snapshot).ok();
                            }
                        }
                        item = futures::StreamExt::next(&mut stream) => {
                            match item {
                                Some(snapshot) => match cadence {
                                    Some(window) => {
                                        if pending.is_none() {
                                            flush.as_mut().reset(tokio::time::Instant::now() + window);
                                        }
                                        pending = Some(snapshot);
                                    }
                                    None => {
                                        tx.send(snapshot).ok();
                                    }
                                },
                                None => break,
                            }
                        }
                    }
                }
                if let Some(snapshot) = pending.take() {
                    tx.send(snapshot).ok();
                }
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        })
    }

    fn spawn_ticker(&self, market: Market, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let exchange = self.exchange.clone();
        let tx = self
            .ticker_channels
            .entry(market.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let fatal_tx = self.fatal_tx.clone();
        let key = StreamKey::Ticker(market.clone());
        tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    return;
                }
                let mut stream = match exchange.watch_ticker(&market).await {
                    Ok(stream) => stream,
                    Err(e) if e.is_retryable() => {
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                    Err(e) => {
                        fatal_tx.send((key.clone(), StreamError::Upstream(e))).ok();
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                return;
                            }
                        }
                        item = futures::StreamExt::next(&mut stream) => {
                            match item {
                                Some(ticker) => {
                                    tx.send(ticker).ok();
                                }
                                None => break,
                            }
                        }
                    }
                }
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        })
    }
}
