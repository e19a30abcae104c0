use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use marketcore_cache::FileCacheStore;
use marketcore_core::common::{Market, StreamKey, Timeframe};
use marketcore_core::config::StreamConfig;
use marketcore_exchange::PaperExchange;
use marketcore_facade::Facade;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

const SUBSCRIBER_ID: &str = "marketcore-app-demo";
const SIGNAL_DRAIN_INTERVAL: Duration = Duration::from_millis(250);

/// # Summary
/// 参考宿主二进制：装配确定性的纸面交易所、文件缓存与 Facade，订阅几路演示行情，
/// 在固定间隔 drain 一次 SignalBus，直到收到 Ctrl+C。
///
/// # Logic
/// 1. 初始化双路日志（控制台 + 按日滚动文件）。
/// 2. 按 `config.toml` + `MARKETCORE_` 前缀环境变量层叠加载配置，缺省时退回 `Default`。
/// 3. 组装 Facade（自行持有并启动内部运行时）并订阅几路演示行情。
/// 4. 在主线程同步等待 Ctrl+C（由独立线程上的一次性运行时监听），期间定时 drain 信号。
///
/// # Invariants
/// `main` 本身绝不持有外层 tokio 运行时：`Facade::start`/`stop` 内部会 `block_on`
/// 自己的运行时，若 `main` 已经身处另一个运行时的 `block_on` 之中会直接 panic
/// （"Cannot start a runtime from within a runtime" 是按线程生效的限制）。
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let file_appender = tracing_appender::rolling::daily("logs", "marketcore-stream.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(
            std::io::stdout
                .with_max_level(tracing::Level::INFO)
                .and(non_blocking.with_max_level(tracing::Level::DEBUG)),
        )
        .with_ansi(true)
        .init();

    info!("marketcore-stream starting...");

    let config_file_path = std::path::Path::new("config.toml");
    let mut builder = config::Config::builder();
    if config_file_path.exists() {
        builder = builder.add_source(config::File::from(config_file_path).required(true));
    }
    builder = builder.add_source(config::Environment::with_prefix("MARKETCORE").separator("_"));
    let config_val = builder.build()?;

    let stream_config: StreamConfig = if config_file_path.exists() {
        config_val.try_deserialize()?
    } else {
        config_val.try_deserialize().unwrap_or_default()
    };
    info!(?stream_config, "configuration loaded");

    let exchange = Arc::new(PaperExchange::new());
    let cache = Arc::new(FileCacheStore::new(stream_config.cache.data_dir.clone()));
    let facade = Facade::new("paper", exchange, cache, stream_config.fetch.clone(), stream_config.stream.clone());
    facade.start()?;
    info!("facade started");

    let markets = [Market::new("paper", "BTC/USD"), Market::new("paper", "ETH/USD")];
    for market in &markets {
        facade.subscribe(SUBSCRIBER_ID, StreamKey::Candles(market.clone(), Timeframe::Minute1))?;
        facade.subscribe(SUBSCRIBER_ID, StreamKey::Ticker(market.clone()))?;
    }

    facade.register_signal(Arc::new(|signal| {
        tracing::debug!(?signal, "signal drained");
    }));

    let shutdown_rx = spawn_ctrl_c_listener();
    loop {
        match shutdown_rx.recv_timeout(SIGNAL_DRAIN_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let drained = facade.drain_signals();
                if drained > 0 {
                    tracing::trace!(drained, "drained signals");
                }
            }
        }
    }

    info!("shutdown signal received, stopping facade");
    for market in &markets {
        facade.unsubscribe(SUBSCRIBER_ID, StreamKey::Candles(market.clone(), Timeframe::Minute1));
        facade.unsubscribe(SUBSCRIBER_ID, StreamKey::Ticker(market.clone()));
    }
    facade.stop(Duration::from_millis(stream_config.stream.shutdown_grace_millis));
    warn!("marketcore-stream stopped");
    Ok(())
}

/// # Summary
/// 在独立线程上用一个最小的 current-thread 运行时等待 Ctrl+C，通过 std mpsc 通道
/// 把信号传回主线程。这个运行时与 Facade 内部的运行时完全隔离在不同的操作系统线程上，
/// 因此不会触发"运行时嵌套"限制。
fn spawn_ctrl_c_listener() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "failed to build ctrl-c listener runtime");
                return;
            }
        };
        runtime.block_on(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        });
        tx.send(()).ok();
    });
    rx
}
