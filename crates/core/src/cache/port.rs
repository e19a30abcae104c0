use crate::cache::error::CacheError;
use crate::common::Timeframe;
use crate::domain::CandleSeries;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

/// # Summary
/// 标识磁盘缓存中一个 `(exchange, symbol, timeframe)` 条目。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CacheKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            timeframe,
        }
    }

    /// # Summary
    /// 生成不含扩展名的文件基名：`<exchange>_<safeSymbol>_<timeframe>`。
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}",
            self.exchange,
            self.symbol.replace('/', "-"),
            self.timeframe
        )
    }
}

/// # Summary
/// 行数据文件旁的元数据 sidecar，不与行数据共享字段。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
    pub last_written_at_millis: i64,
}

/// # Summary
/// `lock_for` 返回的作用域互斥句柄；随着其被 drop，锁自动释放。
pub struct CacheLock {
    _guard: OwnedMutexGuard<()>,
}

impl CacheLock {
    pub fn new(guard: OwnedMutexGuard<()>) -> Self {
        Self { _guard: guard }
    }
}

/// # Summary
/// OHLCV 磁盘缓存的存取契约。
///
/// # Invariants
/// - 行数据与元数据必须落在两个独立文件中。
/// - 同一 `key` 下的读写必须通过 `lock_for` 串行化；不同 `key` 之间互不阻塞。
/// - 不存在的缓存不是错误，`load` 返回空序列。
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// # Summary
    /// 加载指定 key 的缓存序列，按时间戳升序排列。
    async fn load(&self, key: &CacheKey) -> Result<CandleSeries, CacheError>;

    /// # Summary
    /// 原子性地整体替换指定 key 的行数据与元数据。
    async fn save(
        &self,
        key: &CacheKey,
        series: &CandleSeries,
        metadata: CacheMetadata,
    ) -> Result<(), CacheError>;

    /// # Summary
    /// 获取指定 key 的作用域互斥锁，持有期间其它对同一 key 的 `lock_for` 调用将排队等待。
    async fn lock_for(&self, key: &CacheKey) -> CacheLock;
}
