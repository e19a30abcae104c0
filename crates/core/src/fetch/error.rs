use crate::cache::error::CacheError;
use crate::exchange::error::ExchangeError;
use thiserror::Error;

/// # Summary
/// 历史 K 线拉取器的错误枚举。
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    // 某一页的时间游标未能前进，拉取被中止以避免死循环
    #[error("pagination stalled for {symbol} at cursor {cursor_millis}")]
    PaginationStalled { symbol: String, cursor_millis: i64 },
}
