use thiserror::Error;

/// # Summary
/// 交易所能力层错误枚举，区分可重试与不可重试的失败原因。
///
/// # Invariants
/// - `NetworkTransient` 与 `RateLimited` 必须可被调用方明确区分，以决定重试策略。
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    // 网络层瞬时错误，调用方应当退避重试
    #[error("transient network error: {0}")]
    NetworkTransient(String),
    // 触发交易所限频，可能携带服务端建议的等待时长
    #[error("rate limited, retry_after_millis={retry_after_millis:?}")]
    RateLimited { retry_after_millis: Option<u64> },
    // 鉴权失败，不重试
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    // 请求本身不合法，通常是调用方配置错误
    #[error("bad request: {0}")]
    BadRequest(String),
    // 交易所不支持该能力
    #[error("not supported: {0}")]
    NotSupported(String),
    // 未分类错误
    #[error("unknown exchange error: {0}")]
    Unknown(String),
}

impl ExchangeError {
    /// # Summary
    /// 该错误是否值得按退避策略重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkTransient(_) | ExchangeError::RateLimited { .. }
        )
    }
}
