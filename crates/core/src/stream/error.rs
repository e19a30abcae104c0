use crate::exchange::error::ExchangeError;
use thiserror::Error;

/// # Summary
/// Streamer 长驻任务的终止原因。区分可由 TaskManager 自愈的失败与致命失败。
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("upstream exchange error: {0}")]
    Upstream(#[from] ExchangeError),
    // 任务收到了 stop 信号，属于正常关闭，不是失败
    #[error("cancelled")]
    Cancelled,
}

impl StreamError {
    /// # Summary
    /// 该错误是否意味着流彻底死亡（而非可恢复的瞬时故障）。
    ///
    /// # Logic
    /// 只有鉴权失败与不支持才是致命的；网络瞬时错误与限频由任务内部重试，不会以
    /// `StreamError` 的形式冒泡到这里。
    pub fn is_fatal(&self) -> bool {
        match self {
            StreamError::Upstream(e) => {
                matches!(
                    e,
                    ExchangeError::AuthenticationFailed(_) | ExchangeError::NotSupported(_)
                )
            }
            StreamError::Cancelled => false,
        }
    }
}
