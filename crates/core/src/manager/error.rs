use crate::fetch::error::FetchError;
use thiserror::Error;

/// # Summary
/// TaskManager / Facade 层的统一错误类型。
#[derive(Error, Debug)]
pub enum TaskManagerError {
    // Facade 已经 stop()，拒绝新的 subscribe
    #[error("facade is stopped")]
    Stopped,
    #[error("historical fetch failed: {0}")]
    Fetch(#[from] FetchError),
    // 等待任务退出超过宽限期
    #[error("shutdown timed out waiting for stream {0:?}")]
    ShutdownTimeout(String),
    // 内部异步运行时初始化失败
    #[error("runtime initialization failed: {0}")]
    RuntimeInit(String),
}
