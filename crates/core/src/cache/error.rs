use thiserror::Error;

/// # Summary
/// 缓存域错误枚举，处理序列化、并发冲突及底层存储故障。
///
/// # Invariants
/// - 必须通过 `thiserror` 派生 `Error` trait。
#[derive(Error, Debug)]
pub enum CacheError {
    // 数据序列化失败
    #[error("serialize error: {0}")]
    Serialize(String),
    // 数据反序列化失败
    #[error("deserialize error: {0}")]
    Deserialize(String),
    // 底层存储引擎故障（磁盘 I/O 失败等）
    #[error("storage error: {0}")]
    Storage(String),
    // 缓存文件存在但内容损坏；调用方应当把缓存当作空的继续运行
    #[error("cache corrupt: {0}")]
    Corrupt(String),
    // 未知或未分类的错误
    #[error("unknown cache error: {0}")]
    Unknown(String),
}
