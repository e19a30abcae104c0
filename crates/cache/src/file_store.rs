use async_trait::async_trait;
use dashmap::DashMap;
use marketcore_core::cache::error::CacheError;
use marketcore_core::cache::port::{CacheKey, CacheLock, CacheMetadata, CacheStore};
use marketcore_core::domain::{Candle, CandleSeries};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const ROWS_HEADER: &str = "timestamp_seconds,open,high,low,close,volume";

/// # Summary
/// 基于本地文件系统的 OHLCV 缓存实现：行数据落在 CSV，元数据落在同名 `.meta.json`。
///
/// # Invariants
/// - 同一 `CacheKey` 的读写通过 `locks` 中的作用域互斥锁串行化。
/// - `locks` 的插入必须是获取式 (get-or-insert)，避免同一 key 下竞争出两把锁。
pub struct FileCacheStore {
    data_dir: PathBuf,
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl FileCacheStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: DashMap::new(),
        }
    }

    fn rows_path(&self, key: &CacheKey) -> PathBuf {
        self.data_dir.join(format!("{}.csv", key.file_stem()))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.data_dir.join(format!("{}.meta.json", key.file_stem()))
    }
}

fn format_row(candle: &Candle) -> String {
    format!(
        "{},{},{},{},{},{}",
        candle.timestamp_seconds, candle.open, candle.high, candle.low, candle.close, candle.volume
    )
}

fn parse_row(line: &str) -> Result<Candle, CacheError> {
    let mut fields = line.split(',');
    let mut next = |name: &str| -> Result<&str, CacheError> {
        fields
            .next()
            .ok_or_else(|| CacheError::Corrupt(format!("missing field {name}")))
    };
    let timestamp_seconds = next("timestamp_seconds")?
        .parse::<i64>()
        .map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let open = next("open")?.parse::<f64>().map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let high = next("high")?.parse::<f64>().map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let low = next("low")?.parse::<f64>().map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let close = next("close")?.parse::<f64>().map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let volume = next("volume")?.parse::<f64>().map_err(|e| CacheError::Corrupt(e.to_string()))?;
    Ok(Candle {
        timestamp_seconds,
        open,
        high,
        low,
        close,
        volume,
    })
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn load(&self, key: &CacheKey) -> Result<CandleSeries, CacheError> {
        let path = self.rows_path(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CandleSeries::new()),
            Err(e) => return Err(CacheError::Storage(e.to_string())),
        };
        let mut lines = contents.lines();
        match lines.next() {
            Some(header) if header == ROWS_HEADER => {}
            Some(_) => return Err(CacheError::Corrupt("unexpected header".to_string())),
            None => return Ok(CandleSeries::new()),
        }
        let rows = lines
            .filter(|line| !line.trim().is_empty())
            .map(parse_row)
            .collect::<Result<Vec<Candle>, CacheError>>()?;
        Ok(CandleSeries::from_rows(rows))
    }

    async fn save(
        &self,
        key: &CacheKey,
        series: &CandleSeries,
        metadata: CacheMetadata,
    ) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;

        let mut rows_body = String::from(ROWS_HEADER);
        rows_body.push('\n');
        for candle in series.as_slice() {
            rows_body.push_str(&format_row(candle));
            rows_body.push('\n');
        }
        let rows_path = self.rows_path(key);
        let rows_tmp = rows_path.with_extension("csv.tmp");
        tokio::fs::write(&rows_tmp, rows_body)
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        tokio::fs::rename(&rows_tmp, &rows_path)
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;

        let meta_body = serde_json::to_vec_pretty(&metadata).map_err(|e| CacheError::Serialize(e.to_string()))?;
        let meta_path = self.meta_path(key);
        let meta_tmp = meta_path.with_extension("meta.json.tmp");
        tokio::fs::write(&meta_tmp, meta_body)
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        tokio::fs::rename(&meta_tmp, &meta_path)
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn lock_for(&self, key: &CacheKey) -> CacheLock {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        CacheLock::new(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketcore_core::common::Timeframe;

    fn candle(ts: i64) -> Candle {
        Candle {
            timestamp_seconds: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        }
    }

    fn key() -> CacheKey {
        CacheKey::new("coinbase", "BTC/USD", Timeframe::Minute1)
    }

    #[tokio::test]
    async fn load_missing_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        let series = store.load(&key()).await.unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        let series = CandleSeries::from_rows(vec![candle(0), candle(60), candle(120)]);
        let metadata = CacheMetadata {
            exchange: "coinbase".to_string(),
            symbol: "BTC/USD".to_string(),
            timeframe: "1m".to_string(),
            last_written_at_millis: 1_000,
        };
        store.save(&key(), &series, metadata).await.unwrap();
        let loaded = store.load(&key()).await.unwrap();
        assert_eq!(loaded.as_slice(), series.as_slice());
    }

    #[tokio::test]
    async fn save_overwrites_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        let first = CandleSeries::from_rows(vec![candle(0), candle(60)]);
        store
            .save(
                &key(),
                &first,
                CacheMetadata {
                    exchange: "coinbase".to_string(),
                    symbol: "BTC/USD".to_string(),
                    timeframe: "1m".to_string(),
                    last_written_at_millis: 1,
                },
            )
            .await
            .unwrap();
        let second = CandleSeries::from_rows(vec![candle(120)]);
        store
            .save(
                &key(),
                &second,
                CacheMetadata {
                    exchange: "coinbase".to_string(),
                    symbol: "BTC/USD".to_string(),
                    timeframe: "1m".to_string(),
                    last_written_at_millis: 2,
                },
            )
            .await
            .unwrap();
        let loaded = store.load(&key()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.first().unwrap().timestamp_seconds, 120);
    }

    #[tokio::test]
    async fn load_rejects_corrupt_row() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("coinbase_BTC-USD_1m.csv"),
            "timestamp_seconds,open,high,low,close,volume\nnot-a-number,1,2,0.5,1.5,10\n",
        )
        .await
        .unwrap();
        let store = FileCacheStore::new(dir.path());
        let result = store.load(&key()).await;
        assert!(matches!(result, Err(CacheError::Corrupt(_))));
    }

    #[tokio::test]
    async fn lock_for_same_key_serializes_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCacheStore::new(dir.path()));
        let lock = store.lock_for(&key()).await;
        let store_clone = store.clone();
        let second = tokio::spawn(async move {
            let _lock = store_clone.lock_for(&key()).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        drop(lock);
        second.await.unwrap();
    }
}
