use std::path::Path;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use thiserror::Error;
use tracing::info;

use crate::types::Candle;

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candles (
    symbol     TEXT NOT NULL,
    t_start_ms INTEGER NOT NULL,
    t_end_ms   INTEGER NOT NULL,
    open       REAL NOT NULL,
    high       REAL NOT NULL,
    low        REAL NOT NULL,
    close      REAL NOT NULL,
    volume     REAL NOT NULL,
    PRIMARY KEY (symbol, t_start_ms)
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Durable sealed-candle history.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert or replace the candle keyed by (symbol, t_start_ms).
    async fn upsert(&self, candle: &Candle) -> Result<(), StoreError>;

    /// Up to `limit` most recent candles of `symbol`, ascending by start.
    async fn read_recent(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError>;
}

/// [`CandleStore`] over a pooled SQLite file.
pub struct SqliteCandleStore {
    pool: DbPool,
}

impl SqliteCandleStore {
    /// Open the database at `path`, creating the file, its parent directory
    /// and the `candles` table when missing.
    pub fn open(path: &Path, max_size: u32) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder().max_size(max_size).build(manager)?;
        pool.get()?.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "candle store opened");
        Ok(Self { pool })
    }
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn upsert(&self, candle: &Candle) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let candle = candle.clone();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = pool.get()?;
            conn.execute(
                "INSERT OR REPLACE INTO candles
                     (symbol, t_start_ms, t_end_ms, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    candle.symbol,
                    candle.t_start_ms,
                    candle.t_end_ms,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn read_recent(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError> {
        let pool = self.pool.clone();
        let symbol = symbol.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<Candle>, StoreError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, t_start_ms, t_end_ms, open, high, low, close, volume
                 FROM candles
                 WHERE symbol = ?1
                 ORDER BY t_start_ms DESC
                 LIMIT ?2",
            )?;

            let mut candles: Vec<Candle> = stmt
                .query_map(params![symbol, limit as i64], |row| {
                    Ok(Candle {
                        symbol: row.get(0)?,
                        t_start_ms: row.get(1)?,
                        t_end_ms: row.get(2)?,
                        open: row.get(3)?,
                        high: row.get(4)?,
                        low: row.get(5)?,
                        close: row.get(6)?,
                        volume: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            // Reverse to chronological order.
            candles.reverse();
            Ok(candles)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(t: i64, close: f64) -> Candle {
        let mut c = Candle::open_at("btcusdt", t, 5000, 100.0, 1.0);
        c.merge(close, 1.0);
        c
    }

    fn open_temp() -> (tempfile::TempDir, SqliteCandleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCandleStore::open(&dir.path().join("data").join("crypto.db"), 2).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_key() {
        let (_dir, store) = open_temp();
        let c = candle(0, 101.0);
        store.upsert(&c).await.unwrap();
        store.upsert(&c).await.unwrap();

        let mut revised = c.clone();
        revised.close = 102.0;
        store.upsert(&revised).await.unwrap();

        let rows = store.read_recent("btcusdt", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 102.0);
    }

    #[tokio::test]
    async fn read_recent_is_ascending_and_limited() {
        let (_dir, store) = open_temp();
        for i in [3, 0, 4, 1, 2] {
            store.upsert(&candle(i * 5000, 100.0 + i as f64)).await.unwrap();
        }
        let other = Candle::open_at("ethusdt", 0, 5000, 1.0, 1.0);
        store.upsert(&other).await.unwrap();

        let rows = store.read_recent("btcusdt", 3).await.unwrap();
        let starts: Vec<i64> = rows.iter().map(|c| c.t_start_ms).collect();
        assert_eq!(starts, vec![10_000, 15_000, 20_000]);
        assert!(rows.iter().all(|c| c.symbol == "btcusdt"));
        assert_eq!(rows[2].t_end_ms, 25_000);

        assert!(store.read_recent("solusdt", 10).await.unwrap().is_empty());
    }
}
