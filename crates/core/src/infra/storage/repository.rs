use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::{KvStore, Versioned, expiry_millis, now_millis};
use crate::domain::error::StoreError;

/// SQLite ストレージ（kv テーブル）
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 新規接続（ファイルパス指定）
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::unavailable(format!("DBディレクトリ作成に失敗: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::unavailable(format!("DB接続に失敗: {e}")))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| StoreError::unavailable(format!("busy_timeout 設定失敗: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// in-memory DB（テスト用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::unavailable(format!("in-memory DB作成に失敗: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// スキーママイグレーション
    fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS kv (
                    key        TEXT PRIMARY KEY,
                    value      TEXT NOT NULL,
                    version    INTEGER NOT NULL,
                    expires_at INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_kv_expires
                    ON kv(expires_at);
                ",
            )
            .map_err(|e| StoreError::unavailable(format!("マイグレーション失敗: {e}")))?;
        Ok(())
    }

    fn live_version(conn: &Connection, key: &str, now: i64) -> rusqlite::Result<u64> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM kv
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0) as u64)
    }

    fn upsert(
        conn: &Connection,
        key: &str,
        value: &str,
        version: u64,
        expires_at: Option<i64>,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO kv (key, value, version, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = excluded.version,
                expires_at = excluded.expires_at",
            params![key, value, version as i64, expires_at],
        )?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value, version FROM kv
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now_millis()],
            |row| {
                let version: i64 = row.get(1)?;
                Ok(Versioned {
                    value: row.get(0)?,
                    version: version as u64,
                })
            },
        )
        .optional()
        .map_err(|e| StoreError::unavailable(format!("読み取り失敗 [{key}]: {e}")))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::unavailable(format!("トランザクション開始失敗: {e}")))?;
        let next = Self::live_version(&tx, key, now_millis())
            .map_err(|e| StoreError::unavailable(format!("バージョン取得失敗 [{key}]: {e}")))?
            + 1;
        Self::upsert(&tx, key, value, next, expiry_millis(ttl))
            .map_err(|e| StoreError::unavailable(format!("書き込み失敗 [{key}]: {e}")))?;
        tx.commit()
            .map_err(|e| StoreError::unavailable(format!("コミット失敗 [{key}]: {e}")))?;
        Ok(next)
    }

    fn set_if_version(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::unavailable(format!("トランザクション開始失敗: {e}")))?;
        let current = Self::live_version(&tx, key, now_millis())
            .map_err(|e| StoreError::unavailable(format!("バージョン取得失敗 [{key}]: {e}")))?;
        if current != expected {
            return Ok(None);
        }
        let next = current + 1;
        Self::upsert(&tx, key, value, next, expiry_millis(ttl))
            .map_err(|e| StoreError::unavailable(format!("条件付き書き込み失敗 [{key}]: {e}")))?;
        tx.commit()
            .map_err(|e| StoreError::unavailable(format!("コミット失敗 [{key}]: {e}")))?;
        Ok(Some(next))
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
            )
            .map_err(|e| StoreError::unavailable(format!("削除失敗 [{key}]: {e}")))?;
        Ok(affected > 0)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                   AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )
            .map_err(|e| StoreError::unavailable(format!("クエリ準備失敗: {e}")))?;
        let keys = stmt
            .query_map(params![prefix, now_millis()], |row| row.get(0))
            .map_err(|e| StoreError::unavailable(format!("クエリ実行失敗: {e}")))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| StoreError::unavailable(format!("行読み取り失敗: {e}")))?;
        Ok(keys)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_millis()],
            )
            .map_err(|e| StoreError::unavailable(format!("期限切れ削除失敗: {e}")))?;
        Ok(affected)
    }
}
