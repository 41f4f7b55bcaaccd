use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{JobFailure, StoreError};
use crate::infra::storage::KvStore;

const DLQ_PREFIX: &str = "dlq:";

/// リトライを使い切ったジョブの記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub error: JobFailure,
    pub failed_at: DateTime<Utc>,
    /// 記録時点での失敗したエンジン呼び出し数
    pub failures: u32,
}

/// デッドレターの置き場。外部の再実行ツールは `list` で読む。
pub trait DeadLetterSink: Send + Sync {
    fn append(&self, entry: DeadLetterEntry) -> Result<(), StoreError>;

    /// `since` 以降に記録されたエントリ（古い順）
    fn list(&self, since: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>, StoreError>;

    fn get(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StoreError>;

    fn remove(&self, job_id: &str) -> Result<bool, StoreError>;
}

/// KvStore 上のデッドレター（`dlq:` 名前空間、保持期間つき）
pub struct StoreDeadLetterSink {
    store: Arc<dyn KvStore>,
    retention: Duration,
}

impl StoreDeadLetterSink {
    pub fn new(store: Arc<dyn KvStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    fn key(job_id: &str) -> String {
        format!("{DLQ_PREFIX}{job_id}")
    }

    fn decode(key: &str, raw: &str) -> Result<DeadLetterEntry, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            detail: e.to_string(),
        })
    }
}

impl DeadLetterSink for StoreDeadLetterSink {
    fn append(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        let key = Self::key(&entry.job_id);
        let raw = serde_json::to_string(&entry).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            detail: e.to_string(),
        })?;
        self.store.set(&key, &raw, Some(self.retention))?;
        log::warn!(
            "ジョブ {} をデッドレターに記録: {}",
            entry.job_id,
            entry.error
        );
        Ok(())
    }

    fn list(&self, since: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut entries = Vec::new();
        for key in self.store.keys(DLQ_PREFIX)? {
            // keys と get の間に期限切れになったものは飛ばす
            let Some(v) = self.store.get(&key)? else {
                continue;
            };
            let entry = Self::decode(&key, &v.value)?;
            if entry.failed_at >= since {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.failed_at);
        Ok(entries)
    }

    fn get(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StoreError> {
        let key = Self::key(job_id);
        match self.store.get(&key)? {
            Some(v) => Ok(Some(Self::decode(&key, &v.value)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        self.store.delete(&Self::key(job_id))
    }
}
