mod memory;
mod records;
mod repository;

pub use memory::MemoryStore;
pub use records::{JobRepository, VoiceProfileRepository};
pub use repository::SqliteStore;

use std::time::Duration;

use crate::domain::error::StoreError;

/// バージョン付きの値。version 0 は「存在しない」を表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// TTL 付きキー・バリューストア。
///
/// ジョブと VoiceProfile は名前空間の異なるキーで同じストアに載る。
/// 状態遷移は `set_if_version` による条件付き書き込みで行い、上書きはしない。
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// 無条件書き込み。新しいバージョンを返す。
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError>;

    /// 現在のバージョンが `expected` の場合だけ書き込む。
    /// 不一致なら `Ok(None)`。`expected == 0` は新規作成。
    fn set_if_version(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError>;

    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// プレフィックスに一致する有効なキー
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// 期限切れエントリを物理削除する
    fn purge_expired(&self) -> Result<usize, StoreError>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn expiry_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| now_millis().saturating_add(t.as_millis() as i64))
}
