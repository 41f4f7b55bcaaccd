use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use super::{KvStore, Versioned, expiry_millis, now_millis};
use crate::domain::error::StoreError;

struct Entry {
    value: String,
    version: u64,
    expires_at: Option<i64>,
}

impl Entry {
    fn live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

/// プロセス内ストア（テスト・単体実行用）
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(entries: &HashMap<String, Entry>, key: &str, now: i64) -> u64 {
        entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.version)
            .unwrap_or(0)
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let now = now_millis();
        let entries = self.entries.lock();
        Ok(entries.get(key).filter(|e| e.live(now)).map(|e| Versioned {
            value: e.value.clone(),
            version: e.version,
        }))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let now = now_millis();
        let mut entries = self.entries.lock();
        let next = Self::current_version(&entries, key, now) + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version: next,
                expires_at: expiry_millis(ttl),
            },
        );
        Ok(next)
    }

    fn set_if_version(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        let now = now_millis();
        let mut entries = self.entries.lock();
        let current = Self::current_version(&entries, key, now);
        if current != expected {
            return Ok(None);
        }
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version: next,
                expires_at: expiry_millis(ttl),
            },
        );
        Ok(Some(next))
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = now_millis();
        let mut entries = self.entries.lock();
        Ok(entries.remove(key).is_some_and(|e| e.live(now)))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = now_millis();
        let entries = self.entries.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.live(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.set("job:1", "a", None).unwrap(), 1);
        assert_eq!(store.set("job:1", "b", None).unwrap(), 2);
        let v = store.get("job:1").unwrap().unwrap();
        assert_eq!(v.value, "b");
        assert_eq!(v.version, 2);
        assert!(store.delete("job:1").unwrap());
        assert!(store.get("job:1").unwrap().is_none());
    }

    #[test]
    fn conditional_write() {
        let store = MemoryStore::new();
        assert_eq!(store.set_if_version("k", 0, "v1", None).unwrap(), Some(1));
        // 既に存在するので新規作成は失敗
        assert_eq!(store.set_if_version("k", 0, "v2", None).unwrap(), None);
        assert_eq!(store.set_if_version("k", 1, "v2", None).unwrap(), Some(2));
        assert_eq!(store.set_if_version("k", 1, "v3", None).unwrap(), None);
        assert_eq!(store.get("k").unwrap().unwrap().value, "v2");
    }

    #[test]
    fn expired_entries_are_invisible() {
        let store = MemoryStore::new();
        store.set("voice:1", "x", Some(Duration::ZERO)).unwrap();
        store.set("voice:2", "y", None).unwrap();
        assert!(store.get("voice:1").unwrap().is_none());
        assert_eq!(store.keys("voice:").unwrap(), vec!["voice:2".to_string()]);
        // 期限切れキーは新規作成扱い
        assert_eq!(store.set_if_version("voice:1", 0, "z", None).unwrap(), Some(1));
    }

    #[test]
    fn purge_removes_expired() {
        let store = MemoryStore::new();
        store.set("a", "1", Some(Duration::ZERO)).unwrap();
        store.set("b", "2", None).unwrap();
        assert_eq!(store.purge_expired().unwrap(), 1);
    }
}
