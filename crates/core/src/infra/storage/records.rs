use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::KvStore;
use crate::domain::error::StoreError;
use crate::domain::job::Job;
use crate::domain::voice::VoiceProfile;
use crate::infra::artifacts::ArtifactStore;

const JOB_PREFIX: &str = "job:";
const VOICE_PREFIX: &str = "voice:";
const VOICE_ARTIFACT_PREFIX: &str = "voice_artifact:";

/// 条件付き更新の最大試行回数
const MAX_CAS_ROUNDS: usize = 8;

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: e.to_string(),
    })
}

// ─── Jobs ────────────────────────────────────────────────────────

/// ジョブレコードのリポジトリ（`job:` 名前空間）
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn KvStore>,
    ttl: Option<Duration>,
}

impl JobRepository {
    pub fn new(store: Arc<dyn KvStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    fn key(job_id: &str) -> String {
        format!("{JOB_PREFIX}{job_id}")
    }

    /// ジョブと現在のバージョンを取得
    pub fn get(&self, job_id: &str) -> Result<Option<(Job, u64)>, StoreError> {
        let key = Self::key(job_id);
        match self.store.get(&key)? {
            Some(v) => Ok(Some((decode(&key, &v.value)?, v.version))),
            None => Ok(None),
        }
    }

    /// 新規作成。同じ ID が既にあれば false。
    pub fn insert(&self, job: &Job) -> Result<bool, StoreError> {
        let key = Self::key(&job.id);
        let raw = encode(&key, job)?;
        Ok(self.store.set_if_version(&key, 0, &raw, self.ttl)?.is_some())
    }

    /// `expected` バージョンのときだけ置き換える。負けたら None。
    pub fn replace(&self, job: &Job, expected: u64) -> Result<Option<u64>, StoreError> {
        let key = Self::key(&job.id);
        let raw = encode(&key, job)?;
        self.store.set_if_version(&key, expected, &raw, self.ttl)
    }

    pub fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .keys(JOB_PREFIX)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(JOB_PREFIX).map(str::to_string))
            .collect())
    }
}

// ─── Voice profiles ──────────────────────────────────────────────

/// VoiceProfile のリポジトリ。
///
/// レコード本体は TTL 付きで `voice:` に、アーティファクトの所在は
/// TTL なしで `voice_artifact:` に置く。レコードだけが期限切れになった
/// アーティファクトは `reap_orphans` で回収する。
#[derive(Clone)]
pub struct VoiceProfileRepository {
    store: Arc<dyn KvStore>,
    artifacts: ArtifactStore,
}

impl VoiceProfileRepository {
    pub fn new(store: Arc<dyn KvStore>, artifacts: ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    fn key(id: &str) -> String {
        format!("{VOICE_PREFIX}{id}")
    }

    fn artifact_key(id: &str) -> String {
        format!("{VOICE_ARTIFACT_PREFIX}{id}")
    }

    pub fn get(&self, id: &str) -> Result<Option<VoiceProfile>, StoreError> {
        let key = Self::key(id);
        match self.store.get(&key)? {
            Some(v) => Ok(Some(decode(&key, &v.value)?)),
            None => Ok(None),
        }
    }

    /// プロファイルを確定する。アーティファクトは既に `artifact_path` にある前提。
    /// レコードの書き込みに失敗したらアーティファクトを消し、どちらも残さない。
    pub fn create(&self, profile: &VoiceProfile) -> Result<(), StoreError> {
        let result = self.write_new(profile);
        if result.is_err() {
            if let Err(e) = self.artifacts.remove(&profile.artifact_path) {
                log::error!(
                    "VoiceProfile {} のアーティファクト後始末に失敗: {e}",
                    profile.id
                );
            }
            // 索引だけ残った場合も消す。残っても reap_orphans が拾う。
            if let Err(e) = self.store.delete(&Self::artifact_key(&profile.id)) {
                log::warn!(
                    "VoiceProfile {} の索引を削除できません: {e}",
                    profile.id
                );
            }
        }
        result
    }

    fn write_new(&self, profile: &VoiceProfile) -> Result<(), StoreError> {
        let index_key = Self::artifact_key(&profile.id);
        let path = profile.artifact_path.to_string_lossy().to_string();
        self.store.set(&index_key, &path, None)?;

        let key = Self::key(&profile.id);
        let raw = encode(&key, profile)?;
        let ttl = Some(Duration::from_secs(profile.ttl_secs));
        match self.store.set_if_version(&key, 0, &raw, ttl)? {
            Some(_) => Ok(()),
            None => Err(StoreError::Corrupt {
                key,
                detail: "voice profile id already exists".into(),
            }),
        }
    }

    /// 利用回数と最終利用時刻を記録する（条件付き書き込み）。
    /// 残り TTL は作成時刻から計算し直すので延長されない。
    pub fn record_use(&self, id: &str) -> Result<Option<VoiceProfile>, StoreError> {
        let key = Self::key(id);
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(current) = self.store.get(&key)? else {
                return Ok(None);
            };
            let mut profile: VoiceProfile = decode(&key, &current.value)?;
            let now = chrono::Utc::now();
            profile.record_use(now);
            let remaining = (profile.expires_at() - now).to_std().unwrap_or(Duration::ZERO);
            let raw = encode(&key, &profile)?;
            if self
                .store
                .set_if_version(&key, current.version, &raw, Some(remaining))?
                .is_some()
            {
                return Ok(Some(profile));
            }
        }
        log::warn!("VoiceProfile {id} の利用記録が競合で反映されませんでした");
        self.get(id)
    }

    /// 明示削除。アーティファクト → 索引 → レコードの順に消す。
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.artifact_path(id)?;
        if let Some(path) = &path {
            self.artifacts.remove(path)?;
        }
        self.store.delete(&Self::artifact_key(id))?;
        let existed = self.store.delete(&Self::key(id))?;
        Ok(existed || path.is_some())
    }

    fn artifact_path(&self, id: &str) -> Result<Option<PathBuf>, StoreError> {
        if let Some(v) = self.store.get(&Self::artifact_key(id))? {
            return Ok(Some(PathBuf::from(v.value)));
        }
        Ok(self.get(id)?.map(|p| p.artifact_path))
    }

    pub fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .keys(VOICE_PREFIX)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(VOICE_PREFIX).map(str::to_string))
            .collect())
    }

    /// TTL で消えたプロファイルのアーティファクトを回収する。回収数を返す。
    pub fn reap_orphans(&self) -> Result<usize, StoreError> {
        let mut reaped = 0;
        for index_key in self.store.keys(VOICE_ARTIFACT_PREFIX)? {
            let Some(id) = index_key.strip_prefix(VOICE_ARTIFACT_PREFIX) else {
                continue;
            };
            if self.store.get(&Self::key(id))?.is_some() {
                continue;
            }
            if let Some(v) = self.store.get(&index_key)? {
                self.artifacts.remove(&PathBuf::from(&v.value))?;
            }
            self.store.delete(&index_key)?;
            log::info!("期限切れ VoiceProfile {id} のアーティファクトを回収");
            reaped += 1;
        }
        Ok(reaped)
    }
}
