use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// クローンジョブの成功で作られる再利用可能な声
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub id: String,
    /// このプロファイルを作ったクローンジョブ
    pub job_id: String,
    /// 参照音声アーティファクト
    pub artifact_path: PathBuf,
    /// 自動導出された書き起こし
    pub transcript: Option<String>,
    pub language: String,
    pub created_at: DateTime<Utc>,
    /// 保持期間（秒）。ストアの TTL と同じ値。
    pub ttl_secs: u64,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl VoiceProfile {
    pub fn new(
        job_id: String,
        artifact_path: PathBuf,
        transcript: Option<String>,
        language: String,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id,
            artifact_path,
            transcript,
            language,
            created_at: now,
            ttl_secs,
            usage_count: 0,
            last_used_at: None,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used_at = Some(now);
    }
}
