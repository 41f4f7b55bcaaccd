use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::engine::{EngineKind, QualityProfile};
use super::error::{ErrorKind, JobFailure};

/// ジョブ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Synthesize,
    Clone,
    SynthesizeWithClone,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synthesize => "synthesize",
            Self::Clone => "clone",
            Self::SynthesizeWithClone => "synthesize_with_clone",
        }
    }

    pub fn needs_text(&self) -> bool {
        matches!(self, Self::Synthesize | Self::SynthesizeWithClone)
    }

    pub fn needs_reference_audio(&self) -> bool {
        matches!(self, Self::Clone | Self::SynthesizeWithClone)
    }
}

/// ジョブ状態
///
/// 前進のみ: Pending → Enqueued → Running → {Completed | Failed}。
/// 例外はリトライ経路 Running → Pending と、その再クレーム Pending → Running。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Enqueued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 状態遷移表
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Enqueued)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Enqueued, Running)
                | (Enqueued, Cancelled)
                | (Enqueued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Cancelled)
        )
    }
}

/// 合成に使う声の指定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum VoiceRef {
    /// エンジン組み込みのプリセット
    Preset(String),
    /// クローン済み VoiceProfile
    Profile(String),
}

/// 参照音声（作成時にプローブ済み）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceAudio {
    pub path: PathBuf,
    pub duration_ms: u32,
    pub sample_rate: u32,
}

/// ジョブ入力。作成後は Manager 以外変更しない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInputs {
    pub text: Option<String>,
    pub language: String,
    pub voice: Option<VoiceRef>,
    pub reference_audio: Option<ReferenceAudio>,
    pub reference_transcript: Option<String>,
    pub quality: QualityProfile,
}

/// 外部 API 層から渡される投入リクエスト
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// フィーチャーフラグ判定に使う安定した呼び出し元 ID
    pub caller_id: String,
    pub text: Option<String>,
    pub language: Option<String>,
    pub voice: Option<VoiceRef>,
    pub reference_audio: Option<PathBuf>,
    pub reference_transcript: Option<String>,
    #[serde(default)]
    pub quality: QualityProfile,
}

/// エンジン呼び出し1回分の監査記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineAttempt {
    /// 1 始まりの試行番号（フォールバックは同じ番号を共有する）
    pub attempt: u32,
    pub engine: EngineKind,
    /// 選択理由（フラグ規則 / ブレーカー迂回 / フォールバック）
    pub rule: String,
    pub fallback: bool,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { kind: ErrorKind, message: String },
}

/// 完了ジョブの出力参照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub artifact_path: PathBuf,
    pub duration_ms: u32,
    pub sample_rate: u32,
    /// クローン系ジョブで作成された VoiceProfile
    pub voice_profile_id: Option<String>,
    pub transcript: Option<String>,
}

/// 永続化されるジョブレコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub mode: JobMode,
    pub status: JobStatus,
    pub caller_id: String,
    pub inputs: JobInputs,
    pub attempts: Vec<EngineAttempt>,
    pub progress: f32,
    pub output: Option<JobOutput>,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// 生涯で失敗したエンジン呼び出し数（デッドレター判定用）
    pub failure_count: u32,
    /// Running 中のキャンセル要求（助言的）
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(mode: JobMode, caller_id: String, inputs: JobInputs, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            status: JobStatus::Pending,
            caller_id,
            inputs,
            attempts: Vec::new(),
            progress: 0.0,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            retry_count: 0,
            failure_count: 0,
            cancel_requested: false,
        }
    }

    /// 入力がモードに必要な項目をすべて備えているか
    pub fn inputs_complete(&self) -> bool {
        let text_ok = !self.mode.needs_text()
            || self
                .inputs
                .text
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty());
        let audio_ok = !self.mode.needs_reference_audio() || self.inputs.reference_audio.is_some();
        text_ok && audio_ok && !self.inputs.language.is_empty()
    }

    /// 同じ試行番号でフォールバックが起きたか
    pub fn fallback_engines(&self) -> Vec<EngineKind> {
        self.attempts
            .iter()
            .filter(|a| a.fallback)
            .map(|a| a.engine)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> JobInputs {
        JobInputs {
            text: Some("Hello world".into()),
            language: "en".into(),
            voice: None,
            reference_audio: None,
            reference_transcript: None,
            quality: QualityProfile::Standard,
        }
    }

    #[test]
    fn new_job_is_pending() {
        let job = Job::new(JobMode::Synthesize, "caller".into(), inputs(), Utc::now());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert!(job.output.is_none());
        assert!(job.inputs_complete());
    }

    #[test]
    fn clone_without_reference_is_incomplete() {
        let job = Job::new(JobMode::Clone, "caller".into(), inputs(), Utc::now());
        assert!(!job.inputs_complete());
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Enqueued,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn forward_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Enqueued));
        assert!(JobStatus::Enqueued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Enqueued.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Enqueued));
    }

    #[test]
    fn voice_ref_serialization() {
        let v = VoiceRef::Profile("vp-1".into());
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"type":"profile","id":"vp-1"}"#);
    }
}
