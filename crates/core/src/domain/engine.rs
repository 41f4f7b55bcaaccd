use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::{ErrorKind, JobFailure};

// ─── EngineKind ──────────────────────────────────────────────────

/// 合成エンジンのバリアント（閉じた集合）。
///
/// 新しいエンジンを足すときはここにバリアントを追加し、
/// `EngineFactory` に構築規則を登録する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Primary,
    Secondary,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [EngineKind::Primary, EngineKind::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 品質プロファイル
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    Draft,
    #[default]
    Standard,
    High,
}

impl QualityProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Standard => "standard",
            Self::High => "high",
        }
    }
}

// ─── Requests / Artifacts ────────────────────────────────────────

/// ワーカーが解決済みの声。VoiceProfile は参照音声に展開して渡す。
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedVoice {
    Preset(String),
    Reference {
        audio_path: PathBuf,
        transcript: Option<String>,
    },
}

/// 合成リクエスト
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub job_id: String,
    /// 正規化済みテキスト（空でない）
    pub text: String,
    pub language: String,
    /// None の場合はエンジンのデフォルト話者
    pub voice: Option<ResolvedVoice>,
    pub quality: QualityProfile,
    /// 出力 WAV の書き込み先
    pub output_path: PathBuf,
}

/// クローンリクエスト
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub job_id: String,
    pub reference_audio: PathBuf,
    pub language: String,
    /// 呼び出し側が書き起こしを持っている場合
    pub transcript: Option<String>,
    pub output_path: PathBuf,
}

/// エンジンが書き出した音声
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub duration_ms: u32,
}

/// クローン結果（参照アーティファクト + 導出された書き起こし）
#[derive(Debug, Clone, PartialEq)]
pub struct ClonedVoice {
    pub artifact: AudioArtifact,
    pub transcript: Option<String>,
}

/// ヘルスエンドポイント向けの準備状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub backend: String,
    pub ready: bool,
    pub detail: Option<String>,
}

impl EngineHealth {
    pub fn ready(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ready: true,
            detail: None,
        }
    }

    pub fn not_ready(backend: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ready: false,
            detail: Some(detail.into()),
        }
    }
}

// ─── EngineError ─────────────────────────────────────────────────

/// エンジン呼び出しのエラー種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineErrorKind {
    /// デバイスメモリ/計算資源の枯渇
    ResourceExhausted,
    /// 参照音声や言語が不正/非対応
    InvalidInput,
    /// バックエンドの初期化失敗、ブレーカー OPEN
    Unavailable,
    /// ウォールクロック超過（ResourceExhausted と同じ扱い）
    Timeout,
    /// その他の合成失敗
    Failed,
}

/// エンジン呼び出しで発生するエラー。
#[derive(Debug, Clone, PartialEq)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub detail: String,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EngineError::{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    pub fn resource_exhausted(detail: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::ResourceExhausted, detail: detail.into() }
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::InvalidInput, detail: detail.into() }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::Unavailable, detail: detail.into() }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::Timeout, detail: detail.into() }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::Failed, detail: detail.into() }
    }

    /// 同一試行内で二次エンジンへ切り替えてよいか
    pub fn fallback_eligible(&self) -> bool {
        matches!(
            self.kind,
            EngineErrorKind::ResourceExhausted
                | EngineErrorKind::Unavailable
                | EngineErrorKind::Timeout
        )
    }

    /// リトライで回復し得るか
    pub fn retryable(&self) -> bool {
        !matches!(self.kind, EngineErrorKind::InvalidInput)
    }

    /// サーキットブレーカーの失敗として数えるか（入力起因は数えない）
    pub fn counts_against_engine(&self) -> bool {
        !matches!(self.kind, EngineErrorKind::InvalidInput)
    }

    /// ジョブに記録する構造化エラーへ変換する。
    /// 内部詳細はメッセージに含めない。
    pub fn to_failure(&self, during_clone: bool) -> JobFailure {
        match self.kind {
            EngineErrorKind::InvalidInput if during_clone => JobFailure::new(
                ErrorKind::InvalidAudioReference,
                "reference audio was rejected by the engine",
            ),
            EngineErrorKind::InvalidInput => {
                JobFailure::new(ErrorKind::Validation, "input was rejected by the engine")
            }
            EngineErrorKind::ResourceExhausted => JobFailure::new(
                ErrorKind::ResourceExhausted,
                "synthesis ran out of compute resources",
            ),
            EngineErrorKind::Unavailable => {
                JobFailure::new(ErrorKind::EngineUnavailable, "no synthesis engine is available")
            }
            EngineErrorKind::Timeout => {
                JobFailure::new(ErrorKind::Timeout, "synthesis exceeded its time limit")
            }
            EngineErrorKind::Failed => JobFailure::internal("synthesis failed"),
        }
    }
}

// ─── SynthesisEngine trait ───────────────────────────────────────

/// 合成バックエンドのコアトレイト。全エンジン実装がこれを満たす。
#[async_trait::async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// テキストを音声に合成して `output_path` に書き出す。
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioArtifact, EngineError>;

    /// 参照音声から再利用可能な声を作る。非対応エンジンは InvalidInput。
    async fn clone_voice(&self, request: &CloneRequest) -> Result<ClonedVoice, EngineError> {
        let _ = request;
        Err(EngineError::invalid_input(format!(
            "{} does not support voice cloning",
            self.name()
        )))
    }

    /// 準備状態
    async fn health(&self) -> EngineHealth;

    /// バックエンド名 (例: "sidecar", "tone")。
    fn name(&self) -> &str;
}
