use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::engine::EngineKind;

/// 設定読み込みのエラー
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// プロセス全体の設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeSettings {
    pub limits: LimitsConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub rollout: RolloutConfig,
    pub engines: EnginesConfig,
    pub worker: WorkerConfig,
    pub dead_letter: DeadLetterConfig,
    pub storage: StorageConfig,
}

/// 作成時の入力制限
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// テキスト最大文字数（正規化後）
    pub max_text_chars: usize,
    /// 参照音声の最短秒数
    pub min_reference_secs: f32,
    /// 参照音声の最長秒数
    pub max_reference_secs: f32,
    /// 対応言語（空なら制限なし）
    pub supported_languages: Vec<String>,
    /// 言語未指定時のデフォルト
    pub default_language: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_text_chars: 5000,
            min_reference_secs: 1.0,
            max_reference_secs: 60.0,
            supported_languages: vec![],
            default_language: "en".to_string(),
        }
    }
}

/// リトライ（指数バックオフ）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// サーキットブレーカー
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// ウィンドウ内でこの回数失敗すると OPEN
    pub failure_threshold: u32,
    pub window_secs: u64,
    /// OPEN → HALF_OPEN までの待ち時間
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            recovery_timeout_secs: 30,
        }
    }
}

/// ロールアウトフェーズ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    #[default]
    Disabled,
    Alpha,
    Beta,
    Ga,
}

impl RolloutPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Ga => "ga",
        }
    }
}

/// 新エンジンのロールアウト設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// フラグ名（ハッシュの塩にも使う）
    pub flag: String,
    pub phase: RolloutPhase,
    pub alpha_percent: f32,
    pub beta_percent: f32,
    /// 常に新エンジン
    pub allow_list: Vec<String>,
    /// 常に既存エンジン（allow_list より優先）
    pub deny_list: Vec<String>,
    /// ロールアウト対象の新エンジン
    pub candidate: EngineKind,
    /// 対象外の呼び出し元が使うエンジン
    pub baseline: EngineKind,
}

impl RolloutConfig {
    /// フェーズの割合 [0, 100]
    pub fn percentage(&self) -> f32 {
        match self.phase {
            RolloutPhase::Disabled => 0.0,
            RolloutPhase::Alpha => self.alpha_percent,
            RolloutPhase::Beta => self.beta_percent,
            RolloutPhase::Ga => 100.0,
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            flag: "synthesis_engine".to_string(),
            phase: RolloutPhase::Disabled,
            alpha_percent: 5.0,
            beta_percent: 25.0,
            allow_list: vec![],
            deny_list: vec![],
            candidate: EngineKind::Secondary,
            baseline: EngineKind::Primary,
        }
    }
}

/// 外部合成バイナリ（sidecar）の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub binary_path: PathBuf,
    pub model_path: PathBuf,
    /// 追加のコマンドライン引数
    pub extra_args: Vec<String>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("tts-cli"),
            model_path: PathBuf::from("models/tts-base.onnx"),
            extra_args: vec![],
        }
    }
}

/// ローカル波形エンジンの設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub sample_rate: u32,
    /// 1文字あたりの長さ（ミリ秒）
    pub ms_per_char: u32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            ms_per_char: 60,
        }
    }
}

/// バリアントごとの構築規則
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum EngineBackend {
    Sidecar(SidecarConfig),
    Tone(ToneConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub primary: EngineBackend,
    pub secondary: EngineBackend,
    /// 同一試行内のエンジン切り替えを許可するか
    pub fallback_enabled: bool,
    /// 1回の呼び出しのハードタイムアウト（秒）
    pub invocation_timeout_secs: u64,
}

impl EnginesConfig {
    pub fn backend(&self, kind: EngineKind) -> &EngineBackend {
        match kind {
            EngineKind::Primary => &self.primary,
            EngineKind::Secondary => &self.secondary,
        }
    }

    /// 選択されたエンジンの代替
    pub fn fallback_for(&self, kind: EngineKind) -> Option<EngineKind> {
        if !self.fallback_enabled {
            return None;
        }
        match kind {
            EngineKind::Primary => Some(EngineKind::Secondary),
            EngineKind::Secondary => Some(EngineKind::Primary),
        }
    }
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            primary: EngineBackend::Sidecar(SidecarConfig::default()),
            secondary: EngineBackend::Tone(ToneConfig::default()),
            fallback_enabled: true,
            invocation_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub queue_name: String,
    /// SQLite キューのポーリング間隔
    pub poll_interval_ms: u64,
    /// 未 ack 配信の再配信までの秒数。RUNNING の放棄判定にも使う。
    pub lease_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_name: "synthesis".to_string(),
            poll_interval_ms: 200,
            lease_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// 累積失敗がこれを超えたらデッドレターへ送る
    pub failure_threshold: u32,
    pub retention_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            retention_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// None ならデータディレクトリ配下
    pub database_path: Option<PathBuf>,
    pub artifact_dir: Option<PathBuf>,
    pub voice_profile_ttl_secs: u64,
    /// ジョブレコードの保持期間（None = 無期限）
    pub job_ttl_secs: Option<u64>,
    /// 期限切れ掃除と孤児アーティファクト回収の間隔
    pub housekeeping_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            artifact_dir: None,
            voice_profile_ttl_secs: 30 * 24 * 3600,
            job_ttl_secs: Some(14 * 24 * 3600),
            housekeeping_secs: 600,
        }
    }
}

impl StorageConfig {
    fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voiceforge")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("voiceforge.db"))
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("artifacts"))
    }
}

impl ForgeSettings {
    /// JSON ファイルから読み込む。ファイルがなければデフォルト。
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            log::info!("設定ファイルがないためデフォルトを使用: {}", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.worker.pool_size == 0 {
            return Err(SettingsError::Invalid("worker.pool_size must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SettingsError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.limits.min_reference_secs > self.limits.max_reference_secs {
            return Err(SettingsError::Invalid(
                "limits.min_reference_secs exceeds max_reference_secs".into(),
            ));
        }
        for (name, pct) in [
            ("alpha_percent", self.rollout.alpha_percent),
            ("beta_percent", self.rollout.beta_percent),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(SettingsError::Invalid(format!(
                    "rollout.{name} must be within [0, 100], got {pct}"
                )));
            }
        }
        // 放棄判定は最終更新からの経過時間で行う。生きた試行の書き込み間隔
        // （SWC ならクローンと合成の2回分）を超えていないと横取りが起きる。
        let max_silence = self.engines.invocation_timeout_secs.saturating_mul(2);
        if self.worker.lease_secs <= max_silence {
            return Err(SettingsError::Invalid(format!(
                "worker.lease_secs ({}) must exceed twice engines.invocation_timeout_secs ({})",
                self.worker.lease_secs, self.engines.invocation_timeout_secs
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(SettingsError::Invalid(
                "breaker.failure_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }
}
