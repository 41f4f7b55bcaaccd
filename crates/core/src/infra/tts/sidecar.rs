use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::domain::engine::{
    AudioArtifact, CloneRequest, ClonedVoice, EngineError, EngineHealth, ResolvedVoice,
    SynthesisEngine, SynthesisRequest,
};
use crate::domain::settings::SidecarConfig;
use crate::infra::artifacts::probe_wav;

/// sidecar の終了コード規約
const EXIT_INVALID_INPUT: i32 = 2;
const EXIT_RESOURCE_EXHAUSTED: i32 = 3;
const EXIT_UNAVAILABLE: i32 = 4;

/// 外部合成バイナリ sidecar プロセスマネージャ。
///
/// プロセスは `kill_on_drop` で起動するので、呼び出し側のタイムアウトで
/// future が破棄されれば子プロセスも終了する。
pub struct SidecarEngine {
    config: parking_lot::RwLock<SidecarConfig>,
}

impl SidecarEngine {
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config: parking_lot::RwLock::new(config),
        }
    }

    /// 現在の設定のクローンを取得する。
    pub fn config(&self) -> SidecarConfig {
        self.config.read().clone()
    }

    /// バイナリとモデルの存在を検証する。
    pub fn validate(&self) -> Result<(), EngineError> {
        let config = self.config.read();
        if !config.binary_path.exists() && which_binary(&config.binary_path).is_none() {
            return Err(EngineError::unavailable(format!(
                "synthesis binary not found: {:?}",
                config.binary_path
            )));
        }
        if !config.model_path.exists() {
            return Err(EngineError::unavailable(format!(
                "synthesis model not found: {:?}",
                config.model_path
            )));
        }
        Ok(())
    }

    /// synthesize サブコマンドの引数を構築する。
    fn build_synthesize_args(config: &SidecarConfig, request: &SynthesisRequest) -> Vec<String> {
        let mut args = vec![
            "synthesize".into(),
            "--model".into(),
            config.model_path.to_string_lossy().into(),
            "--text".into(),
            request.text.clone(),
            "--language".into(),
            request.language.clone(),
            "--quality".into(),
            request.quality.as_str().into(),
        ];

        match &request.voice {
            Some(ResolvedVoice::Preset(id)) => {
                args.push("--voice".into());
                args.push(id.clone());
            }
            Some(ResolvedVoice::Reference {
                audio_path,
                transcript,
            }) => {
                args.push("--reference".into());
                args.push(audio_path.to_string_lossy().into());
                if let Some(t) = transcript.as_deref().filter(|t| !t.is_empty()) {
                    args.push("--reference-text".into());
                    args.push(t.into());
                }
            }
            None => {}
        }

        args.extend(config.extra_args.iter().cloned());
        args.push("--output".into());
        args.push(request.output_path.to_string_lossy().into());
        args
    }

    /// clone サブコマンドの引数を構築する。
    fn build_clone_args(config: &SidecarConfig, request: &CloneRequest) -> Vec<String> {
        let mut args = vec![
            "clone".into(),
            "--model".into(),
            config.model_path.to_string_lossy().into(),
            "--reference".into(),
            request.reference_audio.to_string_lossy().into(),
            "--language".into(),
            request.language.clone(),
        ];
        if let Some(t) = request.transcript.as_deref().filter(|t| !t.is_empty()) {
            args.push("--reference-text".into());
            args.push(t.into());
        }
        args.extend(config.extra_args.iter().cloned());
        args.push("--output".into());
        args.push(request.output_path.to_string_lossy().into());
        args
    }

    /// sidecar を実行して stdout を返す。
    async fn run(&self, args: Vec<String>) -> Result<String, EngineError> {
        // config のスナップショットを取得（ロック保持を最小化）
        let config = self.config.read().clone();

        log::debug!("Running synthesis sidecar: {:?} {:?}", config.binary_path, args);

        let child = Command::new(&config.binary_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::unavailable(format!(
                    "synthesis binary not found: {:?}",
                    config.binary_path
                )),
                std::io::ErrorKind::PermissionDenied => {
                    EngineError::unavailable(format!("cannot execute synthesis binary: {e}"))
                }
                _ => EngineError::failed(format!("failed to spawn synthesis process: {e}")),
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::failed(format!("synthesis process error: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(output.status.code(), &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// 終了コードと stderr をエラー種別に対応付ける。
fn classify_failure(code: Option<i32>, stderr: &str) -> EngineError {
    let tail = tail_chars(stderr, 500);
    let lowered = stderr.to_ascii_lowercase();
    if code == Some(EXIT_RESOURCE_EXHAUSTED) || lowered.contains("out of memory") {
        return EngineError::resource_exhausted(format!("sidecar exhausted resources: {tail}"));
    }
    match code {
        Some(EXIT_INVALID_INPUT) => {
            EngineError::invalid_input(format!("sidecar rejected input: {tail}"))
        }
        Some(EXIT_UNAVAILABLE) => {
            EngineError::unavailable(format!("sidecar failed to initialize: {tail}"))
        }
        Some(c) => EngineError::failed(format!("sidecar exited with status {c}: {tail}")),
        None => EngineError::failed("sidecar terminated by signal"),
    }
}

/// 末尾 `n` 文字。マルチバイト文字の途中では切らない。
fn tail_chars(s: &str, n: usize) -> &str {
    let start = s
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    &s[start..]
}

/// 先頭 `n` 文字。
fn head_chars(s: &str, n: usize) -> &str {
    let end = s.char_indices().nth(n).map_or(s.len(), |(i, _)| i);
    &s[..end]
}

// ─── sidecar JSON 出力 ───────────────────────────────────────────

#[derive(Debug, Default, serde::Deserialize)]
struct CloneJsonOutput {
    #[serde(default)]
    transcript: Option<String>,
}

fn parse_clone_output(stdout: &str) -> Result<CloneJsonOutput, EngineError> {
    let json_str = stdout.trim();
    if json_str.is_empty() {
        return Ok(CloneJsonOutput::default());
    }
    serde_json::from_str(json_str).map_err(|e| {
        EngineError::failed(format!(
            "failed to parse sidecar JSON: {e}. Raw: {}",
            head_chars(json_str, 500)
        ))
    })
}

/// 出力 WAV を検証してアーティファクトにする
fn artifact_at(path: &Path) -> Result<AudioArtifact, EngineError> {
    let info = probe_wav(path)
        .map_err(|e| EngineError::failed(format!("sidecar produced no usable audio: {e}")))?;
    if info.duration_ms == 0 {
        return Err(EngineError::failed("sidecar produced empty audio"));
    }
    Ok(AudioArtifact {
        path: path.to_path_buf(),
        sample_rate: info.sample_rate,
        duration_ms: info.duration_ms,
    })
}

/// PATH 上でバイナリを検索する簡易ヘルパー。
fn which_binary(name: &Path) -> Option<PathBuf> {
    let name_str = name.to_string_lossy();
    if name_str.contains('/') || name_str.contains('\\') {
        return if name.exists() { Some(name.to_path_buf()) } else { None };
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|p| p.exists())
}

// ─── SynthesisEngine 実装 ────────────────────────────────────────

#[async_trait::async_trait]
impl SynthesisEngine for SidecarEngine {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioArtifact, EngineError> {
        let config = self.config.read().clone();
        let args = Self::build_synthesize_args(&config, request);
        self.run(args).await?;
        artifact_at(&request.output_path)
    }

    async fn clone_voice(&self, request: &CloneRequest) -> Result<ClonedVoice, EngineError> {
        if !request.reference_audio.exists() {
            return Err(EngineError::invalid_input(format!(
                "reference audio does not exist: {:?}",
                request.reference_audio
            )));
        }
        let config = self.config.read().clone();
        let args = Self::build_clone_args(&config, request);
        let stdout = self.run(args).await?;
        let parsed = parse_clone_output(&stdout)?;
        Ok(ClonedVoice {
            artifact: artifact_at(&request.output_path)?,
            transcript: parsed.transcript.or_else(|| request.transcript.clone()),
        })
    }

    async fn health(&self) -> EngineHealth {
        match self.validate() {
            Ok(()) => EngineHealth::ready(self.name()),
            Err(e) => EngineHealth::not_ready(self.name(), e.detail),
        }
    }

    fn name(&self) -> &str {
        "sidecar"
    }
}

// ─── テスト ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engine::{EngineErrorKind, QualityProfile};

    fn request(voice: Option<ResolvedVoice>) -> SynthesisRequest {
        SynthesisRequest {
            job_id: "job-1".into(),
            text: "Hello world".into(),
            language: "en".into(),
            voice,
            quality: QualityProfile::High,
            output_path: PathBuf::from("/tmp/out.wav"),
        }
    }

    #[test]
    fn synthesize_args_with_preset() {
        let config = SidecarConfig::default();
        let args = SidecarEngine::build_synthesize_args(
            &config,
            &request(Some(ResolvedVoice::Preset("alloy".into()))),
        );
        assert_eq!(args[0], "synthesize");
        let voice_idx = args.iter().position(|a| a == "--voice").unwrap();
        assert_eq!(args[voice_idx + 1], "alloy");
        let q_idx = args.iter().position(|a| a == "--quality").unwrap();
        assert_eq!(args[q_idx + 1], "high");
        assert_eq!(args[args.len() - 2], "--output");
        assert_eq!(args[args.len() - 1], "/tmp/out.wav");
    }

    #[test]
    fn synthesize_args_with_reference() {
        let config = SidecarConfig {
            extra_args: vec!["--device".into(), "cuda:0".into()],
            ..Default::default()
        };
        let args = SidecarEngine::build_synthesize_args(
            &config,
            &request(Some(ResolvedVoice::Reference {
                audio_path: PathBuf::from("/v/vp.wav"),
                transcript: Some("hi there".into()),
            })),
        );
        assert!(args.contains(&"--reference".to_string()));
        assert!(args.contains(&"hi there".to_string()));
        assert!(args.contains(&"cuda:0".to_string()));
        assert!(!args.contains(&"--voice".to_string()));
    }

    #[test]
    fn classify_exit_codes() {
        assert_eq!(
            classify_failure(Some(3), "").kind,
            EngineErrorKind::ResourceExhausted
        );
        assert_eq!(
            classify_failure(Some(1), "RuntimeError: CUDA out of memory").kind,
            EngineErrorKind::ResourceExhausted
        );
        assert_eq!(
            classify_failure(Some(2), "unsupported sample rate").kind,
            EngineErrorKind::InvalidInput
        );
        assert_eq!(
            classify_failure(Some(4), "model load failed").kind,
            EngineErrorKind::Unavailable
        );
        assert_eq!(classify_failure(Some(1), "boom").kind, EngineErrorKind::Failed);
        assert_eq!(classify_failure(None, "").kind, EngineErrorKind::Failed);
    }

    #[test]
    fn parse_clone_transcript() {
        let out = parse_clone_output(r#"{"transcript": "hello there"}"#).unwrap();
        assert_eq!(out.transcript.as_deref(), Some("hello there"));
        assert!(parse_clone_output("").unwrap().transcript.is_none());
        assert!(parse_clone_output("not json").is_err());
    }

    #[test]
    fn classify_failure_keeps_multibyte_stderr_intact() {
        // 1800 バイト。単純なバイト位置での切り出しは文字の途中に当たる
        let stderr = "エラー".repeat(200);
        let err = classify_failure(Some(1), &stderr);
        assert_eq!(err.kind, EngineErrorKind::Failed);
        let tail = err.detail.trim_start_matches("sidecar exited with status 1: ");
        assert_eq!(tail.chars().count(), 500);
        assert!(tail.ends_with("エラー"));

        let err = classify_failure(Some(EXIT_RESOURCE_EXHAUSTED), "メモリ不足");
        assert_eq!(err.kind, EngineErrorKind::ResourceExhausted);
        assert!(err.detail.ends_with("メモリ不足"));
    }

    #[test]
    fn parse_clone_error_keeps_multibyte_output_intact() {
        let raw = format!("x{}", "音声".repeat(400));
        let err = parse_clone_output(&raw).unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Failed);
        let shown = err.detail.split("Raw: ").nth(1).unwrap();
        assert_eq!(shown.chars().count(), 500);
        assert!(shown.starts_with("x音声"));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let engine = SidecarEngine::new(SidecarConfig {
            binary_path: PathBuf::from("/nonexistent/tts-cli"),
            ..Default::default()
        });
        let err = engine.synthesize(&request(None)).await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Unavailable);

        let health = engine.health().await;
        assert!(!health.ready);
        assert_eq!(health.backend, "sidecar");
    }

    #[tokio::test]
    async fn clone_missing_reference_is_invalid() {
        let engine = SidecarEngine::new(SidecarConfig::default());
        let err = engine
            .clone_voice(&CloneRequest {
                job_id: "job-1".into(),
                reference_audio: PathBuf::from("/nonexistent/ref.wav"),
                language: "en".into(),
                transcript: None,
                output_path: PathBuf::from("/tmp/clone.wav"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::InvalidInput);
    }
}
