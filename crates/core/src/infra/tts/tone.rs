use std::path::Path;

use async_trait::async_trait;

use crate::domain::engine::{
    AudioArtifact, CloneRequest, ClonedVoice, EngineError, EngineHealth, QualityProfile,
    ResolvedVoice, SynthesisEngine, SynthesisRequest,
};
use crate::domain::settings::ToneConfig;
use crate::infra::artifacts::{read_wav_mono, write_wav};

/// ToneEngine: 外部依存のないローカル波形エンジン。
///
/// テキスト長に比例した長さの決定的な波形を書き出す。GPU を使わないので
/// 資源枯渇時のフォールバック先や開発環境での既定バックエンドになる。
pub struct ToneEngine {
    config: ToneConfig,
}

impl ToneEngine {
    pub fn new(config: ToneConfig) -> Self {
        Self { config }
    }

    /// 声ごとに基本周波数を変える（同じ声なら同じ音）
    fn base_frequency(voice: Option<&ResolvedVoice>) -> f32 {
        let seed: &str = match voice {
            Some(ResolvedVoice::Preset(id)) => id,
            Some(ResolvedVoice::Reference { audio_path, .. }) => {
                audio_path.to_str().unwrap_or_default()
            }
            None => "",
        };
        let h = seed
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        110.0 + (h % 220) as f32
    }

    fn render(&self, text: &str, voice: Option<&ResolvedVoice>, quality: QualityProfile) -> Vec<f32> {
        let rate = self.output_rate(quality);
        let chars = text.chars().count() as u64;
        let total = (chars * self.config.ms_per_char as u64 * rate as u64 / 1000) as usize;
        let freq = Self::base_frequency(voice);
        let step = std::f32::consts::TAU * freq / rate as f32;
        (0..total).map(|i| (i as f32 * step).sin() * 0.3).collect()
    }

    fn output_rate(&self, quality: QualityProfile) -> u32 {
        match quality {
            QualityProfile::Draft => (self.config.sample_rate / 2).max(1),
            _ => self.config.sample_rate.max(1),
        }
    }
}

#[async_trait]
impl SynthesisEngine for ToneEngine {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioArtifact, EngineError> {
        if request.text.trim().is_empty() {
            return Err(EngineError::invalid_input("text is empty"));
        }
        if let Some(ResolvedVoice::Reference { audio_path, .. }) = &request.voice {
            if !audio_path.exists() {
                return Err(EngineError::invalid_input(format!(
                    "reference audio missing: {}",
                    audio_path.display()
                )));
            }
        }
        let samples = self.render(&request.text, request.voice.as_ref(), request.quality);
        let rate = self.output_rate(request.quality);
        let path = request.output_path.clone();
        tokio::task::spawn_blocking(move || write_wav(&path, &samples, rate))
            .await
            .map_err(|e| EngineError::failed(format!("render task failed: {e}")))?
            .map_err(EngineError::failed)
    }

    async fn clone_voice(&self, request: &CloneRequest) -> Result<ClonedVoice, EngineError> {
        let reference = request.reference_audio.clone();
        let output = request.output_path.clone();
        let artifact = tokio::task::spawn_blocking(move || reencode(&reference, &output))
            .await
            .map_err(|e| EngineError::failed(format!("clone task failed: {e}")))??;
        Ok(ClonedVoice {
            artifact,
            transcript: request.transcript.clone(),
        })
    }

    async fn health(&self) -> EngineHealth {
        if self.config.sample_rate == 0 {
            return EngineHealth::not_ready(self.name(), "sample_rate is zero");
        }
        EngineHealth::ready(self.name())
    }

    fn name(&self) -> &str {
        "tone"
    }
}

/// 参照音声をモノラル 16bit に正規化して書き出す
fn reencode(reference: &Path, output: &Path) -> Result<AudioArtifact, EngineError> {
    let (samples, rate) = read_wav_mono(reference).map_err(EngineError::invalid_input)?;
    if samples.is_empty() {
        return Err(EngineError::invalid_input("reference audio is empty"));
    }
    write_wav(output, &samples, rate).map_err(EngineError::failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engine::EngineErrorKind;
    use crate::infra::artifacts::probe_wav;

    fn request(dir: &Path, text: &str) -> SynthesisRequest {
        SynthesisRequest {
            job_id: "job-1".into(),
            text: text.into(),
            language: "en".into(),
            voice: Some(ResolvedVoice::Preset("alloy".into())),
            quality: QualityProfile::Standard,
            output_path: dir.join("out.wav"),
        }
    }

    #[tokio::test]
    async fn test_duration_scales_with_text() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ToneEngine::new(ToneConfig::default());
        let artifact = engine
            .synthesize(&request(dir.path(), "Hello world"))
            .await
            .unwrap();
        // 11 文字 × 60ms
        assert_eq!(artifact.duration_ms, 660);
        assert_eq!(artifact.sample_rate, 24_000);
        assert_eq!(probe_wav(&artifact.path).unwrap().duration_ms, 660);
    }

    #[tokio::test]
    async fn test_draft_halves_sample_rate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ToneEngine::new(ToneConfig::default());
        let mut req = request(dir.path(), "abc");
        req.quality = QualityProfile::Draft;
        let artifact = engine.synthesize(&req).await.unwrap();
        assert_eq!(artifact.sample_rate, 12_000);
        assert_eq!(artifact.duration_ms, 180);
    }

    #[tokio::test]
    async fn test_same_voice_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ToneEngine::new(ToneConfig::default());
        let mut a = request(dir.path(), "same text");
        a.output_path = dir.path().join("a.wav");
        let mut b = request(dir.path(), "same text");
        b.output_path = dir.path().join("b.wav");
        engine.synthesize(&a).await.unwrap();
        engine.synthesize(&b).await.unwrap();
        assert_eq!(
            std::fs::read(&a.output_path).unwrap(),
            std::fs::read(&b.output_path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_clone_reencodes_reference() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref.wav");
        write_wav(&reference, &vec![0.1; 32_000], 16_000).unwrap();

        let engine = ToneEngine::new(ToneConfig::default());
        let cloned = engine
            .clone_voice(&CloneRequest {
                job_id: "job-1".into(),
                reference_audio: reference,
                language: "en".into(),
                transcript: Some("hello".into()),
                output_path: dir.path().join("clone.wav"),
            })
            .await
            .unwrap();
        assert_eq!(cloned.artifact.duration_ms, 2000);
        assert_eq!(cloned.transcript.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_clone_rejects_unreadable_reference() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("bad.wav");
        std::fs::write(&reference, b"nope").unwrap();
        let engine = ToneEngine::new(ToneConfig::default());
        let err = engine
            .clone_voice(&CloneRequest {
                job_id: "job-1".into(),
                reference_audio: reference,
                language: "en".into(),
                transcript: None,
                output_path: dir.path().join("clone.wav"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::InvalidInput);
    }
}
