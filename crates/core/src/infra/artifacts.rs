use std::path::{Path, PathBuf};

use crate::domain::engine::{AudioArtifact, EngineKind};
use crate::domain::error::StoreError;

/// WAV ヘッダから読んだ情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u32,
}

/// WAV ファイルをプローブして長さを得る。
pub fn probe_wav(path: &Path) -> Result<WavInfo, String> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(format!("{}: invalid WAV header", path.display()));
    }
    // duration() はチャンネルあたりのサンプル数
    let frames = reader.duration() as u64;
    let duration_ms = (frames * 1000 / spec.sample_rate as u64) as u32;
    Ok(WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        duration_ms,
    })
}

/// モノラル f32 サンプルを 16bit PCM WAV で書き出す。
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<AudioArtifact, String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| format!("create {}: {e}", path.display()))?;
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(v)
            .map_err(|e| format!("write {}: {e}", path.display()))?;
    }
    writer
        .finalize()
        .map_err(|e| format!("finalize {}: {e}", path.display()))?;
    let duration_ms = if sample_rate > 0 {
        (samples.len() as u64 * 1000 / sample_rate as u64) as u32
    } else {
        0
    };
    Ok(AudioArtifact {
        path: path.to_path_buf(),
        sample_rate,
        duration_ms,
    })
}

/// WAV を読み込みモノラル f32 に畳み込む。
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), String> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| format!("decode {}: {e}", path.display()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| format!("decode {}: {e}", path.display()))?
        }
    };
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// 音声アーティファクトの置き場。
///
/// jobs/    完了ジョブの出力
/// voices/  VoiceProfile の参照音声
/// staging/ クローン結果（プロファイル確定前）
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["jobs", "voices", "staging"] {
            std::fs::create_dir_all(root.join(sub)).map_err(|e| {
                StoreError::unavailable(format!("アーティファクトディレクトリ作成失敗: {e}"))
            })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 試行・エンジンごとに別ファイルにする（フォールバック時の書き込み競合を避ける）
    pub fn job_output_path(&self, job_id: &str, attempt: u32, engine: EngineKind) -> PathBuf {
        self.root
            .join("jobs")
            .join(format!("{job_id}-{attempt}-{}.wav", engine.as_str()))
    }

    pub fn staging_path(&self, job_id: &str, attempt: u32, engine: EngineKind) -> PathBuf {
        self.root
            .join("staging")
            .join(format!("{job_id}-{attempt}-{}.wav", engine.as_str()))
    }

    pub fn profile_path(&self, profile_id: &str) -> PathBuf {
        self.root.join("voices").join(format!("{profile_id}.wav"))
    }

    /// ステージング済みのクローン結果をプロファイル用の場所へ移す
    pub fn promote(&self, staged: &Path, profile_id: &str) -> Result<PathBuf, StoreError> {
        let dest = self.profile_path(profile_id);
        std::fs::rename(staged, &dest)
            .map_err(|e| StoreError::unavailable(format!("アーティファクト移動失敗: {e}")))?;
        Ok(dest)
    }

    /// 削除。存在しなければ false。
    pub fn remove(&self, path: &Path) -> Result<bool, StoreError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::unavailable(format!(
                "アーティファクト削除失敗 {}: {e}",
                path.display()
            ))),
        }
    }
}
