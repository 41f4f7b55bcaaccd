//! 統合テスト共通: 台本どおりに失敗/成功するエンジンと、それを差し込んだコンテキスト。

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use vf_core::domain::engine::{
    AudioArtifact, CloneRequest, ClonedVoice, EngineError, EngineHealth, EngineKind,
    ResolvedVoice, SynthesisEngine, SynthesisRequest,
};
use vf_core::domain::job::Job;
use vf_core::domain::settings::{EngineBackend, ForgeSettings, ToneConfig};
use vf_core::infra::artifacts::write_wav;
use vf_core::infra::queue::{MemoryTaskQueue, TaskQueue};
use vf_core::infra::storage::MemoryStore;
use vf_core::usecase::context::ForgeContext;
use vf_core::usecase::retry::{LogReclaimer, MemoryReclaimer};

const RATE: u32 = 16_000;

/// 台本の失敗を先頭から順に返し、尽きたら成功するエンジン
pub struct ScriptedEngine {
    name: &'static str,
    synth_failures: Mutex<VecDeque<EngineError>>,
    clone_failures: Mutex<VecDeque<EngineError>>,
    delay: Mutex<Duration>,
    pub synth_calls: AtomicUsize,
    pub clone_calls: AtomicUsize,
    pub last_voice: Mutex<Option<ResolvedVoice>>,
}

impl ScriptedEngine {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            synth_failures: Mutex::new(VecDeque::new()),
            clone_failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            synth_calls: AtomicUsize::new(0),
            clone_calls: AtomicUsize::new(0),
            last_voice: Mutex::new(None),
        })
    }

    pub fn fail_synthesis(&self, errors: impl IntoIterator<Item = EngineError>) {
        self.synth_failures.lock().extend(errors);
    }

    pub fn fail_clone(&self, errors: impl IntoIterator<Item = EngineError>) {
        self.clone_failures.lock().extend(errors);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn synth_calls(&self) -> usize {
        self.synth_calls.load(Ordering::SeqCst)
    }

    pub fn clone_calls(&self) -> usize {
        self.clone_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn render(path: &Path, millis: u32) -> Result<AudioArtifact, EngineError> {
    let samples = vec![0.1f32; (RATE as u64 * millis as u64 / 1000) as usize];
    write_wav(path, &samples, RATE).map_err(EngineError::failed)
}

#[async_trait::async_trait]
impl SynthesisEngine for ScriptedEngine {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioArtifact, EngineError> {
        self.synth_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_voice.lock() = request.voice.clone();
        self.pause().await;
        if let Some(err) = self.synth_failures.lock().pop_front() {
            return Err(err);
        }
        render(&request.output_path, 500)
    }

    async fn clone_voice(&self, request: &CloneRequest) -> Result<ClonedVoice, EngineError> {
        self.clone_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(err) = self.clone_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(ClonedVoice {
            artifact: render(&request.output_path, 1000)?,
            transcript: Some(
                request
                    .transcript
                    .clone()
                    .unwrap_or_else(|| "derived transcript".to_string()),
            ),
        })
    }

    async fn health(&self) -> EngineHealth {
        EngineHealth::ready(self.name)
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// 回収要求を数えるだけのフック
#[derive(Default)]
pub struct CountingReclaimer {
    pub calls: Mutex<Vec<(EngineKind, EngineError)>>,
}

impl CountingReclaimer {
    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl MemoryReclaimer for CountingReclaimer {
    fn reclaim(&self, engine: EngineKind, error: &EngineError) {
        self.calls.lock().push((engine, error.clone()));
    }
}

pub struct Harness {
    pub ctx: ForgeContext,
    pub primary: Arc<ScriptedEngine>,
    pub secondary: Arc<ScriptedEngine>,
    pub dir: TempDir,
}

impl Harness {
    /// 短いバックオフのテスト設定で組み立てる。プールは起動しない。
    pub fn new(tweak: impl FnOnce(&mut ForgeSettings)) -> Self {
        Self::assemble(tweak, Arc::new(MemoryTaskQueue::new()), Arc::new(LogReclaimer))
    }

    /// キューと回収フックを差し替えて組み立てる
    pub fn assemble(
        tweak: impl FnOnce(&mut ForgeSettings),
        queue: Arc<dyn TaskQueue>,
        reclaimer: Arc<dyn MemoryReclaimer>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ForgeSettings::default();
        settings.storage.artifact_dir = Some(dir.path().join("artifacts"));
        settings.engines.primary = EngineBackend::Tone(ToneConfig::default());
        settings.engines.secondary = EngineBackend::Tone(ToneConfig::default());
        settings.retry.base_delay_ms = 5;
        settings.retry.max_delay_ms = 20;
        settings.worker.pool_size = 2;
        tweak(&mut settings);

        let ctx =
            ForgeContext::with_reclaimer(settings, Arc::new(MemoryStore::new()), queue, reclaimer)
                .unwrap();
        let primary = ScriptedEngine::new("scripted-primary");
        let secondary = ScriptedEngine::new("scripted-secondary");
        ctx.factory().register(EngineKind::Primary, primary.clone());
        ctx.factory().register(EngineKind::Secondary, secondary.clone());

        Self {
            ctx,
            primary,
            secondary,
            dir,
        }
    }

    pub fn started(tweak: impl FnOnce(&mut ForgeSettings)) -> Self {
        let h = Self::new(tweak);
        h.ctx.start();
        h
    }

    /// 指定秒数の参照音声
    pub fn reference_clip(&self, secs: f32) -> PathBuf {
        let path = self
            .dir
            .path()
            .join(format!("ref-{}.wav", uuid::Uuid::new_v4()));
        let samples = vec![0.2f32; (RATE as f32 * secs) as usize];
        write_wav(&path, &samples, RATE).unwrap();
        path
    }

    pub async fn wait_for(&self, job_id: &str, pred: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..1000 {
            let job = self.ctx.manager().get(job_id).unwrap();
            if pred(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached the expected state");
    }

    pub async fn wait_terminal(&self, job_id: &str) -> Job {
        self.wait_for(job_id, |job| job.status.is_terminal()).await
    }
}
