use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::engine::{
    AudioArtifact, CloneRequest, ClonedVoice, EngineError, EngineKind, ResolvedVoice,
    SynthesisRequest,
};
use crate::domain::error::{ErrorKind, JobFailure, ManagerError, StoreError};
use crate::domain::job::{AttemptOutcome, EngineAttempt, Job, JobMode, JobOutput, JobStatus, VoiceRef};
use crate::domain::settings::EnginesConfig;
use crate::domain::voice::VoiceProfile;
use crate::infra::artifacts::ArtifactStore;
use crate::infra::metrics::Metrics;
use crate::infra::queue::TaskQueue;
use crate::infra::storage::VoiceProfileRepository;
use crate::infra::tts::EngineFactory;
use crate::usecase::circuit_breaker::BreakerRegistry;
use crate::usecase::job_manager::JobManager;
use crate::usecase::retry::{MemoryReclaimer, Outcome, RetryPolicy, needs_reclaim};
use crate::usecase::router::{EngineDecision, EngineRouter};

/// 1試行の失敗（どの段階で起きたかを保持）
#[derive(Debug)]
struct AttemptFailure {
    error: EngineError,
    during_clone: bool,
}

impl AttemptFailure {
    fn clone_phase(error: EngineError) -> Self {
        Self {
            error,
            during_clone: true,
        }
    }

    fn synthesis(error: EngineError) -> Self {
        Self {
            error,
            during_clone: false,
        }
    }

    fn failure(&self) -> JobFailure {
        self.error.to_failure(self.during_clone)
    }
}

/// エンジンが作ったもの（プロファイル確定前）
struct Produced {
    artifact: AudioArtifact,
    clone: Option<ClonedVoice>,
}

/// 1配信の処理結果。キューへの ack を決める。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// ジョブは終端に達したか、この配信では扱う必要がない。ack する。
    Done,
    /// ジョブはまだ終わっていない。ack せず可視性期限後の再配信に任せる。
    Deferred,
}

/// ワーカーが使う共有部品
pub struct ProcessorDeps {
    pub manager: Arc<JobManager>,
    pub voices: VoiceProfileRepository,
    pub artifacts: ArtifactStore,
    pub factory: Arc<EngineFactory>,
    pub breakers: Arc<BreakerRegistry>,
    pub router: Arc<EngineRouter>,
    pub reclaimer: Arc<dyn MemoryReclaimer>,
    pub metrics: Arc<Metrics>,
    pub retry: RetryPolicy,
    pub engines: EnginesConfig,
    pub voice_ttl_secs: u64,
}

/// ジョブ1件を claim から終端状態まで進める
pub struct JobProcessor {
    deps: ProcessorDeps,
    invocation_timeout: Duration,
}

impl JobProcessor {
    pub fn new(deps: ProcessorDeps) -> Self {
        let invocation_timeout = Duration::from_secs(deps.engines.invocation_timeout_secs);
        Self {
            deps,
            invocation_timeout,
        }
    }

    /// キューから受け取ったジョブ ID を処理する。
    ///
    /// ペイロードは信用せず、ストアから読み直して claim する。
    /// 戻り値は配信を ack してよいか。`Err` はストア障害で、こちらも ack しない。
    pub async fn process(
        &self,
        job_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Processed, ManagerError> {
        let d = &self.deps;
        let Some(mut job) = d.manager.claim(job_id)? else {
            return self.refused(job_id);
        };
        if job.retry_count == 0 {
            let waited = (Utc::now() - job.created_at).num_milliseconds().max(0) as u64;
            d.metrics.record_latency("queue_wait", waited);
        }
        if job.cancel_requested {
            d.manager.finish_cancelled(job_id)?;
            return Ok(Processed::Done);
        }

        // 声の解決はエンジン呼び出しより前（存在しない ID はここで失敗）
        let voice = match self.resolve_voice(&job)? {
            Ok(voice) => voice,
            Err(failure) => {
                d.manager.fail(job_id, failure)?;
                return Ok(Processed::Done);
            }
        };

        loop {
            let attempt = job.retry_count + 1;
            let decision = d.router.decide(&job.caller_id);
            log::info!(
                "ジョブ {job_id} 試行 {attempt}: engine={} rule={}",
                decision.engine,
                decision.rule
            );

            let Some(result) = self
                .run_attempt(&job, attempt, &decision, voice.as_ref())
                .await?
            else {
                log::warn!("ジョブ {job_id} 試行 {attempt} は他のワーカーに引き継がれたため中断");
                return Ok(Processed::Deferred);
            };

            let failure = match Outcome::classify(result, |f| f.error.retryable()) {
                Outcome::Success(produced) => {
                    self.finish(&job, produced)?;
                    return Ok(Processed::Done);
                }
                Outcome::Fatal(failure) => {
                    d.manager.fail(job_id, failure.failure())?;
                    return Ok(Processed::Done);
                }
                Outcome::Retryable(failure) => failure,
            };

            if !d.retry.should_retry(attempt) {
                log::warn!("ジョブ {job_id} は {attempt} 回の試行を使い切った");
                d.manager.fail(job_id, failure.failure())?;
                return Ok(Processed::Done);
            }

            let Some(pending) = d.manager.begin_retry(job_id)? else {
                return self.refused(job_id);
            };
            if pending.status == JobStatus::Cancelled {
                return Ok(Processed::Done);
            }

            let delay = d.retry.delay_for(attempt);
            log::debug!("ジョブ {job_id} を {delay:?} 後に再試行");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    // PENDING のまま残し、再配信で拾い直す
                    log::info!("停止要求のためジョブ {job_id} のリトライを中断");
                    return Ok(Processed::Deferred);
                }
            }

            job = match d.manager.claim(job_id)? {
                Some(job) => job,
                None => {
                    log::info!("ジョブ {job_id} はリトライ待ちの間に取り消されたか他のワーカーが取得");
                    return self.refused(job_id);
                }
            };
            if job.cancel_requested {
                d.manager.finish_cancelled(job_id)?;
                return Ok(Processed::Done);
            }
        }
    }

    /// claim できなかった配信の扱い。終端なら ack、まだ動くジョブなら再配信に残す。
    ///
    /// RUNNING は生きた試行の最中か、落ちたワーカーの放棄分。
    /// 後者は `stale_after` を過ぎた再配信で引き継がれる。
    fn refused(&self, job_id: &str) -> Result<Processed, ManagerError> {
        match self.deps.manager.get(job_id) {
            Ok(job) if job.status.is_terminal() => {
                log::debug!("ジョブ {job_id} は {} のため配信を破棄", job.status.as_str());
                Ok(Processed::Done)
            }
            Ok(job) => {
                log::debug!(
                    "ジョブ {job_id} は {} のため claim できない（再配信待ち）",
                    job.status.as_str()
                );
                Ok(Processed::Deferred)
            }
            Err(ManagerError::NotFound(_)) => {
                log::warn!("ジョブ {job_id} のレコードがないため配信を破棄");
                Ok(Processed::Done)
            }
            Err(e) => Err(e),
        }
    }

    /// VoiceRef をエンジンに渡せる形にする。プロファイルは利用回数を記録する。
    fn resolve_voice(
        &self,
        job: &Job,
    ) -> Result<Result<Option<ResolvedVoice>, JobFailure>, StoreError> {
        match &job.inputs.voice {
            None => Ok(Ok(None)),
            Some(VoiceRef::Preset(id)) => Ok(Ok(Some(ResolvedVoice::Preset(id.clone())))),
            Some(VoiceRef::Profile(id)) => match self.deps.voices.record_use(id)? {
                Some(profile) => Ok(Ok(Some(ResolvedVoice::Reference {
                    audio_path: profile.artifact_path,
                    transcript: profile.transcript,
                }))),
                None => Ok(Err(JobFailure::validation(format!(
                    "voice profile {id} does not exist"
                )))),
            },
        }
    }

    /// 1試行。選ばれたエンジンが資源枯渇/利用不可なら同じ試行番号で代替エンジンへ。
    ///
    /// 試行の記録を拒まれたら（引き継ぎ、終端化）None で、以降のエンジンは呼ばない。
    async fn run_attempt(
        &self,
        job: &Job,
        attempt: u32,
        decision: &EngineDecision,
        voice: Option<&ResolvedVoice>,
    ) -> Result<Option<Result<Produced, AttemptFailure>>, ManagerError> {
        let d = &self.deps;
        let mut engine = decision.engine;
        let mut fallback_from: Option<EngineKind> = None;

        loop {
            let rule = match fallback_from {
                Some(from) => format!("fallback:{from}"),
                None => decision.rule.clone(),
            };
            let started_at = Utc::now();
            let breaker = d.breakers.get(engine);
            let result = if breaker.try_acquire() {
                let result = self.invoke(engine, job, attempt, voice).await;
                match &result {
                    Ok(_) => breaker.record_success(),
                    Err(f) => {
                        breaker.record_error(&f.error);
                        if needs_reclaim(&f.error) {
                            d.reclaimer.reclaim(engine, &f.error);
                        }
                    }
                }
                result
            } else {
                d.metrics.inc_breaker_short_circuits();
                Err(AttemptFailure::synthesis(EngineError::unavailable(format!(
                    "circuit open for {engine}"
                ))))
            };

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Succeeded,
                Err(f) => {
                    log::warn!(
                        "ジョブ {} 試行 {attempt} engine={engine} 失敗: {}",
                        job.id,
                        f.error
                    );
                    let failure = f.failure();
                    AttemptOutcome::Failed {
                        kind: failure.kind,
                        message: failure.message,
                    }
                }
            };
            let recorded = d.manager.record_attempt(
                &job.id,
                EngineAttempt {
                    attempt,
                    engine,
                    rule,
                    fallback: fallback_from.is_some(),
                    outcome,
                    started_at,
                    finished_at: Utc::now(),
                },
            )?;
            if recorded.is_none() {
                if let Ok(produced) = &result {
                    self.discard_produced(produced);
                }
                return Ok(None);
            }

            let failure = match result {
                Ok(produced) => return Ok(Some(Ok(produced))),
                Err(failure) => failure,
            };
            let alternate = if fallback_from.is_none() && failure.error.fallback_eligible() {
                d.engines.fallback_for(engine)
            } else {
                None
            };
            match alternate {
                Some(next) => {
                    log::warn!("ジョブ {} を {engine} から {next} へフォールバック", job.id);
                    d.metrics.inc_fallbacks();
                    fallback_from = Some(engine);
                    engine = next;
                }
                None => return Ok(Some(Err(failure))),
            }
        }
    }

    /// モードに応じてエンジンを呼ぶ
    async fn invoke(
        &self,
        kind: EngineKind,
        job: &Job,
        attempt: u32,
        voice: Option<&ResolvedVoice>,
    ) -> Result<Produced, AttemptFailure> {
        match job.mode {
            JobMode::Synthesize => {
                let artifact = self
                    .synthesize(kind, job, attempt, voice.cloned())
                    .await
                    .map_err(AttemptFailure::synthesis)?;
                Ok(Produced {
                    artifact,
                    clone: None,
                })
            }
            JobMode::Clone => {
                let cloned = self.clone_reference(kind, job, attempt).await?;
                Ok(Produced {
                    artifact: cloned.artifact.clone(),
                    clone: Some(cloned),
                })
            }
            JobMode::SynthesizeWithClone => {
                let cloned = self.clone_reference(kind, job, attempt).await?;
                if let Err(e) = self.deps.manager.set_progress(&job.id, 0.5) {
                    log::warn!("ジョブ {} の進捗を記録できません: {e}", job.id);
                }
                let voice = ResolvedVoice::Reference {
                    audio_path: cloned.artifact.path.clone(),
                    transcript: cloned.transcript.clone(),
                };
                match self.synthesize(kind, job, attempt, Some(voice)).await {
                    Ok(artifact) => Ok(Produced {
                        artifact,
                        clone: Some(cloned),
                    }),
                    Err(e) => {
                        self.discard(&cloned.artifact.path);
                        Err(AttemptFailure::synthesis(e))
                    }
                }
            }
        }
    }

    async fn synthesize(
        &self,
        kind: EngineKind,
        job: &Job,
        attempt: u32,
        voice: Option<ResolvedVoice>,
    ) -> Result<AudioArtifact, EngineError> {
        let engine = self.deps.factory.get(kind);
        let request = SynthesisRequest {
            job_id: job.id.clone(),
            text: job.inputs.text.clone().unwrap_or_default(),
            language: job.inputs.language.clone(),
            voice,
            quality: job.inputs.quality,
            output_path: self.deps.artifacts.job_output_path(&job.id, attempt, kind),
        };
        let started = std::time::Instant::now();
        let result = self.timed(engine.synthesize(&request)).await;
        self.deps
            .metrics
            .record_latency("synthesize", started.elapsed().as_millis() as u64);
        if result.is_err() {
            self.discard(&request.output_path);
        }
        result
    }

    async fn clone_reference(
        &self,
        kind: EngineKind,
        job: &Job,
        attempt: u32,
    ) -> Result<ClonedVoice, AttemptFailure> {
        let Some(reference) = &job.inputs.reference_audio else {
            return Err(AttemptFailure::clone_phase(EngineError::invalid_input(
                "reference audio missing",
            )));
        };
        let engine = self.deps.factory.get(kind);
        let request = CloneRequest {
            job_id: job.id.clone(),
            reference_audio: reference.path.clone(),
            language: job.inputs.language.clone(),
            transcript: job.inputs.reference_transcript.clone(),
            output_path: self.deps.artifacts.staging_path(&job.id, attempt, kind),
        };
        let started = std::time::Instant::now();
        let result = self.timed(engine.clone_voice(&request)).await;
        self.deps
            .metrics
            .record_latency("clone", started.elapsed().as_millis() as u64);
        result.map_err(|e| {
            self.discard(&request.output_path);
            AttemptFailure::clone_phase(e)
        })
    }

    /// エンジン呼び出しのハードタイムアウト
    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.invocation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(format!(
                "engine call exceeded {}s",
                self.invocation_timeout.as_secs()
            ))),
        }
    }

    /// 成功した試行を終端状態にする。クローン系はプロファイルを確定してから。
    fn finish(&self, job: &Job, produced: Produced) -> Result<(), ManagerError> {
        let d = &self.deps;
        let Produced { artifact, clone } = produced;

        let (output, profile_id) = match clone {
            None => (
                JobOutput {
                    artifact_path: artifact.path,
                    duration_ms: artifact.duration_ms,
                    sample_rate: artifact.sample_rate,
                    voice_profile_id: None,
                    transcript: None,
                },
                None,
            ),
            Some(cloned) => {
                let profile = match self.persist_profile(job, &cloned) {
                    Ok(profile) => profile,
                    Err(e) => {
                        log::error!("ジョブ {} の VoiceProfile 保存に失敗: {e}", job.id);
                        if job.mode == JobMode::SynthesizeWithClone {
                            self.discard(&artifact.path);
                        }
                        d.manager.fail(
                            &job.id,
                            JobFailure::new(
                                ErrorKind::StoreUnavailable,
                                "voice profile could not be saved",
                            ),
                        )?;
                        return Ok(());
                    }
                };
                let (path, duration_ms, sample_rate) = match job.mode {
                    // クローンジョブの出力はプロファイルの参照音声そのもの
                    JobMode::Clone => (
                        profile.artifact_path.clone(),
                        cloned.artifact.duration_ms,
                        cloned.artifact.sample_rate,
                    ),
                    _ => (artifact.path, artifact.duration_ms, artifact.sample_rate),
                };
                (
                    JobOutput {
                        artifact_path: path,
                        duration_ms,
                        sample_rate,
                        voice_profile_id: Some(profile.id.clone()),
                        transcript: profile.transcript.clone(),
                    },
                    Some(profile.id),
                )
            }
        };

        if d.manager.complete(&job.id, output)?.is_none() {
            // 他の書き手が先に終端にした。作ったプロファイルは残さない。
            if let Some(id) = profile_id {
                log::warn!("ジョブ {} は完了できなかったため VoiceProfile {id} を削除", job.id);
                d.voices.delete(&id)?;
            }
        }
        Ok(())
    }

    /// ステージング済みのクローン結果を VoiceProfile として確定する。
    /// 失敗時はアーティファクトもレコードも残さない。
    fn persist_profile(&self, job: &Job, cloned: &ClonedVoice) -> Result<VoiceProfile, StoreError> {
        let d = &self.deps;
        let mut profile = VoiceProfile::new(
            job.id.clone(),
            cloned.artifact.path.clone(),
            cloned
                .transcript
                .clone()
                .or_else(|| job.inputs.reference_transcript.clone()),
            job.inputs.language.clone(),
            d.voice_ttl_secs,
            Utc::now(),
        );
        profile.artifact_path = match d.artifacts.promote(&cloned.artifact.path, &profile.id) {
            Ok(dest) => dest,
            Err(e) => {
                self.discard(&cloned.artifact.path);
                return Err(e);
            }
        };
        d.voices.create(&profile)?;
        log::info!("VoiceProfile {} を作成 (job {})", profile.id, job.id);
        Ok(profile)
    }

    fn discard_produced(&self, produced: &Produced) {
        self.discard(&produced.artifact.path);
        if let Some(cloned) = &produced.clone {
            if cloned.artifact.path != produced.artifact.path {
                self.discard(&cloned.artifact.path);
            }
        }
    }

    fn discard(&self, path: &std::path::Path) {
        if let Err(e) = self.deps.artifacts.remove(path) {
            log::warn!("中間アーティファクトの削除に失敗: {e}");
        }
    }
}

// ─── WorkerPool ──────────────────────────────────────────────────

/// 固定数のワーカータスク。プールの大きさが同時 claim 数の上限になる。
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        processor: Arc<JobProcessor>,
        queue: Arc<dyn TaskQueue>,
        queue_name: String,
        size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..size.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    processor.clone(),
                    queue.clone(),
                    queue_name.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// 全ワーカーの終了を待つ
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::error!("ワーカータスクが異常終了: {e}");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    processor: Arc<JobProcessor>,
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("ワーカー {worker_id} 起動 (queue={queue_name})");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            next = queue.consume(&queue_name) => next,
            _ = shutdown.changed() => break,
        };
        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(e) => {
                log::error!("ワーカー {worker_id}: キュー読み取り失敗: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match processor.process(&delivery.job_id, &mut shutdown).await {
            Ok(Processed::Done) => {
                if let Err(e) = queue.ack(&delivery).await {
                    log::error!("ジョブ {} の ack に失敗: {e}", delivery.job_id);
                }
            }
            Ok(Processed::Deferred) => {
                log::debug!("ジョブ {} の配信は ack せず再配信を待つ", delivery.job_id);
            }
            Err(e) => {
                log::error!(
                    "ジョブ {} の処理に失敗（再配信待ち）: {e}",
                    delivery.job_id
                );
            }
        }
    }
    log::info!("ワーカー {worker_id} 停止");
}
