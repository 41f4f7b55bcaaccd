use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::domain::error::{ErrorKind, JobFailure, ManagerError};
use crate::domain::job::{
    AttemptOutcome, EngineAttempt, Job, JobInputs, JobMode, JobOutput, JobRequest, JobStatus,
    ReferenceAudio,
};
use crate::domain::settings::LimitsConfig;
use crate::infra::artifacts::probe_wav;
use crate::infra::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::infra::metrics::Metrics;
use crate::infra::queue::TaskQueue;
use crate::infra::storage::JobRepository;

/// 条件付き更新の最大試行回数
const MAX_CAS_ROUNDS: usize = 16;

/// 永続化が完了したジョブ。`dispatch` はこれしか受け取らない。
#[derive(Debug)]
pub struct CommittedJob {
    job_id: String,
}

impl CommittedJob {
    pub fn id(&self) -> &str {
        &self.job_id
    }
}

/// `update` に渡す部分更新
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f32>,
    pub error: Option<JobFailure>,
}

/// ジョブ状態遷移の唯一の書き手。
///
/// すべての書き込みはバージョン付きの条件付き書き込みで行い、
/// 負けた側は読み直して再適用する。遷移表に反する更新は
/// 競合としてログに残し、呼び出し元には返さない。
pub struct JobManager {
    jobs: JobRepository,
    queue: Arc<dyn TaskQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<Metrics>,
    limits: LimitsConfig,
    queue_name: String,
    dead_letter_threshold: u32,
    /// この時間更新のない RUNNING は放棄されたとみなす
    stale_after: Duration,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: JobRepository,
        queue: Arc<dyn TaskQueue>,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<Metrics>,
        limits: LimitsConfig,
        queue_name: String,
        dead_letter_threshold: u32,
        stale_after: Duration,
    ) -> Self {
        Self {
            jobs,
            queue,
            dead_letters,
            metrics,
            limits,
            queue_name,
            dead_letter_threshold,
            stale_after,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    // ==================== Submission ====================

    /// 入力を検証して PENDING のジョブを組み立てる（まだ永続化しない）
    pub fn create(&self, mode: JobMode, request: JobRequest) -> Result<Job, ManagerError> {
        let language = request
            .language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(self.limits.default_language.as_str())
            .to_string();
        if !self.limits.supported_languages.is_empty()
            && !self.limits.supported_languages.contains(&language)
        {
            return Err(ManagerError::validation(format!(
                "language '{language}' is not supported"
            )));
        }

        let text = if mode.needs_text() {
            let text = request.text.as_deref().map(str::trim).unwrap_or_default();
            if text.is_empty() {
                return Err(ManagerError::validation("text is required"));
            }
            let chars = text.chars().count();
            if chars > self.limits.max_text_chars {
                return Err(ManagerError::validation(format!(
                    "text is {chars} characters, limit is {}",
                    self.limits.max_text_chars
                )));
            }
            Some(text.to_string())
        } else {
            None
        };

        let reference_audio = match (mode.needs_reference_audio(), request.reference_audio) {
            (true, Some(path)) => Some(self.probe_reference(path)?),
            (true, None) => return Err(ManagerError::validation("reference audio is required")),
            (false, Some(_)) => {
                return Err(ManagerError::validation(
                    "reference audio is only accepted for clone jobs",
                ))
            }
            (false, None) => None,
        };

        if mode.needs_reference_audio() && request.voice.is_some() {
            return Err(ManagerError::validation(
                "a voice cannot be combined with reference audio",
            ));
        }

        let inputs = JobInputs {
            text,
            language,
            voice: request.voice,
            reference_audio,
            reference_transcript: request
                .reference_transcript
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            quality: request.quality,
        };
        Ok(Job::new(mode, request.caller_id, inputs, Utc::now()))
    }

    fn probe_reference(&self, path: std::path::PathBuf) -> Result<ReferenceAudio, ManagerError> {
        let info = probe_wav(&path).map_err(|e| {
            log::debug!("参照音声のプローブ失敗: {e}");
            ManagerError::validation("reference audio is not a readable WAV file")
        })?;
        let secs = info.duration_ms as f32 / 1000.0;
        if secs < self.limits.min_reference_secs || secs > self.limits.max_reference_secs {
            return Err(ManagerError::validation(format!(
                "reference audio must be between {}s and {}s, got {secs:.2}s",
                self.limits.min_reference_secs, self.limits.max_reference_secs
            )));
        }
        Ok(ReferenceAudio {
            path,
            duration_ms: info.duration_ms,
            sample_rate: info.sample_rate,
        })
    }

    /// 全項目を永続化する。これが返るまでジョブはどのワーカーにも見えない。
    pub fn commit(&self, job: &Job) -> Result<CommittedJob, ManagerError> {
        if job.status != JobStatus::Pending {
            return Err(ManagerError::InvalidState {
                job_id: job.id.clone(),
                from: job.status.as_str(),
                to: JobStatus::Pending.as_str(),
            });
        }
        if !job.inputs_complete() {
            return Err(ManagerError::validation(format!(
                "job inputs are incomplete for mode {}",
                job.mode.as_str()
            )));
        }
        if !self.jobs.insert(job)? {
            return Err(ManagerError::AlreadyExists(job.id.clone()));
        }
        log::debug!("ジョブ {} を永続化 ({})", job.id, job.mode.as_str());
        Ok(CommittedJob {
            job_id: job.id.clone(),
        })
    }

    /// ENQUEUED に進めてから ID だけをキューに積む
    pub async fn dispatch(&self, committed: CommittedJob) -> Result<(), ManagerError> {
        let job_id = committed.job_id;
        if self
            .modify(&job_id, "dispatch", |job| advance(job, JobStatus::Enqueued))?
            .is_none()
        {
            return Err(self.invalid_state(&job_id, JobStatus::Enqueued)?);
        }

        if let Err(e) = self.queue.enqueue(&job_id, &self.queue_name).await {
            log::error!("ジョブ {job_id} のキュー投入に失敗: {e}");
            let failure = JobFailure::new(ErrorKind::Internal, "job could not be queued");
            if let Err(fe) = self.fail(&job_id, failure) {
                log::error!("ジョブ {job_id} を FAILED にできませんでした: {fe}");
            }
            return Err(e.into());
        }
        log::info!("ジョブ {job_id} を {} に投入", self.queue_name);
        Ok(())
    }

    /// create → commit → dispatch をまとめて行い、ジョブ ID を返す
    pub async fn submit(&self, mode: JobMode, request: JobRequest) -> Result<String, ManagerError> {
        let job = self.create(mode, request)?;
        let committed = self.commit(&job)?;
        self.dispatch(committed).await?;
        self.metrics.inc_jobs_submitted();
        Ok(job.id)
    }

    pub fn get(&self, job_id: &str) -> Result<Job, ManagerError> {
        self.jobs
            .get(job_id)?
            .map(|(job, _)| job)
            .ok_or_else(|| ManagerError::NotFound(job_id.to_string()))
    }

    /// PENDING/ENQUEUED は即 CANCELLED。RUNNING は要求フラグを立てるだけ。
    pub fn cancel(&self, job_id: &str) -> Result<Job, ManagerError> {
        let applied = self.modify(job_id, "cancel", |job| match job.status {
            JobStatus::Pending | JobStatus::Enqueued => {
                mark_cancelled(job);
                Ok(())
            }
            JobStatus::Running => {
                job.cancel_requested = true;
                Ok(())
            }
            other => Err(format!("already {}", other.as_str())),
        })?;
        match applied {
            Some(job) => {
                if job.status == JobStatus::Cancelled {
                    self.metrics.inc_jobs_cancelled();
                    log::info!("ジョブ {job_id} をキャンセル");
                } else {
                    log::info!("ジョブ {job_id} は実行中のためキャンセル要求のみ記録");
                }
                Ok(job)
            }
            None => Err(self.invalid_state(job_id, JobStatus::Cancelled)?),
        }
    }

    /// 汎用の部分更新。遷移表と進捗の単調性に反するものは破棄して None。
    pub fn update(&self, job_id: &str, update: JobUpdate) -> Result<Option<Job>, ManagerError> {
        self.modify(job_id, "update", |job| {
            if job.status.is_terminal() {
                return Err(format!("job is {}", job.status.as_str()));
            }
            if let Some(next) = update.status {
                if next != job.status {
                    advance(job, next)?;
                }
            }
            if let Some(p) = update.progress {
                let p = p.clamp(0.0, 1.0);
                if job.status != JobStatus::Running && job.status != JobStatus::Completed {
                    return Err(format!("progress on {} job", job.status.as_str()));
                }
                if p < job.progress {
                    return Err(format!("progress regression {} -> {p}", job.progress));
                }
                job.progress = p;
            }
            if let Some(error) = &update.error {
                job.error = Some(error.clone());
            }
            if job.status.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
            Ok(())
        })
    }

    // ==================== Worker side ====================

    /// RUNNING への条件付き遷移。取れなければ None でワーカーは手を引く。
    ///
    /// 受け付けるのは ENQUEUED、リトライ待ちの PENDING、
    /// 放棄された（`stale_after` 以上更新のない）RUNNING。
    pub fn claim(&self, job_id: &str) -> Result<Option<Job>, ManagerError> {
        let stale_ms = self.stale_after.as_millis() as i64;
        self.modify(job_id, "claim", |job| match job.status {
            JobStatus::Enqueued => advance(job, JobStatus::Running),
            JobStatus::Pending if job.retry_count > 0 => advance(job, JobStatus::Running),
            JobStatus::Running
                if (Utc::now() - job.updated_at).num_milliseconds() > stale_ms =>
            {
                log::warn!("ジョブ {} の放棄された試行を引き継ぎ", job.id);
                job.retry_count += 1;
                Ok(())
            }
            other => Err(format!("cannot claim {} job", other.as_str())),
        })
    }

    /// エンジン呼び出し1回分を監査記録に追加する。
    ///
    /// 試行番号が現在の `retry_count + 1` と一致しなければ None。
    /// 放棄扱いで引き継がれた後の古いワーカーはここで締め出される。
    pub fn record_attempt(
        &self,
        job_id: &str,
        attempt: EngineAttempt,
    ) -> Result<Option<Job>, ManagerError> {
        self.modify(job_id, "record_attempt", |job| {
            if job.status != JobStatus::Running {
                return Err(format!("job is {}", job.status.as_str()));
            }
            if attempt.attempt != job.retry_count + 1 {
                return Err(format!(
                    "attempt {} superseded by attempt {}",
                    attempt.attempt,
                    job.retry_count + 1
                ));
            }
            if matches!(attempt.outcome, AttemptOutcome::Failed { .. }) {
                job.failure_count += 1;
            }
            job.attempts.push(attempt.clone());
            Ok(())
        })
    }

    pub fn set_progress(&self, job_id: &str, progress: f32) -> Result<Option<Job>, ManagerError> {
        self.update(
            job_id,
            JobUpdate {
                progress: Some(progress),
                ..Default::default()
            },
        )
    }

    pub fn complete(&self, job_id: &str, output: JobOutput) -> Result<Option<Job>, ManagerError> {
        let applied = self.modify(job_id, "complete", |job| {
            advance(job, JobStatus::Completed)?;
            job.progress = 1.0;
            job.output = Some(output.clone());
            job.error = None;
            job.completed_at = Some(Utc::now());
            Ok(())
        })?;
        if applied.is_some() {
            self.metrics.inc_jobs_completed();
            log::info!("ジョブ {job_id} 完了 ({} ms)", output.duration_ms);
        }
        Ok(applied)
    }

    /// RUNNING → PENDING（retry_count + 1）。キャンセル要求があれば CANCELLED。
    pub fn begin_retry(&self, job_id: &str) -> Result<Option<Job>, ManagerError> {
        let applied = self.modify(job_id, "begin_retry", |job| {
            if job.status != JobStatus::Running {
                return Err(format!("job is {}", job.status.as_str()));
            }
            if job.cancel_requested {
                mark_cancelled(job);
            } else {
                advance(job, JobStatus::Pending)?;
                job.retry_count += 1;
            }
            Ok(())
        })?;
        match &applied {
            Some(job) if job.status == JobStatus::Cancelled => {
                self.metrics.inc_jobs_cancelled();
                log::info!("ジョブ {job_id} はリトライ前にキャンセル");
            }
            Some(job) => {
                self.metrics.inc_retries();
                log::info!("ジョブ {job_id} をリトライ待ちへ (retry {})", job.retry_count);
            }
            None => {}
        }
        Ok(applied)
    }

    /// 実行中のキャンセル要求を確定する
    pub fn finish_cancelled(&self, job_id: &str) -> Result<Option<Job>, ManagerError> {
        let applied = self.modify(job_id, "finish_cancelled", |job| {
            if job.status != JobStatus::Running || !job.cancel_requested {
                return Err("no pending cancellation".to_string());
            }
            mark_cancelled(job);
            Ok(())
        })?;
        if applied.is_some() {
            self.metrics.inc_jobs_cancelled();
        }
        Ok(applied)
    }

    /// FAILED にする。累積失敗が閾値を超えていればデッドレターにも送る。
    pub fn fail(&self, job_id: &str, failure: JobFailure) -> Result<Option<Job>, ManagerError> {
        let applied = self.modify(job_id, "fail", |job| {
            advance(job, JobStatus::Failed)?;
            job.error = Some(failure.clone());
            job.completed_at = Some(Utc::now());
            Ok(())
        })?;
        let Some(job) = applied else {
            return Ok(None);
        };
        log::warn!("ジョブ {job_id} 失敗: {failure}");
        self.metrics.inc_job_failed(failure.kind);

        if job.failure_count > self.dead_letter_threshold {
            self.dead_letters.append(DeadLetterEntry {
                job_id: job.id.clone(),
                error: failure,
                failed_at: job.completed_at.unwrap_or(job.updated_at),
                failures: job.failure_count,
            })?;
            self.metrics.inc_jobs_dead_lettered();
        }
        Ok(Some(job))
    }

    /// デッドレターのジョブを PENDING に戻し、ID で再投入する
    pub async fn replay(&self, job_id: &str) -> Result<(), ManagerError> {
        if self.dead_letters.get(job_id)?.is_none() {
            return Err(ManagerError::NotFound(job_id.to_string()));
        }
        let applied = self.modify(job_id, "replay", |job| {
            if job.status != JobStatus::Failed {
                return Err(format!("job is {}", job.status.as_str()));
            }
            job.status = JobStatus::Pending;
            job.error = None;
            job.output = None;
            job.progress = 0.0;
            job.retry_count = 0;
            job.failure_count = 0;
            job.cancel_requested = false;
            job.completed_at = None;
            Ok(())
        })?;
        if applied.is_none() {
            return Err(self.invalid_state(job_id, JobStatus::Pending)?);
        }
        self.dead_letters.remove(job_id)?;
        log::info!("デッドレターからジョブ {job_id} を再投入");
        self.dispatch(CommittedJob {
            job_id: job_id.to_string(),
        })
        .await
    }

    // ==================== internals ====================

    /// 読み直し → 適用 → 条件付き書き込みを勝つまで繰り返す
    fn modify<F>(&self, job_id: &str, op: &str, mut apply: F) -> Result<Option<Job>, ManagerError>
    where
        F: FnMut(&mut Job) -> Result<(), String>,
    {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some((mut job, version)) = self.jobs.get(job_id)? else {
                return Err(ManagerError::NotFound(job_id.to_string()));
            };
            if let Err(reason) = apply(&mut job) {
                log::warn!("ジョブ {job_id} の {op} を破棄（競合）: {reason}");
                return Ok(None);
            }
            job.updated_at = Utc::now();
            if self.jobs.replace(&job, version)?.is_some() {
                return Ok(Some(job));
            }
            log::debug!("ジョブ {job_id} の {op} が書き込み競合、再試行");
        }
        log::warn!("ジョブ {job_id} の {op} は競合が続いたため破棄");
        Ok(None)
    }

    fn invalid_state(&self, job_id: &str, to: JobStatus) -> Result<ManagerError, ManagerError> {
        let job = self.get(job_id)?;
        Ok(ManagerError::InvalidState {
            job_id: job_id.to_string(),
            from: job.status.as_str(),
            to: to.as_str(),
        })
    }
}

fn advance(job: &mut Job, next: JobStatus) -> Result<(), String> {
    if !job.status.can_transition_to(next) {
        return Err(format!(
            "{} -> {} is not allowed",
            job.status.as_str(),
            next.as_str()
        ));
    }
    job.status = next;
    Ok(())
}

fn mark_cancelled(job: &mut Job) {
    job.status = JobStatus::Cancelled;
    job.error = Some(JobFailure::cancelled());
    job.completed_at = Some(Utc::now());
}
