use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::engine::{EngineHealth, EngineKind};
use crate::domain::error::StoreError;
use crate::domain::settings::ForgeSettings;
use crate::infra::artifacts::ArtifactStore;
use crate::infra::dead_letter::{DeadLetterSink, StoreDeadLetterSink};
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::infra::queue::TaskQueue;
use crate::infra::storage::{JobRepository, KvStore, VoiceProfileRepository};
use crate::infra::tts::EngineFactory;
use crate::usecase::circuit_breaker::{BreakerRegistry, BreakerState};
use crate::usecase::feature_flags::FeatureFlags;
use crate::usecase::job_manager::JobManager;
use crate::usecase::retry::{LogReclaimer, MemoryReclaimer, RetryPolicy};
use crate::usecase::router::EngineRouter;
use crate::usecase::worker::{JobProcessor, ProcessorDeps, WorkerPool};

/// エンジン1つ分の状態
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine: EngineKind,
    pub health: EngineHealth,
    pub breaker: BreakerState,
}

/// 外部のヘルスエンドポイント向け
#[derive(Debug, Clone, Serialize)]
pub struct ForgeHealth {
    pub running: bool,
    pub engines: Vec<EngineStatus>,
    pub metrics: MetricsSummary,
}

struct Running {
    pool: WorkerPool,
    housekeeping: JoinHandle<()>,
}

/// プロセス内の共有部品をまとめたもの。
///
/// ブレーカー、フラグ、エンジンキャッシュ、メトリクスはここで1つだけ作り、
/// 全ワーカーで共有する。グローバル変数は使わない。
pub struct ForgeContext {
    settings: ForgeSettings,
    store: Arc<dyn KvStore>,
    queue: Arc<dyn TaskQueue>,
    manager: Arc<JobManager>,
    voices: VoiceProfileRepository,
    factory: Arc<EngineFactory>,
    breakers: Arc<BreakerRegistry>,
    flags: Arc<FeatureFlags>,
    router: Arc<EngineRouter>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<Metrics>,
    processor: Arc<JobProcessor>,
    shutdown: watch::Sender<bool>,
    running: Mutex<Option<Running>>,
}

impl ForgeContext {
    pub fn new(
        settings: ForgeSettings,
        store: Arc<dyn KvStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Result<Self, StoreError> {
        Self::with_reclaimer(settings, store, queue, Arc::new(LogReclaimer))
    }

    pub fn with_reclaimer(
        settings: ForgeSettings,
        store: Arc<dyn KvStore>,
        queue: Arc<dyn TaskQueue>,
        reclaimer: Arc<dyn MemoryReclaimer>,
    ) -> Result<Self, StoreError> {
        let artifacts = ArtifactStore::open(settings.storage.artifact_dir())?;
        let metrics = Arc::new(Metrics::new());
        let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(StoreDeadLetterSink::new(
            store.clone(),
            Duration::from_secs(settings.dead_letter.retention_secs),
        ));
        let manager = Arc::new(JobManager::new(
            JobRepository::new(
                store.clone(),
                settings.storage.job_ttl_secs.map(Duration::from_secs),
            ),
            queue.clone(),
            dead_letters.clone(),
            metrics.clone(),
            settings.limits.clone(),
            settings.worker.queue_name.clone(),
            settings.dead_letter.failure_threshold,
            Duration::from_secs(settings.worker.lease_secs),
        ));
        let voices = VoiceProfileRepository::new(store.clone(), artifacts.clone());
        let factory = Arc::new(EngineFactory::new(settings.engines.clone()));
        let breakers = Arc::new(BreakerRegistry::new(settings.breaker.clone()));
        let flags = Arc::new(FeatureFlags::new(settings.rollout.clone()));
        let router = Arc::new(EngineRouter::new(
            flags.clone(),
            breakers.clone(),
            settings.engines.clone(),
        ));

        let processor = Arc::new(JobProcessor::new(ProcessorDeps {
            manager: manager.clone(),
            voices: voices.clone(),
            artifacts,
            factory: factory.clone(),
            breakers: breakers.clone(),
            router: router.clone(),
            reclaimer,
            metrics: metrics.clone(),
            retry: RetryPolicy::new(&settings.retry),
            engines: settings.engines.clone(),
            voice_ttl_secs: settings.storage.voice_profile_ttl_secs,
        }));

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            settings,
            store,
            queue,
            manager,
            voices,
            factory,
            breakers,
            flags,
            router,
            dead_letters,
            metrics,
            processor,
            shutdown,
            running: Mutex::new(None),
        })
    }

    // ==================== Accessors ====================

    pub fn settings(&self) -> &ForgeSettings {
        &self.settings
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn voices(&self) -> &VoiceProfileRepository {
        &self.voices
    }

    pub fn factory(&self) -> &Arc<EngineFactory> {
        &self.factory
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    pub fn router(&self) -> &Arc<EngineRouter> {
        &self.router
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterSink> {
        &self.dead_letters
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    // ==================== Lifecycle ====================

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// ワーカープールと定期掃除を起動する。二重起動は無視する。
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            log::warn!("ワーカープールは既に起動済み");
            return;
        }
        self.shutdown.send_replace(false);

        let pool = WorkerPool::spawn(
            self.processor.clone(),
            self.queue.clone(),
            self.settings.worker.queue_name.clone(),
            self.settings.worker.pool_size,
            self.shutdown.subscribe(),
        );
        let housekeeping = tokio::spawn(housekeeping_loop(
            self.store.clone(),
            self.voices.clone(),
            Duration::from_secs(self.settings.storage.housekeeping_secs.max(1)),
            self.shutdown.subscribe(),
        ));
        log::info!(
            "ワーカープール起動: {} ワーカー (queue={})",
            pool.size(),
            self.settings.worker.queue_name
        );
        *running = Some(Running { pool, housekeeping });
    }

    /// 新規の取り出しを止め、処理中のジョブが区切りに着くのを待つ。
    /// リトライ待ちのジョブは PENDING のまま残り、再配信で拾い直される。
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        log::info!("ワーカープール停止中");
        self.shutdown.send_replace(true);
        running.pool.join().await;
        if let Err(e) = running.housekeeping.await {
            log::error!("定期掃除タスクが異常終了: {e}");
        }
        self.queue.close();
        log::info!("ワーカープール停止");
    }

    /// 期限切れレコードの物理削除と孤児アーティファクトの回収
    pub fn run_housekeeping(&self) -> Result<(usize, usize), StoreError> {
        housekeeping(self.store.as_ref(), &self.voices)
    }

    /// エンジン準備状態、ブレーカー、メトリクス
    pub async fn health(&self) -> ForgeHealth {
        let engines = self
            .factory
            .health_report()
            .await
            .into_iter()
            .map(|(engine, health)| EngineStatus {
                engine,
                health,
                breaker: self.breakers.get(engine).state(),
            })
            .collect();
        ForgeHealth {
            running: self.is_running(),
            engines,
            metrics: self.metrics.summary(),
        }
    }
}

fn housekeeping(
    store: &dyn KvStore,
    voices: &VoiceProfileRepository,
) -> Result<(usize, usize), StoreError> {
    let purged = store.purge_expired()?;
    let reaped = voices.reap_orphans()?;
    if purged > 0 || reaped > 0 {
        log::info!("掃除: 期限切れ {purged} 件, 孤児アーティファクト {reaped} 件");
    }
    Ok((purged, reaped))
}

async fn housekeeping_loop(
    store: Arc<dyn KvStore>,
    voices: VoiceProfileRepository,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = housekeeping(store.as_ref(), &voices) {
                    log::warn!("定期掃除に失敗: {e}");
                }
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
}
