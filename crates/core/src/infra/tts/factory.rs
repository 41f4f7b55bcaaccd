use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{SidecarEngine, ToneEngine};
use crate::domain::engine::{EngineHealth, EngineKind, SynthesisEngine};
use crate::domain::settings::{EngineBackend, EnginesConfig};

/// エンジンバリアントからインスタンスへの対応表。
///
/// 初回要求時に設定のバックエンドから構築し、プロセス内でキャッシュする。
/// テストや組み込み先は `register` で任意の実装を差し込める。
pub struct EngineFactory {
    config: EnginesConfig,
    cache: Mutex<HashMap<EngineKind, Arc<dyn SynthesisEngine>>>,
}

impl EngineFactory {
    pub fn new(config: EnginesConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 構築済みのエンジンを差し替える
    pub fn register(&self, kind: EngineKind, engine: Arc<dyn SynthesisEngine>) {
        log::info!("エンジン登録: {kind} -> {}", engine.name());
        self.cache.lock().insert(kind, engine);
    }

    pub fn config(&self) -> &EnginesConfig {
        &self.config
    }

    /// バリアントのエンジンを取得（未構築なら構築）
    pub fn get(&self, kind: EngineKind) -> Arc<dyn SynthesisEngine> {
        let mut cache = self.cache.lock();
        cache
            .entry(kind)
            .or_insert_with(|| {
                let engine = build(self.config.backend(kind));
                log::info!("エンジン構築: {kind} -> {}", engine.name());
                engine
            })
            .clone()
    }

    /// 全バリアントの準備状態
    pub async fn health_report(&self) -> Vec<(EngineKind, EngineHealth)> {
        let mut report = Vec::with_capacity(EngineKind::ALL.len());
        for kind in EngineKind::ALL {
            let engine = self.get(kind);
            report.push((kind, engine.health().await));
        }
        report
    }
}

fn build(backend: &EngineBackend) -> Arc<dyn SynthesisEngine> {
    match backend {
        EngineBackend::Sidecar(cfg) => Arc::new(SidecarEngine::new(cfg.clone())),
        EngineBackend::Tone(cfg) => Arc::new(ToneEngine::new(cfg.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engine::{AudioArtifact, EngineError, SynthesisRequest};
    use crate::domain::settings::ToneConfig;

    struct Fixed;

    #[async_trait::async_trait]
    impl SynthesisEngine for Fixed {
        async fn synthesize(&self, _r: &SynthesisRequest) -> Result<AudioArtifact, EngineError> {
            Err(EngineError::failed("fixed"))
        }
        async fn health(&self) -> EngineHealth {
            EngineHealth::ready("fixed")
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn builds_from_config_and_caches() {
        let factory = EngineFactory::new(EnginesConfig::default());
        let a = factory.get(EngineKind::Primary);
        let b = factory.get(EngineKind::Primary);
        assert_eq!(a.name(), "sidecar");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.get(EngineKind::Secondary).name(), "tone");
    }

    #[test]
    fn register_overrides_backend() {
        let factory = EngineFactory::new(EnginesConfig::default());
        factory.register(EngineKind::Primary, Arc::new(Fixed));
        assert_eq!(factory.get(EngineKind::Primary).name(), "fixed");
    }

    #[tokio::test]
    async fn health_report_covers_all_variants() {
        let factory = EngineFactory::new(EnginesConfig {
            primary: EngineBackend::Tone(ToneConfig::default()),
            ..Default::default()
        });
        let report = factory.health_report().await;
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|(_, h)| h.ready));
    }
}
