use std::sync::Arc;

use serde::Serialize;

use crate::domain::engine::EngineKind;
use crate::domain::settings::EnginesConfig;
use crate::usecase::circuit_breaker::{BreakerRegistry, BreakerState};
use crate::usecase::feature_flags::{FeatureFlags, FlagDecision};

/// 1試行分のエンジン選択（試行ごとに計算し直す）
#[derive(Debug, Clone, Serialize)]
pub struct EngineDecision {
    pub engine: EngineKind,
    /// 監査記録に残す選択理由
    pub rule: String,
    pub flag: FlagDecision,
    /// フラグが選んだエンジンのブレーカー状態
    pub breaker: BreakerState,
    /// ブレーカーが OPEN で代替に回したか
    pub rerouted: bool,
}

/// フラグ判定とブレーカー状態からエンジンを決める
pub struct EngineRouter {
    flags: Arc<FeatureFlags>,
    breakers: Arc<BreakerRegistry>,
    engines: EnginesConfig,
}

impl EngineRouter {
    pub fn new(
        flags: Arc<FeatureFlags>,
        breakers: Arc<BreakerRegistry>,
        engines: EnginesConfig,
    ) -> Self {
        Self {
            flags,
            breakers,
            engines,
        }
    }

    /// 読み取り専用の判定。HALF_OPEN の試行枠は消費しない。
    pub fn decide(&self, caller_id: &str) -> EngineDecision {
        let flag = self.flags.decide(caller_id);
        let preferred = flag.engine;
        let breaker = self.breakers.get(preferred).state();
        let rule = flag.rule.describe(flag.phase);

        if breaker == BreakerState::Open {
            let alternate = self
                .engines
                .fallback_for(preferred)
                .filter(|alt| self.breakers.get(*alt).state() != BreakerState::Open);
            if let Some(alt) = alternate {
                return EngineDecision {
                    engine: alt,
                    rule: format!("breaker_open:{preferred}"),
                    flag,
                    breaker,
                    rerouted: true,
                };
            }
        }

        EngineDecision {
            engine: preferred,
            rule,
            flag,
            breaker,
            rerouted: false,
        }
    }
}
