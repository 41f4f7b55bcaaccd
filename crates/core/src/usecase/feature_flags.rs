use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::engine::EngineKind;
use crate::domain::settings::{RolloutConfig, RolloutPhase};

/// 判定を決めた規則
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DecisionRule {
    DenyList,
    AllowList,
    /// バケットとフェーズの割合で決まった
    Percentage { bucket: f32, percentage: f32 },
}

impl DecisionRule {
    /// 監査記録用の短い表記
    pub fn describe(&self, phase: RolloutPhase) -> String {
        match self {
            Self::DenyList => "flag:deny_list".to_string(),
            Self::AllowList => "flag:allow_list".to_string(),
            Self::Percentage { bucket, percentage } => {
                format!("flag:{}:{bucket:.2}<{percentage}", phase.as_str())
            }
        }
    }
}

/// 呼び出し元ごとのフラグ判定
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagDecision {
    pub flag: String,
    pub caller_id: String,
    pub phase: RolloutPhase,
    /// 新エンジン対象か
    pub enabled: bool,
    pub engine: EngineKind,
    pub rule: DecisionRule,
}

/// 呼び出し元 ID を [0, 100) に写す。乱数は使わない。
pub fn bucket(flag: &str, caller_id: &str) -> f32 {
    let digest = Sha256::digest(format!("{flag}:{caller_id}").as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 10_000) as f32 / 100.0
}

/// ロールアウト制御。設定の差し替えは次の判定から効く。
pub struct FeatureFlags {
    config: RwLock<RolloutConfig>,
}

impl FeatureFlags {
    pub fn new(config: RolloutConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> RolloutConfig {
        self.config.read().clone()
    }

    pub fn update(&self, config: RolloutConfig) {
        log::info!(
            "ロールアウト設定を更新: {} phase={} ({}%)",
            config.flag,
            config.phase.as_str(),
            config.percentage()
        );
        *self.config.write() = config;
    }

    pub fn decide(&self, caller_id: &str) -> FlagDecision {
        let config = self.config.read();
        let (enabled, rule) = if config.deny_list.iter().any(|c| c == caller_id) {
            (false, DecisionRule::DenyList)
        } else if config.allow_list.iter().any(|c| c == caller_id) {
            (true, DecisionRule::AllowList)
        } else {
            let bucket = bucket(&config.flag, caller_id);
            let percentage = config.percentage();
            (bucket < percentage, DecisionRule::Percentage { bucket, percentage })
        };
        FlagDecision {
            flag: config.flag.clone(),
            caller_id: caller_id.to_string(),
            phase: config.phase,
            enabled,
            engine: if enabled { config.candidate } else { config.baseline },
            rule,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(phase: RolloutPhase) -> FeatureFlags {
        FeatureFlags::new(RolloutConfig {
            phase,
            ..Default::default()
        })
    }

    #[test]
    fn test_bucket_range_and_stability() {
        for i in 0..500 {
            let b = bucket("synthesis_engine", &format!("caller-{i}"));
            assert!((0.0..100.0).contains(&b));
        }
        assert_eq!(bucket("f", "alice"), bucket("f", "alice"));
        assert_ne!(bucket("f", "alice"), bucket("g", "alice"));
    }

    #[test]
    fn test_phase_extremes() {
        let off = flags(RolloutPhase::Disabled);
        let ga = flags(RolloutPhase::Ga);
        for i in 0..200 {
            let caller = format!("caller-{i}");
            assert_eq!(off.decide(&caller).engine, EngineKind::Primary);
            assert_eq!(ga.decide(&caller).engine, EngineKind::Secondary);
        }
    }

    #[test]
    fn test_lists_override_percentage() {
        let f = FeatureFlags::new(RolloutConfig {
            phase: RolloutPhase::Ga,
            allow_list: vec!["vip".into(), "both".into()],
            deny_list: vec!["blocked".into(), "both".into()],
            ..Default::default()
        });
        let d = f.decide("blocked");
        assert!(!d.enabled);
        assert_eq!(d.rule, DecisionRule::DenyList);
        // deny が allow より優先
        assert_eq!(f.decide("both").rule, DecisionRule::DenyList);

        f.update(RolloutConfig {
            phase: RolloutPhase::Disabled,
            allow_list: vec!["vip".into()],
            ..Default::default()
        });
        let d = f.decide("vip");
        assert!(d.enabled);
        assert_eq!(d.rule, DecisionRule::AllowList);
    }

    #[test]
    fn test_update_takes_effect_immediately() {
        let f = flags(RolloutPhase::Disabled);
        assert!(!f.decide("caller-1").enabled);
        f.update(RolloutConfig {
            phase: RolloutPhase::Ga,
            ..Default::default()
        });
        assert!(f.decide("caller-1").enabled);
    }

    #[test]
    fn test_rule_description() {
        let d = flags(RolloutPhase::Beta).decide("caller-1");
        assert!(d.rule.describe(d.phase).starts_with("flag:beta:"));
    }
}
