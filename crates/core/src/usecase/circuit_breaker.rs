use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::domain::engine::{EngineError, EngineKind};
use crate::domain::settings::BreakerConfig;

/// ブレーカー状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// 素通し
    Closed,
    /// 呼び出さずに EngineUnavailable を返す
    Open,
    /// 試行1回だけ通す
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    /// ウィンドウ内の失敗時刻
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// エンジン単位のサーキットブレーカー。
///
/// 状態と失敗カウンタは1つの Mutex で守り、全ワーカーで共有する。
pub struct CircuitBreaker {
    engine: EngineKind,
    threshold: usize,
    window: Duration,
    recovery: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(engine: EngineKind, config: &BreakerConfig) -> Self {
        Self {
            engine,
            threshold: config.failure_threshold.max(1) as usize,
            window: Duration::from_secs(config.window_secs),
            recovery: Duration::from_secs(config.recovery_timeout_secs),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    /// 現在の状態。回復時間を過ぎた OPEN は HALF_OPEN として見える。
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// 呼び出してよいか。HALF_OPEN では試行中の呼び出しがなければ1件だけ通す。
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// 呼び出し結果を反映する。入力起因の失敗はエンジンの健全性に数えない。
    pub fn record<T>(&self, result: &Result<T, EngineError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_error(e),
        }
    }

    pub fn record_error(&self, error: &EngineError) {
        if error.counts_against_engine() {
            self.record_failure();
        } else {
            self.release();
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            // OPEN 前に通した呼び出しの遅れた成功は判定に使わない
            BreakerState::Open => return,
            BreakerState::HalfOpen => {
                log::info!("ブレーカー {}: 試行成功 → closed", self.engine)
            }
            BreakerState::Closed => {}
        }
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                log::warn!("ブレーカー {}: 試行失敗 → open", self.engine);
                self.trip(&mut inner, now);
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                inner.failures.push_back(now);
                self.prune(&mut inner, now);
                if inner.failures.len() >= self.threshold {
                    log::warn!(
                        "ブレーカー {}: {} 秒以内に {} 回失敗 → open",
                        self.engine,
                        self.window.as_secs(),
                        inner.failures.len()
                    );
                    self.trip(&mut inner, now);
                }
            }
        }
    }

    /// 判定に使わなかった試行枠を返す
    fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.failures.clear();
        inner.trial_in_flight = false;
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(&oldest) = inner.failures.front() {
            if now.duration_since(oldest) > self.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .opened_at
                .map_or(Duration::MAX, |t| now.duration_since(t));
            if elapsed >= self.recovery {
                log::info!("ブレーカー {}: 回復待ち経過 → half_open", self.engine);
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = false;
            }
        }
    }
}

/// プロセス内のエンジン別ブレーカー表
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<EngineKind, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, engine: EngineKind) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(engine)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(engine, &self.config)))
            .clone()
    }

    pub fn states(&self) -> Vec<(EngineKind, BreakerState)> {
        EngineKind::ALL
            .iter()
            .map(|&kind| (kind, self.get(kind).state()))
            .collect()
    }
}
