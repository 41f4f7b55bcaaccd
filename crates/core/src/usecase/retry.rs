use std::time::Duration;

use crate::domain::engine::{EngineError, EngineErrorKind, EngineKind};
use crate::domain::settings::RetryConfig;

/// エンジン呼び出し1回の結果分類
#[derive(Debug)]
pub enum Outcome<T, E = EngineError> {
    Success(T),
    /// バックオフ後に再試行してよい
    Retryable(E),
    /// 再試行しても結果が変わらない
    Fatal(E),
}

impl<T, E> Outcome<T, E> {
    pub fn classify(result: Result<T, E>, retryable: impl FnOnce(&E) -> bool) -> Self {
        match result {
            Ok(v) => Outcome::Success(v),
            Err(e) if retryable(&e) => Outcome::Retryable(e),
            Err(e) => Outcome::Fatal(e),
        }
    }
}

impl<T> From<Result<T, EngineError>> for Outcome<T> {
    fn from(result: Result<T, EngineError>) -> Self {
        Outcome::classify(result, EngineError::retryable)
    }
}

/// 上限つき指数バックオフ
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempt` 回目（1 始まり）が失敗した後、次を試してよいか
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// `attempt` 回目が失敗した後の待ち時間
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// 資源枯渇時にデバイスメモリ等を解放させる外部フック
pub trait MemoryReclaimer: Send + Sync {
    fn reclaim(&self, engine: EngineKind, error: &EngineError);
}

/// ログを出すだけの既定実装
pub struct LogReclaimer;

impl MemoryReclaimer for LogReclaimer {
    fn reclaim(&self, engine: EngineKind, error: &EngineError) {
        log::info!("エンジン {engine} のメモリ回収を要求: {}", error.detail);
    }
}

/// 回収フックを呼ぶべき失敗か（タイムアウトは資源枯渇と同じ扱い）
pub fn needs_reclaim(error: &EngineError) -> bool {
    matches!(
        error.kind,
        EngineErrorKind::ResourceExhausted | EngineErrorKind::Timeout
    )
}
