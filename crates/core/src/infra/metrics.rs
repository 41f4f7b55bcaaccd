use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::error::ErrorKind;

/// 保持するレイテンシ記録の上限
const LATENCY_CAPACITY: usize = 1000;

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<VecDeque<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    jobs_submitted: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    jobs_cancelled: u64,
    jobs_dead_lettered: u64,
    retries: u64,
    fallbacks: u64,
    breaker_short_circuits: u64,
    errors_validation: u64,
    errors_audio: u64,
    errors_resource: u64,
    errors_unavailable: u64,
    errors_timeout: u64,
    errors_internal: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    /// "synthesize" / "clone" / "queue_wait" など
    pub phase: String,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー（外部の監視ツール向け）
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_dead_lettered: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub breaker_short_circuits: u64,
    pub error_counts: ErrorCounts,
    pub avg_latency_ms: AvgLatency,
    pub recent_latencies: Vec<LatencyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCounts {
    pub validation: u64,
    pub invalid_audio: u64,
    pub resource_exhausted: u64,
    pub engine_unavailable: u64,
    pub timeout: u64,
    pub internal: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvgLatency {
    pub synthesize: Option<f64>,
    pub clone: Option<f64>,
    pub queue_wait: Option<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(VecDeque::new()),
        }
    }

    pub fn inc_jobs_submitted(&self) {
        self.counters.lock().jobs_submitted += 1;
    }

    pub fn inc_jobs_completed(&self) {
        self.counters.lock().jobs_completed += 1;
    }

    pub fn inc_jobs_cancelled(&self) {
        self.counters.lock().jobs_cancelled += 1;
    }

    pub fn inc_jobs_dead_lettered(&self) {
        self.counters.lock().jobs_dead_lettered += 1;
    }

    pub fn inc_retries(&self) {
        self.counters.lock().retries += 1;
    }

    pub fn inc_fallbacks(&self) {
        self.counters.lock().fallbacks += 1;
    }

    pub fn inc_breaker_short_circuits(&self) {
        self.counters.lock().breaker_short_circuits += 1;
    }

    /// ジョブが FAILED になったときに種別ごとに数える
    pub fn inc_job_failed(&self, kind: ErrorKind) {
        let mut c = self.counters.lock();
        c.jobs_failed += 1;
        match kind {
            ErrorKind::Validation => c.errors_validation += 1,
            ErrorKind::InvalidAudioReference => c.errors_audio += 1,
            ErrorKind::ResourceExhausted => c.errors_resource += 1,
            ErrorKind::EngineUnavailable => c.errors_unavailable += 1,
            ErrorKind::Timeout => c.errors_timeout += 1,
            _ => c.errors_internal += 1,
        }
    }

    pub fn record_latency(&self, phase: &str, duration_ms: u64) {
        let record = LatencyRecord {
            phase: phase.to_string(),
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock();
        latencies.push_back(record);
        while latencies.len() > LATENCY_CAPACITY {
            latencies.pop_front();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock();
        let latencies = self.latencies.lock();

        let avg = |phase: &str| -> Option<f64> {
            let vals: Vec<f64> = latencies
                .iter()
                .filter(|r| r.phase == phase)
                .map(|r| r.duration_ms as f64)
                .collect();
            if vals.is_empty() {
                None
            } else {
                Some(vals.iter().sum::<f64>() / vals.len() as f64)
            }
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            jobs_submitted: c.jobs_submitted,
            jobs_completed: c.jobs_completed,
            jobs_failed: c.jobs_failed,
            jobs_cancelled: c.jobs_cancelled,
            jobs_dead_lettered: c.jobs_dead_lettered,
            retries: c.retries,
            fallbacks: c.fallbacks,
            breaker_short_circuits: c.breaker_short_circuits,
            error_counts: ErrorCounts {
                validation: c.errors_validation,
                invalid_audio: c.errors_audio,
                resource_exhausted: c.errors_resource,
                engine_unavailable: c.errors_unavailable,
                timeout: c.errors_timeout,
                internal: c.errors_internal,
            },
            avg_latency_ms: AvgLatency {
                synthesize: avg("synthesize"),
                clone: avg("clone"),
                queue_wait: avg("queue_wait"),
            },
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.inc_jobs_submitted();
        m.inc_jobs_submitted();
        m.inc_jobs_completed();
        m.inc_fallbacks();
        m.inc_job_failed(ErrorKind::InvalidAudioReference);
        m.inc_job_failed(ErrorKind::Timeout);
        m.inc_job_failed(ErrorKind::StoreUnavailable);

        let s = m.summary();
        assert_eq!(s.jobs_submitted, 2);
        assert_eq!(s.jobs_completed, 1);
        assert_eq!(s.jobs_failed, 3);
        assert_eq!(s.fallbacks, 1);
        assert_eq!(s.error_counts.invalid_audio, 1);
        assert_eq!(s.error_counts.timeout, 1);
        assert_eq!(s.error_counts.internal, 1);
    }

    #[test]
    fn test_latency_recording() {
        let m = Metrics::new();
        m.record_latency("synthesize", 120);
        m.record_latency("synthesize", 80);
        m.record_latency("clone", 200);

        let s = m.summary();
        assert!((s.avg_latency_ms.synthesize.unwrap() - 100.0).abs() < f64::EPSILON);
        assert!((s.avg_latency_ms.clone.unwrap() - 200.0).abs() < f64::EPSILON);
        assert!(s.avg_latency_ms.queue_wait.is_none());
        assert_eq!(s.recent_latencies.len(), 3);
        assert_eq!(s.recent_latencies[0].phase, "clone");
    }

    #[test]
    fn test_latency_cap() {
        let m = Metrics::new();
        for i in 0..1100 {
            m.record_latency("synthesize", i);
        }
        let latencies = m.latencies.lock();
        assert_eq!(latencies.len(), LATENCY_CAPACITY);
        assert_eq!(latencies.front().unwrap().duration_ms, 100);
    }
}
