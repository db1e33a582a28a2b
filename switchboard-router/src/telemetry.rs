//! Per-provider telemetry feeding routing decisions.
//!
//! Not a persistent store: each provider owns a bounded ring buffer of
//! recent call outcomes plus monotone counters. Appends and reads happen
//! inside one short per-provider critical section, so readers always see
//! a consistent (possibly slightly stale) view. Percentiles are computed
//! from the bounded buffer at read time; counters and the cost EWMA are
//! maintained incrementally.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use switchboard_models_sdk::error::ErrorKind;

const WINDOW_CAPACITY: usize = 1000;
/// error_rate_recent looks at the last N samples or the last T seconds,
/// whichever covers less.
const RECENT_SAMPLES: usize = 100;
const RECENT_WINDOW: Duration = Duration::from_secs(60);
const COST_EWMA_ALPHA: f64 = 0.1;

/// One completed (or canceled) call against a provider.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub ok: bool,
    pub canceled: bool,
    pub latency_ms: u64,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
    pub error_kind: Option<ErrorKind>,
}

impl CallOutcome {
    pub fn success(latency_ms: u64, tokens_in: u32, tokens_out: u32, cost_usd: f64) -> Self {
        Self {
            ok: true,
            canceled: false,
            latency_ms,
            tokens_in,
            tokens_out,
            cost_usd,
            error_kind: None,
        }
    }

    pub fn failure(latency_ms: u64, error_kind: ErrorKind) -> Self {
        Self {
            ok: false,
            canceled: false,
            latency_ms,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            error_kind: Some(error_kind),
        }
    }

    pub fn canceled(latency_ms: u64) -> Self {
        Self {
            ok: false,
            canceled: true,
            latency_ms,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            error_kind: Some(ErrorKind::Canceled),
        }
    }
}

#[derive(Debug, Clone)]
struct Sample {
    at: Instant,
    latency_ms: u64,
    ok: bool,
    canceled: bool,
}

#[derive(Debug)]
struct WindowInner {
    samples: VecDeque<Sample>,
    success_count: u64,
    failure_count: u64,
    canceled_count: u64,
    cumulative_cost_usd: f64,
    ewma_cost_per_request: f64,
}

/// Aggregated view of one provider's window.
#[derive(Debug, Clone, Serialize, Default)]
pub struct WindowStats {
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub canceled_count: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    /// Failure fraction over the recent slice, cancellations excluded
    pub error_rate_recent: f64,
    pub ewma_cost_per_request: f64,
    pub cumulative_cost_usd: f64,
}

/// Bounded ring buffer of call outcomes for one provider.
pub struct MetricsWindow {
    inner: Mutex<WindowInner>,
}

impl MetricsWindow {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WindowInner {
                samples: VecDeque::with_capacity(WINDOW_CAPACITY),
                success_count: 0,
                failure_count: 0,
                canceled_count: 0,
                cumulative_cost_usd: 0.0,
                ewma_cost_per_request: 0.0,
            }),
        }
    }

    /// Append one outcome and update the incremental aggregates.
    pub fn record(&self, outcome: CallOutcome) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");

        if inner.samples.len() == WINDOW_CAPACITY {
            inner.samples.pop_front();
        }
        inner.samples.push_back(Sample {
            at: Instant::now(),
            latency_ms: outcome.latency_ms,
            ok: outcome.ok,
            canceled: outcome.canceled,
        });

        if outcome.canceled {
            inner.canceled_count += 1;
        } else if outcome.ok {
            inner.success_count += 1;
        } else {
            inner.failure_count += 1;
        }

        inner.cumulative_cost_usd += outcome.cost_usd;
        if outcome.ok {
            inner.ewma_cost_per_request = COST_EWMA_ALPHA * outcome.cost_usd
                + (1.0 - COST_EWMA_ALPHA) * inner.ewma_cost_per_request;
        }
    }

    pub fn stats(&self) -> WindowStats {
        let inner = self.inner.lock().expect("metrics lock poisoned");

        let mut latencies: Vec<u64> = inner.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();

        let now = Instant::now();
        let recent: Vec<&Sample> = inner
            .samples
            .iter()
            .rev()
            .take(RECENT_SAMPLES)
            .take_while(|s| now.duration_since(s.at) <= RECENT_WINDOW)
            .filter(|s| !s.canceled)
            .collect();
        let error_rate_recent = if recent.is_empty() {
            0.0
        } else {
            recent.iter().filter(|s| !s.ok).count() as f64 / recent.len() as f64
        };

        WindowStats {
            request_count: inner.success_count + inner.failure_count + inner.canceled_count,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            canceled_count: inner.canceled_count,
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
            error_rate_recent,
            ewma_cost_per_request: inner.ewma_cost_per_request,
            cumulative_cost_usd: inner.cumulative_cost_usd,
        }
    }
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_partition_by_outcome() {
        let window = MetricsWindow::new();
        window.record(CallOutcome::success(80, 10, 5, 0.001));
        window.record(CallOutcome::failure(200, ErrorKind::Server5xx));
        window.record(CallOutcome::canceled(40));

        let stats = window.stats();
        assert_eq!(stats.request_count, 3);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.canceled_count, 1);
    }

    #[test]
    fn percentiles_reflect_latency_distribution() {
        let window = MetricsWindow::new();
        for latency in 1..=100u64 {
            window.record(CallOutcome::success(latency, 1, 1, 0.0));
        }
        let stats = window.stats();
        assert!((48..=52).contains(&stats.p50_latency_ms));
        assert!((93..=97).contains(&stats.p95_latency_ms));
    }

    #[test]
    fn error_rate_excludes_cancellations() {
        let window = MetricsWindow::new();
        window.record(CallOutcome::success(10, 1, 1, 0.0));
        window.record(CallOutcome::failure(10, ErrorKind::Timeout));
        window.record(CallOutcome::canceled(10));

        let stats = window.stats();
        assert!((stats.error_rate_recent - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn buffer_stays_bounded_but_counters_do_not() {
        let window = MetricsWindow::new();
        for _ in 0..(WINDOW_CAPACITY + 500) {
            window.record(CallOutcome::success(1, 1, 1, 0.0));
        }
        let stats = window.stats();
        assert_eq!(stats.success_count, (WINDOW_CAPACITY + 500) as u64);
    }

    #[test]
    fn cost_ewma_tracks_successful_requests() {
        let window = MetricsWindow::new();
        for _ in 0..200 {
            window.record(CallOutcome::success(10, 100, 100, 0.02));
        }
        let stats = window.stats();
        assert!((stats.ewma_cost_per_request - 0.02).abs() < 1e-6);
        assert!((stats.cumulative_cost_usd - 4.0).abs() < 1e-9);
    }
}
