//! Sliding-window rate limiting per request identity.
//!
//! Each `(scope, value)` identity pair gets a lazily created bucket of
//! request timestamps. Admission checks every identity the request
//! carries (user, ip, session — in that order) against four windows
//! (minute, hour, day, burst — in that order); the first violated window
//! decides the denial and its `retry_after`, computed as the time until
//! the oldest timestamp inside that window ages out.
//!
//! Timestamps are recorded only after every check passes, so a denied
//! request consumes no quota and never reaches an adapter. Buckets trim
//! themselves on read and a periodic sweep drops buckets that have gone
//! quiet for longer than the largest window.

use crate::config::RateLimitConfig;
use crate::request::Identity;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Which window a denial came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitWindow {
    Minute,
    Hour,
    Day,
    Burst,
}

impl LimitWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Burst => "burst",
        }
    }
}

/// Denial detail returned to the caller.
#[derive(Debug, Clone)]
pub struct RateLimitExceeded {
    /// Which identity scope tripped ("user", "ip", "session")
    pub scope: &'static str,
    pub window: LimitWindow,
    pub retry_after: Duration,
}

/// Point-in-time usage for one identity, for operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub scope: &'static str,
    pub minute: usize,
    pub hour: usize,
    pub day: usize,
    pub burst: usize,
}

#[derive(Debug, Default)]
struct Bucket {
    timestamps: VecDeque<Instant>,
}

impl Bucket {
    fn trim(&mut self, now: Instant, max_window: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) > max_window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.timestamps
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) < window)
            .count()
    }

    /// Time until the oldest timestamp inside `window` leaves it.
    fn retry_after(&self, now: Instant, window: Duration) -> Duration {
        self.timestamps
            .iter()
            .find(|t| now.duration_since(**t) < window)
            .map(|oldest| window - now.duration_since(*oldest))
            .unwrap_or(Duration::ZERO)
    }
}

/// Multi-window sliding rate limiter over a concurrent bucket map.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Mutex<Bucket>>,
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn burst_window(&self) -> Duration {
        Duration::from_secs(self.config.burst_window_secs)
    }

    /// Windows in check order with their limits.
    fn windows(&self) -> [(LimitWindow, Duration, u32); 4] {
        [
            (LimitWindow::Minute, MINUTE, self.config.per_minute),
            (LimitWindow::Hour, HOUR, self.config.per_hour),
            (LimitWindow::Day, DAY, self.config.per_day),
            (LimitWindow::Burst, self.burst_window(), self.config.burst),
        ]
    }

    /// Admit or deny a request, recording it on admission.
    pub fn check(&self, identity: &Identity) -> Result<(), RateLimitExceeded> {
        self.check_at(identity, Instant::now())
    }

    /// Clock-injected variant backing `check`; used directly by tests.
    pub fn check_at(&self, identity: &Identity, now: Instant) -> Result<(), RateLimitExceeded> {
        let scopes = identity.scopes();

        // Phase 1: verify every identity against every window before
        // consuming any quota.
        for (scope, value) in scopes.iter().copied() {
            let key = Self::key(scope, value);
            let bucket = self.buckets.entry(key).or_default();
            let mut bucket = bucket.lock().expect("bucket lock poisoned");
            bucket.trim(now, DAY);

            for (window, duration, limit) in self.windows() {
                if bucket.count_within(now, duration) >= limit as usize {
                    let retry_after = bucket.retry_after(now, duration);
                    tracing::debug!(
                        "rate limit hit: scope={} window={} retry_after={:?}",
                        scope,
                        window.as_str(),
                        retry_after
                    );
                    return Err(RateLimitExceeded {
                        scope,
                        window,
                        retry_after,
                    });
                }
            }
        }

        // Phase 2: record the admission against every identity.
        for (scope, value) in scopes.iter().copied() {
            let key = Self::key(scope, value);
            let bucket = self.buckets.entry(key).or_default();
            bucket
                .lock()
                .expect("bucket lock poisoned")
                .timestamps
                .push_back(now);
        }

        Ok(())
    }

    /// Current per-window usage for each identity scope.
    pub fn usage(&self, identity: &Identity) -> Vec<UsageSnapshot> {
        let now = Instant::now();
        identity
            .scopes()
            .into_iter()
            .map(|(scope, value)| {
                let counts = self
                    .buckets
                    .get(&Self::key(scope, value))
                    .map(|bucket| {
                        let bucket = bucket.lock().expect("bucket lock poisoned");
                        (
                            bucket.count_within(now, MINUTE),
                            bucket.count_within(now, HOUR),
                            bucket.count_within(now, DAY),
                            bucket.count_within(now, self.burst_window()),
                        )
                    })
                    .unwrap_or((0, 0, 0, 0));
                UsageSnapshot {
                    scope,
                    minute: counts.0,
                    hour: counts.1,
                    day: counts.2,
                    burst: counts.3,
                }
            })
            .collect()
    }

    /// Drop buckets whose newest entry is older than the largest window.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock().expect("bucket lock poisoned");
            bucket
                .timestamps
                .back()
                .is_some_and(|newest| now.duration_since(*newest) <= DAY)
        });
    }

    /// Background sweep every `interval` (typically ~5 minutes).
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }

    fn key(scope: &str, value: &str) -> String {
        format!("{scope}:{value}")
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            per_minute,
            per_hour: 1000,
            per_day: 10_000,
            burst,
            burst_window_secs: 10,
        })
    }

    #[test]
    fn admits_until_minute_limit_then_denies_with_retry_after() {
        let limiter = limiter(2, 100);
        let identity = Identity::session("s1");
        let t0 = Instant::now();

        assert!(limiter.check_at(&identity, t0).is_ok());
        assert!(limiter.check_at(&identity, t0 + Duration::from_secs(1)).is_ok());

        let denied = limiter
            .check_at(&identity, t0 + Duration::from_secs(2))
            .unwrap_err();
        assert_eq!(denied.window, LimitWindow::Minute);
        assert_eq!(denied.scope, "session");
        // Oldest entry is at t0, checked at t0+2s: 58s until it ages out.
        assert!(denied.retry_after > Duration::from_secs(57));
        assert!(denied.retry_after <= Duration::from_secs(58));
    }

    #[test]
    fn admission_resumes_after_oldest_ages_out() {
        let limiter = limiter(2, 100);
        let identity = Identity::session("s1");
        let t0 = Instant::now();

        limiter.check_at(&identity, t0).unwrap();
        limiter.check_at(&identity, t0 + Duration::from_secs(1)).unwrap();
        assert!(limiter.check_at(&identity, t0 + Duration::from_secs(2)).is_err());

        // 61 seconds later the t0 entry has left the minute window.
        assert!(limiter.check_at(&identity, t0 + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn burst_window_checked_after_daily() {
        let limiter = limiter(100, 3);
        let identity = Identity::session("s1");
        let t0 = Instant::now();

        for i in 0..3 {
            limiter
                .check_at(&identity, t0 + Duration::from_millis(i * 10))
                .unwrap();
        }
        let denied = limiter
            .check_at(&identity, t0 + Duration::from_millis(40))
            .unwrap_err();
        assert_eq!(denied.window, LimitWindow::Burst);
        assert!(denied.retry_after <= Duration::from_secs(10));
    }

    #[test]
    fn denial_consumes_no_quota() {
        let limiter = limiter(2, 100);
        let identity = Identity::session("s1");
        let t0 = Instant::now();

        limiter.check_at(&identity, t0).unwrap();
        limiter.check_at(&identity, t0).unwrap();
        for _ in 0..5 {
            assert!(limiter.check_at(&identity, t0 + Duration::from_secs(1)).is_err());
        }

        let usage = limiter.usage(&identity);
        assert_eq!(usage[0].minute, 2);
    }

    #[test]
    fn user_scope_checked_before_session() {
        let limiter = limiter(1, 100);
        let shared_user = Identity {
            user_id: Some("u1".into()),
            client_ip: None,
            session_id: "s1".into(),
        };
        let other_session = Identity {
            user_id: Some("u1".into()),
            client_ip: None,
            session_id: "s2".into(),
        };
        let t0 = Instant::now();

        limiter.check_at(&shared_user, t0).unwrap();
        // Different session, same user: the user bucket trips first.
        let denied = limiter.check_at(&other_session, t0 + Duration::from_secs(1)).unwrap_err();
        assert_eq!(denied.scope, "user");
    }

    #[test]
    fn independent_sessions_do_not_interfere() {
        let limiter = limiter(1, 100);
        let t0 = Instant::now();

        limiter.check_at(&Identity::session("a"), t0).unwrap();
        assert!(limiter.check_at(&Identity::session("b"), t0).is_ok());
    }

    #[test]
    fn sweep_drops_only_stale_buckets() {
        let limiter = limiter(10, 100);
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(90_000);

        limiter.check_at(&Identity::session("stale"), t0).unwrap();
        limiter.check_at(&Identity::session("fresh"), later).unwrap();
        assert_eq!(limiter.bucket_count(), 2);

        limiter.sweep_at(later);
        assert_eq!(limiter.bucket_count(), 1);
    }
}
