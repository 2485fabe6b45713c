//! Fixed-window rate limiting keyed by client fingerprint.
//!
//! Counts requests per identifier within non-overlapping windows of fixed
//! duration. State is process-local: restarting the server forgets all
//! windows, and multiple server processes do not share budgets. That is an
//! accepted limitation: the limiter deters abuse, it is not a security
//! boundary.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitSettings;

/// How much of the user agent participates in the fingerprint.
const USER_AGENT_PREFIX: usize = 50;

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    reset: DateTime<Utc>,
}

/// Outcome of a limiter check, surfaced to callers as response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset: DateTime<Utc>,
}

/// In-memory fixed-window request counter.
pub struct RateLimiter {
    entries: Mutex<FxHashMap<String, WindowEntry>>,
    max_requests: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(settings: &RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            max_requests: settings.max_requests,
            window: Duration::milliseconds(settings.window_ms),
            clock,
        }
    }

    /// Count one request for `identifier` against the current window.
    ///
    /// A fresh or expired window opens with count 1. At capacity the call
    /// reports `allowed: false` without incrementing further, keeping the
    /// window's existing reset time so the caller can tell the client when
    /// to retry.
    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get_mut(identifier) {
            Some(entry) if now < entry.reset => {
                if entry.count >= self.max_requests {
                    return RateLimitDecision {
                        allowed: false,
                        limit: self.max_requests,
                        remaining: 0,
                        reset: entry.reset,
                    };
                }
                entry.count += 1;
                RateLimitDecision {
                    allowed: true,
                    limit: self.max_requests,
                    remaining: self.max_requests - entry.count,
                    reset: entry.reset,
                }
            }
            _ => {
                let reset = now + self.window;
                entries.insert(identifier.to_string(), WindowEntry { count: 1, reset });
                RateLimitDecision {
                    allowed: true,
                    limit: self.max_requests,
                    remaining: self.max_requests - 1,
                    reset,
                }
            }
        }
    }

    /// Drop entries whose window has already elapsed. Returns how many were
    /// removed. The server runs this periodically to bound memory.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.reset);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "swept expired rate limit windows");
        }
        removed
    }

    /// Number of identifiers currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Derive the rate-limit identifier for an anonymous request.
///
/// Prefers the first hop of `x-forwarded-for`, then `x-real-ip`, then
/// `cf-connecting-ip`, then `"unknown"`, concatenated with a truncated user
/// agent to reduce collisions among NAT'd clients. Approximate and
/// spoofable, but good enough for abuse deterrence.
#[must_use]
pub fn client_fingerprint(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
    };

    let ip = header("x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .or_else(|| header("x-real-ip"))
        .or_else(|| header("cf-connecting-ip"))
        .unwrap_or("unknown");

    let user_agent = header("user-agent").unwrap_or("unknown");
    let truncated: String = user_agent.chars().take(USER_AGENT_PREFIX).collect();

    format!("anonymous:{ip}:{truncated}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::http::HeaderValue;

    fn limiter(clock: &ManualClock, max_requests: u32, window_ms: i64) -> RateLimiter {
        RateLimiter::new(
            &RateLimitSettings {
                max_requests,
                window_ms,
                sweep_interval_secs: 300,
            },
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn eleventh_request_in_window_is_rejected() {
        let clock = ManualClock::new(Utc::now());
        let limiter = limiter(&clock, 10, 60_000);

        for expected_remaining in (0..10).rev() {
            let decision = limiter.check("A");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = limiter.check("A");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset >= clock.now());
    }

    #[test]
    fn rejection_does_not_extend_the_window() {
        let clock = ManualClock::new(Utc::now());
        let limiter = limiter(&clock, 1, 60_000);

        let first = limiter.check("A");
        clock.advance(Duration::seconds(30));
        let rejected = limiter.check("A");

        assert!(!rejected.allowed);
        assert_eq!(rejected.reset, first.reset);
    }

    #[test]
    fn window_reset_grants_fresh_budget() {
        let clock = ManualClock::new(Utc::now());
        let limiter = limiter(&clock, 2, 60_000);

        limiter.check("A");
        limiter.check("A");
        assert!(!limiter.check("A").allowed);

        clock.advance(Duration::seconds(61));
        let decision = limiter.check("A");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn identifiers_are_independent() {
        let clock = ManualClock::new(Utc::now());
        let limiter = limiter(&clock, 1, 60_000);

        assert!(limiter.check("A").allowed);
        assert!(!limiter.check("A").allowed);
        assert!(limiter.check("B").allowed);
    }

    #[test]
    fn sweep_drops_only_expired_windows() {
        let clock = ManualClock::new(Utc::now());
        let limiter = limiter(&clock, 5, 60_000);

        limiter.check("old");
        clock.advance(Duration::seconds(45));
        limiter.check("fresh");
        clock.advance(Duration::seconds(20));

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn fingerprint_prefers_forwarded_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));

        assert_eq!(
            client_fingerprint(&headers),
            "anonymous:203.0.113.7:Mozilla/5.0"
        );
    }

    #[test]
    fn fingerprint_falls_back_through_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(
            client_fingerprint(&headers),
            "anonymous:198.51.100.4:unknown"
        );

        assert_eq!(client_fingerprint(&HeaderMap::new()), "anonymous:unknown:unknown");
    }

    #[test]
    fn fingerprint_truncates_long_user_agents() {
        let mut headers = HeaderMap::new();
        let long_agent = "a".repeat(200);
        headers.insert("user-agent", HeaderValue::from_str(&long_agent).unwrap());

        let fingerprint = client_fingerprint(&headers);
        assert_eq!(fingerprint, format!("anonymous:unknown:{}", "a".repeat(50)));
    }
}
