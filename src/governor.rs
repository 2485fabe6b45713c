//! Per-(session, tool) usage caps for mid-generation tool calls.
//!
//! A soft anti-loop guard: a session may fire a given tool at most
//! `max_usage` times within a cooldown window measured from the *last* use.
//! Once the cooldown elapses the pair gets a fresh budget: a sliding reset,
//! not a lifetime cap, so long-lived sessions are never permanently blocked.
//! State is process-local and lost on restart, which is acceptable for a
//! guard of this kind.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::clock::Clock;
use crate::config::GovernorSettings;

#[derive(Debug, Clone)]
struct Usage {
    count: u32,
    last_used: DateTime<Utc>,
}

/// Tracks retrieval-tool invocations per `(session_id, tool_name)` pair.
pub struct ToolUsageGovernor {
    usage: Mutex<FxHashMap<(String, String), Usage>>,
    max_usage: u32,
    cooldown: Duration,
    idle_purge: Duration,
    clock: Arc<dyn Clock>,
}

impl ToolUsageGovernor {
    #[must_use]
    pub fn new(settings: &GovernorSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            usage: Mutex::new(FxHashMap::default()),
            max_usage: settings.max_usage,
            cooldown: Duration::milliseconds(settings.cooldown_ms),
            idle_purge: Duration::milliseconds(settings.idle_purge_ms),
            clock,
        }
    }

    /// Whether the pair still has budget. Resets the count first when the
    /// cooldown has elapsed since the last use.
    pub fn can_use(&self, session_id: &str, tool_name: &str) -> bool {
        let now = self.clock.now();
        let mut usage = self.usage.lock();
        let key = (session_id.to_string(), tool_name.to_string());

        match usage.get_mut(&key) {
            None => true,
            Some(entry) if now - entry.last_used > self.cooldown => {
                entry.count = 0;
                entry.last_used = now;
                true
            }
            Some(entry) => entry.count < self.max_usage,
        }
    }

    /// Record one invocation for the pair.
    pub fn record_use(&self, session_id: &str, tool_name: &str) {
        let now = self.clock.now();
        let mut usage = self.usage.lock();
        let key = (session_id.to_string(), tool_name.to_string());
        let entry = usage.entry(key).or_insert(Usage {
            count: 0,
            last_used: now,
        });
        entry.count += 1;
        entry.last_used = now;
    }

    /// Budget left for the pair in the current cooldown window.
    pub fn remaining(&self, session_id: &str, tool_name: &str) -> u32 {
        let now = self.clock.now();
        let usage = self.usage.lock();
        let key = (session_id.to_string(), tool_name.to_string());

        match usage.get(&key) {
            None => self.max_usage,
            Some(entry) if now - entry.last_used > self.cooldown => self.max_usage,
            Some(entry) => self.max_usage.saturating_sub(entry.count),
        }
    }

    /// Purge pairs idle longer than the configured threshold. Returns how
    /// many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut usage = self.usage.lock();
        let before = usage.len();
        usage.retain(|_, entry| now - entry.last_used <= self.idle_purge);
        let removed = before - usage.len();
        if removed > 0 {
            debug!(removed, "swept idle tool usage records");
        }
        removed
    }

    /// Maximum uses allowed within one cooldown window.
    #[must_use]
    pub fn max_usage(&self) -> u32 {
        self.max_usage
    }

    /// Cooldown window length in milliseconds.
    #[must_use]
    pub fn cooldown_ms(&self) -> i64 {
        self.cooldown.num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const TOOL: &str = "get_context";

    fn governor(clock: &ManualClock) -> ToolUsageGovernor {
        ToolUsageGovernor::new(&GovernorSettings::default(), Arc::new(clock.clone()))
    }

    #[test]
    fn budget_is_exhausted_after_max_uses() {
        let clock = ManualClock::new(Utc::now());
        let governor = governor(&clock);

        for _ in 0..3 {
            assert!(governor.can_use("s1", TOOL));
            governor.record_use("s1", TOOL);
        }

        assert!(!governor.can_use("s1", TOOL));
        assert_eq!(governor.remaining("s1", TOOL), 0);
    }

    #[test]
    fn cooldown_elapsing_resets_the_budget() {
        let clock = ManualClock::new(Utc::now());
        let governor = governor(&clock);

        for _ in 0..3 {
            governor.record_use("s1", TOOL);
        }
        assert!(!governor.can_use("s1", TOOL));

        clock.advance(Duration::seconds(31));
        assert_eq!(governor.remaining("s1", TOOL), 3);
        assert!(governor.can_use("s1", TOOL));
    }

    #[test]
    fn cooldown_is_measured_from_last_use() {
        let clock = ManualClock::new(Utc::now());
        let governor = governor(&clock);

        governor.record_use("s1", TOOL);
        governor.record_use("s1", TOOL);
        clock.advance(Duration::seconds(20));
        // Third use within cooldown: window slides forward from here.
        governor.record_use("s1", TOOL);
        clock.advance(Duration::seconds(20));

        assert!(!governor.can_use("s1", TOOL));

        clock.advance(Duration::seconds(11));
        assert!(governor.can_use("s1", TOOL));
    }

    #[test]
    fn sessions_and_tools_are_tracked_independently() {
        let clock = ManualClock::new(Utc::now());
        let governor = governor(&clock);

        for _ in 0..3 {
            governor.record_use("s1", TOOL);
        }

        assert!(!governor.can_use("s1", TOOL));
        assert!(governor.can_use("s2", TOOL));
        assert!(governor.can_use("s1", "other_tool"));
    }

    #[test]
    fn sweep_purges_long_idle_pairs() {
        let clock = ManualClock::new(Utc::now());
        let governor = governor(&clock);

        governor.record_use("stale", TOOL);
        clock.advance(Duration::minutes(59));
        governor.record_use("active", TOOL);
        clock.advance(Duration::minutes(2));

        assert_eq!(governor.sweep(), 1);
        // The surviving pair keeps its budget accounting.
        assert_eq!(governor.remaining("active", TOOL), 3);
    }

    #[test]
    fn fresh_pair_reports_full_budget() {
        let clock = ManualClock::new(Utc::now());
        let governor = governor(&clock);
        assert_eq!(governor.remaining("never-seen", TOOL), 3);
        assert_eq!(governor.max_usage(), 3);
        assert_eq!(governor.cooldown_ms(), 30_000);
    }
}
