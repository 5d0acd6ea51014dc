//! Rate limit detection and persisted exponential backoff, one tracker per rig.
//!
//! When a worker session trips an upstream rate limit the hit is recorded in
//! `<rig>/.runtime/rate-limit.json`. Each consecutive hit doubles the backoff
//! window, starting at 30 seconds and capped at 2^6 × 30 s = 1920 s
//! (32 minutes). While the window is open, dispatch to the rig is refused.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

use crate::fsutil;
use crate::lock::RUNTIME_DIR;

/// File name of the per-rig record inside the rig's runtime directory.
pub const STATE_FILE: &str = "rate-limit.json";

/// First backoff window, in seconds.
pub const BASE_BACKOFF_SECS: u64 = 30;

/// Exponent cap: hit N waits `30 * 2^min(N-1, 6)` seconds.
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Longest single backoff window (32 minutes).
pub const MAX_BACKOFF: Duration = Duration::from_secs(BASE_BACKOFF_SECS << MAX_BACKOFF_EXPONENT);

/// Backoff window after `hits` consecutive rate limit detections.
pub fn backoff_for_hits(hits: u32) -> Duration {
    let exponent = hits.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    Duration::from_secs(BASE_BACKOFF_SECS << exponent)
}

/// Persisted rate limit status for a rig. The zero value means "not limited".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    #[serde(default)]
    pub limited: bool,
    /// When the current run of hits started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
    /// Last recorded outcome, hit or success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_hits: u32,
    /// Always `last hit + backoff_for_hits(consecutive_hits)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

/// Rate limit tracker for a single rig.
///
/// Mutations are serialized by an in-process mutex. Persistence is an
/// atomic temp-file rename, so concurrent processes never see a torn
/// record, though the last writer still wins.
#[derive(Debug)]
pub struct RateLimitTracker {
    state_path: PathBuf,
    state: Mutex<RateLimitState>,
}

impl RateLimitTracker {
    pub fn new(rig_path: &Path) -> Self {
        Self {
            state_path: rig_path.join(RUNTIME_DIR).join(STATE_FILE),
            state: Mutex::new(RateLimitState::default()),
        }
    }

    /// Construct and load in one step.
    pub fn open(rig_path: &Path) -> anyhow::Result<Self> {
        let tracker = Self::new(rig_path);
        tracker.load()?;
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Read state from disk. A missing file loads the zero value.
    pub fn load(&self) -> anyhow::Result<()> {
        let loaded = match std::fs::read(&self.state_path) {
            Ok(data) => serde_json::from_slice(&data).with_context(|| {
                format!("parsing rate limit state {}", self.state_path.display())
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RateLimitState::default(),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading {}", self.state_path.display())));
            }
        };
        *self.guard() = loaded;
        Ok(())
    }

    /// Write state to disk atomically.
    pub fn save(&self) -> anyhow::Result<()> {
        let state = self.guard().clone();
        fsutil::write_json_atomic(&self.state_path, &state)
            .with_context(|| format!("writing {}", self.state_path.display()))
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> RateLimitState {
        self.guard().clone()
    }

    pub fn record_rate_limit(&self, source: &str, account: &str) {
        self.record_rate_limit_at(source, account, Utc::now());
    }

    /// Record a hit observed at `now` and extend the backoff window.
    pub fn record_rate_limit_at(&self, source: &str, account: &str, now: DateTime<Utc>) {
        let mut state = self.guard();
        if !state.limited {
            state.detected_at = Some(now);
        }
        state.limited = true;
        state.consecutive_hits = state.consecutive_hits.saturating_add(1);
        state.source = source.to_string();
        state.account = account.to_string();
        state.last_attempt = Some(now);
        state.backoff_until = Some(now + to_delta(backoff_for_hits(state.consecutive_hits)));
    }

    pub fn record_success(&self) {
        self.record_success_at(Utc::now());
    }

    /// Reset to not limited after a successful attempt at `now`.
    pub fn record_success_at(&self, now: DateTime<Utc>) {
        let mut state = self.guard();
        state.limited = false;
        state.consecutive_hits = 0;
        state.backoff_until = None;
        state.last_attempt = Some(now);
    }

    pub fn should_defer(&self) -> bool {
        self.should_defer_at(Utc::now())
    }

    /// True while the backoff window is open.
    pub fn should_defer_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.guard();
        state.limited && state.backoff_until.is_some_and(|until| now < until)
    }

    pub fn time_until_ready(&self) -> Duration {
        self.time_until_ready_at(Utc::now())
    }

    /// Remaining wait, or zero when spawning is allowed now.
    pub fn time_until_ready_at(&self, now: DateTime<Utc>) -> Duration {
        let state = self.guard();
        if !state.limited {
            return Duration::ZERO;
        }
        state
            .backoff_until
            .and_then(|until| (until - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Operator override: drop all state.
    pub fn clear(&self) {
        *self.guard() = RateLimitState::default();
    }

    fn guard(&self) -> MutexGuard<'_, RateLimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

// --- Detection ---

const RATE_LIMIT_PATTERNS: &[&str] = &[
    r"(?i)rate.?limit",
    r"(?i)too many requests",
    r"429",
    r"(?i)please wait.*before",
    r"(?i)exceeded.*quota",
    r"(?i)temporarily unavailable",
    r"(?i)overloaded",
    r"(?i)capacity",
    r"(?i)throttl",
];

fn rate_limit_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(RATE_LIMIT_PATTERNS).expect("rate limit patterns compile"))
}

/// True if `output` carries any known rate limit signature.
pub fn detect_rate_limit(output: &str) -> bool {
    !output.is_empty() && rate_limit_set().is_match(output)
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    Seconds,
    Minutes,
}

// Order matters: the first pattern that matches decides the value.
const RETRY_AFTER_PATTERNS: &[(&str, Unit)] = &[
    (r"(?i)retry.?after\s+(\d+)\s*s", Unit::Seconds),
    (r"(?i)wait\s+(\d+)\s*s", Unit::Seconds),
    (r"(?i)retry.?after\s+(\d+)\s*m", Unit::Minutes),
    (r"(?i)wait\s+(\d+)\s*m", Unit::Minutes),
    (r"(?i)(\d+)\s*seconds?.*retry", Unit::Seconds),
    (r"(?i)(\d+)\s*minutes?.*retry", Unit::Minutes),
];

fn retry_after_regexes() -> &'static [(Regex, Unit)] {
    static RES: OnceLock<Vec<(Regex, Unit)>> = OnceLock::new();
    RES.get_or_init(|| {
        RETRY_AFTER_PATTERNS
            .iter()
            .map(|(p, unit)| (Regex::new(p).expect("retry-after patterns compile"), *unit))
            .collect()
    })
}

/// Best-effort "retry after N seconds/minutes" extraction. Zero if absent.
pub fn extract_retry_after(output: &str) -> Duration {
    for (re, unit) in retry_after_regexes() {
        if let Some(caps) = re.captures(output) {
            let value: u64 = caps[1].parse().unwrap_or(0);
            return match unit {
                Unit::Seconds => Duration::from_secs(value),
                Unit::Minutes => Duration::from_secs(value.saturating_mul(60)),
            };
        }
    }
    Duration::ZERO
}

/// Render a wait rounded to whole seconds, e.g. `1m30s`.
pub fn format_wait(d: Duration) -> String {
    let secs = d.as_secs() + u64::from(d.subsec_millis() >= 500);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let rig = dir.path().join("testrig");
        std::fs::create_dir_all(&rig).unwrap();
        (dir, rig)
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn detect_rate_limit_signatures() {
        let cases = [
            ("", false),
            ("Hello, world!", false),
            ("You are being rate limited", true),
            ("Error: rate-limit exceeded", true),
            ("HTTP error 429 Too Many Requests", true),
            ("too many requests", true),
            ("Please wait 30 seconds before trying again", true),
            ("You have exceeded your quota", true),
            ("service temporarily unavailable", true),
            ("The API is currently overloaded", true),
            ("at capacity right now", true),
            ("Request was throttled", true),
            ("RATE LIMIT detected", true),
            ("Error 500: server error", false),
        ];
        for (input, want) in cases {
            assert_eq!(detect_rate_limit(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn extract_retry_after_patterns() {
        let cases = [
            ("Error occurred", Duration::ZERO),
            ("retry after 30 seconds", Duration::from_secs(30)),
            ("Retry-After 15s", Duration::from_secs(15)),
            ("wait 60 seconds", Duration::from_secs(60)),
            ("retry after 2 minutes", Duration::from_secs(120)),
            ("please wait 5 min", Duration::from_secs(300)),
            ("45 seconds until you can retry", Duration::from_secs(45)),
            ("3 minutes then retry", Duration::from_secs(180)),
        ];
        for (input, want) in cases {
            assert_eq!(extract_retry_after(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn extract_retry_after_first_pattern_wins() {
        // Both a seconds and a minutes hint: the earlier pattern in the list decides.
        let text = "wait 3 minutes, or retry after 10 seconds";
        assert_eq!(extract_retry_after(text), Duration::from_secs(10));
    }

    #[test]
    fn backoff_schedule_and_cap() {
        assert_eq!(backoff_for_hits(1), Duration::from_secs(30));
        assert_eq!(backoff_for_hits(2), Duration::from_secs(60));
        assert_eq!(backoff_for_hits(3), Duration::from_secs(120));
        assert_eq!(backoff_for_hits(7), Duration::from_secs(1920));
        assert_eq!(backoff_for_hits(8), MAX_BACKOFF);
        assert_eq!(backoff_for_hits(500), MAX_BACKOFF);
        assert_eq!(MAX_BACKOFF, Duration::from_secs(32 * 60));
    }

    #[test]
    fn load_missing_file_is_not_limited() {
        let (_dir, rig) = rig();
        let tracker = RateLimitTracker::open(&rig).unwrap();
        assert_eq!(tracker.state(), RateLimitState::default());
        assert!(!tracker.should_defer());
        assert_eq!(tracker.time_until_ready(), Duration::ZERO);
    }

    #[test]
    fn load_rejects_corrupt_record() {
        let (_dir, rig) = rig();
        let tracker = RateLimitTracker::new(&rig);
        std::fs::create_dir_all(tracker.path().parent().unwrap()).unwrap();
        std::fs::write(tracker.path(), "{{{").unwrap();
        assert!(tracker.load().is_err());
    }

    #[test]
    fn save_and_reload_persists_hit() {
        let (_dir, rig) = rig();
        let tracker = RateLimitTracker::open(&rig).unwrap();
        tracker.record_rate_limit("test-source", "test-account");
        tracker.save().unwrap();

        let reloaded = RateLimitTracker::open(&rig).unwrap();
        let state = reloaded.state();
        assert!(state.limited);
        assert_eq!(state.source, "test-source");
        assert_eq!(state.account, "test-account");
        assert_eq!(state.consecutive_hits, 1);
        assert!(rig.join(".runtime/rate-limit.json").exists());
    }

    #[test]
    fn backoff_until_is_strictly_monotonic_until_cap() {
        let (_dir, rig) = rig();
        let tracker = RateLimitTracker::new(&rig);
        let now = Utc::now();

        let mut previous = None;
        for hit in 1..=7 {
            tracker.record_rate_limit_at("spawn", "", now);
            let until = tracker.state().backoff_until.unwrap();
            if let Some(prev) = previous {
                assert!(until > prev, "hit {hit} did not extend backoff");
            }
            previous = Some(until);
        }
        for _ in 0..3 {
            tracker.record_rate_limit_at("spawn", "", now);
            assert_eq!(tracker.state().backoff_until, previous);
        }
        assert_eq!(tracker.state().consecutive_hits, 10);
    }

    #[test]
    fn detected_at_marks_start_of_run() {
        let (_dir, rig) = rig();
        let tracker = RateLimitTracker::new(&rig);
        let t0 = Utc::now();
        tracker.record_rate_limit_at("spawn", "a", t0);
        tracker.record_rate_limit_at("spawn", "a", t0 + secs(40));
        let state = tracker.state();
        assert_eq!(state.detected_at, Some(t0));
        assert_eq!(state.last_attempt, Some(t0 + secs(40)));
        assert_eq!(state.backoff_until, Some(t0 + secs(40 + 60)));
    }

    #[test]
    fn three_hits_give_two_minute_window() {
        let (_dir, rig) = rig();
        let tracker = RateLimitTracker::new(&rig);
        let t = Utc::now();
        for _ in 0..3 {
            tracker.record_rate_limit_at("spawn", "acctA", t);
        }

        let state = tracker.state();
        assert_eq!(state.consecutive_hits, 3);
        assert_eq!(state.backoff_until, Some(t + secs(120)));
        assert!(tracker.should_defer_at(t));
        assert_eq!(tracker.time_until_ready_at(t), Duration::from_secs(120));
        assert!(tracker.should_defer_at(t + secs(119)));
        assert!(!tracker.should_defer_at(t + secs(121)));
        assert_eq!(tracker.time_until_ready_at(t + secs(121)), Duration::ZERO);
    }

    #[test]
    fn record_success_always_resets() {
        let (_dir, rig) = rig();
        let tracker = RateLimitTracker::new(&rig);
        tracker.record_success();
        assert!(!tracker.should_defer());

        for _ in 0..5 {
            tracker.record_rate_limit("spawn", "acct");
        }
        assert!(tracker.should_defer());

        tracker.record_success();
        let state = tracker.state();
        assert!(!state.limited);
        assert_eq!(state.consecutive_hits, 0);
        assert!(state.backoff_until.is_none());
        assert!(!tracker.should_defer());
    }

    #[test]
    fn clear_drops_everything() {
        let (_dir, rig) = rig();
        let tracker = RateLimitTracker::new(&rig);
        tracker.record_rate_limit("spawn", "acct");
        tracker.clear();
        assert_eq!(tracker.state(), RateLimitState::default());
    }

    #[test]
    fn format_wait_rounds_to_seconds() {
        assert_eq!(format_wait(Duration::ZERO), "0s");
        assert_eq!(format_wait(Duration::from_millis(29_600)), "30s");
        assert_eq!(format_wait(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_wait(Duration::from_secs(3725)), "1h2m5s");
    }
}
