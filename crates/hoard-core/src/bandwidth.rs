//! Rolling bandwidth accounting and rule evaluation.
//!
//! A [`BandwidthTracker`] holds second-granularity buckets for bytes and
//! requests, month totals, and all-time totals. A [`BandwidthRules`] set
//! evaluates a tracker against per-window limits. Trackers are plain data:
//! callers pass `now` explicitly, which keeps rule evaluation deterministic
//! under test.

use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::Timestamp;

/// Seconds of per-second history kept before buckets are coalesced into the
/// month totals. One day covers the largest second-window rule (86400).
const MAX_SECOND_WINDOW: u64 = 86_400;

#[derive(
    Encode, Decode, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash,
)]
pub enum BandwidthKind {
    Data,
    Requests,
}

/// The window a rule measures over.
#[derive(
    Encode, Decode, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash,
)]
pub enum BandwidthWindow {
    Seconds(u64),
    CurrentMonth,
    Forever,
}

#[derive(Encode, Decode, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct BandwidthRule {
    pub kind: BandwidthKind,
    pub window: BandwidthWindow,
    pub limit: u64,
}

/// Month bucket key: `year * 12 + month0`.
fn month_key(now: Timestamp) -> i64 {
    let dt = OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    i64::from(dt.year()) * 12 + i64::from(u8::from(dt.month()) - 1)
}

#[derive(
    Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
)]
struct Counter {
    seconds: BTreeMap<u64, u64>,
    months: BTreeMap<i64, u64>,
    total: u64,
}

impl Counter {
    fn report(&mut self, now: Timestamp, amount: u64) {
        *self.seconds.entry(now.as_secs()).or_default() += amount;
        *self.months.entry(month_key(now)).or_default() += amount;
        self.total += amount;
        self.coalesce(now);
    }

    /// Drop second buckets that no second-window rule can see anymore.
    /// Their usage stays counted in the month and total sums.
    fn coalesce(&mut self, now: Timestamp) {
        let cutoff = now.as_secs().saturating_sub(MAX_SECOND_WINDOW);
        self.seconds = self.seconds.split_off(&cutoff);
    }

    fn usage(&self, window: BandwidthWindow, now: Timestamp) -> u64 {
        match window {
            BandwidthWindow::Seconds(secs) => {
                let from = now.as_secs().saturating_sub(secs.saturating_sub(1));
                self.seconds.range(from..=now.as_secs()).map(|(_, v)| v).sum()
            }
            BandwidthWindow::CurrentMonth => {
                self.months.get(&month_key(now)).copied().unwrap_or(0)
            }
            BandwidthWindow::Forever => self.total,
        }
    }
}

/// Time-bucketed usage counters for one entity (account, service, or an
/// account type's auto-creation history).
#[derive(
    Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
)]
pub struct BandwidthTracker {
    bytes: Counter,
    requests: Counter,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request and the bytes it moved.
    pub fn report_request(&mut self, now: Timestamp, bytes: u64) {
        self.requests.report(now, 1);
        self.bytes.report(now, bytes);
    }

    /// Record bytes without a request (streaming continuation).
    pub fn report_data(&mut self, now: Timestamp, bytes: u64) {
        self.bytes.report(now, bytes);
    }

    pub fn usage(&self, kind: BandwidthKind, window: BandwidthWindow, now: Timestamp) -> u64 {
        match kind {
            BandwidthKind::Data => self.bytes.usage(window, now),
            BandwidthKind::Requests => self.requests.usage(window, now),
        }
    }

    pub fn current_month_summary(&self, now: Timestamp) -> BandwidthSummary {
        BandwidthSummary {
            month_bytes: self.usage(BandwidthKind::Data, BandwidthWindow::CurrentMonth, now),
            month_requests: self.usage(
                BandwidthKind::Requests,
                BandwidthWindow::CurrentMonth,
                now,
            ),
            total_bytes: self.usage(BandwidthKind::Data, BandwidthWindow::Forever, now),
            total_requests: self.usage(BandwidthKind::Requests, BandwidthWindow::Forever, now),
        }
    }
}

/// The usage digest attached to account views and petition headers.
#[derive(
    Encode, Decode, Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq,
)]
pub struct BandwidthSummary {
    pub month_bytes: u64,
    pub month_requests: u64,
    pub total_bytes: u64,
    pub total_requests: u64,
}

/// An ordered set of bandwidth limits.
#[derive(
    Encode, Decode, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
)]
pub struct BandwidthRules {
    rules: Vec<BandwidthRule>,
}

impl BandwidthRules {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, kind: BandwidthKind, window: BandwidthWindow, limit: u64) {
        self.rules.push(BandwidthRule { kind, window, limit });
    }

    pub fn rules(&self) -> &[BandwidthRule] {
        &self.rules
    }

    /// May a new request start? A rule blocks once its usage has reached its
    /// limit.
    pub fn can_start_request(&self, tracker: &BandwidthTracker, now: Timestamp) -> bool {
        self.rules
            .iter()
            .all(|rule| tracker.usage(rule.kind, rule.window, now) < rule.limit)
    }

    /// May an in-progress transfer keep going? Rules over windows shorter
    /// than 15 s never interrupt a live transfer; chopping a connection to
    /// honor a sub-15s data cap costs more than letting it drain.
    pub fn can_continue(&self, tracker: &BandwidthTracker, now: Timestamp) -> bool {
        self.rules
            .iter()
            .filter(|rule| !matches!(rule.window, BandwidthWindow::Seconds(secs) if secs < 15))
            .all(|rule| tracker.usage(rule.kind, rule.window, now) < rule.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn window_sums_only_recent_seconds() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_request(ts(1_000_000), 100);
        tracker.report_request(ts(1_000_030), 200);
        tracker.report_request(ts(1_000_059), 300);

        let now = ts(1_000_059);
        assert_eq!(
            tracker.usage(BandwidthKind::Data, BandwidthWindow::Seconds(60), now),
            600
        );
        // 30s window only covers the last two reports
        assert_eq!(
            tracker.usage(BandwidthKind::Data, BandwidthWindow::Seconds(30), now),
            500
        );
        assert_eq!(
            tracker.usage(BandwidthKind::Requests, BandwidthWindow::Seconds(1), now),
            1
        );
    }

    #[test]
    fn coalescing_keeps_month_and_total() {
        let mut tracker = BandwidthTracker::new();
        let start = ts(1_700_000_000);
        tracker.report_request(start, 1000);
        // two days later the per-second bucket is gone
        let later = ts(1_700_000_000 + 2 * 86_400);
        tracker.report_request(later, 1);

        assert_eq!(
            tracker.usage(BandwidthKind::Data, BandwidthWindow::Seconds(86_400), later),
            1
        );
        assert_eq!(
            tracker.usage(BandwidthKind::Data, BandwidthWindow::Forever, later),
            1001
        );
        assert_eq!(
            tracker.usage(BandwidthKind::Data, BandwidthWindow::CurrentMonth, later),
            1001
        );
    }

    #[test]
    fn month_rolls_over() {
        let mut tracker = BandwidthTracker::new();
        // 2023-12-31T23:59:00Z
        let december = ts(1_704_066_900);
        // 2024-01-01T00:30:00Z
        let january = ts(1_704_069_000);

        tracker.report_request(december, 500);
        assert_eq!(
            tracker.usage(BandwidthKind::Data, BandwidthWindow::CurrentMonth, december),
            500
        );
        assert_eq!(
            tracker.usage(BandwidthKind::Data, BandwidthWindow::CurrentMonth, january),
            0
        );
        assert_eq!(
            tracker.usage(BandwidthKind::Data, BandwidthWindow::Forever, january),
            500
        );
    }

    #[test]
    fn start_blocks_at_limit_and_recovers() {
        let mut rules = BandwidthRules::none();
        rules.add_rule(BandwidthKind::Data, BandwidthWindow::Seconds(60), 10_240);

        let mut tracker = BandwidthTracker::new();
        let now = ts(5_000);
        tracker.report_request(now, 20 * 1024);

        assert!(!rules.can_start_request(&tracker, now));
        // sixty seconds later the window has drained
        assert!(rules.can_start_request(&tracker, ts(5_060)));
    }

    #[test]
    fn short_window_rules_do_not_chop_live_transfers() {
        let mut rules = BandwidthRules::none();
        rules.add_rule(BandwidthKind::Data, BandwidthWindow::Seconds(5), 100);
        rules.add_rule(BandwidthKind::Data, BandwidthWindow::Seconds(3600), 1_000_000);

        let mut tracker = BandwidthTracker::new();
        let now = ts(9_000);
        tracker.report_data(now, 500);

        assert!(!rules.can_start_request(&tracker, now));
        assert!(rules.can_continue(&tracker, now));

        // but a breached long-window rule does stop continuation
        tracker.report_data(now, 1_000_000);
        assert!(!rules.can_continue(&tracker, now));
    }
}
