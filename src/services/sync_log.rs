use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{
    clock::Clock,
    error::AppError,
    models::{SyncAction, SyncLogEntry, SyncOutcome},
};

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsWindow {
    Hour,
    Day,
    Week,
}

impl StatsWindow {
    pub fn duration(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Week => Duration::weeks(1),
        }
    }
}

impl FromStr for StatsWindow {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            other => Err(AppError::BadRequest(format!(
                "Unknown stats window '{other}'. Use hour, day or week."
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    pub window: StatsWindow,
    pub total: usize,
    pub success: usize,
    pub warning: usize,
    pub error: usize,
    /// Percentage of successful entries; 100 when the window is empty.
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatedFailure {
    pub subject_id: String,
    pub error_count: usize,
    pub last_error_at: DateTime<Utc>,
    pub last_details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailurePatterns {
    pub repeated_failures: Vec<RepeatedFailure>,
    pub isolated_errors: usize,
    pub recommendations: Vec<String>,
}

const PATTERN_MIN_SAMPLES: usize = 10;
const PATTERN_MIN_SUCCESS_RATE: f64 = 90.0;
const PATTERN_MAX_HOURLY_ERRORS: usize = 5;

/// Bounded, append-only record of reconciliation attempts.
///
/// Logging never fails the caller: a poisoned lock is recovered and the
/// entry is still recorded.
pub struct SyncLog {
    capacity: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<LogState>,
}

struct LogState {
    entries: VecDeque<SyncLogEntry>,
    next_id: u64,
}

impl SyncLog {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            clock,
            state: Mutex::new(LogState {
                entries: VecDeque::with_capacity(capacity),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log_event(
        &self,
        payment_id: Option<&str>,
        lease_id: Option<&str>,
        action: SyncAction,
        outcome: SyncOutcome,
        details: impl Into<String>,
        metadata: Value,
    ) {
        let details = details.into();
        match outcome {
            SyncOutcome::Success => tracing::debug!(
                payment_id = payment_id.unwrap_or_default(),
                lease_id = lease_id.unwrap_or_default(),
                action = action.as_str(),
                "{details}"
            ),
            SyncOutcome::Warning => tracing::warn!(
                payment_id = payment_id.unwrap_or_default(),
                lease_id = lease_id.unwrap_or_default(),
                action = action.as_str(),
                "{details}"
            ),
            SyncOutcome::Error => tracing::error!(
                payment_id = payment_id.unwrap_or_default(),
                lease_id = lease_id.unwrap_or_default(),
                action = action.as_str(),
                "{details}"
            ),
        }

        let timestamp = self.clock.now();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        if state.entries.len() >= self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(SyncLogEntry {
            id,
            payment_id: payment_id.map(ToOwned::to_owned),
            lease_id: lease_id.map(ToOwned::to_owned),
            action,
            outcome,
            details,
            metadata,
            timestamp,
        });
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn entries_for(&self, payment_id: &str) -> Vec<SyncLogEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.payment_id.as_deref() == Some(payment_id))
            .cloned()
            .collect()
    }

    /// Newest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<SyncLogEntry> {
        self.lock()
            .entries
            .iter()
            .rev()
            .filter(|entry| entry.outcome == SyncOutcome::Error)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self, window: StatsWindow) -> SyncStats {
        let since = self.clock.now() - window.duration();
        let state = self.lock();
        let mut stats = SyncStats {
            window,
            total: 0,
            success: 0,
            warning: 0,
            error: 0,
            success_rate: 100.0,
        };
        for entry in state.entries.iter().filter(|entry| entry.timestamp >= since) {
            stats.total += 1;
            match entry.outcome {
                SyncOutcome::Success => stats.success += 1,
                SyncOutcome::Warning => stats.warning += 1,
                SyncOutcome::Error => stats.error += 1,
            }
        }
        if stats.total > 0 {
            stats.success_rate = stats.success as f64 * 100.0 / stats.total as f64;
        }
        stats
    }

    pub fn detect_failure_patterns(&self) -> FailurePatterns {
        let mut groups: BTreeMap<String, Vec<SyncLogEntry>> = BTreeMap::new();
        for entry in self
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.outcome == SyncOutcome::Error)
        {
            if let Some(subject) = entry.subject() {
                groups
                    .entry(subject.to_string())
                    .or_default()
                    .push(entry.clone());
            }
        }

        let mut repeated_failures = Vec::new();
        let mut isolated_errors = 0;
        for (subject_id, errors) in groups {
            if errors.len() < 2 {
                isolated_errors += errors.len();
                continue;
            }
            if let Some(last) = errors.iter().max_by_key(|entry| entry.timestamp) {
                repeated_failures.push(RepeatedFailure {
                    subject_id,
                    error_count: errors.len(),
                    last_error_at: last.timestamp,
                    last_details: last.details.clone(),
                });
            }
        }
        repeated_failures.sort_by(|a, b| {
            b.error_count
                .cmp(&a.error_count)
                .then_with(|| b.last_error_at.cmp(&a.last_error_at))
        });

        let hourly = self.stats(StatsWindow::Hour);
        let mut recommendations = Vec::new();
        if hourly.total >= PATTERN_MIN_SAMPLES && hourly.success_rate < PATTERN_MIN_SUCCESS_RATE {
            recommendations.push(format!(
                "Sync success rate is {:.1}% over the last hour ({} attempts). Check database health and recent deployments.",
                hourly.success_rate, hourly.total
            ));
        }
        if !repeated_failures.is_empty() {
            let subjects: Vec<&str> = repeated_failures
                .iter()
                .take(5)
                .map(|failure| failure.subject_id.as_str())
                .collect();
            recommendations.push(format!(
                "{} record(s) failed repeatedly ({}). Review them manually before the next retry.",
                repeated_failures.len(),
                subjects.join(", ")
            ));
        }
        if hourly.error > PATTERN_MAX_HOURLY_ERRORS {
            recommendations.push(format!(
                "{} sync errors in the last hour. Consider pausing automated fixes and inspecting recent errors.",
                hourly.error
            ));
        }

        FailurePatterns {
            repeated_failures,
            isolated_errors,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{StatsWindow, SyncLog};
    use crate::clock::ManualClock;
    use crate::models::{SyncAction, SyncOutcome};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Arc;

    fn log_with_clock(capacity: usize) -> (SyncLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap(),
        ));
        (SyncLog::new(capacity, clock.clone()), clock)
    }

    fn record(log: &SyncLog, payment_id: &str, outcome: SyncOutcome) {
        log.log_event(
            Some(payment_id),
            Some("lease-1"),
            SyncAction::StatusUpdated,
            outcome,
            "status changed",
            json!({}),
        );
    }

    #[test]
    fn evicts_oldest_entries_at_capacity() {
        let (log, _) = log_with_clock(3);
        for index in 0..5 {
            record(&log, &format!("p{index}"), SyncOutcome::Success);
        }
        assert_eq!(log.len(), 3);
        assert!(log.entries_for("p0").is_empty());
        assert!(log.entries_for("p1").is_empty());
        assert_eq!(log.entries_for("p4").len(), 1);
    }

    #[test]
    fn day_stats_match_recorded_outcomes() {
        let (log, _) = log_with_clock(100);
        for index in 0..7 {
            record(&log, &format!("p{index}"), SyncOutcome::Success);
        }
        record(&log, "p7", SyncOutcome::Warning);
        record(&log, "p8", SyncOutcome::Error);
        record(&log, "p9", SyncOutcome::Error);

        let stats = log.stats(StatsWindow::Day);
        assert_eq!(stats.total, 10);
        assert_eq!(stats.success, 7);
        assert_eq!(stats.warning, 1);
        assert_eq!(stats.error, 2);
        assert!((stats.success_rate - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_respect_window() {
        let (log, clock) = log_with_clock(100);
        record(&log, "old", SyncOutcome::Error);
        clock.advance(Duration::hours(2));
        record(&log, "new", SyncOutcome::Success);

        assert_eq!(log.stats(StatsWindow::Hour).total, 1);
        assert_eq!(log.stats(StatsWindow::Day).total, 2);
        assert!((log.stats(StatsWindow::Hour).success_rate - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn recent_errors_are_newest_first() {
        let (log, clock) = log_with_clock(100);
        record(&log, "p1", SyncOutcome::Error);
        clock.advance(Duration::minutes(1));
        record(&log, "p2", SyncOutcome::Success);
        record(&log, "p3", SyncOutcome::Error);

        let errors = log.recent_errors(5);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].payment_id.as_deref(), Some("p3"));
        assert_eq!(log.recent_errors(1).len(), 1);
    }

    #[test]
    fn repeated_failures_outrank_isolated_errors() {
        let (log, _) = log_with_clock(100);
        record(&log, "p1", SyncOutcome::Error);
        record(&log, "p1", SyncOutcome::Error);
        record(&log, "p1", SyncOutcome::Error);
        record(&log, "p2", SyncOutcome::Error);
        for index in 0..6 {
            record(&log, &format!("ok{index}"), SyncOutcome::Success);
        }

        let patterns = log.detect_failure_patterns();
        assert_eq!(patterns.repeated_failures.len(), 1);
        assert_eq!(patterns.repeated_failures[0].subject_id, "p1");
        assert_eq!(patterns.repeated_failures[0].error_count, 3);
        assert_eq!(patterns.isolated_errors, 1);
        // 6 of 10 succeeded in the last hour.
        assert!(patterns
            .recommendations
            .iter()
            .any(|text| text.contains("success rate")));
        assert!(patterns
            .recommendations
            .iter()
            .any(|text| text.contains("failed repeatedly")));
    }

    #[test]
    fn few_samples_do_not_trigger_rate_recommendation() {
        let (log, _) = log_with_clock(100);
        record(&log, "p1", SyncOutcome::Error);
        let patterns = log.detect_failure_patterns();
        assert!(patterns.recommendations.is_empty());
    }

    #[test]
    fn parses_windows() {
        assert_eq!(StatsWindow::from_str("Week").ok(), Some(StatsWindow::Week));
        assert!(StatsWindow::from_str("month").is_err());
    }
}
