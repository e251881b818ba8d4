use crate::clock::{Clock, SharedClock};
use crate::error::{Error, Result};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::RwLock;

const HOUR_SECS: i64 = 3_600;
const MINUTE_SECS: i64 = 60;
const DAY_SECS: i64 = 86_400;

/// Counting interval kind. Hourly and minutely windows are fixed,
/// calendar-aligned and non-overlapping; the concurrent gauge is live and not
/// time-windowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Hourly,
    Minutely,
    Concurrent,
}

impl WindowKind {
    fn window_secs(&self) -> Option<i64> {
        match self {
            WindowKind::Hourly => Some(HOUR_SECS),
            WindowKind::Minutely => Some(MINUTE_SECS),
            WindowKind::Concurrent => None,
        }
    }
}

/// Start of the window containing `ts`, as unix seconds.
pub fn window_start(kind: WindowKind, ts: i64) -> i64 {
    match kind.window_secs() {
        Some(len) => ts - ts.rem_euclid(len),
        None => ts,
    }
}

/// One aggregate counter: requests and cost for a (subject, kind, window).
#[derive(Debug, Clone, Serialize)]
pub struct WindowRecord {
    pub subject_id: String,
    pub kind: WindowKind,
    pub window_start: i64,
    pub window_end: i64,
    pub request_count: u64,
    pub total_cost: f64,
    pub overage_count: u64,
    pub overage_cost: f64,
}

/// Aggregate for the window containing "now".
#[derive(Debug, Clone, Serialize)]
pub struct WindowUsage {
    pub total_requests: u64,
    pub total_cost: f64,
    pub window_start: i64,
    pub window_end: i64,
    pub time_remaining: i64,
}

impl WindowUsage {
    fn empty(kind: WindowKind, now_ts: i64) -> Self {
        let start = window_start(kind, now_ts);
        let end = kind.window_secs().map(|len| start + len).unwrap_or(start);
        Self {
            total_requests: 0,
            total_cost: 0.0,
            window_start: start,
            window_end: end,
            time_remaining: (end - now_ts).max(0),
        }
    }
}

/// Named aggregation period for top-consumer queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    LastHour,
    Last24Hours,
    LastWeek,
    LastMonth,
}

impl Period {
    fn secs(&self) -> i64 {
        match self {
            Period::LastHour => HOUR_SECS,
            Period::Last24Hours => DAY_SECS,
            Period::LastWeek => 7 * DAY_SECS,
            Period::LastMonth => 30 * DAY_SECS,
        }
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last_hour" => Ok(Period::LastHour),
            "last_24_hours" => Ok(Period::Last24Hours),
            "last_week" => Ok(Period::LastWeek),
            "last_month" => Ok(Period::LastMonth),
            other => Err(Error::Validation(format!("unknown period: {}", other))),
        }
    }
}

/// One row of a top-consumers report, cost-descending.
#[derive(Debug, Clone, Serialize)]
pub struct TopConsumer {
    pub subject_id: String,
    pub total_requests: u64,
    pub total_cost: f64,
}

/// Aggregate request totals reported by the retention sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageTotals {
    pub requests_today: u64,
    pub requests_this_week: u64,
    pub requests_this_month: u64,
    pub overage_requests_today: u64,
}

type WindowKey = (String, WindowKind, i64);

/// Records and aggregates request counts and costs per subject.
///
/// Every mutation is a single critical section over the affected map, so
/// overlapping calls never lose an increment. The concurrent gauge is a deque
/// of slot-start timestamps per subject; slots older than
/// `max_request_duration_secs` count as released even without an explicit
/// release, which keeps crashed or hung requests from inflating the gauge.
pub struct UsageTracker {
    clock: SharedClock,
    max_request_duration_secs: i64,
    windows: RwLock<HashMap<WindowKey, WindowRecord>>,
    concurrent: RwLock<HashMap<String, VecDeque<i64>>>,
}

impl UsageTracker {
    pub fn new(clock: SharedClock, max_request_duration_secs: i64) -> Self {
        Self {
            clock,
            max_request_duration_secs,
            windows: RwLock::new(HashMap::new()),
            concurrent: RwLock::new(HashMap::new()),
        }
    }

    /// Records one request: bumps the hourly and minutely counters for "now"
    /// and takes a concurrent slot.
    pub fn record_request(&self, subject_id: &str, cost: f64) -> Result<()> {
        self.record_request_with_overage(subject_id, cost, 0.0)
    }

    /// As `record_request`, also marking the request as billed overage.
    pub fn record_request_with_overage(
        &self,
        subject_id: &str,
        cost: f64,
        overage_cost: f64,
    ) -> Result<()> {
        let now_ts = self.clock.now_ts();
        {
            let mut windows = self
                .windows
                .write()
                .map_err(|_| Error::lock_poisoned("usage windows"))?;
            for kind in [WindowKind::Hourly, WindowKind::Minutely] {
                let start = window_start(kind, now_ts);
                let key = (subject_id.to_string(), kind, start);
                let record = windows.entry(key).or_insert_with(|| WindowRecord {
                    subject_id: subject_id.to_string(),
                    kind,
                    window_start: start,
                    window_end: start + kind.window_secs().unwrap_or(0),
                    request_count: 0,
                    total_cost: 0.0,
                    overage_count: 0,
                    overage_cost: 0.0,
                });
                record.request_count += 1;
                record.total_cost += cost;
                if overage_cost > 0.0 {
                    record.overage_count += 1;
                    record.overage_cost += overage_cost;
                }
            }
        }

        let mut gauges = self
            .concurrent
            .write()
            .map_err(|_| Error::lock_poisoned("concurrent gauge"))?;
        let slots = gauges.entry(subject_id.to_string()).or_default();
        Self::prune_stale_slots(slots, now_ts, self.max_request_duration_secs);
        slots.push_back(now_ts);
        Ok(())
    }

    /// Releases one concurrent slot when a request completes. Releasing with
    /// no live slot is a no-op; the time-boxed fallback may already have
    /// reclaimed it.
    pub fn release_concurrent_slot(&self, subject_id: &str) -> Result<()> {
        let now_ts = self.clock.now_ts();
        let mut gauges = self
            .concurrent
            .write()
            .map_err(|_| Error::lock_poisoned("concurrent gauge"))?;
        if let Some(slots) = gauges.get_mut(subject_id) {
            Self::prune_stale_slots(slots, now_ts, self.max_request_duration_secs);
            slots.pop_front();
            if slots.is_empty() {
                gauges.remove(subject_id);
            }
        }
        Ok(())
    }

    /// Live concurrent request count. Slots past the maximum request duration
    /// are treated as released.
    pub fn concurrent_count(&self, subject_id: &str) -> Result<u64> {
        let now_ts = self.clock.now_ts();
        let gauges = self
            .concurrent
            .read()
            .map_err(|_| Error::lock_poisoned("concurrent gauge"))?;
        let count = gauges
            .get(subject_id)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|&&started| now_ts - started < self.max_request_duration_secs)
                    .count() as u64
            })
            .unwrap_or(0);
        Ok(count)
    }

    /// Aggregate for the window containing "now" (hourly/minutely), or the
    /// live gauge value for the concurrent kind.
    pub fn current_window_usage(&self, subject_id: &str, kind: WindowKind) -> Result<WindowUsage> {
        let now_ts = self.clock.now_ts();
        if kind == WindowKind::Concurrent {
            let live = self.concurrent_count(subject_id)?;
            return Ok(WindowUsage {
                total_requests: live,
                total_cost: live as f64,
                window_start: now_ts,
                window_end: now_ts,
                time_remaining: 0,
            });
        }

        let start = window_start(kind, now_ts);
        let windows = self
            .windows
            .read()
            .map_err(|_| Error::lock_poisoned("usage windows"))?;
        let key = (subject_id.to_string(), kind, start);
        Ok(match windows.get(&key) {
            Some(record) => WindowUsage {
                total_requests: record.request_count,
                total_cost: record.total_cost,
                window_start: record.window_start,
                window_end: record.window_end,
                time_remaining: (record.window_end - now_ts).max(0),
            },
            None => WindowUsage::empty(kind, now_ts),
        })
    }

    /// Heaviest consumers over a named period, by total cost descending,
    /// ties broken by subject id ascending. Aggregates hourly records only so
    /// requests are not double-counted across window kinds.
    pub fn top_consumers(&self, limit: usize, period: Period) -> Result<Vec<TopConsumer>> {
        let since = self.clock.now_ts() - period.secs();
        let windows = self
            .windows
            .read()
            .map_err(|_| Error::lock_poisoned("usage windows"))?;

        let mut by_subject: HashMap<&str, (u64, f64)> = HashMap::new();
        for record in windows.values() {
            if record.kind != WindowKind::Hourly || record.window_start < since {
                continue;
            }
            let entry = by_subject.entry(record.subject_id.as_str()).or_insert((0, 0.0));
            entry.0 += record.request_count;
            entry.1 += record.total_cost;
        }

        let mut consumers: Vec<TopConsumer> = by_subject
            .into_iter()
            .map(|(subject_id, (total_requests, total_cost))| TopConsumer {
                subject_id: subject_id.to_string(),
                total_requests,
                total_cost,
            })
            .collect();
        consumers.sort_by(|a, b| {
            b.total_cost
                .partial_cmp(&a.total_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        consumers.truncate(limit);
        Ok(consumers)
    }

    /// Deletes hourly/minutely records whose window ended before
    /// now - retention_days. Idempotent: a second call with the same cutoff
    /// deletes nothing. The concurrent gauge is held elsewhere and untouched.
    pub fn cleanup_old_records(&self, retention_days: i64) -> Result<u64> {
        let cutoff = self.retention_cutoff(retention_days);
        let mut windows = self
            .windows
            .write()
            .map_err(|_| Error::lock_poisoned("usage windows"))?;
        let before = windows.len();
        windows.retain(|_, record| record.window_end >= cutoff);
        Ok((before - windows.len()) as u64)
    }

    /// How many records `cleanup_old_records` would delete, without deleting.
    pub fn expired_record_count(&self, retention_days: i64) -> Result<u64> {
        let cutoff = self.retention_cutoff(retention_days);
        let windows = self
            .windows
            .read()
            .map_err(|_| Error::lock_poisoned("usage windows"))?;
        Ok(windows
            .values()
            .filter(|record| record.window_end < cutoff)
            .count() as u64)
    }

    /// Calendar totals (UTC) reported after a retention sweep.
    pub fn usage_totals(&self) -> Result<UsageTotals> {
        let now = self.clock.now();
        let now_ts = now.timestamp();
        let day_start = now_ts - now_ts.rem_euclid(DAY_SECS);
        let week_start = day_start - i64::from(now.weekday().num_days_from_monday()) * DAY_SECS;
        let month_start = day_start - i64::from(now.day().saturating_sub(1)) * DAY_SECS;

        let windows = self
            .windows
            .read()
            .map_err(|_| Error::lock_poisoned("usage windows"))?;
        let mut totals = UsageTotals::default();
        for record in windows.values() {
            if record.kind != WindowKind::Hourly {
                continue;
            }
            if record.window_start >= day_start {
                totals.requests_today += record.request_count;
                totals.overage_requests_today += record.overage_count;
            }
            if record.window_start >= week_start {
                totals.requests_this_week += record.request_count;
            }
            if record.window_start >= month_start {
                totals.requests_this_month += record.request_count;
            }
        }
        Ok(totals)
    }

    fn retention_cutoff(&self, retention_days: i64) -> i64 {
        self.clock.now_ts() - retention_days * DAY_SECS
    }

    fn prune_stale_slots(slots: &mut VecDeque<i64>, now_ts: i64, max_duration: i64) {
        while let Some(&started) = slots.front() {
            if now_ts - started >= max_duration {
                slots.pop_front();
            } else {
                break;
            }
        }
    }
}
