use crate::error::Result;
use crate::resolver::{EffectiveLimits, QuotaLimitResolver};
use crate::tiers::{SubscriptionStore, Tier};
use crate::usage::{UsageTracker, WindowKind, WindowUsage};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct UsageBlock {
    pub hourly: WindowUsage,
    pub minutely: WindowUsage,
    pub concurrent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PercentageUsed {
    pub hourly: f64,
    pub minutely: f64,
    pub concurrent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeUntilReset {
    pub hourly: i64,
    pub minutely: i64,
}

/// Composite status consumed by monitoring and alerting callers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub subject_id: String,
    pub subscription_tier: Tier,
    pub limits: EffectiveLimits,
    pub usage: UsageBlock,
    pub percentage_used: PercentageUsed,
    pub time_until_reset: TimeUntilReset,
}

/// Assembles status reports from the resolver and tracker.
pub struct StatusReporter {
    subscriptions: Arc<SubscriptionStore>,
    resolver: Arc<QuotaLimitResolver>,
    usage: Arc<UsageTracker>,
}

impl StatusReporter {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        resolver: Arc<QuotaLimitResolver>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            subscriptions,
            resolver,
            usage,
        }
    }

    pub fn status(&self, subject_id: &str) -> Result<StatusReport> {
        let subscription = self.subscriptions.ensure_subscription(subject_id)?;
        let limits = self.resolver.effective_limits(subject_id)?;
        let hourly = self
            .usage
            .current_window_usage(subject_id, WindowKind::Hourly)?;
        let minutely = self
            .usage
            .current_window_usage(subject_id, WindowKind::Minutely)?;
        let concurrent = self.usage.concurrent_count(subject_id)?;

        let percentage_used = PercentageUsed {
            hourly: percentage(hourly.total_cost, limits.hourly),
            minutely: percentage(minutely.total_cost, limits.burst),
            concurrent: percentage(concurrent as f64, limits.concurrent),
        };
        let time_until_reset = TimeUntilReset {
            hourly: hourly.time_remaining,
            minutely: minutely.time_remaining,
        };

        Ok(StatusReport {
            subject_id: subject_id.to_string(),
            subscription_tier: subscription.tier,
            limits,
            usage: UsageBlock {
                hourly,
                minutely,
                concurrent,
            },
            percentage_used,
            time_until_reset,
        })
    }
}

/// Usage as a percentage of the limit, capped at 100. A zero limit reads as
/// fully used once there is any usage at all.
fn percentage(used: f64, limit: u64) -> f64 {
    if limit == 0 {
        return if used > 0.0 { 100.0 } else { 0.0 };
    }
    (used / limit as f64 * 100.0).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::exceptions::ExceptionStore;
    use chrono::DateTime;

    const START: i64 = 1_700_000_000;

    fn reporter() -> (StatusReporter, Arc<UsageTracker>) {
        let clock = ManualClock::new(DateTime::from_timestamp(START, 0).unwrap());
        let shared: SharedClock = Arc::new(clock);
        let subscriptions = Arc::new(SubscriptionStore::new(Arc::clone(&shared)));
        let exceptions = Arc::new(ExceptionStore::new(Arc::clone(&shared)));
        let usage = Arc::new(UsageTracker::new(Arc::clone(&shared), 300));
        let resolver = Arc::new(QuotaLimitResolver::new(
            shared,
            Arc::clone(&subscriptions),
            exceptions,
            Arc::clone(&usage),
            5,
        ));
        (
            StatusReporter::new(subscriptions, resolver, Arc::clone(&usage)),
            usage,
        )
    }

    #[test]
    fn test_status_for_fresh_subject() {
        let (reporter, _usage) = reporter();
        let status = reporter.status("42").unwrap();
        assert_eq!(status.subscription_tier, Tier::Free);
        assert_eq!(status.limits.hourly, 1_000);
        assert_eq!(status.usage.hourly.total_requests, 0);
        assert_eq!(status.percentage_used.hourly, 0.0);
        assert!(status.time_until_reset.hourly > 0);
        assert!(status.time_until_reset.hourly <= 3_600);
    }

    #[test]
    fn test_percentage_used_caps_at_hundred() {
        let (reporter, usage) = reporter();
        for _ in 0..150 {
            usage.record_request("42", 1.0).unwrap();
        }
        let status = reporter.status("42").unwrap();
        // 150 of 100 burst -> capped.
        assert_eq!(status.percentage_used.minutely, 100.0);
        assert_eq!(status.percentage_used.hourly, 15.0);
        assert_eq!(status.usage.concurrent, 150);
    }

    #[test]
    fn test_percentage_handles_zero_limit() {
        assert_eq!(percentage(0.0, 0), 0.0);
        assert_eq!(percentage(1.0, 0), 100.0);
    }
}
