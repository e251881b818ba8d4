use crate::error::Result;
use crate::exceptions::{ExceptionStore, StatusCounts};
use crate::resolver::QuotaLimitResolver;
use crate::usage::{UsageTracker, UsageTotals};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of the usage-record retention sweep.
#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    pub retention_days: i64,
    /// Records deleted, or that would be deleted under dry-run.
    pub affected: u64,
    pub totals: Option<UsageTotals>,
    pub error: Option<String>,
}

/// One expired exception in an expiry report.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiredExceptionDetail {
    pub id: Uuid,
    pub subject_id: Option<String>,
    pub reason: String,
    pub times_used: u32,
}

/// Outcome of the exception-expiry sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiryReport {
    pub dry_run: bool,
    pub force: bool,
    pub affected: u64,
    pub details: Vec<ExpiredExceptionDetail>,
    pub counts: Option<StatusCounts>,
    pub error: Option<String>,
}

/// The two periodic maintenance jobs. Both are idempotent and safe to re-run
/// after interruption: they only touch historical usage records or
/// already-determined-inactive exceptions, and never roll back committed
/// work on failure.
pub struct MaintenanceSweeps {
    usage: Arc<UsageTracker>,
    exceptions: Arc<ExceptionStore>,
    resolver: Arc<QuotaLimitResolver>,
}

impl MaintenanceSweeps {
    pub fn new(
        usage: Arc<UsageTracker>,
        exceptions: Arc<ExceptionStore>,
        resolver: Arc<QuotaLimitResolver>,
    ) -> Self {
        Self {
            usage,
            exceptions,
            resolver,
        }
    }

    /// Deletes (or, under dry-run, counts) usage records older than the
    /// retention window, then reports current aggregate totals.
    pub fn run_retention(&self, retention_days: i64, dry_run: bool) -> RetentionReport {
        let mut report = RetentionReport {
            dry_run,
            retention_days,
            affected: 0,
            totals: None,
            error: None,
        };

        let result: Result<()> = (|| {
            report.affected = if dry_run {
                self.usage.expired_record_count(retention_days)?
            } else {
                self.usage.cleanup_old_records(retention_days)?
            };
            report.totals = Some(self.usage.usage_totals()?);
            Ok(())
        })();

        match result {
            Ok(()) => {
                tracing::info!(
                    retention_days,
                    dry_run,
                    affected = report.affected,
                    "retention sweep completed"
                );
            }
            Err(err) => {
                tracing::error!(retention_days, dry_run, error = %err, "retention sweep failed");
                report.error = Some(err.to_string());
            }
        }
        report
    }

    /// Expires (or, under dry-run, lists) due exceptions, logging each
    /// expiration and reporting per-status counts afterwards.
    pub fn run_expiry(&self, dry_run: bool, force: bool) -> ExpiryReport {
        let mut report = ExpiryReport {
            dry_run,
            force,
            affected: 0,
            details: Vec::new(),
            counts: None,
            error: None,
        };

        let result: Result<()> = (|| {
            let expired = if dry_run {
                self.exceptions.due_for_expiry(force)?
            } else {
                let expired = self.exceptions.expire_due(force)?;
                // Expired exceptions no longer shape any subject's limits.
                for ex in &expired {
                    match ex.scope.subject_id() {
                        Some(subject_id) => self.resolver.invalidate(subject_id)?,
                        None => self.resolver.invalidate_all()?,
                    }
                }
                expired
            };

            report.affected = expired.len() as u64;
            report.details = expired
                .iter()
                .map(|ex| ExpiredExceptionDetail {
                    id: ex.id,
                    subject_id: ex.scope.subject_id().map(str::to_string),
                    // The expiry note carries the trigger; dry-run candidates
                    // have not been annotated yet, so fall back to the grant
                    // reason.
                    reason: ex
                        .notes
                        .as_deref()
                        .and_then(|notes| notes.lines().last())
                        .unwrap_or(&ex.reason)
                        .to_string(),
                    times_used: ex.times_used,
                })
                .collect();
            report.counts = Some(self.exceptions.status_counts()?);
            Ok(())
        })();

        match result {
            Ok(()) => {
                tracing::info!(
                    dry_run,
                    force,
                    affected = report.affected,
                    "expiry sweep completed"
                );
            }
            Err(err) => {
                tracing::error!(dry_run, force, error = %err, "expiry sweep failed");
                report.error = Some(err.to_string());
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SharedClock};
    use crate::exceptions::{
        ExceptionEffect, ExceptionScope, ExceptionStatus, LimitDimension, NewException,
    };
    use crate::tiers::SubscriptionStore;
    use chrono::{DateTime, TimeDelta};

    const START: i64 = 1_700_000_000;

    struct Fixture {
        clock: ManualClock,
        usage: Arc<UsageTracker>,
        exceptions: Arc<ExceptionStore>,
        sweeps: MaintenanceSweeps,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(DateTime::from_timestamp(START, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        let subscriptions = Arc::new(SubscriptionStore::new(Arc::clone(&shared)));
        let exceptions = Arc::new(ExceptionStore::new(Arc::clone(&shared)));
        let usage = Arc::new(UsageTracker::new(Arc::clone(&shared), 300));
        let resolver = Arc::new(QuotaLimitResolver::new(
            shared,
            subscriptions,
            Arc::clone(&exceptions),
            Arc::clone(&usage),
            5,
        ));
        let sweeps = MaintenanceSweeps::new(
            Arc::clone(&usage),
            Arc::clone(&exceptions),
            resolver,
        );
        Fixture {
            clock,
            usage,
            exceptions,
            sweeps,
        }
    }

    #[test]
    fn test_retention_dry_run_leaves_storage_unchanged() {
        let f = fixture();
        f.usage.record_request("42", 1.0).unwrap();
        f.clock.advance_secs(31 * 86_400);

        let dry = f.sweeps.run_retention(30, true);
        assert_eq!(dry.affected, 2); // hourly + minutely record
        assert!(dry.error.is_none());

        // Storage unchanged: the real sweep deletes exactly the same rows.
        let real = f.sweeps.run_retention(30, false);
        assert_eq!(real.affected, 2);

        let again = f.sweeps.run_retention(30, false);
        assert_eq!(again.affected, 0);
    }

    #[test]
    fn test_retention_reports_totals() {
        let f = fixture();
        f.usage.record_request("42", 1.0).unwrap();
        let report = f.sweeps.run_retention(30, false);
        assert_eq!(report.totals.unwrap().requests_today, 1);
    }

    #[test]
    fn test_expiry_dry_run_counts_without_expiring() {
        let f = fixture();
        let ex = f
            .exceptions
            .create(NewException {
                scope: ExceptionScope::Subject("42".to_string()),
                dimension: LimitDimension::Hourly,
                effect: ExceptionEffect::Grant(100),
                expires_at: Some(f.clock.now() + TimeDelta::seconds(10)),
                max_uses: None,
                auto_expire: false,
                reason: "temporary".to_string(),
                created_by: "ops".to_string(),
            })
            .unwrap();
        f.clock.advance_secs(11);

        let dry = f.sweeps.run_expiry(true, false);
        assert_eq!(dry.affected, 1);
        assert_eq!(
            f.exceptions.get(ex.id).unwrap().status,
            ExceptionStatus::Active
        );

        let real = f.sweeps.run_expiry(false, false);
        assert_eq!(real.affected, 1);
        assert_eq!(real.details[0].subject_id.as_deref(), Some("42"));
        assert_eq!(
            f.exceptions.get(ex.id).unwrap().status,
            ExceptionStatus::Expired
        );
        assert_eq!(real.counts.unwrap().expired, 1);

        // Re-running converges: nothing left to do.
        let again = f.sweeps.run_expiry(false, false);
        assert_eq!(again.affected, 0);
    }
}
