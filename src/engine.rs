use crate::error::Result;
use crate::exceptions::{ExceptionStatus, ExceptionStore, NewException, RateLimitException};
use crate::overage::overage_cost;
use crate::resolver::{fold_exceptions, EffectiveLimits, QuotaLimitResolver};
use crate::tiers::{Subscription, SubscriptionStore, Tier};
use crate::usage::{Period, TopConsumer, UsageTracker, WindowKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Which limit a denied (or overage-billed) request ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitTypeHit {
    Hourly,
    Burst,
    Concurrent,
}

/// Retry hint for concurrent-limit denials; the gauge drains quickly.
const CONCURRENT_RETRY_AFTER_SECS: i64 = 5;

/// Outcome of a per-request quota check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit_type_hit: Option<LimitTypeHit>,
    pub retry_after: Option<i64>,
    pub overage_cost: f64,
    pub limits: EffectiveLimits,
}

/// Aggregate stats for the admin dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub total_subjects: usize,
    pub subscriptions_by_tier: HashMap<String, u64>,
    pub active_exceptions: u64,
    pub requests_today: u64,
    pub overage_requests_today: u64,
    pub top_consumers: Vec<TopConsumer>,
}

/// Tunables for the decision path.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub overage_billing_enabled: bool,
}

/// The quota engine: decides whether a subject may proceed, meters usage,
/// and hosts the administrative operations.
///
/// Cache invalidation is synchronous and co-located with every mutation that
/// changes an exception's state or a subject's tier, so cached effective
/// limits never outlive the facts they were derived from.
pub struct QuotaEngine {
    subscriptions: Arc<SubscriptionStore>,
    exceptions: Arc<ExceptionStore>,
    usage: Arc<UsageTracker>,
    resolver: Arc<QuotaLimitResolver>,
    settings: EngineSettings,
}

impl QuotaEngine {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        exceptions: Arc<ExceptionStore>,
        usage: Arc<UsageTracker>,
        resolver: Arc<QuotaLimitResolver>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            subscriptions,
            exceptions,
            usage,
            resolver,
            settings,
        }
    }

    /// Decides whether a request with the given cost may proceed, checking
    /// hourly, then burst, then concurrent limits. A subject whose
    /// subscription allows overage passes the hourly check with the excess
    /// billed instead of denied.
    ///
    /// Each active exception folded into this decision consumes one use;
    /// an exception whose conditional use-increment fails simply drops out
    /// of the fold.
    pub fn check_request(&self, subject_id: &str, cost: f64) -> Result<RateLimitDecision> {
        let subscription = self.subscriptions.ensure_subscription(subject_id)?;
        let limits = self.consume_exception_uses(subject_id)?;

        let hourly = self
            .usage
            .current_window_usage(subject_id, WindowKind::Hourly)?;
        let minutely = self
            .usage
            .current_window_usage(subject_id, WindowKind::Minutely)?;
        let concurrent = self.usage.concurrent_count(subject_id)?;

        let mut decision = RateLimitDecision {
            allowed: true,
            limit_type_hit: None,
            retry_after: None,
            overage_cost: 0.0,
            limits,
        };

        if hourly.total_cost + cost > limits.hourly as f64 {
            decision.allowed = false;
            decision.limit_type_hit = Some(LimitTypeHit::Hourly);
            decision.retry_after = Some(hourly.time_remaining);

            if self.settings.overage_billing_enabled && subscription.overage_allowed {
                decision.overage_cost = overage_cost(
                    hourly.total_cost + cost,
                    limits.hourly,
                    subscription.limits().overage_price_per_request,
                );
                decision.allowed = true;
                decision.retry_after = None;
            }
        }

        if decision.allowed && minutely.total_cost + cost > limits.burst as f64 {
            decision.allowed = false;
            decision.limit_type_hit = Some(LimitTypeHit::Burst);
            decision.retry_after = Some(minutely.time_remaining);
        }

        if decision.allowed && concurrent >= limits.concurrent {
            decision.allowed = false;
            decision.limit_type_hit = Some(LimitTypeHit::Concurrent);
            decision.retry_after = Some(CONCURRENT_RETRY_AFTER_SECS);
        }

        if !decision.allowed {
            tracing::warn!(
                subject_id,
                tier = %subscription.tier,
                limit_type = ?decision.limit_type_hit,
                hourly_usage = hourly.total_cost,
                burst_usage = minutely.total_cost,
                concurrent,
                "rate limit violation"
            );
        }

        Ok(decision)
    }

    /// Checks and, when allowed, records the request in one call. This is
    /// the enforcement entry point used by the request path.
    pub fn check_and_record(&self, subject_id: &str, cost: f64) -> Result<RateLimitDecision> {
        let decision = self.check_request(subject_id, cost)?;
        if decision.allowed {
            self.usage
                .record_request_with_overage(subject_id, cost, decision.overage_cost)?;
        }
        Ok(decision)
    }

    /// Releases the subject's concurrent slot when a request completes.
    pub fn release_slot(&self, subject_id: &str) -> Result<()> {
        self.usage.release_concurrent_slot(subject_id)
    }

    pub fn has_exceeded_quota(&self, subject_id: &str) -> Result<bool> {
        self.resolver.has_exceeded_quota(subject_id)
    }

    pub fn create_exception(&self, new: NewException) -> Result<RateLimitException> {
        if let Some(subject_id) = new.scope.subject_id() {
            self.subscriptions.ensure_subscription(subject_id)?;
        }
        let exception = self.exceptions.create(new)?;
        self.invalidate_for(&exception)?;
        Ok(exception)
    }

    pub fn revoke_exception(&self, id: Uuid, reason: &str) -> Result<RateLimitException> {
        let exception = self.exceptions.revoke(id, reason)?;
        self.invalidate_for(&exception)?;
        Ok(exception)
    }

    pub fn get_exception(&self, id: Uuid) -> Result<RateLimitException> {
        self.exceptions.get(id)
    }

    /// Admin listing, optionally narrowed by subject, status, or the tier of
    /// the exception's subject. Global-scope exceptions have no subject and
    /// never match a tier filter.
    pub fn list_exceptions(
        &self,
        subject_id: Option<&str>,
        status: Option<ExceptionStatus>,
        tier: Option<Tier>,
    ) -> Result<Vec<RateLimitException>> {
        let list = self.exceptions.list(subject_id, status)?;
        let Some(tier) = tier else {
            return Ok(list);
        };
        let mut filtered = Vec::with_capacity(list.len());
        for ex in list {
            if let Some(id) = ex.scope.subject_id() {
                if let Some(sub) = self.subscriptions.get(id)? {
                    if sub.tier == tier {
                        filtered.push(ex);
                    }
                }
            }
        }
        Ok(filtered)
    }

    /// Moves a subject to a new tier and optionally toggles overage billing.
    pub fn update_subscription(
        &self,
        subject_id: &str,
        tier: Tier,
        overage_allowed: Option<bool>,
    ) -> Result<Subscription> {
        let mut subscription = self.subscriptions.set_tier(subject_id, tier)?;
        if let Some(allowed) = overage_allowed {
            subscription = self.subscriptions.set_overage_allowed(subject_id, allowed)?;
        }
        self.resolver.invalidate(subject_id)?;
        Ok(subscription)
    }

    pub fn top_consumers(&self, limit: usize, period: Period) -> Result<Vec<TopConsumer>> {
        self.usage.top_consumers(limit, period)
    }

    pub fn dashboard(&self) -> Result<DashboardStats> {
        let totals = self.usage.usage_totals()?;
        let by_tier = self
            .subscriptions
            .counts_by_tier()?
            .into_iter()
            .map(|(tier, count)| (tier.as_str().to_string(), count))
            .collect();
        Ok(DashboardStats {
            total_subjects: self.subscriptions.subject_count()?,
            subscriptions_by_tier: by_tier,
            active_exceptions: self.exceptions.active_count()?,
            requests_today: totals.requests_today,
            overage_requests_today: totals.overage_requests_today,
            top_consumers: self.usage.top_consumers(10, Period::Last24Hours)?,
        })
    }

    /// Applies one use per active exception and folds the survivors over the
    /// subject's base limits. Exceptions that fail the conditional increment
    /// fall out of the fold for this request, and the cached limits are
    /// invalidated since their state just changed.
    fn consume_exception_uses(&self, subject_id: &str) -> Result<EffectiveLimits> {
        let base: EffectiveLimits = self.resolver.base_limits(subject_id)?.into();
        let active = self.exceptions.find_active_for(subject_id)?;
        if active.is_empty() {
            return Ok(base);
        }

        let mut applied = Vec::with_capacity(active.len());
        let mut any_transitioned = false;
        for ex in active {
            if self.exceptions.apply_use(ex.id)? {
                // The use may have been the one that hit max_uses.
                if self.exceptions.get(ex.id)?.status != ExceptionStatus::Active {
                    any_transitioned = true;
                }
                applied.push(ex);
            } else {
                any_transitioned = true;
            }
        }
        if any_transitioned {
            self.resolver.invalidate(subject_id)?;
        }
        Ok(fold_exceptions(base, &applied))
    }

    fn invalidate_for(&self, exception: &RateLimitException) -> Result<()> {
        match exception.scope.subject_id() {
            Some(subject_id) => self.resolver.invalidate(subject_id),
            None => self.resolver.invalidate_all(),
        }
    }
}
