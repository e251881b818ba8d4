use crate::clock::{Clock, SharedClock};
use crate::error::{Error, Result};
use crate::exceptions::{ExceptionEffect, ExceptionStore, LimitDimension, RateLimitException};
use crate::tiers::{SubscriptionStore, TierLimits};
use crate::usage::{UsageTracker, WindowKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The fold of a subject's tier base limits with its active exceptions.
/// Derived, not persisted; safe to cache briefly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveLimits {
    pub hourly: u64,
    pub burst: u64,
    pub concurrent: u64,
}

impl From<TierLimits> for EffectiveLimits {
    fn from(limits: TierLimits) -> Self {
        Self {
            hourly: limits.requests_per_hour,
            burst: limits.burst_per_minute,
            concurrent: limits.concurrent_requests,
        }
    }
}

impl EffectiveLimits {
    fn dimension(&self, dim: LimitDimension) -> u64 {
        match dim {
            LimitDimension::Hourly => self.hourly,
            LimitDimension::Burst => self.burst,
            LimitDimension::Concurrent => self.concurrent,
        }
    }

    fn set_dimension(&mut self, dim: LimitDimension, value: u64) {
        match dim {
            LimitDimension::Hourly => self.hourly = value,
            LimitDimension::Burst => self.burst = value,
            LimitDimension::Concurrent => self.concurrent = value,
        }
    }
}

fn apply_effect(value: u64, effect: ExceptionEffect) -> u64 {
    match effect {
        ExceptionEffect::Grant(amount) => value.saturating_add(amount),
        ExceptionEffect::Restrict(amount) => value.saturating_sub(amount),
        ExceptionEffect::Multiply(factor) => {
            let scaled = value as f64 * factor;
            if scaled >= u64::MAX as f64 {
                u64::MAX
            } else if scaled <= 0.0 {
                0
            } else {
                scaled.round() as u64
            }
        }
    }
}

/// Folds exceptions over base limits in the given order. The fold is not
/// commutative across effect kinds, so callers pass exceptions in creation
/// order (the store's `find_active_for` ordering).
pub fn fold_exceptions(
    base: EffectiveLimits,
    exceptions: &[RateLimitException],
) -> EffectiveLimits {
    let mut limits = base;
    for ex in exceptions {
        let current = limits.dimension(ex.dimension);
        limits.set_dimension(ex.dimension, apply_effect(current, ex.effect));
    }
    limits
}

struct CachedLimits {
    limits: EffectiveLimits,
    cached_at_ts: i64,
}

/// Answers "what is this subject allowed right now?" and "have they exceeded
/// it?".
///
/// Resolution is read-heavy and side-effect-free apart from the lazy
/// free-tier materialization, so results are cached for a few seconds per
/// subject. Every exception mutation invalidates the affected entries
/// synchronously (see `QuotaEngine`), keeping allow/deny decisions fresh.
pub struct QuotaLimitResolver {
    clock: SharedClock,
    subscriptions: Arc<SubscriptionStore>,
    exceptions: Arc<ExceptionStore>,
    usage: Arc<UsageTracker>,
    cache: RwLock<HashMap<String, CachedLimits>>,
    cache_ttl_secs: i64,
}

impl QuotaLimitResolver {
    pub fn new(
        clock: SharedClock,
        subscriptions: Arc<SubscriptionStore>,
        exceptions: Arc<ExceptionStore>,
        usage: Arc<UsageTracker>,
        cache_ttl_secs: i64,
    ) -> Self {
        Self {
            clock,
            subscriptions,
            exceptions,
            usage,
            cache: RwLock::new(HashMap::new()),
            cache_ttl_secs,
        }
    }

    /// Tier base limits for a subject, materializing a free-tier subscription
    /// on first access.
    pub fn base_limits(&self, subject_id: &str) -> Result<TierLimits> {
        Ok(self.subscriptions.ensure_subscription(subject_id)?.limits())
    }

    /// Effective limits: base limits folded with all active exceptions in
    /// creation order. Cached per subject for `cache_ttl_secs`.
    pub fn effective_limits(&self, subject_id: &str) -> Result<EffectiveLimits> {
        let now_ts = self.clock.now_ts();
        {
            let cache = self
                .cache
                .read()
                .map_err(|_| Error::lock_poisoned("limit cache"))?;
            if let Some(cached) = cache.get(subject_id) {
                if now_ts - cached.cached_at_ts < self.cache_ttl_secs {
                    return Ok(cached.limits);
                }
            }
        }

        let base: EffectiveLimits = self.base_limits(subject_id)?.into();
        let active = self.exceptions.find_active_for(subject_id)?;
        let limits = fold_exceptions(base, &active);

        let mut cache = self
            .cache
            .write()
            .map_err(|_| Error::lock_poisoned("limit cache"))?;
        cache.insert(
            subject_id.to_string(),
            CachedLimits {
                limits,
                cached_at_ts: now_ts,
            },
        );
        Ok(limits)
    }

    /// True iff current hourly usage total has reached the effective hourly
    /// limit.
    pub fn has_exceeded_quota(&self, subject_id: &str) -> Result<bool> {
        let limits = self.effective_limits(subject_id)?;
        let hourly = self
            .usage
            .current_window_usage(subject_id, WindowKind::Hourly)?;
        Ok(hourly.total_cost >= limits.hourly as f64)
    }

    pub fn invalidate(&self, subject_id: &str) -> Result<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| Error::lock_poisoned("limit cache"))?;
        cache.remove(subject_id);
        Ok(())
    }

    /// Drops every cached entry; used when a global-scope exception changes.
    pub fn invalidate_all(&self) -> Result<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|_| Error::lock_poisoned("limit cache"))?;
        cache.clear();
        Ok(())
    }
}
