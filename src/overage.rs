use crate::error::Result;
use crate::resolver::QuotaLimitResolver;
use crate::tiers::SubscriptionStore;
use crate::usage::{UsageTracker, WindowKind};
use std::sync::Arc;

/// Billable cost for usage beyond a limit. Excess is clamped at zero, so the
/// result is never negative.
pub fn overage_cost(usage_total: f64, limit: u64, price_per_request: f64) -> f64 {
    let excess = (usage_total - limit as f64).max(0.0);
    excess * price_per_request
}

/// Computes billable overage from effective limits and current usage.
pub struct OverageCalculator {
    subscriptions: Arc<SubscriptionStore>,
    resolver: Arc<QuotaLimitResolver>,
    usage: Arc<UsageTracker>,
}

impl OverageCalculator {
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

    /// Overage cost for the subject's current hourly window. Zero when the
    /// subject is within its limit or its subscription disallows overage.
    pub fn calculate_overage_cost(&self, subject_id: &str) -> Result<f64> {
        let subscription = self.subscriptions.ensure_subscription(subject_id)?;
        if !subscription.overage_allowed {
            return Ok(0.0);
        }
        let limits = self.resolver.effective_limits(subject_id)?;
        let hourly = self
            .usage
            .current_window_usage(subject_id, WindowKind::Hourly)?;
        Ok(overage_cost(
            hourly.total_cost,
            limits.hourly,
            subscription.limits().overage_price_per_request,
        ))
    }
}
