use crate::clock::{Clock, SharedClock};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

/// Subscription tiers, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
    Unlimited,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
            Tier::Unlimited => "unlimited",
        }
    }

    /// Base limits per tier. The unlimited tier still caps concurrency to
    /// protect the backend.
    pub fn base_limits(&self) -> TierLimits {
        match self {
            Tier::Free => TierLimits {
                requests_per_hour: 1_000,
                burst_per_minute: 100,
                concurrent_requests: 10,
                overage_price_per_request: 0.001,
            },
            Tier::Basic => TierLimits {
                requests_per_hour: 5_000,
                burst_per_minute: 300,
                concurrent_requests: 25,
                overage_price_per_request: 0.0008,
            },
            Tier::Premium => TierLimits {
                requests_per_hour: 25_000,
                burst_per_minute: 1_500,
                concurrent_requests: 100,
                overage_price_per_request: 0.0006,
            },
            Tier::Enterprise => TierLimits {
                requests_per_hour: 100_000,
                burst_per_minute: 5_000,
                concurrent_requests: 500,
                overage_price_per_request: 0.0004,
            },
            Tier::Unlimited => TierLimits {
                requests_per_hour: u64::MAX,
                burst_per_minute: u64::MAX,
                concurrent_requests: 1_000,
                overage_price_per_request: 0.0002,
            },
        }
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            "unlimited" => Ok(Tier::Unlimited),
            other => Err(Error::Validation(format!("unknown tier: {}", other))),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-tier base limits consumed by the resolver and overage billing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests_per_hour: u64,
    pub burst_per_minute: u64,
    pub concurrent_requests: u64,
    pub overage_price_per_request: f64,
}

/// One subject's subscription record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subject_id: String,
    pub tier: Tier,
    pub overage_allowed: bool,
    pub started_at: DateTime<Utc>,
}

impl Subscription {
    pub fn limits(&self) -> TierLimits {
        self.tier.base_limits()
    }
}

/// Subscription/tier store. A free-tier subscription is materialized lazily
/// the first time limits are resolved for a subject; the insert-if-absent is
/// keyed by subject id so concurrent callers converge on one record.
pub struct SubscriptionStore {
    clock: SharedClock,
    inner: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the subject's subscription, creating a free-tier default if
    /// none exists. Idempotent under concurrent callers.
    pub fn ensure_subscription(&self, subject_id: &str) -> Result<Subscription> {
        let mut subs = self
            .inner
            .write()
            .map_err(|_| Error::lock_poisoned("subscription store"))?;
        let now = self.clock.now();
        let sub = subs
            .entry(subject_id.to_string())
            .or_insert_with(|| Subscription {
                subject_id: subject_id.to_string(),
                tier: Tier::Free,
                overage_allowed: false,
                started_at: now,
            });
        Ok(sub.clone())
    }

    pub fn get(&self, subject_id: &str) -> Result<Option<Subscription>> {
        let subs = self
            .inner
            .read()
            .map_err(|_| Error::lock_poisoned("subscription store"))?;
        Ok(subs.get(subject_id).cloned())
    }

    /// Moves a subject onto a new tier, materializing the subscription first
    /// if needed.
    pub fn set_tier(&self, subject_id: &str, tier: Tier) -> Result<Subscription> {
        let mut subs = self
            .inner
            .write()
            .map_err(|_| Error::lock_poisoned("subscription store"))?;
        let now = self.clock.now();
        let sub = subs
            .entry(subject_id.to_string())
            .or_insert_with(|| Subscription {
                subject_id: subject_id.to_string(),
                tier: Tier::Free,
                overage_allowed: false,
                started_at: now,
            });
        sub.tier = tier;
        Ok(sub.clone())
    }

    pub fn set_overage_allowed(&self, subject_id: &str, allowed: bool) -> Result<Subscription> {
        let mut subs = self
            .inner
            .write()
            .map_err(|_| Error::lock_poisoned("subscription store"))?;
        let sub = subs
            .get_mut(subject_id)
            .ok_or_else(|| Error::NotFound(format!("subject {}", subject_id)))?;
        sub.overage_allowed = allowed;
        Ok(sub.clone())
    }

    pub fn subject_count(&self) -> Result<usize> {
        let subs = self
            .inner
            .read()
            .map_err(|_| Error::lock_poisoned("subscription store"))?;
        Ok(subs.len())
    }

    /// Subscription counts per tier, for the admin dashboard.
    pub fn counts_by_tier(&self) -> Result<HashMap<Tier, u64>> {
        let subs = self
            .inner
            .read()
            .map_err(|_| Error::lock_poisoned("subscription store"))?;
        let mut counts = HashMap::new();
        for sub in subs.values() {
            *counts.entry(sub.tier).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
