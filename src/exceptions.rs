use crate::clock::{Clock, SharedClock};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

/// Who an exception applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "subject_id")]
pub enum ExceptionScope {
    Subject(String),
    Global,
}

impl ExceptionScope {
    pub fn matches(&self, subject_id: &str) -> bool {
        match self {
            ExceptionScope::Subject(id) => id == subject_id,
            ExceptionScope::Global => true,
        }
    }

    pub fn subject_id(&self) -> Option<&str> {
        match self {
            ExceptionScope::Subject(id) => Some(id),
            ExceptionScope::Global => None,
        }
    }
}

/// Which limit the exception targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitDimension {
    Hourly,
    Burst,
    Concurrent,
}

/// Closed effect variant. Folding these is not commutative across kinds
/// (a multiplier after a grant differs from before it), so callers fold in
/// creation order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "amount")]
pub enum ExceptionEffect {
    /// Additive increase.
    Grant(u64),
    /// Additive decrease, saturating at zero.
    Restrict(u64),
    /// Scale by a non-negative factor.
    Multiply(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionStatus {
    Active,
    Expired,
    Revoked,
}

/// A temporary administrative override of a subject's (or everyone's) limits.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitException {
    pub id: Uuid,
    pub scope: ExceptionScope,
    pub dimension: LimitDimension,
    pub effect: ExceptionEffect,
    pub status: ExceptionStatus,
    pub created_at: DateTime<Utc>,
    /// Monotonic creation sequence; deterministic tie-break when two
    /// exceptions share a created_at second.
    pub seq: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<u32>,
    pub times_used: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub auto_expire: bool,
    pub reason: String,
    pub created_by: String,
    pub notes: Option<String>,
}

impl RateLimitException {
    /// Active status and no natural trigger has fired yet.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ExceptionStatus::Active
            && !self.time_expired(now)
            && !self.max_uses_reached()
    }

    pub fn time_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn max_uses_reached(&self) -> bool {
        self.max_uses.is_some_and(|max| self.times_used >= max)
    }

    pub fn uses_remaining(&self) -> Option<u32> {
        self.max_uses.map(|max| max.saturating_sub(self.times_used))
    }

    pub fn time_remaining_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|at| (at.timestamp() - now.timestamp()).max(0))
    }

    fn append_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(notes) => {
                notes.push('\n');
                notes.push_str(note);
            }
            None => self.notes = Some(note.to_string()),
        }
    }
}

/// Parameters for creating an exception.
#[derive(Debug, Clone)]
pub struct NewException {
    pub scope: ExceptionScope,
    pub dimension: LimitDimension,
    pub effect: ExceptionEffect,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<u32>,
    pub auto_expire: bool,
    pub reason: String,
    pub created_by: String,
}

/// Counts per status, reported by the expiry sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusCounts {
    pub active: u64,
    pub expired: u64,
    pub revoked: u64,
}

/// Creates, queries, applies, and expires rate-limit exceptions.
///
/// State machine: active → expired (natural trigger or sweep) or
/// active → revoked (administrative only). Both end states are terminal.
pub struct ExceptionStore {
    clock: SharedClock,
    inner: RwLock<HashMap<Uuid, RateLimitException>>,
    next_seq: AtomicU64,
}

impl ExceptionStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn create(&self, new: NewException) -> Result<RateLimitException> {
        if let ExceptionEffect::Multiply(factor) = new.effect {
            if !factor.is_finite() || factor < 0.0 {
                return Err(Error::Validation(format!(
                    "multiplier factor must be non-negative, got {}",
                    factor
                )));
            }
        }
        if new.max_uses == Some(0) {
            return Err(Error::Validation("max_uses must be at least 1".to_string()));
        }
        let now = self.clock.now();
        if new.expires_at.is_some_and(|at| at <= now) {
            return Err(Error::Validation(
                "expires_at must be in the future".to_string(),
            ));
        }

        let exception = RateLimitException {
            id: Uuid::new_v4(),
            scope: new.scope,
            dimension: new.dimension,
            effect: new.effect,
            status: ExceptionStatus::Active,
            created_at: now,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            expires_at: new.expires_at,
            max_uses: new.max_uses,
            times_used: 0,
            last_used_at: None,
            auto_expire: new.auto_expire,
            reason: new.reason,
            created_by: new.created_by,
            notes: None,
        };

        let mut store = self
            .inner
            .write()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        store.insert(exception.id, exception.clone());
        tracing::info!(
            exception_id = %exception.id,
            subject_id = exception.scope.subject_id().unwrap_or("<global>"),
            reason = %exception.reason,
            "rate limit exception created"
        );
        Ok(exception)
    }

    pub fn get(&self, id: Uuid) -> Result<RateLimitException> {
        let store = self
            .inner
            .read()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        store
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("exception {}", id)))
    }

    /// All currently applicable exceptions for a subject (its own plus
    /// global-scope ones), ordered by creation time ascending. The ordering
    /// is load-bearing: the resolver folds effects in exactly this order.
    pub fn find_active_for(&self, subject_id: &str) -> Result<Vec<RateLimitException>> {
        let now = self.clock.now();
        let store = self
            .inner
            .read()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        let mut active: Vec<RateLimitException> = store
            .values()
            .filter(|ex| ex.scope.matches(subject_id) && ex.is_active(now))
            .cloned()
            .collect();
        active.sort_by_key(|ex| (ex.created_at, ex.seq));
        Ok(active)
    }

    /// Admin listing, optionally filtered by subject and/or status, newest
    /// first.
    pub fn list(
        &self,
        subject_id: Option<&str>,
        status: Option<ExceptionStatus>,
    ) -> Result<Vec<RateLimitException>> {
        let store = self
            .inner
            .read()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        let mut matches: Vec<RateLimitException> = store
            .values()
            .filter(|ex| {
                subject_id.map_or(true, |id| ex.scope.subject_id() == Some(id))
                    && status.map_or(true, |s| ex.status == s)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|ex| std::cmp::Reverse((ex.created_at, ex.seq)));
        Ok(matches)
    }

    /// Conditional use increment: succeeds only while the exception is still
    /// applicable. The check, the increment, and the boundary transition to
    /// expired all happen under one write lock, so concurrent callers can
    /// never jointly push times_used past max_uses.
    ///
    /// Returns false when the exception no longer applies; the caller must
    /// resolve limits without it rather than erroring.
    pub fn apply_use(&self, id: Uuid) -> Result<bool> {
        let now = self.clock.now();
        let mut store = self
            .inner
            .write()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        let ex = store
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("exception {}", id)))?;
        if !ex.is_active(now) {
            return Ok(false);
        }

        ex.times_used += 1;
        ex.last_used_at = Some(now);
        if let Some(max) = ex.max_uses {
            if ex.times_used >= max {
                let reason = format!("Maximum uses reached ({}/{})", ex.times_used, max);
                Self::mark_expired(ex, now, &reason);
            }
        }
        Ok(true)
    }

    /// Administrative revocation. Only an active exception can be revoked.
    pub fn revoke(&self, id: Uuid, reason: &str) -> Result<RateLimitException> {
        let now = self.clock.now();
        let mut store = self
            .inner
            .write()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        let ex = store
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("exception {}", id)))?;
        if ex.status != ExceptionStatus::Active {
            return Err(Error::Validation(format!(
                "exception {} is not active and cannot be revoked",
                id
            )));
        }
        ex.status = ExceptionStatus::Revoked;
        ex.append_note(&format!("Revoked: {} at {}", reason, now));
        tracing::info!(exception_id = %id, reason, "rate limit exception revoked");
        Ok(ex.clone())
    }

    /// Exceptions the sweep would expire right now, without expiring them.
    pub fn due_for_expiry(&self, force: bool) -> Result<Vec<RateLimitException>> {
        let now = self.clock.now();
        let store = self
            .inner
            .read()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        Ok(store
            .values()
            .filter(|ex| {
                ex.status == ExceptionStatus::Active
                    && Self::expiry_reason(ex, now, force).is_some()
            })
            .cloned()
            .collect())
    }

    /// The periodic expiry sweep. Always expires natural-expiry candidates
    /// (time passed or max uses reached); when forced, additionally expires
    /// any active auto_expire exception regardless of natural trigger.
    /// Revoked and already-expired exceptions are never touched.
    pub fn expire_due(&self, force: bool) -> Result<Vec<RateLimitException>> {
        let now = self.clock.now();
        let mut store = self
            .inner
            .write()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        let mut expired = Vec::new();
        for ex in store.values_mut() {
            if ex.status != ExceptionStatus::Active {
                continue;
            }
            if let Some(reason) = Self::expiry_reason(ex, now, force) {
                Self::mark_expired(ex, now, &reason);
                expired.push(ex.clone());
            }
        }
        Ok(expired)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let store = self
            .inner
            .read()
            .map_err(|_| Error::lock_poisoned("exception store"))?;
        let mut counts = StatusCounts::default();
        for ex in store.values() {
            match ex.status {
                ExceptionStatus::Active => counts.active += 1,
                ExceptionStatus::Expired => counts.expired += 1,
                ExceptionStatus::Revoked => counts.revoked += 1,
            }
        }
        Ok(counts)
    }

    pub fn active_count(&self) -> Result<u64> {
        Ok(self.status_counts()?.active)
    }

    fn expiry_reason(
        ex: &RateLimitException,
        now: DateTime<Utc>,
        force: bool,
    ) -> Option<String> {
        if ex.time_expired(now) {
            Some(format!("Expired at {}", now))
        } else if ex.max_uses_reached() {
            Some(format!(
                "Maximum uses reached ({}/{})",
                ex.times_used,
                ex.max_uses.unwrap_or(0)
            ))
        } else if force && ex.auto_expire {
            Some("Auto-expired by system".to_string())
        } else {
            None
        }
    }

    fn mark_expired(ex: &mut RateLimitException, now: DateTime<Utc>, reason: &str) {
        ex.status = ExceptionStatus::Expired;
        ex.append_note(&format!("Expired: {} at {}", reason, now));
        tracing::info!(
            exception_id = %ex.id,
            subject_id = ex.scope.subject_id().unwrap_or("<global>"),
            reason,
            times_used = ex.times_used,
            "rate limit exception expired"
        );
    }
}
