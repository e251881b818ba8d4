use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Time source injected everywhere "now" is consulted, so window boundaries
/// and expiry can be pinned in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as unix seconds.
    fn now_ts(&self) -> i64 {
        self.now().timestamp()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock used by the service binary.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests. Stores unix seconds and only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_secs: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_secs: Arc::new(AtomicI64::new(start.timestamp())),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now_secs.store(now.timestamp(), Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now_secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.now_secs.load(Ordering::SeqCst);
        DateTime::from_timestamp(secs, 0).expect("manual clock timestamp in range")
    }
}
