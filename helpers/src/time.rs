use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A trait for a clock that can provide the current time
/// as a UNIX timestamp.
pub trait Clock: Send + Sync {
    /// The current time in whole seconds.
    fn now(&self) -> u64;
    /// The current time in milliseconds, used for lease TTL
    /// arithmetic where second precision is too coarse.
    fn now_millis(&self) -> u64;
}

/// A default implementation of a clock that uses the system time.
pub struct DefaultClock {}

impl DefaultClock {
    /// Creates a new instance of the default clock
    /// that uses system time.
    pub fn new() -> Self {
        DefaultClock {}
    }
}

impl Default for DefaultClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for DefaultClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_secs()
    }

    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }
}

/// A clock that only moves when told to, used in tests and sandbox
/// environments to exercise TTL expiry and scheduling deterministically.
#[derive(Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        ManualClock {
            millis: AtomicU64::new(start_millis),
        }
    }

    /// Advances the clock by the provided number of milliseconds.
    pub fn advance_millis(&self, by: u64) {
        self.millis.fetch_add(by, Ordering::SeqCst);
    }

    /// Advances the clock by the provided number of seconds.
    pub fn advance_secs(&self, by: u64) {
        self.advance_millis(by * 1000);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::SeqCst) / 1000
    }

    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
