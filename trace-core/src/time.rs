use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic nanosecond counter. Readings have no wall-clock meaning and are
/// only useful as differences.
pub trait Ticker: Send + Sync {
    fn read(&self) -> u64;
}

/// Millisecond wall clock, used only for trace start dates and id derivation.
pub trait Clock: Send + Sync {
    fn current_time_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemTicker;

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_time_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven ticker for deterministic tests.
#[derive(Debug, Default)]
pub struct TestTicker {
    tick: AtomicU64,
}

impl TestTicker {
    pub fn new(tick: u64) -> Self {
        TestTicker {
            tick: AtomicU64::new(tick),
        }
    }

    pub fn set(&self, tick: u64) {
        self.tick.store(tick, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: u64) {
        self.tick.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Ticker for TestTicker {
    fn read(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }
}

/// Manually driven wall clock for deterministic tests.
#[derive(Debug, Default)]
pub struct TestClock {
    millis: AtomicU64,
}

impl TestClock {
    pub fn new(millis: u64) -> Self {
        TestClock {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn current_time_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
