use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as MemOrdering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Length of the measurement window.
pub const RATE_WINDOW: Duration = Duration::from_secs(20);

static NEXT_RATE_ID: AtomicU64 = AtomicU64::new(0);

/// A windowed throughput meter.
///
/// Counts bytes transferred in the current window and reports them as a
/// bytes-per-second figure. The swarm-level choking algorithm ranks peers by
/// these meters, so comparisons break ties by each meter's creation
/// identity, giving the strict weak order sorting requires.
#[derive(Debug)]
pub struct Rate {
    id: u64,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    bytes: u64,
    since: Instant,
}

impl Rate {
    pub fn new() -> Self {
        Self {
            id: NEXT_RATE_ID.fetch_add(1, MemOrdering::Relaxed),
            window: Mutex::new(Window {
                bytes: 0,
                since: Instant::now(),
            }),
        }
    }

    /// Records `n` transferred bytes.
    ///
    /// Opens a fresh window first if the current one has expired.
    pub fn add(&self, n: u64) {
        let mut window = self.window.lock();
        if window.since.elapsed() >= RATE_WINDOW {
            window.bytes = 0;
            window.since = Instant::now();
        }
        window.bytes += n;
    }

    /// Returns the throughput over the current window in bytes per second.
    ///
    /// Windows younger than a second are measured as if a full second had
    /// passed, which keeps a single early burst from reading as an absurd
    /// rate.
    pub fn rate(&self) -> f64 {
        let window = self.window.lock();
        let secs = window.since.elapsed().as_secs_f64().max(1.0);
        window.bytes as f64 / secs
    }

    /// Zeroes the meter and restarts its window.
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.bytes = 0;
        window.since = Instant::now();
    }

    /// Orders two meters by rate, ascending, breaking ties by identity.
    pub fn compare(a: &Rate, b: &Rate) -> Ordering {
        a.rate()
            .partial_cmp(&b.rate())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    }
}

impl Default for Rate {
    fn default() -> Self {
        Self::new()
    }
}
