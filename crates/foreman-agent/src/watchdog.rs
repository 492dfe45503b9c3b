//! Per-agent liveness watchdog, fed on every output line.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Watchdog {
    last_feed: Mutex<Instant>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            last_feed: Mutex::new(Instant::now()),
        }
    }

    pub fn feed(&self) {
        *self.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed()
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.elapsed() >= threshold
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_feed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_resets_staleness() {
        let watchdog = Watchdog::new();
        assert!(!watchdog.is_stale(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(watchdog.is_stale(Duration::from_millis(5)));
        watchdog.feed();
        assert!(!watchdog.is_stale(Duration::from_millis(5)));
    }
}
