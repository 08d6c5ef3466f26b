use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::lock;

/// Single-slot cache of an instance's diagnostic log.
///
/// The log is read from disk once; later reads return the cached text, so it
/// stays available after the instance directory is gone.
pub struct LogCache {
    path: PathBuf,
    slot: Mutex<Option<String>>,
}

impl LogCache {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            slot: Mutex::new(None),
        }
    }

    pub fn read(&self) -> Option<String> {
        let mut slot = lock(&self.slot);
        if slot.is_none() {
            *slot = std::fs::read(&self.path)
                .ok()
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string());
        }
        slot.clone().filter(|log| !log.is_empty())
    }

    pub fn invalidate(&self) {
        *lock(&self.slot) = None;
    }
}

/// Lets an expensive check run at most once per interval.
pub struct LivenessThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LivenessThrottle {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Returns true, and restarts the interval, when the check is due.
    pub fn is_due(&self) -> bool {
        let mut last = lock(&self.last);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
