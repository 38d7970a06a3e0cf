//! Log throttling utility
//!
//! Limits how often the same warning is recorded, so a stuck sink or a slow
//! encoder cannot flood the log with one line per frame.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Log throttler that limits how often the same message key is logged
pub struct LogThrottler {
    /// Map of message key to last log time
    last_logged: RwLock<HashMap<String, Instant>>,
    /// Throttle interval
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check if a message should be logged (not throttled)
    ///
    /// Returns `true` if the message should be logged and updates the
    /// internal timestamp for the key.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        // Fast path under the read lock
        {
            let map = self.last_logged.read().unwrap();
            if let Some(last) = map.get(key) {
                if now.duration_since(*last) < self.interval {
                    return false;
                }
            }
        }

        let mut map = self.last_logged.write().unwrap();
        // Double-check after acquiring the write lock
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Clear throttle state for a key, so the next occurrence logs
    /// immediately after a recovery.
    pub fn clear(&self, key: &str) {
        self.last_logged.write().unwrap().remove(key);
    }

    /// Clear all throttle state
    pub fn clear_all(&self) {
        self.last_logged.write().unwrap().clear();
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_should_log_first_call() {
        let throttler = LogThrottler::with_secs(1);
        assert!(throttler.should_log("test_key"));
    }

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));

        thread::sleep(Duration::from_millis(150));

        assert!(throttler.should_log("test_key"));
    }

    #[test]
    fn test_different_keys() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));
        assert!(!throttler.should_log("key1"));
        assert!(!throttler.should_log("key2"));
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));

        throttler.clear("test_key");

        assert!(throttler.should_log("test_key"));
    }

    #[test]
    fn test_clear_all() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));

        throttler.clear_all();

        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));
    }
}
