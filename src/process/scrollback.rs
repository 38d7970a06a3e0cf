//! Bounded stderr scrollback
//!
//! Each child keeps its most recent stderr lines in a fixed-capacity ring
//! for `process_info()` and failure diagnostics. Appends are O(1); a
//! snapshot copies under the lock and releases it before use.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Default number of lines retained per child
pub const DEFAULT_CAPACITY: usize = 50;

/// Fixed-capacity ring of the most recent diagnostic lines
pub struct Scrollback {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append one line, evicting the oldest when full.
    pub fn append(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Copy of the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_snapshot() {
        let ring = Scrollback::new(10);
        ring.append("one".to_string());
        ring.append("two".to_string());

        assert_eq!(ring.snapshot(), vec!["one", "two"]);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let ring = Scrollback::new(3);
        for i in 1..=5 {
            ring.append(format!("line {}", i));
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec!["line 3", "line 4", "line 5"]);
    }

    #[test]
    fn test_preserves_order() {
        let ring = Scrollback::new(100);
        for i in 0..50 {
            ring.append(format!("{}", i));
        }
        let snapshot = ring.snapshot();
        for (i, line) in snapshot.iter().enumerate() {
            assert_eq!(line, &format!("{}", i));
        }
    }

    #[test]
    fn test_clear() {
        let ring = Scrollback::new(5);
        ring.append("x".to_string());
        ring.clear();
        assert!(ring.is_empty());
    }
}
