use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 100;

/// Bounded FIFO of recent engine log lines. The oldest line is evicted first.
pub struct LogRingBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogRingBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Copy of the current contents, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_at_capacity() {
        let buf = LogRingBuffer::default();
        for i in 0..150 {
            buf.push(format!("line {}", i));
        }

        let lines = buf.snapshot();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines.first().map(String::as_str), Some("line 50"));
        assert_eq!(lines.last().map(String::as_str), Some("line 149"));
    }

    #[test]
    fn snapshot_is_detached_copy() {
        let buf = LogRingBuffer::new(2);
        buf.push("a");
        let snap = buf.snapshot();
        buf.push("b");
        buf.push("c");

        assert_eq!(snap, vec!["a"]);
        assert_eq!(buf.snapshot(), vec!["b", "c"]);
    }
}
