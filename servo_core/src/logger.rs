//! Sample log sinks.
//!
//! Each control tick can append one fixed-width row of integers to a
//! [`LogSink`]. The sinks here never allocate after construction and never
//! fail; a full ring simply overwrites its oldest rows.

use std::sync::{Arc, Mutex};

use servo_traits::{LogRow, LogSink};

/// Sink that drops every row. The default for servos nobody is inspecting.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl LogSink for NullLog {
    fn append(&mut self, _row: &LogRow) {}
}

/// Fixed-capacity ring buffer of sample rows, oldest rows overwritten
/// first.
#[derive(Debug)]
pub struct RingLog {
    rows: Vec<LogRow>,
    capacity: usize,
    /// Index of the next slot to write.
    head: usize,
    /// Total rows ever appended; saturates at `usize::MAX`.
    appended: usize,
}

impl RingLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rows: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            appended: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in chronological order, oldest first.
    pub fn rows(&self) -> Vec<LogRow> {
        if self.rows.len() < self.capacity {
            self.rows.clone()
        } else {
            let mut out = Vec::with_capacity(self.capacity);
            out.extend_from_slice(&self.rows[self.head..]);
            out.extend_from_slice(&self.rows[..self.head]);
            out
        }
    }

    pub fn last(&self) -> Option<LogRow> {
        if self.rows.is_empty() {
            return None;
        }
        let idx = if self.head == 0 {
            self.rows.len() - 1
        } else {
            self.head - 1
        };
        Some(self.rows[idx])
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.head = 0;
        self.appended = 0;
    }
}

impl LogSink for RingLog {
    fn append(&mut self, row: &LogRow) {
        if self.rows.len() < self.capacity {
            self.rows.push(*row);
            self.head = self.rows.len() % self.capacity;
        } else {
            self.rows[self.head] = *row;
            self.head = (self.head + 1) % self.capacity;
        }
        self.appended = self.appended.saturating_add(1);
    }
}

/// Cloneable handle to a shared [`RingLog`], for inspecting samples from a
/// test or a reporting thread while the control loop keeps appending.
#[derive(Debug, Clone)]
pub struct SharedLog {
    inner: Arc<Mutex<RingLog>>,
}

impl SharedLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingLog::new(capacity))),
        }
    }

    pub fn rows(&self) -> Vec<LogRow> {
        match self.inner.lock() {
            Ok(log) => log.rows(),
            Err(poisoned) => poisoned.into_inner().rows(),
        }
    }

    pub fn last(&self) -> Option<LogRow> {
        match self.inner.lock() {
            Ok(log) => log.last(),
            Err(poisoned) => poisoned.into_inner().last(),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(log) => log.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for SharedLog {
    fn append(&mut self, row: &LogRow) {
        match self.inner.lock() {
            Ok(mut log) => log.append(row),
            Err(poisoned) => poisoned.into_inner().append(row),
        }
    }
}
