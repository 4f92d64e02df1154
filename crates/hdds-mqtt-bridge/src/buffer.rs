// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batching buffer for Line Protocol lines.
//!
//! A batch is released when it reaches `max_size` lines or when its oldest
//! line has waited longer than `max_age`.

use std::time::{Duration, Instant};

/// Accumulates Line Protocol lines for a single write request.
#[derive(Debug)]
pub struct BatchBuffer {
    lines: Vec<String>,
    max_size: usize,
    max_age: Duration,
    /// Arrival time of the first line of the current batch.
    oldest: Option<Instant>,
}

impl BatchBuffer {
    /// Create a buffer releasing batches of `max_size` lines (at least 1).
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: Vec::with_capacity(max_size),
            max_size,
            max_age,
            oldest: None,
        }
    }

    /// Append a line. Returns the batch if it is now ready to be written.
    pub fn push(&mut self, line: String) -> Option<Vec<String>> {
        if self.lines.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.lines.push(line);

        if self.lines.len() >= self.max_size || self.is_due() {
            Some(self.take())
        } else {
            None
        }
    }

    /// True if the buffer holds lines older than `max_age`.
    pub fn is_due(&self) -> bool {
        self.oldest
            .map(|t| t.elapsed() >= self.max_age)
            .unwrap_or(false)
    }

    /// Take every buffered line.
    pub fn take(&mut self) -> Vec<String> {
        self.oldest = None;
        std::mem::replace(&mut self.lines, Vec::with_capacity(self.max_size))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
