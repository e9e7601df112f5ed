//! Fixed-capacity history buffer
//!
//! This module provides the ring buffer backing all time-ordered history:
//! - Oldest-entry eviction once capacity is reached
//! - Logical indexing from oldest (0) to newest (len - 1)
//! - Read-only queries via standard iterator adapters

use std::collections::VecDeque;

use crate::error::ConfigurationError;

/// Minimum samples required before window statistics are meaningful
const MIN_SAMPLES_FOR_STATS: usize = 2;

/// Bounded FIFO history over any element type
///
/// Pushing into a full buffer silently evicts the oldest entry. Indices are
/// logical: `get(0)` is always the oldest retained entry regardless of how
/// many evictions have happened.
#[derive(Debug, Clone)]
pub struct HistoryBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> HistoryBuffer<T> {
    /// Create a buffer holding at most `capacity` entries
    pub fn new(capacity: usize) -> Result<Self, ConfigurationError> {
        if capacity == 0 {
            return Err(ConfigurationError::InvalidHistoryCapacity(capacity));
        }
        Ok(Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append an entry, evicting the oldest if the buffer is full
    pub fn push(&mut self, entry: T) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entry at logical index, oldest first
    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)
    }

    /// Most recently pushed entry
    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Oldest retained entry
    pub fn oldest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all entries, keeping the configured capacity
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate entries oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    /// Up to `limit` newest entries, oldest of those first
    pub fn last_n(&self, limit: usize) -> impl Iterator<Item = &T> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip)
    }
}

impl<T: Clone> HistoryBuffer<T> {
    /// Snapshot the contents oldest to newest
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

impl<'a, T> IntoIterator for &'a HistoryBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Summary statistics over a window of values
#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl WindowStats {
    /// Compute statistics over the given values
    ///
    /// Uses the two-pass formulation with Bessel's correction for the
    /// sample standard deviation.
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let values: Vec<f64> = values.into_iter().collect();
        let count = values.len();
        if count == 0 {
            return Self::default();
        }

        let sum: f64 = values.iter().sum();
        let mean = sum / count as f64;

        let std_dev = if count >= MIN_SAMPLES_FOR_STATS {
            let variance: f64 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        let min = values
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let max = values
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        Self {
            mean,
            std_dev,
            min,
            max,
            count,
        }
    }

    pub fn has_sufficient_data(&self) -> bool {
        self.count >= MIN_SAMPLES_FOR_STATS
    }
}
