use std::collections::VecDeque;

/// Samples kept for the phase trend plot.
pub const PHASE_HISTORY_LEN: usize = 99;

/// Fixed-length rolling buffer of peak phases, oldest first.
///
/// Starts filled with zeros so the plotted trace always has the same width.
#[derive(Clone, Debug)]
pub struct PhaseHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl PhaseHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: std::iter::repeat(0.0).take(capacity).collect(),
            capacity,
        }
    }

    /// Appends the newest value, dropping the oldest.
    pub fn push(&mut self, value: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }

    pub fn snapshot(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

impl Default for PhaseHistory {
    fn default() -> Self {
        Self::new(PHASE_HISTORY_LEN)
    }
}
