use crate::model::Sample;
use std::collections::VecDeque;

/// Fixed-capacity FIFO of the most recent values.
#[derive(Debug, Clone)]
pub struct Ring {
    values: VecDeque<f64>,
    capacity: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        if self.capacity > 0 {
            self.values.push_back(value);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Oldest to newest.
    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

/// Per-axis sliding windows for one sensor.
#[derive(Debug, Clone)]
pub struct SlidingFftWindow {
    pub x: Ring,
    pub y: Ring,
    pub z: Ring,
}

impl SlidingFftWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            x: Ring::new(capacity),
            y: Ring::new(capacity),
            z: Ring::new(capacity),
        }
    }

    pub fn push(&mut self, sample: &Sample) {
        self.x.push(sample.x);
        self.y.push(sample.y);
        self.z.push(sample.z);
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_full(&self) -> bool {
        self.x.is_full()
    }
}
