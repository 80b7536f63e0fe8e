//! Work and memory accounting for the cooperative scheduler

/// The operation and memory counters threaded through every unit of tree work
///
/// Operations bound how long a single work slice runs; allocated bytes bound
/// the total size of all layer buffers. Both belong to one `DecisionTree`, so
/// several engines can live in the same process without sharing counters.
#[derive(Debug, Clone)]
pub struct WorkBudget {
    operations_left: usize,
    max_operations: usize,
    allocated_bytes: usize,
    max_bytes: usize,
}

impl WorkBudget {
    pub fn new(max_operations: usize, max_bytes: usize) -> Self {
        Self {
            operations_left: max_operations,
            max_operations,
            allocated_bytes: 0,
            max_bytes,
        }
    }

    /// Starts a new work slice
    pub fn refill(&mut self) {
        self.operations_left = self.max_operations;
    }

    /// Spends one operation, returning whether the slice is now exhausted
    pub fn tick(&mut self) -> bool {
        self.operations_left = self.operations_left.saturating_sub(1);
        self.operations_left == 0
    }

    pub fn operations_exhausted(&self) -> bool {
        self.operations_left == 0
    }

    pub fn allocate(&mut self, bytes: usize) {
        self.allocated_bytes += bytes;
    }

    /// Replaces the running total, used after a trim recounts the surviving buffers
    pub fn set_allocated(&mut self, bytes: usize) {
        self.allocated_bytes = bytes;
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn memory_exhausted(&self) -> bool {
        self.allocated_bytes >= self.max_bytes
    }
}
