/// Batching statistics collected by one [`LoaderWorker`](crate::loader_worker::LoaderWorker).
///
/// Logged at info level when the owning `Loader` is dropped.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerStats {
    /// Number of `LoaderOp::Load` that were received by the worker.
    pub load_requests: u64,
    /// Number of batches handed to the batch function.
    pub batches: u64,
    /// Batches whose grouped lookup returned an error.
    pub failed_batches: u64,
    /// Batches dispatched because they reached capacity rather than their deadline.
    pub full_batches: u64,
    /// The average number of calls (not-unique) folded into a dispatched batch.
    pub average_batch_size: f32,
    /// The max number of calls (not-unique) folded into a single batch.
    pub max_batch_size: u64,
    /// The max number of unique parents fetched during a single batch.
    pub max_batch_unique: u64,
    /// The total number of unique parents requested from the backend.
    pub parents_requested: u64,
}

impl WorkerStats {
    pub fn record_load_request(&mut self) {
        self.load_requests += 1;
    }

    pub fn record_dispatch(&mut self, batch_size: u64, unique: u64, full: bool) {
        let new_total = self.batches + 1;
        self.average_batch_size = (((self.average_batch_size as f64 * self.batches as f64)
            + batch_size as f64)
            / new_total as f64) as f32;
        self.batches = new_total;
        self.max_batch_size = self.max_batch_size.max(batch_size);
        self.max_batch_unique = self.max_batch_unique.max(unique);
        self.parents_requested += unique;
        if full {
            self.full_batches += 1;
        }
    }

    pub fn record_failure(&mut self) {
        self.failed_batches += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_average_and_maxima() {
        let mut stats = WorkerStats::default();
        stats.record_dispatch(2, 2, false);
        stats.record_dispatch(4, 3, true);
        stats.record_failure();

        assert_eq!(stats.batches, 2);
        assert_eq!(stats.full_batches, 1);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.max_batch_size, 4);
        assert_eq!(stats.max_batch_unique, 3);
        assert_eq!(stats.parents_requested, 5);
        assert!((stats.average_batch_size - 3.0).abs() < f32::EPSILON);
    }
}
