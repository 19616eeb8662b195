//! Batch partitioning and bounded-parallel execution

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Split `items` into ordered batches of at most `batch_size` elements.
///
/// A zero batch size is treated as one.
pub fn partition<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        batches.push(items.by_ref().take(batch_size).collect());
    }

    batches
}

/// Runs batches of work with at most `workers` batches in flight
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    workers: usize,
    parallel: bool,
}

impl BatchScheduler {
    pub fn new(workers: usize, parallel: bool) -> Self {
        Self {
            workers: workers.max(1),
            parallel,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// How many batches may run at the same time
    pub fn in_flight(&self) -> usize {
        if self.parallel {
            self.workers
        } else {
            1
        }
    }

    /// Number of batches `items` elements are split into
    pub fn batch_count(&self, items: usize) -> usize {
        match (items, self.parallel) {
            (0, _) => 0,
            (n, true) => n.div_ceil(self.workers),
            (_, false) => 1,
        }
    }

    /// Batches `items` would be split into
    pub fn plan<T>(&self, items: Vec<T>) -> Vec<Vec<T>> {
        if self.parallel {
            partition(items, self.workers)
        } else if items.is_empty() {
            Vec::new()
        } else {
            vec![items]
        }
    }

    /// Run `job` once per batch and wait for every batch to finish.
    ///
    /// Results come back in completion order. In sequential mode all items form
    /// one batch that runs on the caller.
    pub async fn run<T, F, Fut, R>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        stream::iter(self.plan(items))
            .map(job)
            .buffer_unordered(self.in_flight())
            .collect()
            .await
    }
}
