use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::future::join_all;

// At most `max_parallel` tasks in flight; every item gets one outcome.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    max_parallel: usize,
}

impl WorkerPool {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    pub async fn run<I, T, E, F, Fut>(&self, items: Vec<I>, task: F) -> Vec<Result<T, E>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let total = items.len();
        let queue = Mutex::new(items.into_iter().enumerate().collect::<VecDeque<_>>());
        let outcomes = Mutex::new(Vec::with_capacity(total));

        let workers = (0..self.max_parallel.min(total)).map(|_| async {
            loop {
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some((index, item)) = next else {
                    break;
                };

                let outcome = task(item).await;
                outcomes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, outcome));
            }
        });
        join_all(workers).await;

        let mut outcomes = outcomes.into_inner().unwrap_or_else(PoisonError::into_inner);
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}
