use std::{future::Future, num::NonZeroUsize};

use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use tracing::debug;

/// Runs a task per item with a cap on how many are in flight at once.
///
/// Failure policy is fail-fast without cancellation: once a task fails no
/// further tasks are started, tasks that already started are driven to
/// completion (their results are discarded) and the first failure is
/// returned. The tasks are polled on the caller's task, so dropping the
/// future returned by [`ConcurrencyLimiter::run`] drops in-flight work too.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimiter {
    limit: NonZeroUsize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit.get()
    }

    /// Results are returned in the order of `items`, regardless of the
    /// order in which the tasks complete.
    pub async fn run<T, R, E, F, Fut>(
        &self,
        items: impl IntoIterator<Item = T>,
        mut task: F,
    ) -> Result<Vec<R>, E>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let mut pending = items.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut completed = Vec::new();
        let mut first_error = None;

        loop {
            while first_error.is_none() && in_flight.len() < self.limit.get() {
                let Some((idx, item)) = pending.next() else {
                    break;
                };
                in_flight.push(task(item).map(move |res| (idx, res)));
            }
            match in_flight.next().await {
                Some((idx, Ok(res))) => completed.push((idx, res)),
                Some((idx, Err(err))) => {
                    if first_error.is_none() {
                        debug!(idx, in_flight = in_flight.len(), "task failed, draining");
                        first_error = Some(err);
                    }
                }
                None => break,
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        completed.sort_unstable_by_key(|(idx, _)| *idx);
        Ok(completed.into_iter().map(|(_, res)| res).collect())
    }
}
