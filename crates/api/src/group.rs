//! Bounded fan-out for per-item work.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Runs at most `limit` futures at once and joins them all.
///
/// [`spawn`](Self::spawn) waits for a free slot before starting the task, so
/// a producer walking a large listing never gets far ahead of the workers.
pub struct LimitGroup<E> {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<(), E>>,
}

impl<E: Send + 'static> LimitGroup<E> {
    /// `limit` of 0 means 1.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            tasks: JoinSet::new(),
        }
    }

    pub async fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        // The semaphore is never closed.
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
    }

    /// Tasks spawned and not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Joins every task and returns the first error seen.
    ///
    /// A panicking task re-raises its panic here.
    pub async fn wait(self) -> Result<(), E> {
        match self.wait_all().await.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Joins every task and returns all errors in completion order.
    pub async fn wait_all(mut self) -> Vec<E> {
        let mut errors = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
                Err(_) => {}
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_runs_more_than_the_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group: LimitGroup<String> = LimitGroup::new(4);

        for _ in 0..50 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            group
                .spawn(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
        }
        group.wait().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_returns_an_error_after_joining_everything() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut group = LimitGroup::new(2);
        for i in 0..10 {
            let done = Arc::clone(&done);
            group
                .spawn(async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    if i == 3 { Err(format!("item {i}")) } else { Ok(()) }
                })
                .await;
        }
        assert_eq!(group.wait().await.unwrap_err(), "item 3");
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn wait_all_collects_every_error() {
        let mut group = LimitGroup::new(0);
        for i in 0..6u32 {
            group
                .spawn(async move { if i % 2 == 0 { Err(i) } else { Ok(()) } })
                .await;
        }
        let mut errors = group.wait_all().await;
        errors.sort_unstable();
        assert_eq!(errors, vec![0, 2, 4]);
    }

    #[tokio::test]
    #[should_panic(expected = "worker blew up")]
    async fn panics_propagate() {
        let mut group: LimitGroup<()> = LimitGroup::new(1);
        group
            .spawn(async {
                if true {
                    panic!("worker blew up");
                }
                Ok(())
            })
            .await;
        let _ = group.wait().await;
    }
}
