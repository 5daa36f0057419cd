//! Single-assignment result cell with blocking and async waits.
//!
//! A [`CompletionSource`] is the write side, a [`Task`] the read side. The
//! connection actor completes sources from its own worker; callers either
//! `.await` the task or block on [`Task::wait`] from synchronous code.

use crate::error::ClientError;
use parking_lot::{Condvar, Mutex};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct Shared<T> {
    state: Mutex<Option<Result<T, ClientError>>>,
    cond: Condvar,
    notify: Notify,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Stores the outcome unless one is already present.
    fn complete(&self, outcome: Result<T, ClientError>) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
        }
        self.cond.notify_all();
        self.notify.notify_waiters();
        true
    }
}

/// Read side of a single-assignment result.
pub struct Task<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("completed", &self.shared.state.lock().is_some())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Runs a blocking closure eagerly on the blocking pool (or a thread
    /// when called outside a runtime).
    pub fn run<F>(work: F) -> Self
    where
        F: FnOnce() -> Result<T, ClientError> + Send + 'static,
    {
        let source = CompletionSource::new();
        let task = source.task();
        let job = move || {
            source.try_complete(work());
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
        task
    }

    /// Drives a future eagerly on the current runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, ClientError>> + Send + 'static,
    {
        let source = CompletionSource::new();
        let task = source.task();
        tokio::spawn(async move {
            source.try_complete(future.await);
        });
        task
    }

    /// A task that is already complete.
    pub fn from_result(outcome: Result<T, ClientError>) -> Self {
        let shared = Arc::new(Shared::new());
        shared.complete(outcome);
        Self { shared }
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().is_some()
    }

    /// Blocks the current thread until the task completes.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.is_none() {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Blocks up to `timeout`; returns whether the task completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if state.is_none() {
            let _ = self
                .shared
                .cond
                .wait_while_for(&mut state, |s| s.is_none(), timeout);
        }
        state.is_some()
    }

    /// Blocks until completion and returns the outcome.
    pub fn result(&self) -> Result<T, ClientError> {
        self.wait();
        self.peek().unwrap_or(Err(ClientError::NoResult))
    }

    /// Blocks until completion and returns the error, if any.
    pub fn error(&self) -> Option<ClientError> {
        self.result().err()
    }

    /// The outcome if already available.
    pub fn peek(&self) -> Option<Result<T, ClientError>> {
        self.shared.state.lock().clone()
    }

    /// Waits asynchronously for completion.
    pub async fn completed(&self) -> Result<T, ClientError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not lost.
            notified.as_mut().enable();
            if let Some(outcome) = self.peek() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Returns a task that runs `next` with this task once it has completed.
    pub fn continue_with<U, F>(&self, next: F) -> Task<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Task<T>) -> Result<U, ClientError> + Send + 'static,
    {
        let antecedent = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(_) => Task::spawn(async move {
                let _ = antecedent.completed().await;
                next(antecedent)
            }),
            Err(_) => Task::run(move || {
                antecedent.wait();
                next(antecedent)
            }),
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Task<T> {
    type Output = Result<T, ClientError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.completed().await })
    }
}

/// Write side of a [`Task`].
///
/// Dropping a source that was never completed fails its task with
/// [`ClientError::NoResult`], so waiters never hang.
pub struct CompletionSource<T> {
    shared: Arc<Shared<T>>,
}

impl<T> CompletionSource<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn task(&self) -> Task<T> {
        Task {
            shared: self.shared.clone(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().is_some()
    }

    pub fn set_result(&self, value: T) -> Result<(), ClientError> {
        self.set(Ok(value))
    }

    pub fn set_error(&self, error: ClientError) -> Result<(), ClientError> {
        self.set(Err(error))
    }

    pub fn try_set_result(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    pub fn try_set_error(&self, error: ClientError) -> bool {
        self.try_complete(Err(error))
    }

    pub(crate) fn try_complete(&self, outcome: Result<T, ClientError>) -> bool {
        self.shared.complete(outcome)
    }

    fn set(&self, outcome: Result<T, ClientError>) -> Result<(), ClientError> {
        if self.shared.complete(outcome) {
            Ok(())
        } else {
            Err(ClientError::AlreadyCompleted)
        }
    }
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for CompletionSource<T> {
    fn drop(&mut self) {
        self.shared.complete(Err(ClientError::NoResult));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn test_set_result_once() {
        let source = CompletionSource::new();
        let task = source.task();
        assert!(!task.is_completed());

        source.set_result(5).unwrap();
        assert!(task.is_completed());
        assert_eq!(task.result().unwrap(), 5);

        assert!(matches!(
            source.set_result(6),
            Err(ClientError::AlreadyCompleted)
        ));
        assert!(matches!(
            source.set_error(ClientError::Timeout),
            Err(ClientError::AlreadyCompleted)
        ));
        assert_eq!(task.result().unwrap(), 5);
    }

    #[test]
    fn test_try_set_tolerates_double_set() {
        let source = CompletionSource::<u32>::new();
        assert!(source.try_set_error(ClientError::Timeout));
        assert!(!source.try_set_result(1));
        assert!(!source.try_set_error(ClientError::NotActive));
        assert!(matches!(source.task().error(), Some(ClientError::Timeout)));
    }

    #[test]
    fn test_dropped_source_fails_task() {
        let task = {
            let source = CompletionSource::<u32>::new();
            source.task()
        };
        assert!(matches!(task.result(), Err(ClientError::NoResult)));
    }

    #[test]
    fn test_wait_timeout() {
        let source = CompletionSource::<u32>::new();
        let task = source.task();
        assert!(!task.wait_timeout(Duration::from_millis(20)));
        source.set_result(1).unwrap();
        assert!(task.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_run_outside_runtime() {
        let task = Task::run(|| Ok::<_, ClientError>(21 * 2));
        assert_eq!(task.result().unwrap(), 42);
    }

    #[test]
    fn test_continue_with_outside_runtime() {
        let first = Task::run(|| Ok::<_, ClientError>(2));
        let second = first.continue_with(|done| Ok(done.result()? * 10));
        assert_eq!(second.result().unwrap(), 20);
    }

    #[test]
    fn test_completed_future_wakes_on_set() {
        let source = CompletionSource::new();
        let task = source.task();
        let mut fut = tokio_test::task::spawn(async move { task.completed().await });

        assert_pending!(fut.poll());
        source.set_result("done").unwrap();
        assert!(fut.is_woken());
        let outcome = assert_ready!(fut.poll());
        assert_eq!(outcome.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_await_task() {
        let source = CompletionSource::new();
        let task = source.task();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            source.set_result(7u64).unwrap();
        });
        assert_eq!(task.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_continue_with_chains_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let first = Task::spawn(async { Ok::<_, ClientError>(1) });
        let second = first.continue_with(move |done| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(done.result()? + 1)
        });
        let third = second.continue_with(|done| Ok(done.result()? * 3));

        assert_eq!(third.await.unwrap(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_continue_with_sees_antecedent_error() {
        let first = Task::<u32>::from_result(Err(ClientError::StreamDeleted("s".into())));
        let second = first.continue_with(|done| match done.error() {
            Some(ClientError::StreamDeleted(_)) => Ok("handled"),
            _ => Err(ClientError::NoResult),
        });
        assert_eq!(second.await.unwrap(), "handled");
    }
}
