//! Background operations with typed outcomes and best-effort cancellation.
//!
//! A network call started through [`Operation::spawn`] runs on a tokio task.
//! The caller either awaits the operation or hands it callbacks that run on a
//! runtime of its choosing. A cancel request that is accepted settles the
//! operation on the spot: the in-flight future is dropped and the outcome is
//! [`Outcome::Cancelled`] even if the response arrives before the task
//! notices. Completion wins only when it settled first, in which case
//! `cancel` reports false.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// How an operation ended
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    Failed(Error),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Completed(value),
            Err(Error::Cancelled) => Outcome::Cancelled,
            Err(err) => Outcome::Failed(err),
        }
    }
}

struct Shared {
    state: AtomicU8,
    cancel: Notify,
}

impl Shared {
    /// Only the first settle takes effect
    fn settle(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

/// Cancels an operation from anywhere, including after it has been moved
/// into [`Operation::deliver_to`].
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Request cancellation. Returns false when the operation had already
    /// settled, in which case nothing changes. After `true` the outcome is
    /// always [`Outcome::Cancelled`].
    pub fn cancel(&self) -> bool {
        if !self.shared.settle(CANCELLED) {
            return false;
        }
        // notify_one stores a permit, so a request made before the task first
        // polls is not lost
        self.shared.cancel.notify_one();
        true
    }

    pub fn is_finished(&self) -> bool {
        !self.shared.is_pending()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Handle to one background call
pub struct Operation<T> {
    shared: Arc<Shared>,
    receiver: oneshot::Receiver<Outcome<T>>,
    /// `None` for operations that settled without ever running
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Operation<T> {
    /// Run `future` on the current runtime.
    ///
    /// Outside a tokio runtime nothing is spawned; the operation is returned
    /// already settled as [`Outcome::Failed`] with [`Error::Internal`].
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => Self::spawn_on(&handle, future),
            Err(e) => {
                warn!("Cannot start operation: {}", e);
                Self::settled(Outcome::Failed(Error::Internal(format!(
                    "no async runtime to run the operation on: {}",
                    e
                ))))
            }
        }
    }

    /// An operation that has already ended with `outcome`
    fn settled(outcome: Outcome<T>) -> Self {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(if outcome.is_cancelled() { CANCELLED } else { COMPLETED }),
            cancel: Notify::new(),
        });
        let (sender, receiver) = oneshot::channel();
        // The receiver is alive, so this cannot fail
        let _ = sender.send(outcome);
        Self {
            shared,
            receiver,
            task: None,
        }
    }

    /// Run `future` on the given runtime
    pub fn spawn_on<F>(handle: &Handle, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(PENDING),
            cancel: Notify::new(),
        });
        let (sender, receiver) = oneshot::channel();

        let task_shared = Arc::clone(&shared);
        let task = handle.spawn(async move {
            let outcome = tokio::select! {
                biased;
                result = future => Outcome::from(result),
                _ = task_shared.cancel.notified() => Outcome::Cancelled,
            };

            let target = if outcome.is_cancelled() { CANCELLED } else { COMPLETED };
            // A cancel accepted while the future was finishing still wins
            let outcome = if task_shared.settle(target) {
                outcome
            } else {
                debug!("Operation cancelled before completion");
                Outcome::Cancelled
            };
            if sender.send(outcome).is_err() {
                debug!("Operation finished with nobody waiting");
            }
        });

        Self {
            shared,
            receiver,
            task: Some(task),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// See [`CancelHandle::cancel`]
    pub fn cancel(&self) -> bool {
        self.cancel_handle().cancel()
    }

    pub fn is_finished(&self) -> bool {
        !self.shared.is_pending()
    }

    /// Wait for the outcome
    pub async fn wait(self) -> Outcome<T> {
        let Self { receiver, task, .. } = self;
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => {
                let reason = match task {
                    Some(task) => match task.await {
                        Err(e) if e.is_panic() => "operation task panicked".to_string(),
                        Err(e) => format!("operation task stopped: {}", e),
                        Ok(()) => "operation ended without an outcome".to_string(),
                    },
                    None => "operation ended without an outcome".to_string(),
                };
                warn!("{}", reason);
                Outcome::Failed(Error::Internal(reason))
            }
        }
    }

    /// Run `on_done` or `on_cancel` on `handle` once the operation ends.
    ///
    /// Exactly one of the two callbacks runs. Failures reach `on_done` as
    /// `Err`.
    pub fn deliver_to<D, C>(self, handle: &Handle, on_done: D, on_cancel: C) -> JoinHandle<()>
    where
        D: FnOnce(Result<T>) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        handle.spawn(async move {
            match self.wait().await {
                Outcome::Cancelled => on_cancel(),
                outcome => on_done(outcome.into_result()),
            }
        })
    }
}

impl<T: Send + 'static> IntoFuture for Operation<T> {
    type Output = Outcome<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Outcome<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("finished", &!self.shared.is_pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_completed_and_failed_outcomes() {
        let done = Operation::spawn(async { Ok(7) });
        assert!(matches!(done.await, Outcome::Completed(7)));

        let failed: Operation<()> = Operation::spawn(async { Err(Error::TokenExpired) });
        assert!(matches!(failed.await.into_result(), Err(Error::TokenExpired)));
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_future() {
        let dropped = Arc::new(AtomicBool::new(false));

        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let flag = Flag(Arc::clone(&dropped));
        let op: Operation<()> = Operation::spawn(async move {
            let _flag = flag;
            std::future::pending::<()>().await;
            Ok(())
        });

        assert!(op.cancel());
        assert!(op.await.is_cancelled());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_ignored() {
        let op = Operation::spawn(async { Ok("value") });
        let handle = op.cancel_handle();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(!handle.cancel());
        assert!(matches!(op.await, Outcome::Completed("value")));
    }

    #[tokio::test]
    async fn test_accepted_cancel_beats_response_arriving_later() {
        let (release, gate) = oneshot::channel::<()>();
        let op = Operation::spawn(async move {
            gate.await.map_err(|_| Error::Internal("gate".into()))?;
            Ok(1)
        });
        tokio::task::yield_now().await;

        assert!(op.cancel());
        // The response lands before the task sees the cancel request
        let _ = release.send(());
        tokio::task::yield_now().await;

        assert!(op.is_finished());
        assert!(op.await.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_and_response_ready_together_is_cancelled() {
        let (release, gate) = oneshot::channel::<()>();
        let op = Operation::spawn(async move {
            gate.await.map_err(|_| Error::Internal("gate".into()))?;
            Ok(1)
        });
        release.send(()).unwrap();
        assert!(op.cancel());
        tokio::task::yield_now().await;

        assert!(op.await.is_cancelled());
    }

    #[test]
    fn test_spawn_outside_runtime_settles_as_failure() {
        let op = Operation::spawn(async { Ok(3u8) });
        assert!(op.is_finished());
        assert!(!op.cancel());

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(matches!(
            runtime.block_on(op.wait()),
            Outcome::Failed(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_to_runs_cancel_callback_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let op: Operation<u32> = Operation::spawn(std::future::pending());
        let cancel = op.cancel_handle();

        let done_tx = tx.clone();
        let delivery = op.deliver_to(
            &Handle::current(),
            move |result| {
                let _ = done_tx.send(format!("done:{}", result.is_ok()));
            },
            move || {
                let _ = tx.send("cancelled".to_string());
            },
        );

        assert!(cancel.cancel());
        delivery.await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("cancelled"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_to_reports_failure_through_done_callback() {
        let (tx, rx) = oneshot::channel();
        let op: Operation<()> = Operation::spawn(async { Err(Error::NotFound("config".into())) });
        op.deliver_to(
            &Handle::current(),
            move |result| {
                let _ = tx.send(result);
            },
            || panic!("not cancelled"),
        )
        .await
        .unwrap();

        assert!(matches!(rx.await.unwrap(), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_internal_error() {
        let op: Operation<()> = Operation::spawn(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(op.await, Outcome::Failed(Error::Internal(_))));
    }

    #[test]
    fn test_spawn_on_foreign_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let op = Operation::spawn_on(runtime.handle(), async { Ok(5u8) });
        let outcome = runtime.block_on(op.wait());
        assert!(matches!(outcome, Outcome::Completed(5)));
    }
}
