//! Timed task scheduling used by health checks and resubscribes.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Schedules a task to run once after `delay`.
pub trait Executor: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// Runs scheduled tasks on the ambient tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        TaskHandle::new(handle.abort_handle())
    }
}

/// Process-wide executor used when a factory is not given one.
pub fn shared_executor() -> Arc<dyn Executor> {
    static SHARED: OnceLock<Arc<dyn Executor>> = OnceLock::new();
    SHARED.get_or_init(|| Arc::new(TokioExecutor)).clone()
}

/// Cancellation handle for a scheduled task. Cancelling more than once, or
/// after the task already ran, is a no-op.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    cancelled: AtomicBool,
    abort: Option<AbortHandle>,
}

impl TaskHandle {
    pub fn new(abort: AbortHandle) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cancelled: AtomicBool::new(false),
                abort: Some(abort),
            }),
        }
    }

    /// A handle that only records cancellation, for executors that poll
    /// [`TaskHandle::is_cancelled`] themselves.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cancelled: AtomicBool::new(false),
                abort: None,
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(abort) = &self.inner.abort {
                abort.abort();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
