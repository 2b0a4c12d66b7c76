//! Execution primitives: the serial queue all resolver state mutations run
//! on, and the cancellable one-shot timer seam used for fault delays.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Task = Box<dyn FnOnce() + Send>;

/// A serial execution queue with no dedicated thread.
///
/// Whichever thread submits work while the queue is idle drains it; tasks
/// submitted while a drain is in progress are executed by the draining
/// thread. Tasks therefore never run concurrently, and a task submitted
/// from within a running task runs after the current one returns.
///
/// The resolver funnels every state mutation (watcher callbacks, cluster
/// table membership, routing snapshot replacement, result emission)
/// through one `SyncContext`, which is what makes those mutations safe
/// against concurrent per-call reads.
#[derive(Default)]
pub struct SyncContext {
    queue: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `task` and, unless another thread is already draining,
    /// runs queued tasks to completion on the calling thread.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.queue.lock().unwrap().push_back(Box::new(task));
        self.drain();
    }

    fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::Acquire) {
                // Another thread owns the queue and will pick up whatever
                // we just enqueued.
                return;
            }
            loop {
                let task = self.queue.lock().unwrap().pop_front();
                let Some(task) = task else { break };
                task();
            }
            self.draining.store(false, Ordering::Release);
            // A task enqueued after the final pop but before the flag was
            // cleared would otherwise be stranded.
            if self.queue.lock().unwrap().is_empty() {
                return;
            }
        }
    }
}

/// Cancellation handle for a task scheduled through a [`Scheduler`].
pub trait ScheduledHandle: Send + Sync {
    /// Prevents the task from running if it has not started yet.
    fn cancel(&self);
}

/// One-shot timers with cancellation.
///
/// The resolver core never sleeps; the only time-driven behavior is fault
/// delay injection, and it goes through this seam so tests can drive a
/// manual clock.
pub trait Scheduler: Send + Sync {
    /// Runs `task` after `delay` unless the returned handle is cancelled
    /// first.
    fn schedule(&self, delay: Duration, task: Task) -> Arc<dyn ScheduledHandle>;
}

/// [`Scheduler`] backed by a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Arc<dyn ScheduledHandle> {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        Arc::new(TokioScheduledHandle {
            handle: join.abort_handle(),
        })
    }
}

struct TokioScheduledHandle {
    handle: tokio::task::AbortHandle,
}

impl ScheduledHandle for TokioScheduledHandle {
    fn cancel(&self) {
        self.handle.abort();
    }
}
