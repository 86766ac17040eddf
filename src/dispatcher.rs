//! Bounded task dispatcher.
//!
//! Runs tasks pulled from lazy sources on a worker pool, never more than
//! `max_parallelism` at a time. All bookkeeping (`running`, the source queue,
//! the interrupted flag, pending failures) lives in one mutex-guarded ledger
//! and is only changed through compound operations: submit-and-fill,
//! complete-and-fill, interrupt. A `Notify` wakes the coordinator after each
//! change; waiters register before inspecting the ledger, so no wakeup is lost.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::{Handle, Runtime};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::types::DispatcherState;

/// One unit of work. Runs on a blocking worker thread.
pub type Task = Box<dyn FnOnce() -> Result<(), PipelineError> + Send + 'static>;

/// A lazy sequence of tasks. Producing a task may itself fail.
pub type TaskSource = Box<dyn Iterator<Item = Result<Task, PipelineError>> + Send + 'static>;

// --- WorkerPool ---

/// The threads tasks run on: the blocking pool of a tokio runtime.
///
/// Either shares the caller's runtime or owns a dedicated one, which is shut
/// down in the background when the pool is dropped.
pub struct WorkerPool {
    handle: Handle,
    owned: Option<Runtime>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("owned", &self.owned.is_some())
            .finish()
    }
}

impl WorkerPool {
    pub fn shared(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> Self {
        Self::shared(Handle::current())
    }

    /// Start a dedicated runtime with at most `threads` blocking workers.
    pub fn dedicated(threads: usize) -> Result<Self, PipelineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("lane-worker")
            .enable_all()
            .build()
            .map_err(PipelineError::WorkerPool)?;
        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_dedicated(&self) -> bool {
        self.owned.is_some()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}

// --- Ledger ---

#[derive(Default)]
struct Ledger {
    running: usize,
    sources: VecDeque<TaskSource>,
    interrupted: bool,
    failures: VecDeque<PipelineError>,
    started: u64,
    finished: u64,
}

impl Ledger {
    /// No task is running and none will be started.
    fn is_settled(&self) -> bool {
        self.running == 0 && (self.sources.is_empty() || self.interrupted)
    }
}

struct Shared {
    max_parallelism: usize,
    runtime: Handle,
    ledger: Mutex<Ledger>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tasks until `running == max_parallelism`, the sources run dry, or
    /// the dispatcher is interrupted. Called with the ledger locked.
    fn fill(self: &Arc<Self>, ledger: &mut Ledger) {
        while ledger.running < self.max_parallelism && !ledger.interrupted {
            let Some(source) = ledger.sources.front_mut() else {
                break;
            };
            let produced = match panic::catch_unwind(AssertUnwindSafe(|| source.next())) {
                Ok(produced) => produced,
                Err(payload) => {
                    // A source that panicked may have skipped items; it is not polled again.
                    let message = panic_message(&payload);
                    warn!("Task source panicked and was dropped: {}", message);
                    ledger.sources.pop_front();
                    ledger.failures.push_back(PipelineError::TaskSourceProduction(Box::new(
                        PipelineError::TaskPanicked(message),
                    )));
                    continue;
                }
            };
            match produced {
                Some(Ok(task)) => {
                    ledger.running += 1;
                    ledger.started += 1;
                    self.spawn(task);
                }
                Some(Err(e)) => {
                    warn!("Task source failed to produce a task: {}", e);
                    ledger
                        .failures
                        .push_back(PipelineError::TaskSourceProduction(Box::new(e)));
                }
                None => {
                    ledger.sources.pop_front();
                }
            }
        }
    }

    fn spawn(self: &Arc<Self>, task: Task) {
        let shared = Arc::clone(self);
        self.runtime.spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                .unwrap_or_else(|payload| Err(PipelineError::TaskPanicked(panic_message(&payload))));
            shared.complete(outcome);
        });
    }

    fn complete(self: &Arc<Self>, outcome: Result<(), PipelineError>) {
        let _wake = WakeOnDrop(&self.changed);
        let mut ledger = self.lock();
        ledger.running -= 1;
        ledger.finished += 1;
        if let Err(e) = outcome {
            ledger.failures.push_back(e);
        }
        self.fill(&mut ledger);
    }
}

/// Wakes every waiter when dropped, including during unwinding.
/// Declared before the ledger guard so the lock is released first.
struct WakeOnDrop<'a>(&'a Notify);

impl Drop for WakeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.notify_waiters();
    }
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// --- TaskDispatcher ---

/// Runs tasks from submitted sources with at most `max_parallelism` in flight.
///
/// Cloning yields another handle on the same dispatcher.
#[derive(Clone)]
pub struct TaskDispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ledger = self.shared.lock();
        f.debug_struct("TaskDispatcher")
            .field("max_parallelism", &self.shared.max_parallelism)
            .field("running", &ledger.running)
            .field("sources", &ledger.sources.len())
            .field("interrupted", &ledger.interrupted)
            .finish()
    }
}

impl TaskDispatcher {
    pub fn new(max_parallelism: usize, pool: &WorkerPool) -> Self {
        Self::with_handle(max_parallelism, pool.handle().clone())
    }

    pub fn with_handle(max_parallelism: usize, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_parallelism: max_parallelism.max(1),
                runtime,
                ledger: Mutex::new(Ledger::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn max_parallelism(&self) -> usize {
        self.shared.max_parallelism
    }

    /// Register a lazy source and start as many of its tasks as the limit allows.
    ///
    /// Sources are drained in submission order. A source submitted after
    /// `interrupt()` is dropped without producing anything.
    ///
    /// Producing the first tasks runs on the calling thread; a source that
    /// blocks while producing should be submitted from a blocking context.
    pub fn submit(&self, source: TaskSource) {
        let _wake = WakeOnDrop(&self.shared.changed);
        let mut ledger = self.shared.lock();
        if ledger.interrupted {
            warn!("Ignoring task source submitted to an interrupted dispatcher");
            return;
        }
        ledger.sources.push_back(source);
        self.shared.fill(&mut ledger);
    }

    /// Stop starting new tasks. Tasks already running finish on their own.
    pub fn interrupt(&self) {
        let dropped = {
            let mut ledger = self.shared.lock();
            ledger.interrupted = true;
            std::mem::take(&mut ledger.sources)
        };
        debug!(dropped_sources = dropped.len(), "Dispatcher interrupted");
        drop(dropped);
        self.shared.changed.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.lock().interrupted
    }

    /// Wait until all known work has finished, or until a task failure is
    /// pending, which is returned (oldest first). Other tasks keep running.
    pub async fn await_completed(&self) -> Result<(), PipelineError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut ledger = self.shared.lock();
                if let Some(failure) = ledger.failures.pop_front() {
                    return Err(failure);
                }
                if ledger.is_settled() {
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// True when nothing is pending, running, or waiting to be reported.
    pub fn has_completed(&self) -> bool {
        let ledger = self.shared.lock();
        ledger.failures.is_empty() && ledger.is_settled()
    }

    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    /// Number of tasks started so far.
    pub fn started(&self) -> u64 {
        self.shared.lock().started
    }

    pub fn state(&self) -> DispatcherState {
        let ledger = self.shared.lock();
        if ledger.interrupted {
            if ledger.running == 0 {
                DispatcherState::Interrupted
            } else {
                DispatcherState::Draining
            }
        } else if !ledger.sources.is_empty() {
            DispatcherState::Running
        } else if ledger.running > 0 {
            DispatcherState::Draining
        } else if ledger.started == 0 && ledger.failures.is_empty() {
            DispatcherState::Idle
        } else {
            DispatcherState::Completed
        }
    }
}
