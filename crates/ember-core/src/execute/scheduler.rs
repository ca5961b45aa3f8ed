//! Single-slot execution scheduler.
//!
//! One dedicated worker thread drains a bounded FIFO queue and runs at most
//! one task at a time. Callers block (or await) on the task's completion.
//!
//! Interruption is cooperative first: the in-flight task's [`InterruptHandle`]
//! is raised and the task gets a short grace period to unwind. A task that
//! ignores the signal is abandoned: its completion resolves as
//! [`ExecutionResult::Interrupted`], the worker generation is retired and a
//! fresh worker takes over the queue. The abandoned thread keeps running its
//! body in isolation until the body returns on its own; its result is
//! discarded and it never dequeues another task. Anything the body mutated
//! outside its own inputs and outputs is left in whatever state it reached.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};

use super::context::{InterruptHandle, TaskContext};
use super::jobs::JobLauncher;
use super::result::{ExecutionResult, Fault};

/// How often `interrupt_current` re-checks whether the task unwound.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What `interrupt_current` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Nothing was executing.
    Idle,
    /// The task observed the signal and unwound within the grace period.
    Cooperative,
    /// The task ignored the signal and its worker was abandoned.
    Forced,
}

/// Type-erased completion of a queued task.
trait PendingResult: Send + Sync {
    /// Send the stored body outcome to the waiting caller.
    fn deliver(&self) -> bool;
    /// Resolve the caller as interrupted, regardless of the body.
    fn abandon(&self) -> bool;
}

struct Completion<T> {
    tx: Mutex<Option<oneshot::Sender<ExecutionResult<T>>>>,
    result: Mutex<Option<ExecutionResult<T>>>,
}

impl<T: Send> Completion<T> {
    fn new(tx: oneshot::Sender<ExecutionResult<T>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            result: Mutex::new(None),
        }
    }

    fn store(&self, result: ExecutionResult<T>) {
        *lock(&self.result) = Some(result);
    }

    fn send(&self, result: ExecutionResult<T>) -> bool {
        match lock(&self.tx).take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

impl<T: Send> PendingResult for Completion<T> {
    fn deliver(&self) -> bool {
        match lock(&self.result).take() {
            Some(result) => self.send(result),
            None => false,
        }
    }

    fn abandon(&self) -> bool {
        self.send(ExecutionResult::Interrupted)
    }
}

struct Task {
    ctx: TaskContext,
    run: Box<dyn FnOnce(&TaskContext) + Send>,
    pending: Arc<dyn PendingResult>,
}

#[derive(Clone)]
struct Running {
    id: u64,
    name: String,
    interrupt: InterruptHandle,
    pending: Arc<dyn PendingResult>,
}

struct Shared {
    queue: Mutex<mpsc::Receiver<Task>>,
    running: Mutex<Option<Running>>,
    executing: AtomicBool,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn is_running(&self, id: u64) -> bool {
        lock(&self.running).as_ref().is_some_and(|r| r.id == id)
    }

    fn execute(&self, task: Task) {
        let Task { ctx, run, pending } = task;

        {
            let mut running = lock(&self.running);
            *running = Some(Running {
                id: ctx.id(),
                name: ctx.name().to_string(),
                interrupt: ctx.interrupt_handle(),
                pending: pending.clone(),
            });
            self.executing.store(true, Ordering::SeqCst);
        }
        tracing::debug!(task = ctx.name(), id = ctx.id(), "task started");

        run(&ctx);

        let owner = {
            let mut running = lock(&self.running);
            if running.as_ref().is_some_and(|r| r.id == ctx.id()) {
                *running = None;
                self.executing.store(false, Ordering::SeqCst);
                true
            } else {
                false
            }
        };

        if ctx.is_interrupted() {
            tracing::info!(task = ctx.name(), "clearing interrupted status");
        }

        if owner {
            if !pending.deliver() {
                tracing::debug!(task = ctx.name(), "caller stopped waiting for result");
            }
        } else {
            tracing::debug!(task = ctx.name(), "result of abandoned task discarded");
        }
    }
}

fn worker_loop(shared: Arc<Shared>, generation: u64) {
    tracing::debug!(generation, "execution worker started");
    loop {
        if shared.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "retired execution worker exiting");
            return;
        }

        let next = lock(&shared.queue).blocking_recv();
        let Some(task) = next else {
            tracing::debug!(generation, "task queue closed, execution worker exiting");
            return;
        };

        if shared.closed.load(Ordering::SeqCst) {
            tracing::debug!(task = task.ctx.name(), "discarding task queued before close");
            continue;
        }

        shared.execute(task);
    }
}

fn spawn_worker(shared: Arc<Shared>, generation: u64) -> Result<()> {
    thread::Builder::new()
        .name(format!("ember-executor-{}", generation))
        .spawn(move || worker_loop(shared, generation))
        .map(|_| ())
        .map_err(|e| Error::WorkerSpawn(e.to_string()))
}

/// Serializes task execution onto one worker thread.
///
/// Fire-and-forget jobs (completion, diagnostics) bypass the execution slot
/// and run on the [`JobLauncher`] returned by [`ExecutionScheduler::jobs`].
pub struct ExecutionScheduler {
    config: SchedulerConfig,
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    next_id: AtomicU64,
    jobs: JobLauncher,
}

impl ExecutionScheduler {
    /// Create a scheduler and start its worker.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(Shared {
            queue: Mutex::new(rx),
            running: Mutex::new(None),
            executing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        spawn_worker(shared.clone(), 0)?;

        Ok(Self {
            config,
            shared,
            sender: Mutex::new(Some(tx)),
            next_id: AtomicU64::new(1),
            jobs: JobLauncher::new()?,
        })
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Unordered job facility for requests that must not wait on the slot.
    pub fn jobs(&self) -> &JobLauncher {
        &self.jobs
    }

    /// Whether a task is currently in progress.
    pub fn is_executing(&self) -> bool {
        self.shared.executing.load(Ordering::SeqCst)
    }

    /// Name of the in-flight task, if any.
    pub fn current_task_name(&self) -> Option<String> {
        lock(&self.shared.running).as_ref().map(|r| r.name.clone())
    }

    /// Number of tasks waiting behind the in-flight one.
    pub fn queued_tasks(&self) -> usize {
        lock(&self.sender)
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn prepare<T, F>(
        &self,
        name: String,
        context: Option<String>,
        body: F,
    ) -> (Task, oneshot::Receiver<ExecutionResult<T>>)
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> std::result::Result<T, Fault> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Completion::new(tx));
        let for_body = completion.clone();

        let run = move |ctx: &TaskContext| {
            let outcome = match catch_unwind(AssertUnwindSafe(|| body(ctx))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(Fault::from_panic(payload)),
            };
            for_body.store(ExecutionResult::from_outcome(outcome));
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = Task {
            ctx: TaskContext::new(id, name, context),
            run: Box::new(run),
            pending: completion,
        };
        (task, rx)
    }

    fn sender(&self) -> Result<mpsc::Sender<Task>> {
        lock(&self.sender).clone().ok_or(Error::SchedulerClosed)
    }

    /// Queue a task and block until it completes.
    ///
    /// Blocks while the queue is full. Must not be called from inside an
    /// async context; use [`submit_async`](Self::submit_async) there.
    pub fn submit<T, F>(
        &self,
        name: impl Into<String>,
        context: Option<String>,
        body: F,
    ) -> Result<ExecutionResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> std::result::Result<T, Fault> + Send + 'static,
    {
        let (task, rx) = self.prepare(name.into(), context, body);
        self.sender()?
            .blocking_send(task)
            .map_err(|_| Error::SchedulerClosed)?;
        rx.blocking_recv().map_err(|_| Error::SchedulerClosed)
    }

    /// Async flavour of [`submit`](Self::submit).
    pub async fn submit_async<T, F>(
        &self,
        name: impl Into<String>,
        context: Option<String>,
        body: F,
    ) -> Result<ExecutionResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> std::result::Result<T, Fault> + Send + 'static,
    {
        let (task, rx) = self.prepare(name.into(), context, body);
        let sender = self.sender()?;
        sender.send(task).await.map_err(|_| Error::SchedulerClosed)?;
        drop(sender);
        rx.await.map_err(|_| Error::SchedulerClosed)
    }

    /// Interrupt whichever task is currently executing.
    ///
    /// Queued tasks are left alone. Blocks for at most the configured grace
    /// period before escalating.
    pub fn interrupt_current(&self) -> InterruptOutcome {
        let target = lock(&self.shared.running).clone();
        let Some(target) = target else {
            tracing::info!("interrupt requested with no execution in progress");
            return InterruptOutcome::Idle;
        };

        tracing::info!(task = %target.name, "stopping execution");
        target.interrupt.interrupt();

        let deadline = Instant::now() + self.config.interrupt_grace();
        loop {
            if !self.shared.is_running(target.id) {
                tracing::info!(task = %target.name, "execution interrupted");
                return InterruptOutcome::Cooperative;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(INTERRUPT_POLL_INTERVAL.min(deadline - now));
        }

        if self.abandon(&target) {
            InterruptOutcome::Forced
        } else {
            InterruptOutcome::Cooperative
        }
    }

    fn abandon(&self, target: &Running) -> bool {
        let generation = {
            let mut running = lock(&self.shared.running);
            if !running.as_ref().is_some_and(|r| r.id == target.id) {
                return false;
            }
            *running = None;
            self.shared.executing.store(false, Ordering::SeqCst);
            self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        target.pending.abandon();
        tracing::warn!(
            task = %target.name,
            "execution ignored the interrupt; abandoning its worker thread"
        );

        if self.is_closed() {
            return true;
        }
        if let Err(e) = spawn_worker(self.shared.clone(), generation) {
            tracing::error!("failed to replace abandoned execution worker: {}", e);
        }
        true
    }

    /// Drop queued tasks, interrupt the in-flight one, stop the worker and
    /// cancel outstanding jobs. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("closing execution scheduler");

        lock(&self.sender).take();

        let queue = match self.shared.queue.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            // The worker is parked in `blocking_recv` and drains on its own.
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut queue) = queue {
            queue.close();
            let mut dropped = 0usize;
            while queue.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!(dropped, "dropped queued tasks");
            }
        }

        self.interrupt_current();
        self.jobs.shutdown();
    }
}

impl Drop for ExecutionScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> ExecutionScheduler {
        ExecutionScheduler::new(SchedulerConfig::default()).unwrap()
    }

    #[test]
    fn test_submit_returns_value() {
        let scheduler = scheduler();
        let result = scheduler.submit("answer", None, |_| Ok(42)).unwrap();
        assert_eq!(result, ExecutionResult::Success(42));
        assert!(!scheduler.is_executing());
    }

    #[test]
    fn test_fault_is_captured() {
        let scheduler = scheduler();
        let result = scheduler
            .submit("failing", None, |_| Err::<(), _>(Fault::new("Boom", "went wrong")))
            .unwrap();
        match result {
            ExecutionResult::Failure(fault) => assert_eq!(fault.kind, "Boom"),
            other => panic!("unexpected result: {:?}", other),
        }

        // Worker survives
        assert!(scheduler.submit("next", None, |_| Ok(1)).unwrap().is_success());
    }

    #[test]
    fn test_panic_is_captured() {
        let scheduler = scheduler();
        let result = scheduler
            .submit("panicking", None, |_| -> std::result::Result<(), Fault> {
                panic!("kaboom")
            })
            .unwrap();
        match result {
            ExecutionResult::Failure(fault) => {
                assert_eq!(fault.kind, crate::execute::PANIC_FAULT_KIND);
                assert_eq!(fault.message, "kaboom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(scheduler.submit("after panic", None, |_| Ok(())).unwrap().is_success());
    }

    #[test]
    fn test_context_and_name_visible_to_body() {
        let scheduler = scheduler();
        let result = scheduler
            .submit("named", Some("ctx-7".to_string()), |ctx| {
                Ok((ctx.name().to_string(), ctx.context().map(str::to_string)))
            })
            .unwrap();
        assert_eq!(
            result,
            ExecutionResult::Success(("named".to_string(), Some("ctx-7".to_string())))
        );
    }

    #[test]
    fn test_interrupt_idle_is_noop() {
        let scheduler = scheduler();
        assert_eq!(scheduler.interrupt_current(), InterruptOutcome::Idle);
    }

    #[test]
    fn test_submit_after_close_fails() {
        let scheduler = scheduler();
        scheduler.close();
        assert!(scheduler.is_closed());
        let err = scheduler.submit("late", None, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::SchedulerClosed));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = SchedulerConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(ExecutionScheduler::new(config).is_err());
    }
}
