use crate::types::Task;
use async_trait::async_trait;
use ensemble_bus::{MessageBus, PriorityQueue, PushOutcome};
use ensemble_core::{EnsembleError, EnsembleResult, Message, MessageKind, Priority};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Construction-time configuration of a [`TaskScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of task workers.
    pub workers: usize,
    /// Upper bound on tasks in progress at once.
    pub max_concurrent_tasks: usize,
    /// Maximum queued tasks.
    pub queue_capacity: usize,
    /// Bounded wait of a worker's queue poll.
    pub poll_timeout: Duration,
    /// How long a worker backs off after hitting the concurrency bound.
    pub backpressure_delay: Duration,
    /// Role id that receives task-update notifications.
    pub status_target: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            max_concurrent_tasks: 3,
            queue_capacity: 1_000,
            poll_timeout: Duration::from_millis(500),
            backpressure_delay: Duration::from_millis(100),
            status_target: "status_monitor".to_string(),
        }
    }
}

/// Hands a running task its cancellation flag and progress slot.
///
/// Cancellation is cooperative: requesting it only raises the flag, and the
/// task body decides at its own safe points whether to bail out. Progress is
/// a lock-free fraction in `[0, 1]`.
#[derive(Clone)]
pub struct TaskContext {
    cancelled: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
}

impl TaskContext {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(AtomicU64::new(0.0f64.to_bits())),
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Records the completion fraction, clamped to `[0, 1]`.
    pub fn set_progress(&self, progress: f64) {
        self.progress
            .store(progress.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Last recorded completion fraction.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }
}

/// Executes one task on behalf of a role.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Runs the task body, checking `ctx` for cancellation at safe points.
    async fn run(&self, task: &Task, ctx: &TaskContext) -> EnsembleResult<serde_json::Value>;
}

#[derive(Default)]
struct TaskCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

struct ActiveEntry {
    task: Task,
    ctx: TaskContext,
}

struct SchedulerCore {
    role_id: String,
    runner: Arc<dyn TaskRunner>,
    queue: PriorityQueue<Task>,
    active: Mutex<HashMap<Uuid, ActiveEntry>>,
    counters: TaskCounters,
    max_concurrent: usize,
}

impl SchedulerCore {
    /// Atomically admits a task into the active index, or hands it back when
    /// the concurrency bound is reached.
    fn try_begin(&self, mut task: Task) -> Result<(Task, TaskContext), Task> {
        let mut active = self.active.lock();
        if active.len() >= self.max_concurrent {
            return Err(task);
        }
        task.start();
        let ctx = TaskContext::new();
        active.insert(
            task.id,
            ActiveEntry {
                task: task.clone(),
                ctx: ctx.clone(),
            },
        );
        Ok((task, ctx))
    }

    async fn execute(
        &self,
        mut task: Task,
        ctx: TaskContext,
        bus: Option<&Arc<MessageBus>>,
        status_target: &str,
    ) {
        info!(role = %self.role_id, task = %task.id, kind = %task.kind, "task started");
        let outcome = self.runner.run(&task, &ctx).await;
        self.active.lock().remove(&task.id);

        match outcome {
            Ok(result) => {
                task.complete(result);
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(role = %self.role_id, task = %task.id, "task completed");
            }
            Err(_) if ctx.is_cancelled() => {
                task.set_progress(ctx.progress());
                task.cancel();
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                info!(role = %self.role_id, task = %task.id, "task cancelled");
            }
            Err(e) => {
                task.set_progress(ctx.progress());
                task.fail(e.to_string());
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(role = %self.role_id, task = %task.id, error = %e, "task failed");
            }
        }
        emit_task_update(bus, &self.role_id, status_target, &task).await;
    }
}

/// Emits a `task_update` notification for a terminal task state.
async fn emit_task_update(
    bus: Option<&Arc<MessageBus>>,
    role_id: &str,
    status_target: &str,
    task: &Task,
) {
    let Some(bus) = bus else { return };
    let payload = match serde_json::to_value(task) {
        Ok(value) => value,
        Err(e) => {
            warn!(role = %role_id, task = %task.id, error = %e, "could not serialize task");
            return;
        }
    };
    let message = Message::new(MessageKind::TaskUpdate, role_id, status_target, "task_update")
        .with_data("task", payload);
    if let Err(e) = bus.send(message).await {
        warn!(role = %role_id, task = %task.id, error = %e, "failed to emit task update");
    }
}

/// Per-role work queue with a fixed worker pool and a concurrency bound.
///
/// Decouples "a message arrived" from "the work it implies is finished": a
/// role's message handler submits tasks here and returns immediately, while
/// the pool executes at most `max_concurrent_tasks` bodies at a time and
/// reports every terminal state back onto the bus.
pub struct TaskScheduler {
    core: Arc<SchedulerCore>,
    config: SchedulerConfig,
    bus: Option<Arc<MessageBus>>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Creates a stopped scheduler for the given role.
    pub fn new(
        role_id: impl Into<String>,
        runner: Arc<dyn TaskRunner>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(SchedulerCore {
                role_id: role_id.into(),
                runner,
                queue: PriorityQueue::new(config.queue_capacity),
                active: Mutex::new(HashMap::new()),
                counters: TaskCounters::default(),
                max_concurrent: config.max_concurrent_tasks,
            }),
            config,
            bus: None,
            shutdown,
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Attaches the bus that receives task-update notifications.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Creates a pending task and queues it.
    ///
    /// A full queue evicts the oldest low/normal-priority pending task
    /// (reported as cancelled) or, when nothing is evictable, rejects the
    /// submission.
    pub async fn submit(
        &self,
        kind: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
        priority: Priority,
    ) -> EnsembleResult<Uuid> {
        let task = Task::new(kind, payload, priority);
        let task_id = task.id;
        let kind = task.kind.clone();
        match self.core.queue.push(task) {
            PushOutcome::Accepted => {}
            PushOutcome::AcceptedEvicting(victim) => {
                warn!(
                    role = %self.core.role_id,
                    victim = %victim.id,
                    "task queue at capacity, evicted oldest pending task"
                );
                let mut victim = *victim;
                victim.cancel();
                self.core.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                emit_task_update(
                    self.bus.as_ref(),
                    &self.core.role_id,
                    &self.config.status_target,
                    &victim,
                )
                .await;
            }
            PushOutcome::Rejected(_) => {
                return Err(EnsembleError::Task("task queue full".to_string()));
            }
        }
        debug!(role = %self.core.role_id, task = %task_id, kind = %kind, "task submitted");
        Ok(task_id)
    }

    /// Requests cooperative cancellation of an in-progress task.
    ///
    /// Returns `false` when the task is not currently executing; pending
    /// tasks cannot be cancelled individually.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let active = self.core.active.lock();
        match active.get(&task_id) {
            Some(entry) => {
                entry.ctx.cancel();
                true
            }
            None => false,
        }
    }

    /// Tasks currently in progress.
    pub fn active_count(&self) -> usize {
        self.core.active.lock().len()
    }

    /// Snapshot of the in-progress tasks.
    pub fn active_tasks(&self) -> Vec<Task> {
        self.core
            .active
            .lock()
            .values()
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Tasks waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.core.queue.len()
    }

    /// Maximum tasks in progress at once.
    pub fn max_concurrent_tasks(&self) -> usize {
        self.core.max_concurrent
    }

    /// Lifetime count of completed tasks.
    pub fn tasks_completed(&self) -> u64 {
        self.core.counters.completed.load(Ordering::Relaxed)
    }

    /// Lifetime count of failed tasks.
    pub fn tasks_failed(&self) -> u64 {
        self.core.counters.failed.load(Ordering::Relaxed)
    }

    /// Lifetime count of cancelled tasks.
    pub fn tasks_cancelled(&self) -> u64 {
        self.core.counters.cancelled.load(Ordering::Relaxed)
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the worker pool. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            role = %self.core.role_id,
            workers = self.config.workers,
            max_concurrent = self.core.max_concurrent,
            "starting task scheduler"
        );
        self.shutdown.send_replace(false);
        let mut workers = self.workers.lock();
        for i in 0..self.config.workers {
            workers.push(tokio::spawn(worker_loop(
                format!("worker-{i}"),
                self.core.clone(),
                self.bus.clone(),
                self.config.clone(),
                self.shutdown.subscribe(),
            )));
        }
    }

    /// Stops the worker pool and cancels in-flight tasks cooperatively.
    ///
    /// Running task bodies observe the cancellation flag at their next safe
    /// point; the pool is awaited, so bodies that ignore the flag still run
    /// to completion before this returns. Idempotent.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(role = %self.core.role_id, "shutting down task scheduler");
        self.shutdown.send_replace(true);
        self.core.queue.wake_consumers();
        for entry in self.core.active.lock().values() {
            entry.ctx.cancel();
        }

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(role = %self.core.role_id, error = %e, "task worker ended abnormally");
            }
        }

        // Anything a worker left behind is reported as cancelled.
        let leftovers: Vec<Task> = {
            let mut active = self.core.active.lock();
            active.drain().map(|(_, entry)| entry.task).collect()
        };
        for mut task in leftovers {
            task.cancel();
            self.core.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            emit_task_update(
                self.bus.as_ref(),
                &self.core.role_id,
                &self.config.status_target,
                &task,
            )
            .await;
        }
    }
}

async fn worker_loop(
    name: String,
    core: Arc<SchedulerCore>,
    bus: Option<Arc<MessageBus>>,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
) {
    debug!(role = %core.role_id, worker = %name, "task worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(task) = core.queue.pop_timeout(config.poll_timeout).await else {
            continue;
        };
        match core.try_begin(task) {
            Ok((task, ctx)) => {
                core.execute(task, ctx, bus.as_ref(), &config.status_target)
                    .await;
            }
            Err(task) => {
                // At the concurrency bound: hand the task back and retry
                // shortly instead of exceeding it.
                core.queue.push_front(task);
                tokio::time::sleep(config.backpressure_delay).await;
            }
        }
    }
    debug!(role = %core.role_id, worker = %name, "task worker stopped");
}
