use crate::queue::{PriorityQueue, PushOutcome};
use crate::router::{MessageHandler, MessageRouter, Middleware};
use crate::tracker::{MessageTracker, TrackedEntry};
use chrono::Utc;
use ensemble_core::{validate, EnsembleError, EnsembleResult, Message, MessageStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Construction-time configuration of a [`MessageBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum number of queued messages.
    pub queue_capacity: usize,
    /// Number of delivery workers.
    pub workers: usize,
    /// How long the tracker retains entries.
    pub retention_hours: i64,
    /// How often the tracker sweep runs.
    pub sweep_interval: Duration,
    /// How often aggregate statistics are logged.
    pub stats_interval: Duration,
    /// Bounded wait of a worker's queue poll; also the upper bound on
    /// shutdown latency.
    pub poll_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            workers: 3,
            retention_hours: 24,
            sweep_interval: Duration::from_secs(3600),
            stats_interval: Duration::from_secs(300),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Aggregate delivery statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    /// Messages accepted into the queue.
    pub messages_sent: u64,
    /// Messages every target handler processed without error.
    pub messages_delivered: u64,
    /// Messages that failed validation-free paths: capacity, routing,
    /// handler errors, or expiry.
    pub messages_failed: u64,
    /// Incrementally maintained moving average of delivery latency.
    pub average_delivery_seconds: f64,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Buffered messages.
    pub size: usize,
    /// Maximum buffered messages.
    pub capacity: usize,
    /// `size / capacity` in `[0, 1]`.
    pub utilization: f64,
}

#[derive(Default)]
struct LatencyAvg {
    samples: u64,
    average_seconds: f64,
}

struct StatsInner {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    latency: Mutex<LatencyAvg>,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency: Mutex::new(LatencyAvg::default()),
        }
    }

    fn record_delivery(&self, seconds: f64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let mut latency = self.latency.lock();
        latency.samples += 1;
        // Incremental moving average; no history replay.
        latency.average_seconds += (seconds - latency.average_seconds) / latency.samples as f64;
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_delivered: self.delivered.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            average_delivery_seconds: self.latency.lock().average_seconds,
        }
    }
}

/// The public entry point of the communication backbone.
///
/// Owns the router, queue, and tracker exclusively; producers interact with
/// them only through this type. [`MessageBus::start`] spawns the delivery
/// workers plus the tracker sweep and statistics reporter;
/// [`MessageBus::stop`] cancels all of them cooperatively.
pub struct MessageBus {
    config: BusConfig,
    router: Arc<MessageRouter>,
    queue: Arc<PriorityQueue<Message>>,
    tracker: Arc<MessageTracker>,
    stats: Arc<StatsInner>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    /// Creates a stopped bus with the given configuration.
    pub fn new(config: BusConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            router: Arc::new(MessageRouter::new()),
            queue: Arc::new(PriorityQueue::new(config.queue_capacity)),
            tracker: Arc::new(MessageTracker::new(config.retention_hours)),
            stats: Arc::new(StatsInner::new()),
            shutdown,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Binds a handler to a role id.
    pub fn register_role(&self, role_id: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.router.register_role(role_id, handler);
    }

    /// Removes a role's handler and its subscriptions.
    pub fn unregister_role(&self, role_id: &str) {
        self.router.unregister_role(role_id);
    }

    /// Subscribes `subscriber_role` to every message `target_role` sends.
    pub fn subscribe(&self, subscriber_role: impl Into<String>, target_role: impl Into<String>) {
        self.router.subscribe(subscriber_role, target_role);
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, subscriber_role: &str, target_role: &str) {
        self.router.unsubscribe(subscriber_role, target_role);
    }

    /// Appends a middleware step applied to every message before delivery.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.router.add_middleware(middleware);
    }

    /// Validates, transforms, tracks, and enqueues a message.
    ///
    /// Returns the message id on acceptance. Validation failures are
    /// reported without tracking; a full queue tracks the message as failed
    /// and surfaces the error to the caller. No retry happens either way.
    pub async fn send(&self, message: Message) -> EnsembleResult<Uuid> {
        validate(&message)?;
        let message = self.router.apply_middleware(message).await?;
        let message_id = message.header.message_id;
        self.tracker.track(&message);

        match self.queue.push(message) {
            PushOutcome::Accepted => {}
            PushOutcome::AcceptedEvicting(victim) => {
                warn!(
                    evicted = %victim.header.message_id,
                    priority = %victim.header.priority,
                    "queue at capacity, evicted oldest low-priority message"
                );
                self.tracker.update_status(
                    victim.header.message_id,
                    MessageStatus::Failed,
                    Some("evicted under capacity pressure"),
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Rejected(_) => {
                self.tracker.update_status(
                    message_id,
                    MessageStatus::Failed,
                    Some("message queue full"),
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return Err(EnsembleError::Bus("message queue full".to_string()));
            }
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(message_id)
    }

    /// Marks a delivered message as logically processed by its handler.
    pub fn mark_processed(&self, message_id: Uuid) -> bool {
        self.tracker
            .update_status(message_id, MessageStatus::Processed, None)
    }

    /// Tracked state of one message.
    pub fn message_status(&self, message_id: Uuid) -> Option<TrackedEntry> {
        self.tracker.status_of(message_id)
    }

    /// Messages still tracked as pending (diagnostics, not redelivery).
    pub fn pending_messages(&self) -> Vec<Message> {
        self.tracker.pending_messages()
    }

    /// Aggregate statistics snapshot.
    pub fn stats(&self) -> BusStats {
        self.stats.snapshot()
    }

    /// Current queue occupancy.
    pub fn queue_status(&self) -> QueueStatus {
        let size = self.queue.len();
        let capacity = self.queue.capacity();
        QueueStatus {
            size,
            capacity,
            utilization: if capacity == 0 {
                0.0
            } else {
                size as f64 / capacity as f64
            },
        }
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the delivery workers, the tracker sweep, and the statistics
    /// reporter. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(workers = self.config.workers, "starting message bus");
        self.shutdown.send_replace(false);

        let mut tasks = self.tasks.lock();
        for i in 0..self.config.workers {
            tasks.push(tokio::spawn(worker_loop(
                format!("worker-{i}"),
                self.router.clone(),
                self.queue.clone(),
                self.tracker.clone(),
                self.stats.clone(),
                self.shutdown.subscribe(),
                self.config.poll_timeout,
            )));
        }
        tasks.push(tokio::spawn(sweep_loop(
            self.tracker.clone(),
            self.config.sweep_interval,
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(stats_loop(
            self.stats.clone(),
            self.queue.clone(),
            self.config.stats_interval,
            self.shutdown.subscribe(),
        )));
    }

    /// Cancels every background task and waits for them to finish.
    ///
    /// Cancellation is cooperative: workers observe it at their next queue
    /// poll, so an in-flight delivery always runs to completion. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping message bus");
        self.shutdown.send_replace(true);
        self.queue.wake_consumers();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "bus task ended abnormally");
            }
        }
        info!("message bus stopped");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

async fn worker_loop(
    name: String,
    router: Arc<MessageRouter>,
    queue: Arc<PriorityQueue<Message>>,
    tracker: Arc<MessageTracker>,
    stats: Arc<StatsInner>,
    shutdown: watch::Receiver<bool>,
    poll_timeout: Duration,
) {
    debug!(worker = %name, "message worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(message) = queue.pop_timeout(poll_timeout).await else {
            continue;
        };
        deliver(&router, &tracker, &stats, message).await;
    }
    debug!(worker = %name, "message worker stopped");
}

/// Routes one dequeued message to every resolved target.
///
/// One target's failure never prevents delivery attempts to the rest; the
/// message ends `delivered` only when all targets succeeded.
async fn deliver(
    router: &MessageRouter,
    tracker: &MessageTracker,
    stats: &StatsInner,
    message: Message,
) {
    let started = Instant::now();
    let message_id = message.header.message_id;
    tracker.update_status(message_id, MessageStatus::Sent, None);

    if message.is_expired_at(Utc::now()) {
        warn!(message_id = %message_id, "message expired before delivery");
        tracker.update_status(
            message_id,
            MessageStatus::Timeout,
            Some("expired before delivery"),
        );
        stats.failed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let targets = router.resolve_targets(&message);
    if targets.is_empty() {
        tracker.update_status(
            message_id,
            MessageStatus::Failed,
            Some("no registered target or subscribers"),
        );
        stats.failed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let mut errors = Vec::new();
    for target in &targets {
        match router.handler_for(target) {
            Some(handler) => {
                if let Err(e) = handler.handle(message.clone()).await {
                    warn!(message_id = %message_id, role = %target, error = %e, "handler failed");
                    errors.push(format!("{target}: {e}"));
                }
            }
            None => errors.push(format!("{target}: no handler registered")),
        }
    }

    if errors.is_empty() {
        tracker.update_status(message_id, MessageStatus::Delivered, None);
        stats.record_delivery(started.elapsed().as_secs_f64());
    } else {
        tracker.update_status(message_id, MessageStatus::Failed, Some(&errors.join("; ")));
        stats.failed.fetch_add(1, Ordering::Relaxed);
    }
}

async fn sweep_loop(
    tracker: Arc<MessageTracker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(interval) => {
                let removed = tracker.sweep_expired(Utc::now());
                if removed > 0 {
                    debug!(removed, "tracker sweep removed expired entries");
                }
            }
        }
    }
}

async fn stats_loop(
    stats: Arc<StatsInner>,
    queue: Arc<PriorityQueue<Message>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(interval) => {
                let snapshot = stats.snapshot();
                info!(
                    sent = snapshot.messages_sent,
                    delivered = snapshot.messages_delivered,
                    failed = snapshot.messages_failed,
                    avg_delivery_seconds = snapshot.average_delivery_seconds,
                    queued = queue.len(),
                    "bus statistics"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ensemble_core::Priority;

    fn small_bus(queue_capacity: usize) -> MessageBus {
        MessageBus::new(BusConfig {
            queue_capacity,
            workers: 1,
            poll_timeout: Duration::from_millis(20),
            ..BusConfig::default()
        })
    }

    #[tokio::test]
    async fn test_send_rejects_invalid_message() {
        let bus = small_bus(8);
        let result = bus.send(Message::request("", "echo", "ping")).await;
        assert!(matches!(result, Err(EnsembleError::Validation(_))));
        // Validation failures are never tracked.
        assert!(bus.pending_messages().is_empty());
        assert_eq!(bus.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_send_tracks_and_enqueues() {
        let bus = small_bus(8);
        let id = bus
            .send(Message::request("caller", "echo", "ping"))
            .await
            .unwrap();
        assert_eq!(bus.stats().messages_sent, 1);
        assert_eq!(bus.queue_status().size, 1);
        let entry = bus.message_status(id).unwrap();
        assert_eq!(entry.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_send_surfaces_queue_full() {
        let bus = small_bus(2);
        // Fill with unevictable traffic.
        for _ in 0..2 {
            bus.send(Message::request("a", "b", "work").with_priority(Priority::Critical))
                .await
                .unwrap();
        }
        let rejected = Message::request("a", "b", "late");
        let rejected_id = rejected.header.message_id;
        let result = bus.send(rejected).await;
        assert!(matches!(result, Err(EnsembleError::Bus(_))));

        let entry = bus.message_status(rejected_id).unwrap();
        assert_eq!(entry.status, MessageStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("message queue full"));
        assert_eq!(bus.stats().messages_failed, 1);
        assert_eq!(bus.queue_status().size, 2);
    }

    #[tokio::test]
    async fn test_eviction_victim_is_tracked_failed() {
        let bus = small_bus(2);
        let first = bus
            .send(Message::request("a", "b", "first"))
            .await
            .unwrap();
        bus.send(Message::request("a", "b", "second")).await.unwrap();
        bus.send(Message::request("a", "b", "third")).await.unwrap();

        let entry = bus.message_status(first).unwrap();
        assert_eq!(entry.status, MessageStatus::Failed);
        assert_eq!(
            entry.last_error.as_deref(),
            Some("evicted under capacity pressure")
        );
        assert_eq!(bus.queue_status().size, 2);
        assert!((bus.queue_status().utilization - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let bus = Arc::new(small_bus(8));
        bus.start();
        bus.start();
        assert!(bus.is_running());
        bus.stop().await;
        bus.stop().await;
        assert!(!bus.is_running());
    }

    #[test]
    fn test_latency_moving_average() {
        let stats = StatsInner::new();
        stats.record_delivery(1.0);
        stats.record_delivery(3.0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_delivered, 2);
        assert!((snapshot.average_delivery_seconds - 2.0).abs() < f64::EPSILON);
    }
}
