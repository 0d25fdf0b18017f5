use crate::scheduler::{SchedulerConfig, TaskContext, TaskRunner, TaskScheduler};
use crate::types::{RoleState, RoleStats, RoleStatus, Task};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ensemble_bus::{MessageBus, MessageHandler};
use ensemble_core::{EnsembleError, EnsembleResult, Message, MessageKind, Priority};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Built-in actions every role understands.
///
/// Parsed from the wire action string exactly once, at the delivery
/// boundary; everything past that point dispatches on this closed enum.
/// Unknown actions flow to [`Role::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseAction {
    /// Liveness probe.
    HealthCheck,
    /// Full status snapshot request.
    StatusQuery,
    /// Queue a task on the role's scheduler.
    TaskAssign,
    /// Request cooperative cancellation of a running task.
    TaskCancel,
    /// Shut the role down.
    Shutdown,
}

impl BaseAction {
    /// Parses a wire action name; `None` means a role-specific action.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "health_check" => Some(BaseAction::HealthCheck),
            "status_query" => Some(BaseAction::StatusQuery),
            "task_assign" => Some(BaseAction::TaskAssign),
            "task_cancel" => Some(BaseAction::TaskCancel),
            "shutdown" => Some(BaseAction::Shutdown),
            _ => None,
        }
    }

    /// The wire action name.
    pub fn as_str(self) -> &'static str {
        match self {
            BaseAction::HealthCheck => "health_check",
            BaseAction::StatusQuery => "status_query",
            BaseAction::TaskAssign => "task_assign",
            BaseAction::TaskCancel => "task_cancel",
            BaseAction::Shutdown => "shutdown",
        }
    }
}

/// Behavior a role implementation plugs into its [`RoleAgent`].
///
/// The agent harness owns the scheduler, bus registration, and the built-in
/// actions; implementations only supply identity, lifecycle hooks, custom
/// message handling, and task bodies.
#[async_trait]
pub trait Role: Send + Sync {
    /// Role id as registered on the bus.
    fn role_id(&self) -> &str;

    /// Human-readable name.
    fn role_name(&self) -> &str;

    /// Role-specific startup, run before the agent registers on the bus.
    async fn on_start(&self, agent: &RoleAgent) -> EnsembleResult<()> {
        let _ = agent;
        Ok(())
    }

    /// Role-specific cleanup, run during shutdown after the scheduler stops.
    async fn on_shutdown(&self) -> EnsembleResult<()> {
        Ok(())
    }

    /// Handles a message whose action is not a [`BaseAction`].
    async fn on_message(&self, agent: &RoleAgent, message: Message) -> EnsembleResult<()>;

    /// Executes one task body; check `ctx` for cancellation at safe points.
    async fn run_task(&self, task: &Task, ctx: &TaskContext) -> EnsembleResult<serde_json::Value>;
}

/// Adapts a [`Role`]'s task body to the scheduler's runner seam.
struct RoleTaskRunner {
    role: Arc<dyn Role>,
}

#[async_trait]
impl TaskRunner for RoleTaskRunner {
    async fn run(&self, task: &Task, ctx: &TaskContext) -> EnsembleResult<serde_json::Value> {
        self.role.run_task(task, ctx).await
    }
}

/// Binds a [`Role`] to a [`MessageBus`]: registration, built-in actions,
/// task scheduling, correlated responses, and status reporting.
pub struct RoleAgent {
    role: Arc<dyn Role>,
    bus: Arc<MessageBus>,
    scheduler: TaskScheduler,
    status_target: String,
    // Used to hand the bus a strong handler reference at registration time.
    self_ref: std::sync::Weak<RoleAgent>,
    state: Mutex<RoleState>,
    last_activity: Mutex<DateTime<Utc>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    started_at: DateTime<Utc>,
}

impl RoleAgent {
    /// Creates an agent for the role; call [`RoleAgent::start`] to go live.
    pub fn new(role: Arc<dyn Role>, bus: Arc<MessageBus>, config: SchedulerConfig) -> Arc<Self> {
        let status_target = config.status_target.clone();
        let runner = Arc::new(RoleTaskRunner { role: role.clone() });
        let scheduler =
            TaskScheduler::new(role.role_id(), runner, config).with_bus(bus.clone());
        Arc::new_cyclic(|self_ref| Self {
            role,
            bus,
            scheduler,
            status_target,
            self_ref: self_ref.clone(),
            state: Mutex::new(RoleState::Initializing),
            last_activity: Mutex::new(Utc::now()),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            started_at: Utc::now(),
        })
    }

    /// Runs the role's startup hook, starts the scheduler, and registers on
    /// the bus. A failing hook leaves the role in the `error` state.
    pub async fn start(&self) -> EnsembleResult<()> {
        info!(role = %self.role.role_id(), "starting role");
        if let Err(e) = self.role.on_start(self).await {
            *self.state.lock() = RoleState::Error;
            error!(role = %self.role.role_id(), error = %e, "role startup failed");
            return Err(e);
        }
        let handler = self.self_ref.upgrade().ok_or_else(|| {
            EnsembleError::Role("agent dropped during startup".to_string())
        })?;
        self.scheduler.start();
        self.bus.register_role(self.role.role_id(), handler);
        *self.state.lock() = RoleState::Active;
        if let Err(e) = self.notify_status("initialized", HashMap::new()).await {
            warn!(role = %self.role.role_id(), error = %e, "could not announce startup");
        }
        Ok(())
    }

    /// Unregisters from the bus, stops the scheduler (cancelling in-flight
    /// tasks cooperatively), runs the role's cleanup hook, and emits one
    /// final status notification.
    pub async fn shutdown(&self) {
        info!(role = %self.role.role_id(), "shutting down role");
        *self.state.lock() = RoleState::Shutdown;
        self.bus.unregister_role(self.role.role_id());
        self.scheduler.shutdown().await;
        if let Err(e) = self.role.on_shutdown().await {
            warn!(role = %self.role.role_id(), error = %e, "role cleanup failed");
        }
        if let Err(e) = self.notify_status("shutdown", HashMap::new()).await {
            warn!(role = %self.role.role_id(), error = %e, "could not announce shutdown");
        }
    }

    /// Sends a message through the bus, counting it in the role's stats.
    pub async fn send(&self, message: Message) -> EnsembleResult<Uuid> {
        let message_id = self.bus.send(message).await?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(message_id)
    }

    /// Queues a task on this role's scheduler.
    pub async fn submit_task(
        &self,
        kind: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
        priority: Priority,
    ) -> EnsembleResult<Uuid> {
        self.scheduler.submit(kind, payload, priority).await
    }

    /// Sends a successful correlated response to a request.
    pub async fn respond(
        &self,
        request: &Message,
        mut data: HashMap<String, serde_json::Value>,
    ) -> EnsembleResult<Uuid> {
        data.insert("success".to_string(), serde_json::json!(true));
        self.send(Message::reply_to(request).with_payload(data)).await
    }

    /// Sends an error response correlated to a request.
    pub async fn respond_error(
        &self,
        request: &Message,
        error_text: &str,
    ) -> EnsembleResult<Uuid> {
        let data = HashMap::from([
            ("success".to_string(), serde_json::json!(false)),
            ("error".to_string(), serde_json::json!(error_text)),
        ]);
        self.send(Message::reply_to(request).with_payload(data)).await
    }

    /// Emits a status-update notification to the configured monitor role.
    pub async fn notify_status(
        &self,
        event: &str,
        data: HashMap<String, serde_json::Value>,
    ) -> EnsembleResult<Uuid> {
        let payload = HashMap::from([
            ("event".to_string(), serde_json::json!(event)),
            ("role_id".to_string(), serde_json::json!(self.role.role_id())),
            (
                "timestamp".to_string(),
                serde_json::json!(Utc::now().to_rfc3339()),
            ),
            ("data".to_string(), serde_json::to_value(data)?),
        ]);
        self.send(
            Message::new(
                MessageKind::StatusUpdate,
                self.role.role_id(),
                &self.status_target,
                "status_update",
            )
            .with_payload(payload),
        )
        .await
    }

    /// Point-in-time status snapshot.
    ///
    /// `busy` and `idle` are derived from the scheduler load so the reported
    /// state can never contradict it.
    pub fn status(&self) -> RoleStatus {
        let current_task_count = self.scheduler.active_count();
        let queue_size = self.scheduler.queue_size();
        let state = match *self.state.lock() {
            RoleState::Active if current_task_count >= self.scheduler.max_concurrent_tasks() => {
                RoleState::Busy
            }
            RoleState::Active if current_task_count == 0 && queue_size == 0 => RoleState::Idle,
            other => other,
        };
        RoleStatus {
            role_id: self.role.role_id().to_string(),
            role_name: self.role.role_name().to_string(),
            state,
            last_activity: *self.last_activity.lock(),
            current_task_count,
            queue_size,
            stats: RoleStats {
                tasks_completed: self.scheduler.tasks_completed(),
                tasks_failed: self.scheduler.tasks_failed(),
                tasks_cancelled: self.scheduler.tasks_cancelled(),
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                started_at: self.started_at,
            },
        }
    }

    /// The role's task scheduler.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    async fn handle_health_check(&self, request: &Message) -> EnsembleResult<()> {
        let uptime_seconds = (Utc::now() - self.started_at).num_seconds();
        let data = HashMap::from([
            ("status".to_string(), serde_json::json!("healthy")),
            ("state".to_string(), serde_json::json!(self.status().state)),
            ("uptime_seconds".to_string(), serde_json::json!(uptime_seconds)),
        ]);
        self.respond(request, data).await?;
        Ok(())
    }

    async fn handle_status_query(&self, request: &Message) -> EnsembleResult<()> {
        let status = serde_json::to_value(self.status())?;
        self.respond(request, HashMap::from([("status".to_string(), status)]))
            .await?;
        Ok(())
    }

    async fn handle_task_assign(&self, request: &Message) -> EnsembleResult<()> {
        let kind = request
            .body
            .data
            .get("task_kind")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let payload: HashMap<String, serde_json::Value> =
            match request.body.data.get("task_payload") {
                Some(serde_json::Value::Object(map)) => {
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                }
                _ => HashMap::new(),
            };
        let priority = request
            .body
            .data
            .get("priority")
            .and_then(|v| serde_json::from_value::<Priority>(v.clone()).ok())
            .unwrap_or(request.header.priority);

        match self.submit_task(kind, payload, priority).await {
            Ok(task_id) => {
                let data = HashMap::from([
                    ("task_id".to_string(), serde_json::json!(task_id)),
                    ("status".to_string(), serde_json::json!("accepted")),
                ]);
                self.respond(request, data).await?;
            }
            Err(e) => {
                self.respond_error(request, &format!("task rejected: {e}")).await?;
            }
        }
        Ok(())
    }

    async fn handle_task_cancel(&self, request: &Message) -> EnsembleResult<()> {
        let task_id = request
            .body
            .data
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        match task_id {
            Some(id) => {
                let status = if self.scheduler.cancel(id) {
                    "cancelled"
                } else {
                    "not_found"
                };
                self.respond(
                    request,
                    HashMap::from([("status".to_string(), serde_json::json!(status))]),
                )
                .await?;
            }
            None => {
                self.respond_error(request, "missing or invalid task_id").await?;
            }
        }
        Ok(())
    }

    async fn handle_shutdown_request(&self, request: &Message) -> EnsembleResult<()> {
        self.respond(
            request,
            HashMap::from([("status".to_string(), serde_json::json!("shutting_down"))]),
        )
        .await?;
        self.shutdown().await;
        Ok(())
    }

    async fn handle_custom(&self, message: Message) -> EnsembleResult<()> {
        let is_request = message.header.kind == MessageKind::Request;
        if let Err(e) = self.role.on_message(self, message.clone()).await {
            error!(role = %self.role.role_id(), error = %e, "message handler failed");
            if is_request {
                if let Err(send_err) = self.respond_error(&message, &e.to_string()).await {
                    warn!(role = %self.role.role_id(), error = %send_err, "could not send error response");
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RoleAgent {
    async fn handle(&self, message: Message) -> EnsembleResult<()> {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Utc::now();
        match BaseAction::parse(&message.body.action) {
            Some(BaseAction::HealthCheck) => self.handle_health_check(&message).await,
            Some(BaseAction::StatusQuery) => self.handle_status_query(&message).await,
            Some(BaseAction::TaskAssign) => self.handle_task_assign(&message).await,
            Some(BaseAction::TaskCancel) => self.handle_task_cancel(&message).await,
            Some(BaseAction::Shutdown) => self.handle_shutdown_request(&message).await,
            None => self.handle_custom(message).await,
        }
    }
}
