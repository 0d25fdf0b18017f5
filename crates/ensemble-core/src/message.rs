use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The kind of a [`Message`], drawn from a closed set.
///
/// Kinds group into system control, task lifecycle, request/response,
/// collaboration, and synchronization families. The wire form is the
/// snake_case string of the variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// System bring-up announcement.
    SystemInit,
    /// Orderly system shutdown request.
    SystemShutdown,
    /// Liveness probe answered by every role.
    HealthCheck,
    /// A role reporting a state or progress change.
    StatusUpdate,
    /// Assign a unit of work to a role.
    TaskAssign,
    /// Progress or terminal-state report for an assigned task.
    TaskUpdate,
    /// A task finished successfully.
    TaskComplete,
    /// A task finished with an error.
    TaskFailed,
    /// A request expecting a correlated [`MessageKind::Response`].
    Request,
    /// A response correlated to an earlier request.
    Response,
    /// A read-only question that does not mutate the recipient.
    Query,
    /// Fire-and-forget informational message.
    Notification,
    /// Ask another role to cooperate on a piece of work.
    CollaborationRequest,
    /// Answer to a collaboration request.
    CollaborationResponse,
    /// Ask another role for a resource it owns.
    ResourceRequest,
    /// Answer to a resource request.
    ResourceResponse,
    /// Bulk data synchronization between roles.
    DataSync,
    /// Role state synchronization.
    StateSync,
    /// Update to the shared memory store.
    MemoryUpdate,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::SystemInit => "system_init",
            MessageKind::SystemShutdown => "system_shutdown",
            MessageKind::HealthCheck => "health_check",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::TaskAssign => "task_assign",
            MessageKind::TaskUpdate => "task_update",
            MessageKind::TaskComplete => "task_complete",
            MessageKind::TaskFailed => "task_failed",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Query => "query",
            MessageKind::Notification => "notification",
            MessageKind::CollaborationRequest => "collaboration_request",
            MessageKind::CollaborationResponse => "collaboration_response",
            MessageKind::ResourceRequest => "resource_request",
            MessageKind::ResourceResponse => "resource_response",
            MessageKind::DataSync => "data_sync",
            MessageKind::StateSync => "state_sync",
            MessageKind::MemoryUpdate => "memory_update",
        };
        f.write_str(name)
    }
}

/// Delivery priority of a message.
///
/// Variants are declared in ascending order so the derived `Ord` matches the
/// protocol ordering: `Low < Normal < High < Urgent < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background traffic, first to be evicted under pressure.
    Low,
    /// Default priority.
    Normal,
    /// Preferred over normal traffic, evictable only after low/normal.
    High,
    /// Near-front-of-line delivery, never evicted.
    Urgent,
    /// Front-of-line delivery, never evicted.
    Critical,
}

impl Priority {
    /// All priorities from most to least urgent — the lane scan order.
    pub const DESCENDING: [Priority; 5] = [
        Priority::Critical,
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Anything that can be sorted into a priority lane.
///
/// Implemented by [`Message`] and by the role scheduler's task type, so both
/// share the same lane semantics.
pub trait Prioritized {
    /// The priority lane this item belongs to.
    fn priority(&self) -> Priority;
}

/// Delivery lifecycle state of a message.
///
/// Advances monotonically: `pending → sent → delivered → processed`, with
/// `failed` reachable from any non-terminal state and `timeout` reserved for
/// messages that expired before delivery. `processed`, `failed`, and
/// `timeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted by the bus, waiting in the queue.
    Pending,
    /// Picked up by a bus worker.
    Sent,
    /// Every target handler ran without error.
    Delivered,
    /// A handler signalled logical completion.
    Processed,
    /// Validation, capacity, routing, or handler failure.
    Failed,
    /// Expired before a worker could deliver it.
    Timeout,
}

impl MessageStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Processed | MessageStatus::Failed | MessageStatus::Timeout
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Forward hops go one step at a time; `failed` and `timeout` are
    /// reachable from any non-terminal state; nothing leaves a terminal
    /// state and self-transitions are rejected.
    pub fn can_advance(self, next: MessageStatus) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        match next {
            MessageStatus::Failed | MessageStatus::Timeout => true,
            MessageStatus::Sent => self == MessageStatus::Pending,
            MessageStatus::Delivered => self == MessageStatus::Sent,
            MessageStatus::Processed => self == MessageStatus::Delivered,
            MessageStatus::Pending => false,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
            MessageStatus::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Addressing and delivery metadata of a [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Globally unique identifier, generated at creation.
    pub message_id: Uuid,
    /// Message kind.
    pub kind: MessageKind,
    /// Delivery priority.
    pub priority: Priority,
    /// UTC creation timestamp.
    pub timestamp: DateTime<Utc>,
    /// Sender role id.
    pub from_role: String,
    /// Recipient role id.
    pub to_role: String,
    /// Links a response back to the request that caused it.
    pub correlation_id: Option<Uuid>,
    /// Advisory expiry; the bus refuses to deliver past this instant.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Operation and payload of a [`Message`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBody {
    /// Name of the operation the recipient should perform.
    pub action: String,
    /// Operation payload.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Contextual values accompanying the payload.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// Cross-cutting annotations; middleware may enrich this map.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// The unit of communication between roles: header, body, and lifecycle
/// status.
///
/// A message is immutable by convention once validated; only the bus and
/// tracker advance `status`, and only along the
/// [`MessageStatus::can_advance`] state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Addressing and delivery metadata.
    pub header: MessageHeader,
    /// Operation and payload.
    pub body: MessageBody,
    /// Current delivery lifecycle state.
    pub status: MessageStatus,
}

impl Message {
    /// Creates a message of the given kind with default priority and an
    /// empty payload.
    pub fn new(
        kind: MessageKind,
        from_role: impl Into<String>,
        to_role: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            header: MessageHeader {
                message_id: Uuid::new_v4(),
                kind,
                priority: Priority::Normal,
                timestamp: Utc::now(),
                from_role: from_role.into(),
                to_role: to_role.into(),
                correlation_id: None,
                expires_at: None,
            },
            body: MessageBody {
                action: action.into(),
                ..MessageBody::default()
            },
            status: MessageStatus::Pending,
        }
    }

    /// Creates a [`MessageKind::Request`].
    pub fn request(
        from_role: impl Into<String>,
        to_role: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Request, from_role, to_role, action)
    }

    /// Creates a [`MessageKind::Notification`].
    pub fn notification(
        from_role: impl Into<String>,
        to_role: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Notification, from_role, to_role, action)
    }

    /// Creates the [`MessageKind::Response`] to a request.
    ///
    /// Flips sender and recipient, inherits the request's priority, sets the
    /// correlation id to the request's message id, and names the action
    /// `<request action>_response`.
    pub fn reply_to(request: &Message) -> Self {
        Self::new(
            MessageKind::Response,
            request.header.to_role.clone(),
            request.header.from_role.clone(),
            format!("{}_response", request.body.action),
        )
        .with_priority(request.header.priority)
        .with_correlation(request.header.message_id)
    }

    /// Creates a [`MessageKind::TaskAssign`] carrying a task description.
    pub fn task_assignment(
        from_role: impl Into<String>,
        to_role: impl Into<String>,
        task_data: HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut message = Self::new(MessageKind::TaskAssign, from_role, to_role, "task_assign");
        message.body.data = task_data;
        message
    }

    /// Creates a [`MessageKind::StatusUpdate`] addressed to the status
    /// monitor.
    pub fn status_update(
        from_role: impl Into<String>,
        data: HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut message = Self::new(
            MessageKind::StatusUpdate,
            from_role,
            "status_monitor",
            "status_update",
        );
        message.body.data = data;
        message
    }

    /// Creates a high-priority [`MessageKind::CollaborationRequest`].
    pub fn collaboration_request(
        from_role: impl Into<String>,
        to_role: impl Into<String>,
        collaboration_type: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::new(
            MessageKind::CollaborationRequest,
            from_role,
            to_role,
            "request_collaboration",
        )
        .with_priority(Priority::High)
        .with_data(
            "collaboration_type",
            serde_json::Value::String(collaboration_type.into()),
        )
        .with_data("details", details)
    }

    /// Sets the message kind.
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.header.kind = kind;
        self
    }

    /// Sets the delivery priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority;
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.header.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the advisory expiry instant.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.header.expires_at = Some(expires_at);
        self
    }

    /// Inserts one payload entry.
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.body.data.insert(key.into(), value);
        self
    }

    /// Replaces the whole payload map.
    pub fn with_payload(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.body.data = data;
        self
    }

    /// Inserts one context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.body.context.insert(key.into(), value);
        self
    }

    /// Inserts one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.body.metadata.insert(key.into(), value);
        self
    }

    /// Whether the message carries an expiry that lies before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.header.expires_at.is_some_and(|expiry| expiry < now)
    }
}

impl Prioritized for Message {
    fn priority(&self) -> Priority {
        self.header.priority
    }
}
