use chrono::{DateTime, Duration, Utc};
use ensemble_core::{Message, MessageStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Bookkeeping record for one tracked message.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedEntry {
    /// The message as it entered the bus, with its status kept current.
    pub message: Message,
    /// When tracking began.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: MessageStatus,
    /// Number of transitions into `sent` or `failed`.
    pub delivery_attempts: u32,
    /// Instant of the last recorded status change.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Text of the most recent error, if any.
    pub last_error: Option<String>,
}

/// Observable history of message outcomes.
///
/// One entry per message id while retained; entries are created at intake,
/// advanced by the bus on every status change, and deleted by the periodic
/// sweep once older than the retention window regardless of state.
pub struct MessageTracker {
    entries: Mutex<HashMap<Uuid, TrackedEntry>>,
    retention: Duration,
}

impl MessageTracker {
    /// Creates a tracker that retains entries for `retention_hours`.
    pub fn new(retention_hours: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention: Duration::hours(retention_hours),
        }
    }

    /// Begins tracking a message in `pending` state.
    pub fn track(&self, message: &Message) {
        let entry = TrackedEntry {
            message: message.clone(),
            created_at: Utc::now(),
            status: MessageStatus::Pending,
            delivery_attempts: 0,
            last_attempt: None,
            last_error: None,
        };
        self.entries
            .lock()
            .insert(message.header.message_id, entry);
    }

    /// Advances a tracked message's status.
    ///
    /// Transitions must follow [`MessageStatus::can_advance`]; an illegal
    /// transition (or an unknown id) is ignored and reported as `false`.
    /// Transitions into `sent` or `failed` bump the attempt counter.
    pub fn update_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&message_id) else {
            return false;
        };
        if !entry.status.can_advance(status) {
            tracing::debug!(
                message_id = %message_id,
                from = %entry.status,
                to = %status,
                "ignoring illegal status transition"
            );
            return false;
        }
        entry.status = status;
        entry.message.status = status;
        entry.last_attempt = Some(Utc::now());
        if let Some(text) = error {
            entry.last_error = Some(text.to_string());
        }
        if matches!(status, MessageStatus::Sent | MessageStatus::Failed) {
            entry.delivery_attempts += 1;
        }
        true
    }

    /// Snapshot of one tracked entry.
    pub fn status_of(&self, message_id: Uuid) -> Option<TrackedEntry> {
        self.entries.lock().get(&message_id).cloned()
    }

    /// Messages whose tracked status is still `pending`.
    ///
    /// Diagnostic view only; nothing redelivers these.
    pub fn pending_messages(&self) -> Vec<Message> {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.status == MessageStatus::Pending)
            .map(|entry| entry.message.clone())
            .collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is currently tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes every entry older than the retention window as of `now`,
    /// terminal or not. Returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at >= cutoff);
        before - entries.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tracked(tracker: &MessageTracker) -> Message {
        let message = Message::request("planner", "builder", "compile");
        tracker.track(&message);
        message
    }

    #[test]
    fn test_track_starts_pending() {
        let tracker = MessageTracker::new(24);
        let message = tracked(&tracker);

        let entry = tracker.status_of(message.header.message_id).unwrap();
        assert_eq!(entry.status, MessageStatus::Pending);
        assert_eq!(entry.delivery_attempts, 0);
        assert!(entry.last_attempt.is_none());
        assert!(entry.last_error.is_none());
        assert_eq!(tracker.pending_messages().len(), 1);
    }

    #[test]
    fn test_failed_records_error_and_one_attempt() {
        let tracker = MessageTracker::new(24);
        let message = tracked(&tracker);
        let id = message.header.message_id;

        assert!(tracker.update_status(id, MessageStatus::Failed, Some("x")));
        let entry = tracker.status_of(id).unwrap();
        assert_eq!(entry.status, MessageStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("x"));
        assert_eq!(entry.delivery_attempts, 1);
        assert!(entry.last_attempt.is_some());
        assert!(tracker.pending_messages().is_empty());
    }

    #[test]
    fn test_full_delivery_path_counts_one_attempt() {
        let tracker = MessageTracker::new(24);
        let id = tracked(&tracker).header.message_id;

        assert!(tracker.update_status(id, MessageStatus::Sent, None));
        assert!(tracker.update_status(id, MessageStatus::Delivered, None));
        assert!(tracker.update_status(id, MessageStatus::Processed, None));

        let entry = tracker.status_of(id).unwrap();
        assert_eq!(entry.status, MessageStatus::Processed);
        assert_eq!(entry.delivery_attempts, 1);
        // The retained message copy mirrors the tracked status.
        assert_eq!(entry.message.status, MessageStatus::Processed);
    }

    #[test]
    fn test_illegal_transitions_are_ignored() {
        let tracker = MessageTracker::new(24);
        let id = tracked(&tracker).header.message_id;

        // Skipping `sent` is not allowed.
        assert!(!tracker.update_status(id, MessageStatus::Delivered, None));
        assert!(tracker.update_status(id, MessageStatus::Sent, None));
        // No regressions.
        assert!(!tracker.update_status(id, MessageStatus::Pending, None));
        // Terminal states stay terminal.
        assert!(tracker.update_status(id, MessageStatus::Failed, Some("boom")));
        assert!(!tracker.update_status(id, MessageStatus::Delivered, None));
        assert_eq!(tracker.status_of(id).unwrap().delivery_attempts, 2);
    }

    #[test]
    fn test_unknown_id_is_reported() {
        let tracker = MessageTracker::new(24);
        assert!(!tracker.update_status(Uuid::new_v4(), MessageStatus::Sent, None));
        assert!(tracker.status_of(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_sweep_removes_entries_past_retention() {
        let tracker = MessageTracker::new(24);
        let done = tracked(&tracker);
        let pending = tracked(&tracker);
        tracker.update_status(done.header.message_id, MessageStatus::Sent, None);
        tracker.update_status(done.header.message_id, MessageStatus::Delivered, None);

        // Within the window nothing is removed.
        assert_eq!(tracker.sweep_expired(Utc::now()), 0);
        assert_eq!(tracker.len(), 2);

        // Past the window everything goes, terminal or not.
        let removed = tracker.sweep_expired(Utc::now() + Duration::hours(25));
        assert_eq!(removed, 2);
        assert!(tracker.is_empty());
        assert!(tracker.status_of(pending.header.message_id).is_none());
    }
}
