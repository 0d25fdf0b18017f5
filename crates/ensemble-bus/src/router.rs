use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult, Message};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Receives messages delivered to a role.
///
/// Implementations must not block the worker: long work belongs on the
/// role's task scheduler, not inside `handle`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivered message.
    async fn handle(&self, message: Message) -> EnsembleResult<()>;
}

/// A cross-cutting transform applied to every message before delivery.
///
/// Middleware may enrich `body.metadata` but must not rewrite the message
/// id, sender, or recipient — the router rejects a step that does.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Transforms a message, returning the value to pass down the chain.
    async fn process(&self, message: Message) -> EnsembleResult<Message>;
}

/// Decides who receives a message and applies the middleware chain.
///
/// Holds the role → handler bindings, the subscription graph (role → set of
/// subscriber roles receiving copies of everything that role sends), and the
/// ordered middleware pipeline.
pub struct MessageRouter {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl MessageRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
        }
    }

    /// Binds a handler to a role id, replacing any existing binding.
    pub fn register_role(&self, role_id: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let role_id = role_id.into();
        tracing::debug!(role = %role_id, "role registered");
        self.handlers.write().insert(role_id, handler);
    }

    /// Removes a role's handler and purges it from every subscription set.
    pub fn unregister_role(&self, role_id: &str) {
        self.handlers.write().remove(role_id);
        let mut subscriptions = self.subscriptions.write();
        for subscribers in subscriptions.values_mut() {
            subscribers.remove(role_id);
        }
        subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        tracing::debug!(role = %role_id, "role unregistered");
    }

    /// Subscribes `subscriber_role` to every message `target_role` sends.
    pub fn subscribe(&self, subscriber_role: impl Into<String>, target_role: impl Into<String>) {
        self.subscriptions
            .write()
            .entry(target_role.into())
            .or_default()
            .insert(subscriber_role.into());
    }

    /// Removes a subscription; no-op if it does not exist.
    pub fn unsubscribe(&self, subscriber_role: &str, target_role: &str) {
        let mut subscriptions = self.subscriptions.write();
        if let Some(subscribers) = subscriptions.get_mut(target_role) {
            subscribers.remove(subscriber_role);
            if subscribers.is_empty() {
                subscriptions.remove(target_role);
            }
        }
    }

    /// Appends a middleware step to the end of the pipeline.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.write().push(middleware);
    }

    /// Looks up the handler bound to a role id.
    pub fn handler_for(&self, role_id: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(role_id).cloned()
    }

    /// Whether a handler is bound to the role id.
    pub fn is_registered(&self, role_id: &str) -> bool {
        self.handlers.read().contains_key(role_id)
    }

    /// Resolves the delivery targets of a message: the direct recipient (if
    /// registered) unioned with the current subscribers of the sender.
    ///
    /// An empty result means the bus marks the message failed.
    pub fn resolve_targets(&self, message: &Message) -> Vec<String> {
        let mut targets = Vec::new();
        if self.is_registered(&message.header.to_role) {
            targets.push(message.header.to_role.clone());
        }
        if let Some(subscribers) = self.subscriptions.read().get(&message.header.from_role) {
            for subscriber in subscribers {
                if !targets.contains(subscriber) {
                    targets.push(subscriber.clone());
                }
            }
        }
        targets
    }

    /// Runs the message through every middleware step in registration order.
    ///
    /// A step that rewrites the message id, sender, or recipient violates
    /// the identity contract and fails the whole send.
    pub async fn apply_middleware(&self, mut message: Message) -> EnsembleResult<Message> {
        let chain: Vec<Arc<dyn Middleware>> = self.middleware.read().clone();
        for step in chain {
            let id = message.header.message_id;
            let from = message.header.from_role.clone();
            let to = message.header.to_role.clone();
            message = step.process(message).await?;
            if message.header.message_id != id
                || message.header.from_role != from
                || message.header.to_role != to
            {
                return Err(EnsembleError::Middleware(
                    "middleware must not rewrite message identity".to_string(),
                ));
            }
        }
        Ok(message)
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: Message) -> EnsembleResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Appends its tag to `metadata["chain"]` so ordering is observable.
    struct TaggingMiddleware {
        tag: &'static str,
    }

    #[async_trait]
    impl Middleware for TaggingMiddleware {
        async fn process(&self, mut message: Message) -> EnsembleResult<Message> {
            let chain = message
                .body
                .metadata
                .entry("chain".to_string())
                .or_insert_with(|| serde_json::json!([]));
            if let Some(entries) = chain.as_array_mut() {
                entries.push(serde_json::json!(self.tag));
            }
            Ok(message)
        }
    }

    struct RewritingMiddleware;

    #[async_trait]
    impl Middleware for RewritingMiddleware {
        async fn process(&self, mut message: Message) -> EnsembleResult<Message> {
            message.header.to_role = "hijacked".to_string();
            Ok(message)
        }
    }

    #[test]
    fn test_resolve_direct_recipient_only_when_registered() {
        let router = MessageRouter::new();
        let msg = Message::request("caller", "echo", "ping");
        assert!(router.resolve_targets(&msg).is_empty());

        router.register_role("echo", CountingHandler::new());
        assert_eq!(router.resolve_targets(&msg), vec!["echo".to_string()]);
    }

    #[test]
    fn test_resolve_unions_sender_subscribers() {
        let router = MessageRouter::new();
        router.register_role("echo", CountingHandler::new());
        router.register_role("audit", CountingHandler::new());
        router.subscribe("audit", "caller");

        let msg = Message::request("caller", "echo", "ping");
        let targets = router.resolve_targets(&msg);
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&"echo".to_string()));
        assert!(targets.contains(&"audit".to_string()));
    }

    #[test]
    fn test_resolve_dedupes_recipient_who_also_subscribes() {
        let router = MessageRouter::new();
        router.register_role("echo", CountingHandler::new());
        router.subscribe("echo", "caller");

        let msg = Message::request("caller", "echo", "ping");
        assert_eq!(router.resolve_targets(&msg), vec!["echo".to_string()]);
    }

    #[test]
    fn test_unregister_purges_subscriptions() {
        let router = MessageRouter::new();
        router.register_role("audit", CountingHandler::new());
        router.subscribe("audit", "echo");
        router.unregister_role("audit");

        let msg = Message::request("echo", "nobody", "notify");
        assert!(router.resolve_targets(&msg).is_empty());
        assert!(!router.is_registered("audit"));
    }

    #[test]
    fn test_unsubscribe_is_isolated() {
        let router = MessageRouter::new();
        router.subscribe("audit", "echo");
        router.subscribe("metrics", "echo");
        router.unsubscribe("audit", "echo");

        let msg = Message::request("echo", "nobody", "notify");
        assert_eq!(router.resolve_targets(&msg), vec!["metrics".to_string()]);
    }

    #[tokio::test]
    async fn test_middleware_runs_in_registration_order() {
        let router = MessageRouter::new();
        router.add_middleware(Arc::new(TaggingMiddleware { tag: "first" }));
        router.add_middleware(Arc::new(TaggingMiddleware { tag: "second" }));

        let msg = router
            .apply_middleware(Message::request("a", "b", "act"))
            .await
            .unwrap();
        assert_eq!(
            msg.body.metadata.get("chain"),
            Some(&serde_json::json!(["first", "second"]))
        );
    }

    #[tokio::test]
    async fn test_middleware_may_not_rewrite_identity() {
        let router = MessageRouter::new();
        router.add_middleware(Arc::new(RewritingMiddleware));

        let result = router
            .apply_middleware(Message::request("a", "b", "act"))
            .await;
        assert!(matches!(result, Err(EnsembleError::Middleware(_))));
    }

    #[tokio::test]
    async fn test_handler_lookup_and_invocation() {
        let router = MessageRouter::new();
        let handler = CountingHandler::new();
        router.register_role("echo", handler.clone());

        let found = router.handler_for("echo").unwrap();
        found
            .handle(Message::request("caller", "echo", "ping"))
            .await
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(router.handler_for("ghost").is_none());
    }
}
