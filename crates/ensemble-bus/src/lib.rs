//! Priority-aware message delivery for Ensemble roles.
//!
//! The bus composes three parts behind a small worker pool: a bounded
//! multi-lane priority queue, a router holding role handlers, subscriptions,
//! and middleware, and a tracker recording every message's delivery
//! lifecycle. Producers call [`MessageBus::send`]; workers drain the queue in
//! strict priority order and invoke the resolved handlers.
//!
//! # Main types
//!
//! - [`MessageBus`] — The public entry point: send, register, start, stop.
//! - [`PriorityQueue`] — Bounded multi-lane FIFO buffer with eviction.
//! - [`MessageRouter`] — Role handlers, subscription graph, middleware chain.
//! - [`MessageTracker`] — Per-message delivery state with periodic sweep.
//! - [`MessageHandler`] / [`Middleware`] — The traits roles and transforms
//!   implement to plug into delivery.

/// Bus orchestration: worker pool, statistics, lifecycle.
pub mod bus;
/// Bounded multi-lane priority queue.
pub mod queue;
/// Role handler registry, subscriptions, and middleware pipeline.
pub mod router;
/// Message lifecycle tracking and retention sweep.
pub mod tracker;

pub use bus::{BusConfig, BusStats, MessageBus, QueueStatus};
pub use queue::{PriorityQueue, PushOutcome};
pub use router::{MessageHandler, MessageRouter, Middleware};
pub use tracker::{MessageTracker, TrackedEntry};
