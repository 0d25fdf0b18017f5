//! Per-role task scheduling and the agent harness binding roles to the bus.
//!
//! A role's message handler should return quickly; the work a message
//! implies goes onto the role's [`TaskScheduler`], which executes it on a
//! fixed worker pool under a concurrency bound and reports every terminal
//! task state back onto the bus. [`RoleAgent`] wires a [`Role`]
//! implementation into that machinery: bus registration, built-in actions,
//! correlated responses, and status snapshots.
//!
//! # Main types
//!
//! - [`Role`] — Trait a role implementation supplies.
//! - [`RoleAgent`] — Harness binding a role to a bus and a scheduler.
//! - [`TaskScheduler`] — Bounded priority task queue plus worker pool.
//! - [`Task`] / [`TaskStatus`] — A unit of role-local work and its lifecycle.
//! - [`TaskContext`] — Cooperative cancellation flag and progress slot.
//! - [`RoleStatus`] — Point-in-time role snapshot.

/// Role trait, built-in action dispatch, and the agent harness.
pub mod agent;
/// Bounded task scheduler with a fixed worker pool.
pub mod scheduler;
/// Role state, task, and status types.
pub mod types;

pub use agent::{BaseAction, Role, RoleAgent};
pub use scheduler::{SchedulerConfig, TaskContext, TaskRunner, TaskScheduler};
pub use types::{RoleState, RoleStats, RoleStatus, Task, TaskStatus};
