//! Core protocol types for the Ensemble role-communication framework.
//!
//! This crate defines the typed message envelope exchanged between roles,
//! the closed enumerations it is built from, and the pure validation applied
//! before a message enters the bus. It has no knowledge of delivery — the
//! bus and scheduler crates build on these types.
//!
//! # Main types
//!
//! - [`EnsembleError`] — Unified error enum for all Ensemble subsystems.
//! - [`EnsembleResult`] — Convenience alias for `Result<T, EnsembleError>`.
//! - [`Message`] — The header + body envelope exchanged between roles.
//! - [`MessageKind`] — Closed set of message kinds (requests, task events, sync).
//! - [`Priority`] — Five ordered delivery priorities, `Low` through `Critical`.
//! - [`MessageStatus`] — Delivery lifecycle state machine.
//! - [`Prioritized`] — Anything that can be ordered into a priority lane.
//! - [`validate`] — Structural validation of a message.

/// Unified error type and result alias.
pub mod error;
/// Message envelope, enumerations, and builder constructors.
pub mod message;
/// Structural message validation.
pub mod validate;

pub use error::{EnsembleError, EnsembleResult};
pub use message::{
    Message, MessageBody, MessageHeader, MessageKind, MessageStatus, Prioritized, Priority,
};
pub use validate::{validate, ValidationError};
