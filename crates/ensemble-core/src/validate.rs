use crate::message::Message;

/// Reason a message failed structural validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The sender role id is empty.
    #[error("from_role must not be empty")]
    EmptyFromRole,

    /// The recipient role id is empty.
    #[error("to_role must not be empty")]
    EmptyToRole,

    /// The body names no action for the recipient to perform.
    #[error("action must not be empty")]
    EmptyAction,
}

/// Checks the structural invariants of a message.
///
/// Pure and synchronous; the bus calls this before accepting a message, and
/// a failure here means the message is never tracked or enqueued. Kind,
/// priority, and timestamp validity are carried by the type system: a
/// structural dump with an unrecognized enumeration value or an unparsable
/// timestamp is rejected when it is deserialized back into a [`Message`].
pub fn validate(message: &Message) -> Result<(), ValidationError> {
    if message.header.from_role.is_empty() {
        return Err(ValidationError::EmptyFromRole);
    }
    if message.header.to_role.is_empty() {
        return Err(ValidationError::EmptyToRole);
    }
    if message.body.action.is_empty() {
        return Err(ValidationError::EmptyAction);
    }
    Ok(())
}
