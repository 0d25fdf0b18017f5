#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{Duration, Utc};
use ensemble_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Round-trip law: structural dump and reload preserve every field
// ---------------------------------------------------------------------------

#[test]
fn message_roundtrip_preserves_every_field() {
    let correlation = Uuid::new_v4();
    let expires = Utc::now() + Duration::hours(1);
    let msg = Message::request("planner", "builder", "compile")
        .with_kind(MessageKind::ResourceRequest)
        .with_priority(Priority::Urgent)
        .with_correlation(correlation)
        .with_expiry(expires)
        .with_data("target", serde_json::json!("x86_64"))
        .with_context("attempt", serde_json::json!(2))
        .with_metadata("trace", serde_json::json!("abc123"));

    let dump = serde_json::to_string(&msg).unwrap();
    let reloaded: Message = serde_json::from_str(&dump).unwrap();

    assert_eq!(reloaded.header.message_id, msg.header.message_id);
    assert_eq!(reloaded.header.kind, MessageKind::ResourceRequest);
    assert_eq!(reloaded.header.priority, Priority::Urgent);
    assert_eq!(reloaded.header.timestamp, msg.header.timestamp);
    assert_eq!(reloaded.header.from_role, "planner");
    assert_eq!(reloaded.header.to_role, "builder");
    assert_eq!(reloaded.header.correlation_id, Some(correlation));
    assert_eq!(reloaded.header.expires_at, Some(expires));
    assert_eq!(reloaded.body.action, "compile");
    assert_eq!(reloaded.body.data.get("target"), msg.body.data.get("target"));
    assert_eq!(
        reloaded.body.context.get("attempt"),
        msg.body.context.get("attempt")
    );
    assert_eq!(
        reloaded.body.metadata.get("trace"),
        msg.body.metadata.get("trace")
    );
    assert_eq!(reloaded.status, MessageStatus::Pending);
}

#[test]
fn enumerations_render_as_string_values() {
    let msg = Message::request("a", "b", "act").with_priority(Priority::Critical);
    let dump: serde_json::Value = serde_json::to_value(&msg).unwrap();
    assert_eq!(dump["header"]["kind"], "request");
    assert_eq!(dump["header"]["priority"], "critical");
    assert_eq!(dump["status"], "pending");
}

// ---------------------------------------------------------------------------
// 2. The serde boundary rejects malformed structural dumps
// ---------------------------------------------------------------------------

fn dump_of(msg: &Message) -> serde_json::Value {
    serde_json::to_value(msg).unwrap()
}

#[test]
fn reload_rejects_unrecognized_kind() {
    let mut dump = dump_of(&Message::request("a", "b", "act"));
    dump["header"]["kind"] = serde_json::json!("carrier_pigeon");
    assert!(serde_json::from_value::<Message>(dump).is_err());
}

#[test]
fn reload_rejects_unrecognized_priority() {
    let mut dump = dump_of(&Message::request("a", "b", "act"));
    dump["header"]["priority"] = serde_json::json!("extreme");
    assert!(serde_json::from_value::<Message>(dump).is_err());
}

#[test]
fn reload_rejects_unparsable_timestamp() {
    let mut dump = dump_of(&Message::request("a", "b", "act"));
    dump["header"]["timestamp"] = serde_json::json!("not-a-point-in-time");
    assert!(serde_json::from_value::<Message>(dump).is_err());
}

#[test]
fn reload_rejects_unrecognized_status() {
    let mut dump = dump_of(&Message::request("a", "b", "act"));
    dump["status"] = serde_json::json!("lost");
    assert!(serde_json::from_value::<Message>(dump).is_err());
}

// ---------------------------------------------------------------------------
// 3. Validation matrix
// ---------------------------------------------------------------------------

#[test]
fn validate_rejects_each_empty_identity_field() {
    assert!(validate(&Message::request("a", "b", "act")).is_ok());
    assert_eq!(
        validate(&Message::request("", "b", "act")),
        Err(ValidationError::EmptyFromRole)
    );
    assert_eq!(
        validate(&Message::request("a", "", "act")),
        Err(ValidationError::EmptyToRole)
    );
    assert_eq!(
        validate(&Message::request("a", "b", "")),
        Err(ValidationError::EmptyAction)
    );
}

// ---------------------------------------------------------------------------
// 4. Error enum display and conversions
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let bus_err = EnsembleError::Bus("message queue full".to_string());
    assert_eq!(bus_err.to_string(), "bus error: message queue full");

    let validation: EnsembleError = ValidationError::EmptyAction.into();
    assert_eq!(
        validation.to_string(),
        "validation error: action must not be empty"
    );

    let json_err = serde_json::from_str::<Message>("{").unwrap_err();
    let wrapped: EnsembleError = json_err.into();
    assert!(matches!(wrapped, EnsembleError::Json(_)));
}
