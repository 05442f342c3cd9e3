//! Integration tests for protocol serialization

use flightdeck::agent::TargetId;
use flightdeck::protocol::{
    deserialize, serialize, CommandMessage, MetaType, Notification, ResponseMessage,
    ResponseStatus, CLIENT_DROPPED, MAX_MESSAGE_SIZE,
};
use serde_json::{json, Value};

#[test]
fn test_command_message_defaults() {
    let msg: CommandMessage = deserialize(r#"{"command":"help"}"#).expect("deserialize failed");
    assert_eq!(msg.command, "help");
    assert!(msg.id.is_none());
    assert!(msg.args.is_empty());

    let msg: CommandMessage =
        deserialize(r#"{"id":"7","command":"list","args":["localhost:9091"]}"#).unwrap();
    assert_eq!(msg.id.as_deref(), Some("7"));
    assert_eq!(msg.args, vec!["localhost:9091"]);
}

#[test]
fn test_response_message_wire_format() {
    let msg = ResponseMessage::new(
        Some("7".to_string()),
        ResponseStatus::CommandException,
        "save",
        json!("Recording \"rec1\" not found"),
    );
    let value: Value = serde_json::from_str(&serialize(&msg).unwrap()).unwrap();
    assert_eq!(
        value,
        json!({
            "id": "7",
            "status": -2,
            "commandName": "save",
            "payload": "Recording \"rec1\" not found",
        })
    );
    assert!(!msg.is_ok());
}

#[test]
fn test_notification_wire_format() {
    let dropped = Notification::text(CLIENT_DROPPED, "127.0.0.1:50123");
    let value: Value = serde_json::from_str(&serialize(&dropped).unwrap()).unwrap();
    assert_eq!(
        value,
        json!({
            "meta": {
                "category": "client_dropped",
                "type": { "type": "text", "subType": "plain" },
            },
            "message": "127.0.0.1:50123",
        })
    );

    let created = Notification::recording_created("rec1", &TargetId::from("localhost:9091"));
    assert_eq!(created.meta_type(), &MetaType::json());
}

#[test]
fn test_malformed_message_rejected() {
    assert!(deserialize::<CommandMessage>("{\"args\":[]}").is_err());
    assert!(deserialize::<CommandMessage>("not json").is_err());

    let oversized = format!(
        "{{\"command\":\"{}\"}}",
        "x".repeat(MAX_MESSAGE_SIZE + 1)
    );
    let err = deserialize::<CommandMessage>(&oversized).unwrap_err();
    assert!(err.to_string().contains("too large"));
}
