//! Integration tests for the wire format.
//!
//! Messages are checked as raw JSON, the way a front-end sees them.

use ember_core::CompletenessStatus;
use ember_server::protocol::*;
use serde_json::{Value, json};

fn client_message(channel: &str, msg_type: &str, content: Value) -> String {
    json!({
        "channel": channel,
        "header": {
            "msg_id": "m1",
            "session": "s1",
            "username": "front-end",
            "date": "2026-01-01T00:00:00.000000Z",
            "msg_type": msg_type,
            "version": "5.3"
        },
        "parent_header": {},
        "metadata": {},
        "content": content
    })
    .to_string()
}

#[test]
fn test_client_messages_decode() {
    let cases = vec![
        (client_message("shell", "kernel_info_request", json!({})), "KernelInfo"),
        (
            client_message("shell", "execute_request", json!({ "code": "1" })),
            "Execute",
        ),
        (
            client_message("shell", "complete_request", json!({ "code": "p", "cursor_pos": 1 })),
            "Complete",
        ),
        (
            client_message("shell", "is_complete_request", json!({ "code": "1" })),
            "IsComplete",
        ),
        (
            client_message("shell", "comm_open", json!({ "comm_id": "c", "target_name": "t" })),
            "CommOpen",
        ),
        (client_message("control", "interrupt_request", json!({})), "Interrupt"),
        (client_message("stdin", "input_reply", json!({ "value": "x" })), "InputReply"),
        (client_message("shell", "mystery_request", json!({})), "Unknown"),
    ];

    for (raw, expected) in cases {
        let message: Message = serde_json::from_str(&raw).unwrap();
        assert!(message.parent_header.is_none());
        let request = Request::decode(&message).unwrap();
        let name = format!("{:?}", request);
        assert!(name.starts_with(expected), "{} decoded as {}", raw, name);
    }
}

#[test]
fn test_event_channel_accepts_both_names() {
    for channel in ["iopub", "event"] {
        let raw = client_message(channel, "status", json!({ "execution_state": "idle" }));
        let message: Message = serde_json::from_str(&raw).unwrap();
        assert_eq!(message.channel, Channel::Event);
    }
}

#[test]
fn test_reply_envelope() {
    let raw = client_message("shell", "execute_request", json!({ "code": "1" }));
    let request: Message = serde_json::from_str(&raw).unwrap();

    let reply = Message::reply_to(
        &request.header,
        Channel::Event,
        msg_type::STATUS,
        serde_json::to_value(StatusContent {
            execution_state: ExecutionState::Busy,
        })
        .unwrap(),
    );
    let json = serde_json::to_value(&reply).unwrap();

    assert_eq!(json["channel"], "iopub");
    assert_eq!(json["parent_header"]["msg_id"], "m1");
    assert_eq!(json["header"]["session"], "s1");
    assert_eq!(json["header"]["msg_type"], "status");
    assert_eq!(json["header"]["version"], PROTOCOL_VERSION);
    assert_ne!(json["header"]["msg_id"], "m1");
    assert_eq!(json["content"]["execution_state"], "busy");
}

#[test]
fn test_execute_reply_shapes() {
    let ok = ExecuteReply {
        status: ReplyStatus::Ok,
        execution_count: 3,
        error: None,
        payload: Some(Vec::new()),
        user_expressions: Some(Default::default()),
    };
    let json = serde_json::to_value(&ok).unwrap();
    assert_eq!(json, json!({
        "status": "ok",
        "execution_count": 3,
        "payload": [],
        "user_expressions": {}
    }));

    let abort = ExecuteReply {
        status: ReplyStatus::Abort,
        execution_count: 4,
        error: None,
        payload: None,
        user_expressions: None,
    };
    let json = serde_json::to_value(&abort).unwrap();
    assert_eq!(json, json!({ "status": "abort", "execution_count": 4 }));
}

#[test]
fn test_is_complete_reply_shapes() {
    let incomplete = IsCompleteReply {
        status: CompletenessStatus::Incomplete {
            indent: "  ".to_string(),
        },
    };
    assert_eq!(
        serde_json::to_value(&incomplete).unwrap(),
        json!({ "status": "incomplete", "indent": "  " })
    );
    let invalid = IsCompleteReply {
        status: CompletenessStatus::Invalid,
    };
    assert_eq!(
        serde_json::to_value(&invalid).unwrap(),
        json!({ "status": "invalid" })
    );
}

#[test]
fn test_stream_and_input_request_content() {
    let stream = serde_json::to_value(StreamContent {
        name: "stdout".to_string(),
        text: "hi\n".to_string(),
    })
    .unwrap();
    assert_eq!(stream, json!({ "name": "stdout", "text": "hi\n" }));

    let prompt = serde_json::to_value(InputRequest {
        prompt: "> ".to_string(),
        password: true,
    })
    .unwrap();
    assert_eq!(prompt, json!({ "prompt": "> ", "password": true }));
}
