//! Unit tests for inbound frame classification and outbound frame builders.

use serde_json::{json, Map, Value};

use agent_conduit::protocol::content::UserContent;
use agent_conduit::protocol::frame::{
    control_request, control_success, permission_allow, permission_deny, session_create,
    user_message, CallbackKind, InboundFrame,
};
use agent_conduit::protocol::new_request_id;

// ── Inbound ──────────────────────────────────────────────────────────────────

#[test]
fn system_frame_keeps_subtype() {
    let frame = json!({"type": "system", "subtype": "init", "session_id": "s1"});
    match InboundFrame::classify(frame.clone()) {
        InboundFrame::System { subtype, frame: raw } => {
            assert_eq!(subtype.as_deref(), Some("init"));
            assert_eq!(raw, frame);
        }
        other => panic!("expected system, got {}", other.tag()),
    }
}

#[test]
fn control_response_reads_nested_request_id() {
    let frame = json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": "req_1", "response": {"ok": true}}
    });
    let InboundFrame::ControlResponse { request_id, outcome } = InboundFrame::classify(frame)
    else {
        panic!("expected control_response");
    };
    assert_eq!(request_id, "req_1");
    assert_eq!(outcome, Ok(json!({"ok": true})));
}

/// Some agents put the id beside `response` rather than inside it.
#[test]
fn control_response_falls_back_to_top_level_request_id() {
    let frame = json!({
        "type": "control_response",
        "request_id": "req_2",
        "response": {"subtype": "error", "error": "no such model"}
    });
    let InboundFrame::ControlResponse { request_id, outcome } = InboundFrame::classify(frame)
    else {
        panic!("expected control_response");
    };
    assert_eq!(request_id, "req_2");
    assert_eq!(outcome, Err("no such model".to_owned()));
}

#[test]
fn control_request_exposes_subtype_and_body() {
    let frame = json!({
        "type": "control_request",
        "request_id": "cb_1",
        "request": {"subtype": "can_use_tool", "tool_name": "Bash", "input": {"command": "ls"}}
    });
    let InboundFrame::ControlRequest {
        request_id,
        subtype,
        request,
        ..
    } = InboundFrame::classify(frame)
    else {
        panic!("expected control_request");
    };
    assert_eq!(request_id, "cb_1");
    assert_eq!(subtype, "can_use_tool");
    assert_eq!(request["tool_name"], "Bash");
}

#[test]
fn control_request_without_subtype_is_malformed() {
    let frame = json!({"type": "control_request", "request_id": "cb_1", "request": {}});
    assert!(matches!(
        InboundFrame::classify(frame),
        InboundFrame::Malformed { .. }
    ));
}

#[test]
fn broker_frames_are_classified() {
    let created = InboundFrame::classify(json!({
        "type": "session.created", "request_id": "req_1", "session_id": "A"
    }));
    assert!(matches!(
        created,
        InboundFrame::SessionCreated { ref request_id, ref session_id }
            if request_id == "req_1" && session_id == "A"
    ));

    let message = InboundFrame::classify(json!({
        "type": "session.message", "session_id": "A", "message": {"type": "assistant"}
    }));
    assert!(matches!(
        message,
        InboundFrame::SessionMessage { ref message, .. } if message["type"] == "assistant"
    ));

    let error = InboundFrame::classify(json!({
        "type": "session.error", "request_id": "req_2", "error": {"message": "quota"}
    }));
    assert!(matches!(error, InboundFrame::SessionError { ref error, .. } if error == "quota"));

    let callback = InboundFrame::classify(json!({
        "type": "callback.request", "session_id": "A", "callback_id": "cb", "kind": "hook"
    }));
    assert!(matches!(
        callback,
        InboundFrame::CallbackRequest { kind: CallbackKind::Hook, .. }
    ));
}

#[test]
fn query_result_carries_outcome() {
    let ok = InboundFrame::classify(json!({
        "type": "query.result", "request_id": "req_1", "success": true, "result": [1, 2]
    }));
    assert!(matches!(ok, InboundFrame::QueryResult { outcome: Ok(ref v), .. } if v == &json!([1, 2])));

    let failed = InboundFrame::classify(json!({
        "type": "query.result", "request_id": "req_1", "success": false, "error": "nope"
    }));
    assert!(matches!(failed, InboundFrame::QueryResult { outcome: Err(ref e), .. } if e == "nope"));
}

#[test]
fn unknown_and_untyped_frames_are_preserved() {
    let unknown = InboundFrame::classify(json!({"type": "telemetry", "n": 1}));
    assert_eq!(unknown.tag(), "telemetry");

    let untyped = InboundFrame::classify(json!({"n": 1}));
    assert!(matches!(
        untyped,
        InboundFrame::Unknown { frame_type: None, ref frame } if frame["n"] == 1
    ));
}

// ── Outbound ─────────────────────────────────────────────────────────────────

#[test]
fn request_ids_are_unique_and_prefixed() {
    let a = new_request_id();
    let b = new_request_id();
    assert!(a.starts_with("req_"));
    assert_ne!(a, b);
}

#[test]
fn control_request_merges_fields_under_request() {
    let mut fields = Map::new();
    fields.insert("model".to_owned(), Value::Null);
    let frame = control_request("req_9", "set_model", fields);
    assert_eq!(
        frame,
        json!({
            "type": "control_request",
            "request_id": "req_9",
            "request": {"subtype": "set_model", "model": null}
        })
    );
}

#[test]
fn control_success_nests_request_id() {
    let frame = control_success("cb_1", json!({"behavior": "allow"}));
    assert_eq!(frame["type"], "control_response");
    assert_eq!(frame["response"]["subtype"], "success");
    assert_eq!(frame["response"]["request_id"], "cb_1");
    assert_eq!(frame["response"]["response"]["behavior"], "allow");
}

#[test]
fn user_message_has_placeholder_for_empty_text() {
    let frame = user_message(&UserContent::from(""), Some("s1"));
    assert_eq!(frame["type"], "user");
    assert_eq!(frame["message"]["role"], "user");
    assert_eq!(frame["message"]["content"], " ");
    assert_eq!(frame["session_id"], "s1");
    assert!(frame["parent_tool_use_id"].is_null());
}

/// Image-only content gets a text block so the agent accepts it.
#[test]
fn block_content_without_text_gets_placeholder_block() {
    let image = json!({"type": "image", "source": {"type": "base64", "data": "AAAA"}});
    let frame = user_message(&UserContent::Blocks(vec![image.clone()]), None);
    let content = frame["message"]["content"]
        .as_array()
        .expect("block content");
    assert_eq!(content.len(), 2);
    assert_eq!(content[0], json!({"type": "text", "text": " "}));
    assert_eq!(content[1], image);
    assert!(frame.get("session_id").is_none());
}

#[test]
fn permission_bodies_match_wire_shape() {
    let allow = permission_allow(json!({"command": "ls"}), Some("tu_1"), None);
    assert_eq!(
        allow,
        json!({"behavior": "allow", "updatedInput": {"command": "ls"}, "toolUseID": "tu_1"})
    );

    let deny = permission_deny("not today", None, true);
    assert_eq!(deny["behavior"], "deny");
    assert_eq!(deny["message"], "not today");
    assert_eq!(deny["interrupt"], true);
}

#[test]
fn session_create_carries_options_and_first_message() {
    let message = user_message(&UserContent::from("hi"), None);
    let frame = session_create("req_1", json!({"model": "m"}), message.clone());
    assert_eq!(frame["type"], "session.create");
    assert_eq!(frame["request_id"], "req_1");
    assert_eq!(frame["options"]["model"], "m");
    assert_eq!(frame["message"], message);
}
