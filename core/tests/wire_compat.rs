// Verify the wire format matches what terminal clients expect.
// These tests keep protocol compatibility from breaking silently.

use common::protocol::{decode_client, encode_server, ClientMsg, ServerMsg, SessionEntry};

#[test]
fn list_frame_decodes() {
    let msg = decode_client(r#"{"type":"list"}"#).unwrap().unwrap();
    assert_eq!(msg, ClientMsg::List);
}

#[test]
fn create_frame_decodes() {
    let msg = decode_client(r#"{"type":"create","name":"build"}"#)
        .unwrap()
        .unwrap();
    assert_eq!(
        msg,
        ClientMsg::Create {
            name: "build".to_string()
        }
    );
}

#[test]
fn rename_frame_uses_camel_case_fields() {
    let msg = decode_client(r#"{"type":"rename","oldName":"a","newName":"b"}"#)
        .unwrap()
        .unwrap();
    assert_eq!(
        msg,
        ClientMsg::Rename {
            old_name: "a".to_string(),
            new_name: "b".to_string()
        }
    );
}

#[test]
fn resize_frame_decodes_ints() {
    let msg = decode_client(r#"{"type":"resize","cols":120,"rows":40}"#)
        .unwrap()
        .unwrap();
    assert_eq!(msg, ClientMsg::Resize { cols: 120, rows: 40 });
}

#[test]
fn input_frame_carries_raw_data() {
    let msg = decode_client(r#"{"type":"input","data":"echo hi\n"}"#)
        .unwrap()
        .unwrap();
    assert_eq!(
        msg,
        ClientMsg::Input {
            data: "echo hi\n".to_string()
        }
    );
}

#[test]
fn unknown_type_is_ignored() {
    // Forward compatibility: a newer client may send types we do not know.
    let res = decode_client(r#"{"type":"subscribe","topic":"x"}"#).unwrap();
    assert!(res.is_none());
}

#[test]
fn malformed_json_is_an_error() {
    assert!(decode_client("{not json").is_err());
}

#[test]
fn missing_type_is_an_error() {
    assert!(decode_client(r#"{"name":"x"}"#).is_err());
}

#[test]
fn known_type_with_bad_fields_is_an_error() {
    // `create` without a name is a protocol error, not an unknown type.
    assert!(decode_client(r#"{"type":"create"}"#).is_err());
    assert!(decode_client(r#"{"type":"resize","cols":"wide","rows":1}"#).is_err());
}

#[test]
fn sessions_serialization() {
    let json = encode_server(&ServerMsg::Sessions {
        list: vec![SessionEntry {
            name: "s1".to_string(),
            client_count: 2,
        }],
    });
    assert!(json.contains(r#""type":"sessions""#));
    assert!(json.contains(r#""name":"s1""#));
    assert!(json.contains(r#""clientCount":2"#));
}

#[test]
fn renamed_serialization_uses_camel_case_fields() {
    let json = encode_server(&ServerMsg::Renamed {
        old_name: "a".to_string(),
        new_name: "b".to_string(),
    });
    assert!(json.contains(r#""type":"renamed""#));
    assert!(json.contains(r#""oldName":"a""#));
    assert!(json.contains(r#""newName":"b""#));
}

#[test]
fn exited_serialization_keeps_null_signal() {
    let json = encode_server(&ServerMsg::Exited {
        name: "s1".to_string(),
        exit_code: 0,
        signal: None,
    });
    assert!(json.contains(r#""type":"exited""#));
    assert!(json.contains(r#""exitCode":0"#));
    // A plain exit reports an explicit null signal.
    assert!(json.contains(r#""signal":null"#));

    let json = encode_server(&ServerMsg::Exited {
        name: "s1".to_string(),
        exit_code: 129,
        signal: Some("Hangup".to_string()),
    });
    assert!(json.contains(r#""signal":"Hangup""#));
}

#[test]
fn output_round_trips_escape_sequences() {
    let data = "\u{1b}[31mred\u{1b}[0m\r\n";
    let json = encode_server(&ServerMsg::Output {
        data: data.to_string(),
    });
    let back: ServerMsg = serde_json::from_str(&json).unwrap();
    assert_eq!(
        back,
        ServerMsg::Output {
            data: data.to_string()
        }
    );
}

#[test]
fn error_serialization() {
    let json = encode_server(&ServerMsg::Error {
        message: "session not found: s9".to_string(),
    });
    assert!(json.contains(r#""type":"error""#));
    assert!(json.contains("session not found"));
}
