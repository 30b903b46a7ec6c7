use super::*;
use serde_json::json;

use crate::{
    crypto::KeyMaterial,
    operations::{ECHO, GET_USER_INFO, SEND_MESSAGE},
    session::ServiceEndpoints,
    test_support::{encrypted_ok, session_key, session_with, url, FakeExecutor, DEVICE_ID, TEST_UID},
    transport::{RawResponse, RetryPolicy},
};

fn dispatcher(executor: Arc<FakeExecutor>) -> Dispatcher {
    let policy = RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
    };
    Dispatcher::new(Arc::new(Transport::new(executor, policy)), Signer::default())
}

fn endpoints() -> ServiceEndpoints {
    ServiceEndpoints::new()
        .with(
            "chat",
            vec![url("https://chat-a.example.com"), url("https://chat-b.example.com")],
        )
        .with("profile", vec![url("https://profile.example.com")])
}

fn echo_args() -> Params {
    Params::from_pairs([("payload", json!({"text": "ping"}))]).expect("args")
}

#[tokio::test]
async fn empty_session_key_fails_fast_without_network() {
    let executor = FakeExecutor::new(Vec::new());
    let session = session_with(KeyMaterial::empty(), endpoints());

    let err = dispatcher(executor.clone())
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect_err("auth");

    assert!(matches!(err, ClientError::Auth(_)));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn post_operation_sends_encrypted_signed_form() {
    let executor = FakeExecutor::new(vec![Ok(encrypted_ok(
        &session_key(),
        json!({"payload": {"text": "ping"}}),
    ))]);
    let session = session_with(session_key(), endpoints());

    let data = dispatcher(executor.clone())
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect("dispatch");
    assert_eq!(data, json!({"payload": {"text": "ping"}}));

    let requests = executor.requests();
    let request = &requests[0];
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.url.as_str(), "https://chat-a.example.com/api/echo");
    assert_eq!(request.query_value("type"), Some("30"));
    assert_eq!(request.query_value("client_version"), Some("645"));
    assert!(request.query_value("params").is_none());

    let params: Value = decrypt_json(
        &session_key(),
        &EncryptedEnvelope::from_wire(request.form_value("params").expect("params")),
    )
    .expect("decrypt");
    assert_eq!(params, json!({"payload": {"text": "ping"}, "uid": TEST_UID}));

    let expected = Signer::default()
        .sign("echo", &Params::from_json(params).expect("params"), &[])
        .expect("sign");
    assert_eq!(request.query_value("signkey"), Some(expected.as_str()));
}

#[tokio::test]
async fn get_operation_puts_params_in_query_with_session_fields() {
    let executor = FakeExecutor::new(vec![Ok(encrypted_ok(&session_key(), json!({"profiles": {}})))]);
    let session = session_with(session_key(), endpoints());
    let args = Params::from_pairs([("friend_pversion_map", json!(["1_0"]))]).expect("args");

    dispatcher(executor.clone())
        .dispatch(&session, &GET_USER_INFO, args)
        .await
        .expect("dispatch");

    let requests = executor.requests();
    let request = &requests[0];
    assert_eq!(request.method, HttpMethod::Get);
    let params: Value = decrypt_json(
        &session_key(),
        &EncryptedEnvelope::from_wire(request.query_value("params").expect("params")),
    )
    .expect("decrypt");
    assert_eq!(params["imei"], json!(DEVICE_ID));
    assert_eq!(params["language"], json!("vi"));
    assert!(request.form.is_empty());
}

#[tokio::test]
async fn missing_required_argument_is_a_protocol_error() {
    let executor = FakeExecutor::new(Vec::new());
    let session = session_with(session_key(), endpoints());
    let args = Params::from_pairs([("toid", json!("42"))]).expect("args");

    let err = dispatcher(executor.clone())
        .dispatch(&session, &SEND_MESSAGE, args)
        .await
        .expect_err("missing");
    assert!(matches!(err, ClientError::Protocol(message) if message.contains("message")));
    assert_eq!(executor.calls(), 0);
}

#[test]
fn args_may_not_shadow_session_fields() {
    let session = session_with(session_key(), endpoints());
    let args = Params::from_pairs([("payload", json!(1)), ("uid", json!("spoofed"))]).expect("args");
    assert!(matches!(
        build_params(&session, &ECHO, args),
        Err(ClientError::Protocol(_))
    ));
}

#[tokio::test]
async fn unknown_service_is_a_protocol_error() {
    let executor = FakeExecutor::new(Vec::new());
    let session = session_with(
        session_key(),
        ServiceEndpoints::new().with("profile", vec![url("https://profile.example.com")]),
    );

    let err = dispatcher(executor.clone())
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect_err("unknown service");
    assert!(matches!(err, ClientError::Protocol(_)));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn fails_over_to_next_endpoint_on_transport_error() {
    let executor = FakeExecutor::new(vec![
        Err(ClientError::Transport("connection reset".to_string())),
        Ok(encrypted_ok(&session_key(), json!("pong"))),
    ]);
    let session = session_with(session_key(), endpoints());

    let data = dispatcher(executor.clone())
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect("dispatch");

    assert_eq!(data, json!("pong"));
    let hosts: Vec<_> = executor
        .requests()
        .iter()
        .map(|request| request.url.host_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(hosts, vec!["chat-a.example.com", "chat-b.example.com"]);
}

#[tokio::test]
async fn does_not_fail_over_on_http_status() {
    let executor = FakeExecutor::new(vec![
        Ok(RawResponse {
            status: 500,
            body: Vec::new(),
        }),
        Ok(encrypted_ok(&session_key(), json!("pong"))),
    ]);
    let session = session_with(session_key(), endpoints());

    let err = dispatcher(executor.clone())
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect_err("status");
    assert!(matches!(err, ClientError::HttpStatus { status: 500, .. }));
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn all_endpoints_down_surfaces_the_last_transport_error() {
    let executor = FakeExecutor::new(vec![
        Err(ClientError::Transport("a down".to_string())),
        Err(ClientError::Transport("b down".to_string())),
    ]);
    let session = session_with(session_key(), endpoints());

    let err = dispatcher(executor)
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect_err("down");
    assert!(matches!(err, ClientError::Transport(message) if message == "b down"));
}

#[tokio::test]
async fn outer_error_code_is_a_remote_application_error() {
    let executor = FakeExecutor::new(vec![Ok(RawResponse::json(
        200,
        &json!({"error_code": 114, "error_message": "params invalid", "data": null}),
    ))]);
    let session = session_with(session_key(), endpoints());

    let err = dispatcher(executor)
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect_err("remote");
    assert!(matches!(
        err,
        ClientError::RemoteApplication { code: 114, ref message } if message == "params invalid"
    ));
}

#[tokio::test]
async fn decrypted_error_body_is_a_remote_application_error() {
    let envelope = encrypt(
        &session_key(),
        &json!({"error": {"code": 216, "message": "blocked"}}).to_string(),
    )
    .expect("encrypt");
    let executor = FakeExecutor::new(vec![Ok(RawResponse::json(
        200,
        &json!({"error_code": 0, "error_message": "", "data": envelope.ciphertext}),
    ))]);
    let session = session_with(session_key(), endpoints());

    let err = dispatcher(executor)
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect_err("remote");
    assert!(matches!(err, ClientError::RemoteApplication { code: 216, .. }));
}

#[tokio::test]
async fn response_under_another_key_is_a_decryption_error() {
    let other = KeyMaterial::from_slice(&[1u8; 32]);
    let executor = FakeExecutor::new(vec![Ok(encrypted_ok(&other, json!("pong")))]);
    let session = session_with(session_key(), endpoints());

    let err = dispatcher(executor)
        .dispatch(&session, &ECHO, echo_args())
        .await
        .expect_err("decrypt");
    assert!(matches!(err, ClientError::Decryption(_)));
}

#[tokio::test]
async fn stale_sessions_are_rejected_after_rotation() {
    let executor = FakeExecutor::new(vec![Ok(encrypted_ok(
        &KeyMaterial::from_slice(&[9u8; 32]),
        json!("rotated"),
    ))]);
    let first = Arc::new(session_with(session_key(), endpoints()));
    let cell = SessionCell::new(Arc::clone(&first));
    let second = Arc::new(first.rotated(KeyMaterial::from_slice(&[9u8; 32])));
    cell.rotate(second).expect("rotate");

    let dispatcher = dispatcher(executor.clone());
    let err = dispatcher
        .dispatch_checked(&cell, &first, &ECHO, echo_args())
        .await
        .expect_err("stale");
    assert!(matches!(err, ClientError::Auth(_)));
    assert_eq!(executor.calls(), 0);

    let data = dispatcher
        .dispatch_current(&cell, &ECHO, echo_args())
        .await
        .expect("current session");
    assert_eq!(data, json!("rotated"));
}
