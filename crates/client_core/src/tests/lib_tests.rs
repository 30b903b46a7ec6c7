use super::*;
use std::sync::atomic::Ordering;

use serde_json::json;

use crate::{
    operations::ECHO,
    test_support::{credentials, spawn_platform, test_settings, LoginMode, SESSION_KEY, TEST_UID},
};

#[tokio::test]
async fn bootstrap_then_echo_round_trips_through_the_platform() {
    let platform = spawn_platform(LoginMode::Accept).await.expect("spawn platform");
    let client = ProtocolClient::new(test_settings(&platform.base_url)).expect("client");

    let session = client.bootstrap(credentials()).await.expect("bootstrap");
    assert_eq!(session.identity().as_str(), TEST_UID);
    assert_eq!(session.session_key().as_bytes(), &SESSION_KEY);
    assert!(!session.service_endpoints().is_empty());
    assert!(session.service_endpoints().get("realtime").is_some());

    let args = Params::from_pairs([("payload", json!({"text": "ping", "n": 1}))]).expect("args");
    let data = client.dispatch(&session, &ECHO, args).await.expect("echo");
    assert_eq!(
        data,
        json!({"payload": {"text": "ping", "n": 1}, "uid": TEST_UID})
    );

    assert_eq!(platform.state.login_calls.load(Ordering::SeqCst), 1);
    assert_eq!(platform.state.server_info_calls.load(Ordering::SeqCst), 1);
    assert_eq!(platform.state.echo_calls.load(Ordering::SeqCst), 1);
    let cookies = platform.state.cookies.lock().expect("cookies lock").clone();
    assert_eq!(cookies, vec!["zpw_sek=abc123; zpsid=xyz".to_string()]);
}

#[tokio::test]
async fn rebootstrap_replaces_the_current_session() {
    let platform = spawn_platform(LoginMode::Accept).await.expect("spawn platform");
    let client = ProtocolClient::new(test_settings(&platform.base_url)).expect("client");

    let first = client.bootstrap(credentials()).await.expect("first bootstrap");
    let cell = SessionCell::new(Arc::clone(&first));
    let second = client
        .rebootstrap(&cell, credentials())
        .await
        .expect("second bootstrap");

    assert_eq!(second.generation(), first.generation() + 1);
    assert!(Arc::ptr_eq(&cell.current(), &second));
    assert!(matches!(cell.ensure_current(&first), Err(ClientError::Auth(_))));
    cell.ensure_current(&second).expect("second session is current");
    assert_eq!(platform.state.login_calls.load(Ordering::SeqCst), 2);

    let args = Params::from_pairs([("payload", json!("again"))]).expect("args");
    let err = client
        .dispatcher()
        .dispatch_checked(&cell, &first, &ECHO, args.clone())
        .await
        .expect_err("stale");
    assert!(matches!(err, ClientError::Auth(_)));
    let data = client
        .dispatcher()
        .dispatch_current(&cell, &ECHO, args)
        .await
        .expect("echo with current session");
    assert_eq!(data["payload"], json!("again"));
}

#[tokio::test]
async fn null_login_info_yields_no_session() {
    for mode in [LoginMode::NullData, LoginMode::EncryptedNull] {
        let platform = spawn_platform(mode).await.expect("spawn platform");
        let client = ProtocolClient::new(test_settings(&platform.base_url)).expect("client");

        let err = client.bootstrap(credentials()).await.expect_err("rejected");
        assert!(matches!(err, BootstrapError::LoginRejected(_)), "{mode:?}: {err}");
        assert_eq!(platform.state.server_info_calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn platform_rejection_is_reported_with_its_code() {
    let platform = spawn_platform(LoginMode::Reject).await.expect("spawn platform");
    let client = ProtocolClient::new(test_settings(&platform.base_url)).expect("client");

    let err = client.bootstrap(credentials()).await.expect_err("rejected");
    assert_eq!(err.phase(), Some(HandshakePhase::LoginInfo));
    assert!(matches!(
        err.cause(),
        Some(ClientError::RemoteApplication { code: 105, .. })
    ));
}

#[tokio::test]
async fn signing_secret_mismatch_is_rejected_by_the_platform() {
    let platform = spawn_platform(LoginMode::Accept).await.expect("spawn platform");
    let settings = ClientSettings {
        signing_secret: "wrong-secret".into(),
        ..test_settings(&platform.base_url)
    };
    let client = ProtocolClient::new(settings).expect("client");

    let err = client.bootstrap(credentials()).await.expect_err("bad signature");
    assert!(matches!(
        err.cause(),
        Some(ClientError::RemoteApplication { code: -14, .. })
    ));
}

#[tokio::test]
async fn unreachable_login_host_is_a_transport_failure() {
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base = format!("http://{}", unused.local_addr().expect("addr"));
    drop(unused);
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");

    let client = ProtocolClient::new(test_settings(&base)).expect("client");
    let err = client.bootstrap(credentials()).await.expect_err("unreachable");
    assert!(matches!(err.cause(), Some(ClientError::Transport(_))));
}

#[tokio::test]
async fn listener_is_built_from_the_bootstrapped_session() {
    let platform = spawn_platform(LoginMode::Accept).await.expect("spawn platform");
    let client = ProtocolClient::new(test_settings(&platform.base_url)).expect("client");
    let session = client.bootstrap(credentials()).await.expect("bootstrap");

    let listener = client.listener(session).expect("listener");
    let _subscription = listener.subscribe();
}
