use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use shared::domain::{AccountId, Credentials};
use tokio::net::TcpListener;
use url::Url;

use crate::{
    crypto::{derive_ephemeral_key, KeyMaterial, Params, Signer},
    envelope::{decrypt_json, encrypt, EncryptedEnvelope},
    error::ClientError,
    handshake::{LOGIN_INFO_PATH, SERVER_INFO_PATH},
    session::{ServiceEndpoints, Session},
    settings::ClientSettings,
    transport::{HttpExecutor, HttpRequest, RawResponse},
};

pub(crate) const SESSION_KEY: [u8; 32] = [0x42; 32];
pub(crate) const TEST_UID: &str = "100200300";
pub(crate) const DEVICE_ID: &str = "3f1c2a8e-device";

pub(crate) fn session_key() -> KeyMaterial {
    KeyMaterial::from_slice(&SESSION_KEY)
}

pub(crate) fn credentials() -> Credentials {
    Credentials::new(DEVICE_ID)
        .with_cookie_jar(shared::domain::CookieJar::parse("zpw_sek=abc123; zpsid=xyz"))
        .with_language_tag("vi")
}

pub(crate) fn url(raw: &str) -> Url {
    Url::parse(raw).expect("test url")
}

pub(crate) fn session_with(key: KeyMaterial, endpoints: ServiceEndpoints) -> Session {
    Session::new(
        AccountId::new(TEST_UID),
        key,
        endpoints,
        Arc::new(credentials()),
    )
    .with_protocol(645, 30)
}

/// Fast retry and reconnect timings for tests.
pub(crate) fn test_settings(login_base_url: &str) -> ClientSettings {
    ClientSettings {
        login_base_url: login_base_url.to_string(),
        request_timeout_ms: 2_000,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 40,
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        connect_timeout_ms: 2_000,
        heartbeat_interval_ms: 60_000,
        ..ClientSettings::default()
    }
}

/// Successful operation response whose decrypted body carries `data`.
pub(crate) fn encrypted_ok(key: &KeyMaterial, data: Value) -> RawResponse {
    let envelope = encrypt(key, &json!({ "data": data }).to_string()).expect("encrypt response");
    RawResponse::json(
        200,
        &json!({ "error_code": 0, "error_message": "", "data": envelope.ciphertext }),
    )
}

/// Scripted executor: pops one canned outcome per call and records requests.
pub(crate) struct FakeExecutor {
    outcomes: Mutex<VecDeque<Result<RawResponse, ClientError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    calls: AtomicUsize,
}

impl FakeExecutor {
    pub(crate) fn new(outcomes: Vec<Result<RawResponse, ClientError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl HttpExecutor for FakeExecutor {
    async fn execute(&self, request: &HttpRequest) -> Result<RawResponse, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.outcomes.lock().expect("outcomes lock").pop_front();
        next.unwrap_or_else(|| Err(ClientError::Transport("no scripted response left".to_string())))
    }
}

/// Executor that never answers, for timeout tests.
pub(crate) struct HangingExecutor;

#[async_trait]
impl HttpExecutor for HangingExecutor {
    async fn execute(&self, _request: &HttpRequest) -> Result<RawResponse, ClientError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ClientError::Transport("unreachable".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginMode {
    Accept,
    NullData,
    EncryptedNull,
    Reject,
}

#[derive(Clone)]
pub(crate) struct PlatformState {
    pub(crate) base_url: String,
    pub(crate) login_mode: LoginMode,
    pub(crate) signer: Signer,
    pub(crate) login_calls: Arc<AtomicUsize>,
    pub(crate) server_info_calls: Arc<AtomicUsize>,
    pub(crate) echo_calls: Arc<AtomicUsize>,
    pub(crate) cookies: Arc<Mutex<Vec<String>>>,
}

pub(crate) struct FakePlatform {
    pub(crate) base_url: String,
    pub(crate) state: PlatformState,
}

/// Minimal stand-in for the platform: verifies signatures, decrypts params
/// and answers the two handshake calls plus `echo`.
pub(crate) async fn spawn_platform(login_mode: LoginMode) -> Result<FakePlatform> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let state = PlatformState {
        base_url: base_url.clone(),
        login_mode,
        signer: Signer::default(),
        login_calls: Arc::new(AtomicUsize::new(0)),
        server_info_calls: Arc::new(AtomicUsize::new(0)),
        echo_calls: Arc::new(AtomicUsize::new(0)),
        cookies: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route(LOGIN_INFO_PATH, get(login_info))
        .route(SERVER_INFO_PATH, get(server_info))
        .route("/api/echo", post(echo))
        .with_state(state.clone());

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(FakePlatform { base_url, state })
}

fn rejected(code: i64, message: &str) -> Json<Value> {
    Json(json!({ "error_code": code, "error_message": message, "data": null }))
}

async fn login_info(
    State(state): State<PlatformState>,
    headers: axum::http::HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.login_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(cookie) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
        state.cookies.lock().expect("cookies lock").push(cookie.to_string());
    }

    let imei = query.get("imei").cloned().unwrap_or_default();
    let ts: i64 = query
        .get("ts")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    let key = derive_ephemeral_key(&imei, ts).expect("ephemeral key");
    let ciphertext = query.get("params").cloned().unwrap_or_default();
    let params: Value =
        decrypt_json(&key, &EncryptedEnvelope::from_wire(ciphertext)).expect("decrypt login params");
    let params = Params::from_json(params).expect("params object");
    let expected = state
        .signer
        .sign("getlogininfo", &params, &[])
        .expect("sign login params");
    if query.get("signkey").map(String::as_str) != Some(expected.as_str()) {
        return rejected(-14, "invalid signature");
    }

    let data = match state.login_mode {
        LoginMode::Accept => {
            let body = json!({ "uid": TEST_UID, "display_name": "Fake Account" });
            Value::String(encrypt(&key, &body.to_string()).expect("encrypt").ciphertext)
        }
        LoginMode::EncryptedNull => {
            Value::String(encrypt(&key, "null").expect("encrypt").ciphertext)
        }
        LoginMode::NullData => Value::Null,
        LoginMode::Reject => return rejected(105, "device not allowed"),
    };
    Json(json!({ "error_code": 0, "error_message": "", "data": data }))
}

async fn server_info(
    State(state): State<PlatformState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.server_info_calls.fetch_add(1, Ordering::SeqCst);

    let params = Params::from_pairs(
        query
            .iter()
            .filter(|(key, _)| key.as_str() != "signkey")
            .map(|(key, value)| (key.clone(), Value::String(value.clone()))),
    )
    .expect("server info params");
    let expected = state
        .signer
        .sign("getserverinfo", &params, &[])
        .expect("sign server info params");
    if query.get("signkey").map(String::as_str) != Some(expected.as_str()) {
        return rejected(-14, "invalid signature");
    }

    let ws_base = state.base_url.replacen("http://", "ws://", 1);
    Json(json!({
        "error_code": 0,
        "error_message": "",
        "data": {
            "session_key": STANDARD.encode(SESSION_KEY),
            "service_map": {
                "chat": [state.base_url],
                "realtime": [format!("{ws_base}/ws")],
            },
        },
    }))
}

async fn echo(
    State(state): State<PlatformState>,
    Query(query): Query<HashMap<String, String>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    state.echo_calls.fetch_add(1, Ordering::SeqCst);
    let key = session_key();

    let ciphertext = form.get("params").cloned().unwrap_or_default();
    let params: Value =
        decrypt_json(&key, &EncryptedEnvelope::from_wire(ciphertext)).expect("decrypt echo params");
    let params = Params::from_json(params).expect("params object");
    let expected = state
        .signer
        .sign("echo", &params, &["payload"])
        .expect("sign echo params");
    if query.get("signkey").map(String::as_str) != Some(expected.as_str()) {
        return rejected(-14, "invalid signature");
    }

    let body = json!({
        "data": {
            "payload": params.get("payload").cloned().unwrap_or(Value::Null),
            "uid": params.get("uid").cloned().unwrap_or(Value::Null),
        }
    });
    let envelope = encrypt(&key, &body.to_string()).expect("encrypt echo response");
    Json(json!({ "error_code": 0, "error_message": "", "data": envelope.ciphertext }))
}
