use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use shared::{
    domain::Credentials,
    protocol::{LoginInfo, ResponseEnvelope, ServerInfo},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    crypto::{derive_ephemeral_key, KeyMaterial, Params, Signer},
    envelope::{decrypt_json, encrypt, EncryptedEnvelope},
    error::{BootstrapError, ClientError, HandshakePhase},
    session::{ServiceEndpoints, Session},
    transport::{join_path, HttpRequest, Transport},
};

pub const LOGIN_INFO_PATH: &str = "/api/login/getLoginInfo";
pub const SERVER_INFO_PATH: &str = "/api/login/getServerInfo";
pub const LOGIN_INFO_OPERATION: &str = "getlogininfo";
pub const SERVER_INFO_OPERATION: &str = "getserverinfo";
const LOGIN_INFO_PARAMS: &[&str] = &["computer_name", "imei", "language", "ts"];
const SERVER_INFO_PARAMS: &[&str] = &["client_version", "computer_name", "imei", "type"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    AwaitingLoginInfo,
    AwaitingServerInfo,
    Bootstrapped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub login_base_url: Url,
    pub protocol_version: u32,
    pub client_type: u32,
    pub computer_name: String,
}

/// Runs the two-phase login once. A failed handshake is terminal; retrying
/// means building a new `Bootstrapper`.
pub struct Bootstrapper {
    transport: Arc<Transport>,
    signer: Signer,
    config: HandshakeConfig,
    launch_timestamp: i64,
    state: HandshakeState,
}

impl Bootstrapper {
    pub fn new(transport: Arc<Transport>, signer: Signer, config: HandshakeConfig) -> Self {
        Self {
            transport,
            signer,
            config,
            launch_timestamp: chrono::Utc::now().timestamp_millis(),
            state: HandshakeState::Start,
        }
    }

    pub fn with_launch_timestamp(mut self, launch_timestamp: i64) -> Self {
        self.launch_timestamp = launch_timestamp;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub async fn bootstrap(&mut self, credentials: Credentials) -> Result<Session, BootstrapError> {
        if self.state != HandshakeState::Start {
            return Err(BootstrapError::AlreadyFinished(self.state));
        }

        match self.run(credentials).await {
            Ok(session) => {
                self.transition(HandshakeState::Bootstrapped);
                info!(
                    identity = %session.identity(),
                    services = session.service_endpoints().len(),
                    "handshake: session bootstrapped"
                );
                Ok(session)
            }
            Err(err) => {
                self.transition(HandshakeState::Failed);
                warn!(error = %err, "handshake: failed");
                Err(err)
            }
        }
    }

    async fn run(&mut self, credentials: Credentials) -> Result<Session, BootstrapError> {
        self.transition(HandshakeState::AwaitingLoginInfo);
        let login_info = self.fetch_login_info(&credentials).await?;

        self.transition(HandshakeState::AwaitingServerInfo);
        let server_info = self.fetch_server_info(&credentials).await?;

        let key_bytes = STANDARD
            .decode(server_info.session_key.trim())
            .map_err(|err| {
                BootstrapError::server_info(ClientError::Protocol(format!(
                    "session key is not valid base64: {err}"
                )))
            })?;
        let session_key = KeyMaterial::new(key_bytes);
        if session_key.is_empty() {
            return Err(BootstrapError::MissingField {
                phase: HandshakePhase::ServerInfo,
                field: "session_key",
            });
        }
        if !session_key.is_usable() {
            return Err(BootstrapError::server_info(ClientError::Protocol(format!(
                "session key of {} bytes is too short",
                session_key.len()
            ))));
        }

        let service_endpoints =
            ServiceEndpoints::from_wire(&server_info.service_map).map_err(BootstrapError::server_info)?;
        if service_endpoints.is_empty() {
            return Err(BootstrapError::MissingField {
                phase: HandshakePhase::ServerInfo,
                field: "service_map",
            });
        }

        Ok(Session::new(
            login_info.uid,
            session_key,
            service_endpoints,
            Arc::new(credentials),
        )
        .with_protocol(self.config.protocol_version, self.config.client_type))
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(from = ?self.state, to = ?next, "handshake: state transition");
        self.state = next;
    }

    async fn fetch_login_info(&self, credentials: &Credentials) -> Result<LoginInfo, BootstrapError> {
        let ephemeral_key = derive_ephemeral_key(&credentials.device_id, self.launch_timestamp)
            .map_err(BootstrapError::login_info)?;

        let params = Params::from_pairs([
            ("computer_name", Value::from(self.config.computer_name.clone())),
            ("imei", Value::from(credentials.device_id.clone())),
            ("language", Value::from(credentials.language_tag.clone())),
            ("ts", Value::from(self.launch_timestamp)),
        ])
        .map_err(BootstrapError::login_info)?;
        let signature = self
            .signer
            .sign(LOGIN_INFO_OPERATION, &params, LOGIN_INFO_PARAMS)
            .map_err(BootstrapError::login_info)?;
        let envelope =
            encrypt(&ephemeral_key, &params.to_json_string()).map_err(BootstrapError::login_info)?;

        let url = join_path(&self.config.login_base_url, LOGIN_INFO_PATH)
            .map_err(BootstrapError::login_info)?;
        let request = HttpRequest::get(url)
            .with_headers(credentials.identity_headers())
            .with_query("imei", &credentials.device_id)
            .with_query("type", self.config.client_type)
            .with_query("client_version", self.config.protocol_version)
            .with_query("ts", self.launch_timestamp)
            .with_query("enc_ver", envelope.encoding_version.as_u8())
            .with_query("params", &envelope.ciphertext)
            .with_query("signkey", signature.as_str());

        let body = self
            .transport
            .send(&request)
            .await
            .map_err(BootstrapError::login_info)?;
        let data = unwrap_response(body).map_err(BootstrapError::login_info)?;

        let ciphertext = match data {
            None => return Err(BootstrapError::LoginRejected("null")),
            Some(Value::String(ciphertext)) => ciphertext,
            Some(_) => {
                return Err(BootstrapError::login_info(ClientError::Protocol(
                    "login info data is not an envelope".to_string(),
                )))
            }
        };

        let decrypted: Value = decrypt_json(&ephemeral_key, &EncryptedEnvelope::new(ciphertext, envelope.encoding_version))
            .map_err(BootstrapError::login_info)?;
        match decrypted {
            Value::Null => Err(BootstrapError::LoginRejected("null")),
            Value::Object(map) => {
                if !map.contains_key("uid") {
                    return Err(BootstrapError::MissingField {
                        phase: HandshakePhase::LoginInfo,
                        field: "uid",
                    });
                }
                serde_json::from_value(Value::Object(map)).map_err(|err| {
                    BootstrapError::login_info(ClientError::Protocol(format!(
                        "malformed login info: {err}"
                    )))
                })
            }
            _ => Err(BootstrapError::LoginRejected("not an object")),
        }
    }

    async fn fetch_server_info(&self, credentials: &Credentials) -> Result<ServerInfo, BootstrapError> {
        let params = Params::from_pairs([
            ("client_version", Value::from(self.config.protocol_version)),
            ("computer_name", Value::from(self.config.computer_name.clone())),
            ("imei", Value::from(credentials.device_id.clone())),
            ("type", Value::from(self.config.client_type)),
        ])
        .map_err(BootstrapError::server_info)?;
        let signature = self
            .signer
            .sign(SERVER_INFO_OPERATION, &params, SERVER_INFO_PARAMS)
            .map_err(BootstrapError::server_info)?;

        let url = join_path(&self.config.login_base_url, SERVER_INFO_PATH)
            .map_err(BootstrapError::server_info)?;
        let mut request = HttpRequest::get(url).with_headers(credentials.identity_headers());
        for (key, value) in params.to_query_pairs() {
            request = request.with_query(key, value);
        }
        let request = request.with_query("signkey", signature.as_str());

        let body = self
            .transport
            .send(&request)
            .await
            .map_err(BootstrapError::server_info)?;
        let data = unwrap_response(body)
            .map_err(BootstrapError::server_info)?
            .ok_or(BootstrapError::MissingField {
                phase: HandshakePhase::ServerInfo,
                field: "data",
            })?;

        serde_json::from_value(data).map_err(|err| {
            BootstrapError::server_info(ClientError::Protocol(format!("malformed server info: {err}")))
        })
    }
}

fn unwrap_response(body: Value) -> Result<Option<Value>, ClientError> {
    let envelope: ResponseEnvelope = serde_json::from_value(body)
        .map_err(|err| ClientError::Protocol(format!("unexpected response shape: {err}")))?;
    envelope.into_result().map_err(ClientError::from)
}

#[cfg(test)]
#[path = "tests/handshake_tests.rs"]
mod tests;
