use std::fmt;

use shared::error::ApiError;
use thiserror::Error;

use crate::handshake::HandshakeState;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not authenticated: {0}")]
    Auth(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body is not valid json: {0}")]
    Decode(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("server rejected request (code {code}): {message}")]
    RemoteApplication { code: i64, message: String },
}

impl ClientError {
    /// Only connection-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<ApiError> for ClientError {
    fn from(value: ApiError) -> Self {
        Self::RemoteApplication {
            code: value.code,
            message: value.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    LoginInfo,
    ServerInfo,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoginInfo => f.write_str("login-info"),
            Self::ServerInfo => f.write_str("server-info"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("handshake {phase} phase failed: {source}")]
    Phase {
        phase: HandshakePhase,
        #[source]
        source: ClientError,
    },
    #[error("login rejected: login info was {0}")]
    LoginRejected(&'static str),
    #[error("handshake {phase} response is missing `{field}`")]
    MissingField {
        phase: HandshakePhase,
        field: &'static str,
    },
    #[error("handshake already finished in state {0:?}")]
    AlreadyFinished(HandshakeState),
}

impl BootstrapError {
    pub(crate) fn login_info(source: ClientError) -> Self {
        Self::Phase {
            phase: HandshakePhase::LoginInfo,
            source,
        }
    }

    pub(crate) fn server_info(source: ClientError) -> Self {
        Self::Phase {
            phase: HandshakePhase::ServerInfo,
            source,
        }
    }

    pub fn phase(&self) -> Option<HandshakePhase> {
        match self {
            Self::Phase { phase, .. } | Self::MissingField { phase, .. } => Some(*phase),
            Self::LoginRejected(_) => Some(HandshakePhase::LoginInfo),
            Self::AlreadyFinished(_) => None,
        }
    }

    /// The underlying client error, when the handshake failed on one.
    pub fn cause(&self) -> Option<&ClientError> {
        match self {
            Self::Phase { source, .. } => Some(source),
            _ => None,
        }
    }
}
