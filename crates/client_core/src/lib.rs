use std::sync::Arc;

use serde_json::Value;
use shared::domain::Credentials;
use tracing::info;

pub mod backoff;
pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod operations;
pub mod session;
pub mod settings;
pub mod transport;

pub use crypto::{KeyMaterial, Params, Signer};
pub use dispatch::Dispatcher;
pub use error::{BootstrapError, ClientError, HandshakePhase};
pub use handshake::{Bootstrapper, HandshakeConfig, HandshakeState};
pub use listener::{
    ConnectionState, Listener, ListenerConfig, ListenerEvent, ListenerHandle, Subscription,
};
pub use operations::OperationSpec;
pub use session::{ServiceEndpoints, Session, SessionCell};
pub use settings::{load_settings, ClientSettings};
pub use transport::{HttpExecutor, ReqwestExecutor, RetryPolicy, Transport};

/// Entry point for hosting applications: bootstrap once, then dispatch
/// operations and listen for events against the resulting session.
pub struct ProtocolClient {
    settings: ClientSettings,
    transport: Arc<Transport>,
    signer: Signer,
    dispatcher: Dispatcher,
}

impl ProtocolClient {
    pub fn new(settings: ClientSettings) -> Result<Self, ClientError> {
        let executor = ReqwestExecutor::new(settings.retry_policy().request_timeout)?;
        Ok(Self::with_executor(settings, Arc::new(executor)))
    }

    pub fn with_executor(settings: ClientSettings, executor: Arc<dyn HttpExecutor>) -> Self {
        let transport = Arc::new(Transport::new(executor, settings.retry_policy()));
        let signer = Signer::new(settings.signing_secret.as_bytes());
        let dispatcher = Dispatcher::new(Arc::clone(&transport), signer.clone());
        Self {
            settings,
            transport,
            signer,
            dispatcher,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Runs a fresh handshake. Each call starts from scratch.
    pub async fn bootstrap(&self, credentials: Credentials) -> Result<Arc<Session>, BootstrapError> {
        self.handshake(credentials).await.map(Arc::new)
    }

    /// Runs a fresh handshake and installs the result in `cell` as the next
    /// generation. The previously held session becomes stale.
    pub async fn rebootstrap(
        &self,
        cell: &SessionCell,
        credentials: Credentials,
    ) -> Result<Arc<Session>, BootstrapError> {
        let session = self.handshake(credentials).await?;
        Ok(cell.install(session))
    }

    async fn handshake(&self, credentials: Credentials) -> Result<Session, BootstrapError> {
        let config = self
            .settings
            .handshake_config()
            .map_err(BootstrapError::login_info)?;
        info!(login_base_url = %config.login_base_url, "client: bootstrapping session");
        let mut bootstrapper =
            Bootstrapper::new(Arc::clone(&self.transport), self.signer.clone(), config);
        bootstrapper.bootstrap(credentials).await
    }

    pub async fn dispatch(
        &self,
        session: &Session,
        spec: &OperationSpec,
        args: Params,
    ) -> Result<Value, ClientError> {
        self.dispatcher.dispatch(session, spec, args).await
    }

    /// A listener for `session`, not yet running. Subscribe, then `spawn`.
    pub fn listener(&self, session: Arc<Session>) -> Result<Listener, ClientError> {
        Listener::new(session, self.settings.listener_config())
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
