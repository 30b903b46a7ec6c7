use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use shared::domain::{AccountId, Credentials};
use tracing::info;
use url::Url;

use crate::{crypto::KeyMaterial, error::ClientError};

/// Logical service name to ordered candidate base URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceEndpoints(BTreeMap<String, Vec<Url>>);

impl ServiceEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: impl Into<String>, urls: Vec<Url>) -> Self {
        self.insert(service, urls);
        self
    }

    pub fn insert(&mut self, service: impl Into<String>, urls: Vec<Url>) {
        if urls.is_empty() {
            return;
        }
        self.0.insert(service.into(), urls);
    }

    /// Parses the wire service map; services whose URL list is empty are dropped.
    pub fn from_wire(map: &BTreeMap<String, Vec<String>>) -> Result<Self, ClientError> {
        let mut endpoints = Self::new();
        for (service, raw_urls) in map {
            let urls = raw_urls
                .iter()
                .map(|raw| {
                    Url::parse(raw).map_err(|err| {
                        ClientError::Protocol(format!(
                            "invalid endpoint `{raw}` for service `{service}`: {err}"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            endpoints.insert(service.clone(), urls);
        }
        Ok(endpoints)
    }

    pub fn get(&self, service: &str) -> Option<&[Url]> {
        self.0.get(service).map(Vec::as_slice)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

fn next_instance() -> u64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// The product of a successful handshake. Read-only; share it as `Arc<Session>`.
///
/// Every constructed session carries a process-unique `instance`, so two
/// sessions are never mistaken for one another even at the same generation.
#[derive(Debug)]
pub struct Session {
    instance: u64,
    identity: AccountId,
    session_key: KeyMaterial,
    service_endpoints: ServiceEndpoints,
    protocol_version: u32,
    client_type: u32,
    generation: u64,
    credentials: Arc<Credentials>,
}

impl Session {
    pub fn new(
        identity: AccountId,
        session_key: KeyMaterial,
        service_endpoints: ServiceEndpoints,
        credentials: Arc<Credentials>,
    ) -> Self {
        Self {
            instance: next_instance(),
            identity,
            session_key,
            service_endpoints,
            protocol_version: 0,
            client_type: 0,
            generation: 0,
            credentials,
        }
    }

    pub fn with_protocol(mut self, protocol_version: u32, client_type: u32) -> Self {
        self.protocol_version = protocol_version;
        self.client_type = client_type;
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// A key rotation never touches this session; it produces the next one.
    pub fn rotated(&self, session_key: KeyMaterial) -> Self {
        Self {
            instance: next_instance(),
            identity: self.identity.clone(),
            session_key,
            service_endpoints: self.service_endpoints.clone(),
            protocol_version: self.protocol_version,
            client_type: self.client_type,
            generation: self.generation + 1,
            credentials: Arc::clone(&self.credentials),
        }
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn identity(&self) -> &AccountId {
        &self.identity
    }

    pub fn session_key(&self) -> &KeyMaterial {
        &self.session_key
    }

    /// The session key, or `Auth` when it is missing or unusable.
    pub fn require_key(&self) -> Result<&KeyMaterial, ClientError> {
        if self.session_key.is_empty() {
            return Err(ClientError::Auth("session has no session key".to_string()));
        }
        if !self.session_key.is_usable() {
            return Err(ClientError::Auth("session key is malformed".to_string()));
        }
        Ok(&self.session_key)
    }

    pub fn service_endpoints(&self) -> &ServiceEndpoints {
        &self.service_endpoints
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn client_type(&self) -> u32 {
        self.client_type
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

/// Holds the session new calls should use. Rotation swaps the reference;
/// calls already in flight keep the session they captured.
pub struct SessionCell {
    current: RwLock<Arc<Session>>,
}

impl SessionCell {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            current: RwLock::new(session),
        }
    }

    pub fn current(&self) -> Arc<Session> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    /// Swaps in a session derived from the current one. Its generation must be
    /// strictly greater.
    pub fn rotate(&self, next: Arc<Session>) -> Result<(), ClientError> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if next.instance() == guard.instance() || next.generation() <= guard.generation() {
            return Err(ClientError::Auth(format!(
                "refusing to rotate to generation {} from {}",
                next.generation(),
                guard.generation()
            )));
        }
        info!(
            identity = %next.identity(),
            from = guard.generation(),
            to = next.generation(),
            "session: rotated"
        );
        *guard = next;
        Ok(())
    }

    /// Installs an independently bootstrapped session, stamping it with the
    /// generation after the current one.
    pub fn install(&self, next: Session) -> Arc<Session> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = guard.generation() + 1;
        let next = Arc::new(next.with_generation(generation));
        info!(
            identity = %next.identity(),
            from = guard.generation(),
            to = generation,
            "session: installed fresh session"
        );
        *guard = Arc::clone(&next);
        next
    }

    /// Rejects any session other than the one currently held.
    pub fn ensure_current(&self, session: &Session) -> Result<(), ClientError> {
        let current = self.current();
        if session.instance() != current.instance() {
            return Err(ClientError::Auth(format!(
                "stale session generation {} (current is {})",
                session.generation(),
                current.generation()
            )));
        }
        Ok(())
    }
}
