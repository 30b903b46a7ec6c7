use std::{collections::BTreeMap, fmt};

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::ClientError;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_KEY_LEN: usize = 16;
pub const EPHEMERAL_KEY_LEN: usize = 32;
pub const DEFAULT_SIGNING_SECRET: &str = "chatlink/request-signing/v1";
const EPHEMERAL_INFO_PREFIX: &[u8] = b"chatlink/ephemeral-login/v1";
/// Deterministic application salt for ephemeral login key derivation.
const EPHEMERAL_APP_SALT: &[u8] = b"chatlink/ephemeral-app-salt";

/// Owned symmetric key bytes, wiped on drop.
#[derive(Clone, Default)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_usable(&self) -> bool {
        self.0.len() >= MIN_KEY_LEN
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial(<{} bytes>)", self.0.len())
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Key for the pre-auth login-info call only. Same inputs always give the same key.
pub fn derive_ephemeral_key(
    device_id: &str,
    launch_timestamp: i64,
) -> Result<KeyMaterial, ClientError> {
    if device_id.is_empty() {
        return Err(ClientError::Encryption(
            "device id must not be empty".to_string(),
        ));
    }

    let mut info = build_ephemeral_info(launch_timestamp);
    let hk = Hkdf::<Sha256>::new(Some(EPHEMERAL_APP_SALT), device_id.as_bytes());
    let mut okm = vec![0u8; EPHEMERAL_KEY_LEN];
    let expanded = hk.expand(&info, &mut okm);
    info.zeroize();
    if expanded.is_err() {
        okm.zeroize();
        return Err(ClientError::Encryption(
            "hkdf expansion failed".to_string(),
        ));
    }

    Ok(KeyMaterial::new(okm))
}

fn build_ephemeral_info(launch_timestamp: i64) -> Vec<u8> {
    let mut info = Vec::with_capacity(EPHEMERAL_INFO_PREFIX.len() + 1 + 8);
    info.extend_from_slice(EPHEMERAL_INFO_PREFIX);
    info.push(0);
    info.extend_from_slice(&launch_timestamp.to_be_bytes());
    info
}

/// Request parameters in canonical (lexicographic key) order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut params = Self::new();
        for (key, value) in pairs {
            params.insert(key, value)?;
        }
        Ok(params)
    }

    /// Builds params from a JSON object; anything else is a protocol error.
    pub fn from_json(value: Value) -> Result<Self, ClientError> {
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            Value::Null => Ok(Self::new()),
            other => Err(ClientError::Protocol(format!(
                "params must be a json object, got {other}"
            ))),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), ClientError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ClientError::Protocol("param key must not be empty".to_string()));
        }
        if self.0.contains_key(&key) {
            return Err(ClientError::Protocol(format!("duplicate param key `{key}`")));
        }
        self.0.insert(key, value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
        )
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// Flat `key=value` pairs for unencrypted query strings.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(key, value)| (key.clone(), canonical_value(value)))
            .collect()
    }
}

fn canonical_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic keyed signature over `operation_type` and the canonical params,
/// each field framed by its big-endian `u64` length.
///
/// Every key in `required_keys` must be present; a request is never signed
/// with missing fields.
pub fn compute_signature(
    signing_secret: &[u8],
    operation_type: &str,
    params: &Params,
    required_keys: &[&str],
) -> Result<Signature, ClientError> {
    if operation_type.is_empty() {
        return Err(ClientError::Protocol(
            "operation type must not be empty".to_string(),
        ));
    }
    if let Some(missing) = required_keys.iter().find(|key| !params.contains_key(key)) {
        return Err(ClientError::Protocol(format!(
            "cannot sign `{operation_type}`: missing required param `{missing}`"
        )));
    }

    let mut mac = HmacSha256::new_from_slice(signing_secret)
        .map_err(|_| ClientError::Protocol("invalid signing secret".to_string()))?;
    update_framed(&mut mac, operation_type.as_bytes());
    for (key, value) in params.iter() {
        update_framed(&mut mac, key.as_bytes());
        update_framed(&mut mac, canonical_value(value).as_bytes());
    }

    Ok(Signature(hex::encode(mac.finalize().into_bytes())))
}

/// Length-prefixed so no choice of keys or values can shift a field boundary.
fn update_framed(mac: &mut HmacSha256, bytes: &[u8]) {
    mac.update(&(bytes.len() as u64).to_be_bytes());
    mac.update(bytes);
}

#[derive(Clone)]
pub struct Signer {
    secret: KeyMaterial,
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: KeyMaterial::from_slice(secret.as_ref()),
        }
    }

    pub fn sign(
        &self,
        operation_type: &str,
        params: &Params,
        required_keys: &[&str],
    ) -> Result<Signature, ClientError> {
        compute_signature(self.secret.as_bytes(), operation_type, params, required_keys)
    }

    pub fn signed_context(
        &self,
        operation_type: &str,
        params: Params,
        required_keys: &[&str],
    ) -> Result<SignedRequestContext, ClientError> {
        let signature = self.sign(operation_type, &params, required_keys)?;
        Ok(SignedRequestContext {
            operation_type: operation_type.to_string(),
            params,
            signature,
        })
    }
}

impl Default for Signer {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNING_SECRET)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedRequestContext {
    pub operation_type: String,
    pub params: Params,
    pub signature: Signature,
}

#[cfg(test)]
#[path = "tests/crypto_tests.rs"]
mod tests;
