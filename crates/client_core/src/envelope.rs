use aes::Aes256;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{crypto::KeyMaterial, error::ClientError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const MAX_PLAINTEXT_BYTES: usize = 4 * 1024 * 1024;
const BLOCK_LEN: usize = 16;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const SUBKEY_LEN: usize = 32;
const SUBKEY_SALT: &[u8] = b"chatlink/envelope-subkeys";
const ENCRYPTION_INFO: &[u8] = b"chatlink/envelope/aes-256-cbc";
const MAC_INFO: &[u8] = b"chatlink/envelope/hmac-sha256";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingVersion {
    /// AES-256-CBC + PKCS#7 under a random IV, then HMAC-SHA256 over version, IV and ciphertext.
    #[default]
    CbcHmacV1,
}

impl EncodingVersion {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::CbcHmacV1 => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::CbcHmacV1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub ciphertext: String,
    pub encoding_version: EncodingVersion,
}

impl EncryptedEnvelope {
    pub fn new(ciphertext: impl Into<String>, encoding_version: EncodingVersion) -> Self {
        Self {
            ciphertext: ciphertext.into(),
            encoding_version,
        }
    }

    /// Envelope received on the wire with the default encoding.
    pub fn from_wire(ciphertext: impl Into<String>) -> Self {
        Self::new(ciphertext, EncodingVersion::default())
    }
}

struct SubKeys {
    encryption: [u8; SUBKEY_LEN],
    mac: [u8; SUBKEY_LEN],
}

impl Drop for SubKeys {
    fn drop(&mut self) {
        self.encryption.zeroize();
        self.mac.zeroize();
    }
}

fn derive_subkeys(key: &KeyMaterial) -> Option<SubKeys> {
    if !key.is_usable() {
        return None;
    }
    let hk = Hkdf::<Sha256>::new(Some(SUBKEY_SALT), key.as_bytes());
    let mut subkeys = SubKeys {
        encryption: [0u8; SUBKEY_LEN],
        mac: [0u8; SUBKEY_LEN],
    };
    hk.expand(ENCRYPTION_INFO, &mut subkeys.encryption).ok()?;
    hk.expand(MAC_INFO, &mut subkeys.mac).ok()?;
    Some(subkeys)
}

fn mac_for(subkeys: &SubKeys, signed: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(&subkeys.mac).ok()?;
    mac.update(signed);
    Some(mac)
}

pub fn encrypt(key: &KeyMaterial, plaintext: &str) -> Result<EncryptedEnvelope, ClientError> {
    if plaintext.len() > MAX_PLAINTEXT_BYTES {
        return Err(ClientError::Encryption(format!(
            "plaintext of {} bytes exceeds the {MAX_PLAINTEXT_BYTES} byte ceiling",
            plaintext.len()
        )));
    }
    let subkeys = derive_subkeys(key).ok_or_else(|| {
        ClientError::Encryption(format!(
            "key is empty or shorter than {} bytes",
            crate::crypto::MIN_KEY_LEN
        ))
    })?;

    let version = EncodingVersion::default();
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(&subkeys.encryption, &iv)
        .map_err(|_| ClientError::Encryption("invalid cipher key length".to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut wire = Vec::with_capacity(1 + IV_LEN + ciphertext.len() + TAG_LEN);
    wire.push(version.as_u8());
    wire.extend_from_slice(&iv);
    wire.extend_from_slice(&ciphertext);

    let tag = mac_for(&subkeys, &wire)
        .ok_or_else(|| ClientError::Encryption("invalid mac key length".to_string()))?
        .finalize()
        .into_bytes();
    wire.extend_from_slice(&tag);

    Ok(EncryptedEnvelope::new(URL_SAFE_NO_PAD.encode(wire), version))
}

pub fn encrypt_json<T: Serialize>(key: &KeyMaterial, value: &T) -> Result<EncryptedEnvelope, ClientError> {
    let plaintext = serde_json::to_string(value)
        .map_err(|err| ClientError::Protocol(format!("cannot serialize payload: {err}")))?;
    encrypt(key, &plaintext)
}

pub fn decrypt(key: &KeyMaterial, envelope: &EncryptedEnvelope) -> Result<String, ClientError> {
    let subkeys = derive_subkeys(key).ok_or_else(|| {
        ClientError::Decryption("key is empty or too short".to_string())
    })?;

    let wire = URL_SAFE_NO_PAD
        .decode(envelope.ciphertext.trim().trim_end_matches('=').as_bytes())
        .map_err(|err| ClientError::Decryption(format!("invalid base64: {err}")))?;
    if wire.len() < 1 + IV_LEN + BLOCK_LEN + TAG_LEN {
        return Err(ClientError::Decryption(format!(
            "envelope of {} bytes is too short",
            wire.len()
        )));
    }

    match EncodingVersion::from_u8(wire[0]) {
        Some(version) if version == envelope.encoding_version => {}
        Some(version) => {
            return Err(ClientError::Decryption(format!(
                "envelope encoding {version:?} does not match declared {:?}",
                envelope.encoding_version
            )))
        }
        None => {
            return Err(ClientError::Decryption(format!(
                "unknown envelope encoding version {}",
                wire[0]
            )))
        }
    }

    let (signed, tag) = wire.split_at(wire.len() - TAG_LEN);
    mac_for(&subkeys, signed)
        .ok_or_else(|| ClientError::Decryption("invalid mac key length".to_string()))?
        .verify_slice(tag)
        .map_err(|_| ClientError::Decryption("authentication tag mismatch".to_string()))?;

    let (iv, ciphertext) = signed[1..].split_at(IV_LEN);
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(ClientError::Decryption(
            "ciphertext is not block aligned".to_string(),
        ));
    }

    let cipher = Aes256CbcDec::new_from_slices(&subkeys.encryption, iv)
        .map_err(|_| ClientError::Decryption("invalid cipher key length".to_string()))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ClientError::Decryption("invalid padding".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|_| ClientError::Decryption("plaintext is not utf-8".to_string()))
}

/// Decrypts and parses; a well-formed envelope carrying bad JSON is a protocol error.
pub fn decrypt_json<T: DeserializeOwned>(
    key: &KeyMaterial,
    envelope: &EncryptedEnvelope,
) -> Result<T, ClientError> {
    let plaintext = decrypt(key, envelope)?;
    serde_json::from_str(&plaintext)
        .map_err(|err| ClientError::Protocol(format!("decrypted payload is not valid json: {err}")))
}

#[cfg(test)]
#[path = "tests/envelope_tests.rs"]
mod tests;
