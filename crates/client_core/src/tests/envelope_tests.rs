use super::*;
use base64::Engine as _;
use serde_json::{json, Value};

fn key() -> KeyMaterial {
    KeyMaterial::from_slice(&[7u8; 32])
}

#[test]
fn round_trips_json_text() {
    let plaintext = json!({"msg": "xin chào", "n": 3, "nested": {"ok": true}}).to_string();
    let envelope = encrypt(&key(), &plaintext).expect("encrypt");
    assert_eq!(envelope.encoding_version, EncodingVersion::CbcHmacV1);
    assert_eq!(decrypt(&key(), &envelope).expect("decrypt"), plaintext);
}

#[test]
fn empty_plaintext_round_trips() {
    let envelope = encrypt(&key(), "").expect("encrypt");
    assert_eq!(decrypt(&key(), &envelope).expect("decrypt"), "");
}

#[test]
fn same_plaintext_encrypts_differently_each_time() {
    let first = encrypt(&key(), "{}").expect("encrypt");
    let second = encrypt(&key(), "{}").expect("encrypt");
    assert_ne!(first.ciphertext, second.ciphertext);
}

#[test]
fn ciphertext_is_url_safe_without_padding() {
    let envelope = encrypt(&key(), &"x".repeat(100)).expect("encrypt");
    assert!(envelope
        .ciphertext
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
}

#[test]
fn every_corrupted_byte_fails_to_decrypt() {
    let envelope = encrypt(&key(), r#"{"hello":"world"}"#).expect("encrypt");
    let wire = URL_SAFE_NO_PAD.decode(&envelope.ciphertext).expect("base64");

    for index in 0..wire.len() {
        let mut corrupted = wire.clone();
        corrupted[index] ^= 0x01;
        let tampered = EncryptedEnvelope::from_wire(URL_SAFE_NO_PAD.encode(&corrupted));
        assert!(
            matches!(decrypt(&key(), &tampered), Err(ClientError::Decryption(_))),
            "byte {index} was not detected"
        );
    }
}

#[test]
fn wrong_key_fails_to_decrypt() {
    let envelope = encrypt(&key(), "{}").expect("encrypt");
    let other = KeyMaterial::from_slice(&[8u8; 32]);
    assert!(matches!(decrypt(&other, &envelope), Err(ClientError::Decryption(_))));
}

#[test]
fn garbage_input_is_a_decryption_error() {
    for raw in ["", "not base64!!", "AAAA"] {
        assert!(matches!(
            decrypt(&key(), &EncryptedEnvelope::from_wire(raw)),
            Err(ClientError::Decryption(_))
        ));
    }
}

#[test]
fn short_or_empty_keys_cannot_encrypt() {
    assert!(matches!(
        encrypt(&KeyMaterial::empty(), "{}"),
        Err(ClientError::Encryption(_))
    ));
    assert!(matches!(
        encrypt(&KeyMaterial::from_slice(&[1u8; 8]), "{}"),
        Err(ClientError::Encryption(_))
    ));
}

#[test]
fn oversized_plaintext_is_rejected() {
    let huge = "a".repeat(MAX_PLAINTEXT_BYTES + 1);
    assert!(matches!(encrypt(&key(), &huge), Err(ClientError::Encryption(_))));
}

#[test]
fn decrypt_json_maps_bad_json_to_protocol_error() {
    let envelope = encrypt(&key(), "definitely not json").expect("encrypt");
    let result: Result<Value, _> = decrypt_json(&key(), &envelope);
    assert!(matches!(result, Err(ClientError::Protocol(_))));

    let envelope = encrypt_json(&key(), &json!({"a": [1, 2]})).expect("encrypt");
    let value: Value = decrypt_json(&key(), &envelope).expect("decrypt");
    assert_eq!(value, json!({"a": [1, 2]}));
}
