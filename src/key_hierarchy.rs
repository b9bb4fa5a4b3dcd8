//! Wrap/unwrap of key material and the three key-derivation paths: PIN,
//! WebAuthn assertion, and per-interaction key from DEK.
//!
//! Everything here operates on opaque bytes. Parsing a PIN string, a
//! `clientDataJSON` blob, or a recovery code into bytes happens at the
//! caller (`unlock`/`setup`); this module only derives and wraps.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError, KEY_LEN, NONCE_LEN, SecretBytes};

#[derive(Debug, Error)]
pub enum KeyHierarchyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("malformed clientDataJSON")]
    MalformedClientData,

    #[error("invalid base64url encoding")]
    InvalidEncoding,
}

/// The ciphertext + nonce pair stored in a `WrappedKeyRecord`.
pub struct Wrapped {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Wrap a 32-byte key under `wrapping_key`. No AAD — the enclosing
/// `WrappedKeyRecord` carries the type and version that would otherwise go
/// there.
pub fn wrap(plaintext_key: &[u8], wrapping_key: &[u8]) -> Result<Wrapped, KeyHierarchyError> {
    let nonce = crypto::random_bytes::<NONCE_LEN>();
    let ciphertext = crypto::aead_encrypt(plaintext_key, &nonce, wrapping_key, b"")?;
    Ok(Wrapped { ciphertext, nonce })
}

/// Unwrap a key previously produced by `wrap`. Any AEAD failure collapses to
/// `CryptoError::Aead` — wrong wrapping key and corrupted ciphertext are
/// indistinguishable, which is what the Unlock Service's opaque
/// invalid-credentials contract depends on.
pub fn unwrap(ciphertext: &[u8], nonce: &[u8; NONCE_LEN], wrapping_key: &[u8]) -> Result<SecretBytes, KeyHierarchyError> {
    let plaintext = crypto::aead_decrypt(ciphertext, nonce, wrapping_key, b"")?;
    Ok(SecretBytes::from(plaintext.to_vec()))
}

/// `HKDF-SHA256(ikm=dek, salt=key_nonce, info="coldproxy/v1", len=32)`.
/// `key_nonce` is the value persisted on the interaction header so the same
/// IK can be re-derived at decrypt time from nothing but the DEK and that
/// nonce.
pub fn derive_interaction_key(dek: &[u8], key_nonce: &[u8]) -> Result<SecretBytes, KeyHierarchyError> {
    Ok(crypto::hkdf_sha256(dek, key_nonce, b"coldproxy/v1", KEY_LEN)?)
}

/// `argon2id(pin, salt)` — a KEK derived from a user PIN. Parameters are
/// fixed by `Argon2Tuning`; callers must not pass a weaker tuning than the
/// one stored at setup time.
pub fn derive_kek_from_pin(pin: &[u8], salt: &[u8], tuning: crypto::Argon2Tuning) -> Result<SecretBytes, KeyHierarchyError> {
    Ok(crypto::argon2id(pin, salt, tuning)?)
}

#[derive(Deserialize)]
struct ClientData {
    challenge: String,
}

/// Derive a KEK from a WebAuthn assertion:
///
/// 1. Parse `client_data_json` and extract `challenge` (base64url).
/// 2. Base64url-decode `challenge`, `credential_id`, `signature`.
/// 3. Concatenate `challenge || credential_id || signature` as IKM.
/// 4. `HKDF-SHA256(ikm, salt, info="ccflare-webauthn-kek", len=32)`.
pub fn derive_kek_from_webauthn(
    client_data_json: &[u8],
    credential_id: &[u8],
    signature: &[u8],
    salt: &[u8],
) -> Result<SecretBytes, KeyHierarchyError> {
    let client_data: ClientData = serde_json::from_slice(client_data_json).map_err(|_| KeyHierarchyError::MalformedClientData)?;
    let challenge = URL_SAFE_NO_PAD
        .decode(client_data.challenge.as_bytes())
        .map_err(|_| KeyHierarchyError::InvalidEncoding)?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(challenge.len() + credential_id.len() + signature.len()));
    ikm.extend_from_slice(&challenge);
    ikm.extend_from_slice(credential_id);
    ikm.extend_from_slice(signature);

    Ok(crypto::hkdf_sha256(&ikm, salt, b"ccflare-webauthn-kek", KEY_LEN)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
    use secrecy::ExposeSecret;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let wrapping_key = crypto::random_bytes::<KEY_LEN>();
        let plaintext = crypto::random_bytes::<KEY_LEN>();

        let wrapped = wrap(&plaintext, &wrapping_key).unwrap();
        let unwrapped = unwrap(&wrapped.ciphertext, &wrapped.nonce, &wrapping_key).unwrap();
        assert_eq!(unwrapped.expose_secret(), &plaintext);
    }

    #[test]
    fn unwrap_fails_with_wrong_key() {
        let wrapping_key = crypto::random_bytes::<KEY_LEN>();
        let other_key = crypto::random_bytes::<KEY_LEN>();
        let plaintext = crypto::random_bytes::<KEY_LEN>();

        let wrapped = wrap(&plaintext, &wrapping_key).unwrap();
        let err = unwrap(&wrapped.ciphertext, &wrapped.nonce, &other_key).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::Crypto(CryptoError::Aead)));
    }

    #[test]
    fn derive_interaction_key_is_reproducible_from_dek_and_nonce() {
        let dek = crypto::random_bytes::<KEY_LEN>();
        let nonce = crypto::random_bytes::<NONCE_LEN>();

        let a = derive_interaction_key(&dek, &nonce).unwrap();
        let b = derive_interaction_key(&dek, &nonce).unwrap();
        assert_eq!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn derive_interaction_key_differs_per_nonce() {
        let dek = crypto::random_bytes::<KEY_LEN>();
        let a = derive_interaction_key(&dek, &crypto::random_bytes::<NONCE_LEN>()).unwrap();
        let b = derive_interaction_key(&dek, &crypto::random_bytes::<NONCE_LEN>()).unwrap();
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn webauthn_kek_matches_manual_concatenation() {
        let challenge = b"challenge-bytes";
        let credential_id = b"credential-id-bytes";
        let signature = b"signature-bytes";
        let salt = crypto::random_bytes::<16>();

        let client_data = format!(r#"{{"type":"webauthn.get","challenge":"{}"}}"#, B64.encode(challenge));

        let derived = derive_kek_from_webauthn(client_data.as_bytes(), credential_id, signature, &salt).unwrap();

        let mut expected_ikm = Vec::new();
        expected_ikm.extend_from_slice(challenge);
        expected_ikm.extend_from_slice(credential_id);
        expected_ikm.extend_from_slice(signature);
        let expected = crypto::hkdf_sha256(&expected_ikm, &salt, b"ccflare-webauthn-kek", KEY_LEN).unwrap();

        assert_eq!(derived.expose_secret(), expected.expose_secret());
    }

    #[test]
    fn webauthn_kek_rejects_malformed_client_data() {
        let err = derive_kek_from_webauthn(b"not json", b"cred", b"sig", &[0u8; 16]).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::MalformedClientData));
    }
}
