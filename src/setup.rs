//! The Setup Service: first-time provisioning, WebAuthn registration,
//! recovery-code issuance, Master Key rotation, and recovery. Per the
//! Design Notes directive, every one of §4.5's five operations is
//! implemented here, not just `set_pin` — the source left the other four
//! contracted but unimplemented.

use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::info;

use crate::config::CoreConfig;
use crate::crypto::{self, CryptoError, KEY_LEN};
use crate::key_hierarchy::{self, KeyHierarchyError};
use crate::key_store::{KeyStore, KeyType, RecordUpdate, StoreError, WrappedKeyRecord};
use crate::webauthn;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    KeyHierarchy(#[from] KeyHierarchyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("user is already provisioned")]
    AlreadyProvisioned,

    #[error("user is not provisioned")]
    NotProvisioned,

    #[error("recovery code did not match")]
    InvalidRecoveryCode,
}

fn dek_id(user_id: &str) -> String {
    format!("dek_{user_id}")
}

fn mk_pin_id(user_id: &str) -> String {
    format!("mk_pin_{user_id}")
}

fn mk_fido_id(user_id: &str) -> String {
    format!("mk_fido_{user_id}")
}

fn fido2_id(user_id: &str, credential_id_hex: &str) -> String {
    format!("fido2_{user_id}_{credential_id_hex}")
}

fn recovery_id(user_id: &str) -> String {
    format!("mk_recovery_{user_id}")
}

/// Crockford-style base32 alphabet: human-typeable, unambiguous (no I/L/O/U).
const RECOVERY_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn encode_recovery_code(bytes: &[u8]) -> String {
    let mut bits = 0u32;
    let mut bit_count = 0u32;
    let mut out = String::new();

    for &byte in bytes {
        bits = (bits << 8) | byte as u32;
        bit_count += 8;
        while bit_count >= 5 {
            bit_count -= 5;
            let index = ((bits >> bit_count) & 0x1F) as usize;
            out.push(RECOVERY_ALPHABET[index] as char);
        }
    }
    if bit_count > 0 {
        let index = ((bits << (5 - bit_count)) & 0x1F) as usize;
        out.push(RECOVERY_ALPHABET[index] as char);
    }

    out.as_bytes()
        .chunks(5)
        .map(|c| std::str::from_utf8(c).expect("ascii alphabet"))
        .collect::<Vec<_>>()
        .join("-")
}

pub struct SetupService<S: KeyStore + ?Sized> {
    store: std::sync::Arc<S>,
    cfg: CoreConfig,
}

impl<S: KeyStore + ?Sized> SetupService<S> {
    pub fn new(store: std::sync::Arc<S>, cfg: CoreConfig) -> Self {
        Self { store, cfg }
    }

    /// `set_pin(user_id, pin)` — §4.5 steps 1-4.
    pub async fn set_pin(&self, user_id: &str, pin: &str) -> Result<(), SetupError> {
        if self.store.has_master_key().await? {
            return Err(SetupError::AlreadyProvisioned);
        }

        let mk = crypto::random_bytes::<KEY_LEN>();
        let dek = crypto::random_bytes::<KEY_LEN>();

        let dek_wrapped = key_hierarchy::wrap(&dek, &mk)?;
        self.store
            .create(WrappedKeyRecord::new(dek_id(user_id), KeyType::DataEncryptionKey, dek_wrapped.ciphertext, dek_wrapped.nonce).with_meta(serde_json::json!({"version": 1})))
            .await?;

        let salt = crypto::random_bytes::<16>();
        let pin_bytes = pin.as_bytes().to_vec();
        let tuning = self.cfg.argon2;
        let salt_for_derive = salt;
        let kek = tokio::task::spawn_blocking(move || crypto::argon2id(&pin_bytes, &salt_for_derive, tuning))
            .await
            .expect("argon2 task must not panic")?;

        let mk_wrapped = key_hierarchy::wrap(&mk, kek.expose_secret())?;
        self.store
            .create(WrappedKeyRecord::new(mk_pin_id(user_id), KeyType::MasterKeyPin, mk_wrapped.ciphertext, mk_wrapped.nonce).with_meta(serde_json::json!({"salt": hex::encode(salt)})))
            .await?;

        Ok(())
    }

    /// `register_webauthn(user_id, attestation, confirmation)` — §4.5.
    /// `passkey` is the `webauthn-rs` ceremony's own output, persisted as the
    /// credential record's source of truth for future authentication.
    ///
    /// Deriving a WebAuthn KEK needs assertion-shaped material (a
    /// challenge+signature pair), which a registration ceremony alone never
    /// produces. Callers must immediately follow registration with one
    /// authentication ceremony against the new credential and pass its
    /// result as `confirmation`; that pair is what actually wraps the MK.
    pub async fn register_webauthn(&self, user_id: &str, mk: &[u8], credential_id: &[u8], passkey: &webauthn_rs::prelude::Passkey, confirmation: &WebauthnConfirmation) -> Result<(), SetupError> {
        let credential_id_hex = hex::encode(credential_id);
        let kek_salt = crypto::random_bytes::<16>();

        self.store
            .create(
                WrappedKeyRecord::new(fido2_id(user_id, &credential_id_hex), KeyType::Fido2Credential, Vec::new(), [0u8; crypto::NONCE_LEN]).with_meta(serde_json::json!({
                    "salt": hex::encode(kek_salt),
                    "counter": 0,
                    "passkey": serde_json::to_value(passkey).expect("Passkey serializes"),
                })),
            )
            .await?;

        let kek = key_hierarchy::derive_kek_from_webauthn(&confirmation.client_data_json, credential_id, &confirmation.signature, &kek_salt)?;
        let mk_wrapped = key_hierarchy::wrap(mk, kek.expose_secret())?;
        self.store
            .create(WrappedKeyRecord::new(mk_fido_id(user_id), KeyType::MasterKeyFido, mk_wrapped.ciphertext, mk_wrapped.nonce))
            .await?;

        Ok(())
    }

    /// `generate_recovery_code(user_id)` — §4.5. Returns the plaintext
    /// recovery code; the caller must display it exactly once and never log
    /// it. The stored record only ever holds MK wrapped under a KEK derived
    /// from the code, never the code itself.
    pub async fn generate_recovery_code(&self, user_id: &str, mk: &[u8]) -> Result<String, SetupError> {
        let raw_code = crypto::random_vec(KEY_LEN);
        let code = encode_recovery_code(&raw_code);

        let salt = crypto::random_bytes::<16>();
        let kek = crypto::hkdf_sha256(&raw_code, &salt, b"coldproxy/v1/recovery", KEY_LEN)?;
        let mk_wrapped = key_hierarchy::wrap(mk, kek.expose_secret())?;

        self.store
            .create(WrappedKeyRecord::new(recovery_id(user_id), KeyType::Recovery, mk_wrapped.ciphertext, mk_wrapped.nonce).with_meta(serde_json::json!({"salt": hex::encode(salt)})))
            .await?;

        Ok(code)
    }

    /// `recover_master_key(user_id, recovery_code)` — §4.5. Unwraps MK via
    /// the recovery record. The caller is expected to force PIN/WebAuthn
    /// re-provisioning immediately afterward (this function does not delete
    /// the old `mk_pin_*`/`mk_fido_*` records itself — that is the caller's
    /// `set_pin`/`register_webauthn` call, which will fail with
    /// `AlreadyProvisioned` unless those records are removed first).
    pub async fn recover_master_key(&self, user_id: &str, recovery_code: &str) -> Result<crypto::SecretBytes, SetupError> {
        let record = self.store.find_by_id(&recovery_id(user_id)).await?.ok_or(SetupError::NotProvisioned)?;
        let salt_hex = record.meta.get("salt").and_then(|v| v.as_str()).ok_or(SetupError::InvalidRecoveryCode)?;
        let salt = hex::decode(salt_hex).map_err(|_| SetupError::InvalidRecoveryCode)?;

        let raw_code = decode_recovery_code(recovery_code).ok_or(SetupError::InvalidRecoveryCode)?;
        let kek = crypto::hkdf_sha256(&raw_code, &salt, b"coldproxy/v1/recovery", KEY_LEN)?;

        key_hierarchy::unwrap(&record.ciphertext, &record.nonce, kek.expose_secret()).map_err(|_| SetupError::InvalidRecoveryCode)
    }

    /// `rotate_master_key(user_id)` — §4.5. Generates a new MK, re-wraps
    /// `dek_<user_id>` and every wrapper in `wrappers` under the new MK, and
    /// bumps `cipher_key_version` on the DEK record's meta — all in one
    /// atomic `KeyStore::update` batch. The previous MK is zeroized by
    /// virtue of going out of scope; nothing here retains it past this call.
    ///
    /// `wrappers` is the set of still-valid KEKs the caller has already
    /// re-derived by proving possession of each factor (an `unlock_with_pin`
    /// or `unlock_with_webauthn` call immediately prior) — this function
    /// only re-wraps, it does not re-authenticate.
    pub async fn rotate_master_key(&self, user_id: &str, current_mk: &[u8], wrappers: &[KekWrap]) -> Result<crypto::SecretBytes, SetupError> {
        let dek_record = self.store.find_by_id(&dek_id(user_id)).await?.ok_or(SetupError::NotProvisioned)?;
        let dek = key_hierarchy::unwrap(&dek_record.ciphertext, &dek_record.nonce, current_mk)?;

        let new_mk = crypto::random_bytes::<KEY_LEN>();
        let mut updates = Vec::new();

        let dek_wrapped = key_hierarchy::wrap(dek.expose_secret(), &new_mk)?;
        let current_version = dek_record.meta.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
        updates.push(RecordUpdate {
            id: dek_id(user_id),
            ciphertext: dek_wrapped.ciphertext,
            nonce: dek_wrapped.nonce,
            meta: Some(serde_json::json!({"version": current_version + 1})),
        });

        for wrapper in wrappers {
            let wrapped = key_hierarchy::wrap(&new_mk, &wrapper.kek)?;
            updates.push(RecordUpdate { id: wrapper.record_id.clone(), ciphertext: wrapped.ciphertext, nonce: wrapped.nonce, meta: Some(wrapper.meta.clone()) });
        }

        let rewrapped = updates.len();
        self.store.update(updates).await?;
        info!(user_id, new_version = current_version + 1, rewrapped, "rotated master key");
        Ok(crypto::SecretBytes::from(new_mk.to_vec()))
    }
}

/// The assertion-shaped material from the authentication ceremony a caller
/// performs immediately after WebAuthn registration, passed to
/// `register_webauthn` so it can derive the KEK that wraps the MK.
pub struct WebauthnConfirmation {
    pub client_data_json: Vec<u8>,
    pub signature: Vec<u8>,
}

/// One wrapper record to re-wrap during `rotate_master_key`, with its
/// already-derived KEK and the meta it should carry afterward (the PIN
/// wrapper's salt, the WebAuthn wrapper's salt, unchanged).
pub struct KekWrap {
    pub record_id: String,
    pub kek: Vec<u8>,
    pub meta: serde_json::Value,
}

fn decode_recovery_code(code: &str) -> Option<Vec<u8>> {
    let cleaned: String = code.chars().filter(|c| *c != '-').collect();
    let mut bits = 0u32;
    let mut bit_count = 0u32;
    let mut out = Vec::new();

    for c in cleaned.chars() {
        let value = RECOVERY_ALPHABET.iter().position(|&a| a as char == c.to_ascii_uppercase())?;
        bits = (bits << 5) | value as u32;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(((bits >> bit_count) & 0xFF) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_store::InMemoryStore;

    fn test_config() -> CoreConfig {
        let mut cfg = CoreConfig::default();
        cfg.argon2 = crypto::Argon2Tuning::for_tests();
        cfg
    }

    #[tokio::test]
    async fn set_pin_provisions_dek_and_mk_wrapper() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let service = SetupService::new(store.clone(), test_config());

        service.set_pin("u1", "1234").await.unwrap();
        assert!(store.has_master_key().await.unwrap());
        assert!(store.find_by_id("dek_u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn set_pin_rejects_double_provisioning() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let service = SetupService::new(store, test_config());

        service.set_pin("u1", "1234").await.unwrap();
        let err = service.set_pin("u1", "5678").await.unwrap_err();
        assert!(matches!(err, SetupError::AlreadyProvisioned));
    }

    #[tokio::test]
    async fn recovery_code_roundtrips_to_mk() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let service = SetupService::new(store, test_config());

        let mk = crypto::random_bytes::<KEY_LEN>();
        let code = service.generate_recovery_code("u1", &mk).await.unwrap();

        let recovered = service.recover_master_key("u1", &code).await.unwrap();
        assert_eq!(recovered.expose_secret(), &mk);
    }

    #[tokio::test]
    async fn wrong_recovery_code_is_rejected() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let service = SetupService::new(store, test_config());

        let mk = crypto::random_bytes::<KEY_LEN>();
        let _code = service.generate_recovery_code("u1", &mk).await.unwrap();

        let err = service.recover_master_key("u1", "0000-0000-0000-0000-0000-0000-0000").await.unwrap_err();
        assert!(matches!(err, SetupError::InvalidRecoveryCode));
    }

    #[test]
    fn recovery_code_is_grouped_and_alphabet_safe() {
        let code = encode_recovery_code(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04]);
        assert!(code.contains('-'));
        assert!(!code.to_ascii_uppercase().contains('I'));
        assert!(!code.to_ascii_uppercase().contains('L'));
        assert!(!code.to_ascii_uppercase().contains('O'));
        assert!(!code.to_ascii_uppercase().contains('U'));
    }

    #[tokio::test]
    async fn rotate_master_key_bumps_dek_version() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let service = SetupService::new(store.clone(), test_config());
        service.set_pin("u1", "1234").await.unwrap();

        let pin_record = store.find_by_id("mk_pin_u1").await.unwrap().unwrap();
        let salt_hex = pin_record.meta.get("salt").unwrap().as_str().unwrap();
        let salt = hex::decode(salt_hex).unwrap();
        let kek = key_hierarchy::derive_kek_from_pin(b"1234", &salt, crypto::Argon2Tuning::for_tests()).unwrap();
        let mk = key_hierarchy::unwrap(&pin_record.ciphertext, &pin_record.nonce, kek.expose_secret()).unwrap();

        let wrappers = vec![KekWrap { record_id: "mk_pin_u1".to_string(), kek: kek.expose_secret().to_vec(), meta: serde_json::json!({"salt": salt_hex}) }];
        let new_mk = service.rotate_master_key("u1", mk.expose_secret(), &wrappers).await.unwrap();

        let dek_record = store.find_by_id("dek_u1").await.unwrap().unwrap();
        assert_eq!(dek_record.meta.get("version").unwrap().as_u64().unwrap(), 2);

        let rotated_pin_record = store.find_by_id("mk_pin_u1").await.unwrap().unwrap();
        let reunwrapped = key_hierarchy::unwrap(&rotated_pin_record.ciphertext, &rotated_pin_record.nonce, kek.expose_secret()).unwrap();
        assert_eq!(reunwrapped.expose_secret(), new_mk.expose_secret());
    }
}
