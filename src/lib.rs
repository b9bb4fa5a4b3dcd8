//! Confidential Storage Core: key management and per-interaction content
//! encryption for a per-user confidential interaction store.
//!
//! [`ConfidentialStore`] is the top-level facade gluing the Unlock Service,
//! Setup Service, and Interaction Encryptor to one storage backend. Nothing
//! here is a singleton — a caller constructs one `ConfidentialStore` per
//! backend (typically once per process) and passes it around by reference,
//! the same way `ah_credentials::registry::AccountRegistry` is constructed
//! and injected rather than reached for globally.

pub mod config;
pub mod crypto;
pub mod encryptor;
pub mod error;
pub mod key_hierarchy;
pub mod key_store;
pub mod lockout;
pub mod persistence;
pub mod session;
pub mod setup;
pub mod unlock;
pub mod webauthn;

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::warn;

use config::CoreConfig;
use encryptor::{EncryptorError, PlaintextInteraction};
use error::CoreError;
use key_hierarchy::derive_kek_from_pin;
use persistence::PersistenceAdapter;
use setup::{KekWrap, SetupError, SetupService};
use unlock::UnlockService;

fn mk_pin_id(user_id: &str) -> String {
    format!("mk_pin_{user_id}")
}

fn mk_fido_id(user_id: &str) -> String {
    format!("mk_fido_{user_id}")
}

impl From<EncryptorError> for CoreError {
    fn from(err: EncryptorError) -> Self {
        match err {
            EncryptorError::Locked => CoreError::Locked,
            EncryptorError::Tampered => CoreError::Tampered,
            EncryptorError::NotFound => CoreError::NotFound,
            EncryptorError::Crypto(crypto::CryptoError::Aead) => CoreError::Tampered,
            EncryptorError::Crypto(other) => CoreError::Transient(other.to_string()),
            EncryptorError::KeyHierarchy(other) => CoreError::Transient(other.to_string()),
            EncryptorError::Storage(msg) => CoreError::Transient(msg),
        }
    }
}

impl From<SetupError> for CoreError {
    fn from(err: SetupError) -> Self {
        match err {
            SetupError::AlreadyProvisioned => CoreError::Conflict,
            SetupError::NotProvisioned => CoreError::NotFound,
            SetupError::InvalidRecoveryCode => CoreError::InvalidCredentials,
            SetupError::Store(store_err) => store_err.into(),
            SetupError::Crypto(other) => CoreError::Transient(other.to_string()),
            SetupError::KeyHierarchy(other) => CoreError::Transient(other.to_string()),
        }
    }
}

fn dek_id(user_id: &str) -> String {
    format!("dek_{user_id}")
}

/// Facade over one storage backend: owns the Unlock Service and Setup
/// Service, and exposes the sealed-interaction operations the Interaction
/// Encryptor implements as free functions.
pub struct ConfidentialStore {
    store: Arc<dyn PersistenceAdapter>,
    cfg: CoreConfig,
    unlock: UnlockService,
    setup: SetupService<dyn PersistenceAdapter>,
}

impl ConfidentialStore {
    pub fn new(store: Arc<dyn PersistenceAdapter>, cfg: CoreConfig) -> Self {
        let unlock = UnlockService::new(store.clone(), cfg.clone());
        let setup = SetupService::new(store.clone(), cfg.clone());
        Self { store, cfg, unlock, setup }
    }

    pub fn unlock(&self) -> &UnlockService {
        &self.unlock
    }

    pub fn setup(&self) -> &SetupService<dyn PersistenceAdapter> {
        &self.setup
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    /// Seal a plaintext interaction under `user_id`'s cached DEK. Fails with
    /// `CoreError::Locked` if no unlock call has cached a Master Key for this
    /// user yet. `cipher_key_version` is read from the current `dek_<user_id>`
    /// record, per §3's "matches the DEK version used" invariant.
    pub async fn seal_interaction(&self, user_id: &str, created_at_unix: u64, input: PlaintextInteraction) -> Result<String, CoreError> {
        let dek = self.unlock.get_decrypted_dek(user_id).await.ok_or(CoreError::Locked)?;

        let dek_record = self.store.find_by_id(&dek_id(user_id)).await?.ok_or(CoreError::NotFound)?;
        let cipher_key_version = dek_record.meta.get("version").and_then(|v| v.as_u64()).unwrap_or(1) as u32;

        encryptor::seal_interaction(self.store.as_ref(), dek.expose_secret(), cipher_key_version, self.cfg.chunk_size, created_at_unix, input)
            .await
            .map_err(Into::into)
    }

    /// Read and decrypt a previously sealed interaction. Fails with
    /// `CoreError::Locked` if no unlock call has cached a Master Key for this
    /// user yet.
    pub async fn read_interaction(&self, user_id: &str, interaction_id: &str) -> Result<Vec<u8>, CoreError> {
        let dek = self.unlock.get_decrypted_dek(user_id).await.ok_or(CoreError::Locked)?;
        encryptor::read_interaction(self.store.as_ref(), dek.expose_secret(), user_id, interaction_id).await.map_err(Into::into)
    }

    pub async fn delete_interaction(&self, interaction_id: &str) -> Result<(), CoreError> {
        self.store.delete_interaction(interaction_id).await.map_err(Into::into)
    }

    /// Rotate `user_id`'s Master Key, re-wrapping the DEK and the PIN
    /// wrapper in one atomic batch. Requires a fresh `pin` (re-proving
    /// possession rather than trusting a stale cached MK to rotate itself)
    /// and a cached MK from a prior unlock call in the same process.
    ///
    /// A PIN-only rotation has no fresh WebAuthn assertion to re-derive the
    /// FIDO wrapper's KEK from, so `mk_fido_<user_id>` (if registered) would
    /// be left wrapping the old MK. Rather than leave it silently stale —
    /// `unlock_with_webauthn` would then cache a dead MK and every DEK read
    /// through it would fail — this deletes it, forcing the caller to run
    /// `register_webauthn` again before WebAuthn unlock works.
    pub async fn rotate_master_key(&self, user_id: &str, pin: &str) -> Result<(), CoreError> {
        let mk = self.unlock.get_cached_mk(user_id).await.ok_or(CoreError::Locked)?;

        let pin_record = self.store.find_by_id(&mk_pin_id(user_id)).await?.ok_or(CoreError::NotFound)?;
        let salt_hex = pin_record.meta.get("salt").and_then(|v| v.as_str()).ok_or(CoreError::Transient("mk_pin record missing salt".to_string()))?;
        let salt = hex::decode(salt_hex).map_err(|e| CoreError::Transient(e.to_string()))?;

        let pin_bytes = pin.as_bytes().to_vec();
        let tuning = self.cfg.argon2;
        let kek = tokio::task::spawn_blocking(move || derive_kek_from_pin(&pin_bytes, &salt, tuning))
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let wrappers = vec![KekWrap { record_id: mk_pin_id(user_id), kek: kek.expose_secret().to_vec(), meta: serde_json::json!({"salt": salt_hex}) }];
        self.setup.rotate_master_key(user_id, mk.expose_secret(), &wrappers).await?;

        if let Some(fido_record) = self.store.find_by_id(&mk_fido_id(user_id)).await? {
            self.store.delete(&fido_record.id).await?;
            warn!(user_id, "invalidated stale mk_fido wrapper after pin-only rotation, webauthn must be re-registered");
        }

        self.unlock.logout(user_id).await;
        Ok(())
    }

    /// Issue a one-time recovery code for `user_id`. Requires a cached MK
    /// from a prior unlock call; the caller must display the returned code
    /// exactly once and never persist or log it.
    pub async fn generate_recovery_code(&self, user_id: &str) -> Result<String, CoreError> {
        let mk = self.unlock.get_cached_mk(user_id).await.ok_or(CoreError::Locked)?;
        self.setup.generate_recovery_code(user_id, mk.expose_secret()).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::mem::InMemoryPersistence;

    fn test_config() -> CoreConfig {
        let mut cfg = CoreConfig::default();
        cfg.argon2 = crypto::Argon2Tuning::for_tests();
        cfg
    }

    #[tokio::test]
    async fn seal_then_read_requires_unlock_first() {
        let store: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let core = ConfidentialStore::new(store, test_config());

        core.setup().set_pin("u1", "1234").await.unwrap();

        let input = PlaintextInteraction {
            user_id: "u1".to_string(),
            model: Some("test-model".to_string()),
            tokens: Some(10),
            cost_usd: Some(0.001),
            plaintext: b"hello confidential world".to_vec(),
            request_fingerprint: None,
            truncated: false,
        };

        let err = core.seal_interaction("u1", 0, input).await.unwrap_err();
        assert!(matches!(err, CoreError::Locked));
    }

    #[tokio::test]
    async fn seal_then_read_roundtrips_after_unlock() {
        let store: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let core = ConfidentialStore::new(store, test_config());

        core.setup().set_pin("u1", "1234").await.unwrap();
        assert!(core.unlock().unlock_with_pin("u1", "1234").await);

        let input = PlaintextInteraction {
            user_id: "u1".to_string(),
            model: Some("test-model".to_string()),
            tokens: Some(10),
            cost_usd: Some(0.001),
            plaintext: b"hello confidential world".to_vec(),
            request_fingerprint: None,
            truncated: false,
        };

        let id = core.seal_interaction("u1", 0, input).await.unwrap();
        let plaintext = core.read_interaction("u1", &id).await.unwrap();
        assert_eq!(plaintext, b"hello confidential world");
    }

    #[tokio::test]
    async fn cipher_key_version_bumps_after_rotation() {
        let store: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let core = ConfidentialStore::new(store.clone(), test_config());

        core.setup().set_pin("u1", "1234").await.unwrap();
        assert!(core.unlock().unlock_with_pin("u1", "1234").await);

        let pin_record = store.find_by_id("mk_pin_u1").await.unwrap().unwrap();
        let salt_hex = pin_record.meta.get("salt").unwrap().as_str().unwrap();
        let salt = hex::decode(salt_hex).unwrap();
        let kek = key_hierarchy::derive_kek_from_pin(b"1234", &salt, crypto::Argon2Tuning::for_tests()).unwrap();
        let mk = key_hierarchy::unwrap(&pin_record.ciphertext, &pin_record.nonce, kek.expose_secret()).unwrap();

        let wrappers = vec![setup::KekWrap { record_id: "mk_pin_u1".to_string(), kek: kek.expose_secret().to_vec(), meta: serde_json::json!({"salt": salt_hex}) }];
        core.setup().rotate_master_key("u1", mk.expose_secret(), &wrappers).await.unwrap();
        core.unlock().logout("u1").await;
        assert!(core.unlock().unlock_with_pin("u1", "1234").await);

        let input = PlaintextInteraction {
            user_id: "u1".to_string(),
            model: None,
            tokens: None,
            cost_usd: None,
            plaintext: b"post-rotation".to_vec(),
            request_fingerprint: None,
            truncated: false,
        };
        let id = core.seal_interaction("u1", 0, input).await.unwrap();
        let header = store.find_header(&id).await.unwrap().unwrap();
        assert_eq!(header.cipher_key_version, 2);
    }

    #[tokio::test]
    async fn rotate_master_key_invalidates_stale_fido_wrapper() {
        use crate::key_store::{KeyStore, KeyType, WrappedKeyRecord};

        let store: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let core = ConfidentialStore::new(store.clone(), test_config());

        core.setup().set_pin("u1", "1234").await.unwrap();
        assert!(core.unlock().unlock_with_pin("u1", "1234").await);

        store
            .create(WrappedKeyRecord::new("mk_fido_u1", KeyType::MasterKeyFido, vec![0u8; 16], [0u8; crypto::NONCE_LEN]))
            .await
            .unwrap();

        core.rotate_master_key("u1", "1234").await.unwrap();

        assert!(store.find_by_id("mk_fido_u1").await.unwrap().is_none(), "stale fido wrapper must be invalidated, not left wrapping the old mk");
    }
}
