//! The Unlock Service: PIN and WebAuthn unlock flows, the Master Key cache,
//! and on-demand DEK materialization.
//!
//! State machine per user is `Locked -> Unlocking -> Unlocked -> (idle TTL)
//! -> Locked`. `Unlocking` is transient within one call; concurrent unlock
//! attempts for the same user are serialized through a per-user mutex so
//! one attempt completes before the next observes the post-state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::crypto::{self, SecretBytes};
use crate::key_hierarchy;
use crate::key_store::{KeyType, RecordUpdate};
use crate::lockout::PinLockout;
use crate::persistence::PersistenceAdapter;
use crate::webauthn::{self, RelyingParty};

struct CacheEntry {
    key: SecretBytes,
    expires_at: Instant,
}

/// Master Key cache: 100-entry FIFO cap, 30-minute sliding idle TTL.
/// Eviction order is insertion order, independent of which entries were
/// refreshed by access — per the spec's explicit "LRU-by-insertion"
/// phrasing, this is FIFO-on-insert, not true LRU.
struct MkCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    insertion_order: VecDeque<String>,
}

impl MkCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity, ttl, entries: HashMap::new(), insertion_order: VecDeque::new() }
    }

    fn insert(&mut self, user_id: &str, key: SecretBytes, now: Instant) {
        if !self.entries.contains_key(user_id) {
            self.insertion_order.push_back(user_id.to_string());
        }
        self.entries.insert(user_id.to_string(), CacheEntry { key, expires_at: now + self.ttl });

        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.entries.remove(&oldest);
                debug!(user_id = oldest, "mk cache evicted entry over capacity");
            } else {
                break;
            }
        }
    }

    /// Returns a clone of the cached key if present and unexpired, refreshing
    /// its idle TTL on read. Expired entries are evicted eagerly.
    fn get(&mut self, user_id: &str, now: Instant) -> Option<SecretBytes> {
        let expired = match self.entries.get(user_id) {
            Some(entry) => now >= entry.expires_at,
            None => return None,
        };
        if expired {
            self.entries.remove(user_id);
            self.insertion_order.retain(|id| id != user_id);
            debug!(user_id, "mk cache entry expired past idle ttl");
            return None;
        }
        let entry = self.entries.get_mut(user_id).expect("checked above");
        entry.expires_at = now + self.ttl;
        Some(SecretBytes::from(entry.key.expose_secret().to_vec()))
    }

    fn remove(&mut self, user_id: &str) {
        self.entries.remove(user_id);
        self.insertion_order.retain(|id| id != user_id);
    }
}

pub struct UnlockService {
    store: Arc<dyn PersistenceAdapter>,
    cfg: CoreConfig,
    cache: Mutex<MkCache>,
    lockout: PinLockout,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
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

impl UnlockService {
    pub fn new(store: Arc<dyn PersistenceAdapter>, cfg: CoreConfig) -> Self {
        let cache = MkCache::new(cfg.mk_cache_capacity, cfg.mk_cache_idle_ttl);
        let lockout = PinLockout::new(cfg.lockout_threshold, cfg.lockout_window);
        Self { store, cfg, cache: Mutex::new(cache), lockout, user_locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for_user(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks.entry(user_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// `unlock_with_pin(user_id, pin)` — §4.4.1. Fully awaits the Argon2id
    /// derivation and the unwrap before branching on success; never returns
    /// before either completes.
    pub async fn unlock_with_pin(&self, user_id: &str, pin: &str) -> bool {
        let per_user_lock = self.lock_for_user(user_id).await;
        let _guard = per_user_lock.lock().await;

        let now = Instant::now();
        if self.lockout.is_locked(user_id, now).await {
            return false;
        }

        let record = match self.store.find_by_id(&mk_pin_id(user_id)).await {
            Ok(Some(record)) => record,
            _ => {
                // Dummy Argon2id derivation over the submitted PIN with a
                // throwaway salt, to equalize timing with the real path.
                let throwaway_salt = crypto::random_bytes::<16>();
                let tuning = self.cfg.argon2;
                let pin_bytes = pin.as_bytes().to_vec();
                let _ = tokio::task::spawn_blocking(move || crypto::argon2id(&pin_bytes, &throwaway_salt, tuning)).await;
                return false;
            }
        };

        let salt = match record.meta.get("salt").and_then(|v| v.as_str()).and_then(|s| hex::decode(s).ok()) {
            Some(salt) => salt,
            None => return false,
        };

        let tuning = self.cfg.argon2;
        let pin_bytes = pin.as_bytes().to_vec();
        let kek = match tokio::task::spawn_blocking(move || crypto::argon2id(&pin_bytes, &salt, tuning)).await {
            Ok(Ok(kek)) => kek,
            _ => return false,
        };

        let nonce = record.nonce;
        match key_hierarchy::unwrap(&record.ciphertext, &nonce, kek.expose_secret()) {
            Ok(mk) => {
                self.cache.lock().await.insert(user_id, mk, Instant::now());
                self.lockout.clear(user_id).await;
                info!(user_id, "pin unlock succeeded");
                true
            }
            Err(_) => {
                self.lockout.record_failure(user_id, Instant::now()).await;
                warn!(user_id, "pin unlock failed");
                false
            }
        }
        // kek (SecretBytes) zeroizes on drop here regardless of branch taken.
    }

    /// `get_decrypted_dek(user_id)` — §4.4.3. Unwraps `dek_<user_id>` with
    /// the cached MK on every call; the DEK itself is never cached.
    pub async fn get_decrypted_dek(&self, user_id: &str) -> Option<SecretBytes> {
        let mk = self.cache.lock().await.get(user_id, Instant::now())?;
        let record = self.store.find_by_id(&dek_id(user_id)).await.ok().flatten()?;
        key_hierarchy::unwrap(&record.ciphertext, &record.nonce, mk.expose_secret()).ok()
    }

    /// Explicit session-independent cache invalidation, added to close the
    /// gap the source left (no way to invalidate a cached MK on logout
    /// short of waiting out the idle TTL).
    pub async fn logout(&self, user_id: &str) {
        self.cache.lock().await.remove(user_id);
        info!(user_id, "logout evicted cached master key");
    }

    /// Returns a clone of the cached Master Key, if any. Privileged callers
    /// that must re-wrap the MK itself (rotation, recovery-code issuance)
    /// need the MK directly rather than a DEK derived from it; everything
    /// else should prefer `get_decrypted_dek`.
    pub async fn get_cached_mk(&self, user_id: &str) -> Option<SecretBytes> {
        self.cache.lock().await.get(user_id, Instant::now())
    }

    /// `generate_webauthn_challenge(user_id)` — §4.4.2. Returns the
    /// challenge response to hand to the caller's authenticator and the
    /// ceremony state the caller must stash (in the session) until the
    /// matching `unlock_with_webauthn` call.
    pub async fn generate_webauthn_challenge(
        &self,
        rp: &RelyingParty,
        user_id: &str,
    ) -> Result<(webauthn_rs::prelude::RequestChallengeResponse, webauthn_rs::prelude::PasskeyAuthentication), webauthn::WebauthnError> {
        let records = self.store.find_by_type(KeyType::Fido2Credential).await.unwrap_or_default();
        let passkeys: Vec<webauthn_rs::prelude::Passkey> = records
            .into_iter()
            .filter(|r| r.id.starts_with(&format!("fido2_{user_id}_")))
            .filter_map(|r| serde_json::from_value(r.meta.get("passkey")?.clone()).ok())
            .collect();

        rp.start_authentication(&passkeys)
    }

    /// `unlock_with_webauthn` — §4.4.2. Verifies the assertion through the
    /// audited relying-party library, folds the result into the stored
    /// `Passkey`'s own counter state (so a later `generate_webauthn_challenge`
    /// call rejects a replayed older assertion rather than re-checking against
    /// the registration-time counter), derives the KEK independently per
    /// §4.3, and unwraps `mk_fido_<user_id>`.
    pub async fn unlock_with_webauthn(
        &self,
        rp: &RelyingParty,
        user_id: &str,
        response: &webauthn_rs::prelude::PublicKeyCredential,
        state: &webauthn_rs::prelude::PasskeyAuthentication,
    ) -> bool {
        let per_user_lock = self.lock_for_user(user_id).await;
        let _guard = per_user_lock.lock().await;

        let auth_result = match rp.finish_authentication(response, state) {
            Ok(result) => result,
            Err(_) => return false,
        };

        let credential_id_hex = hex::encode(auth_result.cred_id());
        let record_id = fido2_id(user_id, &credential_id_hex);
        let Ok(Some(record)) = self.store.find_by_id(&record_id).await else {
            return false;
        };

        let Some(mut passkey) = record.meta.get("passkey").cloned().and_then(|v| serde_json::from_value::<webauthn_rs::prelude::Passkey>(v).ok()) else {
            return false;
        };
        passkey.update_credential(&auth_result);

        let mut meta = record.meta.clone();
        let Ok(passkey_value) = serde_json::to_value(&passkey) else {
            return false;
        };
        meta["passkey"] = passkey_value;
        meta["counter"] = serde_json::json!(auth_result.counter());
        let update = RecordUpdate { id: record_id, ciphertext: record.ciphertext.clone(), nonce: record.nonce, meta: Some(meta) };
        if self.store.update(vec![update]).await.is_err() {
            return false;
        }

        let Some(salt_hex) = record.meta.get("salt").and_then(|v| v.as_str()) else {
            return false;
        };
        let Ok(salt) = hex::decode(salt_hex) else {
            return false;
        };

        let (client_data_json, credential_id, signature) = webauthn::assertion_material(response);
        let kek = match key_hierarchy::derive_kek_from_webauthn(&client_data_json, &credential_id, &signature, &salt) {
            Ok(kek) => kek,
            Err(_) => return false,
        };

        let Ok(Some(mk_record)) = self.store.find_by_id(&mk_fido_id(user_id)).await else {
            return false;
        };

        match key_hierarchy::unwrap(&mk_record.ciphertext, &mk_record.nonce, kek.expose_secret()) {
            Ok(mk) => {
                self.cache.lock().await.insert(user_id, mk, Instant::now());
                true
            }
            Err(_) => false,
        }
    }
}
