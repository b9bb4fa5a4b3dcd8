//! The Key Store: a keyed collection of wrapped-key records.
//!
//! This module owns wrapped key material exclusively — ciphertext, nonce,
//! and metadata. It never sees a plaintext key; unwrapping happens one layer
//! up in [`crate::key_hierarchy`]. Two reference implementations are
//! provided: [`InMemoryStore`] (used by tests and anywhere a caller doesn't
//! need durability) and [`file::FileStore`] (one record per file, atomic
//! write-temp/fsync/rename, advisory flock, 0600/0700 permissions).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub mod file;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a record with id {0:?} already exists")]
    Conflict(String),

    #[error("no record with id {0:?}")]
    NotFound(String),

    #[error("storage io error: {0}")]
    Io(String),
}

/// The five record kinds the core persists through the Key Store. Each also
/// has an external id convention (`dek_<uid>`, `mk_pin_<uid>`,
/// `mk_fido_<uid>`, `fido2_<uid>_<credentialId>`, `mk_recovery_<uid>`) built
/// by the owning module (`setup`/`unlock`); `find_by_type` filters on this
/// enum directly rather than on the id string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    DataEncryptionKey,
    MasterKeyPin,
    MasterKeyFido,
    Fido2Credential,
    Recovery,
}

impl KeyType {
    /// Whether this key type counts toward `has_master_key()`.
    pub fn is_master_key(self) -> bool {
        matches!(self, KeyType::MasterKeyPin | KeyType::MasterKeyFido)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKeyRecord {
    pub id: String,
    pub key_type: KeyType,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; crate::crypto::NONCE_LEN],
    pub meta: serde_json::Value,
}

impl WrappedKeyRecord {
    pub fn new(id: impl Into<String>, key_type: KeyType, ciphertext: Vec<u8>, nonce: [u8; crate::crypto::NONCE_LEN]) -> Self {
        Self {
            id: id.into(),
            key_type,
            ciphertext,
            nonce,
            meta: serde_json::Value::Null,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// A single field update within an `update` batch.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub id: String,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; crate::crypto::NONCE_LEN],
    pub meta: Option<serde_json::Value>,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn create(&self, record: WrappedKeyRecord) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<WrappedKeyRecord>, StoreError>;

    async fn find_by_type(&self, key_type: KeyType) -> Result<Vec<WrappedKeyRecord>, StoreError>;

    /// Apply every update in `updates` or none of them. Used by MK rotation,
    /// which re-wraps every `dek_*` record (and `mk_pin_*`/`mk_fido_*`) in
    /// one shot and must never leave the store half-rotated.
    async fn update(&self, updates: Vec<RecordUpdate>) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn has_master_key(&self) -> Result<bool, StoreError>;
}

/// In-memory reference implementation. Used by unit and property tests and
/// by any caller that does not need the records to survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, WrappedKeyRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryStore {
    async fn create(&self, record: WrappedKeyRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<WrappedKeyRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_by_type(&self, key_type: KeyType) -> Result<Vec<WrappedKeyRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.key_type == key_type)
            .cloned()
            .collect())
    }

    async fn update(&self, updates: Vec<RecordUpdate>) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        for u in &updates {
            if !records.contains_key(&u.id) {
                return Err(StoreError::NotFound(u.id.clone()));
            }
        }
        for u in updates {
            let record = records.get_mut(&u.id).expect("checked above");
            record.ciphertext = u.ciphertext;
            record.nonce = u.nonce;
            if let Some(meta) = u.meta {
                record.meta = meta;
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn has_master_key(&self) -> Result<bool, StoreError> {
        Ok(self.records.read().await.values().any(|r| r.key_type.is_master_key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NONCE_LEN;

    fn rec(id: &str, t: KeyType) -> WrappedKeyRecord {
        WrappedKeyRecord::new(id, t, vec![1, 2, 3], [0u8; NONCE_LEN])
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = InMemoryStore::new();
        store.create(rec("dek_1", KeyType::DataEncryptionKey)).await.unwrap();
        let err = store.create(rec("dek_1", KeyType::DataEncryptionKey)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn find_by_type_filters() {
        let store = InMemoryStore::new();
        store.create(rec("dek_1", KeyType::DataEncryptionKey)).await.unwrap();
        store.create(rec("mk_pin_1", KeyType::MasterKeyPin)).await.unwrap();

        let deks = store.find_by_type(KeyType::DataEncryptionKey).await.unwrap();
        assert_eq!(deks.len(), 1);
        assert_eq!(deks[0].id, "dek_1");
    }

    #[tokio::test]
    async fn update_is_all_or_nothing() {
        let store = InMemoryStore::new();
        store.create(rec("dek_1", KeyType::DataEncryptionKey)).await.unwrap();

        let updates = vec![
            RecordUpdate { id: "dek_1".into(), ciphertext: vec![9], nonce: [1u8; NONCE_LEN], meta: None },
            RecordUpdate { id: "dek_missing".into(), ciphertext: vec![9], nonce: [1u8; NONCE_LEN], meta: None },
        ];
        let err = store.update(updates).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let still_there = store.find_by_id("dek_1").await.unwrap().unwrap();
        assert_eq!(still_there.ciphertext, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn has_master_key_checks_both_mk_types() {
        let store = InMemoryStore::new();
        assert!(!store.has_master_key().await.unwrap());
        store.create(rec("mk_fido_1", KeyType::MasterKeyFido)).await.unwrap();
        assert!(store.has_master_key().await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryStore::new();
        store.create(rec("dek_1", KeyType::DataEncryptionKey)).await.unwrap();
        store.delete("dek_1").await.unwrap();
        store.delete("dek_1").await.unwrap();
        assert!(store.find_by_id("dek_1").await.unwrap().is_none());
    }
}
