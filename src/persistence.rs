//! The Persistence Adapter: the narrow storage interface the Interaction
//! Encryptor consumes, plus the Key Store operations a single storage
//! backend is expected to also provide.
//!
//! Ciphertext is exclusively owned here — the Encryptor only holds
//! transient borrows while sealing/opening chunks. Two reference
//! implementations are provided: [`mem::InMemoryPersistence`] and
//! [`file::FilePersistence`], mirroring the two `KeyStore` backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::NONCE_LEN;
use crate::key_store::{KeyStore, StoreError};

pub mod file;
pub mod mem;
pub mod queue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionHeader {
    pub id: String,
    pub user_id: String,
    pub created_at_unix: u64,
    pub model: Option<String>,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    /// Nonce used to derive the per-interaction key from the DEK. Persisted
    /// so the IK can be re-derived at decrypt time from nothing but this and
    /// the DEK.
    pub key_nonce: [u8; NONCE_LEN],
    pub cipher_key_version: u32,
    pub request_fingerprint: Option<String>,
    pub chunk_count: u32,
    pub byte_count: u64,
    pub chunk_size: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherBlob {
    pub interaction_id: String,
    pub chunk_index: u32,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Buffered writes for one commit-or-nothing transaction. Backends build
/// this up across `insert_header`/`insert_blob` calls and apply it all at
/// once in `commit`; `rollback` just drops it.
#[derive(Debug, Default)]
pub struct TxHandle {
    pub(crate) header: Option<InteractionHeader>,
    pub(crate) blobs: Vec<CipherBlob>,
}

#[async_trait]
pub trait PersistenceAdapter: KeyStore {
    async fn begin_tx(&self) -> Result<TxHandle, StoreError>;

    async fn insert_header(&self, tx: &mut TxHandle, header: InteractionHeader) -> Result<(), StoreError>;

    async fn insert_blob(&self, tx: &mut TxHandle, blob: CipherBlob) -> Result<(), StoreError>;

    async fn commit(&self, tx: TxHandle) -> Result<(), StoreError>;

    async fn rollback(&self, tx: TxHandle) -> Result<(), StoreError>;

    async fn find_header(&self, interaction_id: &str) -> Result<Option<InteractionHeader>, StoreError>;

    /// Cipher-blob rows for `interaction_id`, ordered ascending by
    /// `chunk_index`.
    async fn list_blobs(&self, interaction_id: &str) -> Result<Vec<CipherBlob>, StoreError>;

    async fn delete_interaction(&self, interaction_id: &str) -> Result<(), StoreError>;
}
