//! In-memory `PersistenceAdapter`, layered over `InMemoryStore` for the
//! inherited Key Store operations.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::key_store::{InMemoryStore, KeyStore, KeyType, RecordUpdate, StoreError, WrappedKeyRecord};

use super::{CipherBlob, InteractionHeader, PersistenceAdapter, TxHandle};

#[derive(Default)]
pub struct InMemoryPersistence {
    keys: InMemoryStore,
    headers: RwLock<HashMap<String, InteractionHeader>>,
    blobs: RwLock<HashMap<String, Vec<CipherBlob>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryPersistence {
    async fn create(&self, record: WrappedKeyRecord) -> Result<(), StoreError> {
        self.keys.create(record).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<WrappedKeyRecord>, StoreError> {
        self.keys.find_by_id(id).await
    }

    async fn find_by_type(&self, key_type: KeyType) -> Result<Vec<WrappedKeyRecord>, StoreError> {
        self.keys.find_by_type(key_type).await
    }

    async fn update(&self, updates: Vec<RecordUpdate>) -> Result<(), StoreError> {
        self.keys.update(updates).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.keys.delete(id).await
    }

    async fn has_master_key(&self) -> Result<bool, StoreError> {
        self.keys.has_master_key().await
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn begin_tx(&self) -> Result<TxHandle, StoreError> {
        Ok(TxHandle::default())
    }

    async fn insert_header(&self, tx: &mut TxHandle, header: InteractionHeader) -> Result<(), StoreError> {
        tx.header = Some(header);
        Ok(())
    }

    async fn insert_blob(&self, tx: &mut TxHandle, blob: CipherBlob) -> Result<(), StoreError> {
        tx.blobs.push(blob);
        Ok(())
    }

    async fn commit(&self, tx: TxHandle) -> Result<(), StoreError> {
        let Some(header) = tx.header else {
            return Ok(());
        };
        let interaction_id = header.id.clone();

        let mut headers = self.headers.write().await;
        let mut blobs = self.blobs.write().await;
        headers.insert(interaction_id.clone(), header);
        blobs.insert(interaction_id, tx.blobs);
        Ok(())
    }

    async fn rollback(&self, _tx: TxHandle) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_header(&self, interaction_id: &str) -> Result<Option<InteractionHeader>, StoreError> {
        Ok(self.headers.read().await.get(interaction_id).cloned())
    }

    async fn list_blobs(&self, interaction_id: &str) -> Result<Vec<CipherBlob>, StoreError> {
        let mut blobs = self.blobs.read().await.get(interaction_id).cloned().unwrap_or_default();
        blobs.sort_by_key(|b| b.chunk_index);
        Ok(blobs)
    }

    async fn delete_interaction(&self, interaction_id: &str) -> Result<(), StoreError> {
        self.headers.write().await.remove(interaction_id);
        self.blobs.write().await.remove(interaction_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NONCE_LEN;

    fn header(id: &str) -> InteractionHeader {
        InteractionHeader {
            id: id.to_string(),
            user_id: "u1".to_string(),
            created_at_unix: 0,
            model: None,
            tokens: None,
            cost_usd: None,
            key_nonce: [0u8; NONCE_LEN],
            cipher_key_version: 1,
            request_fingerprint: None,
            chunk_count: 1,
            byte_count: 3,
            chunk_size: 65536,
            truncated: false,
        }
    }

    #[tokio::test]
    async fn commit_persists_header_and_blobs_together() {
        let store = InMemoryPersistence::new();
        let mut tx = store.begin_tx().await.unwrap();
        store.insert_header(&mut tx, header("i1")).await.unwrap();
        store
            .insert_blob(&mut tx, CipherBlob { interaction_id: "i1".into(), chunk_index: 0, nonce: [1u8; NONCE_LEN], ciphertext: vec![1, 2, 3] })
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert!(store.find_header("i1").await.unwrap().is_some());
        assert_eq!(store.list_blobs("i1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let store = InMemoryPersistence::new();
        let mut tx = store.begin_tx().await.unwrap();
        store.insert_header(&mut tx, header("i1")).await.unwrap();
        store.rollback(tx).await.unwrap();

        assert!(store.find_header("i1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_blobs_is_ordered_by_chunk_index() {
        let store = InMemoryPersistence::new();
        let mut tx = store.begin_tx().await.unwrap();
        store.insert_header(&mut tx, header("i1")).await.unwrap();
        for idx in [2u32, 0, 1] {
            store
                .insert_blob(&mut tx, CipherBlob { interaction_id: "i1".into(), chunk_index: idx, nonce: [idx as u8; NONCE_LEN], ciphertext: vec![idx as u8] })
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();

        let blobs = store.list_blobs("i1").await.unwrap();
        let indices: Vec<u32> = blobs.iter().map(|b| b.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
