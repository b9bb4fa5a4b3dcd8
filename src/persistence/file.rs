//! File-backed `PersistenceAdapter`.
//!
//! An interaction's header and every cipher-blob row are written into a
//! staging directory `<base>/interactions/.tmp-<random>/` and then promoted
//! into place with a single `rename` — the same write-temp-then-rename
//! atomicity idiom `FileStore` uses for individual records, scaled up to a
//! whole directory so the header and all blobs become visible together or
//! not at all. The parent `interactions/` directory is fsynced after the
//! rename, same as `key_store::file::fsync_dir`, so the rename itself
//! survives a crash rather than only the file contents it points at.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use async_trait::async_trait;

use crate::crypto::NONCE_LEN;
use crate::key_store::file::FileStore;
use crate::key_store::{KeyStore, KeyType, RecordUpdate, StoreError, WrappedKeyRecord};

use super::{CipherBlob, InteractionHeader, PersistenceAdapter, TxHandle};

pub struct FilePersistence {
    keys: FileStore,
    base_dir: PathBuf,
}

impl FilePersistence {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        let keys = FileStore::new(&base_dir)?;
        fs::create_dir_all(base_dir.join("interactions")).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { keys, base_dir })
    }

    fn interactions_dir(&self) -> PathBuf {
        self.base_dir.join("interactions")
    }

    fn interaction_dir(&self, id: &str) -> PathBuf {
        self.interactions_dir().join(id)
    }
}

#[async_trait]
impl KeyStore for FilePersistence {
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

fn write_staged(staging: &Path, header: &InteractionHeader, blobs: &[CipherBlob]) -> Result<(), StoreError> {
    fs::create_dir_all(staging.join("blobs")).map_err(|e| StoreError::Io(e.to_string()))?;

    let header_bytes = serde_json::to_vec(header).map_err(|e| StoreError::Io(e.to_string()))?;
    let mut f = File::create(staging.join("header.json")).map_err(|e| StoreError::Io(e.to_string()))?;
    f.write_all(&header_bytes).map_err(|e| StoreError::Io(e.to_string()))?;
    f.sync_all().map_err(|e| StoreError::Io(e.to_string()))?;

    for blob in blobs {
        let path = staging.join("blobs").join(format!("{:010}.bin", blob.chunk_index));
        let mut payload = Vec::with_capacity(NONCE_LEN + blob.ciphertext.len());
        payload.extend_from_slice(&blob.nonce);
        payload.extend_from_slice(&blob.ciphertext);

        let mut f = File::create(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        f.write_all(&payload).map_err(|e| StoreError::Io(e.to_string()))?;
        f.sync_all().map_err(|e| StoreError::Io(e.to_string()))?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(|e| StoreError::Io(e.to_string()))?;
    }

    #[cfg(unix)]
    fs::set_permissions(staging.join("header.json"), fs::Permissions::from_mode(0o600)).map_err(|e| StoreError::Io(e.to_string()))?;

    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        let file = File::open(dir).map_err(|e| StoreError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StoreError::Io(e.to_string()))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn read_header_file(path: &Path) -> Result<InteractionHeader, StoreError> {
    let mut file = File::open(path).map_err(|e| StoreError::Io(e.to_string()))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).map_err(|e| StoreError::Io(e.to_string()))?;
    serde_json::from_str(&buf).map_err(|e| StoreError::Io(e.to_string()))
}

fn read_blobs_dir(interaction_id: &str, dir: &Path) -> Result<Vec<CipherBlob>, StoreError> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| StoreError::Io(e.to_string()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        let chunk_index: u32 = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::Io(format!("unparsable blob filename: {}", path.display())))?;

        let mut file = File::open(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(|e| StoreError::Io(e.to_string()))?;
        if buf.len() < NONCE_LEN {
            return Err(StoreError::Io("truncated blob file".into()));
        }
        let (nonce_bytes, ciphertext) = buf.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce_bytes.try_into().expect("split_at guarantees length");

        out.push(CipherBlob { interaction_id: interaction_id.to_string(), chunk_index, nonce, ciphertext: ciphertext.to_vec() });
    }

    Ok(out)
}

#[async_trait]
impl PersistenceAdapter for FilePersistence {
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
        let TxHandle { header, blobs } = tx;
        let Some(header) = header else {
            return Ok(());
        };
        let interactions_dir = self.interactions_dir();
        let final_dir = self.interaction_dir(&header.id);

        tokio::task::spawn_blocking(move || {
            let staging = interactions_dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
            write_staged(&staging, &header, &blobs)?;

            if final_dir.exists() {
                fs::remove_dir_all(&final_dir).map_err(|e| StoreError::Io(e.to_string()))?;
            }
            fs::rename(&staging, &final_dir).map_err(|e| StoreError::Io(e.to_string()))?;
            fsync_dir(&interactions_dir)
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn rollback(&self, _tx: TxHandle) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_header(&self, interaction_id: &str) -> Result<Option<InteractionHeader>, StoreError> {
        let path = self.interaction_dir(interaction_id).join("header.json");
        if !path.exists() {
            return Ok(None);
        }
        tokio::task::spawn_blocking(move || read_header_file(&path).map(Some))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn list_blobs(&self, interaction_id: &str) -> Result<Vec<CipherBlob>, StoreError> {
        let dir = self.interaction_dir(interaction_id).join("blobs");
        let interaction_id = interaction_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut blobs = read_blobs_dir(&interaction_id, &dir)?;
            blobs.sort_by_key(|b| b.chunk_index);
            Ok(blobs)
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn delete_interaction(&self, interaction_id: &str) -> Result<(), StoreError> {
        let dir = self.interaction_dir(interaction_id);
        tokio::task::spawn_blocking(move || {
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            chunk_count: 2,
            byte_count: 6,
            chunk_size: 65536,
            truncated: false,
        }
    }

    #[tokio::test]
    async fn commit_makes_header_and_blobs_visible_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path()).unwrap();

        let mut tx = store.begin_tx().await.unwrap();
        store.insert_header(&mut tx, header("i1")).await.unwrap();
        for idx in 0..2u32 {
            store
                .insert_blob(&mut tx, CipherBlob { interaction_id: "i1".into(), chunk_index: idx, nonce: [idx as u8; NONCE_LEN], ciphertext: vec![idx as u8; 4] })
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();

        let loaded = store.find_header("i1").await.unwrap().unwrap();
        assert_eq!(loaded.chunk_count, 2);
        let blobs = store.list_blobs("i1").await.unwrap();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].chunk_index, 0);
        assert_eq!(blobs[1].chunk_index, 1);
    }

    #[tokio::test]
    async fn rollback_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path()).unwrap();

        let mut tx = store.begin_tx().await.unwrap();
        store.insert_header(&mut tx, header("i1")).await.unwrap();
        store.rollback(tx).await.unwrap();

        assert!(store.find_header("i1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_interaction_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path()).unwrap();

        let mut tx = store.begin_tx().await.unwrap();
        store.insert_header(&mut tx, header("i1")).await.unwrap();
        store.commit(tx).await.unwrap();

        store.delete_interaction("i1").await.unwrap();
        assert!(store.find_header("i1").await.unwrap().is_none());
    }
}
