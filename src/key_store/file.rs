//! File-backed `KeyStore`: one JSON file per record under `<base_dir>/keys/`.
//!
//! Grounded on the same write-temp/fsync/rename-and-flock idiom used
//! throughout this crate for durable state. Blocking filesystem calls are
//! dispatched through `spawn_blocking` since the trait is async but
//! `std::fs` is not.
//!
//! `update` batches more than one record (MK rotation rewraps the DEK and
//! every wrapper in one call), so it stages the full post-update set in a
//! single fsynced `.keystore.journal` file before writing any individual
//! `keys/*.json` file. A crash mid-batch leaves the journal behind; the next
//! `FileStore::new` replays it before returning.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use async_trait::async_trait;

use super::{KeyStore, KeyType, RecordUpdate, StoreError, WrappedKeyRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

struct DirLock {
    #[allow(dead_code)]
    file: File,
}

impl DirLock {
    fn acquire(lock_path: &Path, mode: LockMode) -> Result<Self, StoreError> {
        #[cfg(unix)]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(lock_path)
            .map_err(|e| StoreError::Io(e.to_string()))?;

        #[cfg(not(unix))]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)
            .map_err(|e| StoreError::Io(e.to_string()))?;

        #[cfg(unix)]
        {
            let op = match mode {
                LockMode::Shared => libc::LOCK_SH,
                LockMode::Exclusive => libc::LOCK_EX,
            };
            let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
            if rc != 0 {
                return Err(StoreError::Io("failed to acquire file lock".into()));
            }
        }

        Ok(Self { file })
    }
}

/// Reference durable `KeyStore`. Not a production database — a demonstration
/// that the trait can be satisfied by real, crash-safe disk I/O.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        let store = Self { base_dir };
        store.ensure_dirs()?;
        store.recover_journal()?;
        Ok(store)
    }

    fn ensure_dirs(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.keys_dir()).map_err(|e| StoreError::Io(e.to_string()))?;
        set_dir_permissions(&self.base_dir)?;
        set_dir_permissions(&self.keys_dir())?;
        Ok(())
    }

    fn keys_dir(&self) -> PathBuf {
        self.base_dir.join("keys")
    }

    fn lock_path(&self) -> PathBuf {
        self.base_dir.join(".keystore.lock")
    }

    fn journal_path(&self) -> PathBuf {
        self.base_dir.join(".keystore.journal")
    }

    /// `update`'s batch commit writes every record's post-update bytes to a
    /// single journal file before touching any `keys/*.json` file, so a
    /// process kill mid-batch leaves the journal on disk rather than a
    /// half-rotated set of key records. Called once at startup, under the
    /// same exclusive lock `update` itself takes, so it never races a batch
    /// left by a still-running process.
    fn recover_journal(&self) -> Result<(), StoreError> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(());
        }
        let _lock = DirLock::acquire(&self.lock_path(), LockMode::Exclusive)?;
        if !path.exists() {
            return Ok(());
        }

        let mut file = File::open(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(|e| StoreError::Io(e.to_string()))?;
        let records: Vec<WrappedKeyRecord> = serde_json::from_str(&buf).map_err(|e| StoreError::Io(e.to_string()))?;
        for record in &records {
            self.write_record(record)?;
        }
        fs::remove_file(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.keys_dir().join(format!("{id}.json"))
    }

    fn read_record(&self, id: &str) -> Result<Option<WrappedKeyRecord>, StoreError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(|e| StoreError::Io(e.to_string()))?;
        let record = serde_json::from_str(&buf).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &WrappedKeyRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id);
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Io(e.to_string()))?;

        let dir = self.keys_dir();
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        tmp.as_file_mut().write_all(&bytes).map_err(|e| StoreError::Io(e.to_string()))?;
        tmp.as_file_mut().sync_all().map_err(|e| StoreError::Io(e.to_string()))?;

        #[cfg(unix)]
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| StoreError::Io(e.to_string()))?;

        tmp.persist(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        set_file_permissions(&path)?;
        fsync_dir(&dir)?;
        Ok(())
    }

    fn remove_record(&self, id: &str) -> Result<(), StoreError> {
        let path = self.record_path(id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<WrappedKeyRecord>, StoreError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(self.keys_dir()).map_err(|e| StoreError::Io(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let mut file = File::open(entry.path()).map_err(|e| StoreError::Io(e.to_string()))?;
            let mut buf = String::new();
            file.read_to_string(&mut buf).map_err(|e| StoreError::Io(e.to_string()))?;
            out.push(serde_json::from_str(&buf).map_err(|e| StoreError::Io(e.to_string()))?);
        }
        Ok(out)
    }
}

fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| StoreError::Io(e.to_string()))?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| StoreError::Io(e.to_string()))?;
    #[cfg(not(unix))]
    let _ = path;
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

#[async_trait]
impl KeyStore for FileStore {
    async fn create(&self, record: WrappedKeyRecord) -> Result<(), StoreError> {
        let base_dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || {
            let store = FileStore { base_dir };
            let _lock = DirLock::acquire(&store.lock_path(), LockMode::Exclusive)?;
            if store.record_path(&record.id).exists() {
                return Err(StoreError::Conflict(record.id));
            }
            store.write_record(&record)
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<WrappedKeyRecord>, StoreError> {
        let base_dir = self.base_dir.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let store = FileStore { base_dir };
            let _lock = DirLock::acquire(&store.lock_path(), LockMode::Shared)?;
            store.read_record(&id)
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn find_by_type(&self, key_type: KeyType) -> Result<Vec<WrappedKeyRecord>, StoreError> {
        let base_dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || {
            let store = FileStore { base_dir };
            let _lock = DirLock::acquire(&store.lock_path(), LockMode::Shared)?;
            Ok(store.list_all()?.into_iter().filter(|r| r.key_type == key_type).collect())
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn update(&self, updates: Vec<RecordUpdate>) -> Result<(), StoreError> {
        let base_dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || {
            let store = FileStore { base_dir };
            let _lock = DirLock::acquire(&store.lock_path(), LockMode::Exclusive)?;

            let mut current = Vec::with_capacity(updates.len());
            for u in &updates {
                let existing = store.read_record(&u.id)?.ok_or_else(|| StoreError::NotFound(u.id.clone()))?;
                current.push(existing);
            }

            let mut updated = Vec::with_capacity(current.len());
            for (mut record, update) in current.into_iter().zip(updates.into_iter()) {
                record.ciphertext = update.ciphertext;
                record.nonce = update.nonce;
                if let Some(meta) = update.meta {
                    record.meta = meta;
                }
                updated.push(record);
            }

            let journal_path = store.journal_path();
            let journal_bytes = serde_json::to_vec(&updated).map_err(|e| StoreError::Io(e.to_string()))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&store.base_dir).map_err(|e| StoreError::Io(e.to_string()))?;
            tmp.as_file_mut().write_all(&journal_bytes).map_err(|e| StoreError::Io(e.to_string()))?;
            tmp.as_file_mut().sync_all().map_err(|e| StoreError::Io(e.to_string()))?;
            #[cfg(unix)]
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::Io(e.to_string()))?;
            tmp.persist(&journal_path).map_err(|e| StoreError::Io(e.to_string()))?;
            fsync_dir(&store.base_dir)?;

            for record in &updated {
                store.write_record(record)?;
            }

            fs::remove_file(&journal_path).map_err(|e| StoreError::Io(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let base_dir = self.base_dir.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let store = FileStore { base_dir };
            let _lock = DirLock::acquire(&store.lock_path(), LockMode::Exclusive)?;
            store.remove_record(&id)
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn has_master_key(&self) -> Result<bool, StoreError> {
        let base_dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || {
            let store = FileStore { base_dir };
            let _lock = DirLock::acquire(&store.lock_path(), LockMode::Shared)?;
            Ok(store.list_all()?.iter().any(|r| r.key_type.is_master_key()))
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }
}
