//! The Interaction Encryptor: chunks a plaintext interaction body, derives a
//! per-interaction key from the caller's DEK, seals each chunk with AAD
//! binding, and commits the header row and every blob row as one
//! all-or-nothing write.

use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::crypto::{self, CryptoError, NONCE_LEN};
use crate::key_hierarchy::{self, KeyHierarchyError};
use crate::persistence::{CipherBlob, InteractionHeader, PersistenceAdapter};

#[derive(Debug, Error)]
pub enum EncryptorError {
    #[error("no cached master key for this user")]
    Locked,

    #[error("ciphertext or header failed integrity verification")]
    Tampered,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    KeyHierarchy(#[from] KeyHierarchyError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("interaction not found")]
    NotFound,
}

impl From<crate::key_store::StoreError> for EncryptorError {
    fn from(err: crate::key_store::StoreError) -> Self {
        EncryptorError::Storage(err.to_string())
    }
}

/// Input to `seal_interaction`: everything the upstream capture layer knows
/// about one plaintext interaction.
pub struct PlaintextInteraction {
    pub user_id: String,
    pub model: Option<String>,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub plaintext: Vec<u8>,
    pub request_fingerprint: Option<String>,
    pub truncated: bool,
}

fn chunk_aad(user_id: &str, interaction_id: &str, chunk_index: u32, cipher_key_version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(user_id.len() + interaction_id.len() + 8);
    aad.extend_from_slice(user_id.as_bytes());
    aad.extend_from_slice(interaction_id.as_bytes());
    aad.extend_from_slice(&chunk_index.to_be_bytes());
    aad.extend_from_slice(&cipher_key_version.to_be_bytes());
    aad
}

/// Seal `input` under `dek` (resolved by the caller via
/// `UnlockService::get_decrypted_dek`) and commit it through `store`.
/// Returns the new interaction's id.
pub async fn seal_interaction<P: PersistenceAdapter + ?Sized>(
    store: &P,
    dek: &[u8],
    cipher_key_version: u32,
    chunk_size: usize,
    created_at_unix: u64,
    input: PlaintextInteraction,
) -> Result<String, EncryptorError> {
    let interaction_id = Uuid::new_v4().to_string();
    let key_nonce = crypto::random_bytes::<NONCE_LEN>();
    let ik = key_hierarchy::derive_interaction_key(dek, &key_nonce)?;

    let chunks: Vec<&[u8]> = if input.plaintext.is_empty() {
        vec![&input.plaintext[..]]
    } else {
        input.plaintext.chunks(chunk_size).collect()
    };

    let mut tx = store.begin_tx().await?;
    for (index, chunk) in chunks.iter().enumerate() {
        let chunk_index = index as u32;
        let nonce = crypto::random_bytes::<NONCE_LEN>();
        let aad = chunk_aad(&input.user_id, &interaction_id, chunk_index, cipher_key_version);

        let ciphertext = match crypto::aead_encrypt(chunk, &nonce, ik.expose_secret(), &aad) {
            Ok(ct) => ct,
            Err(err) => {
                store.rollback(tx).await.ok();
                return Err(err.into());
            }
        };

        store.insert_blob(&mut tx, CipherBlob { interaction_id: interaction_id.clone(), chunk_index, nonce, ciphertext }).await?;
    }

    let header = InteractionHeader {
        id: interaction_id.clone(),
        user_id: input.user_id,
        created_at_unix,
        model: input.model,
        tokens: input.tokens,
        cost_usd: input.cost_usd,
        key_nonce,
        cipher_key_version,
        request_fingerprint: input.request_fingerprint,
        chunk_count: chunks.len() as u32,
        byte_count: input.plaintext.len() as u64,
        chunk_size,
        truncated: input.truncated,
    };
    store.insert_header(&mut tx, header).await?;
    store.commit(tx).await?;

    Ok(interaction_id)
}

/// Read and decrypt an interaction, verifying `user_id` against the stored
/// header and every chunk against its recomputed AAD. The caller must
/// already hold the DEK (via `UnlockService::get_decrypted_dek`) — this
/// function does not itself check that an MK is cached.
pub async fn read_interaction<P: PersistenceAdapter + ?Sized>(store: &P, dek: &[u8], user_id: &str, interaction_id: &str) -> Result<Vec<u8>, EncryptorError> {
    let header = store.find_header(interaction_id).await?.ok_or(EncryptorError::NotFound)?;
    if header.user_id != user_id {
        return Err(EncryptorError::Tampered);
    }

    let ik = key_hierarchy::derive_interaction_key(dek, &header.key_nonce)?;
    let blobs = store.list_blobs(interaction_id).await?;
    if blobs.len() != header.chunk_count as usize {
        warn!(interaction_id, expected = header.chunk_count, found = blobs.len(), "chunk count mismatch on read");
        return Err(EncryptorError::Tampered);
    }

    let mut plaintext = Vec::with_capacity(header.byte_count as usize);
    for (expected_index, blob) in blobs.into_iter().enumerate() {
        if blob.chunk_index != expected_index as u32 {
            warn!(interaction_id, expected_index, found_index = blob.chunk_index, "chunk index out of order on read");
            return Err(EncryptorError::Tampered);
        }
        let aad = chunk_aad(user_id, interaction_id, blob.chunk_index, header.cipher_key_version);
        let chunk = crypto::aead_decrypt(&blob.ciphertext, &blob.nonce, ik.expose_secret(), &aad).map_err(|_| {
            warn!(interaction_id, chunk_index = blob.chunk_index, "aead tag mismatch on read, treating as tampered");
            EncryptorError::Tampered
        })?;
        plaintext.extend_from_slice(&chunk);
    }

    Ok(plaintext)
}
