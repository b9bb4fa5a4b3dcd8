//! Cryptographic primitives facade.
//!
//! A thin adapter over audited crates, not a crypto implementation of our
//! own: AEAD via `chacha20poly1305`, password hashing via `argon2`, key
//! separation via `hkdf`. Every function here either succeeds or fails on
//! caller misuse (wrong key length) or on a genuine authentication failure
//! (`CryptoError::Aead`) — there is no partial success.
//!
//! Security notes:
//!
//! - Never reuse a `(key, nonce)` pair with XChaCha20-Poly1305. Every caller
//!   in this crate generates a fresh random nonce per seal.
//! - Treat all plaintext returned from `aead_decrypt` as sensitive and drop
//!   it as soon as possible.
//! - `argon2id` parameters are fixed by `ARGON2_PARAMS` and must not be
//!   weakened by callers; the spec's hardening guidance is load-bearing, not
//!   a suggestion.

use argon2::{Algorithm, Argon2, Params as Argon2Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretSlice};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size (bytes) of keys handled by this facade (MK, DEK, KEK, IK).
pub const KEY_LEN: usize = 32;
/// Size (bytes) of XChaCha20-Poly1305 nonces.
pub const NONCE_LEN: usize = 24;
/// Size (bytes) of the Poly1305 authentication tag appended to ciphertext.
pub const TAG_LEN: usize = 16;

/// Secret bytes held in memory with zeroize-on-drop semantics.
pub type SecretBytes = SecretSlice<u8>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("invalid nonce length")]
    InvalidNonceLength,

    #[error("argon2 error: {0}")]
    Argon2(String),

    #[error("hkdf error")]
    Hkdf,

    #[error("authenticated decryption failed")]
    Aead,
}

/// Argon2id tuning parameters. Fixed per spec: t=3, m=128 MiB, p=1, 32-byte
/// output. Exposed as a type (rather than bare constants) so the Setup and
/// Unlock services can reference `ARGON2_PARAMS` without repeating magic
/// numbers, mirroring the teacher's `KdfParams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Tuning {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2Tuning {
    pub const fn spec_default() -> Self {
        Self {
            memory_kib: 128 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }

    /// Cheap parameters for tests only — the spec's real parameters are
    /// deliberately too slow to run thousands of times in a test suite.
    pub const fn for_tests() -> Self {
        Self {
            memory_kib: 8 * 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn to_argon2_params(self) -> Result<Argon2Params, CryptoError> {
        Argon2Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_LEN))
            .map_err(|e| CryptoError::Argon2(e.to_string()))
    }
}

impl Default for Argon2Tuning {
    fn default() -> Self {
        Self::spec_default()
    }
}

/// Generate `N` cryptographically-secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate `n` cryptographically-secure random bytes.
pub fn random_vec(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Argon2id(password, salt) -> 32-byte key. Parameters MUST come from
/// `Argon2Tuning`; there is no way to call this with arbitrary cost, by
/// design.
pub fn argon2id(password: &[u8], salt: &[u8], tuning: Argon2Tuning) -> Result<SecretBytes, CryptoError> {
    let params = tuning.to_argon2_params()?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = vec![0u8; KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CryptoError::Argon2(e.to_string()))?;
    Ok(SecretBytes::from(out))
}

/// HKDF-SHA256(ikm, salt, info) -> `out_len` bytes.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<SecretBytes, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out).map_err(|_| CryptoError::Hkdf)?;
    Ok(SecretBytes::from(out))
}

/// AEAD-seal `plaintext` under `key` with a caller-supplied unique `nonce`.
/// `aad` is bound into the tag but not encrypted.
pub fn aead_encrypt(plaintext: &[u8], nonce: &[u8; NONCE_LEN], key: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Aead)
}

/// AEAD-open a ciphertext produced by `aead_encrypt`. Fails with
/// `CryptoError::Aead` on tag mismatch, wrong key, wrong nonce, or altered
/// AAD — these are all indistinguishable to the caller by design.
pub fn aead_decrypt(ciphertext: &[u8], nonce: &[u8; NONCE_LEN], key: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Aead)?;
    Ok(Zeroizing::new(plaintext))
}

/// Parse a fixed-size nonce out of an arbitrary slice (e.g. a hex-decoded
/// stored nonce).
pub fn nonce_from_slice(bytes: &[u8]) -> Result<[u8; NONCE_LEN], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidNonceLength)
}

/// Constant-time byte-slice equality. Used for recovery-code verification and
/// anywhere else the core compares secret-derived bytes outside of an AEAD
/// tag check.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Best-effort zeroization of a byte buffer. Most key material in this crate
/// is already wrapped in `SecretBytes`/`Zeroizing`, which zeroize on drop
/// automatically; this is for the rare case of a plain `Vec<u8>` that briefly
/// held key material (e.g. a buffer handed back across an FFI-ish boundary).
pub fn zeroize(bytes: &mut [u8]) {
    use zeroize::Zeroize;
    bytes.zeroize();
}
