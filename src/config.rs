//! Tunable parameters for the confidential storage core.
//!
//! Unlike a CLI profile, most of what lives here is not meant to be
//! user-configurable: the Argon2id cost parameters in particular are fixed
//! by policy, and `CoreConfig` exists so the rest of the crate references
//! one named value (`cfg.argon2`) instead of scattering magic numbers. The
//! fields that genuinely vary by deployment (cache sizes, lockout windows)
//! are still just struct fields with a conservative `Default` — there is no
//! config file format or schema version here, because there is nothing
//! external to migrate.

use std::time::Duration;

use crate::crypto::Argon2Tuning;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Argon2id parameters used to derive a KEK from a PIN. Fixed per policy;
    /// present as a field (not a constant) only so tests can swap in
    /// `Argon2Tuning::for_tests()` without touching call sites.
    pub argon2: Argon2Tuning,

    /// Chunk size used by the Interaction Encryptor. 64 KiB per the
    /// resolved Open Question; recorded per-header so a future crate version
    /// could vary it without breaking old ciphertext.
    pub chunk_size: usize,

    /// Maximum number of Master Keys held in the unlock cache at once.
    pub mk_cache_capacity: usize,
    /// Idle TTL before a cached MK is evicted even if capacity allows it to
    /// stay resident.
    pub mk_cache_idle_ttl: Duration,

    /// Failed PIN attempts allowed in `lockout_window` before the account is
    /// locked out.
    pub lockout_threshold: u32,
    pub lockout_window: Duration,

    /// Requests allowed per rate-limit key in `rate_limit_window` for the
    /// unlock and export endpoints respectively.
    pub unlock_rate_limit: u32,
    pub export_rate_limit: u32,
    pub rate_limit_window: Duration,

    /// Freshness window for a WebAuthn user-verification timestamp before
    /// `require_fresh_webauthn` demands a new assertion.
    pub webauthn_freshness_window: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            argon2: Argon2Tuning::spec_default(),
            chunk_size: 64 * 1024,
            mk_cache_capacity: 100,
            mk_cache_idle_ttl: Duration::from_secs(30 * 60),
            lockout_threshold: 5,
            lockout_window: Duration::from_secs(15 * 60),
            unlock_rate_limit: 5,
            export_rate_limit: 2,
            rate_limit_window: Duration::from_secs(60),
            webauthn_freshness_window: Duration::from_secs(5 * 60),
        }
    }
}
