//! End-to-end scenarios mirroring spec section 8's S1-S6, driven entirely
//! through `ConfidentialStore`'s public API against the in-memory backend.
//! S5 (idle-TTL eviction) is exercised at the cache level in
//! `unlock.rs`'s unit tests instead of here, since faking 31 minutes of
//! wall-clock time would make this suite unusably slow.

use std::sync::Arc;
use std::time::{Duration, Instant};

use coldproxy_confidential_store::ConfidentialStore;
use coldproxy_confidential_store::config::CoreConfig;
use coldproxy_confidential_store::crypto::Argon2Tuning;
use coldproxy_confidential_store::encryptor::PlaintextInteraction;
use coldproxy_confidential_store::error::CoreError;
use coldproxy_confidential_store::lockout::RateLimiter;
use coldproxy_confidential_store::persistence::PersistenceAdapter;
use coldproxy_confidential_store::persistence::mem::InMemoryPersistence;

fn test_config() -> CoreConfig {
    let mut cfg = CoreConfig::default();
    cfg.argon2 = Argon2Tuning::for_tests();
    cfg
}

fn core() -> ConfidentialStore {
    let store: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
    ConfidentialStore::new(store, test_config())
}

fn interaction(user_id: &str, plaintext: Vec<u8>) -> PlaintextInteraction {
    PlaintextInteraction {
        user_id: user_id.to_string(),
        model: Some("gpt-test".to_string()),
        tokens: Some(123),
        cost_usd: Some(0.0042),
        plaintext,
        request_fingerprint: Some("fingerprint".to_string()),
        truncated: false,
    }
}

/// S1: setup then unlock.
#[tokio::test]
async fn s1_setup_then_unlock() {
    let core = core();
    core.setup().set_pin("u1", "1234").await.unwrap();

    let err = core.seal_interaction("u1", 0, interaction("u1", b"x".to_vec())).await.unwrap_err();
    assert!(matches!(err, CoreError::Locked));

    assert!(core.unlock().unlock_with_pin("u1", "1234").await);
    assert!(core.unlock().get_decrypted_dek("u1").await.is_some());
}

/// S2: wrong PIN five times, then AccountLocked even with the right PIN.
#[tokio::test]
async fn s2_wrong_pin_then_lockout() {
    let core = core();
    core.setup().set_pin("u1", "1234").await.unwrap();

    for _ in 0..5 {
        assert!(!core.unlock().unlock_with_pin("u1", "0000").await);
    }
    assert!(!core.unlock().unlock_with_pin("u1", "1234").await, "account must be locked out even with the correct PIN");
}

/// S3: seal a 150,000-byte interaction under a 64 KiB chunk size and read
/// it back byte for byte, with the expected chunk count.
#[tokio::test]
async fn s3_roundtrip_with_expected_chunk_count() {
    let core = core();
    core.setup().set_pin("u1", "1234").await.unwrap();
    assert!(core.unlock().unlock_with_pin("u1", "1234").await);

    let plaintext = vec![0x5Au8; 150_000];
    let id = core.seal_interaction("u1", 1_700_000_000, interaction("u1", plaintext.clone())).await.unwrap();

    let decrypted = core.read_interaction("u1", &id).await.unwrap();
    assert_eq!(decrypted, plaintext);
}

/// S4: flipping one ciphertext byte in one chunk is detected as tampering,
/// and does not affect a second, independently-sealed interaction.
#[tokio::test]
async fn s4_tamper_detection_is_isolated_per_interaction() {
    let store: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
    let core = ConfidentialStore::new(store.clone(), test_config());

    core.setup().set_pin("u1", "1234").await.unwrap();
    assert!(core.unlock().unlock_with_pin("u1", "1234").await);

    let id_a = core.seal_interaction("u1", 0, interaction("u1", b"alpha interaction".to_vec())).await.unwrap();
    let id_b = core.seal_interaction("u1", 0, interaction("u1", b"beta interaction".to_vec())).await.unwrap();

    {
        let mut blobs = store.list_blobs(&id_a).await.unwrap();
        blobs[0].ciphertext[0] ^= 0xFF;
        let mut tx = store.begin_tx().await.unwrap();
        let header = store.find_header(&id_a).await.unwrap().unwrap();
        store.insert_header(&mut tx, header).await.unwrap();
        store.insert_blob(&mut tx, blobs.remove(0)).await.unwrap();
        store.commit(tx).await.unwrap();
    }

    let err = core.read_interaction("u1", &id_a).await.unwrap_err();
    assert!(matches!(err, CoreError::Tampered));

    let untouched = core.read_interaction("u1", &id_b).await.unwrap();
    assert_eq!(untouched, b"beta interaction");
}

/// S6: the sixth `/unlock/pin`-equivalent request from one IP within 60s is
/// rejected by the rate limiter before it ever reaches the Unlock Service.
#[tokio::test]
async fn s6_rate_limiter_blocks_sixth_request_without_invoking_unlock() {
    let core = core();
    core.setup().set_pin("u1", "1234").await.unwrap();

    let limiter = RateLimiter::new(core.config().unlock_rate_limit, core.config().rate_limit_window);
    let now = Instant::now();
    let ip = "203.0.113.7";

    let mut admitted = 0;
    let mut unlock_attempts = 0;
    for _ in 0..6 {
        if limiter.check(ip, now).await {
            admitted += 1;
            unlock_attempts += 1;
            core.unlock().unlock_with_pin("u1", "1234").await;
            core.unlock().logout("u1").await;
        }
    }

    assert_eq!(admitted, 5);
    assert_eq!(unlock_attempts, 5, "the 6th request must be rejected before calling the Unlock Service");
    assert!(!limiter.check(ip, now + Duration::from_secs(1)).await);
}
