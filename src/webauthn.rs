//! Thin wrapper over `webauthn-rs`, the audited relying-party library the
//! spec calls for at §4.4.2 ("verify assertion using an audited library").
//!
//! This crate does not reimplement COSE key parsing, signature
//! verification, or counter bookkeeping — `webauthn-rs`'s own ceremony
//! state (`PasskeyRegistration` / `PasskeyAuthentication`) already enforces
//! expected-challenge, expected-origin, expected-RP-ID matching and strict
//! counter increase. The `Passkey` it produces is stored verbatim (as JSON)
//! in the `fido2_<user_id>_<credential_id>` record's `meta`; the KEK used to
//! wrap the Master Key is still derived independently via
//! [`crate::key_hierarchy::derive_kek_from_webauthn`], per §4.3, so a
//! `Passkey` alone is never sufficient to recover the MK.

use thiserror::Error;
use webauthn_rs::prelude::*;

#[derive(Debug, Error)]
pub enum WebauthnError {
    #[error("webauthn relying party configuration error: {0}")]
    Configuration(String),

    #[error("registration ceremony failed: {0}")]
    RegistrationFailed(String),

    #[error("authentication ceremony failed: {0}")]
    AuthenticationFailed(String),
}

/// Relying-party configuration: origin and RP ID the spec requires every
/// assertion to match.
pub struct RelyingParty {
    webauthn: Webauthn,
}

impl RelyingParty {
    pub fn new(rp_id: &str, rp_origin: &Url) -> Result<Self, WebauthnError> {
        let builder = WebauthnBuilder::new(rp_id, rp_origin).map_err(|e| WebauthnError::Configuration(e.to_string()))?;
        let webauthn = builder.build().map_err(|e| WebauthnError::Configuration(e.to_string()))?;
        Ok(Self { webauthn })
    }

    /// Begin a registration ceremony for a new authenticator. The returned
    /// `PasskeyRegistration` is ceremony state the caller must hold (in the
    /// session) until `finish_registration` is called.
    pub fn start_registration(
        &self,
        user_id: Uuid,
        user_name: &str,
        user_display_name: &str,
        exclude_credentials: Option<Vec<CredentialID>>,
    ) -> Result<(CreationChallengeResponse, PasskeyRegistration), WebauthnError> {
        self.webauthn
            .start_passkey_registration(user_id, user_name, user_display_name, exclude_credentials)
            .map_err(|e| WebauthnError::RegistrationFailed(e.to_string()))
    }

    pub fn finish_registration(&self, response: &RegisterPublicKeyCredential, state: &PasskeyRegistration) -> Result<Passkey, WebauthnError> {
        self.webauthn
            .finish_passkey_registration(response, state)
            .map_err(|e| WebauthnError::RegistrationFailed(e.to_string()))
    }

    /// Begin an authentication ceremony over every passkey registered to the
    /// user (`allowCredentials`, per §4.4.2).
    pub fn start_authentication(&self, passkeys: &[Passkey]) -> Result<(RequestChallengeResponse, PasskeyAuthentication), WebauthnError> {
        self.webauthn
            .start_passkey_authentication(passkeys)
            .map_err(|e| WebauthnError::AuthenticationFailed(e.to_string()))
    }

    /// Verify an assertion. On success, `AuthenticationResult::cred_id()`
    /// and `.counter()` identify which credential responded and its new
    /// counter value — the caller must persist the new counter, per §4.4.2
    /// step 4.
    pub fn finish_authentication(&self, response: &PublicKeyCredential, state: &PasskeyAuthentication) -> Result<AuthenticationResult, WebauthnError> {
        self.webauthn
            .finish_passkey_authentication(response, state)
            .map_err(|e| WebauthnError::AuthenticationFailed(e.to_string()))
    }
}

/// Extract the raw bytes this crate's own `derive_kek_from_webauthn` needs
/// out of a finished assertion response: the client data JSON, the
/// credential id, and the signature. `webauthn-rs` already validated the
/// assertion by the time a caller has an `AuthenticationResult` in hand;
/// this is purely a field-extraction helper for the independent KEK
/// derivation the spec requires on top of that validation.
pub fn assertion_material(response: &PublicKeyCredential) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let client_data_json = response.response.client_data_json.clone().into();
    let credential_id = response.raw_id.clone().into();
    let signature = response.response.signature.clone().into();
    (client_data_json, credential_id, signature)
}
