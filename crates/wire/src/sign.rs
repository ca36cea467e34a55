//! Ed25519 frame signing.
//!
//! One active key signs every sequenced frame when signing is enabled. The
//! signature covers the canonical JSON bytes of the frame excluding the
//! signature fields themselves; `keyId` is the first 16 hex characters of
//! the SHA-256 of the SPKI DER public key, so rotation stays non-breaking
//! for subscribers that pin by key id.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::pkcs8::EncodePublicKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of the `keyId` hex prefix.
const KEY_ID_LEN: usize = 16;

/// Signing error.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame carries no signature")]
    MissingSignature,
    #[error("signature is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("signature has wrong length")]
    BadSignatureLength,
    #[error("public key DER encoding failed: {0}")]
    Der(#[from] ed25519_dalek::pkcs8::spki::Error),
}

/// The active signing key plus its derived identity.
pub struct FrameSigner {
    signing_key: SigningKey,
    key_id: String,
    public_key_b64: String,
}

impl FrameSigner {
    /// Build a signer from a 32-byte secret (the configured secret source).
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, SignError> {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    /// Generate a fresh key (first use without a configured secret).
    pub fn generate() -> Result<Self, SignError> {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Result<Self, SignError> {
        let spki_der = signing_key.verifying_key().to_public_key_der()?;
        let digest = Sha256::digest(spki_der.as_bytes());
        let key_id = format!("{digest:x}")[..KEY_ID_LEN].to_string();
        let public_key_b64 = BASE64.encode(spki_der.as_bytes());

        Ok(Self {
            signing_key,
            key_id,
            public_key_b64,
        })
    }

    /// Stable identity of the active key.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// SPKI DER public key, base64 (exposed through the public config).
    pub fn public_key_b64(&self) -> &str {
        &self.public_key_b64
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The raw secret, for persisting a generated key.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign a frame value in place: computes the signature over the current
    /// canonical serialization, then attaches `sig` and `keyId`.
    pub fn attach_signature(&self, value: &mut Value) -> Result<(), SignError> {
        let canonical = value.to_string();
        let signature = self.signing_key.sign(canonical.as_bytes());

        let object = value.as_object_mut().ok_or(SignError::NotAnObject)?;
        object.insert("sig".to_string(), Value::String(BASE64.encode(signature.to_bytes())));
        object.insert("keyId".to_string(), Value::String(self.key_id.clone()));
        Ok(())
    }
}

/// Verify a signed frame value: strips `sig`/`keyId`, re-serializes, and
/// checks the signature (client support and tests).
pub fn verify_signed(key: &VerifyingKey, value: &Value) -> Result<bool, SignError> {
    let mut stripped = value.clone();
    let object = stripped.as_object_mut().ok_or(SignError::NotAnObject)?;
    let sig_b64 = object
        .remove("sig")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or(SignError::MissingSignature)?;
    object.remove("keyId");

    let sig_bytes = BASE64.decode(sig_b64)?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| SignError::BadSignatureLength)?;
    let signature = Signature::from_bytes(&sig_array);

    let canonical = stripped.to_string();
    Ok(key.verify(canonical.as_bytes(), &signature).is_ok())
}
