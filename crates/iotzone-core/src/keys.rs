//! ECDSA P-256 identity keys.
//!
//! Provides key generation, PEM encoding, and the raw attestation signature
//! used to sign publisher identity records:
//!
//! - ECDSA P-256 over a SHA-256 digest of the payload
//! - `(r, s)` DER-encoded
//! - base64url-encoded without padding

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;

/// A P-256 private key together with its public half.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Wrap an existing secret key.
    #[must_use]
    pub fn from_secret(secret: SecretKey) -> Self {
        Self { secret }
    }

    /// Load a private key from PEM.
    ///
    /// Accepts PKCS#8 (`PRIVATE KEY`) and SEC1 (`EC PRIVATE KEY`) blocks.
    ///
    /// # Errors
    ///
    /// Returns error if the PEM is neither format or is not a P-256 key.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let secret = SecretKey::from_pkcs8_pem(pem)
            .or_else(|_| SecretKey::from_sec1_pem(pem))
            .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self { secret })
    }

    /// Encode the private key as a PKCS#8 PEM block.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails.
    pub fn to_pem(&self) -> Result<String, KeyError> {
        let pem = self
            .secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encode(e.to_string()))?;
        Ok(pem.as_str().to_owned())
    }

    /// The public half of this key pair.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Encode the public key as an SPKI PEM block.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails.
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        public_key_to_pem(&self.public_key())
    }

    /// The underlying secret key.
    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// ECDSA signing key for this pair.
    #[must_use]
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from(&self.secret)
    }

    /// Create an attestation signature over `payload`.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> String {
        let signature: Signature = self.signing_key().sign(payload);
        URL_SAFE_NO_PAD.encode(signature.to_der().as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Encode a public key as an SPKI PEM block.
///
/// # Errors
///
/// Returns error if encoding fails.
pub fn public_key_to_pem(public_key: &PublicKey) -> Result<String, KeyError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyError::Encode(e.to_string()))
}

/// Decode a public key from an SPKI PEM block.
///
/// # Errors
///
/// Returns error if the PEM is malformed or not a P-256 key.
pub fn public_key_from_pem(pem: &str) -> Result<PublicKey, KeyError> {
    PublicKey::from_public_key_pem(pem).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

/// Verify an attestation signature created by [`KeyPair::sign`].
///
/// # Errors
///
/// Returns error if the signature is not valid base64url DER or does not
/// match the payload and key.
pub fn verify(public_key: &PublicKey, payload: &[u8], signature: &str) -> Result<(), KeyError> {
    let der = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
    let signature =
        Signature::from_der(&der).map_err(|e| KeyError::InvalidSignature(e.to_string()))?;

    VerifyingKey::from(public_key)
        .verify(payload, &signature)
        .map_err(|_| KeyError::VerificationFailed)
}

/// Errors for key handling and attestation signatures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Private key could not be decoded
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    /// Public key could not be decoded
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    /// PEM encoding failed
    #[error("key encoding failed: {0}")]
    Encode(String),
    /// Signature could not be decoded
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    /// Signature does not match
    #[error("signature verification failed")]
    VerificationFailed,
}
