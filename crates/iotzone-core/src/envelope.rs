//! Compact signed and encrypted message envelopes.
//!
//! - Signed: JWS compact serialization, `ES256`
//! - Encrypted: JWE compact serialization, `ECDH-ES` key agreement with `A256GCM`
//!
//! Messages are signed first and then encrypted, so decoding is
//! decrypt-then-verify. Parsing returns `Ok(None)` when the text is not an
//! envelope of the requested kind at all, which lets callers fall back to
//! treating it as the next inner layer.

use crate::keys::KeyPair;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// JWS algorithm: ECDSA P-256 with SHA-256.
pub const SIGNING_ALGORITHM: &str = "ES256";

/// JWE key agreement algorithm.
pub const KEY_AGREEMENT_ALGORITHM: &str = "ECDH-ES";

/// JWE content encryption algorithm.
pub const CONTENT_ENCRYPTION: &str = "A256GCM";

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const COORDINATE_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedHeader {
    alg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedHeader {
    alg: String,
    enc: String,
    epk: EcJwk,
}

/// Public EC key in JWK form, as carried in the `epk` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EcJwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
}

impl EcJwk {
    fn from_public_key(public_key: &PublicKey) -> Self {
        let point = public_key.to_encoded_point(false);
        let x = point.x().map(|x| URL_SAFE_NO_PAD.encode(x)).unwrap_or_default();
        let y = point.y().map(|y| URL_SAFE_NO_PAD.encode(y)).unwrap_or_default();
        Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x,
            y,
        }
    }

    fn to_public_key(&self) -> Result<PublicKey, EnvelopeError> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(EnvelopeError::Malformed(format!(
                "unsupported epk {}/{}",
                self.kty, self.crv
            )));
        }
        let x = decode_segment(&self.x, "epk.x")?;
        let y = decode_segment(&self.y, "epk.y")?;
        if x.len() != COORDINATE_LEN || y.len() != COORDINATE_LEN {
            return Err(EnvelopeError::Malformed("epk coordinate length".to_string()));
        }

        let mut sec1 = Vec::with_capacity(1 + 2 * COORDINATE_LEN);
        sec1.push(0x04);
        sec1.extend_from_slice(&x);
        sec1.extend_from_slice(&y);

        PublicKey::from_sec1_bytes(&sec1).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

/// Wrap `payload` in a JWS compact serialization signed with `key`.
///
/// # Errors
///
/// Returns error if the header cannot be serialized.
pub fn sign(payload: &[u8], key: &KeyPair) -> Result<String, EnvelopeError> {
    let header = SignedHeader {
        alg: SIGNING_ALGORITHM.to_string(),
    };
    let header_json =
        serde_json::to_vec(&header).map_err(|e| EnvelopeError::Serialize(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let signature: Signature = key.signing_key().sign(signing_input.as_bytes());

    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// A parsed JWS compact message.
#[derive(Debug, Clone)]
pub struct SignedMessage {
    signing_input: String,
    payload: Vec<u8>,
    signature: Signature,
}

impl SignedMessage {
    /// Parse a JWS compact serialization.
    ///
    /// Returns `Ok(None)` if `text` is not a JWS at all.
    ///
    /// # Errors
    ///
    /// Returns error if `text` has a JWS header but the algorithm is not
    /// supported or the payload or signature segments are malformed.
    pub fn parse(text: &str) -> Result<Option<Self>, EnvelopeError> {
        let parts: Vec<&str> = text.trim().split('.').collect();
        let [header_b64, payload_b64, signature_b64] = parts.as_slice() else {
            return Ok(None);
        };
        let Some(header) = decode_header::<SignedHeader>(header_b64) else {
            return Ok(None);
        };

        if header.alg != SIGNING_ALGORITHM {
            return Err(EnvelopeError::UnsupportedAlgorithm(header.alg));
        }

        let payload = decode_segment(payload_b64, "payload")?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| EnvelopeError::InvalidSignature(e.to_string()))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| EnvelopeError::InvalidSignature(e.to_string()))?;

        Ok(Some(Self {
            signing_input: format!("{header_b64}.{payload_b64}"),
            payload,
            signature,
        }))
    }

    /// The signed payload. Not authenticated until [`Self::verify`] succeeds.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the message and return the payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Verify the signature against `public_key`.
    ///
    /// # Errors
    ///
    /// Returns error if the signature does not match.
    pub fn verify(&self, public_key: &PublicKey) -> Result<(), EnvelopeError> {
        VerifyingKey::from(public_key)
            .verify(self.signing_input.as_bytes(), &self.signature)
            .map_err(|_| EnvelopeError::VerificationFailed)
    }
}

/// Wrap `plaintext` in a JWE compact serialization for `recipient`.
///
/// # Errors
///
/// Returns error if the header cannot be serialized or encryption fails.
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<String, EnvelopeError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let header = EncryptedHeader {
        alg: KEY_AGREEMENT_ALGORITHM.to_string(),
        enc: CONTENT_ENCRYPTION.to_string(),
        epk: EcJwk::from_public_key(&ephemeral.public_key()),
    };
    let header_json =
        serde_json::to_vec(&header).map_err(|e| EnvelopeError::Serialize(e.to_string()))?;
    let protected = URL_SAFE_NO_PAD.encode(header_json);

    let shared = ephemeral.diffie_hellman(recipient);
    let cek = concat_kdf(shared.raw_secret_bytes());

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(&cek).map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;
    let mut sealed = cipher
        .encrypt(
            &Nonce::from(iv),
            Payload {
                msg: plaintext,
                aad: protected.as_bytes(),
            },
        )
        .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    // ECDH-ES uses the agreed key directly, so the encrypted key segment is empty.
    Ok(format!(
        "{protected}..{}.{}.{}",
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(sealed),
        URL_SAFE_NO_PAD.encode(tag)
    ))
}

/// A parsed JWE compact message.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    protected: String,
    header: EncryptedHeader,
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
}

impl EncryptedMessage {
    /// Parse a JWE compact serialization.
    ///
    /// Returns `Ok(None)` if `text` is not a JWE at all.
    ///
    /// # Errors
    ///
    /// Returns error if `text` has a JWE header but uses unsupported
    /// algorithms or has malformed segments.
    pub fn parse(text: &str) -> Result<Option<Self>, EnvelopeError> {
        let parts: Vec<&str> = text.trim().split('.').collect();
        let [protected, encrypted_key, iv_b64, ciphertext_b64, tag_b64] = parts.as_slice() else {
            return Ok(None);
        };
        let Some(header) = decode_header::<EncryptedHeader>(protected) else {
            return Ok(None);
        };

        if header.alg != KEY_AGREEMENT_ALGORITHM {
            return Err(EnvelopeError::UnsupportedAlgorithm(header.alg));
        }
        if header.enc != CONTENT_ENCRYPTION {
            return Err(EnvelopeError::UnsupportedAlgorithm(header.enc));
        }
        if !encrypted_key.is_empty() {
            return Err(EnvelopeError::Malformed(
                "encrypted key must be empty for ECDH-ES".to_string(),
            ));
        }

        let iv_bytes = decode_segment(iv_b64, "iv")?;
        let iv: [u8; IV_LEN] = iv_bytes
            .as_slice()
            .try_into()
            .map_err(|_| EnvelopeError::Malformed(format!("iv length {}", iv_bytes.len())))?;
        let tag = decode_segment(tag_b64, "tag")?;
        if tag.len() != TAG_LEN {
            return Err(EnvelopeError::Malformed(format!("tag length {}", tag.len())));
        }

        Ok(Some(Self {
            protected: (*protected).to_string(),
            header,
            iv,
            ciphertext: decode_segment(ciphertext_b64, "ciphertext")?,
            tag,
        }))
    }

    /// Decrypt with the recipient's private key.
    ///
    /// # Errors
    ///
    /// Returns error if the ephemeral key is invalid or authentication fails.
    pub fn decrypt(&self, key: &KeyPair) -> Result<Vec<u8>, EnvelopeError> {
        let epk = self.header.epk.to_public_key()?;
        let shared =
            p256::ecdh::diffie_hellman(key.secret_key().to_nonzero_scalar(), epk.as_affine());
        let cek = concat_kdf(shared.raw_secret_bytes());

        let cipher =
            Aes256Gcm::new_from_slice(&cek).map_err(|e| EnvelopeError::Decrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(self.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&self.ciphertext);
        sealed.extend_from_slice(&self.tag);

        cipher
            .decrypt(
                &Nonce::from(self.iv),
                Payload {
                    msg: &sealed,
                    aad: self.protected.as_bytes(),
                },
            )
            .map_err(|_| EnvelopeError::Decrypt("authentication failed".to_string()))
    }
}

/// Single-round Concat KDF (NIST SP 800-56A) as used by JWE `ECDH-ES`.
fn concat_kdf(shared_secret: &[u8]) -> [u8; 32] {
    let algorithm_id = CONTENT_ENCRYPTION.as_bytes();

    let mut hasher = Sha256::new();
    hasher.update(1u32.to_be_bytes());
    hasher.update(shared_secret);
    hasher.update(u32::try_from(algorithm_id.len()).unwrap_or(u32::MAX).to_be_bytes());
    hasher.update(algorithm_id);
    // Empty PartyUInfo and PartyVInfo
    hasher.update(0u32.to_be_bytes());
    hasher.update(0u32.to_be_bytes());
    // Key length in bits
    hasher.update(256u32.to_be_bytes());
    hasher.finalize().into()
}

fn decode_header<H: for<'de> Deserialize<'de>>(segment: &str) -> Option<H> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>, EnvelopeError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| EnvelopeError::Malformed(format!("{name}: {e}")))
}

/// Errors for envelope encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Header serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Envelope structure is broken
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// Envelope uses an algorithm we do not accept
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Signature segment could not be decoded
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    /// Signature does not match
    #[error("signature verification failed")]
    VerificationFailed,
    /// Encryption failed
    #[error("encryption failed: {0}")]
    Encrypt(String),
    /// Decryption failed
    #[error("decryption failed: {0}")]
    Decrypt(String),
}
