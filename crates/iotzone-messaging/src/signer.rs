//! Signing, encryption, and verification of bus messages.
//!
//! Outbound objects are serialized to JSON, signed as a JWS when a signing
//! key is configured, and wrapped in a JWE when a recipient key is given.
//! Inbound payloads are decrypted first, then verified against the public
//! key of the sender the message claims to come from.

use iotzone_bus::{BusError, Handler, MessageBus, SubscriptionId};
use iotzone_core::envelope::{self, EncryptedMessage, EnvelopeError, SignedMessage};
use iotzone_core::KeyPair;
use p256::PublicKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::Span;

/// Looks up the public key of a sender address.
pub type PublicKeyResolver = Arc<dyn Fn(&str) -> Option<PublicKey> + Send + Sync>;

/// Wrap a closure as a [`PublicKeyResolver`].
pub fn resolver<F>(f: F) -> PublicKeyResolver
where
    F: Fn(&str) -> Option<PublicKey> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Result of decoding an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    /// The decoded object
    pub object: T,
    /// Whether the payload was encrypted
    pub encrypted: bool,
    /// Whether the payload was signed
    pub signed: bool,
    /// Sender claimed by a signed message
    pub sender: Option<String>,
}

/// Publishes objects as secured messages and decodes inbound ones.
pub struct MessageSigner {
    bus: Arc<dyn MessageBus>,
    signing_key: Option<KeyPair>,
    resolver: Option<PublicKeyResolver>,
    span: Span,
}

impl MessageSigner {
    /// Wrap a bus. Messages are neither signed nor verified until a key
    /// and resolver are configured.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            signing_key: None,
            resolver: None,
            span: tracing::info_span!("message_signer"),
        }
    }

    /// Sign outbound messages and decrypt inbound ones with `key`.
    #[must_use]
    pub fn with_signing_key(mut self, key: KeyPair) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Verify inbound signed messages with keys from `resolver`.
    #[must_use]
    pub fn with_resolver(mut self, resolver: PublicKeyResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Emit log events under `span` instead of the default one.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The underlying bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// The sender key resolver, if any.
    #[must_use]
    pub fn resolver(&self) -> Option<&PublicKeyResolver> {
        self.resolver.as_ref()
    }

    /// The span log events are emitted under.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Serialize `object` and publish it, signed if a signing key is set
    /// and encrypted if `recipient` is given.
    ///
    /// # Errors
    ///
    /// Returns error if the object cannot be serialized, signing or
    /// encryption fails, or the bus rejects the publication.
    pub async fn publish_object<T>(
        &self,
        address: &str,
        retained: bool,
        object: &T,
        recipient: Option<&PublicKey>,
    ) -> Result<(), MessageError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = self.encode(object, recipient)?;

        tracing::debug!(
            parent: &self.span,
            address,
            signed = self.signing_key.is_some(),
            encrypted = recipient.is_some(),
            payload_len = payload.len(),
            "Publishing object"
        );

        self.bus.publish(address, retained, &payload).await?;
        Ok(())
    }

    /// Publish `object` signed with the configured key.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::NoSigningKey`] if no key is configured, or
    /// any error of [`Self::publish_object`].
    pub async fn publish_signed<T>(&self, address: &str, retained: bool, object: &T) -> Result<(), MessageError>
    where
        T: Serialize + ?Sized + Sync,
    {
        if self.signing_key.is_none() {
            return Err(MessageError::NoSigningKey);
        }
        self.publish_object(address, retained, object, None).await
    }

    /// Publish `object` encrypted for `recipient`, signed if a key is configured.
    ///
    /// # Errors
    ///
    /// Returns any error of [`Self::publish_object`].
    pub async fn publish_encrypted<T>(
        &self,
        address: &str,
        retained: bool,
        object: &T,
        recipient: &PublicKey,
    ) -> Result<(), MessageError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish_object(address, retained, object, Some(recipient)).await
    }

    /// Encode `object` into a wire payload without publishing it.
    ///
    /// # Errors
    ///
    /// Returns error if serialization, signing, or encryption fails.
    pub fn encode<T>(&self, object: &T, recipient: Option<&PublicKey>) -> Result<Vec<u8>, MessageError>
    where
        T: Serialize + ?Sized,
    {
        let mut payload =
            serde_json::to_vec(object).map_err(|e| MessageError::Serialize(e.to_string()))?;

        if let Some(key) = &self.signing_key {
            payload = envelope::sign(&payload, key)?.into_bytes();
        }
        if let Some(recipient) = recipient {
            payload = envelope::encrypt(&payload, recipient)?.into_bytes();
        }

        Ok(payload)
    }

    /// Decrypt and verify an inbound payload using the configured resolver.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Decode`] if the payload cannot be decrypted
    /// or parsed, and [`MessageError::Signature`] if a signed message has
    /// no sender or fails verification.
    pub fn decode_message<T: DeserializeOwned>(&self, raw: &[u8]) -> Result<Decoded<T>, MessageError> {
        self.decode_message_with(raw, self.resolver.as_ref())
    }

    /// Like [`Self::decode_message`], verifying with `resolver` instead of
    /// the configured one. `None` accepts signed messages without a
    /// cryptographic check.
    ///
    /// # Errors
    ///
    /// See [`Self::decode_message`].
    pub fn decode_message_with<T: DeserializeOwned>(
        &self,
        raw: &[u8],
        resolver: Option<&PublicKeyResolver>,
    ) -> Result<Decoded<T>, MessageError> {
        let text = std::str::from_utf8(raw).map_err(|e| MessageError::Decode(e.to_string()))?;

        match EncryptedMessage::parse(text).map_err(decode_error)? {
            Some(encrypted) => {
                let key = self
                    .signing_key
                    .as_ref()
                    .ok_or_else(|| MessageError::Decode("no private key to decrypt message".to_string()))?;
                let plaintext = encrypted.decrypt(key).map_err(decode_error)?;
                let mut decoded = verify_payload(&plaintext, resolver)?;
                decoded.encrypted = true;
                Ok(decoded)
            }
            None => verify_payload(raw, resolver),
        }
    }

    /// Verify a signed, unencrypted payload using the configured resolver.
    /// Bare JSON is accepted with `signed == false`.
    ///
    /// # Errors
    ///
    /// See [`Self::decode_message`].
    pub fn verify_signed_message<T: DeserializeOwned>(&self, raw: &[u8]) -> Result<Decoded<T>, MessageError> {
        verify_payload(raw, self.resolver.as_ref())
    }

    /// Register a handler on the underlying bus.
    ///
    /// # Errors
    ///
    /// Returns error if the bus rejects the pattern.
    pub async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId, MessageError> {
        Ok(self.bus.subscribe(pattern, handler).await?)
    }

    /// Remove a handler from the underlying bus.
    pub async fn unsubscribe(&self, pattern: &str, id: Option<SubscriptionId>) {
        self.bus.unsubscribe(pattern, id).await;
    }
}

fn verify_payload<T: DeserializeOwned>(
    raw: &[u8],
    resolver: Option<&PublicKeyResolver>,
) -> Result<Decoded<T>, MessageError> {
    let text = std::str::from_utf8(raw).map_err(|e| MessageError::Decode(e.to_string()))?;

    let Some(signed) = SignedMessage::parse(text).map_err(decode_error)? else {
        let object = serde_json::from_slice(raw).map_err(|e| MessageError::Decode(e.to_string()))?;
        return Ok(Decoded {
            object,
            encrypted: false,
            signed: false,
            sender: None,
        });
    };

    let object = serde_json::from_slice(signed.payload()).map_err(|e| MessageError::Decode(e.to_string()))?;
    let sender = claimed_sender(signed.payload())?;

    if let Some(resolver) = resolver {
        let public_key = resolver(&sender)
            .ok_or_else(|| MessageError::Signature(format!("no public key for sender {sender}")))?;
        signed
            .verify(&public_key)
            .map_err(|e| MessageError::Signature(format!("{sender}: {e}")))?;
    }

    Ok(Decoded {
        object,
        encrypted: false,
        signed: true,
        sender: Some(sender),
    })
}

/// The `sender` field of a JSON payload, or `address` when `sender` is absent.
/// A field that is present must hold a non-empty string.
fn claimed_sender(payload: &[u8]) -> Result<String, MessageError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| MessageError::Decode(e.to_string()))?;

    let (field, claimed) = match value.get("sender") {
        Some(sender) => ("sender", sender),
        None => (
            "address",
            value
                .get("address")
                .ok_or_else(|| MessageError::Signature("message has no sender".to_string()))?,
        ),
    };

    match claimed.as_str() {
        Some(sender) if !sender.is_empty() => Ok(sender.to_string()),
        _ => Err(MessageError::Signature(format!("message has an empty or invalid {field}"))),
    }
}

#[allow(clippy::needless_pass_by_value)]
fn decode_error(e: EnvelopeError) -> MessageError {
    MessageError::Decode(e.to_string())
}

/// Errors for secured messaging.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Object could not be serialized
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Signing or encryption failed
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    /// Signed publish without a signing key
    #[error("no signing key configured")]
    NoSigningKey,
    /// Payload could not be decrypted or parsed
    #[error("decode error: {0}")]
    Decode(String),
    /// Sender missing or signature invalid
    #[error("signature error: {0}")]
    Signature(String),
    /// Message was not signed
    #[error("message is not signed")]
    Unsigned,
    /// Bus operation failed
    #[error(transparent)]
    Bus(#[from] BusError),
}
