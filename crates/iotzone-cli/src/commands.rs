//! CLI command implementations.

use crate::config::CliConfig;
use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use iotzone_bus::{handler, MessageBus, MqttBus};
use iotzone_core::keys::public_key_from_pem;
use iotzone_core::{KeyPair, PublisherIdentity, PublisherIdentityMessage};
use iotzone_messaging::{Decoded, MessageSigner};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};

/// Generate a key pair, write the private key to `path`, and return the
/// public key PEM. An existing file is never overwritten.
pub fn keygen(path: &Path) -> Result<String> {
    if path.exists() {
        bail!("Key file {} already exists", path.display());
    }

    let keys = KeyPair::generate();
    fs::write(path, keys.to_pem()?)
        .with_context(|| format!("Failed to write key file {}", path.display()))?;

    tracing::info!(path = %path.display(), "Generated key pair");
    Ok(keys.public_key_pem()?)
}

/// Public key PEM of the private key stored at `path`.
pub fn pubkey(path: &Path) -> Result<String> {
    Ok(load_key(path)?.public_key_pem()?)
}

/// Issue an identity for `publisher_id`, attested with the key at `issuer_key`.
pub fn attest(
    issuer_key: &Path,
    issuer_name: &str,
    domain: &str,
    publisher_id: &str,
    public_key_file: &Path,
    valid_days: i64,
) -> Result<PublisherIdentityMessage> {
    let issuer = load_key(issuer_key)?;
    let public_key = fs::read_to_string(public_key_file)
        .with_context(|| format!("Failed to read public key {}", public_key_file.display()))?;
    public_key_from_pem(&public_key).context("Invalid publisher public key")?;

    let identity = PublisherIdentity {
        domain: domain.to_string(),
        publisher_id: publisher_id.to_string(),
        public_key,
        issuer_name: issuer_name.to_string(),
        valid_until: Utc::now() + Duration::days(valid_days),
    };
    Ok(PublisherIdentityMessage::new(identity, &issuer)?)
}

/// Check the attestation and expiry of the identity message stored at `message_file`.
pub fn verify(message_file: &Path, issuer_public_key_file: &Path) -> Result<PublisherIdentity> {
    let json = fs::read(message_file)
        .with_context(|| format!("Failed to read identity message {}", message_file.display()))?;
    let message: PublisherIdentityMessage =
        serde_json::from_slice(&json).context("Invalid identity message")?;

    let issuer_pem = fs::read_to_string(issuer_public_key_file).with_context(|| {
        format!("Failed to read issuer public key {}", issuer_public_key_file.display())
    })?;
    let issuer = public_key_from_pem(&issuer_pem).context("Invalid issuer public key")?;

    message
        .identity
        .verify_attestation(&issuer, &message.identity_signature)
        .context("Identity attestation is invalid")?;
    if message.identity.valid_until < Utc::now() {
        bail!("Identity expired at {}", message.identity.valid_until);
    }

    Ok(message.identity)
}

/// Print every message matching `pattern` until interrupted.
pub async fn watch(config: &CliConfig, pattern: &str) -> Result<()> {
    let bus = Arc::new(MqttBus::new(config.bus.clone()));
    let mut signer = MessageSigner::new(bus.clone());
    if config.key_file.exists() {
        signer = signer.with_signing_key(load_key(&config.key_file)?);
    }
    let signer = Arc::new(signer);

    bus.connect(None).await.context("Failed to connect to broker")?;

    let decoder: Weak<MessageSigner> = Arc::downgrade(&signer);
    bus.subscribe(
        pattern,
        handler(move |address, payload| {
            let Some(signer) = decoder.upgrade() else {
                return Ok(());
            };
            let decoded: Decoded<serde_json::Value> = signer.decode_message(payload)?;
            println!(
                "{address} signed={} encrypted={} sender={}\n{}",
                decoded.signed,
                decoded.encrypted,
                decoded.sender.as_deref().unwrap_or("-"),
                decoded.object
            );
            Ok(())
        }),
    )
    .await
    .context("Failed to subscribe")?;

    tracing::info!(pattern, "Watching; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    bus.disconnect().await;
    Ok(())
}

/// Publish `json` on `address`, signed with the configured key.
pub async fn publish(config: &CliConfig, address: &str, json: &str, retained: bool) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json).context("Invalid JSON payload")?;
    let keys = load_key(&config.key_file)?;

    let bus = Arc::new(MqttBus::new(config.bus.clone()));
    let signer = MessageSigner::new(bus.clone()).with_signing_key(keys);

    bus.connect(None).await.context("Failed to connect to broker")?;
    let result = signer.publish_signed(address, retained, &value).await;
    bus.disconnect().await;

    result.with_context(|| format!("Failed to publish on {address}"))?;
    tracing::info!(address, retained, "Published");
    Ok(())
}

fn load_key(path: &Path) -> Result<KeyPair> {
    let pem = fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    KeyPair::from_pem(&pem).with_context(|| format!("Invalid key file {}", path.display()))
}
