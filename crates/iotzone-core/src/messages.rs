//! Discovery, identity, and value messages exchanged on the bus.
//!
//! Every message carries the `address` it is published on. Messages sent on
//! behalf of another party also carry a `sender` address, which is what the
//! receiving side uses to look up the signer's public key.

use crate::address::{Address, MessageType};
use crate::keys::{self, KeyError, KeyPair};
use chrono::{DateTime, Utc};
use p256::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Description of a node configuration attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAttr {
    /// Value data type, e.g. "int", "bool", "string"
    pub datatype: String,
    /// Default value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Human readable description
    #[serde(default)]
    pub description: String,
}

/// Node discovery, published on `{domain}/{publisherId}/{nodeId}/$node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDiscoveryMessage {
    /// Discovery address of the node
    pub address: String,
    /// Publisher that owns the node
    pub publisher_id: String,
    /// Node identifier
    pub node_id: String,
    /// Kind of device or service
    pub node_type: String,
    /// Informational attributes
    #[serde(default)]
    pub attr: HashMap<String, String>,
    /// Configurable attributes
    #[serde(default)]
    pub config: HashMap<String, ConfigAttr>,
    /// Runtime status attributes
    #[serde(default)]
    pub status: HashMap<String, String>,
    /// Time the discovery was created
    pub timestamp: DateTime<Utc>,
}

impl NodeDiscoveryMessage {
    /// Create a discovery message for a node.
    #[must_use]
    pub fn new(domain: &str, publisher_id: &str, node_id: &str, node_type: &str) -> Self {
        let address =
            Address::node(domain, publisher_id, node_id).with_message_type(MessageType::Node);
        Self {
            address: address.to_string(),
            publisher_id: publisher_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            attr: HashMap::new(),
            config: HashMap::new(),
            status: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Input discovery, published on `{node}/{inputType}/{instance}/$input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDiscoveryMessage {
    /// Discovery address of the input
    pub address: String,
    /// Publisher that owns the node
    pub publisher_id: String,
    /// Node the input belongs to
    pub node_id: String,
    /// Input type, e.g. "switch"
    pub input_type: String,
    /// Instance of the input type on the node
    pub instance: String,
    /// Data type of accepted values
    #[serde(default)]
    pub value_type: String,
    /// Unit of accepted values
    #[serde(default)]
    pub unit: String,
    /// Time the discovery was created
    pub timestamp: DateTime<Utc>,
}

impl InputDiscoveryMessage {
    /// Create a discovery message for an input.
    #[must_use]
    pub fn new(node: &Address, input_type: &str, instance: &str) -> Self {
        let address = node
            .clone()
            .with_io(input_type, instance)
            .with_message_type(MessageType::Input);
        Self {
            address: address.to_string(),
            publisher_id: node.publisher_id.clone(),
            node_id: node.node_id.clone(),
            input_type: input_type.to_string(),
            instance: instance.to_string(),
            value_type: String::new(),
            unit: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Output discovery, published on `{node}/{outputType}/{instance}/$output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDiscoveryMessage {
    /// Discovery address of the output
    pub address: String,
    /// Publisher that owns the node
    pub publisher_id: String,
    /// Node the output belongs to
    pub node_id: String,
    /// Output type, e.g. "temperature"
    pub output_type: String,
    /// Instance of the output type on the node
    pub instance: String,
    /// Data type of produced values
    #[serde(default)]
    pub value_type: String,
    /// Unit of produced values
    #[serde(default)]
    pub unit: String,
    /// Time the discovery was created
    pub timestamp: DateTime<Utc>,
}

impl OutputDiscoveryMessage {
    /// Create a discovery message for an output.
    #[must_use]
    pub fn new(node: &Address, output_type: &str, instance: &str) -> Self {
        let address = node
            .clone()
            .with_io(output_type, instance)
            .with_message_type(MessageType::Output);
        Self {
            address: address.to_string(),
            publisher_id: node.publisher_id.clone(),
            node_id: node.node_id.clone(),
            output_type: output_type.to_string(),
            instance: instance.to_string(),
            value_type: String::new(),
            unit: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Identity record of a publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherIdentity {
    /// Domain the publisher belongs to
    pub domain: String,
    /// Publisher identifier
    pub publisher_id: String,
    /// Publisher public key, SPKI PEM
    pub public_key: String,
    /// Name of the party that attests this identity
    pub issuer_name: String,
    /// Expiry of the identity
    pub valid_until: DateTime<Utc>,
}

impl PublisherIdentity {
    /// Sign this record with the issuer's key.
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be serialized.
    pub fn attest(&self, issuer: &KeyPair) -> Result<String, KeyError> {
        Ok(issuer.sign(&self.signing_payload()?))
    }

    /// Verify an attestation made by [`Self::attest`].
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be serialized or the signature
    /// does not match.
    pub fn verify_attestation(&self, issuer: &PublicKey, signature: &str) -> Result<(), KeyError> {
        keys::verify(issuer, &self.signing_payload()?, signature)
    }

    /// Decode the publisher's public key.
    ///
    /// # Errors
    ///
    /// Returns error if the PEM is invalid.
    pub fn public_key(&self) -> Result<PublicKey, KeyError> {
        keys::public_key_from_pem(&self.public_key)
    }

    fn signing_payload(&self) -> Result<Vec<u8>, KeyError> {
        serde_json::to_vec(self).map_err(|e| KeyError::Encode(e.to_string()))
    }
}

/// Publisher identity, published on `{domain}/{publisherId}/$identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherIdentityMessage {
    /// Identity address of the publisher
    pub address: String,
    /// The identity record
    pub identity: PublisherIdentity,
    /// Issuer attestation of `identity`
    pub identity_signature: String,
    /// Address of the signer of this message
    pub sender: String,
    /// Time the message was created
    pub timestamp: DateTime<Utc>,
}

impl PublisherIdentityMessage {
    /// Create an identity message attested by `issuer`.
    ///
    /// # Errors
    ///
    /// Returns error if the identity cannot be attested.
    pub fn new(identity: PublisherIdentity, issuer: &KeyPair) -> Result<Self, KeyError> {
        let address = Address::publisher_identity(&identity.domain, &identity.publisher_id);
        let identity_signature = identity.attest(issuer)?;
        Ok(Self {
            sender: address.clone(),
            address,
            identity,
            identity_signature,
            timestamp: Utc::now(),
        })
    }
}

/// Output value, published on `{node}/{outputType}/{instance}/$latest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputValueMessage {
    /// Address the value is published on
    pub address: String,
    /// Address of the publisher sending the value
    pub sender: String,
    /// Value in its string representation
    pub value: String,
    /// Time the value was produced
    pub timestamp: DateTime<Utc>,
}

/// Command to change an input, sent on `{node}/{inputType}/{instance}/$set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetInputMessage {
    /// Input address the command is sent to
    pub address: String,
    /// Address of the publisher issuing the command
    pub sender: String,
    /// New value
    pub value: String,
    /// Time the command was issued
    pub timestamp: DateTime<Utc>,
}
