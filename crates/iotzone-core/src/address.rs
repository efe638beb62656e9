//! Address scheme shared by bus topics and object keys.
//!
//! Address structure: `{domain}/{publisherId}/{nodeId}[/{ioType}/{instance}]/{$messageType}`
//!
//! This allows:
//! - Domain (zone) isolation
//! - Per-publisher ownership of nodes
//! - Message-type filtering with a single subscription pattern

use serde::{Deserialize, Serialize};
use std::fmt;

/// Segment separator.
pub const SEPARATOR: char = '/';

/// Prefix that marks a segment as a reserved message type token.
pub const MESSAGE_TYPE_SIGIL: char = '$';

/// Single-level wildcard, matches exactly one segment.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard, matches the remaining segments. Only legal as the last segment.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Reserved message type tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Node discovery
    #[serde(rename = "$node")]
    Node,
    /// Input discovery
    #[serde(rename = "$input")]
    Input,
    /// Output discovery
    #[serde(rename = "$output")]
    Output,
    /// Command to set an input
    #[serde(rename = "$set")]
    Set,
    /// Command to configure a node
    #[serde(rename = "$configure")]
    Configure,
    /// Batch of output values
    #[serde(rename = "$event")]
    Event,
    /// Raw output value
    #[serde(rename = "$value")]
    Value,
    /// Latest output value with metadata
    #[serde(rename = "$latest")]
    Latest,
    /// Output value history
    #[serde(rename = "$history")]
    History,
    /// Output value forecast
    #[serde(rename = "$forecast")]
    Forecast,
    /// Firmware upgrade command
    #[serde(rename = "$upgrade")]
    Upgrade,
    /// Publisher identity
    #[serde(rename = "$identity")]
    Identity,
    /// Node alias command
    #[serde(rename = "$alias")]
    Alias,
    /// Change of node ID command
    #[serde(rename = "$setNodeId")]
    SetNodeId,
}

impl MessageType {
    /// All reserved tokens.
    pub const ALL: [Self; 14] = [
        Self::Node,
        Self::Input,
        Self::Output,
        Self::Set,
        Self::Configure,
        Self::Event,
        Self::Value,
        Self::Latest,
        Self::History,
        Self::Forecast,
        Self::Upgrade,
        Self::Identity,
        Self::Alias,
        Self::SetNodeId,
    ];

    /// The address segment for this message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "$node",
            Self::Input => "$input",
            Self::Output => "$output",
            Self::Set => "$set",
            Self::Configure => "$configure",
            Self::Event => "$event",
            Self::Value => "$value",
            Self::Latest => "$latest",
            Self::History => "$history",
            Self::Forecast => "$forecast",
            Self::Upgrade => "$upgrade",
            Self::Identity => "$identity",
            Self::Alias => "$alias",
            Self::SetNodeId => "$setNodeId",
        }
    }

    /// Parse a message type from an address segment.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mt| mt.as_str() == token)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a segment is a message type token.
#[must_use]
pub fn is_message_type_token(segment: &str) -> bool {
    segment.starts_with(MESSAGE_TYPE_SIGIL)
}

/// Strip trailing message type tokens from an address.
///
/// The result is the key under which the addressed object is stored.
/// `d/p/n`, `d/p/n/$node` and `d/p/n/$set` all canonicalize to `d/p/n`.
#[must_use]
pub fn canonical(address: &str) -> &str {
    let mut key = address;
    while let Some((head, last)) = key.rsplit_once(SEPARATOR) {
        if !is_message_type_token(last) {
            break;
        }
        key = head;
    }
    key
}

/// The `domain/publisherId/nodeId` prefix of an address.
///
/// Returns `None` when the address has fewer than three segments or the
/// third segment is a message type token.
#[must_use]
pub fn node_prefix(address: &str) -> Option<&str> {
    let mut segments = address.splitn(4, SEPARATOR);
    let domain = segments.next()?;
    let publisher_id = segments.next()?;
    let node_id = segments.next()?;

    if domain.is_empty()
        || publisher_id.is_empty()
        || node_id.is_empty()
        || is_message_type_token(publisher_id)
        || is_message_type_token(node_id)
    {
        return None;
    }

    let len = domain.len() + publisher_id.len() + node_id.len() + 2;
    Some(&address[..len])
}

/// Whether `key` equals `prefix` or lies below it on a segment boundary.
#[must_use]
pub fn has_segment_prefix(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(SEPARATOR))
}

/// Match an address against a subscription pattern.
///
/// `+` matches exactly one segment. `#` matches its own segment and every
/// segment after it, but only when it is the last pattern segment.
/// Patterns with more segments than the address never match, and neither
/// do patterns that are shorter than the address without a trailing `#`.
#[must_use]
pub fn topic_matches(pattern: &str, address: &str) -> bool {
    let mut pattern_segments = pattern.split(SEPARATOR);
    let mut address_segments = address.split(SEPARATOR);

    loop {
        match (pattern_segments.next(), address_segments.next()) {
            (Some(MULTI_LEVEL_WILDCARD), Some(_)) => return pattern_segments.next().is_none(),
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check that a subscription pattern is well formed.
///
/// # Errors
///
/// Returns error if the pattern is empty, a wildcard shares a segment with
/// other characters, or `#` is not the last segment.
pub fn validate_pattern(pattern: &str) -> Result<(), AddressError> {
    if pattern.is_empty() {
        return Err(AddressError::Empty);
    }

    let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = segments.len() - 1;
    for (idx, segment) in segments.iter().enumerate() {
        let has_wildcard = segment.contains('+') || segment.contains('#');
        if !has_wildcard {
            continue;
        }
        let valid = *segment == SINGLE_LEVEL_WILDCARD
            || (*segment == MULTI_LEVEL_WILDCARD && idx == last);
        if !valid {
            return Err(AddressError::InvalidWildcard(pattern.to_string()));
        }
    }

    Ok(())
}

/// Check that an address can be published to or used as a key.
///
/// # Errors
///
/// Returns error if the address is empty or contains wildcards.
pub fn validate_address(address: &str) -> Result<(), AddressError> {
    if address.is_empty() {
        return Err(AddressError::Empty);
    }
    if address.contains(['+', '#']) {
        return Err(AddressError::WildcardInAddress(address.to_string()));
    }
    Ok(())
}

/// A parsed node or input/output address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Domain (zone) the publisher belongs to
    pub domain: String,
    /// Publisher that owns the node
    pub publisher_id: String,
    /// Node within the publisher
    pub node_id: String,
    /// Input or output type, for io-level addresses
    pub io_type: Option<String>,
    /// Input or output instance, for io-level addresses
    pub instance: Option<String>,
    /// Trailing message type, if any
    pub message_type: Option<MessageType>,
}

impl Address {
    /// Node-level address without a message type.
    #[must_use]
    pub fn node(
        domain: impl Into<String>,
        publisher_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            publisher_id: publisher_id.into(),
            node_id: node_id.into(),
            io_type: None,
            instance: None,
            message_type: None,
        }
    }

    /// Turn this into an input/output address.
    #[must_use]
    pub fn with_io(mut self, io_type: impl Into<String>, instance: impl Into<String>) -> Self {
        self.io_type = Some(io_type.into());
        self.instance = Some(instance.into());
        self
    }

    /// Attach a trailing message type.
    #[must_use]
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    /// Publisher identity address: `{domain}/{publisherId}/$identity`.
    #[must_use]
    pub fn publisher_identity(domain: &str, publisher_id: &str) -> String {
        format!("{domain}/{publisher_id}/{}", MessageType::Identity)
    }

    /// Parse an address with three (node) or five (input/output) segments,
    /// optionally followed by a message type.
    ///
    /// # Errors
    ///
    /// Returns error if the segment count is wrong, a segment is empty, a
    /// wildcard is present, or the message type token is unknown.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        validate_address(address)?;

        let mut parts: Vec<&str> = address.split(SEPARATOR).collect();
        let message_type = match parts.last() {
            Some(last) if is_message_type_token(last) => {
                let mt = MessageType::from_token(last)
                    .ok_or_else(|| AddressError::UnknownMessageType((*last).to_string()))?;
                parts.pop();
                Some(mt)
            }
            _ => None,
        };

        if parts.iter().any(|p| p.is_empty()) {
            return Err(AddressError::EmptySegment(address.to_string()));
        }

        let mut parsed = match parts.as_slice() {
            [domain, publisher_id, node_id] => Self::node(*domain, *publisher_id, *node_id),
            [domain, publisher_id, node_id, io_type, instance] => {
                Self::node(*domain, *publisher_id, *node_id).with_io(*io_type, *instance)
            }
            _ => {
                return Err(AddressError::SegmentCount {
                    address: address.to_string(),
                    count: parts.len(),
                })
            }
        };
        parsed.message_type = message_type;

        Ok(parsed)
    }

    /// `domain/publisherId/nodeId`.
    #[must_use]
    pub fn node_address(&self) -> String {
        format!("{}/{}/{}", self.domain, self.publisher_id, self.node_id)
    }

    /// The storage key: the address without its message type.
    #[must_use]
    pub fn canonical(&self) -> String {
        match (&self.io_type, &self.instance) {
            (Some(io_type), Some(instance)) => {
                format!("{}/{io_type}/{instance}", self.node_address())
            }
            _ => self.node_address(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())?;
        if let Some(message_type) = self.message_type {
            write!(f, "{SEPARATOR}{message_type}")?;
        }
        Ok(())
    }
}

/// Errors for address parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Address or pattern is empty
    #[error("address is empty")]
    Empty,
    /// Address has an empty segment
    #[error("empty segment in address: {0}")]
    EmptySegment(String),
    /// Wrong number of segments
    #[error("address {address} has {count} segments, expected 3 or 5")]
    SegmentCount {
        /// The offending address
        address: String,
        /// Number of segments before the message type
        count: usize,
    },
    /// Unknown `$` token
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    /// Wildcard used outside a subscription pattern
    #[error("wildcard not allowed in address: {0}")]
    WildcardInAddress(String),
    /// Malformed wildcard in a pattern
    #[error("invalid wildcard in pattern: {0}")]
    InvalidWildcard(String),
}
