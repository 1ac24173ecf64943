//! # Identifiers
//!
//! Value objects naming the participants of the graph:
//!
//! - [`NodeIdentifier`]: a process — resolved node name plus the URI of its
//!   slave RPC endpoint.
//! - [`TopicDefinition`]: a named, typed data stream.
//! - [`PublisherIdentifier`] / [`SubscriberIdentifier`]: (node, topic) pairs
//!   used as directory-entry keys and handshake peer descriptors.
//! - [`ServiceIdentifier`]: a service name bound to exactly one provider URI.
//!
//! All identifiers are immutable after construction and cheap to clone.
//! Equality is structural; publisher/subscriber identity is the pair
//! (node name, topic name), so the same node re-registering the same topic
//! compares equal regardless of declared checksum.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::messages::{ConnectionHeader, HeaderField};
use crate::names::GraphName;

/// Address of an RPC endpoint, e.g. `http://192.168.1.5:41234`.
///
/// Kept as an opaque validated-enough string: the transport layer parses it
/// into host/port when dialing.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uri(String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> Self {
        Uri(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `host:port` part, with any scheme prefix and trailing slash
    /// stripped. This is what the TCP dialer consumes.
    pub fn authority(&self) -> &str {
        let s = self.0.as_str();
        let s = s.strip_prefix("http://").unwrap_or(s);
        let s = s.strip_prefix("tcp://").unwrap_or(s);
        s.trim_end_matches('/')
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({})", self.0)
    }
}

/// Identifies a node: its global graph name and the URI of its slave RPC
/// endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentifier {
    name: GraphName,
    uri: Uri,
}

impl NodeIdentifier {
    /// `name` must be in fully-resolved (global) form.
    pub fn new(name: GraphName, uri: Uri) -> Self {
        debug_assert!(name.is_global(), "node name must be global: {}", name);
        NodeIdentifier { name, uri }
    }

    pub fn name(&self) -> &GraphName {
        &self.name
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn to_header(&self) -> ConnectionHeader {
        let mut header = ConnectionHeader::new();
        header.set(HeaderField::CallerId, self.name.as_str());
        header
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.uri)
    }
}

/// A named, typed data stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicDefinition {
    name: GraphName,
    message_type: String,
    checksum: Option<String>,
}

impl TopicDefinition {
    pub fn new(name: GraphName, message_type: impl Into<String>, checksum: Option<String>) -> Self {
        debug_assert!(name.is_global(), "topic name must be global: {}", name);
        TopicDefinition { name, message_type: message_type.into(), checksum }
    }

    pub fn name(&self) -> &GraphName {
        &self.name
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    /// Header fields a session sends during the connection handshake.
    pub fn to_header(&self) -> ConnectionHeader {
        let mut header = ConnectionHeader::new();
        header.set(HeaderField::Topic, self.name.as_str());
        header.set(HeaderField::MessageType, &self.message_type);
        if let Some(checksum) = &self.checksum {
            header.set(HeaderField::Checksum, checksum);
        }
        header
    }
}

/// Directory-entry key for a publisher: which node publishes which topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublisherIdentifier {
    node: NodeIdentifier,
    topic: TopicDefinition,
}

impl PublisherIdentifier {
    pub fn new(node: NodeIdentifier, topic: TopicDefinition) -> Self {
        PublisherIdentifier { node, topic }
    }

    pub fn node(&self) -> &NodeIdentifier {
        &self.node
    }

    pub fn topic(&self) -> &TopicDefinition {
        &self.topic
    }

    pub fn topic_name(&self) -> &GraphName {
        self.topic.name()
    }

    pub fn uri(&self) -> &Uri {
        self.node.uri()
    }
}

// Identity is (node, topic name): the same node re-advertising a topic with
// a refreshed checksum is the same directory entry.
impl PartialEq for PublisherIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.topic.name() == other.topic.name()
    }
}

impl Eq for PublisherIdentifier {}

impl std::hash::Hash for PublisherIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node.hash(state);
        self.topic.name().hash(state);
    }
}

impl fmt::Display for PublisherIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "publisher {} on {}", self.node, self.topic.name())
    }
}

/// Directory-entry key for a subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriberIdentifier {
    node: NodeIdentifier,
    topic: TopicDefinition,
}

impl SubscriberIdentifier {
    pub fn new(node: NodeIdentifier, topic: TopicDefinition) -> Self {
        SubscriberIdentifier { node, topic }
    }

    pub fn node(&self) -> &NodeIdentifier {
        &self.node
    }

    pub fn topic(&self) -> &TopicDefinition {
        &self.topic
    }

    pub fn topic_name(&self) -> &GraphName {
        self.topic.name()
    }

    /// Handshake header: caller identity plus topic fields.
    pub fn to_header(&self) -> ConnectionHeader {
        self.node.to_header().merged(&self.topic.to_header())
    }
}

impl PartialEq for SubscriberIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.topic.name() == other.topic.name()
    }
}

impl Eq for SubscriberIdentifier {}

impl std::hash::Hash for SubscriberIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node.hash(state);
        self.topic.name().hash(state);
    }
}

impl fmt::Display for SubscriberIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber {} on {}", self.node, self.topic.name())
    }
}

/// A service name bound to its single provider.
///
/// Full structural equality: unregistration only succeeds when the caller
/// presents the exact identity currently bound, not just a matching name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentifier {
    name: GraphName,
    uri: Uri,
}

impl ServiceIdentifier {
    pub fn new(name: GraphName, uri: Uri) -> Self {
        debug_assert!(name.is_global(), "service name must be global: {}", name);
        ServiceIdentifier { name, uri }
    }

    pub fn name(&self) -> &GraphName {
        &self.name
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

impl fmt::Display for ServiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {} at {}", self.name, self.uri)
    }
}
