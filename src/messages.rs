//! # Wire Protocol Messages
//!
//! Serializable types for the two RPC surfaces and for the connection
//! handshake. Messages are serialized with bincode under a hard size limit
//! so a misbehaving peer cannot force an oversized allocation.
//!
//! | Surface | Request type | Response type |
//! |---------|--------------|---------------|
//! | Directory (master + slave endpoints) | [`DirectoryRequest`] | [`Envelope`] |
//! | Peer handshake | [`ConnectionHeader`] | [`ConnectionHeader`] |
//!
//! Every [`Envelope`] carries the uniform `(status code, message, value)`
//! triple; [`Payload`] is the closed set of value shapes a directory call can
//! return.

use std::collections::BTreeMap;
use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::ident::Uri;
use crate::names::GraphName;

/// Maximum size of a serialized RPC frame (256 KiB). Directory payloads are
/// lists of names and URIs; anything bigger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Maximum buffer size for deserialization, slightly larger than
/// [`MAX_FRAME_SIZE`] to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_FRAME_SIZE as u64) + 4096;

/// Returns bincode options with the size limit enforced.
/// Always use this for deserialization of remote input.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Directory RPC
// ============================================================================

/// The closed set of directory operations. The first field of every variant
/// is the caller's resolved node name, mirroring the convention that every
/// remote call identifies its caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DirectoryRequest {
    // Master-side operations.
    RegisterPublisher {
        caller_id: GraphName,
        topic: GraphName,
        topic_type: String,
        caller_uri: Uri,
    },
    RegisterSubscriber {
        caller_id: GraphName,
        topic: GraphName,
        topic_type: String,
        caller_uri: Uri,
    },
    UnregisterPublisher {
        caller_id: GraphName,
        topic: GraphName,
        caller_uri: Uri,
    },
    UnregisterSubscriber {
        caller_id: GraphName,
        topic: GraphName,
        caller_uri: Uri,
    },
    RegisterService {
        caller_id: GraphName,
        service: GraphName,
        service_uri: Uri,
        caller_uri: Uri,
    },
    UnregisterService {
        caller_id: GraphName,
        service: GraphName,
        service_uri: Uri,
    },
    LookupNode {
        caller_id: GraphName,
        node_name: GraphName,
    },
    LookupService {
        caller_id: GraphName,
        service: GraphName,
    },
    GetSystemState {
        caller_id: GraphName,
    },
    // Slave-side operations (master → node, subscriber → publisher node).
    PublisherUpdate {
        caller_id: GraphName,
        topic: GraphName,
        publisher_uris: Vec<Uri>,
    },
    RequestTopic {
        caller_id: GraphName,
        topic: GraphName,
        protocols: Vec<String>,
    },
}

impl DirectoryRequest {
    /// The caller identity every request carries.
    pub fn caller_id(&self) -> &GraphName {
        match self {
            DirectoryRequest::RegisterPublisher { caller_id, .. }
            | DirectoryRequest::RegisterSubscriber { caller_id, .. }
            | DirectoryRequest::UnregisterPublisher { caller_id, .. }
            | DirectoryRequest::UnregisterSubscriber { caller_id, .. }
            | DirectoryRequest::RegisterService { caller_id, .. }
            | DirectoryRequest::UnregisterService { caller_id, .. }
            | DirectoryRequest::LookupNode { caller_id, .. }
            | DirectoryRequest::LookupService { caller_id, .. }
            | DirectoryRequest::GetSystemState { caller_id }
            | DirectoryRequest::PublisherUpdate { caller_id, .. }
            | DirectoryRequest::RequestTopic { caller_id, .. } => caller_id,
        }
    }

    /// Short operation name for logs.
    pub fn method(&self) -> &'static str {
        match self {
            DirectoryRequest::RegisterPublisher { .. } => "registerPublisher",
            DirectoryRequest::RegisterSubscriber { .. } => "registerSubscriber",
            DirectoryRequest::UnregisterPublisher { .. } => "unregisterPublisher",
            DirectoryRequest::UnregisterSubscriber { .. } => "unregisterSubscriber",
            DirectoryRequest::RegisterService { .. } => "registerService",
            DirectoryRequest::UnregisterService { .. } => "unregisterService",
            DirectoryRequest::LookupNode { .. } => "lookupNode",
            DirectoryRequest::LookupService { .. } => "lookupService",
            DirectoryRequest::GetSystemState { .. } => "getSystemState",
            DirectoryRequest::PublisherUpdate { .. } => "publisherUpdate",
            DirectoryRequest::RequestTopic { .. } => "requestTopic",
        }
    }
}

/// The uniform response envelope: `(status code, message, value)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i32,
    pub message: String,
    pub value: Payload,
}

/// The closed set of value shapes a directory call can return.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    None,
    /// Count of entries removed, or a generic integer acknowledgment.
    Int(i32),
    Uri(Uri),
    Uris(Vec<Uri>),
    SystemState(SystemState),
    /// Negotiated bulk-transport protocol: name plus opaque parameters.
    Protocol { name: String, params: Vec<String> },
}

/// Introspection snapshot of the directory: per topic, the node names
/// involved; per service, its current provider URI. No cross-collection
/// atomicity is implied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub publishers: Vec<(GraphName, Vec<GraphName>)>,
    pub subscribers: Vec<(GraphName, Vec<GraphName>)>,
    pub services: Vec<(GraphName, Uri)>,
}

// ============================================================================
// Connection Handshake Header
// ============================================================================

/// Well-known connection header fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderField {
    CallerId,
    Topic,
    Service,
    MessageType,
    Checksum,
    /// Set by the rejecting side when a handshake fails validation.
    Error,
}

impl HeaderField {
    fn key(self) -> &'static str {
        match self {
            HeaderField::CallerId => "callerid",
            HeaderField::Topic => "topic",
            HeaderField::Service => "service",
            HeaderField::MessageType => "type",
            HeaderField::Checksum => "md5sum",
            HeaderField::Error => "error",
        }
    }
}

/// The header exchanged on a freshly-opened peer connection before any data
/// flows. A flat field map; validation of type/checksum agreement lives with
/// the session objects, not here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHeader {
    fields: BTreeMap<String, String>,
}

impl ConnectionHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: HeaderField, value: &str) {
        self.fields.insert(field.key().to_string(), value.to_string());
    }

    pub fn get(&self, field: HeaderField) -> Option<&str> {
        self.fields.get(field.key()).map(String::as_str)
    }

    /// A new header with `other`'s fields layered on top of this one's.
    pub fn merged(&self, other: &ConnectionHeader) -> ConnectionHeader {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        ConnectionHeader { fields }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

impl fmt::Display for ConnectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.fields {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}
