//! # Rosgraph - Node Registration and Peer Discovery
//!
//! Rosgraph implements the directory layer of a publish/subscribe robot
//! graph:
//!
//! - **Master**: the central directory tracking which node publishes,
//!   subscribes to, or provides what
//! - **Node**: the per-process participant with its own RPC endpoint and a
//!   data listener for peer connections
//! - **Registration**: background workers that keep the master informed
//!   without ever blocking session creation
//! - **Handshake**: byte-exact type/checksum validation before any data
//!   flows between peers
//!
//! ## Architecture
//!
//! Long-lived components use the **Actor Pattern** for safe concurrent
//! state: a public Handle that is cheap to clone, and a private Actor that
//! owns all mutable state and processes commands sequentially. The master's
//! registry is the exception; it is sharded behind per-collection locks so
//! independent directory operations never serialize on each other.
//!
//! ## Failure Model
//!
//! A remote call has exactly one failure channel: transport faults and
//! non-success response envelopes both surface as errors, distinguished by
//! message text only. Registrations are queued and retried until the master
//! is reachable; a node is fully usable while its registrations are pending.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level per-process API combining all components |
//! | `master` | The directory server and its publisher-update fan-out |
//! | `registry` | Sharded directory state: publishers, subscribers, services |
//! | `registration` | Queued, retried master registration jobs |
//! | `topic` | Publisher/Subscriber sessions and the connection handshake |
//! | `service` | Service server/client sessions |
//! | `client` | Typed directory clients (master-side and slave-side calls) |
//! | `names` | Graph name validation and resolution |
//! | `ident` | Identifier value objects (nodes, topics, services) |
//! | `response` | The uniform `(status, message, value)` response contract |
//! | `protocols` | Protocol trait definitions (RemoteCall, SlaveRpc, etc.) |
//! | `rpc` | TCP-based RPC layer implementing protocols |
//! | `messages` | Serialization types for all wire protocols |

mod client;
mod ident;
mod master;
mod messages;
mod names;
mod node;
mod protocols;
mod registration;
mod registry;
mod response;
mod rpc;
mod service;
mod topic;

pub use client::{MasterClient, SlaveClient};
pub use ident::{
    NodeIdentifier, PublisherIdentifier, ServiceIdentifier, SubscriberIdentifier,
    TopicDefinition, Uri,
};
pub use master::{Master, MASTER_NAME};
pub use messages::{ConnectionHeader, DirectoryRequest, Envelope, HeaderField, Payload, SystemState};
pub use names::{GraphName, NameError, NameResolver, WILDCARD_TYPE};
pub use node::{Node, NodeConfig, DATA_PROTOCOL};
pub use protocols::{DirectoryHandler, RemoteCall, SlaveRpc};
pub use registration::{RegistrationEvent, RegistrationManager};
pub use registry::{Registry, RegistryError};
pub use response::{RemoteError, Response, StatusCode};
pub use rpc::{RpcClient, RpcServer};
pub use service::{ServiceClient, ServiceDefinition, ServiceHandler, ServiceServer};
pub use topic::{
    ConnectionState, HandshakeError, Publisher, RegistrationState, Subscriber,
};
