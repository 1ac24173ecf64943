//! Protocol trait definitions for the directory subsystem.
//!
//! ## Traits
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`RemoteCall`] | `rpc::RpcClient`, test doubles | the generic remote-call primitive the typed clients consume |
//! | [`DirectoryHandler`] | `master::MasterServer`, `node::SlaveEndpoint` | server-side dispatch of an incoming directory call |
//! | [`SlaveRpc`] | `client::SlaveClient`, test doubles | typed calls pushed master→node and node→node |
//!
//! Traits are defined here separately from implementations so the master's
//! fan-out and the registration machinery depend only on the seams, which
//! keeps them testable against in-process doubles with no sockets involved.

use anyhow::Result;
use async_trait::async_trait;

use crate::ident::Uri;
use crate::messages::{DirectoryRequest, Envelope};
use crate::names::GraphName;

/// The generic remote-call primitive: deliver one request to an endpoint and
/// return its decoded envelope. Transport faults and timeouts surface as
/// errors; a delivered non-success envelope is returned intact for the
/// caller to decode.
#[async_trait]
pub trait RemoteCall: Send + Sync + 'static {
    async fn call(&self, endpoint: &Uri, request: DirectoryRequest) -> Result<Envelope>;
}

/// Server-side dispatch: turn one incoming directory call into an envelope.
/// Implementations must not panic on malformed arguments; they answer with a
/// failure envelope instead.
#[async_trait]
pub trait DirectoryHandler: Send + Sync + 'static {
    async fn handle(&self, request: DirectoryRequest) -> Envelope;
}

/// Calls served by every node's own endpoint.
#[async_trait]
pub trait SlaveRpc: Send + Sync + 'static {
    /// Push the current full publisher list for a topic to a node.
    async fn publisher_update(
        &self,
        to: &Uri,
        topic: &GraphName,
        publisher_uris: Vec<Uri>,
    ) -> Result<()>;

    /// Negotiate the bulk-transport connection for a topic before the
    /// handshake. Returns the agreed protocol name and its parameters.
    async fn request_topic(
        &self,
        to: &Uri,
        topic: &GraphName,
        protocols: Vec<String>,
    ) -> Result<(String, Vec<String>)>;
}
