//! # Directory Clients
//!
//! Typed wrappers over the generic remote-call primitive:
//!
//! - [`MasterClient`]: the slave-side view of the master's directory API.
//! - [`SlaveClient`]: calls served by a node's own endpoint
//!   (`publisherUpdate`, `requestTopic`).
//!
//! Every call is one blocking (await-until-done) remote call. The uniform
//! failure contract applies throughout: a transport fault and
//! a non-success envelope surface through the same `Err` channel, and the
//! distinction between `ERROR` and `FAILURE` is message text only — nothing
//! here branches on it.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::ident::{NodeIdentifier, PublisherIdentifier, ServiceIdentifier, SubscriberIdentifier, Uri};
use crate::messages::{DirectoryRequest, Envelope, Payload, SystemState};
use crate::names::GraphName;
use crate::protocols::{RemoteCall, SlaveRpc};
use crate::response::{Response, StatusCode};

/// Decode an envelope into the typed response, collapsing non-success into
/// the single failure channel.
fn decode<T>(envelope: Envelope, extract: impl FnOnce(Payload) -> Option<T>) -> Result<T> {
    let status = StatusCode::from_int(envelope.code)?;
    let response = Response { status, message: envelope.message, value: envelope.value };
    let payload = response.into_result()?;
    match extract(payload) {
        Some(value) => Ok(value),
        None => bail!("remote returned an unexpected payload shape"),
    }
}

fn expect_uris(payload: Payload) -> Option<Vec<Uri>> {
    match payload {
        Payload::Uris(uris) => Some(uris),
        _ => None,
    }
}

fn expect_int(payload: Payload) -> Option<i32> {
    match payload {
        Payload::Int(value) => Some(value),
        _ => None,
    }
}

/// The slave side's handle on the master directory.
#[derive(Clone)]
pub struct MasterClient {
    caller: Arc<dyn RemoteCall>,
    master_uri: Uri,
}

impl MasterClient {
    pub fn new(caller: Arc<dyn RemoteCall>, master_uri: Uri) -> Self {
        MasterClient { caller, master_uri }
    }

    pub fn master_uri(&self) -> &Uri {
        &self.master_uri
    }

    /// Register a publisher; returns the topic's current subscriber URIs.
    pub async fn register_publisher(&self, publisher: &PublisherIdentifier) -> Result<Vec<Uri>> {
        let request = DirectoryRequest::RegisterPublisher {
            caller_id: publisher.node().name().clone(),
            topic: publisher.topic_name().clone(),
            topic_type: publisher.topic().message_type().to_string(),
            caller_uri: publisher.node().uri().clone(),
        };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, expect_uris).context("registerPublisher failed")
    }

    /// Register a subscriber; returns the topic's current publisher URIs —
    /// the subscriber's bootstrap list.
    pub async fn register_subscriber(&self, subscriber: &SubscriberIdentifier) -> Result<Vec<Uri>> {
        let request = DirectoryRequest::RegisterSubscriber {
            caller_id: subscriber.node().name().clone(),
            topic: subscriber.topic_name().clone(),
            topic_type: subscriber.topic().message_type().to_string(),
            caller_uri: subscriber.node().uri().clone(),
        };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, expect_uris).context("registerSubscriber failed")
    }

    /// Returns the number of entries removed (0 or 1).
    pub async fn unregister_publisher(&self, publisher: &PublisherIdentifier) -> Result<i32> {
        let request = DirectoryRequest::UnregisterPublisher {
            caller_id: publisher.node().name().clone(),
            topic: publisher.topic_name().clone(),
            caller_uri: publisher.node().uri().clone(),
        };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, expect_int).context("unregisterPublisher failed")
    }

    pub async fn unregister_subscriber(&self, subscriber: &SubscriberIdentifier) -> Result<i32> {
        let request = DirectoryRequest::UnregisterSubscriber {
            caller_id: subscriber.node().name().clone(),
            topic: subscriber.topic_name().clone(),
            caller_uri: subscriber.node().uri().clone(),
        };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, expect_int).context("unregisterSubscriber failed")
    }

    pub async fn register_service(
        &self,
        caller: &NodeIdentifier,
        service: &ServiceIdentifier,
    ) -> Result<()> {
        let request = DirectoryRequest::RegisterService {
            caller_id: caller.name().clone(),
            service: service.name().clone(),
            service_uri: service.uri().clone(),
            caller_uri: caller.uri().clone(),
        };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, expect_int).map(|_| ()).context("registerService failed")
    }

    pub async fn unregister_service(
        &self,
        caller: &NodeIdentifier,
        service: &ServiceIdentifier,
    ) -> Result<i32> {
        let request = DirectoryRequest::UnregisterService {
            caller_id: caller.name().clone(),
            service: service.name().clone(),
            service_uri: service.uri().clone(),
        };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, expect_int).context("unregisterService failed")
    }

    pub async fn lookup_node(&self, caller_id: &GraphName, node_name: &GraphName) -> Result<Uri> {
        let request = DirectoryRequest::LookupNode {
            caller_id: caller_id.clone(),
            node_name: node_name.clone(),
        };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, |payload| match payload {
            Payload::Uri(uri) => Some(uri),
            _ => None,
        })
        .context("lookupNode failed")
    }

    pub async fn lookup_service(&self, caller_id: &GraphName, service: &GraphName) -> Result<Uri> {
        let request = DirectoryRequest::LookupService {
            caller_id: caller_id.clone(),
            service: service.clone(),
        };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, |payload| match payload {
            Payload::Uri(uri) => Some(uri),
            _ => None,
        })
        .context("lookupService failed")
    }

    pub async fn get_system_state(&self, caller_id: &GraphName) -> Result<SystemState> {
        let request = DirectoryRequest::GetSystemState { caller_id: caller_id.clone() };
        let envelope = self.caller.call(&self.master_uri, request).await?;
        decode(envelope, |payload| match payload {
            Payload::SystemState(state) => Some(state),
            _ => None,
        })
        .context("getSystemState failed")
    }
}

/// Typed calls against a node's own endpoint.
#[derive(Clone)]
pub struct SlaveClient {
    caller_id: GraphName,
    caller: Arc<dyn RemoteCall>,
}

impl SlaveClient {
    pub fn new(caller_id: GraphName, caller: Arc<dyn RemoteCall>) -> Self {
        SlaveClient { caller_id, caller }
    }
}

#[async_trait]
impl SlaveRpc for SlaveClient {
    async fn publisher_update(
        &self,
        to: &Uri,
        topic: &GraphName,
        publisher_uris: Vec<Uri>,
    ) -> Result<()> {
        let request = DirectoryRequest::PublisherUpdate {
            caller_id: self.caller_id.clone(),
            topic: topic.clone(),
            publisher_uris,
        };
        let envelope = self.caller.call(to, request).await?;
        decode(envelope, expect_int).map(|_| ()).context("publisherUpdate failed")
    }

    async fn request_topic(
        &self,
        to: &Uri,
        topic: &GraphName,
        protocols: Vec<String>,
    ) -> Result<(String, Vec<String>)> {
        let request = DirectoryRequest::RequestTopic {
            caller_id: self.caller_id.clone(),
            topic: topic.clone(),
            protocols,
        };
        let envelope = self.caller.call(to, request).await?;
        decode(envelope, |payload| match payload {
            Payload::Protocol { name, params } => Some((name, params)),
            _ => None,
        })
        .context("requestTopic failed")
    }
}
