//! # Master Server
//!
//! The RPC-facing surface of the registry: a thin adapter that turns
//! incoming directory calls into [`Registry`] operations and encodes the
//! uniform response envelope.
//!
//! The one piece of behavior beyond translation is the publisher-update
//! fan-out: after a successful `registerPublisher`, the master pushes the
//! topic's current full publisher list to every known slave node. The pushes
//! to different slaves run concurrently, but all are awaited before the
//! registration response is sent — a slow or unreachable slave therefore
//! delays the publisher's registration reply. That latency coupling is
//! inherited behavior, kept on purpose.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::ident::{NodeIdentifier, PublisherIdentifier, ServiceIdentifier, SubscriberIdentifier, TopicDefinition, Uri};
use crate::messages::{DirectoryRequest, Envelope, Payload};
use crate::names::GraphName;
use crate::protocols::{DirectoryHandler, SlaveRpc};
use crate::registry::Registry;
use crate::response::StatusCode;
use crate::rpc::RpcServer;

/// The master's own node name.
pub const MASTER_NAME: &str = "/master";

/// The registry's RPC adapter. Owns the directory state and the outbound
/// slave-call seam used for publisher-update fan-out.
pub struct MasterServer {
    registry: Arc<Registry>,
    slave_rpc: Arc<dyn SlaveRpc>,
}

impl MasterServer {
    pub fn new(registry: Arc<Registry>, slave_rpc: Arc<dyn SlaveRpc>) -> Self {
        MasterServer { registry, slave_rpc }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Push the current full publisher list for `topic` to every known slave
    /// node, concurrently, and wait for all pushes to finish. Individual
    /// push failures are logged and otherwise ignored: an unreachable
    /// subscriber must not fail a publisher's registration.
    async fn publisher_update(&self, topic: &GraphName) {
        let publisher_uris = self.registry.publisher_uris(topic);
        let slaves = self.registry.slaves();
        debug!(topic = %topic, slaves = slaves.len(), "publisher update fan-out");

        let mut pushes = Vec::with_capacity(slaves.len());
        for slave in slaves {
            let slave_rpc = self.slave_rpc.clone();
            let topic = topic.clone();
            let uris = publisher_uris.clone();
            pushes.push(tokio::spawn(async move {
                if let Err(error) = slave_rpc.publisher_update(slave.uri(), &topic, uris).await {
                    warn!(slave = %slave.name(), error = %error, "publisher update push failed");
                }
            }));
        }
        for push in pushes {
            let _ = push.await;
        }
    }

    async fn register_publisher(
        &self,
        caller_id: GraphName,
        topic: GraphName,
        topic_type: String,
        caller_uri: Uri,
    ) -> Envelope {
        if let Some(rejection) = reject_non_global(&[&caller_id, &topic]) {
            return rejection;
        }
        let node = NodeIdentifier::new(caller_id, caller_uri);
        let definition = TopicDefinition::new(topic.clone(), topic_type.as_str(), None);
        let publisher = PublisherIdentifier::new(node, definition);

        match self.registry.register_publisher(publisher, &topic_type) {
            Ok(subscribers) => {
                // Ordered after the insert: the pushed list always contains
                // the publisher being registered.
                self.publisher_update(&topic).await;
                let uris = subscribers.iter().map(|s| s.node().uri().clone()).collect();
                ok("publisher registered", Payload::Uris(uris))
            }
            Err(error) => error_envelope(error.to_string()),
        }
    }

    async fn register_subscriber(
        &self,
        caller_id: GraphName,
        topic: GraphName,
        topic_type: String,
        caller_uri: Uri,
    ) -> Envelope {
        if let Some(rejection) = reject_non_global(&[&caller_id, &topic]) {
            return rejection;
        }
        let node = NodeIdentifier::new(caller_id, caller_uri);
        let definition = TopicDefinition::new(topic, topic_type.as_str(), None);
        let subscriber = SubscriberIdentifier::new(node, definition);

        match self.registry.register_subscriber(subscriber, &topic_type) {
            Ok(publishers) => {
                let uris = publishers.iter().map(|p| p.uri().clone()).collect();
                ok("subscriber registered", Payload::Uris(uris))
            }
            Err(error) => error_envelope(error.to_string()),
        }
    }
}

#[async_trait]
impl DirectoryHandler for MasterServer {
    async fn handle(&self, request: DirectoryRequest) -> Envelope {
        match request {
            DirectoryRequest::RegisterPublisher { caller_id, topic, topic_type, caller_uri } => {
                self.register_publisher(caller_id, topic, topic_type, caller_uri).await
            }
            DirectoryRequest::RegisterSubscriber { caller_id, topic, topic_type, caller_uri } => {
                self.register_subscriber(caller_id, topic, topic_type, caller_uri).await
            }
            DirectoryRequest::UnregisterPublisher { caller_id, topic, caller_uri } => {
                if let Some(rejection) = reject_non_global(&[&caller_id, &topic]) {
                    return rejection;
                }
                let node = NodeIdentifier::new(caller_id, caller_uri);
                let definition = TopicDefinition::new(topic, "", None);
                let removed =
                    self.registry.unregister_publisher(&PublisherIdentifier::new(node, definition));
                ok("publisher unregistered", Payload::Int(removed as i32))
            }
            DirectoryRequest::UnregisterSubscriber { caller_id, topic, caller_uri } => {
                if let Some(rejection) = reject_non_global(&[&caller_id, &topic]) {
                    return rejection;
                }
                let node = NodeIdentifier::new(caller_id, caller_uri);
                let definition = TopicDefinition::new(topic, "", None);
                let removed = self
                    .registry
                    .unregister_subscriber(&SubscriberIdentifier::new(node, definition));
                ok("subscriber unregistered", Payload::Int(removed as i32))
            }
            DirectoryRequest::RegisterService { caller_id, service, service_uri, caller_uri } => {
                if let Some(rejection) = reject_non_global(&[&caller_id, &service]) {
                    return rejection;
                }
                let node = NodeIdentifier::new(caller_id, caller_uri);
                match self
                    .registry
                    .register_service(&node, ServiceIdentifier::new(service, service_uri))
                {
                    Ok(()) => ok("service registered", Payload::Int(1)),
                    Err(error) => error_envelope(error.to_string()),
                }
            }
            DirectoryRequest::UnregisterService { service, service_uri, .. } => {
                if let Some(rejection) = reject_non_global(&[&service]) {
                    return rejection;
                }
                let removed = self
                    .registry
                    .unregister_service(&ServiceIdentifier::new(service, service_uri));
                ok("service unregistered", Payload::Int(removed as i32))
            }
            DirectoryRequest::LookupNode { node_name, .. } => {
                match self.registry.lookup_node(&node_name) {
                    Some(node) => ok("node found", Payload::Uri(node.uri().clone())),
                    None => error_envelope(format!("unknown node {}", node_name)),
                }
            }
            DirectoryRequest::LookupService { service, .. } => {
                match self.registry.lookup_service(&service) {
                    Some(found) => ok("service found", Payload::Uri(found.uri().clone())),
                    None => error_envelope(format!("unknown service {}", service)),
                }
            }
            DirectoryRequest::GetSystemState { .. } => {
                ok("system state", Payload::SystemState(self.registry.system_state()))
            }
            DirectoryRequest::PublisherUpdate { .. } | DirectoryRequest::RequestTopic { .. } => {
                Envelope {
                    code: StatusCode::Failure.to_int(),
                    message: format!("{} is not served by the master", request.method()),
                    value: Payload::None,
                }
            }
        }
    }
}

/// Directory state only holds fully-resolved global names. Callers are
/// responsible for resolving before they call; anything else off the wire is
/// answered with an error envelope instead of entering the registry.
fn reject_non_global(names: &[&GraphName]) -> Option<Envelope> {
    names
        .iter()
        .find(|name| !name.is_global())
        .map(|name| error_envelope(format!("{} is not a fully-resolved global name", name)))
}

fn ok(message: &str, value: Payload) -> Envelope {
    Envelope { code: StatusCode::Success.to_int(), message: message.to_string(), value }
}

fn error_envelope(message: String) -> Envelope {
    Envelope { code: StatusCode::Error.to_int(), message, value: Payload::None }
}

/// A running master: registry, RPC adapter, and bound server endpoint.
pub struct Master {
    server: RpcServer,
    handler: Arc<MasterServer>,
}

impl Master {
    /// Bind a master on `addr` with the default RPC-backed slave-call seam.
    pub async fn bind(addr: &str) -> Result<Self> {
        let rpc = Arc::new(crate::rpc::RpcClient::new());
        let caller = GraphName::new(MASTER_NAME).expect("master name is valid");
        let slave_rpc = Arc::new(crate::client::SlaveClient::new(caller, rpc));
        Self::bind_with(addr, slave_rpc).await
    }

    /// Bind a master on `addr` using the given slave-call seam.
    pub async fn bind_with(addr: &str, slave_rpc: Arc<dyn SlaveRpc>) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let handler = Arc::new(MasterServer::new(registry, slave_rpc));
        let server = RpcServer::bind(addr, handler.clone())
            .await
            .context("failed to start master rpc server")?;
        info!(uri = %server.local_uri(), "master started");
        Ok(Master { server, handler })
    }

    pub fn uri(&self) -> &Uri {
        self.server.local_uri()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.handler.registry()
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn name(s: &str) -> GraphName {
        GraphName::new(s).expect("valid name")
    }

    /// Records every push so tests can assert on fan-out behavior.
    #[derive(Default)]
    struct RecordingSlaveRpc {
        updates: Mutex<Vec<(Uri, GraphName, Vec<Uri>)>>,
    }

    #[async_trait]
    impl SlaveRpc for RecordingSlaveRpc {
        async fn publisher_update(
            &self,
            to: &Uri,
            topic: &GraphName,
            publisher_uris: Vec<Uri>,
        ) -> Result<()> {
            self.updates.lock().unwrap().push((to.clone(), topic.clone(), publisher_uris));
            Ok(())
        }

        async fn request_topic(
            &self,
            _to: &Uri,
            _topic: &GraphName,
            _protocols: Vec<String>,
        ) -> Result<(String, Vec<String>)> {
            unreachable!("master never negotiates topics")
        }
    }

    fn register_publisher(node: &str, uri: &str, topic: &str, ty: &str) -> DirectoryRequest {
        DirectoryRequest::RegisterPublisher {
            caller_id: name(node),
            topic: name(topic),
            topic_type: ty.to_string(),
            caller_uri: Uri::new(uri),
        }
    }

    fn register_subscriber(node: &str, uri: &str, topic: &str, ty: &str) -> DirectoryRequest {
        DirectoryRequest::RegisterSubscriber {
            caller_id: name(node),
            topic: name(topic),
            topic_type: ty.to_string(),
            caller_uri: Uri::new(uri),
        }
    }

    fn master_with_recorder() -> (MasterServer, Arc<RecordingSlaveRpc>) {
        let recorder = Arc::new(RecordingSlaveRpc::default());
        let master = MasterServer::new(Arc::new(Registry::new()), recorder.clone());
        (master, recorder)
    }

    #[tokio::test]
    async fn register_publisher_fans_out_to_known_slaves() {
        let (master, recorder) = master_with_recorder();

        let envelope = master
            .handle(register_subscriber("/listener", "http://l:1", "/chatter", "t"))
            .await;
        assert_eq!(envelope.code, StatusCode::Success.to_int());

        let envelope = master
            .handle(register_publisher("/talker", "http://t:2", "/chatter", "t"))
            .await;
        assert_eq!(envelope.code, StatusCode::Success.to_int());

        // The push is visible by the time registerPublisher returns, and the
        // pushed list contains the new publisher.
        let updates = recorder.updates.lock().unwrap();
        assert!(updates
            .iter()
            .any(|(to, topic, uris)| to.as_str() == "http://l:1"
                && topic == &name("/chatter")
                && uris.contains(&Uri::new("http://t:2"))));
    }

    #[tokio::test]
    async fn register_publisher_returns_subscriber_uris() {
        let (master, _) = master_with_recorder();
        master.handle(register_subscriber("/listener", "http://l:1", "/chatter", "t")).await;

        let envelope =
            master.handle(register_publisher("/talker", "http://t:2", "/chatter", "t")).await;
        assert_eq!(envelope.value, Payload::Uris(vec![Uri::new("http://l:1")]));
    }

    #[tokio::test]
    async fn unregister_twice_reports_one_then_zero() {
        let (master, _) = master_with_recorder();
        master.handle(register_publisher("/talker", "http://t:2", "/chatter", "t")).await;

        let unregister = DirectoryRequest::UnregisterPublisher {
            caller_id: name("/talker"),
            topic: name("/chatter"),
            caller_uri: Uri::new("http://t:2"),
        };
        let first = master.handle(unregister.clone()).await;
        let second = master.handle(unregister).await;
        assert_eq!(first.value, Payload::Int(1));
        assert_eq!(second.value, Payload::Int(0));
    }

    #[tokio::test]
    async fn node_conflict_yields_error_envelope() {
        let (master, _) = master_with_recorder();
        master.handle(register_publisher("/talker", "http://t:2", "/chatter", "t")).await;

        let envelope =
            master.handle(register_publisher("/talker", "http://elsewhere:9", "/other", "t")).await;
        assert_eq!(envelope.code, StatusCode::Error.to_int());
    }

    #[tokio::test]
    async fn lookup_unknown_service_is_error_not_failure_free_for_all() {
        let (master, _) = master_with_recorder();
        let envelope = master
            .handle(DirectoryRequest::LookupService {
                caller_id: name("/caller"),
                service: name("/missing"),
            })
            .await;
        assert_eq!(envelope.code, StatusCode::Error.to_int());
    }

    #[tokio::test]
    async fn unresolved_names_get_an_error_envelope() {
        let (master, recorder) = master_with_recorder();

        // A relative caller id is valid as a name but not resolved; the
        // master must answer, not fall over, and must register nothing.
        let envelope = master
            .handle(register_publisher("rogue_node", "http://r:1", "/chatter", "t"))
            .await;
        assert_eq!(envelope.code, StatusCode::Error.to_int());

        let envelope = master
            .handle(register_subscriber("/listener", "http://l:1", "still/relative", "t"))
            .await;
        assert_eq!(envelope.code, StatusCode::Error.to_int());

        let envelope = master
            .handle(DirectoryRequest::RegisterService {
                caller_id: name("~private"),
                service: name("/add_two_ints"),
                service_uri: Uri::new("tcp://s:1"),
                caller_uri: Uri::new("http://s:2"),
            })
            .await;
        assert_eq!(envelope.code, StatusCode::Error.to_int());

        assert!(master.registry().slaves().is_empty());
        assert!(recorder.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slave_only_methods_are_rejected() {
        let (master, _) = master_with_recorder();
        let envelope = master
            .handle(DirectoryRequest::RequestTopic {
                caller_id: name("/caller"),
                topic: name("/chatter"),
                protocols: vec!["TCPROS".to_string()],
            })
            .await;
        assert_eq!(envelope.code, StatusCode::Failure.to_int());
    }
}
