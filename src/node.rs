//! # Node
//!
//! The per-process facade. A [`Node`] owns:
//!
//! - the slave RPC endpoint serving `publisherUpdate` and `requestTopic`,
//! - one data listener serving topic and service peer connections,
//! - the session table (publishers, subscribers, service servers),
//! - a [`RegistrationManager`] keeping the master informed in the background.
//!
//! Creating a publisher, subscriber, or service server returns immediately;
//! the master registration is queued and retried until it lands. Shutdown
//! unregisters everything best-effort: failures are logged, never raised.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::client::{MasterClient, SlaveClient};
use crate::ident::{NodeIdentifier, PublisherIdentifier, TopicDefinition, Uri};
use crate::messages::{ConnectionHeader, DirectoryRequest, Envelope, HeaderField, Payload};
use crate::names::{GraphName, NameResolver};
use crate::protocols::{DirectoryHandler, SlaveRpc};
use crate::registration::{RegistrationManager, DEFAULT_RETRY_DELAY};
use crate::response::StatusCode;
use crate::rpc::{read_frame, write_frame, RpcClient, RpcServer};
use crate::service::{ServiceClient, ServiceConnection, ServiceConnector, ServiceDefinition, ServiceHandler, ServiceRequest, ServiceServer};
use crate::topic::{Publisher, PublisherConnection, PublisherConnector, Subscriber};

/// The single bulk-data protocol spoken on peer connections.
pub const DATA_PROTOCOL: &str = "TCPROS";

/// Buffer for frames flowing from one peer connection into a session.
const PEER_FRAME_BUFFER: usize = 64;

/// Everything needed to start a [`Node`].
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// The node's name; resolved against `namespace` if not global.
    pub name: GraphName,
    /// Default namespace for relative names.
    pub namespace: GraphName,
    /// Where the master's directory endpoint lives.
    pub master_uri: Uri,
    /// Bind address for the slave RPC endpoint.
    pub rpc_bind_addr: String,
    /// Bind address for the topic/service data listener.
    pub data_bind_addr: String,
    /// Delay between attempts of a failed master registration.
    pub retry_delay: Duration,
}

impl NodeConfig {
    pub fn new(name: GraphName, master_uri: Uri) -> Self {
        NodeConfig {
            name,
            namespace: GraphName::root(),
            master_uri,
            rpc_bind_addr: "127.0.0.1:0".to_string(),
            data_bind_addr: "127.0.0.1:0".to_string(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

// ============================================================================
// Session table
// ============================================================================

/// The node's live sessions, shared between the public facade, the slave
/// RPC endpoint, and the data listener.
struct SessionTable {
    publishers: Mutex<HashMap<GraphName, Arc<Publisher>>>,
    subscribers: Mutex<HashMap<GraphName, Arc<Subscriber>>>,
    services: Mutex<HashMap<GraphName, Arc<ServiceServer>>>,
    /// Where peers reach the data listener.
    data_uri: Uri,
}

impl SessionTable {
    fn publisher_for(&self, topic: &GraphName) -> Option<Arc<Publisher>> {
        self.publishers.lock().expect("publishers lock").get(topic).cloned()
    }

    fn subscriber_for(&self, topic: &GraphName) -> Option<Arc<Subscriber>> {
        self.subscribers.lock().expect("subscribers lock").get(topic).cloned()
    }

    fn service_for(&self, service: &GraphName) -> Option<Arc<ServiceServer>> {
        self.services.lock().expect("services lock").get(service).cloned()
    }
}

// ============================================================================
// Slave RPC endpoint
// ============================================================================

/// Serves the two directory operations addressed to a node rather than the
/// master. Everything else answers `FAILURE`.
struct SlaveEndpoint {
    sessions: Arc<SessionTable>,
}

#[async_trait]
impl DirectoryHandler for SlaveEndpoint {
    async fn handle(&self, request: DirectoryRequest) -> Envelope {
        match request {
            DirectoryRequest::PublisherUpdate { caller_id, topic, publisher_uris } => {
                trace!(caller = %caller_id, topic = %topic, publishers = publisher_uris.len(), "publisherUpdate");
                match self.sessions.subscriber_for(&topic) {
                    Some(subscriber) => {
                        subscriber.update_publishers(publisher_uris);
                        ok_envelope("publisher list applied", Payload::Int(1))
                    }
                    // An update for a topic we no longer subscribe to is
                    // harmless, not an error.
                    None => ok_envelope("no local subscriber for topic", Payload::Int(0)),
                }
            }
            DirectoryRequest::RequestTopic { caller_id, topic, protocols } => {
                trace!(caller = %caller_id, topic = %topic, "requestTopic");
                if self.sessions.publisher_for(&topic).is_none() {
                    return Envelope {
                        code: StatusCode::Error.to_int(),
                        message: format!("topic {} is not advertised by this node", topic),
                        value: Payload::None,
                    };
                }
                if !protocols.iter().any(|p| p == DATA_PROTOCOL) {
                    return Envelope {
                        code: StatusCode::Error.to_int(),
                        message: format!("no supported protocol among {:?}", protocols),
                        value: Payload::None,
                    };
                }
                ok_envelope(
                    "ready on data listener",
                    Payload::Protocol {
                        name: DATA_PROTOCOL.to_string(),
                        params: vec![self.sessions.data_uri.authority().to_string()],
                    },
                )
            }
            other => Envelope {
                code: StatusCode::Failure.to_int(),
                message: format!("{} is not served by a node endpoint", other.method()),
                value: Payload::None,
            },
        }
    }
}

fn ok_envelope(message: &str, value: Payload) -> Envelope {
    Envelope { code: StatusCode::Success.to_int(), message: message.to_string(), value }
}

// ============================================================================
// Data listener
// ============================================================================

/// Serve one inbound peer connection: header exchange, then either a topic
/// frame stream or a service request/response loop.
async fn serve_peer(mut stream: TcpStream, sessions: Arc<SessionTable>) {
    stream.set_nodelay(true).ok();
    if let Err(error) = peer_session(&mut stream, &sessions).await {
        debug!(error = %error, "peer connection ended");
    }
}

async fn peer_session(stream: &mut TcpStream, sessions: &SessionTable) -> Result<()> {
    let frame = read_frame(stream).await?;
    let incoming = ConnectionHeader::decode(&frame).context("undecodable handshake header")?;

    if incoming.get(HeaderField::Service).is_some() {
        serve_service_peer(stream, sessions, incoming).await
    } else {
        serve_topic_peer(stream, sessions, incoming).await
    }
}

async fn serve_topic_peer(
    stream: &mut TcpStream,
    sessions: &SessionTable,
    incoming: ConnectionHeader,
) -> Result<()> {
    let topic = match incoming.get(HeaderField::Topic).and_then(|t| GraphName::new(t).ok()) {
        Some(topic) => topic,
        None => return reject_peer(stream, "missing or malformed topic field").await,
    };
    let publisher = match sessions.publisher_for(&topic) {
        Some(publisher) => publisher,
        None => {
            return reject_peer(stream, &format!("topic {} is not advertised here", topic)).await
        }
    };
    let response = match publisher.finish_handshake(&incoming) {
        Ok(response) => response,
        Err(error) => return reject_peer(stream, &error.to_string()).await,
    };

    // Subscribe before acking so nothing published after the handshake can
    // slip past this connection.
    let mut queue = publisher.outgoing_queue();
    write_frame(stream, &response.encode()?).await?;

    loop {
        match queue.recv().await {
            Ok(frame) => write_frame(stream, &frame).await?,
            Err(RecvError::Lagged(skipped)) => {
                warn!(topic = %topic, skipped, "slow subscriber connection dropped frames");
            }
            Err(RecvError::Closed) => break,
        }
    }
    Ok(())
}

async fn serve_service_peer(
    stream: &mut TcpStream,
    sessions: &SessionTable,
    incoming: ConnectionHeader,
) -> Result<()> {
    let service = match incoming.get(HeaderField::Service).and_then(|s| GraphName::new(s).ok()) {
        Some(service) => service,
        None => return reject_peer(stream, "malformed service field").await,
    };
    let server = match sessions.service_for(&service) {
        Some(server) => server,
        None => {
            return reject_peer(stream, &format!("service {} is not provided here", service)).await
        }
    };
    let response = match server.finish_handshake(&incoming) {
        Ok(response) => response,
        Err(error) => return reject_peer(stream, &error.to_string()).await,
    };
    write_frame(stream, &response.encode()?).await?;

    loop {
        let request = match read_frame(stream).await {
            Ok(request) => request,
            Err(_) => break, // Client hung up.
        };
        let reply = server.handle_request(request);
        write_frame(stream, &reply).await?;
    }
    Ok(())
}

/// Answer a failed handshake with an error header, then let the connection
/// close.
async fn reject_peer(stream: &mut TcpStream, reason: &str) -> Result<()> {
    let mut header = ConnectionHeader::new();
    header.set(HeaderField::Error, reason);
    write_frame(stream, &header.encode()?).await
}

// ============================================================================
// Outbound peer connector
// ============================================================================

/// Opens outbound peer connections: negotiates the transport over the remote
/// node's RPC endpoint, dials its data listener, and exchanges headers.
struct RemoteConnector {
    slave: SlaveClient,
}

#[async_trait]
impl PublisherConnector for RemoteConnector {
    async fn connect(
        &self,
        local_header: ConnectionHeader,
        publisher_uri: &Uri,
        topic: &GraphName,
    ) -> Result<PublisherConnection> {
        let (protocol, params) = self
            .slave
            .request_topic(publisher_uri, topic, vec![DATA_PROTOCOL.to_string()])
            .await?;
        if protocol != DATA_PROTOCOL {
            bail!("publisher offered unsupported protocol {:?}", protocol);
        }
        let authority =
            params.first().context("transport negotiation returned no endpoint")?.clone();

        let mut stream = TcpStream::connect(&authority)
            .await
            .with_context(|| format!("failed to dial publisher data endpoint {}", authority))?;
        stream.set_nodelay(true).ok();
        write_frame(&mut stream, &local_header.encode()?).await?;
        let response = read_frame(&mut stream).await?;
        // A rejection header comes back through the same channel; the
        // session's validation decides what to make of it.
        let header = ConnectionHeader::decode(&response).context("undecodable response header")?;

        let (tx, frames) = mpsc::channel(PEER_FRAME_BUFFER);
        tokio::spawn(async move {
            loop {
                match read_frame(&mut stream).await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break; // Session gone.
                        }
                    }
                    Err(_) => break, // Publisher hung up.
                }
            }
        });
        Ok(PublisherConnection { header, frames })
    }
}

#[async_trait]
impl ServiceConnector for RemoteConnector {
    async fn connect(
        &self,
        local_header: ConnectionHeader,
        provider_uri: &Uri,
    ) -> Result<ServiceConnection> {
        let authority = provider_uri.authority().to_string();
        let mut stream = TcpStream::connect(&authority)
            .await
            .with_context(|| format!("failed to dial service provider {}", authority))?;
        stream.set_nodelay(true).ok();
        write_frame(&mut stream, &local_header.encode()?).await?;
        let response = read_frame(&mut stream).await?;
        let header = ConnectionHeader::decode(&response).context("undecodable response header")?;

        let (requests, mut rx) = mpsc::channel::<ServiceRequest>(PEER_FRAME_BUFFER);
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                if write_frame(&mut stream, &request).await.is_err() {
                    break;
                }
                match read_frame(&mut stream).await {
                    Ok(frame) => {
                        let _ = reply.send(frame);
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(ServiceConnection { header, requests })
    }
}

// ============================================================================
// Node
// ============================================================================

/// A running node: RPC endpoint, data listener, sessions, and background
/// master registration.
pub struct Node {
    identity: NodeIdentifier,
    resolver: NameResolver,
    master: MasterClient,
    registration: RegistrationManager,
    sessions: Arc<SessionTable>,
    connector: Arc<RemoteConnector>,
    rpc_client: RpcClient,
    rpc_server: RpcServer,
    data_task: JoinHandle<()>,
}

impl Node {
    /// Bind both endpoints and start the registration worker. Does not
    /// contact the master; the first registrations do that, with retry.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let node_name = if config.name.is_global() {
            config.name.clone()
        } else {
            config.namespace.join(&config.name.to_relative())
        };
        let resolver = NameResolver::new(config.namespace.clone(), node_name.clone())?;

        let data_listener = TcpListener::bind(&config.data_bind_addr)
            .await
            .with_context(|| format!("failed to bind data listener on {}", config.data_bind_addr))?;
        let data_addr = data_listener.local_addr().context("no local address")?;
        let sessions = Arc::new(SessionTable {
            publishers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            data_uri: Uri::new(format!("tcp://{}", data_addr)),
        });

        let accept_sessions = sessions.clone();
        let data_task = tokio::spawn(async move {
            loop {
                match data_listener.accept().await {
                    Ok((stream, peer)) => {
                        trace!(%peer, "accepted peer connection");
                        tokio::spawn(serve_peer(stream, accept_sessions.clone()));
                    }
                    Err(error) => {
                        warn!(error = %error, "data listener accept failed");
                    }
                }
            }
        });

        let rpc_server = RpcServer::bind(
            &config.rpc_bind_addr,
            Arc::new(SlaveEndpoint { sessions: sessions.clone() }),
        )
        .await?;
        let identity = NodeIdentifier::new(node_name, rpc_server.local_uri().clone());

        let rpc_client = RpcClient::new();
        let master =
            MasterClient::new(Arc::new(rpc_client.clone()), config.master_uri.clone());
        let slave = SlaveClient::new(identity.name().clone(), Arc::new(rpc_client.clone()));
        let connector = Arc::new(RemoteConnector { slave });
        let registration = RegistrationManager::with_retry_delay(config.retry_delay);

        info!(
            node = %identity.name(),
            rpc = %identity.uri(),
            data = %sessions.data_uri,
            master = %config.master_uri,
            "node started"
        );
        Ok(Arc::new(Node {
            identity,
            resolver,
            master,
            registration,
            sessions,
            connector,
            rpc_client,
            rpc_server,
            data_task,
        }))
    }

    pub fn name(&self) -> &GraphName {
        self.identity.name()
    }

    /// URI of this node's slave RPC endpoint; this is what the directory
    /// hands out to peers.
    pub fn uri(&self) -> &Uri {
        self.identity.uri()
    }

    /// URI of the data listener serving topic and service connections.
    pub fn data_uri(&self) -> &Uri {
        &self.sessions.data_uri
    }

    pub fn master_client(&self) -> &MasterClient {
        &self.master
    }

    /// True iff no master registration is currently failed and retrying.
    pub fn is_registration_ok(&self) -> bool {
        self.registration.is_registration_ok()
    }

    /// Registrations queued or retrying, not yet confirmed by the master.
    pub fn pending_registrations(&self) -> usize {
        self.registration.pending_count()
    }

    /// Create (or return the cached) publisher for a topic and queue its
    /// master registration. Never blocks on the master.
    pub fn publisher(
        &self,
        topic: &GraphName,
        message_type: &str,
        checksum: Option<String>,
    ) -> Result<Arc<Publisher>> {
        let name = self.resolver.resolve(topic);
        let publisher = {
            let mut publishers = self.sessions.publishers.lock().expect("publishers lock");
            if let Some(existing) = publishers.get(&name) {
                if existing.definition().message_type() != message_type {
                    bail!(
                        "topic {} is already advertised with type {}",
                        name,
                        existing.definition().message_type()
                    );
                }
                return Ok(existing.clone());
            }
            let definition = TopicDefinition::new(name.clone(), message_type, checksum);
            let publisher = Publisher::new(definition);
            publishers.insert(name.clone(), publisher.clone());
            publisher
        };

        publisher.mark_registering();
        let identifier =
            PublisherIdentifier::new(self.identity.clone(), publisher.definition().clone());
        let master = self.master.clone();
        let session = publisher.clone();
        self.registration.submit(format!("registerPublisher {}", name), move || {
            let master = master.clone();
            let identifier = identifier.clone();
            let session = session.clone();
            async move {
                master.register_publisher(&identifier).await?;
                session.mark_registered();
                Ok(())
            }
        });
        Ok(publisher)
    }

    /// Create (or return the cached) subscriber for a topic and queue its
    /// master registration. The bootstrap publisher list returned by the
    /// master feeds straight into peer reconciliation.
    pub fn subscriber(
        &self,
        topic: &GraphName,
        message_type: &str,
        checksum: Option<String>,
    ) -> Result<Arc<Subscriber>> {
        let name = self.resolver.resolve(topic);
        let subscriber = {
            let mut subscribers = self.sessions.subscribers.lock().expect("subscribers lock");
            if let Some(existing) = subscribers.get(&name) {
                if existing.definition().message_type() != message_type {
                    bail!(
                        "topic {} is already subscribed with type {}",
                        name,
                        existing.definition().message_type()
                    );
                }
                return Ok(existing.clone());
            }
            let definition = TopicDefinition::new(name.clone(), message_type, checksum);
            let subscriber =
                Subscriber::new(definition, self.identity.clone(), self.connector.clone());
            subscribers.insert(name.clone(), subscriber.clone());
            subscriber
        };

        subscriber.mark_registering();
        let identifier = subscriber.identifier();
        let master = self.master.clone();
        let session = subscriber.clone();
        self.registration.submit(format!("registerSubscriber {}", name), move || {
            let master = master.clone();
            let identifier = identifier.clone();
            let session = session.clone();
            async move {
                let publisher_uris = master.register_subscriber(&identifier).await?;
                session.mark_registered();
                session.update_publishers(publisher_uris);
                Ok(())
            }
        });
        Ok(subscriber)
    }

    /// Create (or return the cached) service server and queue its master
    /// registration. Requests are served on the data listener.
    pub fn service_server(
        &self,
        service: &GraphName,
        service_type: &str,
        checksum: Option<String>,
        handler: ServiceHandler,
    ) -> Result<Arc<ServiceServer>> {
        let name = self.resolver.resolve(service);
        let server = {
            let mut services = self.sessions.services.lock().expect("services lock");
            if let Some(existing) = services.get(&name) {
                if existing.definition().service_type() != service_type {
                    bail!(
                        "service {} is already provided with type {}",
                        name,
                        existing.definition().service_type()
                    );
                }
                return Ok(existing.clone());
            }
            let definition = ServiceDefinition::new(name.clone(), service_type, checksum);
            let server =
                ServiceServer::new(definition, self.sessions.data_uri.clone(), handler);
            services.insert(name.clone(), server.clone());
            server
        };

        server.mark_registering();
        let identity = self.identity.clone();
        let identifier = server.identifier();
        let master = self.master.clone();
        let session = server.clone();
        self.registration.submit(format!("registerService {}", name), move || {
            let master = master.clone();
            let identity = identity.clone();
            let identifier = identifier.clone();
            let session = session.clone();
            async move {
                master.register_service(&identity, &identifier).await?;
                session.mark_registered();
                Ok(())
            }
        });
        Ok(server)
    }

    /// Create a client session for a service. Connect it with
    /// [`Node::connect_to_service`] or [`ServiceClient::connect`] directly.
    pub fn service_client(
        &self,
        service: &GraphName,
        service_type: &str,
        checksum: Option<String>,
    ) -> Arc<ServiceClient> {
        let name = self.resolver.resolve(service);
        let definition = ServiceDefinition::new(name, service_type, checksum);
        ServiceClient::new(definition, self.identity.name().clone(), self.connector.clone())
    }

    /// Look the service up in the directory and connect a client to its
    /// current provider.
    pub async fn connect_to_service(
        &self,
        service: &GraphName,
        service_type: &str,
        checksum: Option<String>,
    ) -> Result<Arc<ServiceClient>> {
        let client = self.service_client(service, service_type, checksum);
        let provider = self
            .master
            .lookup_service(self.identity.name(), client.definition().name())
            .await?;
        client.connect(&provider).await?;
        Ok(client)
    }

    /// Stop the node: cancel queued registrations, unregister everything
    /// best-effort, close both endpoints.
    pub async fn shutdown(&self) {
        self.registration.shutdown();

        let publishers: Vec<Arc<Publisher>> = {
            let mut map = self.sessions.publishers.lock().expect("publishers lock");
            map.drain().map(|(_, session)| session).collect()
        };
        for publisher in publishers {
            let identifier =
                PublisherIdentifier::new(self.identity.clone(), publisher.definition().clone());
            if let Err(error) = self.master.unregister_publisher(&identifier).await {
                warn!(topic = %publisher.topic_name(), error = %error, "unregisterPublisher failed during shutdown");
            }
            publisher.mark_unregistered();
        }

        let subscribers: Vec<Arc<Subscriber>> = {
            let mut map = self.sessions.subscribers.lock().expect("subscribers lock");
            map.drain().map(|(_, session)| session).collect()
        };
        for subscriber in subscribers {
            if let Err(error) = self.master.unregister_subscriber(&subscriber.identifier()).await {
                warn!(topic = %subscriber.topic_name(), error = %error, "unregisterSubscriber failed during shutdown");
            }
            subscriber.mark_unregistered();
        }

        let services: Vec<Arc<ServiceServer>> = {
            let mut map = self.sessions.services.lock().expect("services lock");
            map.drain().map(|(_, session)| session).collect()
        };
        for server in services {
            if let Err(error) =
                self.master.unregister_service(&self.identity, &server.identifier()).await
            {
                warn!(service = %server.definition().name(), error = %error, "unregisterService failed during shutdown");
            }
            server.mark_unregistered();
        }

        self.rpc_server.shutdown();
        self.data_task.abort();
        self.rpc_client.shutdown();
        info!(node = %self.identity.name(), "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.data_task.abort();
    }
}
