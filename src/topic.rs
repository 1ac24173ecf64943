//! # Topic Sessions
//!
//! Node-local session objects for one topic each:
//!
//! - [`Publisher`]: tracks registration state, the set of subscribers that
//!   completed the handshake, and the outgoing message queue.
//! - [`Subscriber`]: tracks registration state, the set of known publishers,
//!   and live connections feeding the incoming message queue.
//!
//! ## Handshake
//!
//! Every fresh peer connection starts with a header exchange. Both sides
//! validate that the peer's declared message type and checksum match their
//! own topic definition byte for byte; any disagreement rejects that one
//! connection (`Rejected`, closed, peer not added) and nothing else.
//!
//! ## Peer reconciliation
//!
//! `update_publishers` is strictly additive and idempotent: only publishers
//! never seen before get a connection attempt. Re-delivered or shrunken
//! lists change nothing; established connections are never torn down by an
//! update.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::ident::{NodeIdentifier, SubscriberIdentifier, TopicDefinition, Uri};
use crate::messages::{ConnectionHeader, HeaderField};
use crate::names::GraphName;

/// Capacity of a publisher's outgoing queue. Slow subscriber connections
/// lag and drop rather than stall the publishing task.
const OUTGOING_QUEUE_SIZE: usize = 256;

/// Capacity of a subscriber's incoming queue.
const INCOMING_QUEUE_SIZE: usize = 256;

/// Master-driven registration lifecycle, orthogonal to per-connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
}

/// Per-peer-connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Rejected,
    Closed,
}

/// Error type for handshake validation failures. Fatal to the one
/// connection attempt, nothing more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    MissingField(&'static str),
    TypeMismatch { expected: String, received: String },
    ChecksumMismatch { expected: String, received: String },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::MissingField(field) => {
                write!(f, "handshake header is missing required field {:?}", field)
            }
            HandshakeError::TypeMismatch { expected, received } => {
                write!(f, "message type mismatch: local {:?}, peer {:?}", expected, received)
            }
            HandshakeError::ChecksumMismatch { expected, received } => {
                write!(f, "checksum mismatch: local {:?}, peer {:?}", expected, received)
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Validate a peer's handshake header against a local topic definition.
/// Equality is byte-for-byte string comparison; a wildcard is just another
/// non-matching string here.
pub fn validate_handshake(
    definition: &TopicDefinition,
    incoming: &ConnectionHeader,
) -> Result<(), HandshakeError> {
    let peer_type =
        incoming.get(HeaderField::MessageType).ok_or(HandshakeError::MissingField("type"))?;
    if peer_type != definition.message_type() {
        return Err(HandshakeError::TypeMismatch {
            expected: definition.message_type().to_string(),
            received: peer_type.to_string(),
        });
    }
    if let Some(checksum) = definition.checksum() {
        let peer_checksum =
            incoming.get(HeaderField::Checksum).ok_or(HandshakeError::MissingField("md5sum"))?;
        if peer_checksum != checksum {
            return Err(HandshakeError::ChecksumMismatch {
                expected: checksum.to_string(),
                received: peer_checksum.to_string(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Publisher
// ============================================================================

/// Node-local publisher session for one topic.
pub struct Publisher {
    definition: TopicDefinition,
    registration: Mutex<RegistrationState>,
    /// Subscribers that completed the handshake.
    subscribers: Mutex<HashSet<SubscriberIdentifier>>,
    outgoing_tx: broadcast::Sender<Vec<u8>>,
}

impl Publisher {
    pub fn new(definition: TopicDefinition) -> Arc<Self> {
        let (outgoing_tx, _) = broadcast::channel(OUTGOING_QUEUE_SIZE);
        Arc::new(Publisher {
            definition,
            registration: Mutex::new(RegistrationState::Unregistered),
            subscribers: Mutex::new(HashSet::new()),
            outgoing_tx,
        })
    }

    pub fn definition(&self) -> &TopicDefinition {
        &self.definition
    }

    pub fn topic_name(&self) -> &GraphName {
        self.definition.name()
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.registration.lock().expect("registration lock")
    }

    pub fn is_registered(&self) -> bool {
        self.registration_state() == RegistrationState::Registered
    }

    pub fn mark_registering(&self) {
        *self.registration.lock().expect("registration lock") = RegistrationState::Registering;
    }

    pub fn mark_registered(&self) {
        *self.registration.lock().expect("registration lock") = RegistrationState::Registered;
    }

    pub fn mark_unregistered(&self) {
        *self.registration.lock().expect("registration lock") = RegistrationState::Unregistered;
    }

    /// Serve an incoming subscriber handshake. On success the subscriber is
    /// added to the known-peer set and the outgoing header (this publisher's
    /// topic definition) is returned for the wire. On mismatch the
    /// connection must be closed by the caller; the peer is not added.
    pub fn finish_handshake(
        &self,
        incoming: &ConnectionHeader,
    ) -> Result<ConnectionHeader, HandshakeError> {
        validate_handshake(&self.definition, incoming)?;

        let caller =
            incoming.get(HeaderField::CallerId).ok_or(HandshakeError::MissingField("callerid"))?;
        if let Ok(name) = GraphName::new(caller) {
            // Subscriber URIs are not part of the handshake header; identity
            // here is the caller name plus our topic definition.
            let node = NodeIdentifier::new(name.to_global(), Uri::new(""));
            let subscriber = SubscriberIdentifier::new(node, self.definition.clone());
            self.subscribers.lock().expect("subscribers lock").insert(subscriber);
        }
        info!(topic = %self.topic_name(), subscriber = caller, "subscriber handshake complete");
        Ok(self.definition.to_header())
    }

    /// Queue a serialized message for every established subscriber
    /// connection.
    pub fn publish(&self, payload: Vec<u8>) {
        // No receivers just means no connected subscribers yet.
        let _ = self.outgoing_tx.send(payload);
    }

    /// Subscribe a freshly-handshaken connection to the outgoing queue.
    pub fn outgoing_queue(&self) -> broadcast::Receiver<Vec<u8>> {
        self.outgoing_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscribers lock").len()
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// Seam through which a subscriber opens a connection to one publisher:
/// negotiate, connect, exchange headers. Implementations return the peer's
/// response header plus the stream of payload frames; validation and
/// bookkeeping stay with the [`Subscriber`].
#[async_trait]
pub trait PublisherConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        local_header: ConnectionHeader,
        publisher_uri: &Uri,
        topic: &GraphName,
    ) -> Result<PublisherConnection>;
}

/// An opened (but not yet validated) connection to a publisher.
pub struct PublisherConnection {
    /// The publisher's handshake response header.
    pub header: ConnectionHeader,
    /// Payload frames; the channel closes when the connection does.
    pub frames: mpsc::Receiver<Vec<u8>>,
}

/// Peer bookkeeping, all mutated under one lock per subscriber.
#[derive(Default)]
struct PeerState {
    /// Publishers with an established, handshake-validated connection.
    known: HashSet<Uri>,
    /// Connection attempts in flight, so re-delivered updates cannot start
    /// duplicates.
    in_progress: HashSet<Uri>,
    /// Last observed state per peer connection.
    connections: HashMap<Uri, ConnectionState>,
}

/// Node-local subscriber session for one topic.
pub struct Subscriber {
    definition: TopicDefinition,
    node: NodeIdentifier,
    registration: Mutex<RegistrationState>,
    peers: Mutex<PeerState>,
    connector: Arc<dyn PublisherConnector>,
    incoming_tx: mpsc::Sender<Vec<u8>>,
    /// Taken exactly once by whoever consumes messages.
    incoming_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl Subscriber {
    pub fn new(
        definition: TopicDefinition,
        node: NodeIdentifier,
        connector: Arc<dyn PublisherConnector>,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        Arc::new(Subscriber {
            definition,
            node,
            registration: Mutex::new(RegistrationState::Unregistered),
            peers: Mutex::new(PeerState::default()),
            connector,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(Some(incoming_rx)),
        })
    }

    pub fn definition(&self) -> &TopicDefinition {
        &self.definition
    }

    pub fn topic_name(&self) -> &GraphName {
        self.definition.name()
    }

    pub fn identifier(&self) -> SubscriberIdentifier {
        SubscriberIdentifier::new(self.node.clone(), self.definition.clone())
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.registration.lock().expect("registration lock")
    }

    pub fn is_registered(&self) -> bool {
        self.registration_state() == RegistrationState::Registered
    }

    pub fn mark_registering(&self) {
        *self.registration.lock().expect("registration lock") = RegistrationState::Registering;
    }

    pub fn mark_registered(&self) {
        *self.registration.lock().expect("registration lock") = RegistrationState::Registered;
    }

    pub fn mark_unregistered(&self) {
        *self.registration.lock().expect("registration lock") = RegistrationState::Unregistered;
    }

    /// Publishers with an established connection.
    pub fn known_publishers(&self) -> HashSet<Uri> {
        self.peers.lock().expect("peers lock").known.clone()
    }

    /// Last observed connection state for a publisher endpoint.
    pub fn connection_state(&self, publisher: &Uri) -> Option<ConnectionState> {
        self.peers.lock().expect("peers lock").connections.get(publisher).copied()
    }

    /// Take the incoming message queue. Yields `None` once taken.
    pub async fn messages(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.incoming_rx.lock().await.take()
    }

    /// Reconcile against a pushed publisher list. Strictly additive: only
    /// endpoints never seen before (neither established nor in progress)
    /// get a connection attempt. Stale peers are never removed here.
    pub fn update_publishers(self: &Arc<Self>, publisher_uris: Vec<Uri>) {
        let fresh: Vec<Uri> = {
            let mut peers = self.peers.lock().expect("peers lock");
            let fresh: Vec<Uri> = publisher_uris
                .into_iter()
                .filter(|uri| !peers.known.contains(uri) && !peers.in_progress.contains(uri))
                .collect();
            for uri in &fresh {
                peers.in_progress.insert(uri.clone());
                peers.connections.insert(uri.clone(), ConnectionState::Connecting);
            }
            fresh
        };
        if fresh.is_empty() {
            return;
        }
        debug!(topic = %self.topic_name(), new_publishers = fresh.len(), "connecting to new publishers");
        for uri in fresh {
            let subscriber = self.clone();
            tokio::spawn(async move {
                subscriber.connect_to(uri).await;
            });
        }
    }

    /// Open, handshake, and (on success) adopt one publisher connection.
    async fn connect_to(self: Arc<Self>, uri: Uri) {
        let local_header = self.identifier().to_header();
        self.set_connection_state(&uri, ConnectionState::Handshaking);

        let connection =
            match self.connector.connect(local_header, &uri, self.topic_name()).await {
                Ok(connection) => connection,
                Err(error) => {
                    warn!(topic = %self.topic_name(), publisher = %uri, error = %error, "connection failed");
                    self.abandon(&uri, ConnectionState::Closed);
                    return;
                }
            };

        if let Err(error) = validate_handshake(&self.definition, &connection.header) {
            warn!(topic = %self.topic_name(), publisher = %uri, error = %error, "handshake rejected");
            self.abandon(&uri, ConnectionState::Rejected);
            return;
        }

        // Only now does the peer become known.
        {
            let mut peers = self.peers.lock().expect("peers lock");
            peers.in_progress.remove(&uri);
            peers.known.insert(uri.clone());
            peers.connections.insert(uri.clone(), ConnectionState::Established);
        }
        info!(topic = %self.topic_name(), publisher = %uri, "publisher connection established");

        let mut frames = connection.frames;
        let incoming_tx = self.incoming_tx.clone();
        let subscriber = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if incoming_tx.send(frame).await.is_err() {
                    break; // Subscriber gone.
                }
            }
            subscriber.set_connection_state(&uri, ConnectionState::Closed);
        });
    }

    fn abandon(&self, uri: &Uri, state: ConnectionState) {
        let mut peers = self.peers.lock().expect("peers lock");
        peers.in_progress.remove(uri);
        peers.connections.insert(uri.clone(), state);
    }

    fn set_connection_state(&self, uri: &Uri, state: ConnectionState) {
        self.peers.lock().expect("peers lock").connections.insert(uri.clone(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout, Duration};

    fn name(s: &str) -> GraphName {
        GraphName::new(s).expect("valid name")
    }

    fn definition(ty: &str) -> TopicDefinition {
        TopicDefinition::new(name("/chatter"), ty, Some(format!("{}-sum", ty)))
    }

    fn local_node() -> NodeIdentifier {
        NodeIdentifier::new(name("/listener"), Uri::new("http://l:1"))
    }

    /// Connector double: hands out a configurable response header and counts
    /// connection attempts per endpoint.
    struct FakeConnector {
        response: ConnectionHeader,
        attempts: Mutex<HashMap<String, usize>>,
        fail_transport: bool,
    }

    impl FakeConnector {
        fn for_definition(definition: &TopicDefinition) -> Arc<Self> {
            Arc::new(FakeConnector {
                response: definition.to_header(),
                attempts: Mutex::new(HashMap::new()),
                fail_transport: false,
            })
        }

        fn with_response(response: ConnectionHeader) -> Arc<Self> {
            Arc::new(FakeConnector {
                response,
                attempts: Mutex::new(HashMap::new()),
                fail_transport: false,
            })
        }

        fn attempts_to(&self, uri: &str) -> usize {
            self.attempts.lock().unwrap().get(uri).copied().unwrap_or(0)
        }

        fn total_attempts(&self) -> usize {
            self.attempts.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl PublisherConnector for FakeConnector {
        async fn connect(
            &self,
            _local_header: ConnectionHeader,
            publisher_uri: &Uri,
            _topic: &GraphName,
        ) -> Result<PublisherConnection> {
            *self.attempts.lock().unwrap().entry(publisher_uri.as_str().to_string()).or_insert(0) +=
                1;
            if self.fail_transport {
                bail!("connection refused");
            }
            let (_tx, frames) = mpsc::channel(1);
            Ok(PublisherConnection { header: self.response.clone(), frames })
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn handshake_validation_accepts_exact_match() {
        let definition = definition("std_msgs/String");
        assert!(validate_handshake(&definition, &definition.to_header()).is_ok());
    }

    #[test]
    fn handshake_validation_rejects_type_mismatch() {
        let mine = definition("typeA");
        let theirs = definition("typeB");
        let error = validate_handshake(&mine, &theirs.to_header()).unwrap_err();
        assert!(matches!(error, HandshakeError::TypeMismatch { .. }));
    }

    #[test]
    fn handshake_validation_rejects_checksum_mismatch() {
        let mine = definition("typeA");
        let theirs = TopicDefinition::new(name("/chatter"), "typeA", Some("other-sum".to_string()));
        let error = validate_handshake(&mine, &theirs.to_header()).unwrap_err();
        assert!(matches!(error, HandshakeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn handshake_wildcard_is_not_a_match() {
        let mine = definition("typeA");
        let theirs = TopicDefinition::new(name("/chatter"), "*", None);
        assert!(validate_handshake(&mine, &theirs.to_header()).is_err());
    }

    #[test]
    fn publisher_handshake_adds_peer_on_match() {
        let publisher = Publisher::new(definition("std_msgs/String"));
        let subscriber = SubscriberIdentifier::new(local_node(), definition("std_msgs/String"));

        let response = publisher.finish_handshake(&subscriber.to_header()).unwrap();
        assert_eq!(response.get(HeaderField::MessageType), Some("std_msgs/String"));
        assert_eq!(publisher.subscriber_count(), 1);
    }

    #[test]
    fn publisher_handshake_rejects_and_adds_nothing() {
        let publisher = Publisher::new(definition("typeB"));
        let subscriber = SubscriberIdentifier::new(local_node(), definition("typeA"));

        assert!(publisher.finish_handshake(&subscriber.to_header()).is_err());
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn update_publishers_connects_only_to_new_peers() {
        let definition = definition("std_msgs/String");
        let connector = FakeConnector::for_definition(&definition);
        let subscriber = Subscriber::new(definition, local_node(), connector.clone());

        let a = Uri::new("http://a:1");
        let b = Uri::new("http://b:2");
        subscriber.update_publishers(vec![a.clone(), b.clone()]);
        wait_until(|| subscriber.known_publishers().len() == 2).await;

        // Identical list: no new attempts, known set unchanged.
        subscriber.update_publishers(vec![a.clone(), b.clone()]);
        // Shrunken list: nothing removed.
        subscriber.update_publishers(vec![a.clone()]);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(subscriber.known_publishers().len(), 2);
        assert_eq!(connector.total_attempts(), 2);

        // Grown list: exactly one new attempt.
        let c = Uri::new("http://c:3");
        subscriber.update_publishers(vec![a.clone(), b.clone(), c.clone()]);
        wait_until(|| subscriber.known_publishers().len() == 3).await;
        assert_eq!(connector.attempts_to("http://a:1"), 1);
        assert_eq!(connector.attempts_to("http://b:2"), 1);
        assert_eq!(connector.attempts_to("http://c:3"), 1);
    }

    #[tokio::test]
    async fn handshake_mismatch_leaves_known_publishers_unchanged() {
        let mine = definition("typeA");
        let theirs = definition("typeB");
        let connector = FakeConnector::with_response(theirs.to_header());
        let subscriber = Subscriber::new(mine, local_node(), connector.clone());

        let peer = Uri::new("http://p:1");
        subscriber.update_publishers(vec![peer.clone()]);
        wait_until(|| {
            subscriber.connection_state(&peer) == Some(ConnectionState::Rejected)
        })
        .await;

        assert!(subscriber.known_publishers().is_empty());
        assert_eq!(connector.attempts_to("http://p:1"), 1);
    }

    #[tokio::test]
    async fn established_frames_reach_the_incoming_queue() {
        let definition = definition("std_msgs/String");

        struct StreamingConnector {
            header: ConnectionHeader,
        }

        #[async_trait]
        impl PublisherConnector for StreamingConnector {
            async fn connect(
                &self,
                _local_header: ConnectionHeader,
                _publisher_uri: &Uri,
                _topic: &GraphName,
            ) -> Result<PublisherConnection> {
                let (tx, frames) = mpsc::channel(4);
                tokio::spawn(async move {
                    let _ = tx.send(b"hello".to_vec()).await;
                    let _ = tx.send(b"world".to_vec()).await;
                });
                Ok(PublisherConnection { header: self.header.clone(), frames })
            }
        }

        let connector = Arc::new(StreamingConnector { header: definition.to_header() });
        let subscriber = Subscriber::new(definition, local_node(), connector);
        let mut messages = subscriber.messages().await.expect("first take");
        assert!(subscriber.messages().await.is_none(), "queue is take-once");

        subscriber.update_publishers(vec![Uri::new("http://p:1")]);
        let first = timeout(Duration::from_secs(5), messages.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(5), messages.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"hello"[..]));
        assert_eq!(second.as_deref(), Some(&b"world"[..]));
    }

    #[tokio::test]
    async fn registration_state_transitions() {
        let publisher = Publisher::new(definition("t"));
        assert_eq!(publisher.registration_state(), RegistrationState::Unregistered);
        publisher.mark_registering();
        assert_eq!(publisher.registration_state(), RegistrationState::Registering);
        publisher.mark_registered();
        assert!(publisher.is_registered());
    }

    #[tokio::test]
    async fn transport_failure_is_closed_not_rejected() {
        let definition = definition("t");
        let connector = Arc::new(FakeConnector {
            response: definition.to_header(),
            attempts: Mutex::new(HashMap::new()),
            fail_transport: true,
        });
        let subscriber = Subscriber::new(definition, local_node(), connector);

        let peer = Uri::new("http://p:1");
        subscriber.update_publishers(vec![peer.clone()]);
        wait_until(|| subscriber.connection_state(&peer) == Some(ConnectionState::Closed)).await;
        assert!(subscriber.known_publishers().is_empty());
    }
}
