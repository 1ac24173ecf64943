//! # Service Sessions
//!
//! Node-local sessions for named request/response endpoints. A service has
//! at most one provider at a time; the connection model is a single
//! persistent handshake-then-request/response channel, so unlike topics
//! there is no known-peer set — a reconnect replaces the prior connection
//! wholesale.
//!
//! Handshake validation is identical to topics: byte-exact type and
//! checksum agreement or the connection is rejected.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::ident::{ServiceIdentifier, Uri};
use crate::messages::{ConnectionHeader, HeaderField};
use crate::names::GraphName;
use crate::topic::{ConnectionState, HandshakeError, RegistrationState};

/// A named, typed request/response endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceDefinition {
    name: GraphName,
    service_type: String,
    checksum: Option<String>,
}

impl ServiceDefinition {
    pub fn new(name: GraphName, service_type: impl Into<String>, checksum: Option<String>) -> Self {
        debug_assert!(name.is_global(), "service name must be global: {}", name);
        ServiceDefinition { name, service_type: service_type.into(), checksum }
    }

    pub fn name(&self) -> &GraphName {
        &self.name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn to_header(&self) -> ConnectionHeader {
        let mut header = ConnectionHeader::new();
        header.set(HeaderField::Service, self.name.as_str());
        header.set(HeaderField::MessageType, &self.service_type);
        if let Some(checksum) = &self.checksum {
            header.set(HeaderField::Checksum, checksum);
        }
        header
    }
}

impl fmt::Display for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.service_type)
    }
}

/// Validate a peer's handshake header against a service definition. Same
/// byte-exact rule as topics.
pub fn validate_service_handshake(
    definition: &ServiceDefinition,
    incoming: &ConnectionHeader,
) -> Result<(), HandshakeError> {
    let peer_type =
        incoming.get(HeaderField::MessageType).ok_or(HandshakeError::MissingField("type"))?;
    if peer_type != definition.service_type() {
        return Err(HandshakeError::TypeMismatch {
            expected: definition.service_type().to_string(),
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

/// Handler invoked for each request frame; returns the response frame.
pub type ServiceHandler = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Node-local provider session for one service.
pub struct ServiceServer {
    definition: ServiceDefinition,
    /// Where clients reach this provider (the node's peer listener).
    uri: Uri,
    registration: Mutex<RegistrationState>,
    handler: ServiceHandler,
}

impl ServiceServer {
    pub fn new(definition: ServiceDefinition, uri: Uri, handler: ServiceHandler) -> Arc<Self> {
        Arc::new(ServiceServer {
            definition,
            uri,
            registration: Mutex::new(RegistrationState::Unregistered),
            handler,
        })
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn identifier(&self) -> ServiceIdentifier {
        ServiceIdentifier::new(self.definition.name().clone(), self.uri.clone())
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

    /// Serve an incoming client handshake: validate, return our header.
    /// On mismatch the caller must close the connection.
    pub fn finish_handshake(
        &self,
        incoming: &ConnectionHeader,
    ) -> Result<ConnectionHeader, HandshakeError> {
        validate_service_handshake(&self.definition, incoming)?;
        info!(
            service = %self.definition.name(),
            client = incoming.get(HeaderField::CallerId).unwrap_or("<anonymous>"),
            "service client handshake complete"
        );
        Ok(self.definition.to_header())
    }

    /// Answer one request frame.
    pub fn handle_request(&self, request: Vec<u8>) -> Vec<u8> {
        (self.handler)(request)
    }
}

/// A request routed over an established service connection: the frame plus
/// the channel the response comes back on.
pub type ServiceRequest = (Vec<u8>, oneshot::Sender<Vec<u8>>);

/// An opened (but not yet validated) connection to a service provider.
pub struct ServiceConnection {
    /// The provider's handshake response header.
    pub header: ConnectionHeader,
    /// Request channel; dropping it closes the connection.
    pub requests: mpsc::Sender<ServiceRequest>,
}

/// Seam through which a client opens a connection to a provider.
#[async_trait]
pub trait ServiceConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        local_header: ConnectionHeader,
        provider_uri: &Uri,
    ) -> Result<ServiceConnection>;
}

struct ActiveConnection {
    provider: Uri,
    requests: mpsc::Sender<ServiceRequest>,
    state: ConnectionState,
}

/// Node-local client session for one service.
pub struct ServiceClient {
    definition: ServiceDefinition,
    caller_id: GraphName,
    connector: Arc<dyn ServiceConnector>,
    connection: Mutex<Option<ActiveConnection>>,
}

impl ServiceClient {
    pub fn new(
        definition: ServiceDefinition,
        caller_id: GraphName,
        connector: Arc<dyn ServiceConnector>,
    ) -> Arc<Self> {
        Arc::new(ServiceClient { definition, caller_id, connector, connection: Mutex::new(None) })
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// The provider currently connected to, if any.
    pub fn connected_provider(&self) -> Option<Uri> {
        self.connection
            .lock()
            .expect("connection lock")
            .as_ref()
            .filter(|c| c.state == ConnectionState::Established)
            .map(|c| c.provider.clone())
    }

    /// Connect to a provider and perform the handshake. Replaces any prior
    /// connection wholesale, whether or not the new one succeeds the
    /// handshake.
    pub async fn connect(&self, provider_uri: &Uri) -> Result<()> {
        let mut header = self.definition.to_header();
        header.set(HeaderField::CallerId, self.caller_id.as_str());

        let connection = self
            .connector
            .connect(header, provider_uri)
            .await
            .with_context(|| format!("failed to reach service provider {}", provider_uri))?;

        if let Err(error) = validate_service_handshake(&self.definition, &connection.header) {
            warn!(service = %self.definition.name(), provider = %provider_uri, error = %error, "service handshake rejected");
            *self.connection.lock().expect("connection lock") = Some(ActiveConnection {
                provider: provider_uri.clone(),
                requests: connection.requests,
                state: ConnectionState::Rejected,
            });
            bail!(error);
        }

        info!(service = %self.definition.name(), provider = %provider_uri, "service connection established");
        *self.connection.lock().expect("connection lock") = Some(ActiveConnection {
            provider: provider_uri.clone(),
            requests: connection.requests,
            state: ConnectionState::Established,
        });
        Ok(())
    }

    /// Send one request over the established connection and await its
    /// response.
    pub async fn call(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let requests = {
            let connection = self.connection.lock().expect("connection lock");
            match connection.as_ref() {
                Some(active) if active.state == ConnectionState::Established => {
                    active.requests.clone()
                }
                Some(_) => bail!("service connection to {} was rejected", self.definition.name()),
                None => bail!("not connected to service {}", self.definition.name()),
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send((request, reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("service connection closed"))?;
        reply_rx.await.context("service connection closed before reply")
    }
}
