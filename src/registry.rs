//! # Registry Directory
//!
//! The master's in-memory directory: which node publishes or subscribes to
//! which topic, which node provides which service, and how to reach every
//! node that has ever registered. This is pure state plus invariants; the
//! RPC adapter and the publisher-update fan-out live in [`crate::master`].
//!
//! ## Locking
//!
//! Each collection is guarded by its own mutex, so registrations touching
//! different collections proceed in parallel and a registration storm on
//! topics never blocks service lookups. No operation takes two collection
//! locks at once except the system-state snapshot, which takes them one at
//! a time (per-collection consistency only, by design).
//!
//! ## Lifecycle
//!
//! Entries are created on first registration and removed only by explicit
//! unregistration. There is no liveness eviction: a crashed node's entries
//! persist until something unregisters them or the master restarts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::ident::{NodeIdentifier, PublisherIdentifier, ServiceIdentifier, SubscriberIdentifier, Uri};
use crate::messages::SystemState;
use crate::names::{GraphName, WILDCARD_TYPE};

/// Error type for directory consistency violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A node name is already bound to a different address. Accepting the
    /// new binding would corrupt the slave map, so it is rejected instead.
    NodeConflict {
        name: GraphName,
        existing: Uri,
        offered: Uri,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NodeConflict { name, existing, offered } => write!(
                f,
                "node {} is already bound to {} (refusing rebind to {})",
                name, existing, offered
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// The declared message type for a topic, and whether a publisher asserted
/// it. Publisher-asserted types are permanent; see [`Registry::record_type`].
#[derive(Debug, Clone)]
struct TopicType {
    message_type: String,
    publisher_asserted: bool,
}

/// The master-owned directory state. One instance per master process; shared
/// by reference with the RPC adapter.
#[derive(Default)]
pub struct Registry {
    slaves: Mutex<HashMap<GraphName, NodeIdentifier>>,
    services: Mutex<HashMap<GraphName, ServiceIdentifier>>,
    publishers: Mutex<HashMap<GraphName, HashSet<PublisherIdentifier>>>,
    subscribers: Mutex<HashMap<GraphName, HashSet<SubscriberIdentifier>>>,
    topic_types: Mutex<HashMap<GraphName, TopicType>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a publisher for its topic. Returns the topic's current
    /// subscriber set so the caller can fan out / react.
    ///
    /// The slave binding is validated first: on a name/address conflict the
    /// directory is left untouched.
    pub fn register_publisher(
        &self,
        publisher: PublisherIdentifier,
        topic_type: &str,
    ) -> Result<Vec<SubscriberIdentifier>, RegistryError> {
        self.bind_slave(publisher.node())?;
        self.record_type(publisher.topic_name(), topic_type, true);

        let topic = publisher.topic_name().clone();
        {
            let mut publishers = self.publishers.lock().expect("publishers lock");
            publishers.entry(topic.clone()).or_default().insert(publisher.clone());
        }
        info!(topic = %topic, node = %publisher.node().name(), "registered publisher");

        let subscribers = self.subscribers.lock().expect("subscribers lock");
        Ok(subscribers.get(&topic).map(|set| set.iter().cloned().collect()).unwrap_or_default())
    }

    /// Record a subscriber for its topic. Returns the topic's current
    /// publisher set — the subscriber's bootstrap list.
    pub fn register_subscriber(
        &self,
        subscriber: SubscriberIdentifier,
        topic_type: &str,
    ) -> Result<Vec<PublisherIdentifier>, RegistryError> {
        self.bind_slave(subscriber.node())?;
        self.record_type(subscriber.topic_name(), topic_type, false);

        let topic = subscriber.topic_name().clone();
        {
            let mut subscribers = self.subscribers.lock().expect("subscribers lock");
            subscribers.entry(topic.clone()).or_default().insert(subscriber.clone());
        }
        info!(topic = %topic, node = %subscriber.node().name(), "registered subscriber");

        let publishers = self.publishers.lock().expect("publishers lock");
        Ok(publishers.get(&topic).map(|set| set.iter().cloned().collect()).unwrap_or_default())
    }

    /// Remove a publisher entry. Returns true iff it was present.
    pub fn unregister_publisher(&self, publisher: &PublisherIdentifier) -> bool {
        let mut publishers = self.publishers.lock().expect("publishers lock");
        let removed = match publishers.get_mut(publisher.topic_name()) {
            Some(set) => {
                let removed = set.remove(publisher);
                if set.is_empty() {
                    publishers.remove(publisher.topic_name());
                }
                removed
            }
            None => false,
        };
        if removed {
            debug!(topic = %publisher.topic_name(), node = %publisher.node().name(), "unregistered publisher");
        }
        removed
    }

    /// Remove a subscriber entry. Returns true iff it was present.
    pub fn unregister_subscriber(&self, subscriber: &SubscriberIdentifier) -> bool {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock");
        let removed = match subscribers.get_mut(subscriber.topic_name()) {
            Some(set) => {
                let removed = set.remove(subscriber);
                if set.is_empty() {
                    subscribers.remove(subscriber.topic_name());
                }
                removed
            }
            None => false,
        };
        if removed {
            debug!(topic = %subscriber.topic_name(), node = %subscriber.node().name(), "unregistered subscriber");
        }
        removed
    }

    /// Bind a service name to a provider. Last registration wins; any
    /// previous provider is overwritten with no trace. The providing node is
    /// bound into the slave map like any other registrant.
    pub fn register_service(
        &self,
        node: &NodeIdentifier,
        service: ServiceIdentifier,
    ) -> Result<(), RegistryError> {
        self.bind_slave(node)?;
        let mut services = self.services.lock().expect("services lock");
        info!(service = %service.name(), uri = %service.uri(), node = %node.name(), "registered service");
        services.insert(service.name().clone(), service);
        Ok(())
    }

    /// Remove a service binding, but only when the caller presents the exact
    /// identity currently bound. A stale identity (same name, different
    /// provider) removes nothing and returns false.
    pub fn unregister_service(&self, service: &ServiceIdentifier) -> bool {
        let mut services = self.services.lock().expect("services lock");
        match services.get(service.name()) {
            Some(current) if current == service => {
                services.remove(service.name());
                debug!(service = %service.name(), "unregistered service");
                true
            }
            _ => false,
        }
    }

    pub fn lookup_node(&self, name: &GraphName) -> Option<NodeIdentifier> {
        self.slaves.lock().expect("slaves lock").get(name).cloned()
    }

    pub fn lookup_service(&self, name: &GraphName) -> Option<ServiceIdentifier> {
        self.services.lock().expect("services lock").get(name).cloned()
    }

    /// The declared message type for a topic, if any.
    pub fn topic_type(&self, topic: &GraphName) -> Option<String> {
        self.topic_types
            .lock()
            .expect("topic types lock")
            .get(topic)
            .map(|t| t.message_type.clone())
    }

    /// Current publisher set for a topic.
    pub fn publishers_of(&self, topic: &GraphName) -> Vec<PublisherIdentifier> {
        let publishers = self.publishers.lock().expect("publishers lock");
        publishers.get(topic).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }

    /// Current publisher endpoint URIs for a topic, as pushed in a
    /// publisher-update.
    pub fn publisher_uris(&self, topic: &GraphName) -> Vec<Uri> {
        self.publishers_of(topic).iter().map(|p| p.uri().clone()).collect()
    }

    /// Every node that has ever registered anything.
    pub fn slaves(&self) -> Vec<NodeIdentifier> {
        self.slaves.lock().expect("slaves lock").values().cloned().collect()
    }

    /// Snapshot of the whole directory for introspection. Each collection is
    /// locked independently, so the three sections need not be mutually
    /// consistent.
    pub fn system_state(&self) -> SystemState {
        let publishers = {
            let publishers = self.publishers.lock().expect("publishers lock");
            collect_topic_nodes(&publishers, |p: &PublisherIdentifier| p.node().name().clone())
        };
        let subscribers = {
            let subscribers = self.subscribers.lock().expect("subscribers lock");
            collect_topic_nodes(&subscribers, |s: &SubscriberIdentifier| s.node().name().clone())
        };
        let services = {
            let services = self.services.lock().expect("services lock");
            let mut entries: Vec<(GraphName, Uri)> = services
                .iter()
                .map(|(name, id)| (name.clone(), id.uri().clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };
        SystemState { publishers, subscribers, services }
    }

    /// Record or update the slave binding for a node. Re-binding with an
    /// identical identity is a no-op; the same name at a different address
    /// is a consistency violation.
    fn bind_slave(&self, node: &NodeIdentifier) -> Result<(), RegistryError> {
        let mut slaves = self.slaves.lock().expect("slaves lock");
        match slaves.get(node.name()) {
            Some(existing) if existing != node => Err(RegistryError::NodeConflict {
                name: node.name().clone(),
                existing: existing.uri().clone(),
                offered: node.uri().clone(),
            }),
            Some(_) => Ok(()),
            None => {
                slaves.insert(node.name().clone(), node.clone());
                Ok(())
            }
        }
    }

    /// Type tie-break rule:
    /// - a publisher-declared type always overwrites and is permanent;
    /// - a subscriber wildcard never overwrites anything;
    /// - a subscriber concrete type overwrites only while no publisher has
    ///   asserted, most recent winning.
    fn record_type(&self, topic: &GraphName, message_type: &str, from_publisher: bool) {
        let mut topic_types = self.topic_types.lock().expect("topic types lock");
        match topic_types.get_mut(topic) {
            Some(current) => {
                if from_publisher {
                    current.message_type = message_type.to_string();
                    current.publisher_asserted = true;
                } else if !current.publisher_asserted && message_type != WILDCARD_TYPE {
                    current.message_type = message_type.to_string();
                }
            }
            None => {
                if from_publisher || message_type != WILDCARD_TYPE {
                    topic_types.insert(
                        topic.clone(),
                        TopicType {
                            message_type: message_type.to_string(),
                            publisher_asserted: from_publisher,
                        },
                    );
                }
            }
        }
    }
}

fn collect_topic_nodes<T>(
    map: &HashMap<GraphName, HashSet<T>>,
    node_name: impl Fn(&T) -> GraphName,
) -> Vec<(GraphName, Vec<GraphName>)> {
    let mut entries: Vec<(GraphName, Vec<GraphName>)> = map
        .iter()
        .map(|(topic, set)| {
            let mut nodes: Vec<GraphName> = set.iter().map(&node_name).collect();
            nodes.sort();
            (topic.clone(), nodes)
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::TopicDefinition;

    fn name(s: &str) -> GraphName {
        GraphName::new(s).expect("valid name")
    }

    fn node(n: &str, port: u16) -> NodeIdentifier {
        NodeIdentifier::new(name(n), Uri::new(format!("http://host:{}", port)))
    }

    fn publisher(n: &str, port: u16, topic: &str, ty: &str) -> PublisherIdentifier {
        PublisherIdentifier::new(node(n, port), TopicDefinition::new(name(topic), ty, None))
    }

    fn subscriber(n: &str, port: u16, topic: &str, ty: &str) -> SubscriberIdentifier {
        SubscriberIdentifier::new(node(n, port), TopicDefinition::new(name(topic), ty, None))
    }

    #[test]
    fn register_publisher_returns_current_subscribers() {
        let registry = Registry::new();
        let sub = subscriber("/listener", 1, "/chatter", "std_msgs/String");
        registry.register_subscriber(sub.clone(), "std_msgs/String").unwrap();

        let subs = registry
            .register_publisher(publisher("/talker", 2, "/chatter", "std_msgs/String"), "std_msgs/String")
            .unwrap();
        assert_eq!(subs, vec![sub]);
    }

    #[test]
    fn register_subscriber_returns_bootstrap_publishers() {
        let registry = Registry::new();
        let publisher = publisher("/talker", 2, "/chatter", "std_msgs/String");
        registry.register_publisher(publisher.clone(), "std_msgs/String").unwrap();

        let publishers = registry
            .register_subscriber(subscriber("/listener", 1, "/chatter", "std_msgs/String"), "std_msgs/String")
            .unwrap();
        assert_eq!(publishers, vec![publisher]);
    }

    #[test]
    fn type_tie_break_publisher_wins_permanently() {
        let registry = Registry::new();
        let topic = name("/chatter");

        registry.register_subscriber(subscriber("/s1", 1, "/chatter", "typeX"), "typeX").unwrap();
        assert_eq!(registry.topic_type(&topic).as_deref(), Some("typeX"));

        registry.register_publisher(publisher("/p1", 2, "/chatter", "typeY"), "typeY").unwrap();
        assert_eq!(registry.topic_type(&topic).as_deref(), Some("typeY"));

        registry.register_subscriber(subscriber("/s2", 3, "/chatter", "typeZ"), "typeZ").unwrap();
        assert_eq!(registry.topic_type(&topic).as_deref(), Some("typeY"));
    }

    #[test]
    fn type_tie_break_wildcard_never_overwrites() {
        let registry = Registry::new();
        let topic = name("/chatter");

        registry.register_subscriber(subscriber("/s1", 1, "/chatter", "*"), "*").unwrap();
        assert_eq!(registry.topic_type(&topic), None);

        registry.register_subscriber(subscriber("/s2", 2, "/chatter", "typeA"), "typeA").unwrap();
        assert_eq!(registry.topic_type(&topic).as_deref(), Some("typeA"));

        registry.register_subscriber(subscriber("/s3", 3, "/chatter", "*"), "*").unwrap();
        assert_eq!(registry.topic_type(&topic).as_deref(), Some("typeA"));

        // Among subscriber declarations, most recent concrete type wins.
        registry.register_subscriber(subscriber("/s4", 4, "/chatter", "typeB"), "typeB").unwrap();
        assert_eq!(registry.topic_type(&topic).as_deref(), Some("typeB"));
    }

    #[test]
    fn unregister_publisher_is_idempotent() {
        let registry = Registry::new();
        let publisher = publisher("/talker", 2, "/chatter", "t");
        registry.register_publisher(publisher.clone(), "t").unwrap();

        assert!(registry.unregister_publisher(&publisher));
        assert!(!registry.unregister_publisher(&publisher));
    }

    #[test]
    fn service_last_registration_wins() {
        let registry = Registry::new();
        let service = name("/add_two_ints");
        let provider_a = ServiceIdentifier::new(service.clone(), Uri::new("http://a:1"));
        let provider_b = ServiceIdentifier::new(service.clone(), Uri::new("http://b:2"));

        registry.register_service(&node("/server_a", 1), provider_a.clone()).unwrap();
        registry.register_service(&node("/server_b", 2), provider_b.clone()).unwrap();
        assert_eq!(registry.lookup_service(&service), Some(provider_b));

        // Unregistering with the stale identity must not remove the current
        // provider.
        assert!(!registry.unregister_service(&provider_a));
        assert!(registry.lookup_service(&service).is_some());
    }

    #[test]
    fn unregister_service_exact_match_removes() {
        let registry = Registry::new();
        let provider = ServiceIdentifier::new(name("/srv"), Uri::new("http://a:1"));
        registry.register_service(&node("/server", 1), provider.clone()).unwrap();
        assert!(registry.unregister_service(&provider));
        assert_eq!(registry.lookup_service(&name("/srv")), None);
        assert!(!registry.unregister_service(&provider));
    }

    #[test]
    fn node_rebind_at_different_address_is_rejected() {
        let registry = Registry::new();
        registry.register_publisher(publisher("/talker", 2, "/chatter", "t"), "t").unwrap();

        let conflicting = publisher("/talker", 3, "/other", "t");
        let error = registry.register_publisher(conflicting, "t").unwrap_err();
        assert!(matches!(error, RegistryError::NodeConflict { .. }));

        // The rejected registration must leave no trace.
        assert!(registry.publishers_of(&name("/other")).is_empty());
    }

    #[test]
    fn node_rebind_with_same_identity_is_fine() {
        let registry = Registry::new();
        registry.register_publisher(publisher("/talker", 2, "/chatter", "t"), "t").unwrap();
        registry.register_publisher(publisher("/talker", 2, "/other", "t"), "t").unwrap();
        assert_eq!(registry.slaves().len(), 1);
    }

    #[test]
    fn lookup_node_finds_registered_slaves() {
        let registry = Registry::new();
        registry.register_publisher(publisher("/talker", 2, "/chatter", "t"), "t").unwrap();
        let found = registry.lookup_node(&name("/talker")).expect("slave bound");
        assert_eq!(found.uri().as_str(), "http://host:2");
        assert_eq!(registry.lookup_node(&name("/ghost")), None);

        // Service-only nodes are bound too.
        registry
            .register_service(
                &node("/calc", 3),
                ServiceIdentifier::new(name("/srv"), Uri::new("http://host:3")),
            )
            .unwrap();
        assert!(registry.lookup_node(&name("/calc")).is_some());
    }

    #[test]
    fn system_state_lists_all_collections() {
        let registry = Registry::new();
        registry.register_publisher(publisher("/talker", 1, "/chatter", "t"), "t").unwrap();
        registry.register_subscriber(subscriber("/listener", 2, "/chatter", "t"), "t").unwrap();
        registry
            .register_service(
                &node("/calc", 3),
                ServiceIdentifier::new(name("/srv"), Uri::new("http://a:1")),
            )
            .unwrap();

        let state = registry.system_state();
        assert_eq!(state.publishers, vec![(name("/chatter"), vec![name("/talker")])]);
        assert_eq!(state.subscribers, vec![(name("/chatter"), vec![name("/listener")])]);
        assert_eq!(state.services.len(), 1);
    }

    #[test]
    fn crashed_node_entries_persist() {
        // No TTL: the only way out of the directory is unregistration.
        let registry = Registry::new();
        let publisher = publisher("/talker", 2, "/chatter", "t");
        registry.register_publisher(publisher.clone(), "t").unwrap();
        assert_eq!(registry.publishers_of(&name("/chatter")).len(), 1);
        assert!(registry.unregister_publisher(&publisher));
        assert!(registry.publishers_of(&name("/chatter")).is_empty());
    }
}
