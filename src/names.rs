//! # Graph Names
//!
//! Hierarchical, slash-separated resource names used to identify nodes,
//! topics, and services in the graph:
//!
//! - **Global**: `/foo/bar` — fully resolved, unambiguous anywhere.
//! - **Relative**: `foo/bar` — resolved against a namespace.
//! - **Private**: `~foo` — resolved against the owning node's name.
//!
//! Directory state only ever holds global names. [`NameResolver`] converts
//! relative and private names into global form before anything crosses a
//! module boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The root namespace.
pub const ROOT: &str = "/";

/// Wildcard message type: matches any publisher-declared type during
/// registration, but never satisfies a connection handshake.
pub const WILDCARD_TYPE: &str = "*";

/// Error type for graph name validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name contains a character outside `[a-zA-Z0-9_/~]`.
    InvalidCharacter { name: String, position: usize },
    /// The first character after any `/` or `~` prefix is not a letter.
    InvalidStart { name: String },
    /// `~` may only appear as the first character.
    MisplacedTilde { name: String },
    /// Empty path segment (`//` or trailing `/` on a non-root name).
    EmptySegment { name: String },
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameError::InvalidCharacter { name, position } => {
                write!(f, "invalid character at position {} in name {:?}", position, name)
            }
            NameError::InvalidStart { name } => {
                write!(f, "name {:?} must start with a letter", name)
            }
            NameError::MisplacedTilde { name } => {
                write!(f, "'~' is only valid as the first character of {:?}", name)
            }
            NameError::EmptySegment { name } => {
                write!(f, "name {:?} contains an empty path segment", name)
            }
        }
    }
}

impl std::error::Error for NameError {}

/// A validated graph name.
///
/// Immutable after construction. Comparison and hashing are on the canonical
/// string form, so `GraphName` can be used directly as a map key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct GraphName(String);

impl GraphName {
    /// Parse and validate a graph name.
    pub fn new(name: &str) -> Result<Self, NameError> {
        validate(name)?;
        Ok(GraphName(name.to_string()))
    }

    /// The empty name. Valid, but resolves to nothing on its own.
    pub fn empty() -> Self {
        GraphName(String::new())
    }

    /// The root namespace `/`.
    pub fn root() -> Self {
        GraphName(ROOT.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    /// A `/global/name`.
    pub fn is_global(&self) -> bool {
        self.is_root() || self.0.starts_with('/')
    }

    /// A `~private/name`.
    pub fn is_private(&self) -> bool {
        self.0.starts_with('~')
    }

    /// A `relative/name` (neither global nor private).
    pub fn is_relative(&self) -> bool {
        !self.is_private() && !self.is_global()
    }

    /// The parent namespace, or the empty name if there is none.
    ///
    /// `/foo/bar` → `/foo`, `/foo` → `/`, `foo/bar` → `foo`.
    pub fn parent(&self) -> GraphName {
        if self.0.is_empty() || self.is_root() {
            return GraphName::empty();
        }
        match self.0.rfind('/') {
            Some(0) => GraphName::root(),
            Some(i) => GraphName(self.0[..i].to_string()),
            None => GraphName::empty(),
        }
    }

    /// The final path segment, without any namespace prefix.
    pub fn basename(&self) -> GraphName {
        if self.0.is_empty() || self.is_root() {
            return GraphName::empty();
        }
        match self.0.rfind('/') {
            Some(i) => GraphName(self.0[i + 1..].to_string()),
            None => GraphName(self.0.trim_start_matches('~').to_string()),
        }
    }

    /// Strip any global or private prefix, yielding a relative name.
    pub fn to_relative(&self) -> GraphName {
        GraphName(self.0.trim_start_matches(|c| c == '/' || c == '~').to_string())
    }

    /// Add the global `/` prefix if missing. Does not consult any namespace;
    /// use [`NameResolver::resolve`] for namespace-aware resolution.
    pub fn to_global(&self) -> GraphName {
        if self.is_global() {
            self.clone()
        } else {
            GraphName(format!("/{}", self.0.trim_start_matches('~')))
        }
    }

    /// Join another name onto this one. If `other` is global, the result is
    /// `other` unchanged.
    pub fn join(&self, other: &GraphName) -> GraphName {
        if other.is_global() || self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        if self.is_root() {
            return GraphName(format!("/{}", other.0));
        }
        GraphName(format!("{}/{}", self.0, other.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Deserialization funnels through the same validation as [`GraphName::new`],
/// so a name arriving off the wire is as trustworthy as one built locally.
impl TryFrom<String> for GraphName {
    type Error = NameError;

    fn try_from(name: String) -> Result<Self, NameError> {
        validate(&name)?;
        Ok(GraphName(name))
    }
}

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GraphName({})", self.0)
    }
}

fn validate(name: &str) -> Result<(), NameError> {
    if name.is_empty() || name == ROOT {
        return Ok(());
    }
    let bytes = name.as_bytes();
    let mut rest = name;
    if bytes[0] == b'/' || bytes[0] == b'~' {
        rest = &name[1..];
    }
    if rest.is_empty() {
        // Lone "~" has no segment to name.
        return Err(NameError::InvalidStart { name: name.to_string() });
    }
    for (i, c) in name.char_indices() {
        let valid = c.is_ascii_alphanumeric() || c == '_' || c == '/' || (c == '~' && i == 0);
        if c == '~' && i != 0 {
            return Err(NameError::MisplacedTilde { name: name.to_string() });
        }
        if !valid {
            return Err(NameError::InvalidCharacter { name: name.to_string(), position: i });
        }
    }
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(NameError::EmptySegment { name: name.to_string() });
        }
        let first = segment.chars().next().unwrap();
        if !first.is_ascii_alphabetic() {
            return Err(NameError::InvalidStart { name: name.to_string() });
        }
    }
    Ok(())
}

/// Resolves relative and private names to global form.
///
/// A resolver is bound to a namespace (for relative names) and a node name
/// (for private names). Both must themselves be global.
#[derive(Clone, Debug)]
pub struct NameResolver {
    namespace: GraphName,
    node_name: GraphName,
}

impl NameResolver {
    /// Create a resolver. `namespace` and `node_name` must be global.
    pub fn new(namespace: GraphName, node_name: GraphName) -> Result<Self, NameError> {
        debug_assert!(namespace.is_global() && node_name.is_global());
        Ok(NameResolver { namespace, node_name })
    }

    /// Resolver rooted at `/` for a node directly under the root namespace.
    pub fn from_node_name(node_name: GraphName) -> Self {
        NameResolver { namespace: GraphName::root(), node_name }
    }

    pub fn namespace(&self) -> &GraphName {
        &self.namespace
    }

    pub fn node_name(&self) -> &GraphName {
        &self.node_name
    }

    /// Resolve a name to global form:
    /// global names pass through, private names resolve against the node
    /// name, relative names resolve against the namespace.
    pub fn resolve(&self, name: &GraphName) -> GraphName {
        if name.is_global() {
            name.clone()
        } else if name.is_private() {
            self.node_name.join(&name.to_relative())
        } else {
            self.namespace.join(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> GraphName {
        GraphName::new(s).expect("valid name")
    }

    #[test]
    fn classification() {
        assert!(name("/foo/bar").is_global());
        assert!(name("foo/bar").is_relative());
        assert!(name("~foo").is_private());
        assert!(GraphName::root().is_root());
        assert!(GraphName::root().is_global());
        assert!(GraphName::empty().is_empty());
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(GraphName::new("/foo bar").is_err());
        assert!(GraphName::new("/1foo").is_err());
        assert!(GraphName::new("foo//bar").is_err());
        assert!(GraphName::new("foo~bar").is_err());
        assert!(GraphName::new("/foo/").is_err());
        assert!(GraphName::new("~").is_err());
    }

    #[test]
    fn try_from_validates_like_new() {
        assert_eq!(GraphName::try_from("/foo/bar".to_string()), Ok(name("/foo/bar")));
        assert!(GraphName::try_from("not a name".to_string()).is_err());
    }

    #[test]
    fn parent_and_basename() {
        assert_eq!(name("/foo/bar").parent(), name("/foo"));
        assert_eq!(name("/foo").parent(), GraphName::root());
        assert_eq!(name("foo/bar").parent(), name("foo"));
        assert_eq!(name("foo").parent(), GraphName::empty());
        assert_eq!(name("/foo/bar").basename(), name("bar"));
        assert_eq!(name("~foo").basename(), name("foo"));
        assert_eq!(GraphName::root().parent(), GraphName::empty());
    }

    #[test]
    fn global_and_relative_conversion() {
        assert_eq!(name("foo/bar").to_global(), name("/foo/bar"));
        assert_eq!(name("/foo/bar").to_global(), name("/foo/bar"));
        assert_eq!(name("~foo").to_global(), name("/foo"));
        assert_eq!(name("/foo/bar").to_relative(), name("foo/bar"));
    }

    #[test]
    fn join() {
        assert_eq!(name("/wg").join(&name("turtle")), name("/wg/turtle"));
        assert_eq!(GraphName::root().join(&name("turtle")), name("/turtle"));
        // Joining a global name returns it unchanged.
        assert_eq!(name("/wg").join(&name("/other")), name("/other"));
        assert_eq!(name("/wg").join(&GraphName::empty()), name("/wg"));
    }

    #[test]
    fn resolver_resolves_all_three_forms() {
        let resolver =
            NameResolver::new(name("/wg"), name("/wg/node1")).expect("resolver");
        assert_eq!(resolver.resolve(&name("/foo")), name("/foo"));
        assert_eq!(resolver.resolve(&name("foo/bar")), name("/wg/foo/bar"));
        assert_eq!(resolver.resolve(&name("~cmd")), name("/wg/node1/cmd"));
    }

    #[test]
    fn resolver_from_node_name_uses_root_namespace() {
        let resolver = NameResolver::from_node_name(name("/node1"));
        assert_eq!(resolver.resolve(&name("chatter")), name("/chatter"));
        assert_eq!(resolver.resolve(&name("~status")), name("/node1/status"));
    }
}
