//! Per-user namespaces and namespace-bound handles
//!
//! A user's namespace string is the user name with the separator and the
//! escape character escaped, so it can always be split back into the
//! original name and two distinct users never share a namespace.

use std::fmt;
use std::sync::Arc;

use super::backend::RadosBackend;
use super::op::ObjectRef;

/// Reserved separator between namespace-deriving components
pub const NAMESPACE_SEPARATOR: char = '/';
const ESCAPE: char = '\\';
const ESCAPED_SEPARATOR: &str = "\\-";
const ESCAPED_ESCAPE: &str = "\\\\";

/// Escape a user name for use as a namespace string
pub fn escape_username(username: &str) -> String {
    let mut out = String::with_capacity(username.len());
    for c in username.chars() {
        match c {
            NAMESPACE_SEPARATOR => out.push_str(ESCAPED_SEPARATOR),
            ESCAPE => out.push_str(ESCAPED_ESCAPE),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse [`escape_username`]. Returns `None` for strings that no user
/// name escapes to (bare separator, dangling or unknown escape).
pub fn unescape_username(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next()? {
                '-' => out.push(NAMESPACE_SEPARATOR),
                ESCAPE => out.push(ESCAPE),
                _ => return None,
            },
            NAMESPACE_SEPARATOR => return None,
            _ => out.push(c),
        }
    }
    Some(out)
}

/// Isolation scope inside a pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Namespace(String);

impl Namespace {
    /// The pool's default namespace, visible to every user of the pool
    pub fn shared() -> Self {
        Self(String::new())
    }

    pub fn for_user(username: &str) -> Self {
        Self(escape_username(username))
    }

    /// Use `raw` verbatim; the caller vouches for its uniqueness
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_shared(&self) -> bool {
        self.0.is_empty()
    }

    /// The user this namespace was derived from
    pub fn username(&self) -> Option<String> {
        if self.is_shared() {
            return None;
        }
        unescape_username(&self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A session-scoped binding to one pool and one namespace
///
/// Only a connected [`ClusterSession`](super::ClusterSession) hands these
/// out. The handle is read-only configuration: clone it freely.
#[derive(Clone)]
pub struct NamespaceHandle {
    backend: Arc<dyn RadosBackend>,
    pool: String,
    namespace: Namespace,
}

impl NamespaceHandle {
    pub(crate) fn new(backend: Arc<dyn RadosBackend>, pool: String, namespace: Namespace) -> Self {
        Self {
            backend,
            pool,
            namespace,
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Same pool, different namespace
    pub fn with_namespace(&self, namespace: Namespace) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            pool: self.pool.clone(),
            namespace,
        }
    }

    /// Address of `oid` inside this pool and namespace
    pub fn object(&self, oid: &str) -> ObjectRef {
        ObjectRef::new(self.pool.as_str(), self.namespace.as_str(), oid)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn RadosBackend> {
        &self.backend
    }
}

impl fmt::Debug for NamespaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceHandle")
            .field("pool", &self.pool)
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_username_unchanged() {
        assert_eq!(escape_username("alice@example.com"), "alice@example.com");
    }

    #[test]
    fn test_separator_escaped_and_roundtrips() {
        let ns = Namespace::for_user("team/alice");
        assert_eq!(ns.as_str(), "team\\-alice");
        assert_eq!(ns.username().as_deref(), Some("team/alice"));
    }

    #[test]
    fn test_escape_collisions_are_impossible() {
        // Without escaping the backslash, "a\-b" and "a/b" would collide.
        let slash = Namespace::for_user("a/b");
        let literal = Namespace::for_user("a\\-b");
        assert_ne!(slash, literal);
        assert_eq!(slash.username().as_deref(), Some("a/b"));
        assert_eq!(literal.username().as_deref(), Some("a\\-b"));
    }

    #[test]
    fn test_unescape_rejects_invalid() {
        assert_eq!(unescape_username("a/b"), None);
        assert_eq!(unescape_username("a\\"), None);
        assert_eq!(unescape_username("a\\x"), None);
    }

    #[test]
    fn test_shared_namespace() {
        let ns = Namespace::shared();
        assert!(ns.is_shared());
        assert_eq!(ns.username(), None);
    }
}
