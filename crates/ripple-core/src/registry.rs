//! Connection registry for Ripple.
//!
//! The registry is the single owner of the connection-to-identity mapping.
//! Entries are created at transport connect and destroyed at disconnect;
//! nothing here is ever persisted.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::membership::UserId;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        // Combine timestamp with atomic counter for guaranteed uniqueness
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{timestamp:x}_{counter:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The identity a connection speaks as, resolved at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user identifier.
    pub user_id: UserId,
    /// Display name at connect time.
    pub username: String,
    /// Optional avatar reference carried through to persisted messages.
    pub avatar_url: Option<String>,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            avatar_url: None,
        }
    }

    /// Attach an avatar reference.
    #[must_use]
    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// Map from live connections to the identities they speak as.
///
/// Backed by a sharded map: entries for unrelated connections never
/// contend with each other.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, Identity>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the identity for a connection.
    ///
    /// Idempotent per connection; the last write wins.
    pub fn register(&self, connection_id: ConnectionId, identity: Identity) {
        debug!(connection = %connection_id, user = %identity.user_id, "Registered connection");
        self.entries.insert(connection_id, identity);
    }

    /// Look up the identity for a connection.
    #[must_use]
    pub fn lookup(&self, connection_id: &ConnectionId) -> Option<Identity> {
        self.entries.get(connection_id).map(|e| e.value().clone())
    }

    /// Check whether a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.entries.contains_key(connection_id)
    }

    /// Remove a connection, returning the identity it spoke as.
    ///
    /// Cascading subscription cleanup is the router's job; callers run it
    /// after this returns.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Identity> {
        let removed = self.entries.remove(connection_id).map(|(_, id)| id);
        if removed.is_some() {
            debug!(connection = %connection_id, "Unregistered connection");
        }
        removed
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
