//! Channel membership resolution.
//!
//! Rosters are owned by the external group/channel subsystem; this crate
//! only consumes them, as a point-in-time snapshot fetched per operation.
//! The snapshot may change between calls and must never be cached.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;

/// A stable user identifier.
pub type UserId = String;

/// Read-only view of channel rosters.
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    /// Check whether a channel exists at all.
    async fn channel_exists(&self, channel_id: &str) -> bool;

    /// Fetch the current set of member user ids for a channel.
    ///
    /// Returns an empty set for unknown channels.
    async fn resolve_members(&self, channel_id: &str) -> HashSet<UserId>;

    /// Check whether a user is currently a member of a channel.
    async fn is_member(&self, channel_id: &str, user_id: &str) -> bool {
        self.resolve_members(channel_id).await.contains(user_id)
    }
}

/// In-memory roster, loadable from server configuration.
///
/// Channels and members are fixed from the router's point of view; the
/// owning subsystem mutates them through `insert_channel`/`add_member`.
#[derive(Debug, Default)]
pub struct StaticMembership {
    channels: DashMap<String, HashSet<UserId>>,
}

impl StaticMembership {
    /// Create an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a channel and its member set.
    pub fn insert_channel(
        &self,
        channel_id: impl Into<String>,
        members: impl IntoIterator<Item = UserId>,
    ) {
        self.channels
            .insert(channel_id.into(), members.into_iter().collect());
    }

    /// Add a member to an existing channel, creating it if needed.
    pub fn add_member(&self, channel_id: &str, user_id: impl Into<UserId>) {
        self.channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(user_id.into());
    }
}

#[async_trait]
impl MembershipResolver for StaticMembership {
    async fn channel_exists(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    async fn resolve_members(&self, channel_id: &str) -> HashSet<UserId> {
        self.channels
            .get(channel_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

/// Resolver for open deployments: every channel exists and every user is
/// a member. Membership enforcement effectively disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenMembership;

#[async_trait]
impl MembershipResolver for OpenMembership {
    async fn channel_exists(&self, _channel_id: &str) -> bool {
        true
    }

    async fn resolve_members(&self, _channel_id: &str) -> HashSet<UserId> {
        HashSet::new()
    }

    async fn is_member(&self, _channel_id: &str, _user_id: &str) -> bool {
        true
    }
}
