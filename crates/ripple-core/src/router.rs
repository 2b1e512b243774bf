//! Room router for Ripple.
//!
//! The router owns per-channel subscriber state and performs membership
//! checks, history replay, fan-out broadcast, and the persisted write
//! path. Channels live in a sharded map so operations on unrelated
//! channels never block each other; the publish path for one channel is
//! serialized so broadcast order always matches append order.

use dashmap::{DashMap, DashSet};
use ripple_protocol::{ChatMessage, ContentKind, ServerEvent};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

use crate::channel::{validate_channel_name, Channel, ChannelId, Outbound};
use crate::membership::MembershipResolver;
use crate::registry::{ConnectionId, ConnectionRegistry, Identity};
use crate::store::{MessageStore, NewMessage, StoreError};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The connection's user is not a member of the channel.
    #[error("Not authorized for channel: {0}")]
    NotAuthorized(String),

    /// The channel does not exist.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// The operation referenced an unregistered connection.
    #[error("Unknown connection: {0}")]
    ConnectionUnknown(String),

    /// Maximum subscriptions per connection reached.
    #[error("Maximum subscriptions reached")]
    SubscriptionLimit,

    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The message log rejected an append; nothing was broadcast.
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl RouterError {
    /// Wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RouterError::NotAuthorized(_) => 1001,
            RouterError::ChannelNotFound(_) => 1002,
            RouterError::ConnectionUnknown(_) => 1003,
            RouterError::SubscriptionLimit => 1004,
            RouterError::InvalidChannel(_) => 1005,
            RouterError::Persistence(_) => 1500,
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Default number of history entries replayed on join.
    pub history_limit: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Per-channel fan-out capacity.
    pub channel_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            max_subscriptions_per_connection: 100,
            channel_capacity: 1024,
        }
    }
}

/// The result of a successful subscribe.
pub struct Subscription {
    /// Receiver for this channel's fan-out.
    pub receiver: broadcast::Receiver<Outbound>,
    /// Most recent persisted messages, oldest-first; delivered to the
    /// joining connection only.
    pub history: Vec<ChatMessage>,
    /// Whether the connection was newly added to the subscriber set.
    /// False on a double join, in which case no presence event was sent.
    pub newly_joined: bool,
}

/// Per-channel state.
struct ChannelEntry {
    channel: Channel,
    /// Serializes append+broadcast so delivery order matches append
    /// order; joins hold it across prefetch+subscribe so no append can
    /// slip between a joiner's history snapshot and its receiver.
    publish_lock: Arc<Mutex<()>>,
}

impl ChannelEntry {
    fn new(name: impl Into<ChannelId>, capacity: usize) -> Self {
        Self {
            channel: Channel::with_capacity(name, capacity),
            publish_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// The room router.
pub struct RoomRouter {
    /// Channels indexed by name.
    channels: DashMap<ChannelId, ChannelEntry>,
    /// Connection subscriptions (connection -> set of channel names).
    subscriptions: DashMap<ConnectionId, DashSet<ChannelId>>,
    registry: Arc<ConnectionRegistry>,
    membership: Arc<dyn MembershipResolver>,
    store: Arc<dyn MessageStore>,
    config: RouterConfig,
}

impl RoomRouter {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        membership: Arc<dyn MembershipResolver>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self::with_config(registry, membership, store, RouterConfig::default())
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(
        registry: Arc<ConnectionRegistry>,
        membership: Arc<dyn MembershipResolver>,
        store: Arc<dyn MessageStore>,
        config: RouterConfig,
    ) -> Self {
        info!("Creating room router with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            registry,
            membership,
            store,
            config,
        }
    }

    /// The connection registry this router resolves identities against.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            channel_count: self.channels.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// The connection's user must pass the membership check. On success
    /// the subscriber set gains the connection (idempotently), the most
    /// recent persisted messages are returned for the joining connection
    /// alone, and the *other* subscribers receive `user-joined`.
    ///
    /// # Errors
    ///
    /// Fails with no state change if the connection is unregistered, the
    /// channel does not exist, the user is not a member, or limits are
    /// exceeded.
    pub async fn subscribe(
        &self,
        channel_id: &str,
        connection_id: &ConnectionId,
        history_limit: Option<usize>,
    ) -> Result<Subscription, RouterError> {
        validate_channel_name(channel_id).map_err(RouterError::InvalidChannel)?;

        let identity = self.identity_of(connection_id)?;

        if !self.membership.channel_exists(channel_id).await {
            return Err(RouterError::ChannelNotFound(channel_id.to_string()));
        }
        if !self.membership.is_member(channel_id, &identity.user_id).await {
            warn!(
                channel = %channel_id,
                connection = %connection_id,
                user = %identity.user_id,
                "Membership check failed"
            );
            return Err(RouterError::NotAuthorized(channel_id.to_string()));
        }

        let (sub_count, already_subscribed) = self
            .subscriptions
            .get(connection_id)
            .map(|s| (s.len(), s.contains(channel_id)))
            .unwrap_or((0, false));
        if sub_count >= self.config.max_subscriptions_per_connection && !already_subscribed {
            return Err(RouterError::SubscriptionLimit);
        }

        // History prefetch and receiver creation run under the channel's
        // publish lock: no append can land in between, so every message
        // reaches the joiner through exactly one of history or the
        // receiver.
        let limit = history_limit.unwrap_or(self.config.history_limit);
        let publish_lock = {
            let entry = self
                .channels
                .entry(channel_id.to_string())
                .or_insert_with(|| {
                    debug!(channel = %channel_id, "Creating channel entry");
                    ChannelEntry::new(channel_id, self.config.channel_capacity)
                });
            Arc::clone(&entry.publish_lock)
        };
        let order = publish_lock.lock().await;

        let history = match self.store.recent(channel_id, limit).await {
            Ok(history) => history,
            Err(e) => {
                drop(order);
                // A failed join leaves no state behind, including an
                // entry this call just created.
                self.channels
                    .remove_if(channel_id, |_, entry| entry.channel.is_empty());
                return Err(e.into());
            }
        };

        let (receiver, newly_joined) = {
            let mut entry = self
                .channels
                .entry(channel_id.to_string())
                .or_insert_with(|| ChannelEntry::new(channel_id, self.config.channel_capacity));
            entry.channel.subscribe(connection_id.clone())
        };
        drop(order);

        self.subscriptions
            .entry(connection_id.clone())
            .or_default()
            .insert(channel_id.to_string());

        if newly_joined {
            self.broadcast(
                channel_id,
                Outbound::excluding(
                    ServerEvent::user_joined(&identity.username, channel_id),
                    connection_id.clone(),
                ),
            );
        }

        debug!(
            channel = %channel_id,
            connection = %connection_id,
            history = history.len(),
            newly_joined,
            "Subscribed"
        );

        Ok(Subscription {
            receiver,
            history,
            newly_joined,
        })
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// A no-op if the connection was not subscribed: no error, no event.
    /// Otherwise the remaining subscribers receive `user-left`. Returns
    /// whether the connection was actually removed.
    pub fn unsubscribe(&self, channel_id: &str, connection_id: &ConnectionId) -> bool {
        if let Some(conn_subs) = self.subscriptions.get(connection_id) {
            conn_subs.remove(channel_id);
        }

        let removed = self.remove_subscriber(channel_id, connection_id);
        if removed {
            if let Some(identity) = self.registry.lookup(connection_id) {
                self.broadcast(
                    channel_id,
                    Outbound::excluding(
                        ServerEvent::user_left(&identity.username, channel_id),
                        connection_id.clone(),
                    ),
                );
            }
            debug!(channel = %channel_id, connection = %connection_id, "Unsubscribed");
        }
        removed
    }

    /// Tear down a connection: unregister it and drop it from every
    /// channel it was subscribed to, broadcasting exactly one
    /// `user-disconnected` per affected channel to the remaining
    /// subscribers. Idempotent; safe to call for a connection that was
    /// never registered.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<Identity> {
        let identity = self.registry.unregister(connection_id);

        if let Some((_, channels)) = self.subscriptions.remove(connection_id) {
            for channel_id in channels.iter() {
                let removed = self.remove_subscriber(channel_id.as_str(), connection_id);
                if removed {
                    if let Some(identity) = &identity {
                        self.broadcast(
                            channel_id.as_str(),
                            Outbound::excluding(
                                ServerEvent::user_disconnected(&identity.username),
                                connection_id.clone(),
                            ),
                        );
                    }
                }
            }
        }

        debug!(connection = %connection_id, "Disconnected");
        identity
    }

    /// The write path for chat messages.
    ///
    /// Resolves the publishing identity, appends through the message
    /// store, and only then broadcasts the persisted form (assigned id,
    /// seq, timestamp) to all subscribers including the sender. Appends
    /// for one channel are serialized so broadcast order equals append
    /// order; other channels are unaffected.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionUnknown`, `NotAuthorized` (not subscribed),
    /// or `Persistence`; on failure nothing is broadcast.
    pub async fn publish(
        &self,
        channel_id: &str,
        connection_id: &ConnectionId,
        content: String,
        kind: ContentKind,
    ) -> Result<ChatMessage, RouterError> {
        let identity = self.identity_of(connection_id)?;

        let subscribed = self
            .subscriptions
            .get(connection_id)
            .map(|s| s.contains(channel_id))
            .unwrap_or(false);
        if !subscribed {
            return Err(RouterError::NotAuthorized(channel_id.to_string()));
        }

        let publish_lock = self
            .channels
            .get(channel_id)
            .map(|e| Arc::clone(&e.publish_lock))
            .ok_or_else(|| RouterError::ChannelNotFound(channel_id.to_string()))?;

        // Held across append+broadcast; scoped to this channel only.
        let _order = publish_lock.lock().await;

        let persisted = self
            .store
            .append(NewMessage {
                channel_id: channel_id.to_string(),
                user_id: identity.user_id,
                username: identity.username,
                content,
                kind,
                author_avatar_url: identity.avatar_url,
            })
            .await?;

        let recipients = self.broadcast(
            channel_id,
            Outbound::to_all(ServerEvent::new_message(persisted.clone())),
        );
        trace!(
            channel = %channel_id,
            id = persisted.id,
            seq = persisted.seq,
            recipients,
            "Published message"
        );

        Ok(persisted)
    }

    /// Fan an event out to a channel's current subscribers.
    ///
    /// Best-effort: returns the number of live receivers, zero if the
    /// channel has none.
    pub fn broadcast(&self, channel_id: &str, outbound: Outbound) -> usize {
        self.channels
            .get(channel_id)
            .map(|e| e.channel.broadcast(outbound))
            .unwrap_or(0)
    }

    /// Check if a channel currently has live state.
    #[must_use]
    pub fn channel_exists(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.channels
            .get(channel_id)
            .map(|e| e.channel.subscriber_count())
            .unwrap_or(0)
    }

    /// Get the channels a connection is subscribed to.
    #[must_use]
    pub fn connection_channels(&self, connection_id: &ConnectionId) -> Vec<String> {
        self.subscriptions
            .get(connection_id)
            .map(|s| s.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }

    fn identity_of(&self, connection_id: &ConnectionId) -> Result<Identity, RouterError> {
        self.registry
            .lookup(connection_id)
            .ok_or_else(|| RouterError::ConnectionUnknown(connection_id.to_string()))
    }

    /// Drop a connection from a channel's subscriber set, deleting the
    /// channel entry once empty. Returns whether anything was removed.
    fn remove_subscriber(&self, channel_id: &str, connection_id: &ConnectionId) -> bool {
        let mut removed = false;
        let mut now_empty = false;
        if let Some(mut entry) = self.channels.get_mut(channel_id) {
            removed = entry.channel.unsubscribe(connection_id);
            now_empty = entry.channel.is_empty();
        }
        if now_empty {
            self.channels
                .remove_if(channel_id, |_, entry| entry.channel.is_empty());
            debug!(channel = %channel_id, "Deleted empty channel");
        }
        removed
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of channels with live subscribers.
    pub channel_count: usize,
    /// Number of connections with at least one subscription record.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StaticMembership;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::Semaphore;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        router: RoomRouter,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(StaticMembership::new());
        membership.insert_channel("general", ["u1".to_string(), "u2".to_string()]);
        membership.insert_channel("random", ["u1".to_string(), "u2".to_string()]);
        let router = RoomRouter::new(
            Arc::clone(&registry),
            membership as Arc<dyn MembershipResolver>,
            Arc::new(MemoryStore::new()),
        );
        Fixture { registry, router }
    }

    fn connect(f: &Fixture, conn: &str, user: &str, name: &str) -> ConnectionId {
        let id = ConnectionId::new(conn);
        f.registry.register(id.clone(), Identity::new(user, name));
        id
    }

    fn next_event(rx: &mut broadcast::Receiver<Outbound>, me: &ConnectionId) -> Option<ServerEvent> {
        loop {
            match rx.try_recv() {
                Ok(outbound) if outbound.is_for(me) => {
                    return Some(outbound.event.as_ref().clone())
                }
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return None,
                Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_non_member_subscribe_rejected() {
        let f = fixture();
        let outsider = connect(&f, "conn-1", "u99", "mallory");

        let err = f.router.subscribe("general", &outsider, None).await;
        assert!(matches!(err, Err(RouterError::NotAuthorized(_))));
        assert_eq!(f.router.subscriber_count("general"), 0);
        assert!(f.router.connection_channels(&outsider).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_channel_rejected() {
        let f = fixture();
        let conn = connect(&f, "conn-1", "u1", "alice");

        let err = f.router.subscribe("no-such", &conn, None).await;
        assert!(matches!(err, Err(RouterError::ChannelNotFound(_))));
    }

    #[tokio::test]
    async fn test_unregistered_connection_rejected() {
        let f = fixture();
        let ghost = ConnectionId::new("conn-ghost");

        let err = f.router.subscribe("general", &ghost, None).await;
        assert!(matches!(err, Err(RouterError::ConnectionUnknown(_))));
    }

    #[tokio::test]
    async fn test_join_history_and_presence() {
        let f = fixture();
        let a = connect(&f, "conn-a", "u1", "alice");
        let b = connect(&f, "conn-b", "u2", "bob");

        // A joins an empty channel: empty history.
        let sub_a = f.router.subscribe("general", &a, None).await.unwrap();
        assert!(sub_a.history.is_empty());
        let mut rx_a = sub_a.receiver;

        // A publishes; B joins afterwards and sees it in history.
        f.router
            .publish("general", &a, "hi".into(), ContentKind::Text)
            .await
            .unwrap();

        let sub_b = f.router.subscribe("general", &b, None).await.unwrap();
        assert_eq!(sub_b.history.len(), 1);
        assert_eq!(sub_b.history[0].content, "hi");
        assert_eq!(sub_b.history[0].username, "alice");

        // A saw its own message, then exactly one user-joined for B.
        match next_event(&mut rx_a, &a) {
            Some(ServerEvent::NewMessage(message)) => assert_eq!(message.content, "hi"),
            other => panic!("expected new-message, got {:?}", other),
        }
        match next_event(&mut rx_a, &a) {
            Some(ServerEvent::UserJoined { username, channel_id }) => {
                assert_eq!(username, "bob");
                assert_eq!(channel_id, "general");
            }
            other => panic!("expected user-joined, got {:?}", other),
        }
        assert!(next_event(&mut rx_a, &a).is_none());
    }

    #[tokio::test]
    async fn test_double_join_is_idempotent() {
        let f = fixture();
        let a = connect(&f, "conn-a", "u1", "alice");
        let b = connect(&f, "conn-b", "u2", "bob");

        let sub1 = f.router.subscribe("general", &a, None).await.unwrap();
        let mut rx_b = f.router.subscribe("general", &b, None).await.unwrap().receiver;
        let sub2 = f.router.subscribe("general", &a, None).await.unwrap();

        assert!(sub1.newly_joined);
        assert!(!sub2.newly_joined);
        assert_eq!(f.router.subscriber_count("general"), 2);

        // No second user-joined for A's re-join.
        assert!(next_event(&mut rx_b, &b).is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let f = fixture();
        let a = connect(&f, "conn-a", "u1", "alice");
        let b = connect(&f, "conn-b", "u2", "bob");

        let _sub_a = f.router.subscribe("general", &a, None).await.unwrap();
        let mut rx_b = f.router.subscribe("general", &b, None).await.unwrap().receiver;
        // Drain B's view of A being present already (nothing: A joined first).
        assert!(next_event(&mut rx_b, &b).is_none());

        assert!(f.router.unsubscribe("general", &a));
        match next_event(&mut rx_b, &b) {
            Some(ServerEvent::UserLeft { username, .. }) => assert_eq!(username, "alice"),
            other => panic!("expected user-left, got {:?}", other),
        }

        // Second unsubscribe: no-op, no event.
        assert!(!f.router.unsubscribe("general", &a));
        assert!(next_event(&mut rx_b, &b).is_none());
    }

    #[tokio::test]
    async fn test_publish_order_matches_append_order() {
        let f = fixture();
        let a = connect(&f, "conn-a", "u1", "alice");
        let b = connect(&f, "conn-b", "u2", "bob");

        let _sub_a = f.router.subscribe("general", &a, None).await.unwrap();
        let mut rx_b = f.router.subscribe("general", &b, None).await.unwrap().receiver;

        for i in 0..3 {
            f.router
                .publish("general", &a, format!("m{}", i), ContentKind::Text)
                .await
                .unwrap();
        }

        let mut last_seq = None;
        for i in 0..3 {
            match next_event(&mut rx_b, &b) {
                Some(ServerEvent::NewMessage(message)) => {
                    assert_eq!(message.content, format!("m{}", i));
                    if let Some(prev) = last_seq {
                        assert!(message.seq > prev);
                    }
                    last_seq = Some(message.seq);
                }
                other => panic!("expected new-message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_requires_subscription() {
        let f = fixture();
        let a = connect(&f, "conn-a", "u1", "alice");
        let b = connect(&f, "conn-b", "u2", "bob");

        let _sub_a = f.router.subscribe("general", &a, None).await.unwrap();

        let err = f
            .router
            .publish("general", &b, "hi".into(), ContentKind::Text)
            .await;
        assert!(matches!(err, Err(RouterError::NotAuthorized(_))));
    }

    #[tokio::test]
    async fn test_disconnect_fans_out_once_per_channel() {
        let f = fixture();
        let a = connect(&f, "conn-a", "u1", "alice");
        let b = connect(&f, "conn-b", "u2", "bob");

        let _sub = f.router.subscribe("general", &a, None).await.unwrap();
        let _sub = f.router.subscribe("random", &a, None).await.unwrap();
        let mut rx_gen = f.router.subscribe("general", &b, None).await.unwrap().receiver;
        let mut rx_rand = f.router.subscribe("random", &b, None).await.unwrap().receiver;

        let identity = f.router.disconnect(&a).unwrap();
        assert_eq!(identity.username, "alice");
        assert!(f.registry.lookup(&a).is_none());

        for rx in [&mut rx_gen, &mut rx_rand] {
            match next_event(rx, &b) {
                Some(ServerEvent::UserDisconnected { username }) => assert_eq!(username, "alice"),
                other => panic!("expected user-disconnected, got {:?}", other),
            }
            assert!(next_event(rx, &b).is_none());
        }

        assert_eq!(f.router.subscriber_count("general"), 1);
        assert_eq!(f.router.subscriber_count("random"), 1);

        // Disconnect is idempotent.
        assert!(f.router.disconnect(&a).is_none());
    }

    #[tokio::test]
    async fn test_empty_channels_are_deleted() {
        let f = fixture();
        let a = connect(&f, "conn-a", "u1", "alice");

        let _sub = f.router.subscribe("general", &a, None).await.unwrap();
        assert!(f.router.channel_exists("general"));

        f.router.unsubscribe("general", &a);
        assert!(!f.router.channel_exists("general"));
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(&self, _message: NewMessage) -> Result<ChatMessage, StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }

        async fn recent(
            &self,
            _channel_id: &str,
            _limit: usize,
        ) -> Result<Vec<ChatMessage>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_append_broadcasts_nothing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(StaticMembership::new());
        membership.insert_channel("general", ["u1".to_string(), "u2".to_string()]);
        let router = RoomRouter::new(
            Arc::clone(&registry),
            membership as Arc<dyn MembershipResolver>,
            Arc::new(FailingStore),
        );

        let a = ConnectionId::new("conn-a");
        let b = ConnectionId::new("conn-b");
        registry.register(a.clone(), Identity::new("u1", "alice"));
        registry.register(b.clone(), Identity::new("u2", "bob"));

        let _sub_a = router.subscribe("general", &a, None).await.unwrap();
        let mut rx_b = router.subscribe("general", &b, None).await.unwrap().receiver;

        let err = router
            .publish("general", &a, "hi".into(), ContentKind::Text)
            .await;
        assert!(matches!(err, Err(RouterError::Persistence(_))));
        assert!(next_event(&mut rx_b, &b).is_none());
    }

    /// Store whose next `recent` call snapshots the log, then parks until
    /// released. Lets a test hold a join open while a publish races it.
    struct GatedStore {
        inner: MemoryStore,
        hold_next: AtomicBool,
        gate: Semaphore,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                hold_next: AtomicBool::new(false),
                gate: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageStore for GatedStore {
        async fn append(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
            self.inner.append(message).await
        }

        async fn recent(
            &self,
            channel_id: &str,
            limit: usize,
        ) -> Result<Vec<ChatMessage>, StoreError> {
            let snapshot = self.inner.recent(channel_id, limit).await;
            if self.hold_next.swap(false, Ordering::SeqCst) {
                let _permit = self.gate.acquire().await;
            }
            snapshot
        }
    }

    #[tokio::test]
    async fn test_publish_waits_for_in_flight_join() {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(StaticMembership::new());
        membership.insert_channel("general", ["u1".to_string(), "u2".to_string()]);
        let store = Arc::new(GatedStore::new());
        let router = Arc::new(RoomRouter::new(
            Arc::clone(&registry),
            membership as Arc<dyn MembershipResolver>,
            Arc::clone(&store) as Arc<dyn MessageStore>,
        ));

        let a = ConnectionId::new("conn-a");
        let b = ConnectionId::new("conn-b");
        registry.register(a.clone(), Identity::new("u1", "alice"));
        registry.register(b.clone(), Identity::new("u2", "bob"));

        let _sub_a = router.subscribe("general", &a, None).await.unwrap();

        // B's join snapshots empty history, then parks inside the store.
        store.hold_next.store(true, Ordering::SeqCst);
        let join = tokio::spawn({
            let router = Arc::clone(&router);
            let b = b.clone();
            async move { router.subscribe("general", &b, None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A's publish must queue behind the held join instead of landing
        // between B's history snapshot and B's receiver.
        let publish = tokio::spawn({
            let router = Arc::clone(&router);
            let a = a.clone();
            async move {
                router
                    .publish("general", &a, "hi".into(), ContentKind::Text)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publish.is_finished());

        store.gate.add_permits(1);
        let sub_b = join.await.unwrap().unwrap();
        publish.await.unwrap().unwrap();

        // The message reached B exactly once, through the live receiver.
        assert!(sub_b.history.is_empty());
        let mut rx_b = sub_b.receiver;
        match next_event(&mut rx_b, &b) {
            Some(ServerEvent::NewMessage(message)) => assert_eq!(message.content, "hi"),
            other => panic!("expected new-message, got {:?}", other),
        }
        assert!(next_event(&mut rx_b, &b).is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let f = fixture();
        let a = connect(&f, "conn-a", "u1", "alice");
        let b = connect(&f, "conn-b", "u2", "bob");

        let _s1 = f.router.subscribe("general", &a, None).await.unwrap();
        let _s2 = f.router.subscribe("random", &a, None).await.unwrap();
        let _s3 = f.router.subscribe("general", &b, None).await.unwrap();

        let stats = f.router.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
    }
}
