//! Transient presence signaling.
//!
//! Typing indicators are a stateless relay over the router's broadcast:
//! nothing is persisted, nothing is retried, and a missed event is not
//! recoverable. Join/leave/disconnect presence events are emitted by the
//! router itself as part of the state changes they describe.

use ripple_protocol::ServerEvent;
use std::sync::Arc;
use tracing::trace;

use crate::channel::Outbound;
use crate::registry::ConnectionId;
use crate::router::{RoomRouter, RouterError};

/// Relay for typing indicators, scoped to a channel's current
/// subscribers and always excluding the originator.
pub struct PresenceNotifier {
    router: Arc<RoomRouter>,
}

impl PresenceNotifier {
    /// Create a notifier over a router.
    #[must_use]
    pub fn new(router: Arc<RoomRouter>) -> Self {
        Self { router }
    }

    /// Broadcast that a participant started typing.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionUnknown` for an unregistered originator; the
    /// caller logs it and moves on.
    pub fn notify_typing(
        &self,
        channel_id: &str,
        connection_id: &ConnectionId,
    ) -> Result<(), RouterError> {
        self.relay(channel_id, connection_id, |username| {
            ServerEvent::user_typing(username, channel_id)
        })
    }

    /// Broadcast that a participant stopped typing.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionUnknown` for an unregistered originator.
    pub fn notify_stop_typing(
        &self,
        channel_id: &str,
        connection_id: &ConnectionId,
    ) -> Result<(), RouterError> {
        self.relay(channel_id, connection_id, |username| {
            ServerEvent::user_stop_typing(username, channel_id)
        })
    }

    fn relay(
        &self,
        channel_id: &str,
        connection_id: &ConnectionId,
        make_event: impl FnOnce(&str) -> ServerEvent,
    ) -> Result<(), RouterError> {
        let identity = self
            .router
            .registry()
            .lookup(connection_id)
            .ok_or_else(|| RouterError::ConnectionUnknown(connection_id.to_string()))?;

        let recipients = self.router.broadcast(
            channel_id,
            Outbound::excluding(make_event(&identity.username), connection_id.clone()),
        );
        trace!(channel = %channel_id, connection = %connection_id, recipients, "Typing relay");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{MembershipResolver, StaticMembership};
    use crate::registry::{ConnectionRegistry, Identity};
    use crate::store::MemoryStore;
    use tokio::sync::broadcast::{self, error::TryRecvError};

    /// Drain queued events, returning the next one addressed to `me`.
    /// Excluded copies of `me`'s own broadcasts are skipped.
    fn next_event(
        rx: &mut broadcast::Receiver<Outbound>,
        me: &ConnectionId,
    ) -> Option<ServerEvent> {
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

    async fn setup() -> (Arc<RoomRouter>, ConnectionId, ConnectionId) {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(StaticMembership::new());
        membership.insert_channel("general", ["u1".to_string(), "u2".to_string()]);
        let router = Arc::new(RoomRouter::new(
            Arc::clone(&registry),
            membership as Arc<dyn MembershipResolver>,
            Arc::new(MemoryStore::new()),
        ));

        let a = ConnectionId::new("conn-a");
        let b = ConnectionId::new("conn-b");
        registry.register(a.clone(), Identity::new("u1", "alice"));
        registry.register(b.clone(), Identity::new("u2", "bob"));
        (router, a, b)
    }

    #[tokio::test]
    async fn test_typing_excludes_originator() {
        let (router, a, b) = setup().await;
        let mut rx_a = router.subscribe("general", &a, None).await.unwrap().receiver;
        let mut rx_b = router.subscribe("general", &b, None).await.unwrap().receiver;

        let notifier = PresenceNotifier::new(Arc::clone(&router));
        notifier.notify_typing("general", &a).unwrap();

        // B sees the typing event, past its own excluded join copy.
        match next_event(&mut rx_b, &b) {
            Some(ServerEvent::UserTyping {
                username,
                channel_id,
            }) => {
                assert_eq!(username, "alice");
                assert_eq!(channel_id, "general");
            }
            other => panic!("expected user-typing, got {other:?}"),
        }

        // A never sees it: every copy addressed to A is something else.
        while let Some(event) = next_event(&mut rx_a, &a) {
            assert_ne!(event.event_name(), "user-typing");
        }
    }

    #[tokio::test]
    async fn test_typing_from_unknown_connection() {
        let (router, _a, _b) = setup().await;
        let notifier = PresenceNotifier::new(Arc::clone(&router));

        let ghost = ConnectionId::new("conn-ghost");
        let err = notifier.notify_typing("general", &ghost);
        assert!(matches!(err, Err(RouterError::ConnectionUnknown(_))));
    }

    #[tokio::test]
    async fn test_stop_typing_event_name() {
        let (router, a, b) = setup().await;
        let _rx_a = router.subscribe("general", &a, None).await.unwrap().receiver;
        let mut rx_b = router.subscribe("general", &b, None).await.unwrap().receiver;

        let notifier = PresenceNotifier::new(Arc::clone(&router));
        notifier.notify_stop_typing("general", &a).unwrap();

        let event = next_event(&mut rx_b, &b).unwrap();
        assert_eq!(event.event_name(), "user-stop-typing");
    }
}
