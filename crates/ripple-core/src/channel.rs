//! Channel abstraction for Ripple.
//!
//! A channel tracks the set of live subscribed connections and carries
//! fan-out delivery for that channel's events.

use ripple_protocol::ServerEvent;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::registry::ConnectionId;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel name at the boundary.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// An event in flight to a channel's subscribers.
///
/// `exclude` names a connection that must not see the event (the
/// originator of self-scoped events like typing). Filtering happens at
/// each subscriber's forwarding side so a broadcast never has to touch
/// individual receivers.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection that must not receive this event, if any.
    pub exclude: Option<ConnectionId>,
    /// The event, shared across all recipients.
    pub event: Arc<ServerEvent>,
}

impl Outbound {
    /// Create an event for every subscriber.
    #[must_use]
    pub fn to_all(event: ServerEvent) -> Self {
        Self {
            exclude: None,
            event: Arc::new(event),
        }
    }

    /// Create an event for every subscriber except `origin`.
    #[must_use]
    pub fn excluding(event: ServerEvent, origin: ConnectionId) -> Self {
        Self {
            exclude: Some(origin),
            event: Arc::new(event),
        }
    }

    /// Check whether `connection_id` should receive this event.
    #[must_use]
    pub fn is_for(&self, connection_id: &ConnectionId) -> bool {
        self.exclude.as_ref() != Some(connection_id)
    }
}

/// A single channel's live subscriber set and fan-out sender.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    /// Broadcast sender for this channel.
    sender: broadcast::Sender<Outbound>,
    /// Set of subscribed connections.
    subscribers: HashSet<ConnectionId>,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new channel with a specific fan-out capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<ChannelId>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            subscribers: HashSet::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &ConnectionId) -> bool {
        self.subscribers.contains(connection_id)
    }

    /// Subscribe a connection to this channel.
    ///
    /// Idempotent for set membership; a re-subscribe returns a fresh
    /// receiver without growing the set. Returns the receiver and whether
    /// the connection was newly added.
    pub fn subscribe(&mut self, connection_id: ConnectionId) -> (broadcast::Receiver<Outbound>, bool) {
        let newly_added = self.subscribers.insert(connection_id.clone());
        if newly_added {
            debug!(channel = %self.name, connection = %connection_id, "Connection subscribed");
        }
        (self.sender.subscribe(), newly_added)
    }

    /// Unsubscribe a connection from this channel.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.subscribers.remove(connection_id);
        if removed {
            debug!(channel = %self.name, connection = %connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Fan an event out to current subscribers.
    ///
    /// Best-effort per recipient: a lagged or closed receiver never blocks
    /// the others. Returns the number of live receivers.
    pub fn broadcast(&self, outbound: Outbound) -> usize {
        trace!(channel = %self.name, event = %outbound.event.event_name(), "Broadcasting");
        self.sender.send(outbound).unwrap_or_default()
    }

    /// Check if the channel has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
