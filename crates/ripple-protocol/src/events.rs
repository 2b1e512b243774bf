//! Event types for the Ripple protocol.
//!
//! Inbound events are what clients send; outbound events are what the
//! server broadcasts or replies with. Both sides serialize as
//! `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

/// Content kind discriminator for chat messages.
///
/// The set is closed: anything else is rejected at decode time before it
/// can enter the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text message body.
    Text,
    /// Reference to an uploaded image (URL or storage key).
    Image,
}

impl ContentKind {
    /// Get the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
        }
    }
}

/// A persisted chat message as it appears on the wire.
///
/// `id`, `seq`, and `timestamp` are assigned by the server at append time;
/// clients never supply them. `seq` is scoped to the channel and strictly
/// increasing in append order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Store-assigned unique identifier.
    pub id: u64,
    /// Channel this message belongs to.
    pub channel_id: String,
    /// Author user id.
    pub user_id: String,
    /// Author display name at send time.
    pub username: String,
    /// Text body or image reference, per `kind`.
    pub content: String,
    /// Content kind discriminator.
    pub kind: ContentKind,
    /// Server-assigned timestamp, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Channel-scoped sequence number, strictly increasing in append order.
    pub seq: u64,
    /// Optional author avatar reference.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub author_avatar_url: Option<String>,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Announce identity for this connection.
    #[serde(rename_all = "camelCase")]
    UserConnect {
        user_id: String,
        username: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        avatar_url: Option<String>,
    },

    /// Join a channel and receive its recent history.
    #[serde(rename_all = "camelCase")]
    JoinChannel {
        channel_id: String,
        user_id: String,
        username: String,
        /// Override for the number of history entries to replay.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        limit: Option<usize>,
    },

    /// Leave a channel.
    #[serde(rename_all = "camelCase")]
    LeaveChannel { channel_id: String, username: String },

    /// Send a chat message to a channel.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        channel_id: String,
        user_id: String,
        username: String,
        content: String,
        kind: ContentKind,
    },

    /// Transient typing indicator.
    #[serde(rename_all = "camelCase")]
    Typing { channel_id: String, username: String },

    /// Transient stop-typing indicator.
    #[serde(rename_all = "camelCase")]
    StopTyping { channel_id: String, username: String },
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Recent history replay, sent only to a joining connection. The
    /// payload is the bare array, oldest-first.
    MessageHistory(Vec<ChatMessage>),

    /// A newly persisted message, broadcast to all subscribers including
    /// the sender. The payload is the bare message object.
    NewMessage(ChatMessage),

    /// A participant joined the channel.
    #[serde(rename_all = "camelCase")]
    UserJoined { username: String, channel_id: String },

    /// A participant left the channel.
    #[serde(rename_all = "camelCase")]
    UserLeft { username: String, channel_id: String },

    /// A participant is typing.
    #[serde(rename_all = "camelCase")]
    UserTyping { username: String, channel_id: String },

    /// A participant stopped typing.
    #[serde(rename_all = "camelCase")]
    UserStopTyping { username: String, channel_id: String },

    /// A participant's connection went away.
    #[serde(rename_all = "camelCase")]
    UserDisconnected { username: String },

    /// Request-scoped failure, reported only to the requesting connection.
    #[serde(rename_all = "camelCase")]
    Error { code: u16, message: String },
}

impl ServerEvent {
    /// Get the wire event name.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::MessageHistory(_) => "message-history",
            ServerEvent::NewMessage(_) => "new-message",
            ServerEvent::UserJoined { .. } => "user-joined",
            ServerEvent::UserLeft { .. } => "user-left",
            ServerEvent::UserTyping { .. } => "user-typing",
            ServerEvent::UserStopTyping { .. } => "user-stop-typing",
            ServerEvent::UserDisconnected { .. } => "user-disconnected",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Create a history replay event.
    #[must_use]
    pub fn history(messages: Vec<ChatMessage>) -> Self {
        ServerEvent::MessageHistory(messages)
    }

    /// Create a new-message broadcast event.
    #[must_use]
    pub fn new_message(message: ChatMessage) -> Self {
        ServerEvent::NewMessage(message)
    }

    /// Create a user-joined presence event.
    #[must_use]
    pub fn user_joined(username: impl Into<String>, channel_id: impl Into<String>) -> Self {
        ServerEvent::UserJoined {
            username: username.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Create a user-left presence event.
    #[must_use]
    pub fn user_left(username: impl Into<String>, channel_id: impl Into<String>) -> Self {
        ServerEvent::UserLeft {
            username: username.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Create a typing event.
    #[must_use]
    pub fn user_typing(username: impl Into<String>, channel_id: impl Into<String>) -> Self {
        ServerEvent::UserTyping {
            username: username.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Create a stop-typing event.
    #[must_use]
    pub fn user_stop_typing(username: impl Into<String>, channel_id: impl Into<String>) -> Self {
        ServerEvent::UserStopTyping {
            username: username.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Create a user-disconnected presence event.
    #[must_use]
    pub fn user_disconnected(username: impl Into<String>) -> Self {
        ServerEvent::UserDisconnected {
            username: username.into(),
        }
    }

    /// Create an error reply.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}
