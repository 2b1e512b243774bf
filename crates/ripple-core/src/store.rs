//! Message log interface and in-memory implementation.
//!
//! The store assigns ids, channel-scoped sequence numbers, and server
//! timestamps at append time. It does no membership validation; the
//! router enforces that before calling in.

use async_trait::async_trait;
use dashmap::DashMap;
use ripple_protocol::{ChatMessage, ContentKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::trace;

use crate::membership::UserId;

/// Default number of messages retained per channel by the in-memory store.
pub const DEFAULT_RETENTION: usize = 1000;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing storage is unavailable or rejected the write.
    #[error("Message store unavailable: {0}")]
    Unavailable(String),
}

/// A message as submitted for persistence, before the store has assigned
/// id, sequence number, and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Target channel.
    pub channel_id: String,
    /// Author user id.
    pub user_id: UserId,
    /// Author display name at send time.
    pub username: String,
    /// Text body or image reference, per `kind`.
    pub content: String,
    /// Content kind discriminator.
    pub kind: ContentKind,
    /// Optional author avatar reference.
    pub author_avatar_url: Option<String>,
}

/// Durable, ordered per-channel message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, assigning a unique id, a channel-scoped sequence
    /// number, and a server timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the write cannot be made
    /// durable. Nothing is retained on failure.
    async fn append(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Fetch at most `limit` most-recently-appended messages for a
    /// channel, re-ordered oldest-first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the log cannot be read.
    async fn recent(&self, channel_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Default)]
struct ChannelLog {
    /// Append-order, oldest first.
    messages: Vec<ChatMessage>,
    next_seq: u64,
}

/// In-memory message log with bounded per-channel retention.
///
/// Per-channel appends serialize on the channel's map entry; appends to
/// different channels proceed independently.
#[derive(Debug)]
pub struct MemoryStore {
    logs: DashMap<String, ChannelLog>,
    next_id: AtomicU64,
    retention: usize,
}

impl MemoryStore {
    /// Create a store with default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a store retaining at most `retention` messages per channel.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            logs: DashMap::new(),
            next_id: AtomicU64::new(1),
            retention,
        }
    }

    /// Total number of retained messages across all channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.logs.iter().map(|l| l.messages.len()).sum()
    }

    /// Check if the store holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let mut log = self.logs.entry(message.channel_id.clone()).or_default();

        let seq = log.next_seq;
        log.next_seq += 1;

        let persisted = ChatMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            channel_id: message.channel_id,
            user_id: message.user_id,
            username: message.username,
            content: message.content,
            kind: message.kind,
            timestamp: now_millis(),
            seq,
            author_avatar_url: message.author_avatar_url,
        };

        log.messages.push(persisted.clone());
        if log.messages.len() > self.retention {
            let overflow = log.messages.len() - self.retention;
            log.messages.drain(..overflow);
        }

        trace!(channel = %persisted.channel_id, id = persisted.id, seq, "Appended message");
        Ok(persisted)
    }

    async fn recent(&self, channel_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .logs
            .get(channel_id)
            .map(|log| {
                let start = log.messages.len().saturating_sub(limit);
                log.messages[start..].to_vec()
            })
            .unwrap_or_default())
    }
}
