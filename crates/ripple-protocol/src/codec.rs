//! Codec for encoding and decoding Ripple events.
//!
//! Events travel as JSON text frames; the WebSocket layer provides
//! message framing, so no length prefix is needed.

use serde::Serialize;
use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent};

/// Maximum accepted event size in bytes (64 KiB).
pub const MAX_EVENT_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Event exceeds maximum size.
    #[error("Event size {0} exceeds maximum {MAX_EVENT_SIZE}")]
    EventTooLarge(usize),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an event to a JSON text frame.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode<T: Serialize>(event: &T) -> Result<String, CodecError> {
    let text = serde_json::to_string(event)?;
    if text.len() > MAX_EVENT_SIZE {
        return Err(CodecError::EventTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a client event from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, malformed, or names an
/// unknown event.
pub fn decode_client(text: &str) -> Result<ClientEvent, CodecError> {
    if text.len() > MAX_EVENT_SIZE {
        return Err(CodecError::EventTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Decode a server event from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or malformed.
pub fn decode_server(text: &str) -> Result<ServerEvent, CodecError> {
    if text.len() > MAX_EVENT_SIZE {
        return Err(CodecError::EventTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}
