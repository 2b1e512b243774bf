//! # ripple-protocol
//!
//! Wire protocol definitions for the Ripple chat messaging engine.
//!
//! Events are exchanged as JSON text frames over WebSocket, tagged with an
//! `event` name and a `data` payload. Field names are part of the stable
//! wire contract and use camelCase.

pub mod codec;
pub mod events;

pub use codec::{decode_client, decode_server, encode, CodecError};
pub use events::{ChatMessage, ClientEvent, ContentKind, ServerEvent};
