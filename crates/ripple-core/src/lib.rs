//! # ripple-core
//!
//! Connection tracking, room routing, and the message log interface for
//! the Ripple chat messaging engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ConnectionRegistry** - Maps live connections to identities
//! - **RoomRouter** - Membership-guarded channel subscription and fan-out
//! - **MessageStore** - Durable, ordered per-channel message log
//! - **MembershipResolver** - Read-only view of channel rosters
//! - **PresenceNotifier** - Transient typing/presence relays
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │◀────│ RoomRouter  │────▶│  Channel    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │        │
//!                        ▼        ▼
//!                 ┌──────────┐ ┌──────────────┐
//!                 │  Store   │ │  Membership  │
//!                 └──────────┘ └──────────────┘
//! ```

pub mod channel;
pub mod membership;
pub mod presence;
pub mod registry;
pub mod router;
pub mod store;

pub use channel::{Channel, ChannelId, Outbound};
pub use membership::{MembershipResolver, OpenMembership, StaticMembership, UserId};
pub use presence::PresenceNotifier;
pub use registry::{ConnectionId, ConnectionRegistry, Identity};
pub use router::{RoomRouter, RouterConfig, RouterError, Subscription};
pub use store::{MemoryStore, MessageStore, NewMessage, StoreError};
