//! # huddle-presence: Real-time team presence and broadcast
//!
//! Tracks which dashboard users are connected, which team room each one is
//! in, and relays their status, location, typing and meeting activity to the
//! rest of the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────────┐
//! │ TransportAdapter │ ◄────────────────► │ PresenceServer   │
//! │ (per user)       │   JSON envelopes   │ (central)        │
//! └────────┬─────────┘                    └────────┬─────────┘
//!          │ subscriptions                         │
//!          ▼                                       ▼
//! ┌──────────────────┐                    ┌──────────────────┐
//! │ PresenceStore    │                    │ PresenceHub      │
//! │ records, typing, │                    │ (router)         │
//! │ notifications    │                    └────────┬─────────┘
//! └──────────────────┘                     ┌───────┴────────┐
//!                                          ▼                ▼
//!                                  ConnectionRegistry  RoomRegistry
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol (`ClientAction` / `ServerEvent`)
//! - [`registry`]: connection → user and team bindings
//! - [`rooms`]: team → connection sets
//! - [`router`]: per-connection state machine and room fan-out
//! - [`server`]: WebSocket server and liveness sweeper
//! - [`client`]: WebSocket client with reconnect and subscriptions
//! - [`store`]: client-side presence reconciliation
//! - [`notifications`]: bounded notification feed

pub mod client;
pub mod error;
pub mod ids;
pub mod notifications;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use client::{
    ClientConfig, ConnectionStatus, EventCallback, Identity, ReconnectPolicy, Subscription,
    TransportAdapter,
};
pub use error::PresenceError;
pub use ids::{ConnectionId, TeamId, UserId};
pub use notifications::{Notification, NotificationFeed, NotificationKind, NOTIFICATION_CAPACITY};
pub use protocol::{
    ClientAction, Coordinates, EventKind, MeetingEventKind, MemberSnapshot, MemberStatus,
    ServerEvent, TYPING_CONTEXT,
};
pub use registry::{AnnounceOutcome, Connection, ConnectionRegistry, Departed};
pub use rooms::{LeaveOutcome, RoomRegistry};
pub use router::{ConnectionPhase, HubStats, PresenceHub, TeamRoster};
pub use server::{PresenceServer, ServerConfig};
pub use store::{PresenceBinding, PresenceRecord, PresenceStore};
