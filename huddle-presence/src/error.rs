use thiserror::Error;

use crate::ids::{ConnectionId, TeamId, UserId};

/// Errors raised by the presence engine.
///
/// None of these are fatal to a listener: the router logs and drops the
/// offending action, the store ignores the offending event, and the transport
/// adapter turns connection failures into a status change.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PresenceError {
    /// Connecting or reconnecting failed.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// An action that needs an identity arrived before `announce`.
    #[error("identity not announced{}", fmt_connection(.0))]
    UnboundIdentity(Option<ConnectionId>),

    /// An event targets a team that has no open room.
    #[error("no open room for team {0}")]
    UnknownRoomTarget(TeamId),

    /// A presence update references a user this client never saw join.
    #[error("no presence record for user {0}")]
    StaleMemberReference(UserId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// A frame that does not decode into the event taxonomy.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection closed")]
    ConnectionClosed,
}

fn fmt_connection(connection: &Option<ConnectionId>) -> String {
    connection
        .map(|id| format!(" on connection {id}"))
        .unwrap_or_default()
}
