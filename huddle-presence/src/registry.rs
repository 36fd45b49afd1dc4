//! Connection registry: the single source of truth for "who is this
//! connection".
//!
//! Each entry is created on transport handshake and destroyed on close or
//! liveness timeout. Identity and team bindings are only changed through the
//! operations below; the router holds the registry behind its lock so every
//! operation is atomic with respect to the room registry.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::PresenceError;
use crate::ids::{ConnectionId, TeamId, UserId};
use crate::protocol::MemberSnapshot;

/// Outbound half of a connection: pre-encoded frames waiting for the socket.
pub type Outbox = mpsc::Sender<Arc<str>>;

/// One live transport session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: Option<UserId>,
    pub user_name: Option<String>,
    pub team_id: Option<TeamId>,
    pub connected_at: DateTime<Utc>,
    /// When the current team was joined.
    pub joined_at: Option<DateTime<Utc>>,
    pub last_health_check: Instant,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            user_id: None,
            user_name: None,
            team_id: None,
            connected_at: Utc::now(),
            joined_at: None,
            last_health_check: Instant::now(),
        }
    }

    /// The announced identity, if any.
    pub fn identity(&self) -> Option<(&UserId, &str)> {
        match (&self.user_id, &self.user_name) {
            (Some(id), Some(name)) => Some((id, name.as_str())),
            _ => None,
        }
    }

    /// Roster entry for team snapshots; `None` until joined.
    pub fn snapshot(&self) -> Option<MemberSnapshot> {
        let (user_id, user_name) = self.identity()?;
        Some(MemberSnapshot {
            user_id: user_id.clone(),
            user_name: user_name.to_owned(),
            team_id: self.team_id.clone()?,
            joined_at: self.joined_at.unwrap_or(self.connected_at),
        })
    }
}

/// Result of an `announce` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// First identity for this connection.
    Bound,
    /// Same identity announced again.
    Unchanged,
    /// A different identity replaced the previous one.
    Rebound,
}

/// State of a connection at the moment it was unregistered.
#[derive(Debug, Clone, PartialEq)]
pub struct Departed {
    pub connection_id: ConnectionId,
    pub user_id: Option<UserId>,
    pub user_name: Option<String>,
    pub team_id: Option<TeamId>,
}

struct Entry {
    connection: Connection,
    outbox: Outbox,
}

/// Maps live connections to the user and team they represent.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: HashMap<ConnectionId, Entry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry with no user or team bound.
    ///
    /// Registering an id twice replaces the old entry (and drops its outbox).
    pub fn register(&mut self, id: ConnectionId, outbox: Outbox) -> Connection {
        let connection = Connection::new(id);
        self.entries.insert(
            id,
            Entry {
                connection: connection.clone(),
                outbox,
            },
        );
        connection
    }

    /// Bind a user identity to a connection.
    pub fn announce(
        &mut self,
        id: ConnectionId,
        user_id: UserId,
        user_name: String,
    ) -> Result<AnnounceOutcome, PresenceError> {
        let connection = self.connection_mut(id)?;

        let outcome = match (&connection.user_id, &connection.user_name) {
            (None, _) => AnnounceOutcome::Bound,
            (Some(current_id), Some(current_name))
                if *current_id == user_id && *current_name == user_name =>
            {
                return Ok(AnnounceOutcome::Unchanged);
            }
            _ => AnnounceOutcome::Rebound,
        };

        connection.user_id = Some(user_id);
        connection.user_name = Some(user_name);
        Ok(outcome)
    }

    /// Associate a connection with a team. Returns the previous team.
    pub fn bind(&mut self, id: ConnectionId, team_id: TeamId) -> Result<Option<TeamId>, PresenceError> {
        let connection = self.connection_mut(id)?;
        if connection.identity().is_none() {
            return Err(PresenceError::UnboundIdentity(Some(id)));
        }

        if connection.team_id.as_ref() != Some(&team_id) {
            connection.joined_at = Some(Utc::now());
        }
        Ok(connection.team_id.replace(team_id))
    }

    /// Clear the team association. Returns the team that was bound.
    pub fn unbind(&mut self, id: ConnectionId) -> Result<Option<TeamId>, PresenceError> {
        let connection = self.connection_mut(id)?;
        connection.joined_at = None;
        Ok(connection.team_id.take())
    }

    /// Remove a connection and report what it was bound to.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Departed> {
        self.entries.remove(&id).map(|entry| {
            let connection = entry.connection;
            Departed {
                connection_id: id,
                user_id: connection.user_id,
                user_name: connection.user_name,
                team_id: connection.team_id,
            }
        })
    }

    /// Record a health check. Returns `false` for unknown connections.
    pub fn touch(&mut self, id: ConnectionId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.connection.last_health_check = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Connections whose last health check is older than `timeout`.
    pub fn stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.entries
            .values()
            .filter(|entry| entry.connection.last_health_check.elapsed() > timeout)
            .map(|entry| entry.connection.id)
            .collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.entries.get(&id).map(|entry| &entry.connection)
    }

    pub fn outbox(&self, id: ConnectionId) -> Option<&Outbox> {
        self.entries.get(&id).map(|entry| &entry.outbox)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Connections not bound to any team.
    pub fn unjoined_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.connection.team_id.is_none())
            .count()
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, PresenceError> {
        self.entries
            .get_mut(&id)
            .map(|entry| &mut entry.connection)
            .ok_or(PresenceError::UnknownConnection(id))
    }
}
