//! Team rooms: which connections receive a team's fan-out.
//!
//! A room exists exactly while it has at least one member. It is created by
//! the first `join` and deleted by the `leave` that empties it, so an empty
//! room is never observable.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::PresenceError;
use crate::ids::{ConnectionId, TeamId};

/// Result of removing a connection from a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The connection was a member.
    pub removed: bool,
    /// The leave emptied the room and it was deleted.
    pub room_closed: bool,
    /// Members still in the room afterwards.
    pub remaining: Vec<ConnectionId>,
}

/// Maps team ids to the set of connections joined to them.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<TeamId, HashSet<ConnectionId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a team room, creating the room if absent.
    ///
    /// Returns the full member list after the insert, joiner included.
    pub fn join(&mut self, team_id: &TeamId, connection_id: ConnectionId) -> Vec<ConnectionId> {
        let members = self.rooms.entry(team_id.clone()).or_default();
        if members.insert(connection_id) {
            log::debug!(
                "Connection {} joined room {} ({} members)",
                connection_id,
                team_id,
                members.len()
            );
        }
        members.iter().copied().collect()
    }

    /// Remove a connection from a team room, deleting the room when it empties.
    pub fn leave(&mut self, team_id: &TeamId, connection_id: ConnectionId) -> LeaveOutcome {
        let Some(members) = self.rooms.get_mut(team_id) else {
            return LeaveOutcome::default();
        };

        let removed = members.remove(&connection_id);
        let remaining: Vec<ConnectionId> = members.iter().copied().collect();
        let room_closed = remaining.is_empty();
        if room_closed {
            self.rooms.remove(team_id);
            log::debug!("Room {} closed", team_id);
        }

        LeaveOutcome {
            removed,
            room_closed,
            remaining,
        }
    }

    /// Snapshot of a room's members. Empty if the room does not exist.
    pub fn members_of(&self, team_id: &TeamId) -> Vec<ConnectionId> {
        self.rooms
            .get(team_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fan-out targets for an event originating from `exclude`.
    pub fn recipients(
        &self,
        team_id: &TeamId,
        exclude: ConnectionId,
    ) -> Result<Vec<ConnectionId>, PresenceError> {
        let members = self
            .rooms
            .get(team_id)
            .ok_or_else(|| PresenceError::UnknownRoomTarget(team_id.clone()))?;

        Ok(members
            .iter()
            .copied()
            .filter(|id| *id != exclude)
            .collect())
    }

    pub fn contains(&self, team_id: &TeamId, connection_id: ConnectionId) -> bool {
        self.rooms
            .get(team_id)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Member count per open room, ordered by team id.
    pub fn sizes(&self) -> BTreeMap<TeamId, usize> {
        self.rooms
            .iter()
            .map(|(team_id, members)| (team_id.clone(), members.len()))
            .collect()
    }
}
