//! Broadcast router: the server-side state machine for every connection.
//!
//! ```text
//!   Unidentified ──announce──▶ Identified ──join-team──▶ Joined ◀─┐
//!        │                      ▲    │                    │   │    │ status / location /
//!        │                      └────┼────leave-team──────┘   └────┘ meeting / typing
//!        ▼                           ▼                        ▼
//!      Closed ◀──────────── close / liveness timeout ─────────┘
//! ```
//!
//! The phase is derived from the connection registry entry, never stored
//! separately. Both registries sit behind one async mutex, so a join, leave or
//! close is observed by every other connection as a single step.
//!
//! Fan-out encodes an event once into an `Arc<str>` and `try_send`s it into
//! each recipient's bounded outbox. A full outbox drops that frame for that
//! receiver only; the sender is never blocked by a slow peer.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;

use crate::error::PresenceError;
use crate::ids::{ConnectionId, TeamId, UserId};
use crate::protocol::{ClientAction, MeetingEventKind, MemberSnapshot, ServerEvent, TYPING_CONTEXT};
use crate::registry::{AnnounceOutcome, ConnectionRegistry, Departed, Outbox};
use crate::rooms::RoomRegistry;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Unidentified,
    Identified,
    Joined,
    Closed,
}

/// Point-in-time view of the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub total_connected: usize,
    pub active_teams: usize,
    pub connections_by_team: BTreeMap<TeamId, usize>,
    /// Connections that have not joined a team.
    pub unjoined: usize,
    /// Frames accepted into an outbox.
    pub messages_sent: u64,
    /// Frames dropped because the outbox was full or closed.
    pub messages_dropped: u64,
    /// Connections opened since the hub was created.
    pub total_connections: u64,
}

/// Connected members of one team.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRoster {
    pub team_id: TeamId,
    pub connected_users: Vec<MemberSnapshot>,
    pub count: usize,
}

/// Lock-free counters, read via `PresenceHub::stats`.
#[derive(Default)]
struct AtomicHubStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    total_connections: AtomicU64,
}

#[derive(Default)]
struct HubState {
    connections: ConnectionRegistry,
    rooms: RoomRegistry,
}

/// Identity and team of a joined sender.
struct Sender {
    user_id: UserId,
    user_name: String,
    team_id: TeamId,
}

impl HubState {
    /// Resolve the sender of a room event. `Ok(None)` when identified but not
    /// joined to any team.
    fn sender(&self, id: ConnectionId) -> Result<Option<Sender>, PresenceError> {
        let connection = self
            .connections
            .get(id)
            .ok_or(PresenceError::UnknownConnection(id))?;
        let (user_id, user_name) = connection
            .identity()
            .ok_or(PresenceError::UnboundIdentity(Some(id)))?;

        Ok(connection.team_id.clone().map(|team_id| Sender {
            user_id: user_id.clone(),
            user_name: user_name.to_owned(),
            team_id,
        }))
    }

    /// Roster of a team, ordered by join time.
    fn snapshot(&self, team_id: &TeamId) -> Vec<MemberSnapshot> {
        let mut members: Vec<MemberSnapshot> = self
            .rooms
            .members_of(team_id)
            .into_iter()
            .filter_map(|id| self.connections.get(id)?.snapshot())
            .collect();
        members.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        members
    }
}

/// Routes client actions to rooms and owns both registries.
pub struct PresenceHub {
    state: Mutex<HubState>,
    stats: AtomicHubStats,
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            stats: AtomicHubStats::default(),
        }
    }

    /// Register a new connection and confirm it over its outbox.
    pub async fn open(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::new();
        let mut state = self.state.lock().await;
        state.connections.register(id, outbox);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let confirmed = ServerEvent::ConnectionConfirmed {
            connection_id: id,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.deliver(&state, &[id], &confirmed) {
            log::warn!("Failed to confirm connection {id}: {e}");
        }

        log::info!(
            "Connection {} opened ({} connected)",
            id,
            state.connections.len()
        );
        id
    }

    /// Record a health check without an action (transport-level ping).
    pub async fn touch(&self, id: ConnectionId) -> bool {
        self.state.lock().await.connections.touch(id)
    }

    /// Decode one inbound text frame and apply it.
    ///
    /// Errors are logged, never propagated: a bad frame from one connection
    /// must not affect that connection's session or any other.
    pub async fn handle_frame(&self, id: ConnectionId, frame: &str) -> usize {
        let action = match ClientAction::decode(frame) {
            Ok(action) => action,
            Err(e) => {
                log::warn!("Dropping frame from {id}: {e}");
                self.touch(id).await;
                return 0;
            }
        };

        let name = action.name();
        match self.handle(id, action).await {
            Ok(delivered) => delivered,
            Err(e @ PresenceError::UnboundIdentity(_)) => {
                log::warn!("Dropping {name}: {e}");
                0
            }
            Err(e @ PresenceError::UnknownRoomTarget(_)) => {
                log::debug!("Nothing to fan out for {name}: {e}");
                0
            }
            Err(e) => {
                log::warn!("Failed to handle {name} from {id}: {e}");
                0
            }
        }
    }

    /// Apply one client action. Returns the number of frames queued.
    pub async fn handle(&self, id: ConnectionId, action: ClientAction) -> Result<usize, PresenceError> {
        let mut state = self.state.lock().await;
        if !state.connections.touch(id) {
            return Err(PresenceError::UnknownConnection(id));
        }

        match action {
            ClientAction::Announce { user_id, user_name } => {
                let (outcome, delivered) =
                    self.rebind_identity(&mut state, id, user_id.clone(), user_name.clone())?;
                match outcome {
                    AnnounceOutcome::Bound => {
                        log::info!("User {user_name} ({user_id}) announced on {id}")
                    }
                    AnnounceOutcome::Rebound => {
                        log::info!("Connection {id} rebound to {user_name} ({user_id})")
                    }
                    AnnounceOutcome::Unchanged => log::trace!("Repeated announce on {id}"),
                }
                Ok(delivered)
            }

            ClientAction::JoinTeam {
                team_id,
                user_id,
                user_name,
            } => self.join_team(&mut state, id, team_id, user_id, user_name),

            ClientAction::LeaveTeam => match state.connections.unbind(id)? {
                Some(team_id) => {
                    let delivered = self.depart_room(&mut state, id, &team_id)?;
                    Ok(delivered)
                }
                None => {
                    log::debug!("leave-team from {id} without a team");
                    Ok(0)
                }
            },

            ClientAction::MemberStatusUpdate { status } => {
                let Some(sender) = Self::joined_sender(&state, id, "member-status-update")? else {
                    return Ok(0);
                };
                log::debug!("{} is now {} in team {}", sender.user_name, status, sender.team_id);
                let event = ServerEvent::MemberStatusChanged {
                    user_id: sender.user_id,
                    user_name: sender.user_name,
                    status,
                    timestamp: Utc::now(),
                };
                self.relay(&state, id, &sender.team_id, &event)
            }

            ClientAction::LocationUpdate {
                location,
                coordinates,
            } => {
                let Some(sender) = Self::joined_sender(&state, id, "location-update")? else {
                    return Ok(0);
                };
                log::debug!("{} moved to {} in team {}", sender.user_name, location, sender.team_id);
                let event = ServerEvent::MemberLocationUpdated {
                    user_id: sender.user_id,
                    user_name: sender.user_name,
                    location,
                    coordinates,
                    timestamp: Utc::now(),
                };
                self.relay(&state, id, &sender.team_id, &event)
            }

            ClientAction::MeetingScheduled(meeting) => {
                let Some(sender) = Self::joined_sender(&state, id, "meeting-scheduled")? else {
                    return Ok(0);
                };
                log::info!("{} scheduled a meeting in team {}", sender.user_name, sender.team_id);
                let event = ServerEvent::MeetingNotification {
                    kind: MeetingEventKind::Scheduled,
                    meeting,
                    organizer: sender.user_name,
                    timestamp: Utc::now(),
                };
                self.relay(&state, id, &sender.team_id, &event)
            }

            ClientAction::TypingMeeting { is_typing } => {
                let Some(sender) = Self::joined_sender(&state, id, "typing-meeting")? else {
                    return Ok(0);
                };
                let event = ServerEvent::MemberTyping {
                    user_id: sender.user_id,
                    user_name: sender.user_name,
                    is_typing,
                    context: TYPING_CONTEXT.to_owned(),
                };
                self.relay(&state, id, &sender.team_id, &event)
            }

            ClientAction::LivenessProbe => {
                log::trace!("Liveness probe from {id}");
                let reply = ServerEvent::LivenessReply {
                    timestamp: Utc::now(),
                };
                self.deliver(&state, &[id], &reply)
            }
        }
    }

    /// Tear down a connection. Safe to call more than once.
    pub async fn close(&self, id: ConnectionId) -> Option<Departed> {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state, id)
    }

    /// Close every connection whose last health check is older than `timeout`.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<Departed> {
        let mut state = self.state.lock().await;
        let stale = state.connections.stale(timeout);
        if !stale.is_empty() {
            log::info!("Evicting {} stale connection(s)", stale.len());
        }

        stale
            .into_iter()
            .filter_map(|id| self.close_locked(&mut state, id))
            .collect()
    }

    pub async fn phase(&self, id: ConnectionId) -> ConnectionPhase {
        let state = self.state.lock().await;
        match state.connections.get(id) {
            None => ConnectionPhase::Closed,
            Some(connection) if connection.team_id.is_some() => ConnectionPhase::Joined,
            Some(connection) if connection.identity().is_some() => ConnectionPhase::Identified,
            Some(_) => ConnectionPhase::Unidentified,
        }
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.lock().await;
        let connections_by_team = state.rooms.sizes();
        HubStats {
            total_connected: state.connections.len(),
            active_teams: connections_by_team.len(),
            connections_by_team,
            unjoined: state.connections.unjoined_count(),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
        }
    }

    pub async fn team_roster(&self, team_id: &TeamId) -> TeamRoster {
        let state = self.state.lock().await;
        let connected_users = state.snapshot(team_id);
        TeamRoster {
            team_id: team_id.clone(),
            count: connected_users.len(),
            connected_users,
        }
    }

    fn join_team(
        &self,
        state: &mut HubState,
        id: ConnectionId,
        team_id: TeamId,
        user_id: UserId,
        user_name: String,
    ) -> Result<usize, PresenceError> {
        let current = state
            .connections
            .get(id)
            .ok_or(PresenceError::UnknownConnection(id))?
            .team_id
            .clone();

        // Leave the old room under the identity it was joined with.
        let mut delivered = 0;
        if let Some(current) = current.filter(|current| *current != team_id) {
            delivered += self.depart_room(state, id, &current)?;
            state.connections.unbind(id)?;
        }

        let (_, rebound) = self.rebind_identity(state, id, user_id.clone(), user_name.clone())?;
        delivered += rebound;

        let previous = state.connections.bind(id, team_id.clone())?;
        let rejoin = previous.as_ref() == Some(&team_id);

        let members = state.rooms.join(&team_id, id);
        if rejoin {
            log::debug!("{user_name} re-joined team {team_id}");
        } else {
            log::info!(
                "{} ({}) joined team {} ({} connected)",
                user_name,
                user_id,
                team_id,
                members.len()
            );
            let others: Vec<ConnectionId> = members.iter().copied().filter(|m| *m != id).collect();
            let joined = ServerEvent::MemberJoined {
                user_id,
                user_name,
                timestamp: Utc::now(),
            };
            delivered += self.deliver(state, &others, &joined)?;
        }

        let connected_members = state.snapshot(&team_id);
        let status = ServerEvent::TeamStatus {
            team_id,
            total_connected: connected_members.len(),
            connected_members,
        };
        delivered += self.deliver(state, &[id], &status)?;
        Ok(delivered)
    }

    /// Bind an identity to a connection. If the connection is in a room and
    /// the identity changes, the room sees the old user leave and the new
    /// one join.
    fn rebind_identity(
        &self,
        state: &mut HubState,
        id: ConnectionId,
        user_id: UserId,
        user_name: String,
    ) -> Result<(AnnounceOutcome, usize), PresenceError> {
        let connection = state
            .connections
            .get(id)
            .ok_or(PresenceError::UnknownConnection(id))?;
        let old_identity = connection
            .identity()
            .map(|(user_id, user_name)| (user_id.clone(), user_name.to_owned()));
        let team_id = connection.team_id.clone();

        let outcome = state.connections.announce(id, user_id.clone(), user_name.clone())?;
        let (AnnounceOutcome::Rebound, Some(team_id), Some((old_id, old_name))) =
            (outcome, team_id, old_identity)
        else {
            return Ok((outcome, 0));
        };

        log::info!("{old_name} ({old_id}) is now {user_name} ({user_id}) in team {team_id}");
        let recipients = state.rooms.recipients(&team_id, id)?;
        let timestamp = Utc::now();
        let left = ServerEvent::MemberLeft {
            user_id: old_id,
            user_name: old_name,
            timestamp,
        };
        let joined = ServerEvent::MemberJoined {
            user_id,
            user_name,
            timestamp,
        };
        let delivered = self.deliver(state, &recipients, &left)?
            + self.deliver(state, &recipients, &joined)?;
        Ok((outcome, delivered))
    }

    /// Remove `id` from a room and tell whoever is left.
    fn depart_room(
        &self,
        state: &mut HubState,
        id: ConnectionId,
        team_id: &TeamId,
    ) -> Result<usize, PresenceError> {
        let outcome = state.rooms.leave(team_id, id);
        if !outcome.removed {
            return Ok(0);
        }

        let Some((user_id, user_name)) = state
            .connections
            .get(id)
            .and_then(|connection| connection.identity())
            .map(|(user_id, user_name)| (user_id.clone(), user_name.to_owned()))
        else {
            return Ok(0);
        };

        log::info!("{user_name} ({user_id}) left team {team_id}");
        let left = ServerEvent::MemberLeft {
            user_id,
            user_name,
            timestamp: Utc::now(),
        };
        self.deliver(state, &outcome.remaining, &left)
    }

    fn close_locked(&self, state: &mut HubState, id: ConnectionId) -> Option<Departed> {
        let team_id = state.connections.get(id)?.team_id.clone();
        if let Some(team_id) = team_id {
            if let Err(e) = self.depart_room(state, id, &team_id) {
                log::warn!("Failed to announce departure of {id}: {e}");
            }
        }

        let departed = state.connections.unregister(id)?;
        log::info!(
            "Connection {} closed ({} connected)",
            id,
            state.connections.len()
        );
        Some(departed)
    }

    fn joined_sender(
        state: &HubState,
        id: ConnectionId,
        action: &str,
    ) -> Result<Option<Sender>, PresenceError> {
        let sender = state.sender(id)?;
        if sender.is_none() {
            log::debug!("{action} from {id} before join-team, ignoring");
        }
        Ok(sender)
    }

    /// Fan an event out to every room member except the sender.
    fn relay(
        &self,
        state: &HubState,
        sender: ConnectionId,
        team_id: &TeamId,
        event: &ServerEvent,
    ) -> Result<usize, PresenceError> {
        let recipients = state.rooms.recipients(team_id, sender)?;
        self.deliver(state, &recipients, event)
    }

    /// Encode once, then queue the frame for each target.
    fn deliver(
        &self,
        state: &HubState,
        targets: &[ConnectionId],
        event: &ServerEvent,
    ) -> Result<usize, PresenceError> {
        if targets.is_empty() {
            return Ok(0);
        }

        let frame: Arc<str> = Arc::from(event.encode()?);
        let mut delivered = 0;
        for target in targets {
            let Some(outbox) = state.connections.outbox(*target) else {
                continue;
            };
            match outbox.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Outbox full for {target}, dropped {}", event.kind());
                }
                Err(TrySendError::Closed(_)) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Outbox closed for {target}, dropped {}", event.kind());
                }
            }
        }
        Ok(delivered)
    }
}
