//! Wire protocol for presence fan-out.
//!
//! One JSON envelope per WebSocket text frame:
//! ```text
//! { "event": "member-status-update", "data": { "status": "away" } }
//! ```
//! The event name selects the variant; `data` carries its camelCase payload
//! and is omitted for payload-less actions (`liveness-probe`, `leave-team`),
//! which also accept an empty `{}` payload on decode.
//!
//! Client actions and server events are two closed enums, so an unknown
//! event name or a payload of the wrong shape fails to decode and is dropped
//! at the edge instead of travelling further as an untyped string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::PresenceError;
use crate::ids::{ConnectionId, TeamId, UserId};

/// Context tag attached to relayed typing indicators.
pub const TYPING_CONTEXT: &str = "meeting-scheduler";

/// Availability a member advertises to the rest of the team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Online,
    Away,
    Busy,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Busy => "busy",
        })
    }
}

/// Geographic position as `[latitude, longitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates(pub f64, pub f64);

impl Coordinates {
    pub fn latitude(&self) -> f64 {
        self.0
    }

    pub fn longitude(&self) -> f64 {
        self.1
    }
}

/// What happened to a meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingEventKind {
    Scheduled,
}

impl fmt::Display for MeetingEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scheduled => "scheduled",
        })
    }
}

/// One entry of a `team-status` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSnapshot {
    pub user_id: UserId,
    pub user_name: String,
    pub team_id: TeamId,
    pub joined_at: DateTime<Utc>,
}

/// Client → server actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientAction {
    /// Bind a user identity to this connection.
    Announce { user_id: UserId, user_name: String },
    /// Join a team room. Carries the identity so it can be sent alone.
    JoinTeam {
        team_id: TeamId,
        user_id: UserId,
        user_name: String,
    },
    /// Leave the current team room but keep the connection.
    LeaveTeam,
    MemberStatusUpdate { status: MemberStatus },
    LocationUpdate {
        location: String,
        #[serde(default)]
        coordinates: Option<Coordinates>,
    },
    /// Opaque meeting object produced by the scheduling UI.
    MeetingScheduled(Value),
    TypingMeeting { is_typing: bool },
    LivenessProbe,
}

impl ClientAction {
    /// Wire name of this action.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::JoinTeam { .. } => "join-team",
            Self::LeaveTeam => "leave-team",
            Self::MemberStatusUpdate { .. } => "member-status-update",
            Self::LocationUpdate { .. } => "location-update",
            Self::MeetingScheduled(_) => "meeting-scheduled",
            Self::TypingMeeting { .. } => "typing-meeting",
            Self::LivenessProbe => "liveness-probe",
        }
    }

    pub fn encode(&self) -> Result<String, PresenceError> {
        serde_json::to_string(self).map_err(|e| PresenceError::Serialization(e.to_string()))
    }

    /// Decode one frame. Payload-less actions accept `data` missing, `null`
    /// or `{}`.
    pub fn decode(frame: &str) -> Result<Self, PresenceError> {
        let mut envelope: Value =
            serde_json::from_str(frame).map_err(|e| PresenceError::MalformedFrame(e.to_string()))?;

        if let Some(object) = envelope.as_object_mut() {
            let payloadless = matches!(
                object.get("event").and_then(Value::as_str),
                Some("liveness-probe" | "leave-team")
            );
            let empty_data = object
                .get("data")
                .and_then(Value::as_object)
                .is_some_and(|data| data.is_empty());
            if payloadless && empty_data {
                object.remove("data");
            }
        }

        serde_json::from_value(envelope).map_err(|e| PresenceError::MalformedFrame(e.to_string()))
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    ConnectionConfirmed {
        connection_id: ConnectionId,
        timestamp: DateTime<Utc>,
    },
    LivenessReply {
        timestamp: DateTime<Utc>,
    },
    MemberJoined {
        user_id: UserId,
        user_name: String,
        timestamp: DateTime<Utc>,
    },
    MemberLeft {
        user_id: UserId,
        user_name: String,
        timestamp: DateTime<Utc>,
    },
    MemberStatusChanged {
        user_id: UserId,
        user_name: String,
        status: MemberStatus,
        timestamp: DateTime<Utc>,
    },
    MemberLocationUpdated {
        user_id: UserId,
        user_name: String,
        location: String,
        coordinates: Option<Coordinates>,
        timestamp: DateTime<Utc>,
    },
    MeetingNotification {
        #[serde(rename = "type")]
        kind: MeetingEventKind,
        meeting: Value,
        organizer: String,
        timestamp: DateTime<Utc>,
    },
    MemberTyping {
        user_id: UserId,
        user_name: String,
        is_typing: bool,
        context: String,
    },
    TeamStatus {
        team_id: TeamId,
        connected_members: Vec<MemberSnapshot>,
        total_connected: usize,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionConfirmed { .. } => EventKind::ConnectionConfirmed,
            Self::LivenessReply { .. } => EventKind::LivenessReply,
            Self::MemberJoined { .. } => EventKind::MemberJoined,
            Self::MemberLeft { .. } => EventKind::MemberLeft,
            Self::MemberStatusChanged { .. } => EventKind::MemberStatusChanged,
            Self::MemberLocationUpdated { .. } => EventKind::MemberLocationUpdated,
            Self::MeetingNotification { .. } => EventKind::MeetingNotification,
            Self::MemberTyping { .. } => EventKind::MemberTyping,
            Self::TeamStatus { .. } => EventKind::TeamStatus,
        }
    }

    /// The `data` half of the envelope, as kept on notifications.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut envelope| envelope.get_mut("data").map(Value::take))
            .unwrap_or(Value::Null)
    }

    pub fn encode(&self) -> Result<String, PresenceError> {
        serde_json::to_string(self).map_err(|e| PresenceError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, PresenceError> {
        serde_json::from_str(frame).map_err(|e| PresenceError::MalformedFrame(e.to_string()))
    }
}

/// Server event names, used as subscription keys on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ConnectionConfirmed,
    LivenessReply,
    MemberJoined,
    MemberLeft,
    MemberStatusChanged,
    MemberLocationUpdated,
    MeetingNotification,
    MemberTyping,
    TeamStatus,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ConnectionConfirmed,
        EventKind::LivenessReply,
        EventKind::MemberJoined,
        EventKind::MemberLeft,
        EventKind::MemberStatusChanged,
        EventKind::MemberLocationUpdated,
        EventKind::MeetingNotification,
        EventKind::MemberTyping,
        EventKind::TeamStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionConfirmed => "connection-confirmed",
            Self::LivenessReply => "liveness-reply",
            Self::MemberJoined => "member-joined",
            Self::MemberLeft => "member-left",
            Self::MemberStatusChanged => "member-status-changed",
            Self::MemberLocationUpdated => "member-location-updated",
            Self::MeetingNotification => "meeting-notification",
            Self::MemberTyping => "member-typing",
            Self::TeamStatus => "team-status",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = PresenceError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| PresenceError::MalformedFrame(format!("unknown event `{name}`")))
    }
}
