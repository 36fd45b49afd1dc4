//! Bounded, newest-first notification feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;

/// Maximum notifications retained; older ones are evicted first.
pub const NOTIFICATION_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    MemberJoined,
    MemberLeft,
    StatusChange,
    LocationUpdate,
    Meeting,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MemberJoined => "member-joined",
            Self::MemberLeft => "member-left",
            Self::StatusChange => "status-change",
            Self::LocationUpdate => "location-update",
            Self::Meeting => "meeting",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// The event payload that produced this notification.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// Newest-first list capped at [`NOTIFICATION_CAPACITY`].
#[derive(Debug, Clone)]
pub struct NotificationFeed {
    items: VecDeque<Notification>,
    capacity: usize,
    next_id: u64,
}

impl Default for NotificationFeed {
    fn default() -> Self {
        Self::with_capacity(NOTIFICATION_CAPACITY)
    }
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    /// Prepend an unread notification, evicting the oldest past capacity.
    /// Returns the new notification's id.
    pub fn push(
        &mut self,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        payload: Value,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.items.push_front(Notification {
            id,
            kind,
            title: title.into(),
            message: message.into(),
            payload,
            created_at: Utc::now(),
            read: false,
        });
        self.items.truncate(self.capacity);
        id
    }

    /// Returns `false` if no notification has this id.
    pub fn mark_read(&mut self, id: u64) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        self.items.iter_mut().for_each(|n| n.read = true);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn latest(&self) -> Option<&Notification> {
        self.items.front()
    }
}
