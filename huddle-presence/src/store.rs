//! Client-side presence state, reconciled from server events.
//!
//! ```text
//! TransportAdapter ── ServerEvent ──▶ PresenceStore::apply()
//!                                        │
//!                     ┌──────────────────┼──────────────────┐
//!                     ▼                  ▼                  ▼
//!               member records      typing set      notification feed
//! ```
//!
//! The store never touches the connection. `PresenceBinding` wires one to a
//! `TransportAdapter` through subscriptions and clears its presence when the
//! adapter is disconnected; tests can drive `apply` directly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{lock, ConnectionStatus, EventCallback, Subscription, TransportAdapter};
use crate::error::PresenceError;
use crate::ids::{TeamId, UserId};
use crate::notifications::{Notification, NotificationFeed, NotificationKind};
use crate::protocol::{Coordinates, EventKind, MemberStatus, ServerEvent};

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// What this client knows about one teammate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub user_name: String,
    pub status: MemberStatus,
    pub location: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub joined_at: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    fn joined(user_id: UserId, user_name: String, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            user_name,
            status: MemberStatus::Online,
            location: None,
            coordinates: None,
            joined_at,
            last_update: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PresenceStore {
    members: HashMap<UserId, PresenceRecord>,
    typing: HashSet<UserId>,
    feed: NotificationFeed,
    team_id: Option<TeamId>,
    total_connected: usize,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile one server event.
    ///
    /// Updates for a member with no record return `StaleMemberReference`;
    /// the notification is still recorded and the next `team-status` heals
    /// the collection.
    pub fn apply(&mut self, event: &ServerEvent) -> Result<(), PresenceError> {
        match event {
            ServerEvent::MemberJoined {
                user_id,
                user_name,
                timestamp,
            } => {
                self.members.insert(
                    user_id.clone(),
                    PresenceRecord::joined(user_id.clone(), user_name.clone(), *timestamp),
                );
                self.notify(
                    NotificationKind::MemberJoined,
                    "Member Joined",
                    format!("{user_name} joined the team"),
                    event,
                );
                Ok(())
            }

            ServerEvent::MemberLeft {
                user_id, user_name, ..
            } => {
                self.members.remove(user_id);
                self.typing.remove(user_id);
                self.notify(
                    NotificationKind::MemberLeft,
                    "Member Left",
                    format!("{user_name} left the team"),
                    event,
                );
                Ok(())
            }

            ServerEvent::MemberStatusChanged {
                user_id,
                user_name,
                status,
                timestamp,
            } => {
                self.notify(
                    NotificationKind::StatusChange,
                    "Status Update",
                    format!("{user_name} is now {status}"),
                    event,
                );
                let record = self.record_mut(user_id)?;
                record.status = *status;
                record.last_update = Some(*timestamp);
                Ok(())
            }

            ServerEvent::MemberLocationUpdated {
                user_id,
                user_name,
                location,
                coordinates,
                timestamp,
            } => {
                self.notify(
                    NotificationKind::LocationUpdate,
                    "Location Update",
                    format!("{user_name} updated their location to {location}"),
                    event,
                );
                let record = self.record_mut(user_id)?;
                record.location = Some(location.clone());
                record.coordinates = *coordinates;
                record.last_update = Some(*timestamp);
                Ok(())
            }

            ServerEvent::MeetingNotification {
                kind,
                meeting,
                organizer,
                ..
            } => {
                let title = meeting
                    .get("title")
                    .and_then(|title| title.as_str())
                    .unwrap_or("untitled");
                self.notify(
                    NotificationKind::Meeting,
                    format!("Meeting {kind}"),
                    format!("{organizer} {kind} a meeting: {title}"),
                    event,
                );
                Ok(())
            }

            ServerEvent::MemberTyping {
                user_id, is_typing, ..
            } => {
                if *is_typing {
                    self.typing.insert(user_id.clone());
                } else {
                    self.typing.remove(user_id);
                }
                Ok(())
            }

            ServerEvent::TeamStatus {
                team_id,
                connected_members,
                total_connected,
            } => {
                self.members = connected_members
                    .iter()
                    .map(|member| {
                        let record = PresenceRecord::joined(
                            member.user_id.clone(),
                            member.user_name.clone(),
                            member.joined_at,
                        );
                        (member.user_id.clone(), record)
                    })
                    .collect();
                let members = &self.members;
                self.typing.retain(|user_id| members.contains_key(user_id));
                self.team_id = Some(team_id.clone());
                self.total_connected = *total_connected;
                Ok(())
            }

            ServerEvent::ConnectionConfirmed { .. } | ServerEvent::LivenessReply { .. } => Ok(()),
        }
    }

    /// Local teardown, e.g. after `disconnect()`. Notifications are kept.
    pub fn clear_presence(&mut self) {
        self.members.clear();
        self.typing.clear();
        self.team_id = None;
        self.total_connected = 0;
    }

    pub fn member(&self, user_id: &UserId) -> Option<&PresenceRecord> {
        self.members.get(user_id)
    }

    /// All known members, ordered by join time.
    pub fn members(&self) -> Vec<&PresenceRecord> {
        let mut members: Vec<&PresenceRecord> = self.members.values().collect();
        members.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        members
    }

    pub fn online_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_typing(&self, user_id: &UserId) -> bool {
        self.typing.contains(user_id)
    }

    pub fn typing_users(&self) -> Vec<&UserId> {
        let mut users: Vec<&UserId> = self.typing.iter().collect();
        users.sort();
        users
    }

    pub fn team_id(&self) -> Option<&TeamId> {
        self.team_id.as_ref()
    }

    /// Room size reported by the last `team-status`.
    pub fn total_connected(&self) -> usize {
        self.total_connected
    }

    /// Newest first.
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.feed.iter()
    }

    pub fn has_notifications(&self) -> bool {
        !self.feed.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.feed.unread_count()
    }

    pub fn mark_read(&mut self, id: u64) -> bool {
        self.feed.mark_read(id)
    }

    pub fn mark_all_read(&mut self) {
        self.feed.mark_all_read();
    }

    pub fn clear_notifications(&mut self) {
        self.feed.clear();
    }

    fn record_mut(&mut self, user_id: &UserId) -> Result<&mut PresenceRecord, PresenceError> {
        self.members
            .get_mut(user_id)
            .ok_or_else(|| PresenceError::StaleMemberReference(user_id.clone()))
    }

    fn notify(
        &mut self,
        kind: NotificationKind,
        title: impl Into<String>,
        message: String,
        event: &ServerEvent,
    ) {
        self.feed.push(kind, title, message, event.payload());
    }
}

// ───────────────────────────────────────────────────────────────────
// Binding
// ───────────────────────────────────────────────────────────────────

/// Events a bound store listens to.
const BOUND_EVENTS: [EventKind; 7] = [
    EventKind::MemberJoined,
    EventKind::MemberLeft,
    EventKind::MemberStatusChanged,
    EventKind::MemberLocationUpdated,
    EventKind::MeetingNotification,
    EventKind::MemberTyping,
    EventKind::TeamStatus,
];

/// A store fed by an adapter's subscriptions.
///
/// Dropping the binding (or calling `detach`) unsubscribes; the store stays
/// reachable through any handle obtained from `store()`. While attached,
/// members and typing flags are cleared whenever the adapter reports
/// `Disconnected`.
pub struct PresenceBinding {
    store: Arc<Mutex<PresenceStore>>,
    subscriptions: Vec<Subscription>,
    teardown: Option<JoinHandle<()>>,
}

impl PresenceBinding {
    pub fn attach(adapter: &TransportAdapter, store: PresenceStore) -> Self {
        let store = Arc::new(Mutex::new(store));

        let sink = Arc::clone(&store);
        let callback: EventCallback = Arc::new(move |event: &ServerEvent| {
            if let Err(e) = lock(&sink).apply(event) {
                log::debug!("Presence store skipped {}: {e}", event.kind());
            }
        });

        let subscriptions = BOUND_EVENTS
            .into_iter()
            .map(|kind| adapter.subscribe(kind, Arc::clone(&callback)))
            .collect();

        let teardown = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(clear_on_disconnect(
                adapter.status_changes(),
                Arc::downgrade(&store),
            ))),
            Err(_) => {
                log::debug!("No tokio runtime, presence will not be cleared on disconnect");
                None
            }
        };

        Self {
            store,
            subscriptions,
            teardown,
        }
    }

    /// Shared handle to the bound store.
    pub fn store(&self) -> Arc<Mutex<PresenceStore>> {
        Arc::clone(&self.store)
    }

    pub fn with_store<R>(&self, f: impl FnOnce(&mut PresenceStore) -> R) -> R {
        f(&mut lock(&self.store))
    }

    pub fn detach(mut self) {
        self.subscriptions.clear();
    }
}

impl Drop for PresenceBinding {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown.abort();
        }
    }
}

async fn clear_on_disconnect(
    mut status: watch::Receiver<ConnectionStatus>,
    store: Weak<Mutex<PresenceStore>>,
) {
    while status.changed().await.is_ok() {
        if *status.borrow_and_update() != ConnectionStatus::Disconnected {
            continue;
        }
        let Some(store) = store.upgrade() else {
            return;
        };
        lock(&store).clear_presence();
        log::debug!("Cleared presence after disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NOTIFICATION_CAPACITY;
    use crate::protocol::{MeetingEventKind, MemberSnapshot};
    use serde_json::json;

    fn joined(user: &str, name: &str) -> ServerEvent {
        ServerEvent::MemberJoined {
            user_id: UserId::from(user),
            user_name: name.into(),
            timestamp: Utc::now(),
        }
    }

    fn snapshot(user: &str, name: &str) -> MemberSnapshot {
        MemberSnapshot {
            user_id: UserId::from(user),
            user_name: name.into(),
            team_id: TeamId::from("7"),
            joined_at: Utc::now(),
        }
    }

    fn typing(user: &str, is_typing: bool) -> ServerEvent {
        ServerEvent::MemberTyping {
            user_id: UserId::from(user),
            user_name: user.into(),
            is_typing,
            context: "meeting-scheduler".into(),
        }
    }

    #[test]
    fn test_member_joined_inserts_online_record() {
        let mut store = PresenceStore::new();
        store.apply(&joined("1", "Alice")).unwrap();

        let record = store.member(&UserId::from("1")).unwrap();
        assert_eq!(record.status, MemberStatus::Online);
        assert_eq!(store.online_count(), 1);

        let notification = store.notifications().next().unwrap();
        assert_eq!(notification.kind, NotificationKind::MemberJoined);
        assert_eq!(notification.title, "Member Joined");
        assert_eq!(notification.message, "Alice joined the team");
        assert_eq!(notification.payload["userName"], "Alice");
        assert!(!notification.read);
    }

    #[test]
    fn test_member_left_clears_record_and_typing() {
        let mut store = PresenceStore::new();
        store.apply(&joined("1", "Alice")).unwrap();
        store.apply(&typing("1", true)).unwrap();
        assert!(store.is_typing(&UserId::from("1")));

        store
            .apply(&ServerEvent::MemberLeft {
                user_id: UserId::from("1"),
                user_name: "Alice".into(),
                timestamp: Utc::now(),
            })
            .unwrap();

        assert!(store.member(&UserId::from("1")).is_none());
        assert!(!store.is_typing(&UserId::from("1")));
        assert_eq!(store.notifications().next().unwrap().message, "Alice left the team");
    }

    #[test]
    fn test_status_change_patches_record() {
        let mut store = PresenceStore::new();
        store.apply(&joined("1", "Alice")).unwrap();
        store
            .apply(&ServerEvent::MemberStatusChanged {
                user_id: UserId::from("1"),
                user_name: "Alice".into(),
                status: MemberStatus::Busy,
                timestamp: Utc::now(),
            })
            .unwrap();

        let record = store.member(&UserId::from("1")).unwrap();
        assert_eq!(record.status, MemberStatus::Busy);
        assert!(record.last_update.is_some());
        assert_eq!(store.notifications().next().unwrap().message, "Alice is now busy");
    }

    #[test]
    fn test_stale_update_still_notifies() {
        let mut store = PresenceStore::new();
        let err = store
            .apply(&ServerEvent::MemberLocationUpdated {
                user_id: UserId::from("9"),
                user_name: "Ghost".into(),
                location: "Oslo".into(),
                coordinates: None,
                timestamp: Utc::now(),
            })
            .unwrap_err();

        assert_eq!(err, PresenceError::StaleMemberReference(UserId::from("9")));
        assert_eq!(store.online_count(), 0);
        assert_eq!(store.unread_count(), 1);
        assert_eq!(
            store.notifications().next().unwrap().message,
            "Ghost updated their location to Oslo"
        );
    }

    #[test]
    fn test_location_update_sets_coordinates() {
        let mut store = PresenceStore::new();
        store.apply(&joined("1", "Alice")).unwrap();
        store
            .apply(&ServerEvent::MemberLocationUpdated {
                user_id: UserId::from("1"),
                user_name: "Alice".into(),
                location: "Paris".into(),
                coordinates: Some(Coordinates(48.85, 2.35)),
                timestamp: Utc::now(),
            })
            .unwrap();

        let record = store.member(&UserId::from("1")).unwrap();
        assert_eq!(record.location.as_deref(), Some("Paris"));
        assert_eq!(record.coordinates, Some(Coordinates(48.85, 2.35)));
        assert_eq!(
            store.notifications().next().unwrap().kind,
            NotificationKind::LocationUpdate
        );
    }

    #[test]
    fn test_meeting_notification_only_notifies() {
        let mut store = PresenceStore::new();
        store
            .apply(&ServerEvent::MeetingNotification {
                kind: MeetingEventKind::Scheduled,
                meeting: json!({ "title": "Retro" }),
                organizer: "Bob".into(),
                timestamp: Utc::now(),
            })
            .unwrap();

        assert_eq!(store.online_count(), 0);
        let notification = store.notifications().next().unwrap();
        assert_eq!(notification.title, "Meeting scheduled");
        assert_eq!(notification.message, "Bob scheduled a meeting: Retro");
        assert_eq!(notification.payload["meeting"]["title"], "Retro");
    }

    #[test]
    fn test_team_status_replaces_records() {
        let mut store = PresenceStore::new();
        store.apply(&joined("9", "Stale")).unwrap();
        store.apply(&typing("9", true)).unwrap();
        store.apply(&typing("1", true)).unwrap();

        store
            .apply(&ServerEvent::TeamStatus {
                team_id: TeamId::from("7"),
                connected_members: vec![snapshot("1", "Alice"), snapshot("2", "Bob")],
                total_connected: 2,
            })
            .unwrap();

        assert_eq!(store.online_count(), 2);
        assert!(store.member(&UserId::from("9")).is_none());
        assert_eq!(store.typing_users(), vec![&UserId::from("1")]);
        assert_eq!(store.team_id(), Some(&TeamId::from("7")));
        assert_eq!(store.total_connected(), 2);
        // Resync is silent.
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn test_typing_toggles() {
        let mut store = PresenceStore::new();
        store.apply(&typing("1", true)).unwrap();
        store.apply(&typing("2", true)).unwrap();
        store.apply(&typing("1", false)).unwrap();
        assert_eq!(store.typing_users(), vec![&UserId::from("2")]);
        assert!(!store.has_notifications());
    }

    #[test]
    fn test_notification_feed_capped() {
        let mut store = PresenceStore::new();
        for i in 0..(NOTIFICATION_CAPACITY + 1) {
            store.apply(&joined(&i.to_string(), "Member")).unwrap();
        }
        assert_eq!(store.notifications().count(), NOTIFICATION_CAPACITY);

        store.mark_all_read();
        assert_eq!(store.unread_count(), 0);
        store.clear_notifications();
        assert!(!store.has_notifications());
    }

    #[test]
    fn test_clear_presence_keeps_notifications() {
        let mut store = PresenceStore::new();
        store.apply(&joined("1", "Alice")).unwrap();
        store.apply(&typing("1", true)).unwrap();

        store.clear_presence();
        assert_eq!(store.online_count(), 0);
        assert!(store.typing_users().is_empty());
        assert!(store.team_id().is_none());
        assert!(store.has_notifications());
    }

    #[tokio::test]
    async fn test_binding_clears_presence_on_disconnect() {
        use crate::client::{ClientConfig, ReconnectPolicy};

        let adapter = TransportAdapter::new(ClientConfig {
            reconnect: ReconnectPolicy {
                max_attempts: 0,
                ..ReconnectPolicy::default()
            },
            ..ClientConfig::new("ws://127.0.0.1:1")
        });
        let mut seeded = PresenceStore::new();
        seeded.apply(&joined("1", "Alice")).unwrap();
        seeded.apply(&typing("1", true)).unwrap();
        let binding = PresenceBinding::attach(&adapter, seeded);

        // A failed connect is not a disconnect.
        assert!(adapter.connect(None).await.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(binding.with_store(|s| s.online_count()), 1);

        adapter.disconnect();
        for _ in 0..50 {
            if binding.with_store(|s| s.online_count()) == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        binding.with_store(|store| {
            assert_eq!(store.online_count(), 0);
            assert!(store.typing_users().is_empty());
            assert!(store.has_notifications());
        });
    }
}
