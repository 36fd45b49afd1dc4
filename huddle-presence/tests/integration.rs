//! Integration tests for the presence server.
//!
//! These tests start a real server on an ephemeral port and drive it with
//! raw WebSocket sockets, checking exactly which frames each socket sees.

use futures_util::{SinkExt, StreamExt};
use huddle_presence::protocol::{ClientAction, Coordinates, MemberStatus, ServerEvent};
use huddle_presence::router::{HubStats, PresenceHub};
use huddle_presence::server::{PresenceServer, ServerConfig};
use huddle_presence::{TeamId, UserId};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return its URL and hub.
async fn start_test_server(config: ServerConfig) -> (String, Arc<PresenceHub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = PresenceServer::new(config);
    let hub = server.hub();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (url, hub)
}

async fn start_default_server() -> (String, Arc<PresenceHub>) {
    start_test_server(ServerConfig::default()).await
}

/// Open a socket and consume its `connection-confirmed`.
async fn connect(url: &str) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    match recv(&mut ws).await {
        ServerEvent::ConnectionConfirmed { .. } => ws,
        other => panic!("Expected ConnectionConfirmed, got {other:?}"),
    }
}

async fn send(ws: &mut Ws, action: ClientAction) {
    ws.send(Message::Text(action.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Ws) -> ServerEvent {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Should receive a frame within timeout")
            .expect("Socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerEvent::decode(text.as_str()).unwrap();
        }
    }
}

/// Assert nothing arrives for a short while.
async fn assert_silent(ws: &mut Ws) {
    let result = timeout(Duration::from_millis(150), ws.next()).await;
    assert!(result.is_err(), "Expected no frame, got {result:?}");
}

fn join(team: &str, user: &str, name: &str) -> ClientAction {
    ClientAction::JoinTeam {
        team_id: TeamId::from(team),
        user_id: UserId::from(user),
        user_name: name.into(),
    }
}

/// Connect and join, consuming the joiner's `team-status`.
async fn joined(url: &str, team: &str, user: &str, name: &str) -> Ws {
    let mut ws = connect(url).await;
    send(&mut ws, join(team, user, name)).await;
    match recv(&mut ws).await {
        ServerEvent::TeamStatus { .. } => ws,
        other => panic!("Expected TeamStatus, got {other:?}"),
    }
}

async fn wait_for_stats(hub: &PresenceHub, predicate: impl Fn(&HubStats) -> bool) -> HubStats {
    for _ in 0..100 {
        let stats = hub.stats().await;
        if predicate(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Stats never matched: {:?}", hub.stats().await);
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, hub) = start_default_server().await;
    let _ws = connect(&url).await;

    let stats = wait_for_stats(&hub, |s| s.total_connected == 1).await;
    assert_eq!(stats.unjoined, 1);
    assert_eq!(stats.total_connections, 1);
}

#[tokio::test]
async fn test_team_status_includes_joiner() {
    let (url, _hub) = start_default_server().await;

    let mut alice = connect(&url).await;
    send(&mut alice, join("7", "1", "Alice")).await;
    match recv(&mut alice).await {
        ServerEvent::TeamStatus {
            team_id,
            connected_members,
            total_connected,
        } => {
            assert_eq!(team_id, TeamId::from("7"));
            assert_eq!(total_connected, 1);
            assert_eq!(connected_members.len(), 1);
            assert_eq!(connected_members[0].user_id, UserId::from("1"));
        }
        other => panic!("Expected TeamStatus, got {other:?}"),
    }

    let mut bob = connect(&url).await;
    send(&mut bob, join("7", "2", "Bob")).await;

    match recv(&mut alice).await {
        ServerEvent::MemberJoined {
            user_id, user_name, ..
        } => {
            assert_eq!(user_id, UserId::from("2"));
            assert_eq!(user_name, "Bob");
        }
        other => panic!("Expected MemberJoined, got {other:?}"),
    }
    match recv(&mut bob).await {
        ServerEvent::TeamStatus {
            connected_members,
            total_connected,
            ..
        } => {
            assert_eq!(total_connected, 2);
            let ids: Vec<&str> = connected_members.iter().map(|m| m.user_id.as_str()).collect();
            assert_eq!(ids, vec!["1", "2"]);
        }
        other => panic!("Expected TeamStatus, got {other:?}"),
    }

    // The joiner never hears about itself.
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_location_relayed_to_others_only() {
    let (url, _hub) = start_default_server().await;
    let mut alice = joined(&url, "7", "1", "Alice").await;
    let mut bob = joined(&url, "7", "2", "Bob").await;
    let _ = recv(&mut alice).await; // member-joined for Bob

    send(
        &mut alice,
        ClientAction::LocationUpdate {
            location: "Paris".into(),
            coordinates: Some(Coordinates(48.85, 2.35)),
        },
    )
    .await;

    match recv(&mut bob).await {
        ServerEvent::MemberLocationUpdated {
            user_id,
            user_name,
            location,
            coordinates,
            ..
        } => {
            assert_eq!(user_id, UserId::from("1"));
            assert_eq!(user_name, "Alice");
            assert_eq!(location, "Paris");
            assert_eq!(coordinates, Some(Coordinates(48.85, 2.35)));
        }
        other => panic!("Expected MemberLocationUpdated, got {other:?}"),
    }
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, _hub) = start_default_server().await;
    let mut alice = joined(&url, "7", "1", "Alice").await;
    let mut carol = joined(&url, "8", "3", "Carol").await;

    send(
        &mut alice,
        ClientAction::MemberStatusUpdate {
            status: MemberStatus::Busy,
        },
    )
    .await;

    assert_silent(&mut carol).await;
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_status_before_join_is_noop() {
    let (url, hub) = start_default_server().await;
    let mut alice = joined(&url, "7", "1", "Alice").await;
    let mut bob = connect(&url).await;

    let update = ClientAction::MemberStatusUpdate {
        status: MemberStatus::Away,
    };
    send(&mut bob, update.clone()).await;
    send(
        &mut bob,
        ClientAction::Announce {
            user_id: UserId::from("2"),
            user_name: "Bob".into(),
        },
    )
    .await;
    send(&mut bob, update).await;

    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;

    let stats = hub.stats().await;
    assert_eq!(stats.total_connected, 2);
    assert_eq!(stats.unjoined, 1);
}

#[tokio::test]
async fn test_liveness_probe_reply() {
    let (url, _hub) = start_default_server().await;
    let mut alice = connect(&url).await;

    send(&mut alice, ClientAction::LivenessProbe).await;
    assert!(matches!(recv(&mut alice).await, ServerEvent::LivenessReply { .. }));
}

#[tokio::test]
async fn test_liveness_probe_with_empty_payload() {
    let (url, _hub) = start_default_server().await;
    let mut alice = connect(&url).await;

    alice
        .send(Message::Text(r#"{"event":"liveness-probe","data":{}}"#.to_string().into()))
        .await
        .unwrap();
    assert!(matches!(recv(&mut alice).await, ServerEvent::LivenessReply { .. }));
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let (url, _hub) = start_default_server().await;
    let mut alice = connect(&url).await;

    alice
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    alice
        .send(Message::Text(r#"{"event":"teleport","data":{}}"#.to_string().into()))
        .await
        .unwrap();
    send(&mut alice, ClientAction::LivenessProbe).await;

    assert!(matches!(recv(&mut alice).await, ServerEvent::LivenessReply { .. }));
}

#[tokio::test]
async fn test_leave_team_notifies_room() {
    let (url, hub) = start_default_server().await;
    let mut alice = joined(&url, "7", "1", "Alice").await;
    let mut bob = joined(&url, "7", "2", "Bob").await;
    let _ = recv(&mut alice).await;

    send(&mut bob, ClientAction::LeaveTeam).await;
    match recv(&mut alice).await {
        ServerEvent::MemberLeft { user_id, .. } => assert_eq!(user_id, UserId::from("2")),
        other => panic!("Expected MemberLeft, got {other:?}"),
    }

    let stats = wait_for_stats(&hub, |s| s.unjoined == 1).await;
    assert_eq!(stats.total_connected, 2);
    assert_eq!(stats.connections_by_team.get(&TeamId::from("7")), Some(&1));
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_disconnect_without_join_leaves_no_residue() {
    let (url, hub) = start_default_server().await;
    let mut alice = joined(&url, "7", "1", "Alice").await;

    let mut bob = connect(&url).await;
    bob.close(None).await.unwrap();

    let stats = wait_for_stats(&hub, |s| s.total_connected == 1).await;
    assert_eq!(stats.unjoined, 0);
    assert_eq!(stats.active_teams, 1);
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_close_announces_departure_and_deletes_room() {
    let (url, hub) = start_default_server().await;
    let mut alice = joined(&url, "7", "1", "Alice").await;
    let mut bob = joined(&url, "7", "2", "Bob").await;
    let _ = recv(&mut alice).await;

    bob.close(None).await.unwrap();
    match recv(&mut alice).await {
        ServerEvent::MemberLeft { user_name, .. } => assert_eq!(user_name, "Bob"),
        other => panic!("Expected MemberLeft, got {other:?}"),
    }

    alice.close(None).await.unwrap();
    wait_for_stats(&hub, |s| s.total_connected == 0 && s.active_teams == 0).await;
}

#[tokio::test]
async fn test_silent_connection_evicted() {
    let config = ServerConfig {
        liveness_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let (url, hub) = start_test_server(config).await;

    // Alice joins and then never sends another frame.
    let _alice = joined(&url, "7", "1", "Alice").await;
    let mut bob = joined(&url, "7", "2", "Bob").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut saw_left = false;
    while tokio::time::Instant::now() < deadline {
        send(&mut bob, ClientAction::LivenessProbe).await;
        match recv(&mut bob).await {
            ServerEvent::MemberLeft { user_id, .. } => {
                assert_eq!(user_id, UserId::from("1"));
                saw_left = true;
                break;
            }
            ServerEvent::LivenessReply { .. } => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            other => panic!("Unexpected event {other:?}"),
        }
    }
    assert!(saw_left, "Bob should see Alice evicted");

    let roster = hub.team_roster(&TeamId::from("7")).await;
    assert_eq!(roster.count, 1);
    assert_eq!(roster.connected_users[0].user_name, "Bob");

    bob.close(None).await.unwrap();
    wait_for_stats(&hub, |s| s.active_teams == 0).await;
}
