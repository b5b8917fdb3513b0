//! Room session lifecycle against an in-process room server
//!
//! Run with: cargo test -p huddle-client --test room_session

mod common;

use common::{wait_until, EventLog, MockConnector, MockEngine, Script, ServerHandle};
use huddle_client::config::SignalingSettings;
use huddle_client::{JoinOptions, RoomClient, RoomEvent, RoomState, SessionError};
use huddle_protocol::{MediaKind, Outcome};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn settings() -> SignalingSettings {
    SignalingSettings {
        secure: false,
        request_timeout_ms: 2_000,
        ..Default::default()
    }
}

fn watch_only() -> JoinOptions {
    JoinOptions {
        produce: false,
        consume: false,
        use_data_channel: false,
        ..Default::default()
    }
}

fn new_room() -> (RoomClient, mpsc::UnboundedReceiver<common::Connection>) {
    let (connector, connections) = MockConnector::new();
    let room = RoomClient::new(Arc::new(MockEngine::default()), connector, settings());
    (room, connections)
}

fn count_state(events: &[RoomEvent], state: RoomState) -> usize {
    events
        .iter()
        .filter(|e| **e == RoomEvent::RoomStateChanged(state))
        .count()
}

#[tokio::test]
async fn test_join_reaches_connected_once() {
    let (room, mut connections) = new_room();
    let log = EventLog::attach(&room);

    assert!(room.join("localhost", 4443, "standup", "alice", Some(watch_only())));
    assert_eq!(room.state(), RoomState::Connecting);

    let server = ServerHandle::accept(
        &mut connections,
        Script::with_peers(&[("bob", "Bob"), ("carol", "Carol")]),
    )
    .await;
    assert!(server.url.starts_with("ws://localhost:4443/?roomId=standup&peerId="));

    wait_until(|| room.state() == RoomState::Connected).await;

    let events = log.snapshot().await;
    assert_eq!(count_state(&events, RoomState::Connected), 1);
    assert_eq!(server.methods(), vec!["getRouterRtpCapabilities", "join"]);

    let join = &server.requests_for("join")[0];
    assert_eq!(join["displayName"], "alice");
    assert!(join["rtpCapabilities"]["codecs"].is_array());
    assert!(join.get("sctpCapabilities").is_none());

    let mut names: Vec<String> = room
        .participants()
        .into_iter()
        .map(|p| p.display_name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["Bob", "Carol"]);
}

#[tokio::test]
async fn test_join_and_leave_are_idempotent() {
    let (room, mut connections) = new_room();
    let log = EventLog::attach(&room);

    assert!(room.join("localhost", 4443, "r", "alice", Some(watch_only())));
    assert!(!room.join("localhost", 4443, "r", "alice", Some(watch_only())));

    let _server =
        ServerHandle::accept(&mut connections, Script::with_peers(&[("bob", "Bob")])).await;
    wait_until(|| room.state() == RoomState::Connected).await;

    assert!(room.leave());
    assert_eq!(room.state(), RoomState::Closed);
    assert!(!room.leave());

    wait_until(|| room.participants().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = log.snapshot().await;
    assert_eq!(count_state(&events, RoomState::Connecting), 1);
    assert_eq!(count_state(&events, RoomState::Connected), 1);
    assert_eq!(count_state(&events, RoomState::Closed), 1);
}

#[tokio::test]
async fn test_rejoin_after_leave() {
    let (room, mut connections) = new_room();

    room.join("localhost", 4443, "r", "alice", Some(watch_only()));
    let _first =
        ServerHandle::accept(&mut connections, Script::with_peers(&[("bob", "Bob")])).await;
    wait_until(|| room.state() == RoomState::Connected).await;
    room.leave();

    assert!(room.join("localhost", 4443, "r", "alice", Some(watch_only())));
    let _second =
        ServerHandle::accept(&mut connections, Script::with_peers(&[("dave", "Dave")])).await;
    wait_until(|| room.state() == RoomState::Connected).await;

    wait_until(|| room.participant("dave").is_some()).await;
    assert!(room.participant("bob").is_none());
}

#[tokio::test]
async fn test_notifications_update_participants() {
    let (room, mut connections) = new_room();
    let log = EventLog::attach(&room);

    room.join("localhost", 4443, "r", "alice", Some(watch_only()));
    let server =
        ServerHandle::accept(&mut connections, Script::with_peers(&[("bob", "Bob")])).await;
    wait_until(|| room.state() == RoomState::Connected).await;

    server.notify("newPeer", json!({ "id": "carol", "displayName": "Carol" }));
    wait_until(|| room.participant("carol").is_some()).await;

    server.notify(
        "peerDisplayNameChanged",
        json!({ "peerId": "bob", "displayName": "Robert", "oldDisplayName": "Bob" }),
    );
    wait_until(|| room.participant("bob").is_some_and(|p| p.display_name == "Robert")).await;

    server.notify("activeSpeaker", json!({ "peerId": "bob", "volume": -20 }));
    wait_until(|| room.active_speaker().as_deref() == Some("bob")).await;
    assert_eq!(room.speaking_volume("bob"), Some(-20));

    server.notify("peerClosed", json!({ "peerId": "carol" }));
    wait_until(|| room.participant("carol").is_none()).await;

    // Unknown notifications are ignored
    server.notify("somethingNew", json!({}));

    let events = log.snapshot().await;
    assert!(events.iter().any(|e| matches!(
        e,
        RoomEvent::DisplayNameChanged { peer_id, display_name, old_display_name }
            if peer_id == "bob" && display_name == "Robert" && old_display_name == "Bob"
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, RoomEvent::ParticipantLeft { peer_id } if peer_id == "carol")));
    assert_eq!(room.state(), RoomState::Connected);
}

#[tokio::test]
async fn test_new_consumer_creates_track() {
    let (room, mut connections) = new_room();
    let options = JoinOptions {
        produce: false,
        consume: true,
        use_data_channel: false,
        ..Default::default()
    };

    room.join("localhost", 4443, "r", "alice", Some(options));
    let mut server =
        ServerHandle::accept(&mut connections, Script::with_peers(&[("bob", "Bob")])).await;
    wait_until(|| room.state() == RoomState::Connected).await;
    assert_eq!(
        server.methods(),
        vec!["getRouterRtpCapabilities", "createWebRtcTransport", "join"]
    );
    assert_eq!(server.requests_for("createWebRtcTransport")[0]["consuming"], true);
    assert!(room.participant("bob").unwrap().audio_muted);

    let response = server
        .request(
            "newConsumer",
            json!({
                "peerId": "bob",
                "producerId": "bob-mic",
                "id": "consumer-1",
                "kind": "audio",
                "rtpParameters": {},
                "type": "simple",
                "appData": {},
                "producerPaused": false
            }),
        )
        .await;
    assert!(matches!(response.outcome, Outcome::Ok(_)));
    assert_eq!(server.methods().last().unwrap(), "connectWebRtcTransport");

    let bob = room.participant("bob").unwrap();
    assert!(bob.audio_tracks.contains_key("consumer-1"));
    assert!(!bob.audio_muted);

    server.notify("consumerPaused", json!({ "consumerId": "consumer-1" }));
    wait_until(|| room.participant("bob").is_some_and(|p| p.audio_muted)).await;

    room.pause_consumer("consumer-1").await.unwrap();
    assert!(server.requests_for("pauseConsumer")[0]["consumerId"] == "consumer-1");

    room.set_consumer_preferred_layers("consumer-1", 2, Some(1))
        .await
        .unwrap();
    let layers = &server.requests_for("setConsumerPreferredLayers")[0];
    assert_eq!(layers["consumerId"], "consumer-1");
    assert_eq!(layers["spatialLayer"], 2);
    assert_eq!(layers["temporalLayer"], 1);

    server.notify("consumerClosed", json!({ "consumerId": "consumer-1" }));
    wait_until(|| {
        room.participant("bob")
            .is_some_and(|p| p.audio_tracks.is_empty())
    })
    .await;

    assert!(matches!(
        room.pause_consumer("consumer-1").await,
        Err(SessionError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_data_consumer_refused_without_data_channels() {
    let (room, mut connections) = new_room();
    let options = JoinOptions {
        produce: false,
        consume: true,
        use_data_channel: false,
        ..Default::default()
    };

    room.join("localhost", 4443, "r", "alice", Some(options));
    let mut server =
        ServerHandle::accept(&mut connections, Script::with_peers(&[("bob", "Bob")])).await;
    wait_until(|| room.state() == RoomState::Connected).await;

    let response = server
        .request(
            "newDataConsumer",
            json!({
                "peerId": "bob",
                "dataProducerId": "dp",
                "id": "dc-1",
                "sctpStreamParameters": {},
                "label": "chat",
                "protocol": "chat",
                "appData": {}
            }),
        )
        .await;
    assert!(matches!(response.outcome, Outcome::Error { code: 403, .. }));

    let unknown = server.request("mystery", json!({})).await;
    assert!(matches!(unknown.outcome, Outcome::Error { code: 500, .. }));
}

#[tokio::test]
async fn test_server_close_emits_closed() {
    let (room, mut connections) = new_room();
    let log = EventLog::attach(&room);

    room.join("localhost", 4443, "r", "alice", Some(watch_only()));
    let mut server =
        ServerHandle::accept(&mut connections, Script::with_peers(&[("bob", "Bob")])).await;
    wait_until(|| room.state() == RoomState::Connected).await;

    server.close();
    wait_until(|| room.state() == RoomState::Closed).await;
    wait_until(|| room.participants().is_empty()).await;

    // A later leave has nothing left to do
    assert!(!room.leave());

    let events = log.snapshot().await;
    assert_eq!(count_state(&events, RoomState::Closed), 1);
}

#[tokio::test]
async fn test_failed_handshake_stays_connecting() {
    let (room, mut connections) = new_room();
    let log = EventLog::attach(&room);

    room.join("localhost", 4443, "r", "alice", Some(watch_only()));
    let server = ServerHandle::accept(&mut connections, Script::failing_join()).await;

    wait_until(|| server.methods().contains(&"join".to_string())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(room.state(), RoomState::Connecting);

    assert!(matches!(
        room.enable_audio().await,
        Err(SessionError::InvalidState {
            expected: RoomState::Connected,
            actual: RoomState::Connecting
        })
    ));

    assert!(room.leave());
    let events = log.snapshot().await;
    assert_eq!(count_state(&events, RoomState::Connected), 0);
    assert_eq!(count_state(&events, RoomState::Closed), 1);
}

#[tokio::test]
async fn test_failed_handshake_answers_peer_requests() {
    let (room, mut connections) = new_room();
    let options = JoinOptions {
        produce: false,
        consume: true,
        use_data_channel: false,
        ..Default::default()
    };

    room.join("localhost", 4443, "r", "alice", Some(options));
    let mut server = ServerHandle::accept(&mut connections, Script::failing_join()).await;
    wait_until(|| server.methods().contains(&"join".to_string())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = server
        .request(
            "newConsumer",
            json!({
                "peerId": "bob",
                "producerId": "bob-mic",
                "id": "consumer-1",
                "kind": "audio",
                "rtpParameters": {},
                "type": "simple",
                "appData": {},
                "producerPaused": false
            }),
        )
        .await;
    assert!(matches!(response.outcome, Outcome::Error { code: 500, .. }));
    assert!(room.participant("bob").is_none());
    assert_eq!(room.state(), RoomState::Connecting);
}

#[tokio::test]
async fn test_failure_of_left_session_spares_rejoin() {
    let (room, mut connections) = new_room();
    let log = EventLog::attach(&room);

    room.join("localhost", 4443, "r", "alice", Some(watch_only()));
    let first = ServerHandle::accept(&mut connections, Script::failing_join()).await;
    wait_until(|| first.methods().contains(&"join".to_string())).await;
    assert!(room.leave());

    room.join("localhost", 4443, "r", "alice", Some(watch_only()));
    let _second =
        ServerHandle::accept(&mut connections, Script::with_peers(&[("bob", "Bob")])).await;
    wait_until(|| room.state() == RoomState::Connected).await;
    wait_until(|| room.participant("bob").is_some()).await;

    let events = log.snapshot().await;
    assert_eq!(count_state(&events, RoomState::Connected), 1);
    assert_eq!(count_state(&events, RoomState::Closed), 1);
}

#[tokio::test]
async fn test_local_audio_controls() {
    let (room, mut connections) = new_room();
    let log = EventLog::attach(&room);
    let options = JoinOptions {
        produce: true,
        consume: false,
        use_data_channel: false,
        audio: false,
        video: false,
        ..Default::default()
    };

    room.join("localhost", 4443, "r", "alice", Some(options));
    let server = ServerHandle::accept(&mut connections, Script::with_peers(&[])).await;
    wait_until(|| room.state() == RoomState::Connected).await;
    assert!(server.requests_for("produce").is_empty());

    room.enable_audio().await.unwrap();
    let produce = server.requests_for("produce");
    assert_eq!(produce.len(), 1);
    assert_eq!(produce[0]["kind"], "audio");
    assert_eq!(produce[0]["transportId"], "transport-0");
    assert_eq!(server.requests_for("connectWebRtcTransport").len(), 1);

    // Enabling twice keeps the existing producer
    room.enable_audio().await.unwrap();
    assert_eq!(server.requests_for("produce").len(), 1);

    room.mute_audio().await.unwrap();
    assert_eq!(
        server.requests_for("pauseProducer"),
        vec![json!({ "producerId": "producer-audio" })]
    );
    room.unmute_audio().await.unwrap();
    assert_eq!(server.requests_for("resumeProducer").len(), 1);

    let stats = room.producer_stats(MediaKind::Audio).await.unwrap();
    assert_eq!(stats, json!({}));

    room.disable_audio().await.unwrap();
    assert_eq!(
        server.requests_for("closeProducer"),
        vec![json!({ "producerId": "producer-audio" })]
    );
    assert!(matches!(
        room.mute_audio().await,
        Err(SessionError::NotFound(_))
    ));

    let events = log.snapshot().await;
    let local: Vec<(Option<String>, bool)> = events
        .into_iter()
        .filter_map(|e| match e {
            RoomEvent::LocalTrackChanged {
                kind: MediaKind::Audio,
                producer_id,
                paused,
            } => Some((producer_id, paused)),
            _ => None,
        })
        .collect();
    assert_eq!(
        local,
        vec![
            (Some("producer-audio".to_string()), false),
            (Some("producer-audio".to_string()), true),
            (Some("producer-audio".to_string()), false),
            (None, false),
        ]
    );
}

#[tokio::test]
async fn test_produce_on_join() {
    let (room, mut connections) = new_room();
    let options = JoinOptions {
        produce: true,
        consume: true,
        use_data_channel: true,
        audio: true,
        video: false,
        ..Default::default()
    };

    room.join("localhost", 4443, "r", "alice", Some(options));
    let server = ServerHandle::accept(&mut connections, Script::with_peers(&[])).await;
    wait_until(|| room.state() == RoomState::Connected).await;
    wait_until(|| !server.requests_for("produceData").is_empty()).await;

    let transports = server.requests_for("createWebRtcTransport");
    assert_eq!(transports.len(), 2);
    assert_eq!(transports[0]["producing"], true);
    assert!(transports[0]["sctpCapabilities"].is_object());

    let produce = server.requests_for("produce");
    assert_eq!(produce.len(), 1);
    assert_eq!(produce[0]["kind"], "audio");
    assert_eq!(server.requests_for("produceData")[0]["label"], "chat");

    let stats = room.data_producer_stats().await.unwrap();
    assert_eq!(stats, json!({}));
    assert_eq!(
        server.requests_for("getDataProducerStats"),
        vec![json!({ "dataProducerId": "data-producer-1" })]
    );
}

#[tokio::test]
async fn test_commands_require_connected_room() {
    let (room, _connections) = new_room();

    assert!(matches!(
        room.restart_ice().await,
        Err(SessionError::InvalidState {
            expected: RoomState::Connected,
            actual: RoomState::Closed
        })
    ));
    assert!(matches!(
        room.change_display_name("bob").await,
        Err(SessionError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_change_display_name_and_restart_ice() {
    let (room, mut connections) = new_room();
    let options = JoinOptions {
        produce: false,
        consume: true,
        use_data_channel: false,
        ..Default::default()
    };

    room.join("localhost", 4443, "r", "alice", Some(options));
    let server = ServerHandle::accept(&mut connections, Script::with_peers(&[])).await;
    wait_until(|| room.state() == RoomState::Connected).await;

    room.change_display_name("Alicia").await.unwrap();
    assert_eq!(
        server.requests_for("changeDisplayName"),
        vec![json!({ "displayName": "Alicia" })]
    );
    assert_eq!(room.display_name(), "Alicia");

    // The mock answers restartIce with {}, which has no iceParameters
    assert!(room.restart_ice().await.is_err());
    assert_eq!(
        server.requests_for("restartIce"),
        vec![json!({ "transportId": "transport-0" })]
    );
}
