//! Room session: lifecycle state, the caller-facing facade and the actor
//! that drives signaling and the media engine

mod bridge;
mod session;

use huddle_protocol::{MediaKind, NetworkThrottle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::{random_peer_id, ClientSettings, SignalingSettings};
use crate::dispatch::{Dispatcher, Observer, ObserverHub};
use crate::error::{Result, SessionError};
use crate::media::MediaEngine;
use crate::network::Connector;
use crate::state::{Participant, ParticipantRegistry, RoomEvent};

pub use bridge::SignalingBridge;
use session::{Command, Session, StatsTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomState {
    Closed,
    Connecting,
    Connected,
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomState::Closed => write!(f, "closed"),
            RoomState::Connecting => write!(f, "connecting"),
            RoomState::Connected => write!(f, "connected"),
        }
    }
}

/// What the local peer does once in the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinOptions {
    /// Create a send transport and publish local media
    pub produce: bool,
    /// Create a receive transport and accept remote media
    pub consume: bool,
    pub force_tcp: bool,
    pub use_data_channel: bool,
    /// Publish audio right after joining
    pub audio: bool,
    /// Publish video right after joining
    pub video: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            produce: true,
            consume: true,
            force_tcp: false,
            use_data_channel: true,
            audio: true,
            video: true,
        }
    }
}

/// Everything `join` needs to reach a room
#[derive(Debug, Clone)]
pub struct JoinParams {
    pub host: String,
    pub port: u16,
    pub room_id: String,
    pub peer_id: String,
    pub display_name: String,
    pub options: JoinOptions,
}

impl JoinParams {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            room_id: settings.room_id.clone(),
            peer_id: settings.resolved_peer_id(),
            display_name: settings.display_name.clone(),
            options: settings.join.clone(),
        }
    }
}

/// Signaling URL of a room
pub fn room_url(host: &str, port: u16, room_id: &str, peer_id: &str, secure: bool) -> String {
    format!(
        "{}://{}:{}/?roomId={}&peerId={}",
        if secure { "wss" } else { "ws" },
        host,
        port,
        urlencoding::encode(room_id),
        urlencoding::encode(peer_id)
    )
}

struct Lifecycle {
    state: RoomState,
    /// Bumped by every join, leave and closure; work tagged with an older
    /// epoch is stale
    epoch: u64,
    peer_id: Option<String>,
    display_name: String,
}

/// State shared between the facade and the session actor
pub(crate) struct SessionShared {
    lifecycle: Mutex<Lifecycle>,
    events: Arc<ObserverHub<RoomEvent>>,
    registry: ParticipantRegistry,
}

impl SessionShared {
    fn new() -> Self {
        let events = Arc::new(ObserverHub::new());
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: RoomState::Closed,
                epoch: 0,
                peer_id: None,
                display_name: String::new(),
            }),
            registry: ParticipantRegistry::new(events.clone()),
            events,
        }
    }

    pub(crate) fn state(&self) -> RoomState {
        self.lifecycle.lock().state
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.lifecycle.lock().epoch == epoch
    }

    pub(crate) fn events(&self) -> &ObserverHub<RoomEvent> {
        &self.events
    }

    pub(crate) fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub(crate) fn set_display_name(&self, display_name: &str) {
        self.lifecycle.lock().display_name = display_name.to_string();
    }

    /// CLOSED -> CONNECTING. Returns the new epoch.
    fn begin_join(&self, params: &JoinParams) -> Option<u64> {
        let epoch = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != RoomState::Closed {
                tracing::warn!(state = %lifecycle.state, "Ignoring join, room is not closed");
                return None;
            }
            lifecycle.state = RoomState::Connecting;
            lifecycle.epoch += 1;
            lifecycle.peer_id = Some(params.peer_id.clone());
            lifecycle.display_name = params.display_name.clone();
            lifecycle.epoch
        };

        self.events
            .notify(RoomEvent::RoomStateChanged(RoomState::Connecting));
        Some(epoch)
    }

    /// Any state -> CLOSED, at most once per session
    fn begin_leave(&self) -> bool {
        self.close(None)
    }

    /// Closes the room, only if it still belongs to `epoch` when one is given
    fn close(&self, epoch: Option<u64>) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == RoomState::Closed
                || epoch.is_some_and(|epoch| epoch != lifecycle.epoch)
            {
                return false;
            }
            lifecycle.state = RoomState::Closed;
            lifecycle.epoch += 1;
        }

        self.events
            .notify(RoomEvent::RoomStateChanged(RoomState::Closed));
        true
    }

    /// CONNECTING -> CONNECTED for the session started at `epoch`
    pub(crate) fn mark_connected(&self, epoch: u64) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.epoch != epoch || lifecycle.state != RoomState::Connecting {
                return false;
            }
            lifecycle.state = RoomState::Connected;
        }

        self.events
            .notify(RoomEvent::RoomStateChanged(RoomState::Connected));
        true
    }

    /// Transport closure of the session started at `epoch`
    pub(crate) fn mark_closed(&self, epoch: u64) -> bool {
        self.close(Some(epoch))
    }
}

/// Caller-facing handle to one room session
///
/// `join` and `leave` flip the room state synchronously; everything else is
/// marshalled onto the session actor. Cloning yields another handle to the
/// same session, which shuts down once every handle is dropped.
#[derive(Clone)]
pub struct RoomClient {
    shared: Arc<SessionShared>,
    sender: mpsc::UnboundedSender<Command>,
}

impl RoomClient {
    /// Spawn the session actor on the current tokio runtime
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        connector: Arc<dyn Connector>,
        settings: SignalingSettings,
    ) -> Self {
        let shared = Arc::new(SessionShared::new());
        let sender = Session::spawn(shared.clone(), engine, connector, settings);
        Self { shared, sender }
    }

    pub fn state(&self) -> RoomState {
        self.shared.state()
    }

    /// Local peer id of the current or last session
    pub fn peer_id(&self) -> Option<String> {
        self.shared.lifecycle.lock().peer_id.clone()
    }

    pub fn display_name(&self) -> String {
        self.shared.lifecycle.lock().display_name.clone()
    }

    /// Start joining a room with a random peer id. A no-op returning false
    /// unless the room is closed.
    pub fn join(
        &self,
        host: &str,
        port: u16,
        room_id: &str,
        display_name: &str,
        options: Option<JoinOptions>,
    ) -> bool {
        self.join_with(JoinParams {
            host: host.to_string(),
            port,
            room_id: room_id.to_string(),
            peer_id: random_peer_id(),
            display_name: display_name.to_string(),
            options: options.unwrap_or_default(),
        })
    }

    pub fn join_with(&self, params: JoinParams) -> bool {
        let Some(epoch) = self.shared.begin_join(&params) else {
            return false;
        };
        tracing::info!(room_id = %params.room_id, peer_id = %params.peer_id, epoch, "Joining room");

        if self.sender.send(Command::Join { epoch, params }).is_err() {
            tracing::error!("Room session is gone, cannot join");
            self.shared.mark_closed(epoch);
            return false;
        }
        true
    }

    /// Leave the room. The state is CLOSED when this returns; teardown
    /// continues in the background. A no-op returning false when closed.
    pub fn leave(&self) -> bool {
        if !self.shared.begin_leave() {
            return false;
        }
        tracing::info!("Leaving room");
        let _ = self.sender.send(Command::Leave);
        true
    }

    pub fn events(&self) -> &ObserverHub<RoomEvent> {
        self.shared.events()
    }

    /// Deliver room events to `observer` on `target`
    pub fn subscribe(&self, observer: Arc<dyn Observer<RoomEvent>>, target: &Dispatcher) -> bool {
        self.shared.events().register(observer, target, None)
    }

    /// Like [`Self::subscribe`] without keeping the observer alive
    pub fn subscribe_weak(
        &self,
        observer: &Arc<dyn Observer<RoomEvent>>,
        target: &Dispatcher,
    ) -> bool {
        self.shared.events().register_weak(observer, target, None)
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn Observer<RoomEvent>>) -> bool {
        self.shared.events().remove(observer)
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.shared.registry().participants()
    }

    pub fn participant(&self, peer_id: &str) -> Option<Participant> {
        self.shared.registry().get(peer_id)
    }

    pub fn speaking_volume(&self, peer_id: &str) -> Option<i32> {
        self.shared.registry().speaking_volume(peer_id)
    }

    pub fn active_speaker(&self) -> Option<String> {
        self.shared.registry().active_speaker()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| SessionError::ActorGone)?;
        rx.await.map_err(|_| SessionError::ActorGone)?
    }

    pub async fn enable_audio(&self) -> Result<()> {
        self.set_media(MediaKind::Audio, true).await
    }

    pub async fn disable_audio(&self) -> Result<()> {
        self.set_media(MediaKind::Audio, false).await
    }

    pub async fn enable_video(&self) -> Result<()> {
        self.set_media(MediaKind::Video, true).await
    }

    pub async fn disable_video(&self) -> Result<()> {
        self.set_media(MediaKind::Video, false).await
    }

    async fn set_media(&self, kind: MediaKind, enabled: bool) -> Result<()> {
        self.call(|respond_to| Command::SetMedia {
            kind,
            enabled,
            respond_to,
        })
        .await
    }

    pub async fn mute_audio(&self) -> Result<()> {
        self.set_muted(MediaKind::Audio, true).await
    }

    pub async fn unmute_audio(&self) -> Result<()> {
        self.set_muted(MediaKind::Audio, false).await
    }

    pub async fn mute_video(&self) -> Result<()> {
        self.set_muted(MediaKind::Video, true).await
    }

    pub async fn unmute_video(&self) -> Result<()> {
        self.set_muted(MediaKind::Video, false).await
    }

    async fn set_muted(&self, kind: MediaKind, muted: bool) -> Result<()> {
        self.call(|respond_to| Command::SetMuted {
            kind,
            muted,
            respond_to,
        })
        .await
    }

    pub async fn change_display_name(&self, display_name: &str) -> Result<()> {
        let display_name = display_name.to_string();
        self.call(|respond_to| Command::ChangeDisplayName {
            display_name,
            respond_to,
        })
        .await
    }

    pub async fn restart_ice(&self) -> Result<()> {
        self.call(|respond_to| Command::RestartIce { respond_to })
            .await
    }

    pub async fn pause_consumer(&self, consumer_id: &str) -> Result<()> {
        self.set_consumer_paused(consumer_id, true).await
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> Result<()> {
        self.set_consumer_paused(consumer_id, false).await
    }

    async fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> Result<()> {
        let consumer_id = consumer_id.to_string();
        self.call(|respond_to| Command::SetConsumerPaused {
            consumer_id,
            paused,
            respond_to,
        })
        .await
    }

    pub async fn request_consumer_key_frame(&self, consumer_id: &str) -> Result<()> {
        self.consumer_request(
            huddle_protocol::methods::REQUEST_CONSUMER_KEY_FRAME,
            consumer_id,
            json!({}),
        )
        .await
    }

    pub async fn set_consumer_priority(&self, consumer_id: &str, priority: u8) -> Result<()> {
        self.consumer_request(
            huddle_protocol::methods::SET_CONSUMER_PRIORITY,
            consumer_id,
            json!({ "priority": priority }),
        )
        .await
    }

    pub async fn set_consumer_preferred_layers(
        &self,
        consumer_id: &str,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    ) -> Result<()> {
        let mut extra = json!({ "spatialLayer": spatial_layer });
        if let Some(temporal) = temporal_layer {
            extra["temporalLayer"] = json!(temporal);
        }
        self.consumer_request(
            huddle_protocol::methods::SET_CONSUMER_PREFERRED_LAYERS,
            consumer_id,
            extra,
        )
        .await
    }

    async fn consumer_request(
        &self,
        method: &'static str,
        consumer_id: &str,
        extra: Value,
    ) -> Result<()> {
        let consumer_id = consumer_id.to_string();
        self.call(|respond_to| Command::ConsumerRequest {
            method,
            consumer_id,
            extra,
            respond_to,
        })
        .await
    }

    pub async fn send_transport_stats(&self) -> Result<Value> {
        self.stats(StatsTarget::SendTransport).await
    }

    pub async fn recv_transport_stats(&self) -> Result<Value> {
        self.stats(StatsTarget::RecvTransport).await
    }

    pub async fn producer_stats(&self, kind: MediaKind) -> Result<Value> {
        self.stats(StatsTarget::Producer(kind)).await
    }

    pub async fn consumer_stats(&self, consumer_id: &str) -> Result<Value> {
        self.stats(StatsTarget::Consumer(consumer_id.to_string()))
            .await
    }

    pub async fn data_producer_stats(&self) -> Result<Value> {
        self.stats(StatsTarget::DataProducer).await
    }

    pub async fn data_consumer_stats(&self, data_consumer_id: &str) -> Result<Value> {
        self.stats(StatsTarget::DataConsumer(data_consumer_id.to_string()))
            .await
    }

    async fn stats(&self, target: StatsTarget) -> Result<Value> {
        self.call(|respond_to| Command::Stats { target, respond_to })
            .await
    }

    pub async fn apply_network_throttle(&self, throttle: NetworkThrottle) -> Result<()> {
        let data = serde_json::to_value(&throttle).map_err(crate::error::SignalingError::from)?;
        self.forward(huddle_protocol::methods::APPLY_NETWORK_THROTTLE, data)
            .await
            .map(|_| ())
    }

    pub async fn reset_network_throttle(&self, secret: &str) -> Result<()> {
        self.forward(
            huddle_protocol::methods::RESET_NETWORK_THROTTLE,
            json!({ "secret": secret }),
        )
        .await
        .map(|_| ())
    }

    async fn forward(&self, method: &'static str, data: Value) -> Result<Value> {
        self.call(|respond_to| Command::Forward {
            method,
            data,
            respond_to,
        })
        .await
    }
}
