//! Room session actor
//!
//! Owns the signaling connection and every media handle of the current
//! join. Commands from [`super::RoomClient`] and signaling events arrive on
//! two mailboxes and are handled one at a time, so no two pieces of session
//! logic ever interleave. Each join gets an epoch; anything tagged with an
//! older epoch is dropped.

use huddle_protocol::methods::{self, ROOM_NOTIFICATIONS, ROOM_REQUESTS};
use huddle_protocol::{
    consumer_id, producer_id, transport_id, CreateTransportRequest, DeviceInfo, JoinRequest,
    JoinResponse, MediaKind, NewConsumer, NewDataConsumer, Notification, PeerInfo,
    RestartIceResponse, ServerNotification, ServerRequest, TransportInfo,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::bridge::SignalingBridge;
use super::{room_url, JoinParams, RoomState, SessionShared};
use crate::config::SignalingSettings;
use crate::dispatch::{observer_fn, Dispatcher, Observer};
use crate::error::{DeviceError, Result, SessionError, SignalingError};
use crate::media::{
    ConsumeOptions, Consumer, DataChannelHandle, DataConsumeOptions, DataProduceOptions,
    MediaEngine, MediaTransport, ProduceOptions, Producer, TransportListener,
};
use crate::network::{Connector, PeerRequest, SignalingClient, SignalingEvent};
use crate::state::{RemoteTrack, RoomEvent};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Label of the data producer opened on join
const CHAT_LABEL: &str = "chat";

pub(super) enum StatsTarget {
    SendTransport,
    RecvTransport,
    Producer(MediaKind),
    Consumer(String),
    DataProducer,
    DataConsumer(String),
}

pub(super) enum Command {
    Join {
        epoch: u64,
        params: JoinParams,
    },
    Leave,
    SetMedia {
        kind: MediaKind,
        enabled: bool,
        respond_to: Reply<()>,
    },
    SetMuted {
        kind: MediaKind,
        muted: bool,
        respond_to: Reply<()>,
    },
    ChangeDisplayName {
        display_name: String,
        respond_to: Reply<()>,
    },
    RestartIce {
        respond_to: Reply<()>,
    },
    SetConsumerPaused {
        consumer_id: String,
        paused: bool,
        respond_to: Reply<()>,
    },
    /// Consumer-scoped request whose payload is `consumerId` plus `extra`
    ConsumerRequest {
        method: &'static str,
        consumer_id: String,
        extra: Value,
        respond_to: Reply<()>,
    },
    Stats {
        target: StatsTarget,
        respond_to: Reply<Value>,
    },
    /// Plain request on the current connection
    Forward {
        method: &'static str,
        data: Value,
        respond_to: Reply<Value>,
    },
}

enum Internal {
    Signaling {
        epoch: u64,
        event: SignalingEvent,
    },
    Handshake {
        epoch: u64,
        result: Result<Option<Handshake>>,
    },
}

/// Media transports and peers obtained while joining
#[derive(Default)]
struct Handshake {
    send_transport: Option<Box<dyn MediaTransport>>,
    recv_transport: Option<Box<dyn MediaTransport>>,
    peers: Vec<PeerInfo>,
}

impl Handshake {
    fn close(self) {
        for transport in [self.send_transport, self.recv_transport]
            .into_iter()
            .flatten()
        {
            transport.close();
        }
    }
}

struct RemoteConsumer {
    handle: Box<dyn Consumer>,
    peer_id: String,
}

/// Everything owned by one join
struct ActiveSession {
    epoch: u64,
    params: JoinParams,
    signaling: SignalingClient,
    relay: Arc<dyn Observer<SignalingEvent>>,
    connected: bool,
    /// The join handshake failed; peer traffic is refused until leave
    failed: bool,
    /// Peer traffic that arrived before the join completed
    backlog: Vec<SignalingEvent>,
    send_transport: Option<Box<dyn MediaTransport>>,
    recv_transport: Option<Box<dyn MediaTransport>>,
    producers: HashMap<MediaKind, Box<dyn Producer>>,
    consumers: HashMap<String, RemoteConsumer>,
    data_producer: Option<Box<dyn DataChannelHandle>>,
    data_consumers: HashMap<String, Box<dyn DataChannelHandle>>,
}

/// Reason sent back when we refuse a peer request
struct Refusal {
    code: i64,
    reason: String,
}

impl Refusal {
    fn new(code: i64, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }
}

impl From<SessionError> for Refusal {
    fn from(err: SessionError) -> Self {
        Self {
            code: 500,
            reason: err.to_string(),
        }
    }
}

impl From<DeviceError> for Refusal {
    fn from(err: DeviceError) -> Self {
        SessionError::from(err).into()
    }
}

/// Peer traffic of a session whose join failed
fn refuse_after_failed_join(event: SignalingEvent) {
    match event {
        SignalingEvent::Request(request) => {
            tracing::debug!(method = %request.method, "Refusing peer request, join failed");
            request.responder.reject(500, "Join failed");
        }
        SignalingEvent::Notification(notification) => {
            tracing::debug!(method = %notification.method, "Dropping notification, join failed");
        }
        _ => {}
    }
}

pub(super) struct Session {
    shared: Arc<SessionShared>,
    engine: Arc<dyn MediaEngine>,
    connector: Arc<dyn Connector>,
    settings: SignalingSettings,
    /// Context signaling callbacks and observers run on
    callbacks: Dispatcher,
    receiver: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    active: Option<ActiveSession>,
}

impl Session {
    /// Start the actor; it runs until every command sender is dropped
    pub(super) fn spawn(
        shared: Arc<SessionShared>,
        engine: Arc<dyn MediaEngine>,
        connector: Arc<dyn Connector>,
        settings: SignalingSettings,
    ) -> mpsc::UnboundedSender<Command> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let session = Self {
            shared,
            engine,
            connector,
            settings,
            callbacks: Dispatcher::spawn("signaling"),
            receiver,
            internal_tx,
            internal_rx,
            active: None,
        };
        tokio::spawn(session.run());

        sender
    }

    async fn run(mut self) {
        tracing::debug!("Room session started");

        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
            }
        }

        if let Some(active) = self.active.take() {
            self.close_session(active);
        }
        tracing::debug!("Room session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { epoch, params } => self.start(epoch, params),
            Command::Leave => {
                if let Some(active) = self.active.take() {
                    self.close_session(active);
                }
            }
            Command::SetMedia {
                kind,
                enabled,
                respond_to,
            } => {
                let result = if enabled {
                    self.enable_media(kind).await
                } else {
                    self.disable_media(kind).await
                };
                let _ = respond_to.send(result);
            }
            Command::SetMuted {
                kind,
                muted,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_muted(kind, muted).await);
            }
            Command::ChangeDisplayName {
                display_name,
                respond_to,
            } => {
                let _ = respond_to.send(self.change_display_name(display_name).await);
            }
            Command::RestartIce { respond_to } => {
                let _ = respond_to.send(self.restart_ice().await);
            }
            Command::SetConsumerPaused {
                consumer_id,
                paused,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_consumer_paused(&consumer_id, paused).await);
            }
            Command::ConsumerRequest {
                method,
                consumer_id,
                extra,
                respond_to,
            } => {
                let _ = respond_to.send(self.consumer_request(method, &consumer_id, extra).await);
            }
            Command::Stats { target, respond_to } => {
                let _ = respond_to.send(self.stats(target).await);
            }
            Command::Forward {
                method,
                data,
                respond_to,
            } => {
                let result = match self.session() {
                    Ok(active) => {
                        let signaling = active.signaling.clone();
                        signaling
                            .request_async(method, data)
                            .await
                            .map_err(SessionError::from)
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Signaling { epoch, event } => {
                if !self.is_active(epoch) {
                    tracing::trace!(epoch, "Dropping signaling event of a finished session");
                    return;
                }
                self.handle_signaling(epoch, event).await;
            }
            Internal::Handshake { epoch, result } => self.finish_handshake(epoch, result).await,
        }
    }

    fn is_active(&self, epoch: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.epoch == epoch)
    }

    /// Current session, provided it finished joining
    fn session(&self) -> Result<&ActiveSession> {
        let actual = self.shared.state();
        match &self.active {
            Some(active) if active.connected && actual == RoomState::Connected => Ok(active),
            _ => Err(SessionError::InvalidState {
                expected: RoomState::Connected,
                actual,
            }),
        }
    }

    fn session_mut(&mut self) -> Result<&mut ActiveSession> {
        let actual = self.shared.state();
        match self.active.as_mut() {
            Some(active) if active.connected && actual == RoomState::Connected => Ok(active),
            _ => Err(SessionError::InvalidState {
                expected: RoomState::Connected,
                actual,
            }),
        }
    }

    fn start(&mut self, epoch: u64, params: JoinParams) {
        if let Some(previous) = self.active.take() {
            self.close_session(previous);
        }
        if !self.shared.is_current(epoch) {
            tracing::debug!(epoch, "Skipping join that was already left");
            return;
        }

        let signaling = SignalingClient::new(
            self.connector.clone(),
            self.callbacks.clone(),
            self.settings.request_timeout(),
        );

        let tx = self.internal_tx.clone();
        let relay = observer_fn(move |event: &SignalingEvent| {
            let _ = tx.send(Internal::Signaling {
                epoch,
                event: event.clone(),
            });
        });
        signaling.subscribe(relay.clone(), &self.callbacks);

        let url = room_url(
            &params.host,
            params.port,
            &params.room_id,
            &params.peer_id,
            self.settings.secure,
        );
        tracing::debug!(%url, epoch, "Connecting signaling");
        signaling.connect(url, self.settings.subprotocol.clone());

        self.active = Some(ActiveSession {
            epoch,
            params,
            signaling,
            relay,
            connected: false,
            failed: false,
            backlog: Vec::new(),
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            data_producer: None,
            data_consumers: HashMap::new(),
        });
    }

    async fn handle_signaling(&mut self, epoch: u64, event: SignalingEvent) {
        match event {
            SignalingEvent::Opened => self.begin_handshake(),
            SignalingEvent::Failed(err) => {
                tracing::warn!(epoch, "Signaling connection failed: {}", err);
            }
            SignalingEvent::Closed => {
                tracing::info!(epoch, "Signaling connection closed");
                if let Some(active) = self.active.take() {
                    self.close_session(active);
                }
                self.shared.mark_closed(epoch);
            }
            SignalingEvent::Request(_) | SignalingEvent::Notification(_) => {
                match self.active.as_mut() {
                    Some(active) if active.failed => refuse_after_failed_join(event),
                    Some(active) if !active.connected => active.backlog.push(event),
                    _ => self.handle_peer_traffic(event).await,
                }
            }
        }
    }

    async fn handle_peer_traffic(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Request(request) => self.handle_peer_request(request).await,
            SignalingEvent::Notification(notification) => {
                self.handle_notification(notification)
            }
            _ => {}
        }
    }

    fn begin_handshake(&self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let handshake = HandshakeTask {
            epoch: active.epoch,
            shared: self.shared.clone(),
            engine: self.engine.clone(),
            signaling: active.signaling.clone(),
            listener: Arc::new(SignalingBridge::new(active.signaling.clone())),
            params: active.params.clone(),
        };

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let epoch = handshake.epoch;
            let result = handshake.run().await;
            let _ = tx.send(Internal::Handshake { epoch, result });
        });
    }

    async fn finish_handshake(&mut self, epoch: u64, result: Result<Option<Handshake>>) {
        let handshake = match result {
            Ok(Some(handshake)) => handshake,
            Ok(None) => {
                tracing::debug!(epoch, "Join finished after its session ended");
                return;
            }
            Err(e) => {
                self.fail_handshake(epoch, e);
                return;
            }
        };

        if !self.is_active(epoch) || !self.shared.is_current(epoch) {
            handshake.close();
            return;
        }

        let Handshake {
            send_transport,
            recv_transport,
            peers,
        } = handshake;
        let backlog = match self.active.as_mut() {
            Some(active) => {
                active.send_transport = send_transport;
                active.recv_transport = recv_transport;
                active.connected = true;
                std::mem::take(&mut active.backlog)
            }
            None => return,
        };

        if !self.shared.mark_connected(epoch) {
            return;
        }
        let joined = self.shared.registry().set_peers(peers);
        tracing::info!(epoch, peers = joined, "Joined room");

        for event in backlog {
            self.handle_peer_traffic(event).await;
        }
        self.publish_initial_media().await;
    }

    /// Keep the session in CONNECTING but stop buffering peer traffic and
    /// answer whatever was buffered
    fn fail_handshake(&mut self, epoch: u64, err: SessionError) {
        let current = self.shared.is_current(epoch) && self.shared.state() != RoomState::Closed;
        let active = match self.active.as_mut() {
            Some(active) if active.epoch == epoch && current => active,
            _ => {
                tracing::debug!(epoch, "Join of an ended session failed: {}", err);
                return;
            }
        };

        tracing::error!(epoch, "Failed to join room: {}", err);
        active.failed = true;
        for event in std::mem::take(&mut active.backlog) {
            refuse_after_failed_join(event);
        }
    }

    async fn publish_initial_media(&mut self) {
        let options = match self.active.as_ref() {
            Some(active) if active.send_transport.is_some() => active.params.options.clone(),
            _ => return,
        };

        if options.audio && self.engine.can_produce(MediaKind::Audio) {
            if let Err(e) = self.enable_media(MediaKind::Audio).await {
                tracing::warn!("Failed to enable audio: {}", e);
            }
        }
        if options.video && self.engine.can_produce(MediaKind::Video) {
            if let Err(e) = self.enable_media(MediaKind::Video).await {
                tracing::warn!("Failed to enable video: {}", e);
            }
        }
        if options.use_data_channel {
            if let Err(e) = self.enable_chat().await {
                tracing::warn!("Failed to open chat data channel: {}", e);
            }
        }
    }

    async fn enable_media(&mut self, kind: MediaKind) -> Result<()> {
        let active = self.session()?;
        if active.producers.contains_key(&kind) {
            return Ok(());
        }
        if !self.engine.can_produce(kind) {
            return Err(DeviceError::CannotProduce(kind).into());
        }
        let transport = active
            .send_transport
            .as_ref()
            .ok_or_else(|| SessionError::NotFound("send transport".to_string()))?;
        let epoch = active.epoch;

        let producer = transport.produce(ProduceOptions::new(kind)).await?;

        if !self.shared.is_current(epoch) {
            producer.close();
            return Err(SessionError::InvalidState {
                expected: RoomState::Connected,
                actual: self.shared.state(),
            });
        }

        let id = producer.id().to_string();
        tracing::info!(%kind, producer_id = %id, "Producing");
        self.session_mut()?.producers.insert(kind, producer);
        self.shared.events().notify(RoomEvent::LocalTrackChanged {
            kind,
            producer_id: Some(id),
            paused: false,
        });
        Ok(())
    }

    async fn disable_media(&mut self, kind: MediaKind) -> Result<()> {
        let (producer, signaling) = {
            let active = self.session_mut()?;
            match active.producers.remove(&kind) {
                Some(producer) => (producer, active.signaling.clone()),
                None => return Ok(()),
            }
        };

        producer.close();
        self.shared.events().notify(RoomEvent::LocalTrackChanged {
            kind,
            producer_id: None,
            paused: false,
        });

        signaling
            .request_async(methods::CLOSE_PRODUCER, producer_id(producer.id()))
            .await?;
        Ok(())
    }

    async fn set_muted(&mut self, kind: MediaKind, muted: bool) -> Result<()> {
        let active = self.session()?;
        let producer = active
            .producers
            .get(&kind)
            .ok_or_else(|| SessionError::NotFound(format!("{} producer", kind)))?;
        if producer.is_paused() == muted {
            return Ok(());
        }

        if muted {
            producer.pause();
        } else {
            producer.resume();
        }
        let id = producer.id().to_string();
        let signaling = active.signaling.clone();

        self.shared.events().notify(RoomEvent::LocalTrackChanged {
            kind,
            producer_id: Some(id.clone()),
            paused: muted,
        });

        let method = if muted {
            methods::PAUSE_PRODUCER
        } else {
            methods::RESUME_PRODUCER
        };
        signaling.request_async(method, producer_id(&id)).await?;
        Ok(())
    }

    async fn enable_chat(&mut self) -> Result<()> {
        let active = self.session()?;
        if active.data_producer.is_some() {
            return Ok(());
        }
        let transport = active
            .send_transport
            .as_ref()
            .ok_or_else(|| SessionError::NotFound("send transport".to_string()))?;

        let handle = transport
            .produce_data(DataProduceOptions {
                label: CHAT_LABEL.to_string(),
                protocol: CHAT_LABEL.to_string(),
                ordered: false,
                app_data: json!({ "info": "chat" }),
            })
            .await?;

        tracing::debug!(data_producer_id = %handle.id(), "Chat data channel open");
        self.session_mut()?.data_producer = Some(handle);
        Ok(())
    }

    async fn change_display_name(&mut self, display_name: String) -> Result<()> {
        let signaling = self.session()?.signaling.clone();
        signaling
            .request_async(
                methods::CHANGE_DISPLAY_NAME,
                json!({ "displayName": display_name }),
            )
            .await?;

        self.session_mut()?.params.display_name = display_name.clone();
        self.shared.set_display_name(&display_name);
        Ok(())
    }

    async fn restart_ice(&self) -> Result<()> {
        let active = self.session()?;
        for transport in [&active.send_transport, &active.recv_transport]
            .into_iter()
            .flatten()
        {
            let response: RestartIceResponse = active
                .signaling
                .request_as(methods::RESTART_ICE, transport_id(transport.id()))
                .await?;
            transport.restart_ice(response.ice_parameters).await?;
            tracing::debug!(transport_id = %transport.id(), "ICE restarted");
        }
        Ok(())
    }

    async fn set_consumer_paused(&self, id: &str, paused: bool) -> Result<()> {
        let active = self.session()?;
        let consumer = active
            .consumers
            .get(id)
            .ok_or_else(|| SessionError::NotFound(format!("consumer {}", id)))?;

        if paused {
            consumer.handle.pause();
        } else {
            consumer.handle.resume();
        }
        self.shared.registry().set_track_paused(id, paused);

        let method = if paused {
            methods::PAUSE_CONSUMER
        } else {
            methods::RESUME_CONSUMER
        };
        active.signaling.request_async(method, consumer_id(id)).await?;
        Ok(())
    }

    async fn consumer_request(&self, method: &str, id: &str, extra: Value) -> Result<()> {
        let active = self.session()?;
        if !active.consumers.contains_key(id) {
            return Err(SessionError::NotFound(format!("consumer {}", id)));
        }

        let mut data = consumer_id(id);
        if let (Some(data), Value::Object(extra)) = (data.as_object_mut(), extra) {
            data.extend(extra);
        }
        active.signaling.request_async(method, data).await?;
        Ok(())
    }

    async fn stats(&self, target: StatsTarget) -> Result<Value> {
        let active = self.session()?;
        let missing = |what: String| SessionError::NotFound(what);

        let (method, data) = match target {
            StatsTarget::SendTransport => {
                let transport = active
                    .send_transport
                    .as_ref()
                    .ok_or_else(|| missing("send transport".to_string()))?;
                (methods::GET_TRANSPORT_STATS, transport_id(transport.id()))
            }
            StatsTarget::RecvTransport => {
                let transport = active
                    .recv_transport
                    .as_ref()
                    .ok_or_else(|| missing("receive transport".to_string()))?;
                (methods::GET_TRANSPORT_STATS, transport_id(transport.id()))
            }
            StatsTarget::Producer(kind) => {
                let producer = active
                    .producers
                    .get(&kind)
                    .ok_or_else(|| missing(format!("{} producer", kind)))?;
                (methods::GET_PRODUCER_STATS, producer_id(producer.id()))
            }
            StatsTarget::Consumer(id) => {
                if !active.consumers.contains_key(&id) {
                    return Err(missing(format!("consumer {}", id)));
                }
                (methods::GET_CONSUMER_STATS, consumer_id(&id))
            }
            StatsTarget::DataProducer => {
                let handle = active
                    .data_producer
                    .as_ref()
                    .ok_or_else(|| missing("data producer".to_string()))?;
                (
                    methods::GET_DATA_PRODUCER_STATS,
                    json!({ "dataProducerId": handle.id() }),
                )
            }
            StatsTarget::DataConsumer(id) => {
                if !active.data_consumers.contains_key(&id) {
                    return Err(missing(format!("data consumer {}", id)));
                }
                (
                    methods::GET_DATA_CONSUMER_STATS,
                    json!({ "dataConsumerId": id }),
                )
            }
        };

        Ok(active.signaling.request_async(method, data).await?)
    }

    async fn handle_peer_request(&mut self, request: PeerRequest) {
        let PeerRequest {
            method,
            data,
            responder,
        } = request;

        if !ROOM_REQUESTS.contains(&method.as_str()) {
            // Dropping the responder rejects it
            tracing::debug!(%method, "Ignoring unknown peer request");
            return;
        }

        let parsed = match ServerRequest::from_parts(&method, data) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(%method, "Malformed peer request: {}", e);
                responder.reject(400, e.to_string());
                return;
            }
        };

        let result = match parsed {
            ServerRequest::NewConsumer(consumer) => self.consume(consumer).await,
            ServerRequest::NewDataConsumer(consumer) => self.consume_data(consumer).await,
        };

        match result {
            Ok(()) => {
                responder.accept(json!({}));
            }
            Err(refusal) => {
                tracing::warn!(
                    %method,
                    code = refusal.code,
                    "Refusing peer request: {}",
                    refusal.reason
                );
                responder.reject(refusal.code, refusal.reason);
            }
        }
    }

    async fn consume(&mut self, consumer: NewConsumer) -> std::result::Result<(), Refusal> {
        let active = self.session()?;
        if !active.params.options.consume {
            return Err(Refusal::new(403, "I do not want to consume"));
        }
        let transport = active
            .recv_transport
            .as_ref()
            .ok_or_else(|| Refusal::new(403, "No receive transport"))?;

        let handle = transport
            .consume(ConsumeOptions {
                id: consumer.id.clone(),
                producer_id: consumer.producer_id.clone(),
                kind: consumer.kind,
                rtp_parameters: consumer.rtp_parameters,
                app_data: consumer.app_data,
            })
            .await?;

        let track = RemoteTrack {
            consumer_id: consumer.id.clone(),
            producer_id: consumer.producer_id,
            peer_id: consumer.peer_id.clone(),
            kind: consumer.kind,
            consumer_type: consumer.consumer_type,
            paused: false,
            producer_paused: consumer.producer_paused,
            score: None,
            spatial_layer: None,
            temporal_layer: None,
        };

        self.session_mut()?.consumers.insert(
            consumer.id.clone(),
            RemoteConsumer {
                handle,
                peer_id: consumer.peer_id,
            },
        );
        if !self.shared.registry().add_track(track) {
            tracing::debug!(consumer_id = %consumer.id, "Consumer for a peer we do not know");
        }
        Ok(())
    }

    async fn consume_data(
        &mut self,
        consumer: NewDataConsumer,
    ) -> std::result::Result<(), Refusal> {
        let active = self.session()?;
        if !active.params.options.use_data_channel {
            return Err(Refusal::new(403, "I do not want DataChannels"));
        }
        let transport = active
            .recv_transport
            .as_ref()
            .ok_or_else(|| Refusal::new(403, "No receive transport"))?;

        let handle = transport
            .consume_data(DataConsumeOptions {
                id: consumer.id.clone(),
                data_producer_id: consumer.data_producer_id,
                sctp_stream_parameters: consumer.sctp_stream_parameters,
                label: consumer.label,
                protocol: consumer.protocol,
                app_data: consumer.app_data,
            })
            .await?;

        tracing::debug!(
            data_consumer_id = %consumer.id,
            peer_id = consumer.peer_id.as_deref().unwrap_or("server"),
            "Data consumer created"
        );
        self.session_mut()?
            .data_consumers
            .insert(consumer.id, handle);
        Ok(())
    }

    fn handle_notification(&mut self, notification: Notification) {
        if !ROOM_NOTIFICATIONS.contains(&notification.method.as_str()) {
            tracing::debug!(method = %notification.method, "Ignoring unknown notification");
            return;
        }
        let parsed = match ServerNotification::from_parts(&notification.method, notification.data)
        {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(method = %notification.method, "Malformed notification: {}", e);
                return;
            }
        };

        let registry = self.shared.registry();
        match parsed {
            ServerNotification::ProducerScore { producer_id, score } => {
                self.shared
                    .events()
                    .notify(RoomEvent::ProducerScore { producer_id, score });
            }
            ServerNotification::ConsumerScore { consumer_id, score } => {
                registry.set_track_score(&consumer_id, score);
            }
            ServerNotification::NewPeer(info) => {
                registry.add_peer(info);
            }
            ServerNotification::PeerClosed { peer_id } => {
                if let Some(active) = self.active.as_mut() {
                    active.consumers.retain(|_, consumer| {
                        if consumer.peer_id == peer_id {
                            consumer.handle.close();
                            false
                        } else {
                            true
                        }
                    });
                }
                registry.remove_peer(&peer_id);
            }
            ServerNotification::PeerDisplayNameChanged {
                peer_id,
                display_name,
                ..
            } => {
                registry.change_display_name(&peer_id, &display_name);
            }
            ServerNotification::ConsumerPaused { consumer_id } => {
                registry.set_producer_paused(&consumer_id, true);
            }
            ServerNotification::ConsumerResumed { consumer_id } => {
                registry.set_producer_paused(&consumer_id, false);
            }
            ServerNotification::ConsumerClosed { consumer_id } => {
                if let Some(consumer) = self
                    .active
                    .as_mut()
                    .and_then(|a| a.consumers.remove(&consumer_id))
                {
                    consumer.handle.close();
                }
                registry.remove_track(&consumer_id);
            }
            ServerNotification::ConsumerLayersChanged {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                registry.set_track_layers(&consumer_id, spatial_layer, temporal_layer);
            }
            ServerNotification::DataConsumerClosed { data_consumer_id } => {
                if let Some(handle) = self
                    .active
                    .as_mut()
                    .and_then(|a| a.data_consumers.remove(&data_consumer_id))
                {
                    handle.close();
                }
            }
            ServerNotification::DownlinkBwe {
                desired_bitrate,
                effective_desired_bitrate,
                available_bitrate,
            } => {
                tracing::debug!(
                    desired_bitrate,
                    effective_desired_bitrate,
                    available_bitrate,
                    "Downlink bandwidth estimate"
                );
            }
            ServerNotification::ActiveSpeaker { peer_id, volume } => {
                registry.set_active_speaker(peer_id.as_deref(), volume);
            }
        }
    }

    fn close_session(&self, mut active: ActiveSession) {
        active.signaling.unsubscribe(&active.relay);

        for (_, producer) in active.producers.drain() {
            producer.close();
        }
        for (_, consumer) in active.consumers.drain() {
            consumer.handle.close();
        }
        if let Some(handle) = active.data_producer.take() {
            handle.close();
        }
        for (_, handle) in active.data_consumers.drain() {
            handle.close();
        }
        for transport in [active.send_transport.take(), active.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            transport.close();
        }

        active.signaling.close();
        let removed = self.shared.registry().clear();
        tracing::info!(epoch = active.epoch, removed, "Room session closed");
    }
}

/// The join sequence, run off the actor so `leave` is never stuck behind it
struct HandshakeTask {
    epoch: u64,
    shared: Arc<SessionShared>,
    engine: Arc<dyn MediaEngine>,
    signaling: SignalingClient,
    listener: Arc<dyn TransportListener>,
    params: JoinParams,
}

impl HandshakeTask {
    /// `Ok(None)` when the session was left or replaced midway
    async fn run(self) -> Result<Option<Handshake>> {
        let mut created = Handshake::default();
        match self.steps(&mut created).await {
            Ok(true) => Ok(Some(created)),
            Ok(false) => {
                created.close();
                Ok(None)
            }
            Err(e) => {
                created.close();
                Err(e)
            }
        }
    }

    fn current(&self) -> bool {
        self.shared.is_current(self.epoch)
    }

    async fn steps(&self, created: &mut Handshake) -> Result<bool> {
        let options = &self.params.options;

        let router_capabilities = self
            .signaling
            .request_async(methods::GET_ROUTER_RTP_CAPABILITIES, json!({}))
            .await?;
        if !self.current() {
            return Ok(false);
        }

        if !self.engine.is_loaded() {
            self.engine.load(router_capabilities).await?;
            if !self.current() {
                return Ok(false);
            }
        }

        let sctp_capabilities = if options.use_data_channel {
            Some(self.engine.sctp_capabilities()?)
        } else {
            None
        };

        if options.produce {
            let info = self
                .create_transport(true, sctp_capabilities.clone())
                .await?;
            if !self.current() {
                return Ok(false);
            }
            created.send_transport = Some(
                self.engine
                    .create_send_transport(info, self.listener.clone())
                    .await?,
            );
        }

        if options.consume {
            let info = self
                .create_transport(false, sctp_capabilities.clone())
                .await?;
            if !self.current() {
                return Ok(false);
            }
            created.recv_transport = Some(
                self.engine
                    .create_recv_transport(info, self.listener.clone())
                    .await?,
            );
        }

        let request = JoinRequest {
            display_name: self.params.display_name.clone(),
            device: DeviceInfo::default(),
            rtp_capabilities: self.engine.rtp_capabilities()?,
            sctp_capabilities,
        };
        let data = serde_json::to_value(&request).map_err(SignalingError::from)?;
        let response: JoinResponse = self.signaling.request_as(methods::JOIN, data).await?;
        created.peers = response.peers;

        Ok(self.current())
    }

    async fn create_transport(
        &self,
        producing: bool,
        sctp_capabilities: Option<Value>,
    ) -> Result<TransportInfo> {
        let request = CreateTransportRequest {
            force_tcp: self.params.options.force_tcp,
            producing,
            consuming: !producing,
            sctp_capabilities,
        };
        let data = serde_json::to_value(&request).map_err(SignalingError::from)?;
        let info: TransportInfo = self
            .signaling
            .request_as(methods::CREATE_WEBRTC_TRANSPORT, data)
            .await?;
        tracing::debug!(transport_id = %info.id, producing, "Server transport created");
        Ok(info)
    }
}
