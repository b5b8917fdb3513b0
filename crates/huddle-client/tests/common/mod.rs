//! In-process room server and media engine for session tests

#![allow(dead_code)]

use async_trait::async_trait;
use huddle_client::dispatch::{observer_fn, Dispatcher};
use huddle_client::media::{
    ConsumeOptions, Consumer, DataChannelHandle, DataConsumeOptions, DataProduceOptions,
    MediaEngine, MediaTransport, ProduceOptions, Producer, TransportListener,
};
use huddle_client::network::{Connector, SocketPair};
use huddle_client::{DeviceError, RoomClient, RoomEvent, SignalingError};
use huddle_protocol::{Envelope, MediaKind, Request, Response, TransportInfo};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// One accepted signaling connection, server side
pub struct Connection {
    pub url: String,
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<String>,
}

pub struct MockConnector {
    connections: mpsc::UnboundedSender<Connection>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Connection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { connections: tx }), rx)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str, _subprotocol: &str) -> Result<SocketPair, SignalingError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.connections
            .send(Connection {
                url: url.to_string(),
                from_client: out_rx,
                to_client: in_tx,
            })
            .map_err(|_| SignalingError::Transport("no server".into()))?;
        Ok(SocketPair {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// How the mock room answers
#[derive(Clone)]
pub struct Script {
    pub peers: Vec<Value>,
    pub fail_join: bool,
}

impl Script {
    pub fn with_peers(peers: &[(&str, &str)]) -> Self {
        Self {
            peers: peers
                .iter()
                .map(|(id, name)| json!({ "id": id, "displayName": name }))
                .collect(),
            fail_join: false,
        }
    }

    pub fn failing_join() -> Self {
        Self {
            peers: Vec::new(),
            fail_join: true,
        }
    }

    fn answer(&self, method: &str, data: &Value, transports: &AtomicU64) -> Result<Value, String> {
        match method {
            "getRouterRtpCapabilities" => Ok(json!({
                "codecs": [
                    { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 },
                    { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
                ]
            })),
            "createWebRtcTransport" => {
                let n = transports.fetch_add(1, Ordering::Relaxed);
                Ok(json!({
                    "id": format!("transport-{}", n),
                    "iceParameters": {},
                    "iceCandidates": [],
                    "dtlsParameters": {},
                }))
            }
            "join" if self.fail_join => Err("room is full".to_string()),
            "join" => Ok(json!({ "peers": self.peers })),
            "produce" => {
                let kind = data["kind"].as_str().unwrap_or("x");
                Ok(json!({ "id": format!("producer-{}", kind) }))
            }
            "produceData" => Ok(json!({ "id": "data-producer-1" })),
            _ => Ok(json!({})),
        }
    }
}

/// Test-side handle to a running mock room
pub struct ServerHandle {
    pub url: String,
    to_client: Option<mpsc::UnboundedSender<String>>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    responses: mpsc::UnboundedReceiver<Response>,
    next_id: i64,
    stop: Option<oneshot::Sender<()>>,
}

impl ServerHandle {
    /// Wait for the client to connect and start answering it
    pub async fn accept(
        connections: &mut mpsc::UnboundedReceiver<Connection>,
        script: Script,
    ) -> Self {
        let connection = tokio::time::timeout(Duration::from_secs(2), connections.recv())
            .await
            .expect("client never connected")
            .expect("connector dropped");

        let Connection {
            url,
            mut from_client,
            to_client,
        } = connection;

        let requests = Arc::new(Mutex::new(Vec::new()));
        let (response_tx, responses) = mpsc::unbounded_channel();
        let (stop, mut stopped) = oneshot::channel();

        let task_requests = requests.clone();
        let task_to_client = to_client.clone();
        tokio::spawn(async move {
            let transports = AtomicU64::new(0);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    raw = from_client.recv() => {
                        let Some(raw) = raw else { break };
                        match Envelope::parse(&raw) {
                            Ok(Envelope::Request(Request { id, method, data })) => {
                                task_requests.lock().push((method.clone(), data.clone()));
                                let reply = match script.answer(&method, &data, &transports) {
                                    Ok(data) => Envelope::success(id, data),
                                    Err(reason) => Envelope::failure(id, 500, reason),
                                };
                                let _ = task_to_client.send(reply.to_json());
                            }
                            Ok(Envelope::Response(response)) => {
                                let _ = response_tx.send(response);
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Self {
            url,
            to_client: Some(to_client),
            requests,
            responses,
            next_id: 9000,
            stop: Some(stop),
        }
    }

    pub fn notify(&self, method: &str, data: Value) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Envelope::notification(method, data).to_json());
        }
    }

    /// Send a server request and wait for the client's answer
    pub async fn request(&mut self, method: &str, data: Value) -> Response {
        self.next_id += 1;
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Envelope::request(self.next_id, method, data).to_json());
        }
        tokio::time::timeout(Duration::from_secs(2), self.responses.recv())
            .await
            .expect("client never answered")
            .expect("server stopped")
    }

    /// Methods the client has called so far, in order
    pub fn methods(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Hang up on the client
    pub fn close(&mut self) {
        self.to_client = None;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Media engine that negotiates through the listener but moves no media
#[derive(Default)]
pub struct MockEngine {
    capabilities: Mutex<Option<Value>>,
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn load(&self, router_rtp_capabilities: Value) -> Result<(), DeviceError> {
        *self.capabilities.lock() = Some(router_rtp_capabilities);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.lock().is_some()
    }

    fn rtp_capabilities(&self) -> Result<Value, DeviceError> {
        self.capabilities.lock().clone().ok_or(DeviceError::NotLoaded)
    }

    fn sctp_capabilities(&self) -> Result<Value, DeviceError> {
        Ok(json!({ "numStreams": { "OS": 1024, "MIS": 1024 } }))
    }

    fn can_produce(&self, _kind: MediaKind) -> bool {
        true
    }

    async fn create_send_transport(
        &self,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn MediaTransport>, DeviceError> {
        Ok(Box::new(MockTransport::new(info, listener)))
    }

    async fn create_recv_transport(
        &self,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn MediaTransport>, DeviceError> {
        Ok(Box::new(MockTransport::new(info, listener)))
    }
}

struct MockTransport {
    id: String,
    listener: Arc<dyn TransportListener>,
    connected: AtomicBool,
}

impl MockTransport {
    fn new(info: TransportInfo, listener: Arc<dyn TransportListener>) -> Self {
        Self {
            id: info.id,
            listener,
            connected: AtomicBool::new(false),
        }
    }

    async fn ensure_connected(&self) -> Result<(), DeviceError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.listener
                .on_connect(&self.id, json!({ "role": "client" }))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(&self, options: ProduceOptions) -> Result<Box<dyn Producer>, DeviceError> {
        self.ensure_connected().await?;
        let id = self
            .listener
            .on_produce(&self.id, options.kind, json!({ "codecs": [] }), options.app_data)
            .await?;
        Ok(Box::new(MockTrack {
            id,
            producer_id: String::new(),
            kind: options.kind,
            paused: AtomicBool::new(false),
        }))
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Box<dyn Consumer>, DeviceError> {
        self.ensure_connected().await?;
        Ok(Box::new(MockTrack {
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            paused: AtomicBool::new(false),
        }))
    }

    async fn produce_data(
        &self,
        options: DataProduceOptions,
    ) -> Result<Box<dyn DataChannelHandle>, DeviceError> {
        self.ensure_connected().await?;
        let id = self
            .listener
            .on_produce_data(
                &self.id,
                json!({ "streamId": 0 }),
                &options.label,
                &options.protocol,
                options.app_data,
            )
            .await?;
        Ok(Box::new(MockChannel {
            id,
            label: options.label,
        }))
    }

    async fn consume_data(
        &self,
        options: DataConsumeOptions,
    ) -> Result<Box<dyn DataChannelHandle>, DeviceError> {
        self.ensure_connected().await?;
        Ok(Box::new(MockChannel {
            id: options.id,
            label: options.label,
        }))
    }

    async fn restart_ice(&self, _ice_parameters: Value) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&self) {}
}

struct MockTrack {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
}

impl Producer for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {}
}

impl Consumer for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {}
}

struct MockChannel {
    id: String,
    label: String,
}

impl DataChannelHandle for MockChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn close(&self) {}
}

/// Room events observed on a dedicated context
pub struct EventLog {
    events: Arc<Mutex<Vec<RoomEvent>>>,
    context: Dispatcher,
}

impl EventLog {
    pub fn attach(room: &RoomClient) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let context = Dispatcher::spawn("test-observer");
        let sink = events.clone();
        room.subscribe(
            observer_fn(move |event: &RoomEvent| sink.lock().push(event.clone())),
            &context,
        );
        Self { events, context }
    }

    pub async fn snapshot(&self) -> Vec<RoomEvent> {
        self.context.flush().await;
        self.events.lock().clone()
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
