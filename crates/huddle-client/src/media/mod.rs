//! Media engine boundary
//!
//! Capture, encoding and the actual WebRTC transports live outside this
//! crate. The room session drives them through these traits and the engine
//! calls back through [`TransportListener`] whenever a transport needs the
//! signaling server (DTLS connect, new producer, new data producer).

mod observer;

pub use observer::ObserverEngine;

use async_trait::async_trait;
use huddle_protocol::{MediaKind, TransportInfo};
use serde_json::Value;
use std::sync::Arc;

use crate::error::DeviceError;

/// Device-level capability negotiation and transport factory
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Load the router RTP capabilities; required before anything else
    async fn load(&self, router_rtp_capabilities: Value) -> Result<(), DeviceError>;

    fn is_loaded(&self) -> bool;

    /// Local RTP capabilities, sent in `join`
    fn rtp_capabilities(&self) -> Result<Value, DeviceError>;

    fn sctp_capabilities(&self) -> Result<Value, DeviceError>;

    fn can_produce(&self, kind: MediaKind) -> bool;

    async fn create_send_transport(
        &self,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn MediaTransport>, DeviceError>;

    async fn create_recv_transport(
        &self,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn MediaTransport>, DeviceError>;
}

/// Signaling hooks a media transport invokes while it negotiates
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn on_connect(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), DeviceError>;

    /// Returns the server-side producer id
    async fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String, DeviceError>;

    /// Returns the server-side data producer id
    async fn on_produce_data(
        &self,
        transport_id: &str,
        sctp_stream_parameters: Value,
        label: &str,
        protocol: &str,
        app_data: Value,
    ) -> Result<String, DeviceError>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;

    async fn produce(&self, options: ProduceOptions) -> Result<Box<dyn Producer>, DeviceError>;

    async fn consume(&self, options: ConsumeOptions) -> Result<Box<dyn Consumer>, DeviceError>;

    async fn produce_data(
        &self,
        options: DataProduceOptions,
    ) -> Result<Box<dyn DataChannelHandle>, DeviceError>;

    async fn consume_data(
        &self,
        options: DataConsumeOptions,
    ) -> Result<Box<dyn DataChannelHandle>, DeviceError>;

    async fn restart_ice(&self, ice_parameters: Value) -> Result<(), DeviceError>;

    fn close(&self);
}

/// Outbound track handle
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
}

/// Inbound track handle
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
}

/// SCTP data producer or consumer
pub trait DataChannelHandle: Send + Sync {
    fn id(&self) -> &str;
    fn label(&self) -> &str;
    fn close(&self);
}

/// What to capture and how to encode it
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub encodings: Option<Value>,
    pub codec_options: Option<Value>,
    pub app_data: Value,
}

impl ProduceOptions {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            encodings: None,
            codec_options: None,
            app_data: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct DataProduceOptions {
    pub label: String,
    pub protocol: String,
    pub ordered: bool,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct DataConsumeOptions {
    pub id: String,
    pub data_producer_id: String,
    pub sctp_stream_parameters: Value,
    pub label: String,
    pub protocol: String,
    pub app_data: Value,
}
