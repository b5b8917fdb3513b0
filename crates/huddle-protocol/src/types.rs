use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind of a media track
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Client software description sent on join
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub flag: String,
    pub name: String,
    pub version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            flag: "rust".to_string(),
            name: "huddle".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Peer as listed in the join response and `newPeer` notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub device: Option<DeviceInfo>,
}

// Client -> server payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub display_name: String,
    pub device: DeviceInfo,
    pub rtp_capabilities: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub force_tcp: bool,
    pub producing: bool,
    pub consuming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_capabilities: Option<Value>,
}

/// Server-side transport parameters needed to build a local media transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(default)]
    pub sctp_parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceDataRequest {
    pub transport_id: String,
    pub sctp_stream_parameters: Value,
    pub label: String,
    pub protocol: String,
    #[serde(default)]
    pub app_data: Value,
}

/// Response to `produce` and `produceData`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedId {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartIceResponse {
    pub ice_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkThrottle {
    pub uplink: u32,
    pub downlink: u32,
    pub rtt: u32,
    #[serde(default)]
    pub packet_loss: u32,
    pub secret: String,
}

pub fn producer_id(producer_id: &str) -> Value {
    json!({ "producerId": producer_id })
}

pub fn consumer_id(consumer_id: &str) -> Value {
    json!({ "consumerId": consumer_id })
}

pub fn transport_id(transport_id: &str) -> Value {
    json!({ "transportId": transport_id })
}

// Server -> client payloads

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumer {
    pub peer_id: String,
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(rename = "type", default)]
    pub consumer_type: String,
    #[serde(default)]
    pub app_data: Value,
    #[serde(default)]
    pub producer_paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewDataConsumer {
    /// Absent when the data producer belongs to the server itself
    #[serde(default)]
    pub peer_id: Option<String>,
    pub data_producer_id: String,
    pub id: String,
    pub sctp_stream_parameters: Value,
    pub label: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub app_data: Value,
}

/// Requests the server sends to the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ServerRequest {
    NewConsumer(NewConsumer),
    NewDataConsumer(NewDataConsumer),
}

impl ServerRequest {
    pub fn from_parts(method: &str, data: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json!({ "method": method, "data": data }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerScoreEntry {
    #[serde(default)]
    pub encoding_idx: u32,
    #[serde(default)]
    pub ssrc: u32,
    #[serde(default)]
    pub rid: Option<String>,
    pub score: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    pub score: u8,
    pub producer_score: u8,
    #[serde(default)]
    pub producer_scores: Vec<u8>,
}

/// Notifications the server pushes to the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ServerNotification {
    #[serde(rename_all = "camelCase")]
    ProducerScore {
        producer_id: String,
        score: Vec<ProducerScoreEntry>,
    },

    #[serde(rename_all = "camelCase")]
    ConsumerScore {
        consumer_id: String,
        score: ConsumerScore,
    },

    NewPeer(PeerInfo),

    #[serde(rename_all = "camelCase")]
    PeerClosed { peer_id: String },

    #[serde(rename_all = "camelCase")]
    PeerDisplayNameChanged {
        peer_id: String,
        display_name: String,
        #[serde(default)]
        old_display_name: String,
    },

    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    ConsumerLayersChanged {
        consumer_id: String,
        #[serde(default)]
        spatial_layer: Option<i32>,
        #[serde(default)]
        temporal_layer: Option<i32>,
    },

    #[serde(rename_all = "camelCase")]
    DataConsumerClosed { data_consumer_id: String },

    #[serde(rename_all = "camelCase")]
    DownlinkBwe {
        #[serde(default)]
        desired_bitrate: u64,
        #[serde(default)]
        effective_desired_bitrate: u64,
        #[serde(default)]
        available_bitrate: u64,
    },

    #[serde(rename_all = "camelCase")]
    ActiveSpeaker {
        #[serde(default)]
        peer_id: Option<String>,
        #[serde(default)]
        volume: Option<i32>,
    },
}

impl ServerNotification {
    pub fn from_parts(method: &str, data: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json!({ "method": method, "data": data }))
    }
}
