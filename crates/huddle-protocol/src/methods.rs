//! Method names used on the signaling connection

// Client -> server requests
pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
pub const CONNECT_WEBRTC_TRANSPORT: &str = "connectWebRtcTransport";
pub const JOIN: &str = "join";
pub const PRODUCE: &str = "produce";
pub const PRODUCE_DATA: &str = "produceData";
pub const PAUSE_PRODUCER: &str = "pauseProducer";
pub const RESUME_PRODUCER: &str = "resumeProducer";
pub const CLOSE_PRODUCER: &str = "closeProducer";
pub const PAUSE_CONSUMER: &str = "pauseConsumer";
pub const RESUME_CONSUMER: &str = "resumeConsumer";
pub const CHANGE_DISPLAY_NAME: &str = "changeDisplayName";
pub const RESTART_ICE: &str = "restartIce";
pub const REQUEST_CONSUMER_KEY_FRAME: &str = "requestConsumerKeyFrame";
pub const SET_CONSUMER_PRIORITY: &str = "setConsumerPriority";
pub const SET_CONSUMER_PREFERRED_LAYERS: &str = "setConsumerPreferredLayers";
pub const GET_TRANSPORT_STATS: &str = "getTransportStats";
pub const GET_PRODUCER_STATS: &str = "getProducerStats";
pub const GET_CONSUMER_STATS: &str = "getConsumerStats";
pub const GET_DATA_PRODUCER_STATS: &str = "getDataProducerStats";
pub const GET_DATA_CONSUMER_STATS: &str = "getDataConsumerStats";
pub const APPLY_NETWORK_THROTTLE: &str = "applyNetworkThrottle";
pub const RESET_NETWORK_THROTTLE: &str = "resetNetworkThrottle";

// Server -> client requests
pub const NEW_CONSUMER: &str = "newConsumer";
pub const NEW_DATA_CONSUMER: &str = "newDataConsumer";

// Server -> client notifications
pub const PRODUCER_SCORE: &str = "producerScore";
pub const CONSUMER_SCORE: &str = "consumerScore";
pub const NEW_PEER: &str = "newPeer";
pub const PEER_CLOSED: &str = "peerClosed";
pub const PEER_DISPLAY_NAME_CHANGED: &str = "peerDisplayNameChanged";
pub const CONSUMER_PAUSED: &str = "consumerPaused";
pub const CONSUMER_RESUMED: &str = "consumerResumed";
pub const CONSUMER_CLOSED: &str = "consumerClosed";
pub const CONSUMER_LAYERS_CHANGED: &str = "consumerLayersChanged";
pub const DATA_CONSUMER_CLOSED: &str = "dataConsumerClosed";
pub const DOWNLINK_BWE: &str = "downlinkBwe";
pub const ACTIVE_SPEAKER: &str = "activeSpeaker";

/// Notifications the room session subscribes to
pub const ROOM_NOTIFICATIONS: &[&str] = &[
    PRODUCER_SCORE,
    CONSUMER_SCORE,
    NEW_PEER,
    PEER_CLOSED,
    PEER_DISPLAY_NAME_CHANGED,
    CONSUMER_PAUSED,
    CONSUMER_RESUMED,
    CONSUMER_CLOSED,
    CONSUMER_LAYERS_CHANGED,
    DATA_CONSUMER_CLOSED,
    DOWNLINK_BWE,
    ACTIVE_SPEAKER,
];

/// Requests the room session answers
pub const ROOM_REQUESTS: &[&str] = &[NEW_CONSUMER, NEW_DATA_CONSUMER];
