mod api;
mod signaling;
pub(crate) mod transport;
mod websocket;

pub use api::{ApiClient, ApiExecutor, ApiRequest};
pub use signaling::{PeerRequest, Responder, SignalingClient, SignalingEvent};
pub use transport::{
    Connector, PendingRequest, SignalingTransport, SocketPair, TransportEvent, TransportState,
};
pub use websocket::WebSocketConnector;
