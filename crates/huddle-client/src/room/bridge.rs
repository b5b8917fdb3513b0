use async_trait::async_trait;
use huddle_protocol::methods;
use huddle_protocol::{
    ConnectTransportRequest, CreatedId, MediaKind, ProduceDataRequest, ProduceRequest,
};
use serde::Serialize;
use serde_json::Value;

use crate::error::{DeviceError, SignalingError};
use crate::media::TransportListener;
use crate::network::SignalingClient;

/// Answers media transport callbacks by asking the signaling server
pub struct SignalingBridge {
    signaling: SignalingClient,
}

impl SignalingBridge {
    pub fn new(signaling: SignalingClient) -> Self {
        Self { signaling }
    }

    async fn call(&self, method: &str, body: &impl Serialize) -> Result<Value, DeviceError> {
        let data = serde_json::to_value(body).map_err(|e| DeviceError::Engine(e.to_string()))?;
        self.signaling
            .request_async(method, data)
            .await
            .map_err(|e| failed(method, e))
    }

    async fn create(&self, method: &str, body: &impl Serialize) -> Result<String, DeviceError> {
        let value = self.call(method, body).await?;
        let created: CreatedId = serde_json::from_value(value)
            .map_err(|e| failed(method, SignalingError::from(e)))?;
        Ok(created.id)
    }
}

fn failed(method: &str, err: SignalingError) -> DeviceError {
    DeviceError::Engine(format!("{} failed: {}", method, err))
}

#[async_trait]
impl TransportListener for SignalingBridge {
    async fn on_connect(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), DeviceError> {
        let request = ConnectTransportRequest {
            transport_id: transport_id.to_string(),
            dtls_parameters,
        };
        self.call(methods::CONNECT_WEBRTC_TRANSPORT, &request).await?;
        tracing::debug!(%transport_id, "Transport connected");
        Ok(())
    }

    async fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String, DeviceError> {
        let request = ProduceRequest {
            transport_id: transport_id.to_string(),
            kind,
            rtp_parameters,
            app_data,
        };
        self.create(methods::PRODUCE, &request).await
    }

    async fn on_produce_data(
        &self,
        transport_id: &str,
        sctp_stream_parameters: Value,
        label: &str,
        protocol: &str,
        app_data: Value,
    ) -> Result<String, DeviceError> {
        let request = ProduceDataRequest {
            transport_id: transport_id.to_string(),
            sctp_stream_parameters,
            label: label.to_string(),
            protocol: protocol.to_string(),
            app_data,
        };
        self.create(methods::PRODUCE_DATA, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::network::transport::tests::channel_connector;
    use huddle_protocol::{Envelope, Request};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_produce_returns_server_id() {
        let (connector, mut server) = channel_connector();
        let signaling = SignalingClient::new(
            connector,
            Dispatcher::spawn("callbacks"),
            Duration::from_secs(5),
        );
        signaling.connect("ws://test".to_string(), "protoo".to_string());
        let bridge = SignalingBridge::new(signaling.clone());

        let server_task = tokio::spawn(async move {
            let raw = server.from_client.recv().await.unwrap();
            let Ok(Envelope::Request(Request { id, method, data })) = Envelope::parse(&raw) else {
                panic!("expected a request");
            };
            assert_eq!(method, "produce");
            assert_eq!(data["kind"], "audio");
            assert_eq!(data["transportId"], "t1");
            server
                .to_client
                .send(Envelope::success(id, json!({"id": "producer-9"})).to_json())
                .unwrap();
            server
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while !signaling.is_open() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let id = bridge
            .on_produce("t1", MediaKind::Audio, json!({}), json!({}))
            .await
            .unwrap();
        assert_eq!(id, "producer-9");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_becomes_engine_error() {
        let (connector, mut server) = channel_connector();
        let signaling = SignalingClient::new(
            connector,
            Dispatcher::spawn("callbacks"),
            Duration::from_secs(5),
        );
        signaling.connect("ws://test".to_string(), "protoo".to_string());
        let bridge = SignalingBridge::new(signaling.clone());

        let _server = tokio::spawn(async move {
            let raw = server.from_client.recv().await.unwrap();
            if let Ok(Envelope::Request(Request { id, .. })) = Envelope::parse(&raw) {
                let _ = server
                    .to_client
                    .send(Envelope::failure(id, 403, "forbidden").to_json());
            }
            server
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while !signaling.is_open() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let err = bridge.on_connect("t1", json!({})).await.unwrap_err();
        match err {
            DeviceError::Engine(message) => {
                assert!(message.starts_with("connectWebRtcTransport failed"));
                assert!(message.contains("forbidden"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
