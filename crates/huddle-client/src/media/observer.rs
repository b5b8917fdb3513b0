use async_trait::async_trait;
use huddle_protocol::{MediaKind, TransportInfo};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{MediaEngine, MediaTransport, TransportListener};
use crate::error::DeviceError;

/// Engine for headless participants that only watch the room
///
/// It negotiates capabilities so the server accepts the join, but has no
/// capture or playback and refuses to build media transports.
#[derive(Default)]
pub struct ObserverEngine {
    router_capabilities: Mutex<Option<Value>>,
}

impl ObserverEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn refuse(&self, direction: &str) -> DeviceError {
        DeviceError::Unsupported(format!("observer engine has no {} transport", direction))
    }
}

#[async_trait]
impl MediaEngine for ObserverEngine {
    async fn load(&self, router_rtp_capabilities: Value) -> Result<(), DeviceError> {
        if !router_rtp_capabilities.is_object() {
            return Err(DeviceError::Engine(
                "router capabilities must be an object".to_string(),
            ));
        }
        let codecs = router_rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        tracing::debug!(codecs, "Router capabilities loaded");
        *self.router_capabilities.lock() = Some(router_rtp_capabilities);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.router_capabilities.lock().is_some()
    }

    fn rtp_capabilities(&self) -> Result<Value, DeviceError> {
        self.router_capabilities
            .lock()
            .clone()
            .ok_or(DeviceError::NotLoaded)
    }

    fn sctp_capabilities(&self) -> Result<Value, DeviceError> {
        if !self.is_loaded() {
            return Err(DeviceError::NotLoaded);
        }
        Ok(json!({ "numStreams": { "OS": 1024, "MIS": 1024 } }))
    }

    fn can_produce(&self, _kind: MediaKind) -> bool {
        false
    }

    async fn create_send_transport(
        &self,
        _info: TransportInfo,
        _listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn MediaTransport>, DeviceError> {
        Err(self.refuse("send"))
    }

    async fn create_recv_transport(
        &self,
        _info: TransportInfo,
        _listener: Arc<dyn TransportListener>,
    ) -> Result<Box<dyn MediaTransport>, DeviceError> {
        Err(self.refuse("receive"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capabilities_require_load() {
        let engine = ObserverEngine::new();
        assert_eq!(engine.rtp_capabilities(), Err(DeviceError::NotLoaded));
        assert!(engine.load(json!("nope")).await.is_err());
        assert!(!engine.is_loaded());

        engine.load(json!({"codecs": [{"mimeType": "audio/opus"}]})).await.unwrap();
        assert!(engine.is_loaded());
        assert_eq!(
            engine.rtp_capabilities().unwrap()["codecs"][0]["mimeType"],
            "audio/opus"
        );
        assert!(engine.sctp_capabilities().is_ok());
        assert!(!engine.can_produce(MediaKind::Audio));
    }
}
