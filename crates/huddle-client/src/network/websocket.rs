use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};

use super::transport::{Connector, SocketPair};
use crate::error::SignalingError;

/// [`Connector`] over tokio-tungstenite
pub struct WebSocketConnector {
    ping_interval: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl WebSocketConnector {
    pub fn new(ping_interval: Duration) -> Self {
        Self { ping_interval }
    }
}

fn transport_error(err: impl std::fmt::Display) -> SignalingError {
    SignalingError::Transport(err.to_string())
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str, subprotocol: &str) -> Result<SocketPair, SignalingError> {
        let mut request = url.into_client_request().map_err(transport_error)?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(subprotocol).map_err(transport_error)?,
        );

        let (ws_stream, response) = connect_async(request).await.map_err(transport_error)?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Outgoing frames plus keepalive pings
        let ping_interval = self.ping_interval;
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_interval);
            ping.tick().await;
            loop {
                tokio::select! {
                    msg = out_rx.recv() => match msg {
                        Some(text) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                tracing::error!("Failed to send WebSocket message");
                                break;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        if write.send(Message::Ping(Default::default())).await.is_err() {
                            tracing::error!("Failed to send WebSocket ping");
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "WebSocket closed by server");
                        break;
                    }
                    // Pong is handled automatically by tungstenite
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(SocketPair {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
