use huddle_protocol::{Envelope, Notification, Request, RequestId};
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use super::transport::{Connector, SignalingTransport, TransportEvent};
use crate::dispatch::{Dispatcher, Observer, ObserverHub, Predicate};
use crate::error::SignalingError;

/// Ids stay exactly representable as JSON numbers in every peer
const MAX_REQUEST_ID: i64 = 1 << 53;

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Opened,
    Closed,
    Failed(SignalingError),
    Request(PeerRequest),
    Notification(Notification),
}

/// A request the peer sent us
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub method: String,
    pub data: Value,
    pub responder: Responder,
}

struct ResponderInner {
    id: RequestId,
    method: String,
    transport: SignalingTransport,
    answered: Mutex<bool>,
}

impl ResponderInner {
    fn answer(&self, envelope: Envelope) -> bool {
        {
            let mut answered = self.answered.lock();
            if *answered {
                return false;
            }
            *answered = true;
        }
        if let Err(e) = self.transport.send_envelope(&envelope) {
            tracing::warn!(
                id = self.id,
                method = %self.method,
                "Failed to answer peer request: {}",
                e
            );
        }
        true
    }
}

impl Drop for ResponderInner {
    fn drop(&mut self) {
        if !*self.answered.get_mut() {
            tracing::warn!(id = self.id, method = %self.method, "Rejecting unhandled peer request");
            self.answer(Envelope::failure(self.id, 500, "unhandled method"));
        }
    }
}

/// Answers a [`PeerRequest`]. Only the first answer is sent; a request that
/// is never answered is rejected with 500 once every copy is dropped.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .finish()
    }
}

impl Responder {
    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn accept(&self, data: Value) -> bool {
        self.inner.answer(Envelope::success(self.inner.id, data))
    }

    pub fn reject(&self, code: i64, reason: impl Into<String>) -> bool {
        self.inner
            .answer(Envelope::failure(self.inner.id, code, reason))
    }
}

/// Republishes transport events as signaling events
struct Relay {
    client: Weak<ClientInner>,
}

impl Observer<TransportEvent> for Relay {
    fn on_event(&self, event: &TransportEvent) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let event = match event {
            TransportEvent::Opened => SignalingEvent::Opened,
            TransportEvent::Closed => SignalingEvent::Closed,
            TransportEvent::Failed(err) => SignalingEvent::Failed(err.clone()),
            TransportEvent::Inbound(Envelope::Request(Request { id, method, data })) => {
                tracing::debug!(id, %method, "Peer request received");
                SignalingEvent::Request(PeerRequest {
                    method: method.clone(),
                    data: data.clone(),
                    responder: Responder {
                        inner: Arc::new(ResponderInner {
                            id: *id,
                            method: method.clone(),
                            transport: client.transport.clone(),
                            answered: Mutex::new(false),
                        }),
                    },
                })
            }
            TransportEvent::Inbound(Envelope::Notification(notification)) => {
                tracing::trace!(method = %notification.method, "Notification received");
                SignalingEvent::Notification(notification.clone())
            }
            TransportEvent::Inbound(Envelope::Response(_)) => return,
        };
        client.events.notify(event);
    }
}

struct ClientInner {
    transport: SignalingTransport,
    events: ObserverHub<SignalingEvent>,
    next_id: AtomicI64,
    timeout: Duration,
}

/// Envelope-level client on top of [`SignalingTransport`]
///
/// Requests get monotonically increasing ids; inbound requests and
/// notifications are routed to observers registered per method.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    /// `callbacks` is the context every request callback and every relayed
    /// event originates from
    pub fn new(connector: Arc<dyn Connector>, callbacks: Dispatcher, timeout: Duration) -> Self {
        let transport = SignalingTransport::new(connector, callbacks);
        let first_id = rand::thread_rng().gen_range(1..MAX_REQUEST_ID / 2);

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let relay: Arc<dyn Observer<TransportEvent>> = Arc::new(Relay {
                client: weak.clone(),
            });
            transport
                .events()
                .register(relay, transport.callbacks(), None);

            ClientInner {
                transport,
                events: ObserverHub::new(),
                next_id: AtomicI64::new(first_id),
                timeout,
            }
        });

        Self { inner }
    }

    pub fn transport(&self) -> &SignalingTransport {
        &self.inner.transport
    }

    pub fn events(&self) -> &ObserverHub<SignalingEvent> {
        &self.inner.events
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn connect(&self, url: String, subprotocol: String) -> bool {
        self.inner.transport.connect(url, subprotocol)
    }

    pub fn close(&self) {
        self.inner.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.transport.is_open()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.transport.in_flight()
    }

    fn next_id(&self) -> RequestId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        id % MAX_REQUEST_ID
    }

    /// Send a request; exactly one callback runs on the callback context
    pub fn request(
        &self,
        method: &str,
        data: Value,
        on_success: impl FnOnce(Value) + Send + 'static,
        on_failure: impl FnOnce(SignalingError) + Send + 'static,
    ) -> RequestId {
        let id = self.next_id();
        self.inner
            .transport
            .send_request(id, method, data, self.inner.timeout, on_success, on_failure);
        id
    }

    pub async fn request_async(&self, method: &str, data: Value) -> Result<Value, SignalingError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_err = tx.clone();
        self.request(
            method,
            data,
            move |value| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(value));
                }
            },
            move |err| {
                if let Some(tx) = tx_err.lock().take() {
                    let _ = tx.send(Err(err));
                }
            },
        );
        rx.await.unwrap_or(Err(SignalingError::ConnectionClosed))
    }

    /// [`Self::request_async`] with the response data deserialized
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        data: Value,
    ) -> Result<T, SignalingError> {
        let value = self.request_async(method, data).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a one-way notification to the peer
    pub fn notify_peer(&self, method: &str, data: Value) -> Result<(), SignalingError> {
        self.inner
            .transport
            .send_envelope(&Envelope::notification(method, data))
    }

    pub fn cancel(&self, id: RequestId) -> bool {
        self.inner.transport.cancel(id)
    }

    /// Observe notifications whose method is in `methods`
    pub fn on_notification(
        &self,
        methods: &[&str],
        observer: Arc<dyn Observer<SignalingEvent>>,
        target: &Dispatcher,
    ) -> bool {
        let methods: Vec<String> = methods.iter().map(|m| m.to_string()).collect();
        let predicate: Predicate<SignalingEvent> = Arc::new(move |event| match event {
            SignalingEvent::Notification(n) => methods.iter().any(|m| *m == n.method),
            _ => false,
        });
        self.inner.events.register(observer, target, Some(predicate))
    }

    /// Observe peer requests whose method is in `methods`
    pub fn on_request(
        &self,
        methods: &[&str],
        observer: Arc<dyn Observer<SignalingEvent>>,
        target: &Dispatcher,
    ) -> bool {
        let methods: Vec<String> = methods.iter().map(|m| m.to_string()).collect();
        let predicate: Predicate<SignalingEvent> = Arc::new(move |event| match event {
            SignalingEvent::Request(r) => methods.iter().any(|m| *m == r.method),
            _ => false,
        });
        self.inner.events.register(observer, target, Some(predicate))
    }

    /// Observe `Opened`, `Closed` and `Failed`
    pub fn on_connection(
        &self,
        observer: Arc<dyn Observer<SignalingEvent>>,
        target: &Dispatcher,
    ) -> bool {
        let predicate: Predicate<SignalingEvent> = Arc::new(|event| {
            matches!(
                event,
                SignalingEvent::Opened | SignalingEvent::Closed | SignalingEvent::Failed(_)
            )
        });
        self.inner.events.register(observer, target, Some(predicate))
    }

    /// Observe every signaling event
    pub fn subscribe(
        &self,
        observer: Arc<dyn Observer<SignalingEvent>>,
        target: &Dispatcher,
    ) -> bool {
        self.inner.events.register(observer, target, None)
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn Observer<SignalingEvent>>) -> bool {
        self.inner.events.remove(observer)
    }
}
