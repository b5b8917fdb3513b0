use async_trait::async_trait;
use huddle_protocol::{Envelope, Outcome, RequestId, Response};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::dispatch::{Dispatcher, ObserverHub};
use crate::error::SignalingError;

/// Both directions of an established text socket
pub struct SocketPair {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens the raw duplex connection underneath the signaling transport
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str, subprotocol: &str) -> Result<SocketPair, SignalingError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Closed,
    Failed(SignalingError),
    /// Peer request or notification; responses are consumed by correlation
    Inbound(Envelope),
}

/// Transports are single use: once closed they stay closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closed,
}

type SuccessCallback = Box<dyn FnOnce(Value) + Send>;
type FailureCallback = Box<dyn FnOnce(SignalingError) + Send>;

/// An in-flight request awaiting its response
pub struct PendingRequest {
    pub id: RequestId,
    pub method: String,
    pub created_at: Instant,
    pub executed_at: Option<Instant>,
    pub timeout: Duration,
    timer: Option<AbortHandle>,
    on_success: SuccessCallback,
    on_failure: FailureCallback,
}

impl PendingRequest {
    /// Fire the terminal callback on the callback context. Callers must have
    /// removed the request from the in-flight map first.
    fn finish(self, result: Result<Value, SignalingError>, callbacks: &Dispatcher) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        let finished_at = Instant::now();
        tracing::trace!(
            id = self.id,
            method = %self.method,
            elapsed = ?finished_at.duration_since(self.created_at),
            ok = result.is_ok(),
            "Request finished"
        );

        let (on_success, on_failure) = (self.on_success, self.on_failure);
        callbacks.dispatch(move || match result {
            Ok(data) => on_success(data),
            Err(err) => on_failure(err),
        });
    }
}

struct Link {
    state: TransportState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<AbortHandle>,
}

struct Inner {
    link: Mutex<Link>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    events: ObserverHub<TransportEvent>,
    callbacks: Dispatcher,
    connector: Arc<dyn Connector>,
}

impl Inner {
    fn handle_text(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(Envelope::Response(response)) => self.resolve(response),
            Ok(envelope) => self.events.notify(TransportEvent::Inbound(envelope)),
            Err(e) => tracing::warn!("Dropping malformed signaling message: {}", e),
        }
    }

    fn resolve(&self, response: Response) {
        let Some(request) = self.pending.lock().remove(&response.id) else {
            tracing::debug!(id = response.id, "Dropping response with no matching request");
            return;
        };

        let result = match response.outcome {
            Outcome::Ok(data) => Ok(data),
            Outcome::Error { code, reason } => Err(SignalingError::Rejected { code, reason }),
        };
        request.finish(result, &self.callbacks);
    }

    fn expire(&self, id: RequestId) {
        let Some(request) = self.pending.lock().remove(&id) else {
            return;
        };
        tracing::warn!(
            id,
            method = %request.method,
            timeout = ?request.timeout,
            "Signaling request timed out"
        );
        let timeout = request.timeout;
        request.finish(Err(SignalingError::Timeout { id, timeout }), &self.callbacks);
    }

    fn fail_all(&self, err: SignalingError) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Rejecting in-flight requests");
        }
        for request in drained {
            request.finish(Err(err.clone()), &self.callbacks);
        }
    }

    fn shutdown(&self) {
        let task = {
            let mut link = self.link.lock();
            if link.state == TransportState::Closed {
                return;
            }
            link.state = TransportState::Closed;
            link.outbound = None;
            link.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }

        self.fail_all(SignalingError::ConnectionClosed);
        tracing::info!("Signaling connection closed");
        self.events.notify(TransportEvent::Closed);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.link.get_mut().task.take() {
            task.abort();
        }
        self.fail_all(SignalingError::ConnectionClosed);
    }
}

/// Persistent signaling connection with request/response correlation
///
/// Cloning yields another handle to the same connection. Background tasks
/// hold weak references only, so dropping every handle tears it down.
#[derive(Clone)]
pub struct SignalingTransport {
    inner: Arc<Inner>,
}

impl SignalingTransport {
    /// `callbacks` is the context request callbacks are delivered on
    pub fn new(connector: Arc<dyn Connector>, callbacks: Dispatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                link: Mutex::new(Link {
                    state: TransportState::Idle,
                    outbound: None,
                    task: None,
                }),
                pending: Mutex::new(HashMap::new()),
                events: ObserverHub::new(),
                callbacks,
                connector,
            }),
        }
    }

    pub fn events(&self) -> &ObserverHub<TransportEvent> {
        &self.inner.events
    }

    pub fn callbacks(&self) -> &Dispatcher {
        &self.inner.callbacks
    }

    pub fn state(&self) -> TransportState {
        self.inner.link.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Number of requests awaiting a response
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Start connecting in the background. Progress is reported through
    /// [`Self::events`]. Returns false if this transport was already used.
    pub fn connect(&self, url: String, subprotocol: String) -> bool {
        {
            let mut link = self.inner.link.lock();
            if link.state != TransportState::Idle {
                tracing::warn!(state = ?link.state, "Transport already used, ignoring connect");
                return false;
            }
            link.state = TransportState::Connecting;
        }
        tracing::info!(%url, %subprotocol, "Connecting signaling transport");

        let weak = Arc::downgrade(&self.inner);
        let connector = self.inner.connector.clone();
        let handle = tokio::spawn(async move {
            let result = connector.connect(&url, &subprotocol).await;
            Self::run_link(weak, result).await;
        });

        let mut link = self.inner.link.lock();
        if link.state == TransportState::Closed {
            handle.abort();
        } else {
            link.task = Some(handle.abort_handle());
        }
        true
    }

    async fn run_link(weak: Weak<Inner>, result: Result<SocketPair, SignalingError>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let mut inbound = match result {
            Ok(SocketPair { outbound, inbound }) => {
                {
                    let mut link = inner.link.lock();
                    if link.state != TransportState::Connecting {
                        return;
                    }
                    link.state = TransportState::Open;
                    link.outbound = Some(outbound);
                }
                tracing::info!("Signaling connection open");
                inner.events.notify(TransportEvent::Opened);
                inbound
            }
            Err(err) => {
                tracing::error!("Signaling connection failed: {}", err);
                inner.events.notify(TransportEvent::Failed(err));
                inner.shutdown();
                return;
            }
        };
        drop(inner);

        while let Some(text) = inbound.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.handle_text(&text);
        }

        tracing::info!("Signaling connection closed by peer");
        if let Some(inner) = weak.upgrade() {
            inner.shutdown();
        }
    }

    /// Send a request and track it until it resolves
    ///
    /// Exactly one of `on_success`/`on_failure` eventually runs, on the
    /// callback context: after the response, after `timeout`, on
    /// [`Self::cancel`] or when the connection closes.
    pub fn send_request(
        &self,
        id: RequestId,
        method: &str,
        data: Value,
        timeout: Duration,
        on_success: impl FnOnce(Value) + Send + 'static,
        on_failure: impl FnOnce(SignalingError) + Send + 'static,
    ) {
        let link = {
            let link = self.inner.link.lock();
            match (link.state, &link.outbound) {
                (TransportState::Open, Some(outbound)) => Ok(outbound.clone()),
                (state, _) => Err(state),
            }
        };
        let outbound = match link {
            Ok(outbound) => outbound,
            Err(state) => {
                let err = SignalingError::Transport(format!("not connected ({:?})", state));
                self.inner.callbacks.dispatch(move || on_failure(err));
                return;
            }
        };

        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&id) {
                drop(pending);
                let err = SignalingError::Protocol(format!("request id {} already in flight", id));
                self.inner.callbacks.dispatch(move || on_failure(err));
                return;
            }

            let weak = Arc::downgrade(&self.inner);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(id);
                }
            });

            pending.insert(
                id,
                PendingRequest {
                    id,
                    method: method.to_string(),
                    created_at: Instant::now(),
                    executed_at: None,
                    timeout,
                    timer: Some(timer.abort_handle()),
                    on_success: Box::new(on_success),
                    on_failure: Box::new(on_failure),
                },
            );
        }

        // A close racing with this send drains the map after flipping the state
        if !self.is_open() {
            self.fail(id, SignalingError::ConnectionClosed);
            return;
        }

        let text = Envelope::request(id, method, data).to_json();
        if outbound.send(text).is_err() {
            self.fail(id, SignalingError::Transport("socket writer is gone".into()));
            return;
        }

        if let Some(request) = self.inner.pending.lock().get_mut(&id) {
            request.executed_at = Some(Instant::now());
        }
        tracing::debug!(id, method, "Signaling request sent");
    }

    /// Send a notification or a response; nothing is tracked
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), SignalingError> {
        let outbound = self
            .inner
            .link
            .lock()
            .outbound
            .clone()
            .ok_or_else(|| SignalingError::Transport("not connected".into()))?;
        outbound
            .send(envelope.to_json())
            .map_err(|_| SignalingError::Transport("socket writer is gone".into()))
    }

    /// Reject an in-flight request with `Cancelled`. Returns false if it had
    /// already finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.fail(id, SignalingError::Cancelled)
    }

    fn fail(&self, id: RequestId, err: SignalingError) -> bool {
        let Some(request) = self.inner.pending.lock().remove(&id) else {
            return false;
        };
        request.finish(Err(err), &self.inner.callbacks);
        true
    }

    /// Close the connection. Idempotent; pending requests fail with
    /// `ConnectionClosed` and `Closed` is emitted once.
    pub fn close(&self) {
        self.inner.shutdown();
    }
}
