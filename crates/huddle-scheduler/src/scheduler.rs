use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::priority::{Priority, Route, WeightConfig};
use crate::queue::{PriorityQueues, TaskId};

/// A request the scheduler can queue and hand to an [`Executor`]
///
/// Request failures belong in `Output` (typically a `Result`); the scheduler
/// only adds its own cancellation and shutdown outcomes on top.
pub trait NetworkRequest: Send + Sync + 'static {
    type Output: Send + 'static;

    fn route(&self) -> Route;

    fn priority(&self) -> Priority {
        Priority::Normal
    }
}

/// Performs requests for the consumers of one or more routes
#[async_trait]
pub trait Executor<R: NetworkRequest>: Send + Sync + 'static {
    async fn execute(&self, request: Arc<R>) -> R::Output;
}

/// Terminal callback of a task, invoked exactly once
pub type Completion<O> = Box<dyn FnOnce(Result<O, SchedulerError>) + Send>;

struct Pending<R: NetworkRequest> {
    request: Arc<R>,
    completion: Completion<R::Output>,
}

struct ConsumerSlot {
    routes: HashSet<Route>,
    wakeup: Arc<Notify>,
}

struct State<R: NetworkRequest> {
    queues: PriorityQueues<Pending<R>>,
    active: HashMap<TaskId, CancellationToken>,
    consumers: Vec<ConsumerSlot>,
    shut_down: bool,
}

struct Shared<R: NetworkRequest> {
    state: Mutex<State<R>>,
    next_id: AtomicU64,
    stop: CancellationToken,
}

impl<R: NetworkRequest> Drop for Shared<R> {
    fn drop(&mut self) {
        self.stop.cancel();
        let state = self.state.get_mut();
        for token in state.active.values() {
            token.cancel();
        }
        for entry in state.queues.drain() {
            (entry.payload.completion)(Err(SchedulerError::Shutdown));
        }
    }
}

/// Route-partitioned priority scheduler
///
/// Cloning yields another handle to the same queues. Consumers only hold weak
/// references, so dropping the last handle shuts the scheduler down.
pub struct RequestScheduler<R: NetworkRequest> {
    shared: Arc<Shared<R>>,
}

impl<R: NetworkRequest> Clone for RequestScheduler<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: NetworkRequest> RequestScheduler<R> {
    pub fn new(weights: WeightConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queues: PriorityQueues::new(weights),
                    active: HashMap::new(),
                    consumers: Vec::new(),
                    shut_down: false,
                }),
                next_id: AtomicU64::new(1),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Spawn `concurrency` consumers serving `route`
    pub fn add_route(&self, route: Route, concurrency: usize, executor: Arc<dyn Executor<R>>) {
        self.add_consumers(&[route], concurrency, executor);
    }

    /// Spawn `concurrency` consumers, each able to serve every route in `routes`
    pub fn add_consumers(
        &self,
        routes: &[Route],
        concurrency: usize,
        executor: Arc<dyn Executor<R>>,
    ) {
        let routes: HashSet<Route> = routes.iter().cloned().collect();

        for index in 0..concurrency.max(1) {
            let wakeup = Arc::new(Notify::new());
            {
                let mut state = self.shared.state.lock();
                if state.shut_down {
                    return;
                }
                state.consumers.push(ConsumerSlot {
                    routes: routes.clone(),
                    wakeup: wakeup.clone(),
                });
            }

            let consumer = Consumer {
                shared: Arc::downgrade(&self.shared),
                routes: routes.clone(),
                executor: executor.clone(),
                wakeup: wakeup.clone(),
                stop: self.shared.stop.clone(),
            };
            tracing::debug!(routes = ?routes, index, "Starting request consumer");
            tokio::spawn(consumer.run());

            // Work may already be waiting for this route
            wakeup.notify_one();
        }
    }

    /// Queue a request; `on_complete` fires exactly once with its outcome
    pub fn add_request(
        &self,
        request: R,
        to_tail: bool,
        on_complete: impl FnOnce(Result<R::Output, SchedulerError>) + Send + 'static,
    ) -> TaskId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let route = request.route();
        let priority = request.priority();
        let pending = Pending {
            request: Arc::new(request),
            completion: Box::new(on_complete),
        };

        let wakeups: Vec<Arc<Notify>> = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                drop(state);
                (pending.completion)(Err(SchedulerError::Shutdown));
                return id;
            }
            state
                .queues
                .push(id, route.clone(), priority, pending, to_tail);
            state
                .consumers
                .iter()
                .filter(|c| c.routes.contains(&route))
                .map(|c| c.wakeup.clone())
                .collect()
        };

        tracing::trace!(
            task_id = id,
            %route,
            ?priority,
            consumers = wakeups.len(),
            "Request queued"
        );
        for wakeup in wakeups {
            wakeup.notify_one();
        }
        id
    }

    /// Queue a request and wait for its outcome
    pub async fn submit(&self, request: R, to_tail: bool) -> Result<R::Output, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.add_request(request, to_tail, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(SchedulerError::Shutdown))
    }

    /// Cancel one task. Queued tasks complete with `Cancelled` right away;
    /// in-flight tasks are interrupted by their consumer. Returns false when
    /// the task is unknown or already finished.
    pub fn cancel_request(&self, id: TaskId) -> bool {
        let entry = {
            let mut state = self.shared.state.lock();
            match state.queues.remove(id) {
                Some(entry) => entry,
                None => {
                    return match state.active.get(&id) {
                        Some(token) => {
                            token.cancel();
                            true
                        }
                        None => false,
                    };
                }
            }
        };

        tracing::debug!(task_id = id, "Cancelled queued request");
        (entry.payload.completion)(Err(SchedulerError::Cancelled));
        true
    }

    /// Cancel every queued and in-flight task on every route
    pub fn cancel_all(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            for token in state.active.values() {
                token.cancel();
            }
            state.queues.drain()
        };

        tracing::debug!(cancelled = drained.len(), "Cancelled all queued requests");
        for entry in drained {
            (entry.payload.completion)(Err(SchedulerError::Cancelled));
        }
    }

    /// Cancel everything, stop consumers and refuse further requests
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shut_down = true;
            state.consumers.clear();
        }
        self.cancel_all();
        self.shared.stop.cancel();
    }

    pub fn queued(&self, priority: Priority) -> usize {
        self.shared.state.lock().queues.len(priority)
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.queues.is_empty() && state.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.shared.state.lock().active.len()
    }
}

struct Consumer<R: NetworkRequest> {
    shared: Weak<Shared<R>>,
    routes: HashSet<Route>,
    executor: Arc<dyn Executor<R>>,
    wakeup: Arc<Notify>,
    stop: CancellationToken,
}

impl<R: NetworkRequest> Consumer<R> {
    async fn run(self) {
        loop {
            match self.next_task() {
                Some((id, pending, token)) => {
                    let result = tokio::select! {
                        biased;
                        () = token.cancelled() => Err(SchedulerError::Cancelled),
                        output = self.executor.execute(pending.request.clone()) => Ok(output),
                    };

                    if let Some(shared) = self.shared.upgrade() {
                        shared.state.lock().active.remove(&id);
                    }
                    if result.is_err() {
                        tracing::debug!(task_id = id, "In-flight request cancelled");
                    }
                    (pending.completion)(result);
                }
                None => {
                    tokio::select! {
                        () = self.wakeup.notified() => {}
                        () = self.stop.cancelled() => break,
                    }
                }
            }
        }

        tracing::debug!(routes = ?self.routes, "Request consumer stopped");
    }

    fn next_task(&self) -> Option<(TaskId, Pending<R>, CancellationToken)> {
        let shared = self.shared.upgrade()?;
        let mut state = shared.state.lock();
        if state.shut_down {
            return None;
        }
        let (_, entry) = state.queues.pop_for(|route| self.routes.contains(route))?;
        let token = shared.stop.child_token();
        state.active.insert(entry.id, token.clone());
        Some((entry.id, entry.payload, token))
    }
}
