//! Execution contexts
//!
//! A context is a tokio task draining a mailbox of closures one at a time.
//! Code running inside a job can ask which context it is on, which is what
//! lets the observer hub decide between inline and posted delivery.

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub type Job = Box<dyn FnOnce() + Send>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Context the caller is currently executing on, if any
pub fn current_context() -> Option<ContextId> {
    CURRENT.with(Cell::get)
}

/// Handle to a serial execution context
#[derive(Clone)]
pub struct Dispatcher {
    id: ContextId,
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Job>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Dispatcher {
    /// Start a new context on the current tokio runtime. It stops once every
    /// handle to it has been dropped and its mailbox is drained.
    pub fn spawn(name: &str) -> Self {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let name: Arc<str> = Arc::from(name);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let task_name = name.clone();
        tokio::spawn(async move {
            tracing::trace!(context = %task_name, %id, "Execution context started");
            while let Some(job) = receiver.recv().await {
                let previous = CURRENT.with(|c| c.replace(Some(id)));
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(context = %task_name, "Job panicked on execution context");
                }
                CURRENT.with(|c| c.set(previous));
            }
            tracing::trace!(context = %task_name, %id, "Execution context stopped");
        });

        Self { id, name, sender }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_current(&self) -> bool {
        current_context() == Some(self.id)
    }

    /// Enqueue a job. Returns false if the context has stopped.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.sender.send(Box::new(job)).is_ok()
    }

    /// Run `job` on this context: inline when already on it, posted otherwise.
    /// If the context has stopped the job runs on the caller so it is never lost.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.is_current() {
            job();
            return;
        }
        if let Err(mpsc::error::SendError(job)) = self.sender.send(Box::new(job)) {
            tracing::debug!(context = %self.name, "Context stopped, running job inline");
            job();
        }
    }

    /// Resolves once every job posted before this call has run
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.post(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }
}
