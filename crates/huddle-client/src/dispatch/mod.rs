//! Execution contexts and thread-aware event delivery

mod context;
mod hub;

pub use context::{current_context, ContextId, Dispatcher, Job};
pub use hub::{observer_fn, Observer, ObserverHub, Predicate};
