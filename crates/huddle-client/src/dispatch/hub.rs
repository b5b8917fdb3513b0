use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::context::Dispatcher;

/// Receives events from an [`ObserverHub`]
pub trait Observer<E>: Send + Sync + 'static {
    fn on_event(&self, event: &E);
}

struct FnObserver<F>(F);

impl<E, F> Observer<E> for FnObserver<F>
where
    F: Fn(&E) + Send + Sync + 'static,
{
    fn on_event(&self, event: &E) {
        (self.0)(event)
    }
}

/// Wrap a closure as an observer
pub fn observer_fn<E: 'static>(f: impl Fn(&E) + Send + Sync + 'static) -> Arc<dyn Observer<E>> {
    Arc::new(FnObserver(f))
}

/// Accept-predicate evaluated before delivery
pub type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

enum Handle<E> {
    Strong(Arc<dyn Observer<E>>),
    Weak(Weak<dyn Observer<E>>),
}

impl<E> Clone for Handle<E> {
    fn clone(&self) -> Self {
        match self {
            Handle::Strong(o) => Handle::Strong(o.clone()),
            Handle::Weak(o) => Handle::Weak(o.clone()),
        }
    }
}

impl<E: 'static> Handle<E> {
    fn is_alive(&self) -> bool {
        match self {
            Handle::Strong(_) => true,
            Handle::Weak(o) => o.strong_count() > 0,
        }
    }

    fn deliver(&self, event: &E) {
        match self {
            Handle::Strong(o) => o.on_event(event),
            // Owner already gone: nothing to do
            Handle::Weak(o) => {
                if let Some(o) = o.upgrade() {
                    o.on_event(event);
                }
            }
        }
    }
}

struct Registration<E> {
    key: usize,
    handle: Handle<E>,
    target: Dispatcher,
    predicate: Option<Predicate<E>>,
}

/// Identity of the observer allocation, shared by strong and weak handles
fn key_of<E>(observer: &Arc<dyn Observer<E>>) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

/// Thread-aware publish/subscribe registry
///
/// Each registration names the context its observer wants events on. A
/// `notify` call delivers inline when the caller already runs on that context
/// and posts a closure to it otherwise, so deliveries from one source to one
/// target context keep their call order.
pub struct ObserverHub<E> {
    registrations: Mutex<Vec<Registration<E>>>,
}

impl<E> Default for ObserverHub<E> {
    fn default() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Send + Sync + 'static> ObserverHub<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register with a strong reference. Returns false if this observer is
    /// already registered.
    pub fn register(
        &self,
        observer: Arc<dyn Observer<E>>,
        target: &Dispatcher,
        predicate: Option<Predicate<E>>,
    ) -> bool {
        let key = key_of(&observer);
        self.insert(key, Handle::Strong(observer), target, predicate)
    }

    /// Register without keeping the observer alive. The entry is pruned once
    /// the observer is dropped.
    pub fn register_weak(
        &self,
        observer: &Arc<dyn Observer<E>>,
        target: &Dispatcher,
        predicate: Option<Predicate<E>>,
    ) -> bool {
        let key = key_of(observer);
        self.insert(key, Handle::Weak(Arc::downgrade(observer)), target, predicate)
    }

    fn insert(
        &self,
        key: usize,
        handle: Handle<E>,
        target: &Dispatcher,
        predicate: Option<Predicate<E>>,
    ) -> bool {
        let mut registrations = self.registrations.lock();
        if registrations
            .iter()
            .any(|r| r.key == key && r.handle.is_alive())
        {
            return false;
        }
        registrations.push(Registration {
            key,
            handle,
            target: target.clone(),
            predicate,
        });
        true
    }

    pub fn remove(&self, observer: &Arc<dyn Observer<E>>) -> bool {
        let key = key_of(observer);
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| r.key != key);
        registrations.len() != before
    }

    pub fn clear(&self) {
        self.registrations.lock().clear();
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.handle.is_alive())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: E) {
        let snapshot: Vec<(Handle<E>, Dispatcher, Option<Predicate<E>>)> = {
            let mut registrations = self.registrations.lock();
            registrations.retain(|r| r.handle.is_alive());
            registrations
                .iter()
                .map(|r| (r.handle.clone(), r.target.clone(), r.predicate.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let event = Arc::new(event);
        for (handle, target, predicate) in snapshot {
            if let Some(accept) = predicate {
                if !accept(&event) {
                    continue;
                }
            }

            if target.is_current() {
                handle.deliver(&event);
            } else {
                let event = event.clone();
                if !target.post(move || handle.deliver(&event)) {
                    tracing::debug!(context = target.name(), "Dropping event for stopped context");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<u32>>,
    }

    impl Observer<u32> for Recorder {
        fn on_event(&self, event: &u32) {
            self.events.lock().push(*event);
        }
    }

    fn recorder() -> (Arc<Recorder>, Arc<dyn Observer<u32>>) {
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn Observer<u32>> = recorder.clone();
        (recorder, observer)
    }

    #[tokio::test]
    async fn test_same_source_same_target_preserves_order() {
        let hub = ObserverHub::new();
        let target = Dispatcher::spawn("observer");
        let (recorder, observer) = recorder();
        hub.register(observer, &target, None);

        for i in 0..100 {
            hub.notify(i);
        }
        target.flush().await;

        assert_eq!(*recorder.events.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_noop() {
        let hub = ObserverHub::new();
        let target = Dispatcher::spawn("observer");
        let (recorder, observer) = recorder();

        assert!(hub.register(observer.clone(), &target, None));
        assert!(!hub.register(observer.clone(), &target, None));
        assert!(!hub.register_weak(&observer, &target, None));
        assert_eq!(hub.len(), 1);

        hub.notify(7);
        target.flush().await;
        assert_eq!(*recorder.events.lock(), vec![7]);
    }

    #[tokio::test]
    async fn test_predicate_filters_events() {
        let hub = ObserverHub::new();
        let target = Dispatcher::spawn("observer");
        let (recorder, observer) = recorder();
        hub.register(observer, &target, Some(Arc::new(|e: &u32| e % 2 == 0)));

        for i in 0..6 {
            hub.notify(i);
        }
        target.flush().await;

        assert_eq!(*recorder.events.lock(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_dead_weak_observer_is_pruned() {
        let hub = ObserverHub::new();
        let target = Dispatcher::spawn("observer");
        let (recorder, observer) = recorder();
        hub.register_weak(&observer, &target, None);
        assert_eq!(hub.len(), 1);

        drop(observer);
        drop(recorder);
        hub.notify(1);
        target.flush().await;

        assert_eq!(hub.len(), 0);
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_weak_owner_dropped_before_delivery_is_noop() {
        let hub = ObserverHub::new();
        let target = Dispatcher::spawn("observer");
        let (recorder, observer) = recorder();
        hub.register_weak(&observer, &target, None);

        // Block the target so the delivery is still queued when the owner dies
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        target.post(move || {
            let _ = release_rx.recv();
        });
        hub.notify(5);
        let weak = Arc::downgrade(&recorder);
        drop(observer);
        drop(recorder);
        let _ = release_tx.send(());
        target.flush().await;

        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_inline_delivery_on_target_context() {
        let hub = Arc::new(ObserverHub::new());
        let target = Dispatcher::spawn("observer");
        let (recorder, observer) = recorder();
        hub.register(observer, &target, None);

        let seen_inline = Arc::new(Mutex::new(Vec::new()));
        let (hub2, rec2, seen) = (hub.clone(), recorder.clone(), seen_inline.clone());
        target.post(move || {
            hub2.notify(9);
            // Delivered before notify returned
            seen.lock().push(rec2.events.lock().clone());
        });
        target.flush().await;

        assert_eq!(*seen_inline.lock(), vec![vec![9]]);
    }

    #[tokio::test]
    async fn test_remove_and_clear_are_idempotent() {
        let hub = ObserverHub::new();
        let target = Dispatcher::spawn("observer");
        let (_recorder, observer) = recorder();
        hub.register(observer.clone(), &target, None);

        assert!(hub.remove(&observer));
        assert!(!hub.remove(&observer));
        hub.clear();
        hub.clear();
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_closure_observer() {
        let hub = ObserverHub::new();
        let target = Dispatcher::spawn("observer");
        let total = Arc::new(Mutex::new(0));
        let sum = total.clone();
        hub.register(observer_fn(move |e: &u32| *sum.lock() += *e), &target, None);

        hub.notify(2);
        hub.notify(3);
        target.flush().await;
        assert_eq!(*total.lock(), 5);
    }
}
