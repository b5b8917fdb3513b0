use std::collections::VecDeque;

use crate::priority::{Priority, Route, WeightConfig};

/// Identifier handed back by `add_request`, used for cancellation
pub type TaskId = u64;

/// A queued task plus its aging weight
#[derive(Debug)]
pub(crate) struct Entry<T> {
    pub id: TaskId,
    pub route: Route,
    pub weight: u32,
    pub payload: T,
}

/// One FIFO per priority level, with weight-based promotion
#[derive(Debug)]
pub(crate) struct PriorityQueues<T> {
    queues: [VecDeque<Entry<T>>; 4],
    weights: WeightConfig,
}

impl<T> PriorityQueues<T> {
    pub fn new(weights: WeightConfig) -> Self {
        Self {
            queues: Default::default(),
            weights,
        }
    }

    pub fn push(
        &mut self,
        id: TaskId,
        route: Route,
        priority: Priority,
        payload: T,
        to_tail: bool,
    ) {
        let entry = Entry {
            id,
            route,
            weight: self.weights.initial_weight(priority),
            payload,
        };
        let queue = &mut self.queues[priority.index()];
        if to_tail {
            queue.push_back(entry);
        } else {
            queue.push_front(entry);
        }
    }

    /// Take the first task, from the highest non-empty level, whose route the
    /// caller can serve. Every successful dequeue ages what is left behind.
    pub fn pop_for(&mut self, can_serve: impl Fn(&Route) -> bool) -> Option<(Priority, Entry<T>)> {
        for priority in Priority::DESCENDING {
            let queue = &mut self.queues[priority.index()];
            let Some(pos) = queue.iter().position(|e| can_serve(&e.route)) else {
                continue;
            };
            if let Some(entry) = queue.remove(pos) {
                self.age();
                return Some((priority, entry));
            }
        }
        None
    }

    fn age(&mut self) {
        let step = self.weights.aging_step;
        for priority in [Priority::Normal, Priority::Low] {
            for entry in self.queues[priority.index()].iter_mut() {
                entry.weight = entry.weight.saturating_add(step);
            }
        }

        // Normal first, so a task lifted out of Low this round stays in Normal
        self.promote(Priority::Normal, Priority::High, self.weights.high_threshold);
        self.promote(Priority::Low, Priority::Normal, self.weights.normal_threshold);
    }

    fn promote(&mut self, from: Priority, to: Priority, threshold: u32) {
        let source = std::mem::take(&mut self.queues[from.index()]);
        let (promoted, kept): (VecDeque<_>, VecDeque<_>) =
            source.into_iter().partition(|e| e.weight >= threshold);
        self.queues[from.index()] = kept;
        if !promoted.is_empty() {
            tracing::trace!(count = promoted.len(), ?from, ?to, "Promoting aged tasks");
        }
        self.queues[to.index()].extend(promoted);
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Entry<T>> {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|e| e.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    pub fn drain(&mut self) -> Vec<Entry<T>> {
        self.queues
            .iter_mut()
            .rev()
            .flat_map(|q| q.drain(..))
            .collect()
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}
