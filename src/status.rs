//! Single observable `Status` record behind a lock, with synchronous
//! subscriber callback dispatch on every state-changing mutation.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::types::Status;

pub type StatusSubscriber = Box<dyn Fn(&Status) + Send + Sync>;

/// Publishes `status-changed` events to registered subscribers,
/// exactly one per state transition, matching the Go original's
/// reflect.DeepEqual diff-before-publish idiom (here: `PartialEq`).
pub struct StatusPublisher {
    current: Mutex<Status>,
    subscribers: Mutex<Vec<StatusSubscriber>>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Status::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(self: &Arc<Self>, callback: StatusSubscriber) {
        self.subscribers.lock().unwrap().push(callback);
    }

    pub fn get(&self) -> Status {
        self.current.lock().unwrap().clone()
    }

    /// Replace the current status and publish iff it actually changed.
    pub fn update(&self, new_status: Status) {
        let mut current = self.current.lock().unwrap();
        if *current == new_status {
            return;
        }
        *current = new_status.clone();
        drop(current);

        debug!("status changed: {:?}", new_status);
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber(&new_status);
        }
    }

    /// Mutate the current status in place via `f`, publishing iff it
    /// changed. `f` should return the updated status.
    pub fn mutate(&self, f: impl FnOnce(Status) -> Status) {
        let before = self.get();
        let after = f(before);
        self.update(after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::State;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publishes_exactly_once_per_distinct_transition() {
        let publisher = Arc::new(StatusPublisher::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        publisher.subscribe(Box::new(move |_status| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let mut status = publisher.get();
        status.state = State::WaitingForReader;
        publisher.update(status.clone());
        // Same value again: must not re-publish.
        publisher.update(status);

        status = publisher.get();
        status.state = State::WaitingForCard;
        publisher.update(status);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
