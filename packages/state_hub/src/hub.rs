use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::queue::{Notification, QueueHandle, QueueId, StateChangeQueue, terminal};

struct Subscriber<F: ?Sized> {
    queue: QueueHandle,
    factory: Arc<F>,
}

struct HubState<F: ?Sized> {
    stopped: bool,
    subscribers: HashMap<QueueId, Subscriber<F>>,
}

/// Fan-out of events to every subscribed queue.
///
/// `F` is the notification factory type each subscriber supplies. A single
/// lock serializes subscribe, unsubscribe, publish and stop, so every queue sees
/// notifications in publish order. There is no ordering across queues.
pub struct StateChangeHub<F: ?Sized> {
    state: Mutex<HubState<F>>,
    next_id: AtomicU64,
}

impl<F: ?Sized> Default for StateChangeHub<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> StateChangeHub<F> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                stopped: false,
                subscribers: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    // The map is consistent between statements, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, HubState<F>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber. Returns `None` once the hub has been stopped.
    pub fn subscribe(&self, factory: Arc<F>) -> Option<StateChangeQueue> {
        let mut state = self.lock();
        if state.stopped {
            return None;
        }

        let id = QueueId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (handle, queue) = StateChangeQueue::new(id);
        state.subscribers.insert(
            id,
            Subscriber {
                queue: handle,
                factory,
            },
        );
        debug!("Subscribed {} ({} total)", id, state.subscribers.len());
        Some(queue)
    }

    /// Remove a subscriber. Notifications already buffered in its queue are
    /// never run: the queue's next `take` yields the terminal notification.
    pub fn unsubscribe(&self, queue: &StateChangeQueue) -> bool {
        self.remove(queue.id())
    }

    fn remove(&self, id: QueueId) -> bool {
        match self.lock().subscribers.remove(&id) {
            Some(subscriber) => {
                subscriber.queue.detach();
                debug!("Unsubscribed {}", id);
                true
            }
            None => false,
        }
    }

    /// Build one notification per subscriber with `build` and enqueue it.
    ///
    /// Subscribers whose queue has been dropped are pruned on the way.
    pub fn publish<B>(&self, build: B)
    where
        B: Fn(&F) -> Notification,
    {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        state.subscribers.retain(|id, subscriber| {
            let delivered = subscriber.queue.send(build(&subscriber.factory));
            if !delivered {
                trace!("Dropping {}: queue is gone", id);
            }
            delivered
        });
    }

    /// Stop the hub: refuse new subscribers and wake every consumer with a
    /// terminal notification. Calling it again has no effect.
    pub fn stop(&self) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        for subscriber in state.subscribers.values() {
            subscriber.queue.send(terminal());
        }
        debug!(
            "Hub stopped with {} subscriber(s) notified",
            state.subscribers.len()
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Subscribe with `factory` and drain the queue on the calling thread until a
    /// notification reports stop. The subscription is removed on the way out,
    /// including when a notification panics.
    ///
    /// Returns `false` without blocking if the hub was already stopped.
    pub fn run_subscriber(&self, factory: Arc<F>) -> bool {
        let Some(mut queue) = self.subscribe(factory) else {
            return false;
        };
        let _guard = SubscriptionGuard {
            hub: self,
            id: queue.id(),
        };

        loop {
            let notification = queue.take();
            if !notification().should_continue {
                break;
            }
        }
        true
    }
}

struct SubscriptionGuard<'a, F: ?Sized> {
    hub: &'a StateChangeHub<F>,
    id: QueueId,
}

impl<F: ?Sized> Drop for SubscriptionGuard<'_, F> {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}
