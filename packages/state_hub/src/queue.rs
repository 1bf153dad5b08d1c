use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

/// Whether a subscriber keeps consuming after running a notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerResult {
    pub should_continue: bool,
}

impl HandlerResult {
    pub const CONTINUE: Self = Self {
        should_continue: true,
    };
    pub const STOP: Self = Self {
        should_continue: false,
    };
}

impl From<bool> for HandlerResult {
    fn from(should_continue: bool) -> Self {
        Self { should_continue }
    }
}

/// A zero-argument closure built for one subscriber at publish time.
pub type Notification = Box<dyn FnOnce() -> HandlerResult + Send>;

pub(crate) fn terminal() -> Notification {
    Box::new(|| HandlerResult::STOP)
}

/// Identity of a subscriber queue within its hub
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct QueueId(pub u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue-{}", self.0)
    }
}

/// Hub-side end of a subscriber queue
pub(crate) struct QueueHandle {
    sender: mpsc::UnboundedSender<Notification>,
    detached: Arc<AtomicBool>,
}

impl QueueHandle {
    /// Returns `false` once the consumer has dropped its queue.
    pub(crate) fn send(&self, notification: Notification) -> bool {
        self.sender.send(notification).is_ok()
    }

    /// Cut the queue off: anything still buffered is discarded by the consumer.
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

/// FIFO of notifications for exactly one subscriber.
///
/// The queue is unbounded: a subscriber that stops draining it accumulates
/// memory until it unsubscribes. After unsubscribing, buffered notifications
/// are never run; the next `take` returns the terminal notification.
pub struct StateChangeQueue {
    id: QueueId,
    receiver: mpsc::UnboundedReceiver<Notification>,
    detached: Arc<AtomicBool>,
}

impl StateChangeQueue {
    pub(crate) fn new(id: QueueId) -> (QueueHandle, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let detached = Arc::new(AtomicBool::new(false));
        let handle = QueueHandle {
            sender,
            detached: detached.clone(),
        };
        (
            handle,
            Self {
                id,
                receiver,
                detached,
            },
        )
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Block the current thread until a notification is available.
    ///
    /// Once the queue is unsubscribed, or the hub is dropped and the buffer is
    /// drained, a terminal notification is returned so consumer loops end the
    /// same way they do after a hub stop.
    ///
    /// Must not be called from inside an async runtime; use [`recv`](Self::recv) there.
    pub fn take(&mut self) -> Notification {
        if self.is_detached() {
            return terminal();
        }
        self.receiver.blocking_recv().unwrap_or_else(terminal)
    }

    /// Async counterpart of [`take`](Self::take).
    pub async fn recv(&mut self) -> Notification {
        if self.is_detached() {
            return terminal();
        }
        self.receiver.recv().await.unwrap_or_else(terminal)
    }

    /// Non-blocking poll; `None` when nothing is buffered or the queue was
    /// unsubscribed.
    pub fn try_take(&mut self) -> Option<Notification> {
        if self.is_detached() {
            return None;
        }
        self.receiver.try_recv().ok()
    }
}

impl fmt::Debug for StateChangeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateChangeQueue")
            .field("id", &self.id)
            .field("pending", &self.receiver.len())
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_in_fifo_order() {
        let (handle, mut queue) = StateChangeQueue::new(QueueId(7));
        for keep_going in [true, true, false] {
            handle.send(Box::new(move || HandlerResult::from(keep_going)));
        }

        let seen: Vec<bool> = (0..3).map(|_| queue.take()().should_continue).collect();
        assert_eq!(seen, vec![true, true, false]);
    }

    #[test]
    fn disconnected_queue_yields_terminal() {
        let (handle, mut queue) = StateChangeQueue::new(QueueId(1));
        handle.send(Box::new(|| HandlerResult::CONTINUE));
        drop(handle);

        assert!(queue.take()().should_continue);
        assert!(!queue.take()().should_continue);
        assert!(!queue.take()().should_continue);
    }

    #[tokio::test]
    async fn recv_waits_for_sender() {
        let (handle, mut queue) = StateChangeQueue::new(QueueId(2));
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            handle.send(Box::new(|| HandlerResult::STOP));
        });

        let result = (queue.recv().await)();
        assert_eq!(result, HandlerResult::STOP);
    }

    #[test]
    fn detached_queue_discards_buffered_notifications() {
        let (handle, mut queue) = StateChangeQueue::new(QueueId(4));
        handle.send(Box::new(|| HandlerResult::CONTINUE));
        handle.detach();

        assert!(queue.try_take().is_none());
        assert!(!queue.take()().should_continue);
    }

    #[test]
    fn queue_id_display() {
        assert_eq!(QueueId(3).to_string(), "queue-3");
    }
}
