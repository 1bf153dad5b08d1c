use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::device::write_frame;
use crate::hub::StateChangeHub;
use crate::queue::{Notification, StateChangeQueue};

/// Builds subscriber-specific notifications for debuggable-client events.
pub trait ClientChangeHandlerFactory: Send + Sync {
    fn client_list_changed(&self, pids: &[u32]) -> Notification;
}

/// Hub for changes to the set of debuggable client processes
#[derive(Default)]
pub struct ClientStateChangeHub {
    hub: StateChangeHub<dyn ClientChangeHandlerFactory>,
}

impl ClientStateChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        factory: Arc<dyn ClientChangeHandlerFactory>,
    ) -> Option<StateChangeQueue> {
        self.hub.subscribe(factory)
    }

    pub fn unsubscribe(&self, queue: &StateChangeQueue) -> bool {
        self.hub.unsubscribe(queue)
    }

    pub fn stop(&self) {
        self.hub.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.hub.is_stopped()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// See [`StateChangeHub::run_subscriber`].
    pub fn run_subscriber(&self, factory: Arc<dyn ClientChangeHandlerFactory>) -> bool {
        self.hub.run_subscriber(factory)
    }

    pub fn client_list_changed(&self, pids: &[u32]) {
        self.hub.publish(|factory| factory.client_list_changed(pids));
    }
}

/// Writes hex4-framed pid lists, one pid per line, to one track-jdwp connection.
pub struct TrackJdwpFactory<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> TrackJdwpFactory<W> {
    pub fn new(writer: Arc<Mutex<W>>) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send + 'static> ClientChangeHandlerFactory for TrackJdwpFactory<W> {
    fn client_list_changed(&self, pids: &[u32]) -> Notification {
        let payload: String = pids.iter().map(|pid| format!("{}\n", pid)).collect();
        let writer = self.writer.clone();
        Box::new(move || write_frame(&writer, payload.as_bytes()))
    }
}
