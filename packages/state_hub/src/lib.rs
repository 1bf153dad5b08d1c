//! State Hub - many-subscriber fan-out of device and client state changes
//!
//! Every long-lived tracking connection (track-devices, track-jdwp, ...) gets
//! its own [`StateChangeQueue`]. Producers publish events on a hub; the hub asks
//! each subscriber's factory for a notification tailored to that subscriber and
//! enqueues it. The hub never knows how a subscriber serializes its view.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use state_hub::{DeviceState, DeviceStateChangeHub, DeviceStatus, TrackDevicesFactory};
//!
//! let hub = DeviceStateChangeHub::new();
//! let sink = Arc::new(Mutex::new(Vec::<u8>::new()));
//! let mut queue = hub
//!     .subscribe(Arc::new(TrackDevicesFactory::new(sink.clone(), false)))
//!     .unwrap();
//!
//! hub.device_list_changed(&[DeviceState::new("emulator-5554", DeviceStatus::Online, 1)]);
//! hub.stop();
//!
//! // Runs on the subscriber's own thread in a real server.
//! while (queue.take())().should_continue {}
//!
//! assert_eq!(&sink.lock().unwrap()[..], b"0015emulator-5554\tdevice\n");
//! ```

mod client;
mod device;
mod error;
mod hub;
mod queue;
pub mod wire;

pub use client::{ClientChangeHandlerFactory, ClientStateChangeHub, TrackJdwpFactory};
pub use device::{
    DeviceChangeHandlerFactory, DeviceState, DeviceStateChangeHub, DeviceStatus,
    TrackDevicesFactory,
};
pub use error::WireError;
pub use hub::StateChangeHub;
pub use queue::{HandlerResult, Notification, QueueId, StateChangeQueue};
