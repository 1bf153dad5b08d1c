use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::hub::StateChangeHub;
use crate::queue::{HandlerResult, Notification, StateChangeQueue};
use crate::wire;

/// Connection state of a device as reported to trackers
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum DeviceStatus {
    Offline,
    Bootloader,
    Online,
    Host,
    Recovery,
    Sideload,
    Unauthorized,
    Authorizing,
    Connecting,
}

impl DeviceStatus {
    /// The word used on the wire for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Offline => "offline",
            DeviceStatus::Bootloader => "bootloader",
            DeviceStatus::Online => "device",
            DeviceStatus::Host => "host",
            DeviceStatus::Recovery => "recovery",
            DeviceStatus::Sideload => "sideload",
            DeviceStatus::Unauthorized => "unauthorized",
            DeviceStatus::Authorizing => "authorizing",
            DeviceStatus::Connecting => "connecting",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one device as seen by the tracking channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceState {
    pub serial: String,
    pub status: DeviceStatus,
    pub product: String,
    pub model: String,
    pub device: String,
    pub transport_id: u32,
}

impl DeviceState {
    pub fn new(serial: impl Into<String>, status: DeviceStatus, transport_id: u32) -> Self {
        Self {
            serial: serial.into(),
            status,
            product: String::new(),
            model: String::new(),
            device: String::new(),
            transport_id,
        }
    }

    /// One line of a device listing, newline included.
    pub fn listing_line(&self, long_format: bool) -> String {
        if long_format {
            format!(
                "{}\t{} product:{} model:{} device:{} transport_id:{}\n",
                self.serial, self.status, self.product, self.model, self.device, self.transport_id
            )
        } else {
            format!("{}\t{}\n", self.serial, self.status)
        }
    }
}

/// Builds subscriber-specific notifications for device events.
pub trait DeviceChangeHandlerFactory: Send + Sync {
    fn device_list_changed(&self, devices: &[DeviceState]) -> Notification;

    fn device_status_changed(&self, device: &DeviceState) -> Notification;
}

/// Hub for device list and device status changes
#[derive(Default)]
pub struct DeviceStateChangeHub {
    hub: StateChangeHub<dyn DeviceChangeHandlerFactory>,
}

impl DeviceStateChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        factory: Arc<dyn DeviceChangeHandlerFactory>,
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
    pub fn run_subscriber(&self, factory: Arc<dyn DeviceChangeHandlerFactory>) -> bool {
        self.hub.run_subscriber(factory)
    }

    pub fn device_list_changed(&self, devices: &[DeviceState]) {
        self.hub.publish(|factory| factory.device_list_changed(devices));
    }

    pub fn device_status_changed(&self, device: &DeviceState) {
        self.hub.publish(|factory| factory.device_status_changed(device));
    }
}

/// Writes hex4-framed device listings to one tracking connection.
pub struct TrackDevicesFactory<W> {
    writer: Arc<Mutex<W>>,
    long_format: bool,
}

impl<W> TrackDevicesFactory<W> {
    pub fn new(writer: Arc<Mutex<W>>, long_format: bool) -> Self {
        Self {
            writer,
            long_format,
        }
    }
}

impl<W: Write + Send + 'static> DeviceChangeHandlerFactory for TrackDevicesFactory<W> {
    fn device_list_changed(&self, devices: &[DeviceState]) -> Notification {
        let payload: String = devices
            .iter()
            .map(|device| device.listing_line(self.long_format))
            .collect();
        let writer = self.writer.clone();
        Box::new(move || write_frame(&writer, payload.as_bytes()))
    }

    fn device_status_changed(&self, device: &DeviceState) -> Notification {
        let payload = device.listing_line(self.long_format);
        let writer = self.writer.clone();
        Box::new(move || write_frame(&writer, payload.as_bytes()))
    }
}

/// Write one frame and flush. Any failure means the tracker is gone.
pub(crate) fn write_frame<W: Write>(writer: &Mutex<W>, payload: &[u8]) -> HandlerResult {
    let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
    let written = wire::write_hex4(&mut *writer, payload).and_then(|()| Ok(writer.flush()?));
    match written {
        Ok(()) => HandlerResult::CONTINUE,
        Err(e) => {
            debug!("Tracking write failed, ending subscription: {}", e);
            HandlerResult::STOP
        }
    }
}
