//! Device events emitted by the monitor.
//!
//! These types are serializable so they can be logged or forwarded as-is.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::device::{Action, Device};
use crate::error::DeviceError;

/// Unique identifier for a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// One device change, handed to the consumer by value.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEvent {
    pub event_id: EventId,
    pub action: Action,
    pub received_at: DateTime<Utc>,
    pub device: Device,
}

impl DeviceEvent {
    /// Wrap a received device record.
    ///
    /// # Errors
    ///
    /// `DeviceError::MissingField` if the record carries no action, which is
    /// the case for records looked up from sysfs rather than received.
    pub fn new(device: Device) -> Result<Self, DeviceError> {
        let action = device
            .action()
            .cloned()
            .ok_or(DeviceError::MissingField { field: "ACTION" })?;

        Ok(Self {
            event_id: EventId::new(),
            action,
            received_at: Utc::now(),
            device,
        })
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Consume the event, keeping the device.
    #[must_use]
    pub fn into_device(self) -> Device {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::device::UeventBuilder;

    #[test]
    fn event_takes_action_from_record() {
        let buf = UeventBuilder::event("bind", "/devices/pci0000:00/0000:00:14.0", "pci").encode_udev();
        let device = Device::from_datagram(&buf, Path::new("/sys")).unwrap();

        let ev = DeviceEvent::new(device.clone()).unwrap();
        assert_eq!(ev.action, Action::Bind);
        assert_eq!(ev.device(), &device);
        assert_ne!(ev.event_id, DeviceEvent::new(device).unwrap().event_id);
    }

    #[test]
    fn serializes_flat_action() {
        let buf = UeventBuilder::event("offline", "/devices/system/cpu/cpu3", "cpu").encode_udev();
        let ev = DeviceEvent::new(Device::from_datagram(&buf, Path::new("/sys")).unwrap()).unwrap();
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["action"], "offline");
        assert_eq!(json["device"]["devpath"], "/devices/system/cpu/cpu3");
    }
}
