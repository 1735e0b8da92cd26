//! Device records.
//!
//! A [`Device`] is an owned, immutable snapshot of one device's metadata. It is
//! built either from a uevent datagram received by a monitor, or from the sysfs
//! tree (see [`Device::from_syspath`]). Every accessor that yields another
//! device (parent, children) returns a new independently owned record, so
//! dropping the record it came from never invalidates a derived one.

mod devnum;
mod sysfs;
pub mod uevent;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

pub use devnum::Devnum;
pub use uevent::{Framing, Uevent, UeventBuilder};

/// A device action.
///
/// The kernel adds actions over time, so unknown values are preserved in
/// [`Action::Other`] rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
    Bind,
    Unbind,
    Other(String),
}

impl Action {
    /// Action name as sent by the kernel.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Change => "change",
            Self::Move => "move",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "change" => Self::Change,
            "move" => Self::Move,
            "online" => Self::Online,
            "offline" => Self::Offline,
            "bind" => Self::Bind,
            "unbind" => Self::Unbind,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<Action> for String {
    fn from(a: Action) -> Self {
        match a {
            Action::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    #[serde(skip)]
    sysfs_root: PathBuf,
    syspath: PathBuf,
    devpath: String,
    subsystem: Option<String>,
    devtype: Option<String>,
    driver: Option<String>,
    devnode: Option<PathBuf>,
    devnum: Option<Devnum>,
    action: Option<Action>,
    seqnum: u64,
    usec_initialized: Option<u64>,
    initialized: bool,
    tags: BTreeSet<String>,
    devlinks: BTreeSet<PathBuf>,
    properties: BTreeMap<String, String>,
}

impl Device {
    /// Build a device from one received datagram.
    ///
    /// # Errors
    ///
    /// `DeviceError::Malformed` if the framing is broken, and
    /// `DeviceError::MissingField` if the datagram does not name a device
    /// (no `ACTION`, `DEVPATH` or `SUBSYSTEM`).
    pub fn from_datagram(buf: &[u8], sysfs_root: &Path) -> Result<Self, DeviceError> {
        Self::from_uevent(uevent::parse(buf)?, sysfs_root)
    }

    /// Build a device from an already decoded datagram.
    ///
    /// # Errors
    ///
    /// See [`Device::from_datagram`].
    pub fn from_uevent(event: Uevent, sysfs_root: &Path) -> Result<Self, DeviceError> {
        for field in ["ACTION", "DEVPATH", "SUBSYSTEM"] {
            if event.properties.get(field).map_or(true, String::is_empty) {
                return Err(DeviceError::MissingField { field });
            }
        }

        let devpath = event.properties["DEVPATH"].clone();
        let initialized = event.framing == Framing::Udev;
        Ok(Self::assemble(sysfs_root, devpath, event.properties, initialized))
    }

    pub(crate) fn assemble(
        sysfs_root: &Path,
        devpath: String,
        properties: BTreeMap<String, String>,
        initialized: bool,
    ) -> Self {
        let syspath = sysfs_root.join(devpath.trim_start_matches('/'));
        let get = |key: &str| properties.get(key).filter(|v| !v.is_empty()).cloned();

        let devnode = get("DEVNAME").map(|name| {
            if name.starts_with('/') {
                PathBuf::from(name)
            } else {
                Path::new("/dev").join(name)
            }
        });

        let devnum = match (get("MAJOR"), get("MINOR")) {
            (Some(major), Some(minor)) => match (major.parse(), minor.parse()) {
                (Ok(major), Ok(minor)) => Some(Devnum::new(major, minor)),
                _ => None,
            },
            _ => None,
        };

        let tags = properties
            .get("TAGS")
            .map(|v| uevent::split_tags(v).map(str::to_string).collect())
            .unwrap_or_default();

        let devlinks = properties
            .get("DEVLINKS")
            .map(|v| v.split_whitespace().map(PathBuf::from).collect())
            .unwrap_or_default();

        let usec_initialized = get("USEC_INITIALIZED").and_then(|v| v.parse().ok());

        Self {
            sysfs_root: sysfs_root.to_path_buf(),
            syspath,
            subsystem: get("SUBSYSTEM"),
            devtype: get("DEVTYPE"),
            driver: get("DRIVER"),
            action: get("ACTION").map(Action::from),
            seqnum: get("SEQNUM").and_then(|v| v.parse().ok()).unwrap_or(0),
            initialized: initialized || usec_initialized.is_some(),
            usec_initialized,
            devnode,
            devnum,
            tags,
            devlinks,
            devpath,
            properties,
        }
    }

    /// Absolute path of the device in sysfs.
    #[must_use]
    pub fn syspath(&self) -> &Path {
        &self.syspath
    }

    /// Kernel device path, relative to the sysfs root.
    #[must_use]
    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    /// Kernel name of the device (last devpath component, `!` mapped to `/`).
    #[must_use]
    pub fn sysname(&self) -> String {
        self.devpath
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .replace('!', "/")
    }

    /// Trailing instance number of the sysname, if any (`sda1` → `1`).
    #[must_use]
    pub fn sysnum(&self) -> Option<String> {
        let name = self.sysname();
        let digits = name.bytes().rev().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            None
        } else {
            Some(name[name.len() - digits..].to_string())
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn devtype(&self) -> Option<&str> {
        self.devtype.as_deref()
    }

    /// Bound driver, if any.
    #[must_use]
    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    /// Device node in `/dev`, if the device has one.
    #[must_use]
    pub fn devnode(&self) -> Option<&Path> {
        self.devnode.as_deref()
    }

    /// Device number from `MAJOR`/`MINOR`.
    #[must_use]
    pub const fn devnum(&self) -> Option<Devnum> {
        self.devnum
    }

    /// The action that produced this record; `None` for sysfs lookups.
    #[must_use]
    pub const fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    /// Kernel event sequence number, 0 when unknown.
    #[must_use]
    pub const fn seqnum(&self) -> u64 {
        self.seqnum
    }

    /// Whether udevd has processed this device.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// `CLOCK_MONOTONIC` timestamp (µs) at which udevd first saw the device.
    #[must_use]
    pub const fn usec_initialized(&self) -> Option<u64> {
        self.usec_initialized
    }

    /// Time elapsed since udevd initialized the device.
    #[must_use]
    pub fn time_since_initialized(&self) -> Option<Duration> {
        let since = self.usec_initialized?;
        let now = monotonic_usec()?;
        Some(Duration::from_micros(now.saturating_sub(since)))
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// udev tags, without the `:` separators.
    #[must_use]
    pub const fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Symlinks udev created for the device node.
    #[must_use]
    pub const fn devlinks(&self) -> &BTreeSet<PathBuf> {
        &self.devlinks
    }

    /// Value of a device property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Every uevent property.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub(crate) fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device(\"{}\")", self.syspath.display())
    }
}

fn monotonic_usec() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return None;
    }
    let secs = u64::try_from(ts.tv_sec).ok()?;
    let nanos = u64::try_from(ts.tv_nsec).ok()?;
    Some(secs * 1_000_000 + nanos / 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Device {
        let buf = UeventBuilder::event("add", "/devices/pci0000:00/0000:00:1d.0/usb2/2-1/2-1:1.0/host6/target6:0:0/6:0:0:0/block/sdb/sdb1", "block")
            .property("DEVTYPE", "partition")
            .property("DEVNAME", "sdb1")
            .property("MAJOR", "8")
            .property("MINOR", "17")
            .property("SEQNUM", "4711")
            .property("TAGS", ":systemd:seat:")
            .property("DEVLINKS", "/dev/disk/by-id/usb-x-part1 /dev/disk/by-uuid/abcd")
            .property("USEC_INITIALIZED", "1000")
            .encode_udev();
        Device::from_datagram(&buf, Path::new("/sys")).unwrap()
    }

    #[test]
    fn datagram_fields() {
        let d = sample();
        assert_eq!(d.action(), Some(&Action::Add));
        assert_eq!(d.subsystem(), Some("block"));
        assert_eq!(d.devtype(), Some("partition"));
        assert_eq!(d.devnode(), Some(Path::new("/dev/sdb1")));
        assert_eq!(d.devnum(), Some(Devnum::new(8, 17)));
        assert_eq!(d.seqnum(), 4711);
        assert_eq!(d.sysname(), "sdb1");
        assert_eq!(d.sysnum().as_deref(), Some("1"));
        assert!(d.syspath().starts_with("/sys/devices/pci0000:00"));
        assert!(d.is_initialized());
        assert!(d.time_since_initialized().is_some());
        assert!(d.has_tag("seat"));
        assert!(!d.has_tag("uaccess"));
        assert_eq!(d.devlinks().len(), 2);
        assert_eq!(d.property("MINOR"), Some("17"));
        assert_eq!(d.property("ID_VENDOR_FROM_DATABASE2"), None);
    }

    #[test]
    fn missing_devpath_is_not_found() {
        let buf = UeventBuilder::new()
            .property("ACTION", "add")
            .property("SUBSYSTEM", "net")
            .encode_udev();
        let err = Device::from_datagram(&buf, Path::new("/sys")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn kernel_framed_devices_are_not_initialized() {
        let buf = UeventBuilder::event("change", "/devices/virtual/net/lo", "net").encode_kernel();
        let d = Device::from_datagram(&buf, Path::new("/sys")).unwrap();
        assert!(!d.is_initialized());
        assert_eq!(d.devnode(), None);
        assert_eq!(d.sysnum(), None);
    }

    #[test]
    fn unknown_actions_are_preserved() {
        let a = Action::from("frobnicate");
        assert_eq!(a, Action::Other("frobnicate".to_string()));
        assert_eq!(a.to_string(), "frobnicate");
        assert_eq!(String::from(Action::Unbind), "unbind");
    }

    #[test]
    fn sysname_maps_bang() {
        let buf = UeventBuilder::event("add", "/devices/virtual/block/cciss!c0d0", "block").encode_udev();
        let d = Device::from_datagram(&buf, Path::new("/sys")).unwrap();
        assert_eq!(d.sysname(), "cciss/c0d0");
        assert_eq!(d.to_string(), "Device(\"/sys/devices/virtual/block/cciss!c0d0\")");
    }

    #[test]
    fn serializes_action_as_string() {
        let d = sample();
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["action"], "add");
        assert_eq!(json["subsystem"], "block");
    }
}
