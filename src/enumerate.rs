//! Sysfs device enumeration.
//!
//! The enumerator walks `<sysfs>/devices` (without following links), loads
//! every directory that carries a `uevent` file and keeps the devices that
//! satisfy all configured match groups. Within one group any entry may match.

use std::fs;
use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::device::Device;
use crate::error::DeviceError;

/// Builder for a one-shot scan of the device tree.
#[derive(Debug, Clone)]
pub struct Enumerator {
    root: PathBuf,
    subsystems: Vec<String>,
    nomatch_subsystems: Vec<String>,
    properties: Vec<(String, String)>,
    sysnames: Vec<String>,
    parent: Option<PathBuf>,
}

impl Enumerator {
    /// Enumerator over the sysfs tree of `ctx`, with no match groups.
    #[must_use]
    pub fn new(ctx: &Context) -> Self {
        Self::with_root(ctx.sysfs_root())
    }

    pub(crate) fn with_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            subsystems: Vec::new(),
            nomatch_subsystems: Vec::new(),
            properties: Vec::new(),
            sysnames: Vec::new(),
            parent: None,
        }
    }

    /// Keep devices in `subsystem`. Repeated calls widen the group.
    #[must_use]
    pub fn match_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystems.push(subsystem.into());
        self
    }

    /// Drop devices in `subsystem`.
    #[must_use]
    pub fn nomatch_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.nomatch_subsystems.push(subsystem.into());
        self
    }

    /// Keep devices whose property `key` equals `value`.
    #[must_use]
    pub fn match_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Keep devices named `sysname`.
    #[must_use]
    pub fn match_sysname(mut self, sysname: impl Into<String>) -> Self {
        self.sysnames.push(sysname.into());
        self
    }

    /// Restrict the scan to `parent` and the devices below it.
    #[must_use]
    pub fn match_parent(mut self, parent: &Device) -> Self {
        self.parent = Some(parent.syspath().to_path_buf());
        self
    }

    /// Scan and return every matching device, ordered by syspath.
    ///
    /// # Errors
    ///
    /// `DeviceError::Sysfs` if the starting directory cannot be read.
    pub fn scan_devices(&self) -> Result<Vec<Device>, DeviceError> {
        self.scan_devices_with(|_| true)
    }

    /// Like [`Enumerator::scan_devices`], additionally keeping only devices
    /// for which `filter` returns true.
    ///
    /// # Errors
    ///
    /// See [`Enumerator::scan_devices`].
    pub fn scan_devices_with(&self, filter: impl Fn(&Device) -> bool) -> Result<Vec<Device>, DeviceError> {
        let start = self.parent.clone().unwrap_or_else(|| self.root.join("devices"));

        // The starting point must be readable; deeper failures are devices
        // vanishing mid-scan and are skipped.
        fs::read_dir(&start).map_err(|source| DeviceError::Sysfs {
            path: start.clone(),
            source,
        })?;

        let mut found = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            if dir.join("uevent").is_file() {
                match Device::from_syspath_in(&self.root, &dir) {
                    Ok(device) if self.matches(&device) && filter(&device) => found.push(device),
                    Ok(_) => {}
                    Err(e) => tracing::trace!(path = %dir.display(), error = %e, "Skipping unreadable device"),
                }
            }

            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(Result::ok) {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    pending.push(entry.path());
                }
            }
        }

        found.sort_by(|a, b| a.syspath().cmp(b.syspath()));
        Ok(found)
    }

    fn matches(&self, device: &Device) -> bool {
        let subsystem = device.subsystem().unwrap_or_default();

        if !self.subsystems.is_empty() && !self.subsystems.iter().any(|s| s == subsystem) {
            return false;
        }
        if self.nomatch_subsystems.iter().any(|s| s == subsystem) {
            return false;
        }
        if !self.sysnames.is_empty() && !self.sysnames.iter().any(|s| *s == device.sysname()) {
            return false;
        }
        if !self.properties.is_empty()
            && !self
                .properties
                .iter()
                .any(|(k, v)| device.property(k) == Some(v.as_str()))
        {
            return false;
        }
        true
    }
}

/// Keep PCI functions below `parent`, excluding `parent` itself.
pub fn pci_children_of(parent: &Device) -> impl Fn(&Device) -> bool {
    let own = parent.syspath().to_path_buf();
    move |d| d.syspath() != own && d.property("PCI_SLOT_NAME").is_some() && d.property("PCI_ID").is_some()
}

/// Keep devices of the given `DEVTYPE`.
pub fn with_devtype(devtype: impl Into<String>) -> impl Fn(&Device) -> bool {
    let devtype = devtype.into();
    move |d| d.devtype() == Some(devtype.as_str())
}
