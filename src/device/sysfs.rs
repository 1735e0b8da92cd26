//! Sysfs-backed device lookups.
//!
//! Only the kernel's view is read: the `uevent` file plus the `subsystem` and
//! `driver` links. Properties udevd stores in its runtime database are not
//! merged, so records built here report `is_initialized() == false`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::context::Context;
use crate::enumerate::{pci_children_of, Enumerator};
use crate::error::DeviceError;

use super::Device;

impl Device {
    /// Look up the device at an absolute sysfs path.
    ///
    /// # Errors
    ///
    /// `DeviceError::NotFound` if the path is outside the sysfs root or is not
    /// a device directory.
    pub fn from_syspath(ctx: &Context, path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        Self::from_syspath_in(ctx.sysfs_root(), path.as_ref())
    }

    /// Like [`Device::from_syspath`], but accepts paths relative to the sysfs
    /// root (`/devices/virtual/net/lo`).
    ///
    /// # Errors
    ///
    /// See [`Device::from_syspath`].
    pub fn from_path(ctx: &Context, path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        if path.starts_with(ctx.sysfs_root()) {
            return Self::from_syspath(ctx, path);
        }
        let relative: PathBuf = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        Self::from_syspath(ctx, ctx.sysfs_root().join(relative))
    }

    /// Look up a device by subsystem and kernel name (`"net"`, `"lo"`).
    ///
    /// # Errors
    ///
    /// `DeviceError::NotFoundByName` when no candidate location holds it.
    pub fn from_subsystem_sysname(ctx: &Context, subsystem: &str, sysname: &str) -> Result<Self, DeviceError> {
        let root = ctx.sysfs_root();
        let name = sysname.replace('/', "!");

        let candidates: Vec<PathBuf> = match subsystem {
            "subsystem" => vec![root.join("bus").join(&name), root.join("class").join(&name)],
            "module" => vec![root.join("module").join(&name)],
            _ => vec![
                root.join("bus").join(subsystem).join("devices").join(&name),
                root.join("class").join(subsystem).join(&name),
                root.join("firmware").join(subsystem).join(&name),
            ],
        };

        candidates
            .iter()
            .find_map(|p| Self::from_syspath_in(root, p).ok())
            .ok_or_else(|| DeviceError::NotFoundByName {
                subsystem: subsystem.to_string(),
                sysname: sysname.to_string(),
            })
    }

    pub(crate) fn from_syspath_in(root: &Path, path: &Path) -> Result<Self, DeviceError> {
        let not_found = || DeviceError::NotFound {
            path: path.to_path_buf(),
        };

        let canonical_root = fs::canonicalize(root).map_err(|_| not_found())?;
        let canonical = fs::canonicalize(path).map_err(|_| not_found())?;
        let relative = canonical.strip_prefix(&canonical_root).map_err(|_| not_found())?;

        let uevent_path = canonical.join("uevent");
        if !uevent_path.is_file() {
            return Err(not_found());
        }

        let mut properties = read_uevent_file(&uevent_path)?;

        let devpath = format!("/{}", relative.display());
        properties.insert("DEVPATH".to_string(), devpath.clone());

        if let Some(subsystem) = link_basename(&canonical.join("subsystem")) {
            properties.insert("SUBSYSTEM".to_string(), subsystem);
        }
        if let Some(driver) = link_basename(&canonical.join("driver")) {
            properties.entry("DRIVER".to_string()).or_insert(driver);
        }

        Ok(Self::assemble(root, devpath, properties, false))
    }

    /// The closest ancestor that is itself a device.
    ///
    /// # Errors
    ///
    /// `DeviceError::NoParent` at the top of the device tree.
    pub fn parent(&self) -> Result<Self, DeviceError> {
        let devices_root = self.sysfs_root().join("devices");
        let mut current = self.syspath().parent();

        while let Some(dir) = current {
            if !dir.starts_with(&devices_root) || dir == devices_root {
                break;
            }
            if dir.join("uevent").is_file() {
                if let Ok(parent) = Self::from_syspath_in(self.sysfs_root(), dir) {
                    return Ok(parent);
                }
            }
            current = dir.parent();
        }

        Err(DeviceError::NoParent)
    }

    /// The closest ancestor in `subsystem` (and of `devtype`, when given).
    ///
    /// # Errors
    ///
    /// `DeviceError::NoParent` if no ancestor matches.
    pub fn parent_with_subsystem(&self, subsystem: &str, devtype: Option<&str>) -> Result<Self, DeviceError> {
        let mut current = self.parent()?;
        loop {
            if current.subsystem() == Some(subsystem) && devtype.map_or(true, |t| current.devtype() == Some(t)) {
                return Ok(current);
            }
            current = current.parent()?;
        }
    }

    /// Every device below this one in the sysfs tree, excluding itself.
    ///
    /// Unlike [`Device::pci_children`] this keeps non-PCI descendants such as
    /// block devices and network interfaces.
    ///
    /// # Errors
    ///
    /// `DeviceError::Sysfs` if the tree cannot be scanned.
    pub fn children(&self) -> Result<Vec<Self>, DeviceError> {
        Enumerator::with_root(self.sysfs_root())
            .match_parent(self)
            .scan_devices_with(|d| d.syspath() != self.syspath())
    }

    /// PCI functions below this device, excluding itself.
    ///
    /// # Errors
    ///
    /// `DeviceError::Sysfs` if the tree cannot be scanned.
    pub fn pci_children(&self) -> Result<Vec<Self>, DeviceError> {
        Enumerator::with_root(self.sysfs_root())
            .match_parent(self)
            .scan_devices_with(pci_children_of(self))
    }

    /// Read a sysfs attribute. Link attributes (`driver`, `subsystem`,
    /// `module`) yield the link target's name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<String> {
        if name.is_empty() || name.split('/').any(|part| part == "..") {
            return None;
        }
        let path = self.syspath().join(name);
        let meta = fs::symlink_metadata(&path).ok()?;
        if meta.file_type().is_symlink() {
            return link_basename(&path);
        }
        if !meta.is_file() {
            return None;
        }
        let value = fs::read_to_string(&path).ok()?;
        Some(value.trim_end_matches('\n').to_string())
    }

    /// All readable regular-file attributes of the device.
    #[must_use]
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let Ok(entries) = fs::read_dir(self.syspath()) else {
            return BTreeMap::new();
        };

        entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name != "uevent")
            .filter_map(|name| self.attribute(&name).map(|value| (name, value)))
            .collect()
    }

    /// Write a sysfs attribute.
    ///
    /// # Errors
    ///
    /// `DeviceError::Sysfs` when the kernel rejects the write.
    pub fn set_attribute(&self, name: &str, value: &str) -> Result<(), DeviceError> {
        let path = self.syspath().join(name);
        if name.is_empty() || name.split('/').any(|part| part == "..") {
            return Err(DeviceError::Sysfs {
                path,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }
        fs::write(&path, value).map_err(|source| DeviceError::Sysfs { path, source })
    }
}

fn read_uevent_file(path: &Path) -> Result<BTreeMap<String, String>, DeviceError> {
    let content = fs::read_to_string(path).map_err(|source| DeviceError::Sysfs {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(content
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}

fn link_basename(path: &Path) -> Option<String> {
    let target = fs::read_link(path).ok()?;
    target.file_name()?.to_str().map(str::to_string)
}
