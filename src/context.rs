//! Library context.
//!
//! A [`Context`] carries the settings shared by monitors and lookups: where
//! sysfs is mounted and the default [`MonitorConfig`]. It is cheap to clone
//! and holds no descriptors.

use std::env;
use std::path::{Path, PathBuf};

use crate::enumerate::Enumerator;
use crate::error::WatchResult;
use crate::monitor::{EventSource, Monitor, MonitorConfig};

/// Default sysfs mount point.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Environment variable overriding the sysfs mount point.
pub const SYSFS_PATH_ENV: &str = "SYSFS_PATH";

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    sysfs_root: PathBuf,
    monitor_config: MonitorConfig,
}

impl Context {
    /// Context for the running system, honouring `SYSFS_PATH`.
    #[must_use]
    pub fn new() -> Self {
        let sysfs_root = env::var_os(SYSFS_PATH_ENV)
            .filter(|v| !v.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_SYSFS_ROOT), PathBuf::from);

        Self {
            sysfs_root,
            monitor_config: MonitorConfig::default(),
        }
    }

    /// Use `root` instead of `/sys`.
    #[must_use]
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Replace the configuration new monitors are opened with.
    #[must_use]
    pub fn with_monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    /// Root of the sysfs tree.
    #[must_use]
    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// Configuration applied to new monitors.
    #[must_use]
    pub const fn monitor_config(&self) -> &MonitorConfig {
        &self.monitor_config
    }

    /// Open a monitor on the named bus (`"udev"` or `"kernel"`).
    ///
    /// # Errors
    ///
    /// `ConfigurationError::UnknownSource` for any other name, or the socket
    /// error from [`Monitor::open`].
    pub fn new_monitor(&self, source: &str) -> WatchResult<Monitor> {
        let source: EventSource = source.parse()?;
        Monitor::open(self, source)
    }

    /// Enumerator scanning this context's sysfs tree.
    #[must_use]
    pub fn new_enumerator(&self) -> Enumerator {
        Enumerator::new(self)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_root_wins() {
        let ctx = Context::new().with_sysfs_root("/tmp/fake-sys");
        assert_eq!(ctx.sysfs_root(), Path::new("/tmp/fake-sys"));
    }

    #[test]
    fn unknown_source_is_rejected() {
        let err = Context::new().new_monitor("usb").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn carries_monitor_config() {
        let config = MonitorConfig {
            max_registrations: 2,
            ..MonitorConfig::default()
        };
        let ctx = Context::new().with_monitor_config(config.clone());
        assert_eq!(ctx.monitor_config(), &config);
    }
}
