//! # devwatch - Linux device discovery and hotplug monitoring
//!
//! devwatch listens for the kernel's device events (uevents), either raw from
//! the kernel or re-broadcast by udevd, and looks devices up in sysfs.
//!
//! ## Core Concepts
//!
//! - **Device**: An owned snapshot of one device's metadata
//! - **Monitor**: A uevent socket with staged and committed filters
//! - **EventStream**: The consumer end of a running monitor, one event at a time
//! - **Enumerator**: A one-shot scan of the sysfs device tree
//!
//! ## Usage
//!
//! ```rust,no_run
//! use devwatch::{CancelToken, Context, PollTimeout};
//!
//! let ctx = Context::new();
//! let mut monitor = ctx.new_monitor("udev")?;
//! monitor.add_subsystem_filter("block", Some("disk"))?;
//! monitor.commit()?;
//!
//! let cancel = CancelToken::new();
//! let stream = monitor.start(PollTimeout::Millis(500), &cancel)?;
//! for event in stream {
//!     let event = event?;
//!     println!("{} {}", event.action, event.device.syspath().display());
//! }
//! # Ok::<(), devwatch::WatchError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod device;
pub mod enumerate;
pub mod error;
pub mod monitor;

pub use context::Context;
pub use device::{Action, Device, Devnum};
pub use enumerate::Enumerator;
pub use error::{ConfigurationError, DeviceError, StartupStage, WatchError, WatchResult};
pub use monitor::{
    CancelToken, DeviceEvent, EventSource, EventStream, FilterCriterion, Monitor, MonitorConfig, PollTimeout,
    PumpState,
};
