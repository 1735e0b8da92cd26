//! Device event monitoring.
//!
//! A [`Monitor`] owns a uevent socket and its filters. Starting it spawns an
//! event pump thread that waits for readiness, drains the socket and hands
//! [`DeviceEvent`]s to an [`EventStream`] one at a time. Backpressure is
//! end-to-end: while the consumer is not reading, the pump does not receive
//! and datagrams queue in the kernel socket buffer.

/// Classic BPF socket filter compiler.
pub mod bpf;
/// Cooperative cancellation tokens.
pub mod cancel;
/// Event types handed to consumers.
pub mod event;
/// Staged and committed filter sets.
pub mod filter;
mod handle;
/// Background pump thread.
pub mod pump;
/// Readiness multiplexing.
pub mod readiness;
/// Event-bus sockets.
pub mod socket;
/// Consumer stream handle.
pub mod stream;

pub use bpf::FilterProgram;
pub use cancel::CancelToken;
pub use event::{DeviceEvent, EventId};
pub use filter::{FilterCriterion, FilterSet};
pub use handle::{Monitor, MonitorConfig};
pub use pump::PumpState;
pub use readiness::{EpollMultiplexer, Interest, PollTimeout, Readiness, ReadinessMultiplexer, Token, Wake};
pub use socket::{EventSocket, EventSource, NetlinkSocket, Received};
pub use stream::EventStream;
