//! Background event pump.
//!
//! One pump thread runs per started monitor. It suspends in the readiness
//! multiplexer, drains the socket to `WouldBlock` on every edge and hands each
//! accepted event to the consumer through a rendezvous channel, so at most one
//! event is ever in flight and nothing is buffered in user space.

use std::fmt;
use std::io;
use std::ops::ControlFlow;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::Sender;

use crate::device::Device;
use crate::error::WatchError;

use super::cancel::CancelToken;
use super::event::DeviceEvent;
use super::filter::CommittedFilters;
use super::readiness::{PollTimeout, ReadinessMultiplexer, Token, Wake, EVENTS_PER_WAIT};
use super::socket::{EventSocket, Received};

/// Lifecycle of a monitor's pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PumpState {
    /// Not started, or never successfully started.
    Idle = 0,
    /// Pump thread is waiting or draining.
    Running = 1,
    /// Pump observed cancellation or a fatal error and is tearing down.
    Draining = 2,
    /// Pump has exited and released its registration.
    Stopped = 3,
}

impl PumpState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Draining,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }

    /// Lowercase name, as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pump state shared between the monitor and its pump thread.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PumpState::Idle as u8)))
    }

    pub(crate) fn get(&self) -> PumpState {
        PumpState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: PumpState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Error that ended a stream, read by the consumer after disconnect.
pub(crate) type TerminalSlot = Arc<Mutex<Option<WatchError>>>;

pub(crate) struct EventPump {
    pub(crate) socket: Arc<dyn EventSocket>,
    pub(crate) mux: Box<dyn ReadinessMultiplexer>,
    pub(crate) token: Token,
    pub(crate) filters: CommittedFilters,
    pub(crate) sysfs_root: PathBuf,
    pub(crate) poll_timeout: PollTimeout,
    pub(crate) cancel: CancelToken,
    pub(crate) waker: Option<Arc<dyn Wake>>,
    pub(crate) state: StateCell,
    pub(crate) terminal: TerminalSlot,
    pub(crate) tx: Sender<DeviceEvent>,
    pub(crate) buf: Vec<u8>,
}

impl EventPump {
    /// Run until cancelled, the consumer goes away, or a fatal error.
    pub(crate) fn run(mut self) {
        tracing::debug!(fd = self.socket.as_raw_fd(), timeout = ?self.poll_timeout, "Event pump started");

        let mut ready = Vec::with_capacity(EVENTS_PER_WAIT);
        let error = loop {
            if let Err(e) = self.mux.wait(self.poll_timeout, &mut ready) {
                break Some(e);
            }

            if self.cancel.is_cancelled() {
                break None;
            }

            if !ready.iter().any(|r| r.token == self.token) {
                continue;
            }

            match self.drain() {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break None,
                Err(e) => break Some(e),
            }
        };

        self.finish(error);
    }

    /// Receive until the socket reports `WouldBlock`.
    fn drain(&mut self) -> io::Result<ControlFlow<()>> {
        loop {
            let len = match self.socket.recv_datagram(&mut self.buf) {
                Ok(Received::Datagram(len)) => len,
                Ok(Received::Rejected(reason)) => {
                    tracing::trace!(reason, "Dropped datagram");
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ControlFlow::Continue(())),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    tracing::warn!("Receive buffer overrun, events were lost");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let device = match Device::from_datagram(&self.buf[..len], &self.sysfs_root) {
                Ok(device) => device,
                Err(e) => {
                    tracing::warn!(len, error = %e, "Skipping datagram");
                    continue;
                }
            };

            if !self.filters.passes(&device) {
                tracing::trace!(devpath = device.devpath(), "Device rejected by committed filter");
                continue;
            }

            let event = match DeviceEvent::new(device) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping datagram");
                    continue;
                }
            };

            tracing::trace!(
                action = %event.action,
                devpath = event.device.devpath(),
                seqnum = event.device.seqnum(),
                "Received device event"
            );

            if self.publish(event).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }

    /// Hand one event to the consumer, blocking until it is taken.
    ///
    /// Cancellation is not observed here: a pass that has started publishing
    /// finishes once the consumer reads or drops the stream.
    fn publish(&self, event: DeviceEvent) -> ControlFlow<()> {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event stream dropped, stopping pump");
            self.cancel.cancel();
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn finish(mut self, error: Option<io::Error>) {
        self.state.set(PumpState::Draining);

        if let Err(e) = self.mux.deregister(self.token) {
            tracing::debug!(error = %e, "Failed to deregister socket");
        }
        if let Some(waker) = &self.waker {
            self.cancel.detach_waker(waker);
        }

        match error {
            Some(source) => {
                tracing::error!(error = %source, "Event stream failed");
                *self.terminal.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(WatchError::FatalStream { source });
            }
            None => tracing::debug!("Event pump stopped"),
        }

        self.state.set(PumpState::Stopped);
        // Dropping `self.tx` here closes the stream.
    }
}
