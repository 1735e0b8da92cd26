use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;

use crate::context::Context;
use crate::error::{StartupStage, WatchError, WatchResult};

use super::cancel::CancelToken;
use super::filter::{FilterCriterion, FilterSet};
use super::pump::{EventPump, PumpState, StateCell, TerminalSlot};
use super::readiness::{EpollMultiplexer, Interest, PollTimeout, ReadinessMultiplexer, Token};
use super::socket::{EventSocket, EventSource, NetlinkSocket};
use super::stream::EventStream;

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Socket receive buffer applied when the monitor is opened.
    pub receive_buffer_size: Option<usize>,
    /// Receive buffer for one datagram; longer datagrams are dropped.
    pub max_datagram_size: usize,
    /// Registration capacity of the default multiplexer.
    pub max_registrations: usize,
    /// Wait timeout used by [`Monitor::start_default`].
    pub poll_timeout: PollTimeout,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: None,
            max_datagram_size: 8192,
            max_registrations: 32,
            poll_timeout: PollTimeout::Millis(1000),
        }
    }
}

/// A device monitor bound to one event bus.
///
/// Filters are configured on the monitor and committed to its socket;
/// [`Monitor::start`] spawns the event pump and returns the consumer stream.
/// The socket is shared with the pump, so closing or dropping a running
/// monitor only cancels it; the pump releases the socket when it exits.
#[derive(Debug)]
pub struct Monitor {
    socket: Arc<dyn EventSocket>,
    source: Option<EventSource>,
    filters: FilterSet,
    config: MonitorConfig,
    sysfs_root: PathBuf,
    state: StateCell,
    run: Option<CancelToken>,
    pump: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Open a monitor on `source`.
    ///
    /// # Errors
    ///
    /// `WatchError::Io` if the netlink socket cannot be created.
    pub fn open(ctx: &Context, source: EventSource) -> WatchResult<Self> {
        let socket = NetlinkSocket::open(source)?;
        let mut monitor = Self::from_socket(ctx, Arc::new(socket));
        monitor.source = Some(source);
        tracing::debug!(source = %source, "Opened device monitor");
        Ok(monitor)
    }

    /// Build a monitor over an arbitrary datagram socket.
    #[must_use]
    pub fn from_socket(ctx: &Context, socket: Arc<dyn EventSocket>) -> Self {
        let config = ctx.monitor_config().clone();
        let monitor = Self {
            socket,
            source: None,
            filters: FilterSet::new(),
            sysfs_root: ctx.sysfs_root().to_path_buf(),
            state: StateCell::new(),
            run: None,
            pump: None,
            config,
        };
        if let Some(bytes) = monitor.config.receive_buffer_size {
            // Best-effort; already logged.
            let _ = monitor.set_receive_buffer_size(bytes);
        }
        monitor
    }

    /// The event bus, or `None` for a monitor built with [`Monitor::from_socket`].
    #[must_use]
    pub const fn source(&self) -> Option<EventSource> {
        self.source
    }

    /// Current pump state.
    #[must_use]
    pub fn state(&self) -> PumpState {
        self.state.get()
    }

    /// Configuration the monitor was opened with.
    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Resize the socket receive buffer.
    ///
    /// Failure is logged and returned, and never affects the monitor.
    ///
    /// # Errors
    ///
    /// `WatchError::Io` if the kernel rejects both `SO_RCVBUFFORCE` and
    /// `SO_RCVBUF`.
    pub fn set_receive_buffer_size(&self, bytes: usize) -> WatchResult<()> {
        self.socket.set_receive_buffer_size(bytes).map_err(|e| {
            tracing::warn!(bytes, error = %e, "Failed to set receive buffer size");
            WatchError::Io(e)
        })
    }

    /// Stage a subsystem filter. Takes effect on [`Monitor::commit`].
    ///
    /// # Errors
    ///
    /// `WatchError::Configuration` for an empty or NUL-containing argument.
    pub fn add_subsystem_filter(&mut self, subsystem: &str, devtype: Option<&str>) -> WatchResult<()> {
        Ok(self.filters.add_subsystem(subsystem, devtype)?)
    }

    /// Stage a tag filter. Takes effect on [`Monitor::commit`].
    ///
    /// # Errors
    ///
    /// `WatchError::Configuration` for an empty or NUL-containing tag.
    pub fn add_tag_filter(&mut self, tag: &str) -> WatchResult<()> {
        Ok(self.filters.add_tag(tag)?)
    }

    /// Stage removal of every filter. Takes effect on [`Monitor::commit`].
    pub fn remove_all_filters(&mut self) {
        self.filters.clear();
    }

    /// Apply the staged filters to the socket.
    ///
    /// Safe while running; datagrams received afterwards see the new filter.
    ///
    /// # Errors
    ///
    /// `WatchError::Configuration` if the program is too large or the kernel
    /// rejects it. The staged filters are left as they were.
    pub fn commit(&mut self) -> WatchResult<()> {
        self.filters.commit(self.socket.as_ref())
    }

    /// Stage a subsystem filter and commit.
    ///
    /// # Errors
    ///
    /// See [`Monitor::add_subsystem_filter`] and [`Monitor::commit`].
    pub fn filter_by(&mut self, subsystem: &str, devtype: Option<&str>) -> WatchResult<()> {
        self.add_subsystem_filter(subsystem, devtype)?;
        self.commit()
    }

    /// Stage a tag filter and commit.
    ///
    /// # Errors
    ///
    /// See [`Monitor::add_tag_filter`] and [`Monitor::commit`].
    pub fn filter_by_tag(&mut self, tag: &str) -> WatchResult<()> {
        self.add_tag_filter(tag)?;
        self.commit()
    }

    /// Remove every filter and commit.
    ///
    /// # Errors
    ///
    /// See [`Monitor::commit`].
    pub fn remove_filter(&mut self) -> WatchResult<()> {
        self.remove_all_filters();
        self.commit()
    }

    /// Filters staged since the last commit.
    #[must_use]
    pub fn staged_filters(&self) -> &[FilterCriterion] {
        self.filters.staged()
    }

    /// Filters currently applied to delivery.
    #[must_use]
    pub fn committed_filters(&self) -> Vec<FilterCriterion> {
        self.filters.committed()
    }

    /// Start with the configured poll timeout and a fresh cancel token.
    ///
    /// # Errors
    ///
    /// See [`Monitor::start`].
    pub fn start_default(&mut self) -> WatchResult<EventStream> {
        self.start(self.config.poll_timeout, &CancelToken::new())
    }

    /// Start the event pump on an epoll multiplexer.
    ///
    /// # Errors
    ///
    /// `WatchError::InvalidState` if the pump is still running.
    /// `WatchError::Startup` naming the failed stage; the monitor keeps its
    /// previous state and the socket is switched back to blocking mode. A
    /// full registration table fails at `StartupStage::Register`, see
    /// [`WatchError::exhausted_capacity`].
    pub fn start(&mut self, poll_timeout: PollTimeout, cancel: &CancelToken) -> WatchResult<EventStream> {
        self.ensure_startable()?;
        let mux = EpollMultiplexer::new(self.config.max_registrations)
            .map_err(|e| WatchError::startup(StartupStage::CreateMultiplexer, e))?;
        self.start_with(Box::new(mux), poll_timeout, cancel)
    }

    /// Start the event pump on a caller-supplied multiplexer.
    ///
    /// `cancel` stops the pump; so do [`EventStream::cancel`], dropping the
    /// stream, [`Monitor::stop`] and [`Monitor::close`].
    ///
    /// # Errors
    ///
    /// See [`Monitor::start`].
    pub fn start_with(
        &mut self,
        mut mux: Box<dyn ReadinessMultiplexer>,
        poll_timeout: PollTimeout,
        cancel: &CancelToken,
    ) -> WatchResult<EventStream> {
        self.ensure_startable()?;

        self.socket
            .set_nonblocking(true)
            .map_err(|e| WatchError::startup(StartupStage::SetNonBlocking, e))?;
        let token = match self.activate(&mut *mux) {
            Ok(token) => token,
            Err(e) => {
                self.restore_blocking();
                return Err(e);
            }
        };

        let run = cancel.child_token();
        let waker = mux.waker();
        if let Some(waker) = &waker {
            run.attach_waker(waker);
        }

        let (tx, rx) = bounded(0);
        let terminal: TerminalSlot = Arc::new(Mutex::new(None));
        let pump = EventPump {
            socket: Arc::clone(&self.socket),
            mux,
            token,
            filters: self.filters.committed_handle(),
            sysfs_root: self.sysfs_root.clone(),
            poll_timeout,
            cancel: run.clone(),
            waker: waker.clone(),
            state: self.state.clone(),
            terminal: Arc::clone(&terminal),
            tx,
            buf: vec![0; self.config.max_datagram_size],
        };

        let previous = self.state.get();
        self.state.set(PumpState::Running);
        let spawned = thread::Builder::new()
            .name("devwatch-pump".to_string())
            .spawn(move || pump.run());

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.state.set(previous);
                if let Some(waker) = &waker {
                    run.detach_waker(waker);
                }
                self.restore_blocking();
                return Err(WatchError::startup(StartupStage::SpawnPump, e));
            }
        };

        if let Some(old) = self.pump.replace(handle) {
            // Stopped already; reap it.
            let _ = old.join();
        }
        self.run = Some(run.clone());
        tracing::debug!(source = ?self.source, timeout = ?poll_timeout, "Monitor started");

        Ok(EventStream::new(rx, terminal, run))
    }

    /// Cancel the pump and wait for it to exit.
    ///
    /// The pump finishes its current drain pass first, so this blocks while
    /// an event is waiting for the consumer to read it.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel();
        }
        if let Some(handle) = self.pump.take() {
            if handle.join().is_err() {
                tracing::error!("Event pump panicked");
            }
        }
    }

    /// Release the monitor. A running pump is cancelled and left to finish
    /// its current pass on its own.
    pub fn close(self) {
        tracing::debug!(state = %self.state(), "Closing monitor");
        drop(self);
    }

    fn ensure_startable(&self) -> WatchResult<()> {
        match self.state.get() {
            PumpState::Idle | PumpState::Stopped => Ok(()),
            state @ (PumpState::Running | PumpState::Draining) => Err(WatchError::InvalidState { state }),
        }
    }

    fn activate(&self, mux: &mut dyn ReadinessMultiplexer) -> WatchResult<Token> {
        self.socket
            .enable_receiving()
            .map_err(|e| WatchError::startup(StartupStage::EnableReceiving, e))?;
        mux.register(self.socket.as_raw_fd(), Interest::Readable)
            .map_err(|e| match e {
                WatchError::Io(e) => WatchError::startup(StartupStage::Register, e),
                other => WatchError::startup(StartupStage::Register, io::Error::other(other)),
            })
    }

    // A bound netlink socket keeps queueing; blocking mode is all that can be undone.
    fn restore_blocking(&self) {
        if let Err(e) = self.socket.set_nonblocking(false) {
            tracing::warn!(error = %e, "Failed to restore blocking mode after failed start");
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;

    use super::*;

    fn monitor() -> (Monitor, UnixDatagram) {
        let (rx, tx) = UnixDatagram::pair().unwrap();
        let ctx = Context::new().with_sysfs_root("/sys");
        (Monitor::from_socket(&ctx, Arc::new(rx)), tx)
    }

    #[test]
    fn starts_idle_without_source() {
        let (m, _tx) = monitor();
        assert_eq!(m.state(), PumpState::Idle);
        assert_eq!(m.source(), None);
        assert_eq!(m.config(), &MonitorConfig::default());
    }

    #[test]
    fn staged_filters_are_not_committed() {
        let (mut m, _tx) = monitor();
        m.add_subsystem_filter("net", None).unwrap();
        m.add_tag_filter("systemd").unwrap();
        assert_eq!(m.staged_filters().len(), 2);
        assert!(m.committed_filters().is_empty());

        m.commit().unwrap();
        assert_eq!(m.committed_filters().len(), 2);

        m.remove_filter().unwrap();
        assert!(m.committed_filters().is_empty());
    }

    #[test]
    fn invalid_argument_is_configuration_error() {
        let (mut m, _tx) = monitor();
        assert!(m.add_subsystem_filter("", None).unwrap_err().is_configuration());
        assert!(m.filter_by_tag("").unwrap_err().is_configuration());
    }

    #[test]
    fn receive_buffer_failure_is_not_fatal() {
        let (m, _tx) = monitor();
        m.set_receive_buffer_size(256 * 1024).unwrap();

        let err = m.set_receive_buffer_size(usize::MAX).unwrap_err();
        assert!(matches!(err, WatchError::Io(_)));
        assert_eq!(m.state(), PumpState::Idle);
    }

    #[test]
    fn second_start_is_rejected() {
        let (mut m, _tx) = monitor();
        let cancel = CancelToken::new();
        let _stream = m.start(PollTimeout::Millis(50), &cancel).unwrap();

        let err = m.start(PollTimeout::Millis(50), &cancel).unwrap_err();
        assert!(matches!(
            err,
            WatchError::InvalidState {
                state: PumpState::Running
            }
        ));
        assert!(!err.is_retryable());

        m.stop();
        assert_eq!(m.state(), PumpState::Stopped);
    }

    #[test]
    fn restart_after_stop() {
        let (mut m, _tx) = monitor();
        let cancel = CancelToken::new();
        let first = m.start(PollTimeout::Millis(50), &cancel).unwrap();
        m.stop();
        assert_eq!(first.recv().unwrap(), None);

        let _second = m.start(PollTimeout::Millis(50), &cancel).unwrap();
        assert_eq!(m.state(), PumpState::Running);
    }
}
