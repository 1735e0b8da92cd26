use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::PoisonError;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::{WatchError, WatchResult};

use super::cancel::CancelToken;
use super::event::DeviceEvent;
use super::pump::TerminalSlot;

/// Consumer end of a started monitor.
///
/// The stream yields events in receive order and ends exactly once: cleanly
/// after cancellation, or with the fatal error that stopped the pump.
/// Dropping the stream cancels the pump.
///
#[derive(Debug)]
pub struct EventStream {
    rx: Receiver<DeviceEvent>,
    terminal: TerminalSlot,
    cancel: CancelToken,
    finished: AtomicBool,
}

impl EventStream {
    pub(crate) fn new(rx: Receiver<DeviceEvent>, terminal: TerminalSlot, cancel: CancelToken) -> Self {
        Self {
            rx,
            terminal,
            cancel,
            finished: AtomicBool::new(false),
        }
    }

    /// Stop the pump. Events already handed over stay readable; the stream
    /// then reports its end.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Receive the next event (blocking).
    ///
    /// Returns `Ok(None)` once the stream has ended cleanly.
    ///
    /// # Errors
    ///
    /// The `WatchError::FatalStream` that stopped the pump, reported once.
    pub fn recv(&self) -> WatchResult<Option<DeviceEvent>> {
        match self.rx.recv() {
            Ok(event) => Ok(Some(event)),
            Err(_) => self.end(),
        }
    }

    /// Receive the next event with a timeout.
    ///
    /// # Errors
    ///
    /// `WatchError::Timeout` if nothing arrived in time, otherwise as
    /// [`EventStream::recv`].
    pub fn recv_timeout(&self, timeout: Duration) -> WatchResult<Option<DeviceEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Err(WatchError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(RecvTimeoutError::Disconnected) => self.end(),
        }
    }

    fn end(&self) -> WatchResult<Option<DeviceEvent>> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        match self.terminal.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

impl Iterator for EventStream {
    type Item = WatchResult<DeviceEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().transpose()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use crossbeam_channel::bounded;

    use super::*;
    use crate::device::{Device, UeventBuilder};

    fn event() -> DeviceEvent {
        let buf = UeventBuilder::event("add", "/devices/virtual/net/dummy0", "net").encode_udev();
        DeviceEvent::new(Device::from_datagram(&buf, Path::new("/sys")).unwrap()).unwrap()
    }

    #[test]
    fn reports_fatal_error_once() {
        let (tx, rx) = bounded(1);
        let terminal: TerminalSlot = Arc::new(Mutex::new(None));
        let stream = EventStream::new(rx, Arc::clone(&terminal), CancelToken::new());

        tx.send(event()).unwrap();
        *terminal.lock().unwrap() = Some(WatchError::FatalStream {
            source: io::Error::from_raw_os_error(libc::EIO),
        });
        drop(tx);

        let mut stream = stream;
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().unwrap_err().is_fatal_stream());
        assert!(stream.next().is_none());
    }

    #[test]
    fn timeout_is_an_error() {
        let (_tx, rx) = bounded::<DeviceEvent>(0);
        let stream = EventStream::new(rx, Arc::new(Mutex::new(None)), CancelToken::new());
        let err = stream.recv_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, WatchError::Timeout { duration_ms: 10 }));
    }

    #[test]
    fn drop_cancels() {
        let token = CancelToken::new();
        let (_tx, rx) = bounded::<DeviceEvent>(0);
        drop(EventStream::new(rx, Arc::new(Mutex::new(None)), token.clone()));
        assert!(token.is_cancelled());
    }
}
