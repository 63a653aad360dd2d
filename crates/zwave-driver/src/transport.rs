//! Serial transport contract.
//!
//! The platform layer owns the actual port; the driver only needs blocking
//! reads, writes, and a wait-for-readable primitive. A channel-backed
//! [`MockTransport`] is provided for tests and development against a
//! simulated controller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// Byte-level access to the serial port.
pub trait SerialTransport: Send {
    /// Read up to `buf.len()` bytes. Returns 0 when no data is available
    /// within the implementation's polling grain.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write `data` to the port. Returns the number of bytes written.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Wait until data becomes available or `timeout` elapses. Returns true
    /// if data became available.
    fn wait(&mut self, timeout: Duration) -> bool;
}

/// An in-memory transport fed and observed through a [`MockTransportHandle`].
pub struct MockTransport {
    incoming: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    written: Arc<Mutex<Vec<u8>>>,
}

/// Test-side handle injecting inbound bytes and observing outbound ones.
#[derive(Clone)]
pub struct MockTransportHandle {
    tx: Sender<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl MockTransport {
    /// Create a transport and its controlling handle.
    pub fn new() -> (Self, MockTransportHandle) {
        let (tx, rx) = unbounded();
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            MockTransport {
                incoming: rx,
                pending: VecDeque::new(),
                written: written.clone(),
            },
            MockTransportHandle { tx, written },
        )
    }

    fn drain_channel(&mut self) {
        while let Ok(chunk) = self.incoming.try_recv() {
            self.pending.extend(chunk);
        }
    }
}

impl SerialTransport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.drain_channel();
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.written.lock().extend_from_slice(data);
        data.len()
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        self.drain_channel();
        if !self.pending.is_empty() {
            return true;
        }
        match self.incoming.recv_timeout(timeout) {
            Ok(chunk) => {
                self.pending.extend(chunk);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

impl MockTransportHandle {
    /// Inject bytes for the driver to read.
    pub fn inject(&self, data: &[u8]) {
        // A closed channel just means the driver side is gone.
        let _ = self.tx.send(data.to_vec());
    }

    /// Everything the driver has written so far, as one byte stream.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    /// Take everything written since the last call.
    pub fn drain_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.lock())
    }
}
