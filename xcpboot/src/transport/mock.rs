//! Scripted in-memory transport.
//!
//! [`MockTransport`] answers every packet through a responder closure and
//! can delay the answer to exercise timeout handling. All transmitted
//! packets are recorded in a [`MockLog`] that stays readable after the
//! transport was moved into a loader.

use crate::error::{Error, Result};
use crate::protocol::XcpPacket;
use crate::transport::XcpTransport;
use log::trace;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Closure producing the response bytes for a request; `None` means the
/// target stays silent.
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Debug, Default)]
struct LogState {
    sent: Vec<Vec<u8>>,
    connects: usize,
    disconnects: usize,
}

/// Shared record of what a [`MockTransport`] did.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    state: Arc<Mutex<LogState>>,
}

impl MockLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Every packet transmitted so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Number of transmitted packets whose first byte is `command`.
    pub fn count(&self, command: u8) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|p| p.first() == Some(&command))
            .count()
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Number of `disconnect` calls while connected.
    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }
}

/// Transport backed by a responder closure.
pub struct MockTransport {
    responder: Responder,
    delay: Duration,
    connected: bool,
    fail_connect: bool,
    log: MockLog,
}

impl MockTransport {
    /// Create a transport answering through `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            connected: false,
            fail_connect: false,
            log: MockLog::default(),
        }
    }

    /// Delay every response by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `connect` fail.
    #[must_use]
    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Handle to the record of this transport.
    pub fn log(&self) -> MockLog {
        self.log.clone()
    }
}

impl XcpTransport for MockTransport {
    fn connect(&mut self) -> Result<()> {
        if self.fail_connect {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mock device unavailable",
            )));
        }
        self.connected = true;
        self.log.lock().connects += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.log.lock().disconnects += 1;
        }
    }

    fn send_packet(
        &mut self,
        tx: &XcpPacket,
        rx: &mut XcpPacket,
        timeout: Duration,
    ) -> Result<()> {
        rx.clear();
        if !self.connected {
            return Err(Error::NotConnected);
        }
        trace!("mock tx {tx:?}");
        self.log.lock().sent.push(tx.as_slice().to_vec());

        let response = (self.responder)(tx.as_slice());
        if self.delay > timeout {
            thread::sleep(timeout);
            return Err(Error::Timeout(format!(
                "mock response delayed {:?}, timeout {timeout:?}",
                self.delay
            )));
        }
        thread::sleep(self.delay);
        match response {
            Some(bytes) if !bytes.is_empty() => {
                rx.extend_from_slice(&bytes)?;
                trace!("mock rx {rx:?}");
                Ok(())
            },
            _ => {
                thread::sleep(timeout.saturating_sub(self.delay));
                Err(Error::Timeout("mock target silent".into()))
            },
        }
    }
}
