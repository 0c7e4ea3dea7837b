//! Protocol independent programming session.
//!
//! A [`Session`] owns at most one [`SessionProtocol`] (a loader bound to its
//! transport) and maps failures of the individual operations to coarse
//! categories a front end can act on:
//!
//! | operation          | error category         |
//! |--------------------|------------------------|
//! | `start`            | [`Error::Connect`]     |
//! | `clear_memory`     | [`Error::MemoryErase`] |
//! | `write_data`, `stop` | [`Error::MemoryProgram`] |
//! | `read_data`, `check_info_table` | [`Error::MemoryRead`] |
//!
//! ## Example
//!
//! ```rust,no_run
//! use xcpboot::{Session, XcpLoader, XcpLoaderSettings};
//! use xcpboot::transport::net::{NetSettings, XcpNetTransport};
//!
//! fn main() -> xcpboot::Result<()> {
//!     let transport = XcpNetTransport::new(NetSettings::new("192.168.178.23", 1000));
//!     let mut session = Session::new();
//!     session.init(Box::new(XcpLoader::new(transport, XcpLoaderSettings::default())));
//!     session.start()?;
//!     session.clear_memory(0x0800_4000, 0x400)?;
//!     session.write_data(0x0800_4000, &[0u8; 0x400])?;
//!     session.stop()?;
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use log::debug;

/// Outcome of an info table comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTableCheck {
    /// The target holds the expected info table.
    Match,
    /// The target holds a different info table.
    Mismatch,
    /// The target cannot perform the check.
    Unsupported,
}

/// Operations a communication protocol offers to a [`Session`].
pub trait SessionProtocol: Send {
    /// Connect to the target.
    fn start(&mut self) -> Result<()>;

    /// Finish programming and disconnect.
    fn stop(&mut self) -> Result<()>;

    /// Erase a memory range.
    fn clear_memory(&mut self, address: u32, len: u32) -> Result<()>;

    /// Program a memory range; `progress` receives the bytes written so far.
    fn write_data(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Result<()>;

    /// Read a memory range.
    fn read_data(&mut self, address: u32, len: u32) -> Result<Vec<u8>>;

    /// Compare the info table at `address` with `expected`.
    fn check_info_table(&mut self, address: u32, expected: &[u8]) -> Result<InfoTableCheck>;
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No protocol bound.
    #[default]
    Uninitialized,
    /// Protocol bound, not connected.
    Initialized,
    /// Connected to the target.
    Connected,
    /// Session ended with `stop`.
    Disconnected,
}

/// Programming session facade.
#[derive(Default)]
pub struct Session {
    protocol: Option<Box<dyn SessionProtocol>>,
    state: SessionState,
}

impl Session {
    /// Create an uninitialized session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bind `protocol`; a previously bound protocol is dropped.
    pub fn init(&mut self, protocol: Box<dyn SessionProtocol>) {
        if self.protocol.is_some() {
            debug!("Replacing the bound session protocol");
        }
        self.protocol = Some(protocol);
        self.state = SessionState::Initialized;
    }

    /// Drop the bound protocol together with its transport.
    pub fn terminate(&mut self) {
        self.protocol = None;
        self.state = SessionState::Uninitialized;
    }

    fn protocol(&mut self) -> Result<&mut dyn SessionProtocol> {
        match self.protocol.as_deref_mut() {
            Some(protocol) => Ok(protocol),
            None => Err(Error::NotInitialized),
        }
    }

    /// Connect to the target. May be called again after a failure.
    pub fn start(&mut self) -> Result<()> {
        let protocol = self.protocol()?;
        protocol.start().map_err(|e| Error::Connect(Box::new(e)))?;
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Finish programming and disconnect.
    pub fn stop(&mut self) -> Result<()> {
        let protocol = self.protocol()?;
        let result = protocol
            .stop()
            .map_err(|e| Error::MemoryProgram(Box::new(e)));
        self.state = SessionState::Disconnected;
        result
    }

    /// Erase `len` bytes at `address`.
    pub fn clear_memory(&mut self, address: u32, len: u32) -> Result<()> {
        self.protocol()?
            .clear_memory(address, len)
            .map_err(|e| Error::MemoryErase(Box::new(e)))
    }

    /// Program `data` at `address`.
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write_data_with_progress(address, data, |_| {})
    }

    /// Program `data` at `address`, calling `progress` with the number of
    /// bytes written so far.
    pub fn write_data_with_progress<F>(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(usize),
    {
        self.protocol()?
            .write_data(address, data, &mut progress)
            .map_err(|e| Error::MemoryProgram(Box::new(e)))
    }

    /// Read `len` bytes at `address`.
    pub fn read_data(&mut self, address: u32, len: u32) -> Result<Vec<u8>> {
        self.protocol()?
            .read_data(address, len)
            .map_err(|e| Error::MemoryRead(Box::new(e)))
    }

    /// Compare the info table at `address` with `expected`.
    pub fn check_info_table(&mut self, address: u32, expected: &[u8]) -> Result<InfoTableCheck> {
        self.protocol()?
            .check_info_table(address, expected)
            .map_err(|e| Error::MemoryRead(Box::new(e)))
    }
}
