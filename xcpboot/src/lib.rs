//! # xcpboot
//!
//! Host side of an XCP based firmware update toolchain.
//!
//! This crate talks to a microcontroller-resident bootloader using the
//! programming command group of the XCP protocol:
//!
//! - Transports: RS232, USB bulk, TCP/IP and CAN (SocketCAN or a pluggable driver)
//! - XCP loader with seed/key unlock and per command class timeouts
//! - Protocol independent [`Session`] facade
//! - Firmware data store with S-record reading and writing
//! - CRC16/CRC32 helpers and AES-256 firmware decryption
//!
//! ## Features
//!
//! - `native` (default): serial port transport via the `serialport` crate
//! - `usb` (default): USB bulk transport via the `nusb` crate
//! - `socketcan`: SocketCAN driver for the CAN transport (Linux only)
//! - `serde`: Serialization support for settings and segments
//!
//! ## Example
//!
//! ```rust,no_run
//! use xcpboot::{FirmwareData, Session, XcpLoader, XcpLoaderSettings};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut firmware = FirmwareData::new();
//!     firmware.load_from_file("demo.srec", 0)?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         use xcpboot::transport::serial::{SerialSettings, XcpSerialTransport};
//!
//!         let transport = XcpSerialTransport::new(SerialSettings::new("/dev/ttyUSB0", 57600));
//!         let mut session = Session::new();
//!         session.init(Box::new(XcpLoader::new(transport, XcpLoaderSettings::default())));
//!         session.start()?;
//!         for seg in firmware.segments() {
//!             session.clear_memory(seg.base(), seg.len_u32())?;
//!             session.write_data(seg.base(), seg.data())?;
//!         }
//!         session.stop()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod hex;
pub mod image;
pub mod loader;
pub mod protocol;
pub mod session;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker consulted while the loader waits
/// for a busy target.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

pub use {
    error::{Error, Result},
    image::{FirmwareData, FirmwareDecryptor, FirmwareParser, FirmwareSegment, SrecParser},
    loader::{ExternalKeyProgram, LoaderState, SeedKeyResolver, XcpLoader, XcpLoaderSettings},
    protocol::{XcpByteOrder, XcpPacket},
    session::{InfoTableCheck, Session, SessionProtocol, SessionState},
    transport::XcpTransport,
};
