//! Firmware images: the in-memory data store and file formats.

pub mod crypto;
pub mod firmware;
pub mod srec;

pub use crypto::FirmwareDecryptor;
pub use firmware::{FirmwareData, FirmwareParser, FirmwareSegment};
pub use srec::SrecParser;
