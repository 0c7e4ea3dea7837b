//! Protocol implementations.

pub mod crc;
pub mod xcp;

// Re-export common types
pub use xcp::{XCP_PACKET_SIZE_MAX, XcpByteOrder, XcpCommand, XcpPacket};
