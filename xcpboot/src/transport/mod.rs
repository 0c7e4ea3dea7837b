//! Transport abstraction for XCP packet exchange.
//!
//! A transport moves one XCP packet to the target and waits for the
//! correlated response. Each physical channel frames packets differently:
//!
//! | transport          | framing                                    |
//! |--------------------|--------------------------------------------|
//! | `xcp_rs232`        | 1 length byte + packet                     |
//! | `xcp_usb`          | 1 length byte + packet, one bulk transfer  |
//! | `xcp_net`          | LEN (u16 LE) + CTR (u16 LE) + packet       |
//! | `xcp_can`          | one packet per CAN frame (max 8 bytes)     |
//!
//! ## Architecture
//!
//! ```text
//! +------------------+
//! |    XcpLoader     |
//! +--------+---------+
//!          |  send_packet(tx, rx, timeout)
//!          v
//! +--------+---------+
//! |  XcpTransport    |
//! +--------+---------+
//!          |
//!    +-----+------+-----------+-----------+
//!    v            v           v           v
//! serialport   TcpStream   CanDevice   nusb bulk
//! ```
//!
//! All implementations compute the deadline once when `send_packet` is
//! entered. When the framing needs several reads, each read only gets the
//! time that is left until that deadline.

pub mod can;
pub mod mock;
pub mod net;
#[cfg(feature = "native")]
pub mod serial;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;
#[cfg(feature = "usb")]
pub mod usb;

use std::io::{self, Read};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::protocol::{XCP_PACKET_SIZE_MAX, XcpPacket};

/// Packet transport used by the XCP loader.
///
/// Constructing a transport corresponds to initializing it with its
/// settings; dropping it releases the underlying channel.
pub trait XcpTransport: Send {
    /// Open the physical channel.
    fn connect(&mut self) -> Result<()>;

    /// Close the physical channel. Safe to call when not connected.
    fn disconnect(&mut self);

    /// Transmit `tx` and wait up to `timeout` for the response in `rx`.
    ///
    /// On failure `rx` is left empty.
    fn send_packet(&mut self, tx: &XcpPacket, rx: &mut XcpPacket, timeout: Duration)
    -> Result<()>;
}

impl<T: XcpTransport + ?Sized> XcpTransport for Box<T> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect();
    }

    fn send_packet(
        &mut self,
        tx: &XcpPacket,
        rx: &mut XcpPacket,
        timeout: Duration,
    ) -> Result<()> {
        (**self).send_packet(tx, rx, timeout)
    }
}

/// Absolute point in time a packet exchange must finish by.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            end: Instant::now() + timeout,
        }
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.end
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.remaining().is_none()
    }
}

/// Byte stream whose blocking read timeout can be adjusted per read.
pub(crate) trait TimedRead: Read {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// Fill `buf` completely before `deadline`.
///
/// Every read is bounded by the time remaining, never by the full timeout.
/// `what` names the part of the frame for diagnostics.
pub(crate) fn read_exact_timed<R: TimedRead + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Deadline,
    what: &str,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let Some(left) = deadline.remaining() else {
            return Err(Error::Timeout(format!(
                "{what}: {filled} of {} bytes received",
                buf.len()
            )));
        };
        reader.set_read_timeout(left)?;
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{what}: channel closed"),
                )));
            },
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Frame `tx` behind a one byte length, as sent on RS232 and USB.
///
/// Returns the frame buffer and the number of bytes to send.
pub(crate) fn length_prefixed(tx: &XcpPacket) -> Result<([u8; XCP_PACKET_SIZE_MAX + 1], usize)> {
    let len = u8::try_from(tx.len())
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| Error::InvalidArgument(format!("cannot frame {} bytes", tx.len())))?;
    let mut frame = [0u8; XCP_PACKET_SIZE_MAX + 1];
    frame[0] = len;
    frame[1..=tx.len()].copy_from_slice(tx.as_slice());
    Ok((frame, tx.len() + 1))
}

/// Read a length byte and that many packet bytes into `rx` before `deadline`.
///
/// A zero length byte never starts a valid response and counts as a timeout.
pub(crate) fn read_length_prefixed<R: TimedRead + ?Sized>(
    reader: &mut R,
    rx: &mut XcpPacket,
    deadline: Deadline,
    what: &str,
) -> Result<()> {
    let mut len_byte = [0u8; 1];
    read_exact_timed(reader, &mut len_byte, deadline, what)?;
    let rx_len = usize::from(len_byte[0]);
    if rx_len == 0 {
        return Err(Error::Timeout(format!("{what}: response with zero length")));
    }
    read_exact_timed(reader, &mut rx.buffer_mut()[..rx_len], deadline, what)?;
    rx.set_len(rx_len)?;
    Ok(())
}
