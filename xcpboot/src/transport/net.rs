//! XCP on TCP/IP.
//!
//! ## Frame Format
//!
//! ```text
//! +-----------+-----------+----------------------+
//! | LEN (LE)  | CTR (LE)  |      XCP packet      |
//! +-----------+-----------+----------------------+
//! |  2 bytes  |  2 bytes  |     LEN bytes        |
//! +-----------+-----------+----------------------+
//! ```
//!
//! CTR is incremented for every packet the host sends. The target's
//! counter in responses is not checked.

use crate::error::{Error, Result};
use crate::protocol::{XCP_PACKET_SIZE_MAX, XcpPacket};
use crate::transport::{Deadline, TimedRead, XcpTransport, read_exact_timed};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Size of the XCP on Ethernet header.
pub const NET_HEADER_SIZE: usize = 4;

/// TCP transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetSettings {
    /// Host name or IP address of the target.
    pub address: String,
    /// TCP port.
    pub port: u16,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 1000,
            connect_timeout: Duration::from_millis(1000),
        }
    }
}

impl NetSettings {
    /// Create a new configuration for `address:port`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Default::default()
        }
    }
}

impl TimedRead for TcpStream {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        TcpStream::set_read_timeout(self, Some(timeout))
    }
}

/// XCP transport over a TCP connection.
pub struct XcpNetTransport {
    settings: NetSettings,
    stream: Option<TcpStream>,
    counter: u16,
}

impl XcpNetTransport {
    /// Create a transport; the socket is connected by [`XcpTransport::connect`].
    pub fn new(settings: NetSettings) -> Self {
        Self {
            settings,
            stream: None,
            counter: 0,
        }
    }

    /// Settings this transport was created with.
    pub fn settings(&self) -> &NetSettings {
        &self.settings
    }
}

impl XcpTransport for XcpNetTransport {
    fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let target = (self.settings.address.as_str(), self.settings.port);
        let mut last_error = None;
        for addr in target.to_socket_addrs()? {
            debug!("Connecting to {addr}");
            match TcpStream::connect_timeout(&addr, self.settings.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    self.counter = 0;
                    return Ok(());
                },
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.map_or_else(
            || Error::Config(format!("cannot resolve {}", self.settings.address)),
            Error::Io,
        ))
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("Disconnected from {}", self.settings.address);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn send_packet(
        &mut self,
        tx: &XcpPacket,
        rx: &mut XcpPacket,
        timeout: Duration,
    ) -> Result<()> {
        rx.clear();
        let deadline = Deadline::after(timeout);
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let mut frame = [0u8; NET_HEADER_SIZE + XCP_PACKET_SIZE_MAX];
        // Packet length is bounded by XCP_PACKET_SIZE_MAX.
        LittleEndian::write_u16(&mut frame[0..2], tx.len() as u16);
        LittleEndian::write_u16(&mut frame[2..4], self.counter);
        frame[NET_HEADER_SIZE..NET_HEADER_SIZE + tx.len()].copy_from_slice(tx.as_slice());
        self.counter = self.counter.wrapping_add(1);
        trace!("net tx {tx:?}");
        stream.write_all(&frame[..NET_HEADER_SIZE + tx.len()])?;
        stream.flush()?;

        let mut header = [0u8; NET_HEADER_SIZE];
        read_exact_timed(stream, &mut header, deadline, "net header")?;
        let rx_len = usize::from(LittleEndian::read_u16(&header[0..2]));
        if rx_len == 0 {
            return Err(Error::Timeout("net response with zero length".into()));
        }
        if rx_len > XCP_PACKET_SIZE_MAX {
            return Err(Error::MalformedResponse(format!(
                "net response of {rx_len} bytes exceeds {XCP_PACKET_SIZE_MAX}"
            )));
        }
        read_exact_timed(
            stream,
            &mut rx.buffer_mut()[..rx_len],
            deadline,
            "net packet",
        )?;
        rx.set_len(rx_len)?;
        trace!("net rx {rx:?}");
        Ok(())
    }
}

impl Drop for XcpNetTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
