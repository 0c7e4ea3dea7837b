//! XCP on CAN.
//!
//! Each XCP packet travels in exactly one CAN frame, so packets are limited
//! to 8 bytes. Requests are sent with the transmit identifier; frames with
//! any other identifier than the receive identifier are ignored while
//! waiting for the response.
//!
//! The CAN controller itself is abstracted by [`CanDevice`]. On Linux the
//! `socketcan` feature provides a SocketCAN driver; other adapters plug in
//! their own implementation.

use crate::error::{Error, Result};
use crate::protocol::XcpPacket;
use crate::transport::{Deadline, XcpTransport};
use log::{debug, trace};
use std::time::Duration;

/// Maximum payload of a classic CAN frame.
pub const CAN_FRAME_DATA_MAX: usize = 8;

/// Flag marking an identifier as 29-bit extended.
pub const CAN_EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Highest standard (11-bit) identifier.
const CAN_STD_ID_MAX: u32 = 0x7FF;

/// Highest extended (29-bit) identifier.
const CAN_EXT_ID_MAX: u32 = 0x1FFF_FFFF;

/// CAN transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanSettings {
    /// Interface name understood by the device driver (e.g. "can0").
    pub device: String,
    /// Channel index on multi-channel adapters.
    pub channel: u32,
    /// Bit rate in bits per second.
    pub baudrate: u32,
    /// Identifier of host to target frames.
    pub transmit_id: u32,
    /// Identifier of target to host frames.
    pub receive_id: u32,
    /// Use 29-bit identifiers.
    pub extended_ids: bool,
}

impl Default for CanSettings {
    fn default() -> Self {
        Self {
            device: String::new(),
            channel: 0,
            baudrate: 500_000,
            transmit_id: 0x667,
            receive_id: 0x7E1,
            extended_ids: false,
        }
    }
}

impl CanSettings {
    /// Check that the identifiers fit the configured identifier width.
    pub fn validate(&self) -> Result<()> {
        let max = if self.extended_ids {
            CAN_EXT_ID_MAX
        } else {
            CAN_STD_ID_MAX
        };
        for (name, id) in [("transmit", self.transmit_id), ("receive", self.receive_id)] {
            if id & !CAN_EXTENDED_ID_FLAG > max {
                return Err(Error::Config(format!(
                    "{name} id {id:#x} exceeds {max:#x}"
                )));
            }
        }
        Ok(())
    }
}

/// A classic CAN frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// Identifier without flags.
    pub id: u32,
    /// 29-bit identifier.
    pub extended: bool,
    data: [u8; CAN_FRAME_DATA_MAX],
    len: u8,
}

impl CanFrame {
    /// Build a frame; fails for more than 8 data bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        if data.len() > CAN_FRAME_DATA_MAX {
            return Err(Error::InvalidArgument(format!(
                "CAN frame cannot carry {} bytes",
                data.len()
            )));
        }
        let mut buf = [0u8; CAN_FRAME_DATA_MAX];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id: id & !CAN_EXTENDED_ID_FLAG,
            extended,
            data: buf,
            // bounded by the check above
            len: data.len() as u8,
        })
    }

    /// Data bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CanFrame {{ id: {:#x}", self.id)?;
        if self.extended {
            write!(f, " (ext)")?;
        }
        write!(f, ", data: {:02X?} }}", self.data())
    }
}

/// Link-layer CAN driver.
pub trait CanDevice: Send {
    /// Bring the interface up with the given settings.
    fn open(&mut self, settings: &CanSettings) -> Result<()>;

    /// Take the interface down.
    fn close(&mut self);

    /// Queue one frame for transmission.
    fn transmit(&mut self, frame: &CanFrame) -> Result<()>;

    /// Wait up to `timeout` for the next received frame.
    ///
    /// `Ok(None)` means nothing arrived in time.
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;
}

/// XCP transport over a [`CanDevice`].
pub struct XcpCanTransport<D: CanDevice> {
    settings: CanSettings,
    device: D,
    connected: bool,
}

impl<D: CanDevice> XcpCanTransport<D> {
    /// Create a transport using `device`.
    pub fn new(settings: CanSettings, device: D) -> Self {
        Self {
            settings,
            device,
            connected: false,
        }
    }

    /// Settings this transport was created with.
    pub fn settings(&self) -> &CanSettings {
        &self.settings
    }

    fn receive_id(&self) -> u32 {
        self.settings.receive_id & !CAN_EXTENDED_ID_FLAG
    }
}

impl<D: CanDevice> XcpTransport for XcpCanTransport<D> {
    fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        self.settings.validate()?;
        debug!(
            "Opening CAN {} channel {} at {} bit/s",
            self.settings.device, self.settings.channel, self.settings.baudrate
        );
        self.device.open(&self.settings)?;
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.device.close();
            self.connected = false;
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
        let deadline = Deadline::after(timeout);
        let frame = CanFrame::new(
            self.settings.transmit_id,
            self.settings.extended_ids,
            tx.as_slice(),
        )?;
        trace!("can tx {frame:?}");
        self.device.transmit(&frame)?;

        let wanted = self.receive_id();
        while let Some(left) = deadline.remaining() {
            let Some(frame) = self.device.receive(left)? else {
                continue;
            };
            if frame.id != wanted || frame.extended != self.settings.extended_ids {
                trace!("can ignoring {frame:?}");
                continue;
            }
            trace!("can rx {frame:?}");
            if frame.data().is_empty() {
                continue;
            }
            rx.extend_from_slice(frame.data())?;
            return Ok(());
        }
        Err(Error::Timeout(format!(
            "no CAN frame with id {wanted:#x} within {timeout:?}"
        )))
    }
}

impl<D: CanDevice> Drop for XcpCanTransport<D> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Device that answers each transmitted frame with scripted frames.
    struct ScriptedDevice {
        replies: VecDeque<Vec<CanFrame>>,
        pending: VecDeque<CanFrame>,
        sent: Vec<CanFrame>,
    }

    impl CanDevice for ScriptedDevice {
        fn open(&mut self, _settings: &CanSettings) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {}

        fn transmit(&mut self, frame: &CanFrame) -> Result<()> {
            self.sent.push(*frame);
            if let Some(frames) = self.replies.pop_front() {
                self.pending.extend(frames);
            }
            Ok(())
        }

        fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
            match self.pending.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                },
            }
        }
    }

    fn transport(replies: Vec<Vec<CanFrame>>) -> XcpCanTransport<ScriptedDevice> {
        XcpCanTransport::new(
            CanSettings::default(),
            ScriptedDevice {
                replies: replies.into(),
                pending: VecDeque::new(),
                sent: Vec::new(),
            },
        )
    }

    #[test]
    fn test_can_filters_foreign_ids() {
        let foreign = CanFrame::new(0x123, false, &[0xAA]).unwrap();
        let answer = CanFrame::new(0x7E1, false, &[0xFF, 0x00]).unwrap();
        let mut t = transport(vec![vec![foreign, answer]]);
        t.connect().unwrap();

        let tx = XcpPacket::from_slice(&[0xFF, 0x00]).unwrap();
        let mut rx = XcpPacket::new();
        t.send_packet(&tx, &mut rx, Duration::from_millis(50))
            .unwrap();
        assert_eq!(rx.as_slice(), &[0xFF, 0x00]);
        assert_eq!(t.device.sent[0].id, 0x667);
    }

    #[test]
    fn test_can_timeout_without_answer() {
        let mut t = transport(vec![]);
        t.connect().unwrap();
        let tx = XcpPacket::from_slice(&[0xFD]).unwrap();
        let mut rx = XcpPacket::new();
        let result = t.send_packet(&tx, &mut rx, Duration::from_millis(20));
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_can_rejects_oversized_packet() {
        let mut t = transport(vec![]);
        t.connect().unwrap();
        let tx = XcpPacket::from_slice(&[0u8; 9]).unwrap();
        let mut rx = XcpPacket::new();
        assert!(matches!(
            t.send_packet(&tx, &mut rx, Duration::from_millis(5)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_can_settings_validate_id_width() {
        let mut settings = CanSettings {
            transmit_id: 0x1234,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        settings.extended_ids = true;
        assert!(settings.validate().is_ok());
    }
}
