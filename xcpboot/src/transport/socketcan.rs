//! Linux SocketCAN driver for [`XcpCanTransport`].
//!
//! The interface bit rate is owned by the kernel (`ip link set can0 type can
//! bitrate 500000`); the configured baudrate is only logged.

use {
    crate::{
        error::{Error, Result},
        transport::can::{CanDevice, CanFrame, CanSettings, XcpCanTransport},
    },
    log::{debug, trace},
    socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId},
    std::{io, time::Duration},
};

/// XCP on CAN through a SocketCAN interface.
pub type XcpSocketCanTransport = XcpCanTransport<SocketCanDevice>;

impl XcpSocketCanTransport {
    /// Transport on the SocketCAN interface named in `settings.device`.
    pub fn socketcan(settings: CanSettings) -> Self {
        Self::new(settings, SocketCanDevice::default())
    }
}

/// [`CanDevice`] backed by a raw SocketCAN socket.
#[derive(Default)]
pub struct SocketCanDevice {
    socket: Option<CanSocket>,
}

fn to_socketcan_id(frame: &CanFrame) -> Result<Id> {
    let id = if frame.extended {
        ExtendedId::new(frame.id).map(Id::Extended)
    } else {
        u16::try_from(frame.id)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    };
    id.ok_or_else(|| Error::InvalidArgument(format!("CAN id {:#x} out of range", frame.id)))
}

fn from_socketcan_id(id: Id) -> (u32, bool) {
    match id {
        Id::Standard(std_id) => (u32::from(std_id.as_raw()), false),
        Id::Extended(ext_id) => (ext_id.as_raw(), true),
    }
}

impl CanDevice for SocketCanDevice {
    fn open(&mut self, settings: &CanSettings) -> Result<()> {
        if settings.device.is_empty() {
            return Err(Error::Config("no CAN interface configured".into()));
        }
        let socket = CanSocket::open(&settings.device)?;
        debug!(
            "Opened SocketCAN {} (bit rate {} set on the interface)",
            settings.device, settings.baudrate
        );
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn transmit(&mut self, frame: &CanFrame) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        let out = socketcan::CanFrame::new(to_socketcan_id(frame)?, frame.data())
            .ok_or_else(|| Error::InvalidArgument(format!("cannot build {frame:?}")))?;
        socket.write_frame(&out)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        socket.set_read_timeout(timeout)?;
        match socket.read_frame() {
            Ok(socketcan::CanFrame::Data(data)) => {
                let (id, extended) = from_socketcan_id(EmbeddedFrame::id(&data));
                Ok(Some(CanFrame::new(id, extended, EmbeddedFrame::data(&data))?))
            },
            Ok(other) => {
                trace!("socketcan ignoring non-data frame {other:?}");
                Ok(None)
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::XcpPacket;
    use crate::transport::XcpTransport;

    #[test]
    fn test_id_conversion() {
        let std_frame = CanFrame::new(0x667, false, &[0xFF]).unwrap();
        assert_eq!(
            from_socketcan_id(to_socketcan_id(&std_frame).unwrap()),
            (0x667, false)
        );

        let ext_frame = CanFrame::new(0x1234_5678, true, &[]).unwrap();
        assert_eq!(
            from_socketcan_id(to_socketcan_id(&ext_frame).unwrap()),
            (0x1234_5678, true)
        );

        let too_wide = CanFrame::new(0x800, false, &[]).unwrap();
        assert!(to_socketcan_id(&too_wide).is_err());
    }

    #[test]
    fn test_device_requires_open() {
        let mut device = SocketCanDevice::default();
        let frame = CanFrame::new(0x667, false, &[0xFF, 0x00]).unwrap();
        assert!(matches!(device.transmit(&frame), Err(Error::NotConnected)));
        assert!(matches!(
            device.receive(Duration::from_millis(1)),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_missing_interface_fails_connect() {
        let mut transport = XcpSocketCanTransport::socketcan(CanSettings {
            device: "xcpnone9".into(),
            ..CanSettings::default()
        });
        assert!(transport.connect().is_err());
        let tx = XcpPacket::from_slice(&[0xFF, 0x00]).unwrap();
        let mut rx = XcpPacket::new();
        assert!(matches!(
            transport.send_packet(&tx, &mut rx, Duration::from_millis(5)),
            Err(Error::NotConnected)
        ));
    }
}
