//! XCP on USB using the `nusb` crate.
//!
//! The bootloader enumerates as a vendor specific device with one bulk IN
//! and one bulk OUT endpoint on its first interface. Packets use the same
//! framing as RS232: one length byte followed by the packet, sent as a
//! single bulk transfer in each direction.

use {
    crate::{
        error::{Error, Result},
        protocol::XcpPacket,
        transport::{Deadline, TimedRead, XcpTransport, length_prefixed, read_length_prefixed},
    },
    log::{debug, info, trace},
    nusb::{
        Interface, MaybeFuture,
        descriptors::TransferType,
        io::{EndpointRead, EndpointWrite},
        transfer::{Bulk, Direction, In, Out},
    },
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Size of the buffers handed to the bulk endpoints.
const USB_TRANSFER_SIZE: usize = 512;

/// USB transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsbSettings {
    /// Vendor id of the bootloader device.
    pub vendor_id: u16,
    /// Product id of the bootloader device.
    pub product_id: u16,
    /// Interface carrying the bulk endpoints.
    pub interface: u8,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0x1D50,
            product_id: 0x60AC,
            interface: 0,
        }
    }
}

struct UsbLink {
    _interface: Interface,
    reader: EndpointRead<Bulk>,
    writer: EndpointWrite<Bulk>,
}

struct BulkReader<'a>(&'a mut EndpointRead<Bulk>);

impl Read for BulkReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl TimedRead for BulkReader<'_> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.0.set_read_timeout(timeout);
        Ok(())
    }
}

fn usb_error<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> Error + '_ {
    move |e| Error::Usb(format!("{context}: {e}"))
}

/// XCP transport over USB bulk endpoints.
pub struct XcpUsbTransport {
    settings: UsbSettings,
    link: Option<UsbLink>,
}

impl XcpUsbTransport {
    /// Timeout applied while writing a frame.
    pub const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Create a transport; the device is opened by [`XcpTransport::connect`].
    pub fn new(settings: UsbSettings) -> Self {
        Self {
            settings,
            link: None,
        }
    }

    /// Settings this transport was created with.
    pub fn settings(&self) -> &UsbSettings {
        &self.settings
    }

    fn open(&self) -> Result<UsbLink> {
        let UsbSettings {
            vendor_id,
            product_id,
            interface,
        } = self.settings;
        let device_info = nusb::list_devices()
            .wait()
            .map_err(usb_error("listing devices"))?
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or_else(|| {
                Error::Usb(format!("no device {vendor_id:04x}:{product_id:04x} found"))
            })?;

        let device = device_info.open().wait().map_err(usb_error("opening device"))?;
        let claimed = device
            .claim_interface(interface)
            .wait()
            .map_err(usb_error("claiming interface"))?;

        let mut in_endpoint = None;
        let mut out_endpoint = None;
        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != interface {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() != TransferType::Bulk {
                            continue;
                        }
                        if ep.direction() == Direction::In {
                            in_endpoint.get_or_insert(ep.address());
                        } else {
                            out_endpoint.get_or_insert(ep.address());
                        }
                    }
                }
            }
        }
        let (Some(in_endpoint), Some(out_endpoint)) = (in_endpoint, out_endpoint) else {
            return Err(Error::Usb(format!(
                "interface {interface} has no bulk IN/OUT endpoint pair"
            )));
        };
        info!(
            "Opened USB device {vendor_id:04x}:{product_id:04x} (in {in_endpoint:#04x}, out {out_endpoint:#04x})"
        );

        let reader = claimed
            .endpoint::<Bulk, In>(in_endpoint)
            .map_err(usb_error("bulk IN endpoint"))?
            .reader(USB_TRANSFER_SIZE);
        let mut writer = claimed
            .endpoint::<Bulk, Out>(out_endpoint)
            .map_err(usb_error("bulk OUT endpoint"))?
            .writer(USB_TRANSFER_SIZE);
        writer.set_write_timeout(Self::WRITE_TIMEOUT);
        Ok(UsbLink {
            _interface: claimed,
            reader,
            writer,
        })
    }
}

impl XcpTransport for XcpUsbTransport {
    fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        self.link = Some(self.open()?);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.link.take().is_some() {
            debug!(
                "Released USB device {:04x}:{:04x}",
                self.settings.vendor_id, self.settings.product_id
            );
        }
    }

    fn send_packet(
        &mut self,
        tx: &XcpPacket,
        rx: &mut XcpPacket,
        timeout: Duration,
    ) -> Result<()> {
        rx.clear();
        let deadline = Deadline::after(timeout);
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;

        let (frame, frame_len) = length_prefixed(tx)?;
        trace!("usb tx {tx:?}");
        link.writer.write_all(&frame[..frame_len])?;
        link.writer.flush()?;

        read_length_prefixed(&mut BulkReader(&mut link.reader), rx, deadline, "usb response")?;
        trace!("usb rx {rx:?}");
        Ok(())
    }
}

impl Drop for XcpUsbTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
