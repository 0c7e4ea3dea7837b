//! XCP packet buffer, command builders and response decoding.
//!
//! Only the subset of XCP used by a flash bootloader is implemented: the
//! standard commands for connecting and unlocking, memory transfer via the
//! MTA pointer, and the programming (PGM) command group.
//!
//! ## Command Packet Layout
//!
//! ```text
//! +------+------------------------------------+
//! | PID  |            parameters              |
//! +------+------------------------------------+
//! |  1   |     0 .. max_cto - 1 bytes         |
//! +------+------------------------------------+
//! ```
//!
//! Responses start with [`PID_RES`] (positive) or [`PID_ERR`] followed by
//! an error code. Multi-byte parameters use the byte order the target
//! reports in its CONNECT response.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Maximum size of a single XCP packet handled by the host.
pub const XCP_PACKET_SIZE_MAX: usize = 255;

/// Positive response packet identifier.
pub const PID_RES: u8 = 0xFF;

/// Negative response packet identifier.
pub const PID_ERR: u8 = 0xFE;

/// XCP command codes.
pub mod cmd {
    /// CONNECT.
    pub const CONNECT: u8 = 0xFF;
    /// DISCONNECT.
    pub const DISCONNECT: u8 = 0xFE;
    /// GET_STATUS.
    pub const GET_STATUS: u8 = 0xFD;
    /// SYNCH.
    pub const SYNCH: u8 = 0xFC;
    /// USER_CMD.
    pub const USER_CMD: u8 = 0xF1;
    /// GET_SEED.
    pub const GET_SEED: u8 = 0xF8;
    /// UNLOCK.
    pub const UNLOCK: u8 = 0xF7;
    /// SET_MTA.
    pub const SET_MTA: u8 = 0xF6;
    /// UPLOAD.
    pub const UPLOAD: u8 = 0xF5;
    /// PROGRAM_START.
    pub const PROGRAM_START: u8 = 0xD2;
    /// PROGRAM_CLEAR.
    pub const PROGRAM_CLEAR: u8 = 0xD1;
    /// PROGRAM.
    pub const PROGRAM: u8 = 0xD0;
    /// PROGRAM_RESET.
    pub const PROGRAM_RESET: u8 = 0xCF;
    /// PROGRAM_MAX.
    pub const PROGRAM_MAX: u8 = 0xC9;
}

/// XCP error codes carried in a negative response.
pub mod err {
    /// Command processor synchronisation.
    pub const CMD_SYNCH: u8 = 0x00;
    /// Command was not executed, target busy.
    pub const CMD_BUSY: u8 = 0x10;
    /// DAQ list active.
    pub const DAQ_ACTIVE: u8 = 0x11;
    /// Programming in progress.
    pub const PGM_ACTIVE: u8 = 0x12;
    /// Unknown command.
    pub const CMD_UNKNOWN: u8 = 0x20;
    /// Command syntax invalid.
    pub const CMD_SYNTAX: u8 = 0x21;
    /// Parameter out of range.
    pub const OUT_OF_RANGE: u8 = 0x22;
    /// Memory location write protected.
    pub const WRITE_PROTECTED: u8 = 0x23;
    /// Memory location not accessible.
    pub const ACCESS_DENIED: u8 = 0x24;
    /// Seed/key access required.
    pub const ACCESS_LOCKED: u8 = 0x25;
    /// Page not valid.
    pub const PAGE_NOT_VALID: u8 = 0x26;
    /// Page mode not valid.
    pub const MODE_NOT_VALID: u8 = 0x27;
    /// Segment not valid.
    pub const SEGMENT_NOT_VALID: u8 = 0x28;
    /// Sequence error.
    pub const SEQUENCE: u8 = 0x29;
    /// DAQ configuration not valid.
    pub const DAQ_CONFIG: u8 = 0x2A;
    /// Memory overflow.
    pub const MEMORY_OVERFLOW: u8 = 0x30;
    /// Generic error.
    pub const GENERIC: u8 = 0x31;
    /// Verify failed.
    pub const VERIFY: u8 = 0x32;
    /// Resource temporarily not accessible.
    pub const RESOURCE_TEMPORARY_NOT_ACCESSIBLE: u8 = 0x33;
    /// Unknown sub-command.
    pub const SUBCMD_UNKNOWN: u8 = 0x34;
}

/// Resource bits used by CONNECT, GET_STATUS, GET_SEED and UNLOCK.
pub mod resource {
    /// Calibration and paging.
    pub const CALPAG: u8 = 0x01;
    /// Data acquisition.
    pub const DAQ: u8 = 0x04;
    /// Data stimulation.
    pub const STIM: u8 = 0x08;
    /// Flash programming.
    pub const PGM: u8 = 0x10;
}

/// Sub-command of USER_CMD that compares the info table on the target.
pub const USER_CMD_CHECK_INFO_TABLE: u8 = 0x01;

/// Human readable name of an XCP error code.
pub fn error_name(code: u8) -> &'static str {
    match code {
        err::CMD_SYNCH => "ERR_CMD_SYNCH",
        err::CMD_BUSY => "ERR_CMD_BUSY",
        err::DAQ_ACTIVE => "ERR_DAQ_ACTIVE",
        err::PGM_ACTIVE => "ERR_PGM_ACTIVE",
        err::CMD_UNKNOWN => "ERR_CMD_UNKNOWN",
        err::CMD_SYNTAX => "ERR_CMD_SYNTAX",
        err::OUT_OF_RANGE => "ERR_OUT_OF_RANGE",
        err::WRITE_PROTECTED => "ERR_WRITE_PROTECTED",
        err::ACCESS_DENIED => "ERR_ACCESS_DENIED",
        err::ACCESS_LOCKED => "ERR_ACCESS_LOCKED",
        err::PAGE_NOT_VALID => "ERR_PAGE_NOT_VALID",
        err::MODE_NOT_VALID => "ERR_MODE_NOT_VALID",
        err::SEGMENT_NOT_VALID => "ERR_SEGMENT_NOT_VALID",
        err::SEQUENCE => "ERR_SEQUENCE",
        err::DAQ_CONFIG => "ERR_DAQ_CONFIG",
        err::MEMORY_OVERFLOW => "ERR_MEMORY_OVERFLOW",
        err::GENERIC => "ERR_GENERIC",
        err::VERIFY => "ERR_VERIFY",
        err::RESOURCE_TEMPORARY_NOT_ACCESSIBLE => "ERR_RESOURCE_TEMPORARY_NOT_ACCESSIBLE",
        err::SUBCMD_UNKNOWN => "ERR_SUBCMD_UNKNOWN",
        _ => "unknown",
    }
}

/// Fixed-capacity packet buffer.
///
/// Holds one XCP packet without heap allocation. Transports receive
/// directly into [`XcpPacket::buffer_mut`] and then commit the length.
#[derive(Clone, PartialEq, Eq)]
pub struct XcpPacket {
    data: [u8; XCP_PACKET_SIZE_MAX],
    len: usize,
}

impl XcpPacket {
    /// Create an empty packet.
    pub const fn new() -> Self {
        Self {
            data: [0; XCP_PACKET_SIZE_MAX],
            len: 0,
        }
    }

    /// Create a packet holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut packet = Self::new();
        packet.extend_from_slice(bytes)?;
        Ok(packet)
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the packet holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Valid bytes of the packet.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Drop all bytes.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append a byte.
    pub fn push(&mut self, byte: u8) -> Result<()> {
        self.extend_from_slice(&[byte])
    }

    /// Append bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.len + bytes.len();
        if end > XCP_PACKET_SIZE_MAX {
            return Err(Error::InvalidArgument(format!(
                "packet of {end} bytes exceeds {XCP_PACKET_SIZE_MAX}"
            )));
        }
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Whole backing storage, for transports that receive in place.
    pub fn buffer_mut(&mut self) -> &mut [u8; XCP_PACKET_SIZE_MAX] {
        &mut self.data
    }

    /// Commit the number of valid bytes after receiving in place.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > XCP_PACKET_SIZE_MAX {
            return Err(Error::InvalidArgument(format!(
                "packet length {len} exceeds {XCP_PACKET_SIZE_MAX}"
            )));
        }
        self.len = len;
        Ok(())
    }

    /// First byte (packet identifier), if any.
    pub fn pid(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }
}

impl Default for XcpPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for XcpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XcpPacket[")?;
        for (i, b) in self.as_slice().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02X}")?;
        }
        write!(f, "]")
    }
}

/// Byte order of multi-byte parameters, as reported by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum XcpByteOrder {
    /// Little endian.
    #[default]
    Intel,
    /// Big endian.
    Motorola,
}

impl XcpByteOrder {
    /// Decode the byte order from the COMM_MODE_BASIC byte.
    pub fn from_comm_mode(comm_mode_basic: u8) -> Self {
        if comm_mode_basic & 0x01 == 0 {
            Self::Intel
        } else {
            Self::Motorola
        }
    }

    /// Encode a `u32` in this byte order.
    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        let mut buf = [0u8; 4];
        match self {
            Self::Intel => LittleEndian::write_u32(&mut buf, value),
            Self::Motorola => BigEndian::write_u32(&mut buf, value),
        }
        buf
    }

    /// Decode a `u16` in this byte order.
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            Self::Intel => LittleEndian::read_u16(bytes),
            Self::Motorola => BigEndian::read_u16(bytes),
        }
    }
}

/// Command packet builders.
///
/// Each builder returns a complete request packet. Builders that carry a
/// data payload fail when the payload does not fit a packet.
pub struct XcpCommand;

impl XcpCommand {
    fn packet(bytes: &[u8]) -> XcpPacket {
        let mut packet = XcpPacket::new();
        // Fixed-size commands always fit.
        packet.data[..bytes.len()].copy_from_slice(bytes);
        packet.len = bytes.len();
        packet
    }

    /// CONNECT with the given mode.
    pub fn connect(mode: u8) -> XcpPacket {
        Self::packet(&[cmd::CONNECT, mode])
    }

    /// GET_STATUS.
    pub fn get_status() -> XcpPacket {
        Self::packet(&[cmd::GET_STATUS])
    }

    /// GET_SEED. `mode` 0 requests the first part, 1 the remaining parts.
    pub fn get_seed(mode: u8, resource: u8) -> XcpPacket {
        Self::packet(&[cmd::GET_SEED, mode, resource])
    }

    /// UNLOCK with one part of the key; `remaining` is the number of key
    /// bytes still to be sent including this part.
    pub fn unlock(remaining: u8, key_part: &[u8]) -> Result<XcpPacket> {
        let mut packet = Self::packet(&[cmd::UNLOCK, remaining]);
        packet.extend_from_slice(key_part)?;
        Ok(packet)
    }

    /// SET_MTA to `address` (extension 0).
    pub fn set_mta(address: u32, order: XcpByteOrder) -> XcpPacket {
        let mut packet = Self::packet(&[cmd::SET_MTA, 0, 0, 0]);
        let addr = order.u32_bytes(address);
        packet.data[4..8].copy_from_slice(&addr);
        packet.len = 8;
        packet
    }

    /// UPLOAD of `count` bytes from the MTA.
    pub fn upload(count: u8) -> XcpPacket {
        Self::packet(&[cmd::UPLOAD, count])
    }

    /// PROGRAM_START.
    pub fn program_start() -> XcpPacket {
        Self::packet(&[cmd::PROGRAM_START])
    }

    /// PROGRAM_CLEAR of `range` bytes from the MTA (absolute access mode).
    pub fn program_clear(range: u32, order: XcpByteOrder) -> XcpPacket {
        let mut packet = Self::packet(&[cmd::PROGRAM_CLEAR, 0, 0, 0]);
        packet.data[4..8].copy_from_slice(&order.u32_bytes(range));
        packet.len = 8;
        packet
    }

    /// PROGRAM with `data` at the MTA. An empty `data` marks the end of the
    /// programming sequence.
    pub fn program(data: &[u8]) -> Result<XcpPacket> {
        let count = u8::try_from(data.len())
            .map_err(|_| Error::InvalidArgument("PROGRAM payload too long".into()))?;
        let mut packet = Self::packet(&[cmd::PROGRAM, count]);
        packet.extend_from_slice(data)?;
        Ok(packet)
    }

    /// PROGRAM_MAX with `data` at the MTA; the element count is implicit.
    pub fn program_max(data: &[u8]) -> Result<XcpPacket> {
        let mut packet = Self::packet(&[cmd::PROGRAM_MAX]);
        packet.extend_from_slice(data)?;
        Ok(packet)
    }

    /// PROGRAM_RESET.
    pub fn program_reset() -> XcpPacket {
        Self::packet(&[cmd::PROGRAM_RESET])
    }

    /// USER_CMD comparing `expected` against the info table at the MTA.
    pub fn check_info_table(expected: &[u8]) -> Result<XcpPacket> {
        let count = u8::try_from(expected.len())
            .map_err(|_| Error::InvalidArgument("info table chunk too long".into()))?;
        let mut packet = Self::packet(&[cmd::USER_CMD, USER_CMD_CHECK_INFO_TABLE, count]);
        packet.extend_from_slice(expected)?;
        Ok(packet)
    }
}

/// Check the packet identifier of a response to `command`.
///
/// Returns the payload after the PID on a positive response.
pub fn check_response(command: u8, response: &XcpPacket) -> Result<&[u8]> {
    match response.as_slice() {
        [PID_RES, payload @ ..] => Ok(payload),
        [PID_ERR, code, ..] => Err(Error::Protocol {
            command,
            code: *code,
        }),
        [PID_ERR] => Err(Error::MalformedResponse(format!(
            "negative response to {command:#04x} without error code"
        ))),
        [] => Err(Error::MalformedResponse(format!(
            "empty response to {command:#04x}"
        ))),
        [pid, ..] => Err(Error::MalformedResponse(format!(
            "unexpected PID {pid:#04x} in response to {command:#04x}"
        ))),
    }
}

fn require_len(command: u8, payload: &[u8], min: usize) -> Result<()> {
    if payload.len() < min {
        return Err(Error::MalformedResponse(format!(
            "response to {command:#04x} has {} payload bytes, expected at least {min}",
            payload.len()
        )));
    }
    Ok(())
}

/// Decoded CONNECT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Available resources (see [`resource`]).
    pub resource: u8,
    /// Byte order of the target.
    pub byte_order: XcpByteOrder,
    /// Maximum command/response packet size.
    pub max_cto: u8,
    /// Maximum data transfer packet size.
    pub max_dto: u16,
}

impl ConnectInfo {
    /// Decode the payload of a positive CONNECT response.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        require_len(cmd::CONNECT, payload, 5)?;
        let byte_order = XcpByteOrder::from_comm_mode(payload[1]);
        let info = Self {
            resource: payload[0],
            byte_order,
            max_cto: payload[2],
            max_dto: byte_order.read_u16(&payload[3..5]),
        };
        if usize::from(info.max_cto) < 8 {
            return Err(Error::MalformedResponse(format!(
                "target reports max_cto {} below the XCP minimum of 8",
                info.max_cto
            )));
        }
        Ok(info)
    }

    /// Whether the programming resource is available.
    pub fn has_pgm(&self) -> bool {
        self.resource & resource::PGM != 0
    }
}

/// Decoded GET_STATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    /// Current session status.
    pub session_status: u8,
    /// Resources currently protected by seed/key.
    pub protection: u8,
}

impl StatusInfo {
    /// Decode the payload of a positive GET_STATUS response.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        require_len(cmd::GET_STATUS, payload, 2)?;
        Ok(Self {
            session_status: payload[0],
            protection: payload[1],
        })
    }

    /// Whether `res` is locked.
    pub fn is_protected(&self, res: u8) -> bool {
        self.protection & res != 0
    }
}

/// Decoded PROGRAM_START response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramStartInfo {
    /// Communication mode for programming.
    pub comm_mode_pgm: u8,
    /// Maximum command packet size while programming.
    pub max_cto_pgm: u8,
}

impl ProgramStartInfo {
    /// Decode the payload of a positive PROGRAM_START response.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        require_len(cmd::PROGRAM_START, payload, 3)?;
        let info = Self {
            comm_mode_pgm: payload[1],
            max_cto_pgm: payload[2],
        };
        if info.max_cto_pgm < 3 {
            return Err(Error::MalformedResponse(format!(
                "target reports max_cto_pgm {} too small to program",
                info.max_cto_pgm
            )));
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_capacity_enforced() {
        let mut packet = XcpPacket::from_slice(&[0u8; XCP_PACKET_SIZE_MAX]).unwrap();
        assert_eq!(packet.len(), XCP_PACKET_SIZE_MAX);
        assert!(packet.push(0).is_err());
        assert!(packet.set_len(XCP_PACKET_SIZE_MAX + 1).is_err());
    }

    #[test]
    fn test_set_mta_byte_order() {
        let intel = XcpCommand::set_mta(0x0801_0000, XcpByteOrder::Intel);
        assert_eq!(intel.as_slice(), &[0xF6, 0, 0, 0, 0x00, 0x00, 0x01, 0x08]);

        let motorola = XcpCommand::set_mta(0x0801_0000, XcpByteOrder::Motorola);
        assert_eq!(motorola.as_slice(), &[0xF6, 0, 0, 0, 0x08, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_program_frames() {
        let program = XcpCommand::program(&[1, 2, 3]).unwrap();
        assert_eq!(program.as_slice(), &[0xD0, 3, 1, 2, 3]);

        let end = XcpCommand::program(&[]).unwrap();
        assert_eq!(end.as_slice(), &[0xD0, 0]);

        let max = XcpCommand::program_max(&[9; 7]).unwrap();
        assert_eq!(max.len(), 8);
        assert_eq!(max.pid(), Some(0xC9));
    }

    #[test]
    fn test_check_response_negative() {
        let rsp = XcpPacket::from_slice(&[PID_ERR, err::ACCESS_LOCKED]).unwrap();
        match check_response(cmd::PROGRAM_CLEAR, &rsp) {
            Err(Error::Protocol { command, code }) => {
                assert_eq!(command, cmd::PROGRAM_CLEAR);
                assert_eq!(code, err::ACCESS_LOCKED);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_check_response_rejects_garbage_pid() {
        let rsp = XcpPacket::from_slice(&[0x42, 0x00]).unwrap();
        assert!(matches!(
            check_response(cmd::UPLOAD, &rsp),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_connect_info_parse() {
        // resource=PGM, comm_mode=Motorola, max_cto=8, max_dto=0x0008
        let info = ConnectInfo::parse(&[0x10, 0x01, 0x08, 0x00, 0x08, 0x01, 0x01]).unwrap();
        assert!(info.has_pgm());
        assert_eq!(info.byte_order, XcpByteOrder::Motorola);
        assert_eq!(info.max_cto, 8);
        assert_eq!(info.max_dto, 8);
    }

    #[test]
    fn test_connect_info_rejects_small_cto() {
        assert!(ConnectInfo::parse(&[0x10, 0x00, 0x04, 0x08, 0x00]).is_err());
    }

    #[test]
    fn test_error_names() {
        assert_eq!(error_name(err::CMD_BUSY), "ERR_CMD_BUSY");
        assert_eq!(error_name(0xAB), "unknown");
    }
}
