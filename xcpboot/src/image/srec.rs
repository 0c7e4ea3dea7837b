//! Motorola S-record files.
//!
//! ## Record Layout
//!
//! ```text
//! S | type | count | address | data ...  | checksum
//! 1    1      2      4/6/8     2 per byte    2        (hex characters)
//! ```
//!
//! `count` covers address, data and checksum bytes. The checksum is the
//! one's complement of the low byte of the sum of count, address and data.
//!
//! | type     | meaning              | address bytes |
//! |----------|----------------------|---------------|
//! | S0       | header               | 2             |
//! | S1/S2/S3 | data                 | 2 / 3 / 4     |
//! | S5/S6    | record count         | 2 / 3         |
//! | S7/S8/S9 | start address (end)  | 4 / 3 / 2     |

use crate::error::{Error, Result};
use crate::image::firmware::{FirmwareParser, FirmwareSegment};
use log::{debug, trace};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Data bytes per record written by [`SrecParser::save`].
pub const SREC_BYTES_PER_LINE: usize = 32;

/// Header text of written files.
const SREC_HEADER: &[u8] = b"xcpboot";

/// S-record reader and writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SrecParser;

/// One decoded line.
#[derive(Debug, PartialEq, Eq)]
enum Record {
    Header,
    Data { address: u32, data: Vec<u8> },
    Count,
    End,
}

fn address_len(record_type: u8) -> Option<usize> {
    match record_type {
        b'0' | b'1' | b'5' | b'9' => Some(2),
        b'2' | b'6' | b'8' => Some(3),
        b'3' | b'7' => Some(4),
        _ => None,
    }
}

fn record_checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

fn parse_line(line: &str) -> std::result::Result<Record, String> {
    let raw = line.as_bytes();
    if raw.len() < 4 || raw[0] != b'S' {
        return Err("not an S-record".into());
    }
    let record_type = raw[1];
    let addr_len =
        address_len(record_type).ok_or_else(|| format!("unsupported record type S{}", char::from(record_type)))?;
    let bytes = hex::decode(&raw[2..]).map_err(|e| format!("invalid hex digits: {e}"))?;

    let count = usize::from(bytes[0]);
    if bytes.len() != count + 1 {
        return Err(format!(
            "byte count {count} does not match {} bytes on the line",
            bytes.len() - 1
        ));
    }
    if count < addr_len + 1 {
        return Err(format!("byte count {count} too small for the address"));
    }
    let (body, checksum) = bytes.split_at(count);
    if record_checksum(body) != checksum[0] {
        return Err(format!(
            "checksum {:#04x} does not match {:#04x}",
            checksum[0],
            record_checksum(body)
        ));
    }

    let address = body[1..=addr_len]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    let data = &body[1 + addr_len..];
    Ok(match record_type {
        b'0' => Record::Header,
        b'1' | b'2' | b'3' => Record::Data {
            address,
            data: data.to_vec(),
        },
        b'5' | b'6' => Record::Count,
        _ => Record::End,
    })
}

impl FirmwareParser for SrecParser {
    fn load(&self, path: &Path, address_offset: u32) -> Result<Vec<FirmwareSegment>> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::FirmwareLoad(format!("{}: {e}", path.display())))?;

        let at_line = |idx: usize, msg: &dyn std::fmt::Display| {
            Error::FirmwareLoad(format!("{}:{}: {msg}", path.display(), idx + 1))
        };

        // Contiguous records are collected into one run before a segment is built.
        let mut segments: Vec<FirmwareSegment> = Vec::new();
        let mut run: Option<(u32, Vec<u8>)> = None;
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = parse_line(line).map_err(|msg| at_line(idx, &msg))?;
            let Record::Data { address, data } = record else {
                trace!("line {}: {record:?}", idx + 1);
                continue;
            };
            if data.is_empty() {
                continue;
            }
            let address = address.checked_add(address_offset).ok_or_else(|| {
                at_line(
                    idx,
                    &format!("address {address:#x} + offset {address_offset:#x} overflows"),
                )
            })?;

            if let Some((base, bytes)) = run.as_mut() {
                if u64::from(*base) + bytes.len() as u64 == u64::from(address) {
                    bytes.extend_from_slice(&data);
                    continue;
                }
            }
            if let Some((base, bytes)) = run.replace((address, data)) {
                segments.push(FirmwareSegment::new(base, bytes).map_err(|e| at_line(idx, &e))?);
            }
        }
        if let Some((base, bytes)) = run {
            segments.push(FirmwareSegment::new(base, bytes).map_err(|e| {
                Error::FirmwareLoad(format!("{}: {e}", path.display()))
            })?);
        }
        debug!(
            "Parsed {} segment(s) from {}",
            segments.len(),
            path.display()
        );
        Ok(segments)
    }

    fn save(&self, path: &Path, segments: &[FirmwareSegment]) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        write_record(&mut out, b'0', &[0, 0], SREC_HEADER)?;
        for seg in segments {
            let mut address = seg.base();
            for chunk in seg.data().chunks(SREC_BYTES_PER_LINE) {
                write_record(&mut out, b'3', &address.to_be_bytes(), chunk)?;
                // chunk length is at most SREC_BYTES_PER_LINE
                #[allow(clippy::cast_possible_truncation)]
                let step = chunk.len() as u32;
                address = address.wrapping_add(step);
            }
        }
        write_record(&mut out, b'7', &[0, 0, 0, 0], &[])?;
        out.flush()?;
        Ok(())
    }
}

fn write_record<W: Write>(out: &mut W, record_type: u8, address: &[u8], data: &[u8]) -> Result<()> {
    let count = u8::try_from(address.len() + data.len() + 1)
        .map_err(|_| Error::InvalidArgument("S-record too long".into()))?;
    let mut body = Vec::with_capacity(usize::from(count));
    body.push(count);
    body.extend_from_slice(address);
    body.extend_from_slice(data);
    let checksum = record_checksum(&body);
    body.push(checksum);
    writeln!(out, "S{}{}", char::from(record_type), hex::encode_upper(&body))?;
    Ok(())
}
