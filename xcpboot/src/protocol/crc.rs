//! Checksum helpers.
//!
//! Thin wrappers around the `crc` crate for the two algorithms the tool
//! uses: CRC16-XMODEM (CCITT polynomial, zero init) for short transfer
//! checks and CRC32 (IEEE / ISO-HDLC) over whole firmware images.

use crc::{CRC_16_XMODEM, CRC_32_ISO_HDLC, Crc};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC16-XMODEM of `data`.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC32 (IEEE) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC32 over several chunks, as if they were one contiguous buffer.
pub fn crc32_chunks<'a, I>(chunks: I) -> u32
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut digest = CRC32.digest();
    for chunk in chunks {
        digest.update(chunk);
    }
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_chunks_matches_contiguous() {
        let parts: [&[u8]; 3] = [b"1234", b"", b"56789"];
        assert_eq!(crc32_chunks(parts), crc32(b"123456789"));
    }
}
