//! AES-256 decryption of firmware data.
//!
//! Encrypted firmware files carry segment data encrypted block by block
//! (ECB) with a 256-bit key. Segment lengths must therefore be a multiple of
//! the 16 byte cipher block; addresses are never encrypted.

use crate::error::{Error, Result};
use crate::image::firmware::FirmwareData;
use aes::Aes256;
use aes::cipher::{BlockDecrypt, KeyInit};
use log::debug;

/// Cipher block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Key size in bytes.
pub const AES256_KEY_SIZE: usize = 32;

/// Decrypts firmware data with a fixed key.
pub struct FirmwareDecryptor {
    cipher: Aes256,
}

impl FirmwareDecryptor {
    /// Create a decryptor; `key` must be 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256::new_from_slice(key).map_err(|_| {
            Error::InvalidArgument(format!(
                "AES-256 key must be {AES256_KEY_SIZE} bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { cipher })
    }

    /// Decrypt `data` in place.
    pub fn decrypt_in_place(&self, data: &mut [u8]) -> Result<()> {
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} bytes are not a multiple of the {AES_BLOCK_SIZE} byte cipher block",
                data.len()
            )));
        }
        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher.decrypt_block(aes::Block::from_mut_slice(block));
        }
        Ok(())
    }

    /// Decrypt every segment of `firmware` in place.
    pub fn decrypt_firmware(&self, firmware: &mut FirmwareData) -> Result<()> {
        for seg in firmware.segments_mut() {
            let base = seg.base();
            self.decrypt_in_place(seg.data_mut())
                .map_err(|e| Error::FirmwareLoad(format!("segment at {base:#010x}: {e}")))?;
            debug!("Decrypted segment at {base:#010x}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fips197_key() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn test_fips197_vector() {
        let decryptor = FirmwareDecryptor::new(&fips197_key()).unwrap();
        let mut block = [
            0x8e, 0xa2, 0xb7, 0xca, 0x51, 0x67, 0x45, 0xbf, 0xea, 0xfc, 0x49, 0x90, 0x4b, 0x49,
            0x60, 0x89,
        ];
        decryptor.decrypt_in_place(&mut block).unwrap();
        assert_eq!(block, [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff
        ]);
    }

    #[test]
    fn test_rejects_bad_key_and_length() {
        assert!(FirmwareDecryptor::new(&[0u8; 16]).is_err());
        let decryptor = FirmwareDecryptor::new(&fips197_key()).unwrap();
        assert!(decryptor.decrypt_in_place(&mut [0u8; 15]).is_err());
    }

    #[test]
    fn test_decrypt_firmware_segments() {
        let mut fw = FirmwareData::new();
        fw.add_data(0x100, &[0u8; 15]).unwrap();
        let decryptor = FirmwareDecryptor::new(&fips197_key()).unwrap();
        assert!(matches!(
            decryptor.decrypt_firmware(&mut fw),
            Err(Error::FirmwareLoad(_))
        ));
    }
}
