//! # xcpboot-flash
//!
//! Target side flash block manager for an XCP bootloader.
//!
//! Data arrives from the host in arbitrary, unaligned pieces. The
//! [`FlashManager`] collects it into [`WRITE_BLOCK_SIZE`] byte blocks that
//! are aligned to the flash write granularity and programs a block once data
//! for a different block arrives.
//!
//! The first block of the user program area (the boot block) holds the
//! vector table and the checksum that marks the program as valid. It is
//! buffered separately and only programmed by [`FlashManager::done`], after
//! [`FlashManager::write_checksum`] placed the checksum in its buffer. A
//! reset in the middle of an update therefore never leaves a valid marker
//! in front of a partially written program.
//!
//! ```text
//!  user program area
//!  +-------------+-------------+-------------+-----
//!  | boot block  |   block 1   |   block 2   | ...
//!  +-------------+-------------+-------------+-----
//!   ^ vectors + checksum, programmed last
//! ```
//!
//! The crate is `no_std` and allocation free; hardware access goes through
//! the [`FlashDriver`] trait.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use log::{debug, trace, warn};
use thiserror::Error;

/// Size of a write block in bytes.
pub const WRITE_BLOCK_SIZE: usize = 1024;

/// Number of vector table words covered by the checksum.
pub const VECTOR_CHECKSUM_WORDS: usize = 7;

/// Words scanned between watchdog services in the blank check.
const BLANK_CHECK_CHUNK_WORDS: usize = 256;

const BLOCK_SIZE: u32 = WRITE_BLOCK_SIZE as u32;

/// Errors of the flash block manager.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// The range is not covered by the sector table.
    #[error("range {address:#010x}+{len:#x} is outside the flash layout")]
    OutOfBounds {
        /// Start of the rejected range.
        address: u32,
        /// Length of the rejected range.
        len: usize,
    },

    /// The driver failed to program a block.
    #[error("programming failed at {address:#010x}")]
    Program {
        /// Start of the block.
        address: u32,
    },

    /// The driver failed to erase a sector.
    #[error("erasing the sector at {address:#010x} failed")]
    Erase {
        /// Start of the sector.
        address: u32,
    },

    /// Read-back after programming did not match.
    #[error("verification failed at {address:#010x}")]
    Verify {
        /// First mismatching address.
        address: u32,
    },

    /// The sector table or checksum offset is unusable.
    #[error("invalid flash layout: {0}")]
    InvalidLayout(&'static str),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, FlashError>;

/// Flash hardware primitives.
pub trait FlashDriver {
    /// Read `buf.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]);

    /// Program one write block at the block aligned `address`.
    fn program(&mut self, address: u32, data: &[u8; WRITE_BLOCK_SIZE]) -> Result<()>;

    /// Erase `sector`.
    fn erase_sector(&mut self, sector: &FlashSector) -> Result<()>;

    /// Keep the watchdog from expiring during long operations.
    fn service_watchdog(&mut self) {}
}

/// One erasable flash sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSector {
    /// First address.
    pub start: u32,
    /// Size in bytes.
    pub size: u32,
}

impl FlashSector {
    /// Sector at `start` of `size` bytes.
    pub const fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    /// Address one past the sector.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.size)
    }

    fn contains(&self, address: u32) -> bool {
        address >= self.start && u64::from(address) < self.end()
    }
}

/// Sectors available to the user program, without the bootloader's own.
#[derive(Debug, Clone, Copy)]
pub struct FlashLayout<'a> {
    sectors: &'a [FlashSector],
    checksum_offset: u32,
}

impl<'a> FlashLayout<'a> {
    /// Validate and wrap a sector table.
    ///
    /// Sectors must be non-empty, block aligned, ordered and contiguous.
    /// `checksum_offset` locates the checksum word inside the boot block,
    /// behind the vector words it protects.
    pub fn new(sectors: &'a [FlashSector], checksum_offset: u32) -> Result<Self> {
        let Some(first) = sectors.first() else {
            return Err(FlashError::InvalidLayout("no sectors"));
        };
        let mut expected_start = u64::from(first.start);
        for sector in sectors {
            if sector.size == 0 || sector.size % BLOCK_SIZE != 0 {
                return Err(FlashError::InvalidLayout(
                    "sector size is not a multiple of the write block",
                ));
            }
            if sector.start % BLOCK_SIZE != 0 {
                return Err(FlashError::InvalidLayout("sector start is not block aligned"));
            }
            if u64::from(sector.start) != expected_start {
                return Err(FlashError::InvalidLayout("sectors are not contiguous"));
            }
            if sector.end() > 1 << 32 {
                return Err(FlashError::InvalidLayout("sector exceeds the address space"));
            }
            expected_start = sector.end();
        }
        let vector_end = (VECTOR_CHECKSUM_WORDS * 4) as u32;
        if checksum_offset % 4 != 0
            || checksum_offset < vector_end
            || checksum_offset > BLOCK_SIZE - 4
        {
            return Err(FlashError::InvalidLayout(
                "checksum slot must be an aligned word behind the vectors in the boot block",
            ));
        }
        Ok(Self {
            sectors,
            checksum_offset,
        })
    }

    /// Sector table.
    pub fn sectors(&self) -> &'a [FlashSector] {
        self.sectors
    }

    /// Offset of the checksum word from the start of the boot block.
    pub fn checksum_offset(&self) -> u32 {
        self.checksum_offset
    }

    /// First address of the user program.
    pub fn start(&self) -> u32 {
        self.sectors[0].start
    }

    /// Address one past the user program area.
    pub fn end(&self) -> u64 {
        self.sectors[self.sectors.len() - 1].end()
    }

    fn check(&self, address: u32, len: usize) -> Result<()> {
        let end = u64::from(address) + len as u64;
        if address < self.start() || end > self.end() {
            return Err(FlashError::OutOfBounds { address, len });
        }
        Ok(())
    }

    fn sector_index(&self, address: u32) -> Option<usize> {
        self.sectors.iter().position(|s| s.contains(address))
    }
}

/// Write block buffer tagged with its flash address.
struct FlashBlock {
    base: Option<u32>,
    data: [u8; WRITE_BLOCK_SIZE],
}

impl FlashBlock {
    const fn new() -> Self {
        Self {
            base: None,
            data: [0xFF; WRITE_BLOCK_SIZE],
        }
    }

    /// Select the block at `base`, starting from the current flash contents.
    fn load<D: FlashDriver>(&mut self, driver: &mut D, base: u32) {
        driver.read(base, &mut self.data);
        self.base = Some(base);
    }

    /// Program and verify the buffered block, then release it.
    fn flush<D: FlashDriver>(&mut self, driver: &mut D) -> Result<()> {
        let Some(base) = self.base else {
            return Ok(());
        };
        trace!("programming block {base:#010x}");
        driver.program(base, &self.data)?;

        let mut readback = [0u8; WRITE_BLOCK_SIZE];
        driver.read(base, &mut readback);
        if let Some(pos) = readback.iter().zip(&self.data).position(|(a, b)| a != b) {
            // pos < WRITE_BLOCK_SIZE
            #[allow(clippy::cast_possible_truncation)]
            let address = base + pos as u32;
            warn!("verification failed at {address:#010x}");
            return Err(FlashError::Verify { address });
        }
        self.base = None;
        Ok(())
    }
}

/// Buffers incoming data into write blocks and defers the boot block.
pub struct FlashManager<'a, D: FlashDriver> {
    driver: D,
    layout: FlashLayout<'a>,
    block: FlashBlock,
    boot_block: FlashBlock,
}

impl<'a, D: FlashDriver> FlashManager<'a, D> {
    /// Manager with both block buffers empty.
    pub fn new(driver: D, layout: FlashLayout<'a>) -> Self {
        Self {
            driver,
            layout,
            block: FlashBlock::new(),
            boot_block: FlashBlock::new(),
        }
    }

    /// Layout the manager was created with.
    pub fn layout(&self) -> &FlashLayout<'a> {
        &self.layout
    }

    /// Underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Mutable access to the underlying driver.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Release the driver.
    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Start address of the user program.
    pub fn user_program_base(&self) -> u32 {
        self.layout.start()
    }

    fn boot_block_base(&self) -> u32 {
        self.layout.start()
    }

    /// Buffer `data` for programming at `address`.
    ///
    /// Blocks are programmed once data for another block arrives; the boot
    /// block only in [`FlashManager::done`].
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.layout.check(address, data.len())?;

        let boot_base = self.boot_block_base();
        let mut addr = address;
        let mut rest = data;
        while !rest.is_empty() {
            self.driver.service_watchdog();

            let base = addr & !(BLOCK_SIZE - 1);
            let offset = (addr - base) as usize;
            let n = rest.len().min(WRITE_BLOCK_SIZE - offset);

            let target = if base == boot_base {
                if self.boot_block.base != Some(base) {
                    self.boot_block.load(&mut self.driver, base);
                }
                &mut self.boot_block
            } else {
                if self.block.base != Some(base) {
                    self.block.flush(&mut self.driver)?;
                    self.block.load(&mut self.driver, base);
                }
                &mut self.block
            };
            target.data[offset..offset + n].copy_from_slice(&rest[..n]);

            rest = &rest[n..];
            // n <= WRITE_BLOCK_SIZE
            #[allow(clippy::cast_possible_truncation)]
            let step = n as u32;
            addr = addr.wrapping_add(step);
        }
        Ok(())
    }

    /// Place the program checksum into the boot block buffer.
    ///
    /// The checksum is the two's complement of the sum of the first
    /// [`VECTOR_CHECKSUM_WORDS`] little endian vector words, so that vectors
    /// plus checksum add up to zero. Nothing happens when no data for the
    /// boot block was received.
    pub fn write_checksum(&mut self) -> Result<()> {
        let Some(base) = self.boot_block.base else {
            debug!("boot block untouched, no checksum written");
            return Ok(());
        };
        let sum = vector_sum(&self.boot_block.data);
        let checksum = (!sum).wrapping_add(1);
        debug!("writing checksum {checksum:#010x}");
        self.write(base + self.layout.checksum_offset, &checksum.to_le_bytes())
    }

    /// Check the checksum stored in flash.
    pub fn verify_checksum(&mut self) -> bool {
        let base = self.boot_block_base();
        let mut vectors = [0u8; VECTOR_CHECKSUM_WORDS * 4];
        self.driver.read(base, &mut vectors);
        let mut stored = [0u8; 4];
        self.driver
            .read(base + self.layout.checksum_offset, &mut stored);
        vector_sum(&vectors).wrapping_add(u32::from_le_bytes(stored)) == 0
    }

    /// Program everything still buffered: the boot block, then the last
    /// generic block.
    pub fn done(&mut self) -> Result<()> {
        self.boot_block.flush(&mut self.driver)?;
        self.block.flush(&mut self.driver)
    }

    /// Erase all sectors touched by `len` bytes at `address`.
    ///
    /// Sectors that are already blank are skipped. The first failing sector
    /// aborts the erase.
    pub fn erase(&mut self, address: u32, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.layout.check(address, len)?;
        let last_address = address + (len - 1) as u32;
        let out_of_bounds = FlashError::OutOfBounds { address, len };
        let first = self
            .layout
            .sector_index(address)
            .ok_or(out_of_bounds)?;
        let last = self
            .layout
            .sector_index(last_address)
            .ok_or(out_of_bounds)?;

        let sectors = self.layout.sectors;
        for sector in &sectors[first..=last] {
            self.driver.service_watchdog();
            if self.sector_is_blank(sector) {
                trace!("sector {:#010x} already blank", sector.start);
                continue;
            }
            debug!("erasing sector {:#010x} ({} bytes)", sector.start, sector.size);
            self.driver.erase_sector(sector)?;
        }
        Ok(())
    }

    fn sector_is_blank(&mut self, sector: &FlashSector) -> bool {
        let mut chunk = [0u8; BLANK_CHECK_CHUNK_WORDS * 4];
        let mut addr = sector.start;
        let end = sector.end();
        while u64::from(addr) < end {
            // Sector sizes are multiples of the chunk size.
            self.driver.read(addr, &mut chunk);
            if chunk.iter().any(|&b| b != 0xFF) {
                return false;
            }
            self.driver.service_watchdog();
            addr = addr.wrapping_add(chunk.len() as u32);
        }
        true
    }
}

fn vector_sum(block: &[u8]) -> u32 {
    block[..VECTOR_CHECKSUM_WORDS * 4]
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(0u32, u32::wrapping_add)
}
