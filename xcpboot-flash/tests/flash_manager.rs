//! Flash manager behaviour against a RAM backed flash model.

use xcpboot_flash::{
    FlashDriver, FlashError, FlashLayout, FlashManager, FlashSector, VECTOR_CHECKSUM_WORDS,
    WRITE_BLOCK_SIZE,
};

const BASE: u32 = 0x0800_4000;

const SECTORS: [FlashSector; 3] = [
    FlashSector::new(BASE, 0x2000),
    FlashSector::new(BASE + 0x2000, 0x2000),
    FlashSector::new(BASE + 0x4000, 0x4000),
];

const CHECKSUM_OFFSET: u32 = 0x1C;

/// NOR flash model: programming can only clear bits.
struct RamFlash {
    memory: Vec<u8>,
    programs: Vec<(u32, Vec<u8>)>,
    erases: Vec<u32>,
    watchdog: usize,
    fail_erase_at: Option<u32>,
}

impl RamFlash {
    fn new() -> Self {
        Self {
            memory: vec![0xFF; 0xC000],
            programs: Vec::new(),
            erases: Vec::new(),
            watchdog: 0,
            fail_erase_at: None,
        }
    }

    fn offset(address: u32) -> usize {
        (address - BASE) as usize
    }

    fn programs_at(&self, address: u32) -> usize {
        self.programs.iter().filter(|(a, _)| *a == address).count()
    }
}

impl FlashDriver for RamFlash {
    fn read(&mut self, address: u32, buf: &mut [u8]) {
        let start = Self::offset(address);
        buf.copy_from_slice(&self.memory[start..start + buf.len()]);
    }

    fn program(&mut self, address: u32, data: &[u8; WRITE_BLOCK_SIZE]) -> Result<(), FlashError> {
        let start = Self::offset(address);
        for (cell, &b) in self.memory[start..start + WRITE_BLOCK_SIZE].iter_mut().zip(data) {
            *cell &= b;
        }
        self.programs.push((address, data.to_vec()));
        Ok(())
    }

    fn erase_sector(&mut self, sector: &FlashSector) -> Result<(), FlashError> {
        if self.fail_erase_at == Some(sector.start) {
            return Err(FlashError::Erase {
                address: sector.start,
            });
        }
        let start = Self::offset(sector.start);
        self.memory[start..start + sector.size as usize].fill(0xFF);
        self.erases.push(sector.start);
        Ok(())
    }

    fn service_watchdog(&mut self) {
        self.watchdog += 1;
    }
}

fn manager(flash: RamFlash) -> FlashManager<'static, RamFlash> {
    let layout = FlashLayout::new(&SECTORS, CHECKSUM_OFFSET).unwrap();
    FlashManager::new(flash, layout)
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn test_boot_block_programmed_once_after_checksum() {
    let mut fm = manager(RamFlash::new());
    let firmware = image(0x1400);

    // Deliver the image in odd sized pieces, the vector table last.
    for start in (0x100..firmware.len()).step_by(0xF3) {
        let end = (start + 0xF3).min(firmware.len());
        fm.write(BASE + start as u32, &firmware[start..end]).unwrap();
    }
    fm.write(BASE, &firmware[..0x100]).unwrap();
    assert_eq!(fm.driver().programs_at(BASE), 0);

    fm.write_checksum().unwrap();
    assert_eq!(fm.driver().programs_at(BASE), 0);

    fm.done().unwrap();
    let flash = fm.driver();
    assert_eq!(flash.programs_at(BASE), 1);
    let (_, boot) = flash.programs.iter().find(|(a, _)| *a == BASE).unwrap();
    let slot = CHECKSUM_OFFSET as usize;
    let checksum = u32::from_le_bytes(boot[slot..slot + 4].try_into().unwrap());
    let sum = boot[..VECTOR_CHECKSUM_WORDS * 4]
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
        .fold(checksum, u32::wrapping_add);
    assert_eq!(sum, 0);

    // Every other byte of the image made it to flash unchanged.
    assert_eq!(&flash.memory[0x20..firmware.len()], &firmware[0x20..]);
    assert!(fm.verify_checksum());
}

#[test]
fn test_verify_checksum_for_arbitrary_vectors() {
    for seed in [0u32, 1, 0xDEAD_BEEF, u32::MAX] {
        let mut fm = manager(RamFlash::new());
        let vectors: Vec<u8> = (0..VECTOR_CHECKSUM_WORDS as u32)
            .flat_map(|i| seed.wrapping_mul(i + 1).wrapping_add(i).to_le_bytes())
            .collect();
        fm.write(BASE, &vectors).unwrap();
        fm.write_checksum().unwrap();
        fm.done().unwrap();
        assert!(fm.verify_checksum(), "seed {seed:#x}");
    }
}

#[test]
fn test_verify_checksum_fails_on_blank_flash() {
    let mut fm = manager(RamFlash::new());
    assert!(!fm.verify_checksum());
}

#[test]
fn test_write_checksum_without_boot_data_is_noop() {
    let mut fm = manager(RamFlash::new());
    fm.write(BASE + 0x800, &[1, 2, 3]).unwrap();
    fm.write_checksum().unwrap();
    fm.done().unwrap();
    assert_eq!(fm.driver().programs_at(BASE), 0);
    assert_eq!(fm.driver().programs_at(BASE + 0x800), 1);
}

#[test]
fn test_generic_block_flushed_on_switch() {
    let mut fm = manager(RamFlash::new());
    fm.write(BASE + 0x400, &[0x11; 4]).unwrap();
    assert!(fm.driver().programs.is_empty());
    fm.write(BASE + 0x800, &[0x22; 4]).unwrap();
    assert_eq!(fm.driver().programs_at(BASE + 0x400), 1);
    fm.done().unwrap();
    assert_eq!(fm.driver().programs_at(BASE + 0x800), 1);
    assert_eq!(fm.driver().memory[0x400..0x404], [0x11; 4]);
    assert_eq!(fm.driver().memory[0x404], 0xFF);
}

#[test]
fn test_out_of_bounds_rejected() {
    let mut fm = manager(RamFlash::new());
    assert_eq!(
        fm.write(BASE - 4, &[0; 8]),
        Err(FlashError::OutOfBounds {
            address: BASE - 4,
            len: 8
        })
    );
    assert!(matches!(
        fm.write(BASE + 0xBFFF, &[0; 2]),
        Err(FlashError::OutOfBounds { .. })
    ));
    assert!(matches!(
        fm.erase(BASE + 0xC000, 1),
        Err(FlashError::OutOfBounds { .. })
    ));
    assert!(fm.driver().programs.is_empty());
}

#[test]
fn test_erase_skips_blank_sectors() {
    let mut flash = RamFlash::new();
    flash.memory[0x2010] = 0x00;
    let mut fm = manager(flash);

    fm.erase(BASE, 0x8000).unwrap();
    assert_eq!(fm.driver().erases, vec![BASE + 0x2000]);
    assert!(fm.driver().watchdog > 0);
}

#[test]
fn test_erase_aborts_on_first_failure() {
    let mut flash = RamFlash::new();
    flash.memory.fill(0x00);
    flash.fail_erase_at = Some(BASE + 0x2000);
    let mut fm = manager(flash);

    assert_eq!(
        fm.erase(BASE, 0xC000),
        Err(FlashError::Erase {
            address: BASE + 0x2000
        })
    );
    assert_eq!(fm.driver().erases, vec![BASE]);
}

#[test]
fn test_verify_mismatch_reported() {
    let mut flash = RamFlash::new();
    // A programmed zero bit cannot be set again.
    flash.memory[0x400] = 0x00;
    let mut fm = manager(flash);
    fm.write(BASE + 0x400, &[0xAA]).unwrap();
    assert_eq!(
        fm.done(),
        Err(FlashError::Verify {
            address: BASE + 0x400
        })
    );
}

#[test]
fn test_user_program_base() {
    let fm = manager(RamFlash::new());
    assert_eq!(fm.user_program_base(), BASE);
}
