//! Adapter between the page layer and the raw flash driver.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::SECTOR_SIZE;
use alloc::vec;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

/// Byte offset of a sector relative to the partition start.
pub(crate) const fn sector_offset(sector: u16) -> u32 {
    sector as u32 * SECTOR_SIZE as u32
}

/// A sector-aligned window of the flash reserved for the store. Offsets
/// passed to [`read`](Partition::read) and [`write`](Partition::write) are
/// relative to the partition start; programs may only clear bits and are
/// padded up to the word size of the driver.
pub struct Partition<F: Platform> {
    flash: F,
    base: u32,
    sectors: u16,
}

impl<F: Platform> Partition<F> {
    /// Wraps `flash`, reserving `size` bytes starting at `offset`. Both
    /// must be multiples of the sector size and lie within the flash.
    pub fn new(flash: F, offset: usize, size: usize) -> Result<Self, Error> {
        if !offset.is_multiple_of(SECTOR_SIZE) || !size.is_multiple_of(SECTOR_SIZE) {
            return Err(Error::InvalidArg);
        }

        let sectors = size / SECTOR_SIZE;
        if sectors > u16::MAX as usize || offset + size > flash.capacity() {
            return Err(Error::InvalidArg);
        }

        Ok(Self {
            flash,
            base: offset as u32,
            sectors: sectors as u16,
        })
    }

    /// Releases the underlying flash driver.
    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn sector_count(&self) -> u16 {
        self.sectors
    }

    pub(crate) fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.flash
            .read(self.base + offset, buf)
            .map_err(|_| Error::Flash)
    }

    /// Programs `bytes` at `offset`. The offset must be word aligned; a
    /// trailing partial word is padded with 0xFF, and skipped entirely when
    /// it carries no zero bits.
    pub(crate) fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        debug_assert!((offset as usize).is_multiple_of(F::WRITE_SIZE));

        let addr = self.base + offset;
        if bytes.len().is_multiple_of(F::WRITE_SIZE) {
            return self.flash.write(addr, bytes).map_err(|_| Error::Flash);
        }

        let pivot = bytes.len() / F::WRITE_SIZE * F::WRITE_SIZE;
        if pivot > 0 {
            self.flash
                .write(addr, &bytes[..pivot])
                .map_err(|_| Error::Flash)?;
        }

        let trailer = &bytes[pivot..];
        if trailer.iter().any(|&b| b != 0xFF) {
            let mut word = vec![0xFF; F::WRITE_SIZE];
            word[..trailer.len()].copy_from_slice(trailer);
            self.flash
                .write(addr + pivot as u32, &word)
                .map_err(|_| Error::Flash)?;
        }

        Ok(())
    }

    pub(crate) fn erase_sector(&mut self, sector: u16) -> Result<(), Error> {
        let from = self.base + sector_offset(sector);
        self.flash
            .erase(from, from + SECTOR_SIZE as u32)
            .map_err(|_| Error::Flash)
    }
}
