use embedded_storage::nor_flash::NorFlash;

/// Everything the storage needs from the target: NOR-flash access plus a
/// CRC32 implementation (the ROM CRC on chip, zlib or similar on the host).
pub trait Platform: Crc + NorFlash {}

impl<T: Crc + NorFlash> Platform for T {}

pub type FnCrc32 = fn(init: u32, data: &[u8]) -> u32;

pub trait Crc {
    fn crc32(init: u32, data: &[u8]) -> u32;
}

impl<T: Crc> Crc for &mut T {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        T::crc32(init, data)
    }
}
