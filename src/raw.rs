//! On-flash layout of pages and items.
//!
//! A sector holds one page: a 32 byte header, a 32 byte entry-state bitmap
//! (two bits per entry) and 126 entries of 32 bytes each. Items of variable
//! length occupy consecutive entries; the first entry of the span carries
//! the item descriptor, the following ones raw payload bytes.

use crate::Key;
use crate::platform::FnCrc32;
use core::mem::{size_of, transmute};

pub(crate) const SECTOR_SIZE: usize = 4096;
pub(crate) const PAGE_HEADER_SIZE: usize = 32;
pub(crate) const ENTRY_BITMAP_OFFSET: usize = PAGE_HEADER_SIZE;
pub(crate) const ENTRY_BITMAP_SIZE: usize = 32;
pub(crate) const ENTRY_ARRAY_OFFSET: usize = PAGE_HEADER_SIZE + ENTRY_BITMAP_SIZE;
pub(crate) const ENTRY_SIZE: usize = size_of::<Item>();
pub(crate) const ENTRY_COUNT: usize = 126;

/// Payload capacity of one maximal chunk: a full page minus the descriptor
/// entry.
pub(crate) const CHUNK_MAX_SIZE: usize = (ENTRY_COUNT - 1) * ENTRY_SIZE;

/// Namespace index reserved for the name-to-index mapping items.
pub(crate) const NS_INDEX: u8 = 0;

/// Chunk index stored for items that are not blob chunks.
pub(crate) const CHUNK_ANY: u8 = 0xFF;

const _: () = assert!(
    PAGE_HEADER_SIZE + ENTRY_BITMAP_SIZE + ENTRY_COUNT * ENTRY_SIZE == SECTOR_SIZE,
    "page layout must fill the flash sector exactly"
);

/// State of a single entry in the bitmap. Transitions only ever clear bits:
/// an entry is programmed while its state still reads `Empty`, committed by
/// the transition to `Written`, and tombstoned by the transition to
/// `Erased`.
#[derive(strum::FromRepr, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum EntryState {
    Empty = 0b11,
    Written = 0b10,
    Erased = 0b00,
    Illegal = 0b01,
}

const PSB_INIT: u32 = 0x1;
const PSB_FULL: u32 = 0x2;
const PSB_FREEING: u32 = 0x4;
const PSB_CORRUPT: u32 = 0x8;

/// Page lifecycle, encoded so that every transition clears exactly one more
/// bit of the state word.
#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub(crate) enum PageState {
    /// All bits set, the default after a sector erase.
    Uninitialized = u32::MAX,

    /// Initialized and accepting writes.
    Active = PageState::Uninitialized as u32 & !PSB_INIT,

    /// No further writes are accepted.
    Full = PageState::Active as u32 & !PSB_FULL,

    /// Live items are being moved off this page.
    Freeing = PageState::Full as u32 & !PSB_FREEING,

    /// Unrecoverable content. Kept until the sector is needed again.
    Corrupt = PageState::Freeing as u32 & !PSB_CORRUPT,

    /// Not backed by flash content.
    Invalid = 0,
}

const PAGE_STATE_UNINITIALIZED: u32 = PageState::Uninitialized as u32;
const PAGE_STATE_ACTIVE: u32 = PageState::Active as u32;
const PAGE_STATE_FULL: u32 = PageState::Full as u32;
const PAGE_STATE_FREEING: u32 = PageState::Freeing as u32;
const PAGE_STATE_INVALID: u32 = PageState::Invalid as u32;

impl From<u32> for PageState {
    fn from(val: u32) -> Self {
        match val {
            PAGE_STATE_UNINITIALIZED => PageState::Uninitialized,
            PAGE_STATE_ACTIVE => PageState::Active,
            PAGE_STATE_FULL => PageState::Full,
            PAGE_STATE_FREEING => PageState::Freeing,
            PAGE_STATE_INVALID => PageState::Invalid,
            _ => PageState::Corrupt,
        }
    }
}

/// Datatype tag of a stored item.
#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ItemType {
    U8 = 0x01,
    I8 = 0x11,
    U16 = 0x02,
    I16 = 0x12,
    U32 = 0x04,
    I32 = 0x14,
    U64 = 0x08,
    I64 = 0x18,
    /// Null-terminated text, payload within a single page.
    Str = 0x21,
    /// Single-page blob from the earlier format without an index entry.
    /// Readable and erasable, never written.
    Blob = 0x41,
    /// One chunk of a multi-page blob.
    BlobData = 0x42,
    /// Descriptor tying the chunks of a multi-page blob together.
    BlobIdx = 0x48,
    /// Wildcard for lookups, never persisted.
    Any = 0xFF,
}

impl ItemType {
    /// Byte width of the inline payload, `None` for the variable-length
    /// types.
    pub(crate) fn fixed_width(&self) -> Option<usize> {
        match self {
            ItemType::U8 | ItemType::I8 => Some(1),
            ItemType::U16 | ItemType::I16 => Some(2),
            ItemType::U32 | ItemType::I32 => Some(4),
            ItemType::U64 | ItemType::I64 => Some(8),
            ItemType::BlobIdx => Some(size_of::<ItemData>()),
            _ => None,
        }
    }
}

/// Two-generation version tag of a multi-page blob. Chunk indices are
/// stored as version offset plus ordinal, which keeps both generations of a
/// key distinguishable during an atomic replacement.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum VerOffset {
    V0 = 0x00,
    V1 = 0x80,
}

impl VerOffset {
    pub(crate) fn toggle(self) -> VerOffset {
        match self {
            VerOffset::V0 => VerOffset::V1,
            VerOffset::V1 => VerOffset::V0,
        }
    }
}

impl From<u8> for VerOffset {
    fn from(value: u8) -> Self {
        if value < VerOffset::V1 as u8 {
            VerOffset::V0
        } else {
            VerOffset::V1
        }
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct PageHeader {
    pub(crate) state: u32,
    pub(crate) sequence: u32,
    pub(crate) version: u8,
    pub(crate) _reserved: [u8; 19],
    pub(crate) crc: u32,
}

impl PageHeader {
    pub(crate) fn from_bytes(bytes: [u8; PAGE_HEADER_SIZE]) -> Self {
        // Safety: all fields accept any bit pattern.
        unsafe { transmute(bytes) }
    }

    pub(crate) fn to_bytes(self) -> [u8; PAGE_HEADER_SIZE] {
        // Safety: plain old data, no padding.
        unsafe { transmute(self) }
    }

    /// The CRC covers everything between the state word and the CRC field.
    pub(crate) fn calculate_crc32(&self, crc32: FnCrc32) -> u32 {
        let buf = self.to_bytes();
        crc32(u32::MAX, &buf[4..28])
    }
}

/// Descriptor entry of an item as stored on flash.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct Item {
    pub(crate) ns: u8,
    pub(crate) datatype: u8,
    pub(crate) span: u8,
    pub(crate) chunk_index: u8,
    pub(crate) crc: u32,
    pub(crate) key: Key,
    pub(crate) data: ItemData,
}

const _: () = assert!(size_of::<Item>() == 32);

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) union ItemData {
    pub(crate) raw: [u8; 8],
    pub(crate) var_len: VarLengthData,
    pub(crate) blob_index: BlobIndexData,
}

/// Inline descriptor of a `Str`, `Blob` or `BlobData` payload.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct VarLengthData {
    pub(crate) size: u16,
    pub(crate) _reserved: u16,
    pub(crate) data_crc: u32,
}

impl VarLengthData {
    pub(crate) fn new(size: u16, data_crc: u32) -> Self {
        Self {
            size,
            _reserved: u16::MAX,
            data_crc,
        }
    }
}

/// Inline payload of a `BlobIdx` entry.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct BlobIndexData {
    pub(crate) data_size: u32,
    pub(crate) chunk_count: u8,
    pub(crate) chunk_start: u8,
    pub(crate) _reserved: u16,
}

impl BlobIndexData {
    pub(crate) fn new(data_size: u32, chunk_count: u8, chunk_start: VerOffset) -> Self {
        Self {
            data_size,
            chunk_count,
            chunk_start: chunk_start as u8,
            _reserved: u16::MAX,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; 8] {
        // Safety: plain old data, no padding.
        unsafe { transmute(self) }
    }
}

impl Item {
    pub(crate) fn from_bytes(bytes: [u8; ENTRY_SIZE]) -> Self {
        // Safety: every field, including the union, accepts any bit
        // pattern. The datatype byte is kept raw and decoded on demand.
        unsafe { transmute(bytes) }
    }

    pub(crate) fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        // Safety: plain old data, no padding.
        unsafe { transmute(self) }
    }

    pub(crate) fn item_type(&self) -> Option<ItemType> {
        ItemType::from_repr(self.datatype)
    }

    pub(crate) fn is_blank(&self) -> bool {
        self.to_bytes().iter().all(|&b| b == 0xFF)
    }

    /// The item CRC covers the descriptor bytes before the CRC field, the
    /// key and the inline data.
    pub(crate) fn calculate_crc32(&self, crc32: FnCrc32) -> u32 {
        let buf = self.to_bytes();
        let mut result = crc32(u32::MAX, &buf[0..4]);
        result = crc32(result, &buf[8..24]);
        crc32(result, &buf[24..32])
    }
}
