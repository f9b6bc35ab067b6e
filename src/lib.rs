#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

extern crate alloc;

pub mod error;
mod handle;
mod page;
mod page_manager;
mod partition;
pub mod platform;
mod raw;
mod storage;
mod typed;

pub use error::Error;
pub use handle::{Handle, OpenMode};
pub use page::EntryStatistics;
pub use partition::Partition;
pub use raw::ItemType;
pub use storage::{Entry, EntryIter, PageCounts, Stats, Storage};
pub use typed::{Get, Set};

/// Size of the flash sectors this store is laid out for.
pub const SECTOR_SIZE: usize = raw::SECTOR_SIZE;

/// Maximum length of a key or namespace name, excluding the null
/// terminator.
pub const MAX_KEY_LENGTH: usize = 15;

const MAX_KEY_NUL_TERMINATED_LENGTH: usize = MAX_KEY_LENGTH + 1;

use core::fmt;

/// A 16 byte key or namespace name: up to 15 characters plus the null
/// terminator, shorter names padded with null bytes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Key([u8; MAX_KEY_NUL_TERMINATED_LENGTH]);

impl Key {
    /// Builds a key from a fixed-size byte array, padding with null bytes.
    ///
    /// Usage: `Key::from_array(b"my_key")`. Panics when the array exceeds
    /// 15 bytes; prefer a const context so the check happens at compile
    /// time: `const { Key::from_array(b"my_key") }`.
    pub const fn from_array<const M: usize>(src: &[u8; M]) -> Self {
        assert!(M <= MAX_KEY_LENGTH);
        Self::from_slice(src)
    }

    /// Builds a key from a byte slice, padding with null bytes. Panics
    /// when the slice exceeds 15 bytes.
    pub const fn from_slice(src: &[u8]) -> Self {
        assert!(src.len() <= MAX_KEY_LENGTH);
        let mut dst = [0u8; MAX_KEY_NUL_TERMINATED_LENGTH];
        let mut i = 0;
        while i < src.len() {
            dst[i] = src[i];
            i += 1;
        }
        Self(dst)
    }

    /// Builds a key from a string, padding with null bytes. Panics when
    /// the string exceeds 15 bytes; prefer a const context:
    /// `const { Key::from_str("my_key") }`.
    pub const fn from_str(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }

    /// Fallible constructor for names arriving at runtime. Names must be
    /// 1 to 15 bytes and free of embedded null bytes.
    pub fn try_from_str(s: &str) -> Result<Self, Error> {
        let bytes = s.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_KEY_LENGTH || bytes.contains(&0) {
            return Err(Error::InvalidArg);
        }
        Ok(Self::from_slice(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; MAX_KEY_NUL_TERMINATED_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(b\"")?;

        // The final byte is always null and only clutters the output.
        for &byte in &self.0[..self.0.len() - 1] {
            if byte == 0 {
                write!(f, "\\0")?;
                continue;
            }
            write!(f, "{}", core::ascii::escape_default(byte))?;
        }

        write!(f, "\")")
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
