//! The `Get<T>` and `Set<T>` traits provide a single pair of generic,
//! overloaded methods on [`Handle`] for all supported value types.

use crate::error::Error;
use crate::handle::Handle;
use crate::platform::Platform;
use crate::Key;
use crate::raw::{CHUNK_MAX_SIZE, ItemType};
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;

pub trait Get<T> {
    fn get(&mut self, key: &Key) -> Result<T, Error>;
}

pub trait Set<T> {
    fn set(&mut self, key: &Key, value: T) -> Result<(), Error>;
}

impl<'s, F: Platform> Handle<'s, F> {
    /// Reads the value under `key` as `T`.
    ///
    /// Supported types are `bool`, signed and unsigned integers up to
    /// 64-bit width, `String` and `Vec<u8>`.
    pub fn get<T>(&mut self, key: &Key) -> Result<T, Error>
    where
        Self: Get<T>,
    {
        Get::get(self, key)
    }

    /// Stores `value` under `key`.
    ///
    /// Integers and `bool` occupy a single entry, `&str` a span of entries
    /// within one page, `&[u8]` may span multiple pages.
    pub fn set<T>(&mut self, key: &Key, value: T) -> Result<(), Error>
    where
        Self: Set<T>,
    {
        Set::set(self, key, value)
    }

    fn get_primitive(&mut self, datatype: ItemType, key: &Key) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        let width = self.get_raw(datatype, key, &mut buf)?;
        debug_assert!(width <= 8);
        Ok(u64::from_le_bytes(buf))
    }

    fn set_primitive(
        &mut self,
        datatype: ItemType,
        key: &Key,
        value: u64,
        width: usize,
    ) -> Result<(), Error> {
        self.set_raw(datatype, key, &value.to_le_bytes()[..width])
    }
}

macro_rules! impl_primitive {
    ($ty:ty, $unsigned:ty, $item_type:expr) => {
        impl<'s, F: Platform> Get<$ty> for Handle<'s, F> {
            fn get(&mut self, key: &Key) -> Result<$ty, Error> {
                let value = self.get_primitive($item_type, key)?;
                Ok(value as $unsigned as $ty)
            }
        }

        impl<'s, F: Platform> Set<$ty> for Handle<'s, F> {
            fn set(&mut self, key: &Key, value: $ty) -> Result<(), Error> {
                self.set_primitive(
                    $item_type,
                    key,
                    value as $unsigned as u64,
                    size_of::<$ty>(),
                )
            }
        }
    };
}

impl_primitive!(u8, u8, ItemType::U8);
impl_primitive!(i8, u8, ItemType::I8);
impl_primitive!(u16, u16, ItemType::U16);
impl_primitive!(i16, u16, ItemType::I16);
impl_primitive!(u32, u32, ItemType::U32);
impl_primitive!(i32, u32, ItemType::I32);
impl_primitive!(u64, u64, ItemType::U64);
impl_primitive!(i64, u64, ItemType::I64);

impl<'s, F: Platform> Get<bool> for Handle<'s, F> {
    fn get(&mut self, key: &Key) -> Result<bool, Error> {
        let value = self.get_primitive(ItemType::U8, key)?;
        Ok(value as u8 != 0)
    }
}

impl<'s, F: Platform> Set<bool> for Handle<'s, F> {
    fn set(&mut self, key: &Key, value: bool) -> Result<(), Error> {
        self.set_primitive(ItemType::U8, key, value as u64, 1)
    }
}

impl<'s, F: Platform> Get<String> for Handle<'s, F> {
    fn get(&mut self, key: &Key) -> Result<String, Error> {
        let size = self.get_data_size(ItemType::Str, key)?;
        let mut buf = vec![0u8; size];
        let read = self.get_raw(ItemType::Str, key, &mut buf)?;

        // Strip the stored null terminator.
        let text = &buf[..read.saturating_sub(1)];
        let text = core::str::from_utf8(text).map_err(|_| Error::InvalidArg)?;
        Ok(text.to_string())
    }
}

impl<'s, F: Platform> Set<&str> for Handle<'s, F> {
    fn set(&mut self, key: &Key, value: &str) -> Result<(), Error> {
        if value.len() + 1 > CHUNK_MAX_SIZE {
            return Err(Error::ValueTooLong);
        }
        let mut buf = Vec::with_capacity(value.len() + 1);
        buf.extend_from_slice(value.as_bytes());
        buf.push(b'\0');
        self.set_raw(ItemType::Str, key, &buf)
    }
}

impl<'s, F: Platform> Get<Vec<u8>> for Handle<'s, F> {
    fn get(&mut self, key: &Key) -> Result<Vec<u8>, Error> {
        let size = self.get_data_size(ItemType::Blob, key)?;
        let mut buf = vec![0u8; size];
        let read = self.get_raw(ItemType::Blob, key, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }
}

impl<'s, F: Platform> Set<&[u8]> for Handle<'s, F> {
    fn set(&mut self, key: &Key, value: &[u8]) -> Result<(), Error> {
        self.set_raw(ItemType::Blob, key, value)
    }
}
