//! Namespace-scoped views over the storage.

use crate::Key;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::ItemType;
use crate::storage::Storage;

/// How a [`Handle`] is opened. Read-only handles never create the
/// namespace and refuse writes.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A view bound to one namespace. The handle borrows the storage
/// exclusively, so it cannot outlive a re-initialization and no other
/// operation can interleave with it.
pub struct Handle<'s, F: Platform> {
    storage: &'s mut Storage<F>,
    ns_index: u8,
    read_only: bool,
}

impl<F: Platform> Storage<F> {
    /// Opens the namespace `name` and returns a handle bound to it. With
    /// [`OpenMode::ReadWrite`] the namespace is created on first use.
    pub fn open_handle(&mut self, name: &Key, mode: OpenMode) -> Result<Handle<'_, F>, Error> {
        let ns_index = self.create_or_open_namespace(name, mode == OpenMode::ReadWrite)?;
        Ok(Handle {
            storage: self,
            ns_index,
            read_only: mode == OpenMode::ReadOnly,
        })
    }
}

impl<'s, F: Platform> Handle<'s, F> {
    pub fn namespace_index(&self) -> u8 {
        self.ns_index
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.read_only {
            Err(Error::InvalidState)
        } else {
            Ok(())
        }
    }

    /// Stores raw bytes under `key` as `datatype`.
    pub fn set_raw(&mut self, datatype: ItemType, key: &Key, data: &[u8]) -> Result<(), Error> {
        self.check_writable()?;
        self.storage.write_item(self.ns_index, datatype, key, data)
    }

    /// Reads the value under `key` into `buf`, returning the byte count.
    pub fn get_raw(
        &mut self,
        datatype: ItemType,
        key: &Key,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        self.storage.read_item(self.ns_index, datatype, key, buf)
    }

    /// Size of a stored string or blob.
    pub fn get_data_size(&mut self, datatype: ItemType, key: &Key) -> Result<usize, Error> {
        self.storage.get_item_data_size(self.ns_index, datatype, key)
    }

    /// Removes the value under `key`, whatever its type.
    pub fn erase(&mut self, key: &Key) -> Result<(), Error> {
        self.check_writable()?;
        self.storage.erase_item(self.ns_index, None, key)
    }

    /// Removes every value in this namespace.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        self.check_writable()?;
        self.storage.erase_namespace(self.ns_index)
    }
}
