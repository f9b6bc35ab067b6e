//! Namespace table, item placement, the multi-page blob protocol and
//! mount-time reconciliation.

use crate::Key;
use crate::error::Error;
use crate::page::EntryStatistics;
use crate::page_manager::PageManager;
use crate::partition::Partition;
use crate::platform::Platform;
use crate::raw::{
    BlobIndexData, CHUNK_ANY, CHUNK_MAX_SIZE, ENTRY_COUNT, ENTRY_SIZE, Item, ItemType, NS_INDEX,
    PageState, VerOffset,
};
use alloc::vec::Vec;

#[cfg(feature = "defmt")]
use defmt::trace;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum StorageState {
    Invalid,
    Active,
}

struct NamespaceEntry {
    name: Key,
    index: u8,
}

/// 256-bit map of allocated namespace indices.
struct NamespaceUsage([u32; 8]);

impl NamespaceUsage {
    fn new() -> Self {
        Self([0; 8])
    }

    fn get(&self, index: u8) -> bool {
        self.0[index as usize / 32] & (1 << (index % 32)) != 0
    }

    fn set(&mut self, index: u8) {
        self.0[index as usize / 32] |= 1 << (index % 32);
    }
}

struct BlobIndexRecord {
    ns: u8,
    key: Key,
    chunk_start: u8,
    chunk_count: u8,
}

/// Location of an item found somewhere on the partition.
struct Located {
    pos: usize,
    sector: u16,
    index: usize,
    item: Item,
}

impl Located {
    fn span(&self) -> usize {
        (self.item.span.max(1) as usize).min(ENTRY_COUNT - self.index)
    }
}

/// Aggregate usage of the mounted partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub used_entries: usize,
    pub free_entries: usize,
    pub total_entries: usize,
    pub namespace_count: usize,
    pub pages: PageCounts,
    /// Per-page entry breakdown, ordered by sector.
    pub entries_per_page: Vec<EntryStatistics>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCounts {
    pub empty: u16,
    pub active: u16,
    pub full: u16,
    pub freeing: u16,
    pub corrupt: u16,
}

/// The storage core. Mount with [`init`](Storage::init), then read and
/// write through namespaces obtained from
/// [`create_or_open_namespace`](Storage::create_or_open_namespace) or a
/// [`Handle`](crate::Handle).
pub struct Storage<F: Platform> {
    pub(crate) partition: Partition<F>,
    pub(crate) pages: PageManager,
    pub(crate) namespaces: Vec<NamespaceEntry>,
    ns_usage: NamespaceUsage,
    state: StorageState,
    last_error: Option<Error>,
}

impl<F: Platform> Storage<F> {
    pub fn new(partition: Partition<F>) -> Self {
        Self {
            partition,
            pages: PageManager::new(),
            namespaces: Vec::new(),
            ns_usage: NamespaceUsage::new(),
            state: StorageState::Invalid,
            last_error: None,
        }
    }

    /// Mounts the partition: loads and reconciles all pages, rebuilds the
    /// namespace table and reclaims blob chunks whose index never made it
    /// to flash. Leaves the storage invalid on any failure.
    pub fn init(&mut self) -> Result<(), Error> {
        let result = self.mount();
        self.track(result)
    }

    pub fn is_valid(&self) -> bool {
        self.state == StorageState::Active
    }

    /// Outcome of the most recent public operation, `None` after success.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error.clone()
    }

    fn track<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.clone()),
        }
        result
    }

    fn ensure_active(&self) -> Result<(), Error> {
        match self.state {
            StorageState::Active => Ok(()),
            StorageState::Invalid => Err(Error::NotInitialized),
        }
    }

    fn mount(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("storage mount");

        self.state = StorageState::Invalid;
        self.pages.load(&mut self.partition)?;

        self.namespaces.clear();
        self.ns_usage = NamespaceUsage::new();
        for pos in 0..self.pages.pages.len() {
            let mut start = 0;
            loop {
                let page = &self.pages.pages[pos];
                let (index, item) = match page.find_item(
                    &mut self.partition,
                    Some(NS_INDEX),
                    Some(ItemType::U8),
                    None,
                    &mut start,
                    None,
                    None,
                ) {
                    Ok(hit) => hit,
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                };
                start = index + (item.span.max(1) as usize).min(ENTRY_COUNT - index);

                let ns_index = unsafe { item.data.raw[0] };
                self.ns_usage.set(ns_index);
                self.namespaces.push(NamespaceEntry {
                    name: item.key,
                    index: ns_index,
                });
            }
        }
        self.ns_usage.set(0);
        self.ns_usage.set(255);

        let blob_indices = self.collect_blob_indices()?;
        self.erase_orphan_chunks(&blob_indices)?;

        self.state = StorageState::Active;
        Ok(())
    }

    fn collect_blob_indices(&mut self) -> Result<Vec<BlobIndexRecord>, Error> {
        let mut records = Vec::new();
        for pos in 0..self.pages.pages.len() {
            let mut start = 0;
            loop {
                let page = &self.pages.pages[pos];
                let (index, item) = match page.find_item(
                    &mut self.partition,
                    None,
                    Some(ItemType::BlobIdx),
                    None,
                    &mut start,
                    None,
                    None,
                ) {
                    Ok(hit) => hit,
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                };
                start = index + 1;

                let blob_index = unsafe { item.data.blob_index };
                records.push(BlobIndexRecord {
                    ns: item.ns,
                    key: item.key,
                    chunk_start: blob_index.chunk_start,
                    chunk_count: blob_index.chunk_count,
                });
            }
        }
        Ok(records)
    }

    /// Tombstones every blob chunk that no index covers. Orphans appear
    /// when power was cut after chunks were written but before their index,
    /// or after an index was erased but before its chunks.
    fn erase_orphan_chunks(&mut self, indices: &[BlobIndexRecord]) -> Result<(), Error> {
        for pos in 0..self.pages.pages.len() {
            let mut start = 0;
            loop {
                let page = &self.pages.pages[pos];
                let (index, item) = match page.find_item(
                    &mut self.partition,
                    None,
                    Some(ItemType::BlobData),
                    None,
                    &mut start,
                    None,
                    None,
                ) {
                    Ok(hit) => hit,
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                };
                let span = (item.span.max(1) as usize).min(ENTRY_COUNT - index);
                start = index + span;

                let covered = indices.iter().any(|b| {
                    b.ns == item.ns
                        && b.key == item.key
                        && item.chunk_index >= b.chunk_start
                        && (item.chunk_index as u32) < b.chunk_start as u32 + b.chunk_count as u32
                });
                if !covered {
                    #[cfg(feature = "defmt")]
                    trace!(
                        "mount: erasing orphan blob chunk {} on sector {}",
                        item.chunk_index,
                        self.pages.pages[pos].sector()
                    );
                    self.pages.pages[pos].erase_span(&mut self.partition, index, span)?;
                }
            }
        }
        Ok(())
    }

    /// First match across all pages, oldest page first.
    fn locate(
        &mut self,
        ns: Option<u8>,
        datatype: Option<ItemType>,
        key: Option<&Key>,
        chunk_idx: Option<u8>,
        chunk_start: Option<VerOffset>,
    ) -> Result<Located, Error> {
        for pos in 0..self.pages.pages.len() {
            let mut start = 0;
            match self.pages.pages[pos].find_item(
                &mut self.partition,
                ns,
                datatype,
                key,
                &mut start,
                chunk_idx,
                chunk_start,
            ) {
                Ok((index, item)) => {
                    return Ok(Located {
                        pos,
                        sector: self.pages.pages[pos].sector(),
                        index,
                        item,
                    });
                }
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound)
    }

    /// Looks up a namespace by name, creating it when permitted. Returns
    /// its index.
    pub fn create_or_open_namespace(
        &mut self,
        name: &Key,
        can_create: bool,
    ) -> Result<u8, Error> {
        let result = self
            .ensure_active()
            .and_then(|()| self.open_namespace(name, can_create));
        self.track(result)
    }

    pub(crate) fn open_namespace(&mut self, name: &Key, can_create: bool) -> Result<u8, Error> {
        if let Some(entry) = self.namespaces.iter().find(|e| e.name == *name) {
            return Ok(entry.index);
        }
        if !can_create {
            return Err(Error::NotFound);
        }

        let index = (1u8..=254)
            .find(|&i| !self.ns_usage.get(i))
            .ok_or(Error::NotEnoughSpace)?;

        #[cfg(feature = "defmt")]
        trace!("creating namespace {}", index);

        self.write_single(NS_INDEX, ItemType::U8, name, &[index])?;
        self.ns_usage.set(index);
        self.namespaces.push(NamespaceEntry { name: *name, index });
        Ok(index)
    }

    /// Stores a value, replacing any previous one under the same key. A
    /// write of identical bytes is elided to save erase cycles.
    pub fn write_item(
        &mut self,
        ns: u8,
        datatype: ItemType,
        key: &Key,
        data: &[u8],
    ) -> Result<(), Error> {
        let result = self.write_item_inner(ns, datatype, key, data);
        self.track(result)
    }

    fn write_item_inner(
        &mut self,
        ns: u8,
        datatype: ItemType,
        key: &Key,
        data: &[u8],
    ) -> Result<(), Error> {
        self.ensure_active()?;
        match datatype {
            ItemType::BlobData | ItemType::BlobIdx | ItemType::Any => Err(Error::InvalidArg),
            ItemType::Blob => self.write_blob(ns, key, data),
            _ => self.write_single(ns, datatype, key, data),
        }
    }

    fn write_single(
        &mut self,
        ns: u8,
        datatype: ItemType,
        key: &Key,
        data: &[u8],
    ) -> Result<(), Error> {
        let previous = match self.locate(Some(ns), Some(datatype), Some(key), None, None) {
            Ok(loc) => Some(loc),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };

        if let Some(loc) = &previous {
            match self.pages.pages[loc.pos].cmp_item(
                &mut self.partition,
                loc.index,
                &loc.item,
                data,
            ) {
                Ok(()) => return Ok(()),
                Err(Error::ContentDiffers) => {}
                Err(e) => return Err(e),
            }
        }

        let had_previous = previous.is_some();
        let (sector, index) = self.append_item(ns, datatype, key, data, None)?;

        if had_previous {
            // The predecessor may have been relocated by garbage
            // collection in the meantime, so find it again. The oldest
            // match is the stale copy unless it is the entry just written.
            if let Ok(old) = self.locate(Some(ns), Some(datatype), Some(key), None, None)
                && (old.sector != sector || old.index != index)
            {
                let span = old.span();
                self.pages.pages[old.pos].erase_span(&mut self.partition, old.index, span)?;
            }
        }

        Ok(())
    }

    /// Appends to the current page, allocating a new one once on demand.
    fn append_item(
        &mut self,
        ns: u8,
        datatype: ItemType,
        key: &Key,
        data: &[u8],
        chunk_idx: Option<u8>,
    ) -> Result<(u16, usize), Error> {
        let attempt = self.pages.current_mut()?.write_item(
            &mut self.partition,
            ns,
            datatype,
            key,
            data,
            chunk_idx,
        );

        let index = match attempt {
            Ok(index) => index,
            Err(Error::PageFull) => {
                self.pages.current_mut()?.mark_full(&mut self.partition)?;
                self.pages.request_new_page(&mut self.partition)?;
                match self.pages.current_mut()?.write_item(
                    &mut self.partition,
                    ns,
                    datatype,
                    key,
                    data,
                    chunk_idx,
                ) {
                    Ok(index) => index,
                    Err(Error::PageFull) => return Err(Error::NotEnoughSpace),
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let sector = self.pages.current_mut()?.sector();
        Ok((sector, index))
    }

    fn write_blob(&mut self, ns: u8, key: &Key, data: &[u8]) -> Result<(), Error> {
        let previous = match self.locate(Some(ns), Some(ItemType::BlobIdx), Some(key), None, None)
        {
            Ok(loc) => Some(loc),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };

        let prev_start = previous
            .as_ref()
            .map(|loc| VerOffset::from(unsafe { loc.item.data.blob_index.chunk_start }));

        // Rewriting identical bytes would only burn erase cycles. The
        // comparison runs against the generation the existing index
        // selects, not whatever chunk set a wildcard lookup happens upon.
        if let Some(version) = prev_start {
            match self.cmp_multi_page_blob(ns, key, data, version) {
                Ok(()) => return Ok(()),
                Err(Error::ContentDiffers) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let next_start = prev_start.map_or(VerOffset::V0, VerOffset::toggle);

        match self.write_multi_page_blob(ns, key, data, next_start) {
            Ok(()) => {}
            Err(Error::PageFull) => return Err(Error::NotEnoughSpace),
            Err(e) => return Err(e),
        }

        if let Some(version) = prev_start {
            // The new generation is fully visible; dropping the old index
            // first makes its chunks orphans in a single transition.
            self.erase_multi_page_blob(ns, key, Some(version))?;
        } else if let Ok(old) = self.locate(Some(ns), Some(ItemType::Blob), Some(key), None, None)
        {
            // A value in the old single-page format is superseded.
            let span = old.span();
            self.pages.pages[old.pos].erase_span(&mut self.partition, old.index, span)?;
        }

        Ok(())
    }

    /// Writes the chunks of a blob under the given version, then the index
    /// entry that makes them visible. Either the index lands on flash and
    /// the blob is complete, or every chunk written here is erased again;
    /// an index of the other version is never touched.
    fn write_multi_page_blob(
        &mut self,
        ns: u8,
        key: &Key,
        data: &[u8],
        chunk_start: VerOffset,
    ) -> Result<(), Error> {
        let page_count = self.partition.sector_count() as usize;
        let max_pages = (page_count - 1).min((CHUNK_ANY as usize - 1) / 2);
        if data.len() > max_pages * CHUNK_MAX_SIZE {
            return Err(Error::ValueTooLong);
        }

        #[cfg(feature = "defmt")]
        trace!("write blob: ns {} size {}", ns, data.len());

        let start = chunk_start as u8;
        let mut chunk_count: u8 = 0;
        let mut offset = 0usize;

        let result = loop {
            let tailroom = match self.pages.current_mut() {
                Ok(page) => page.var_data_tailroom(),
                Err(e) => break Err(e),
            };

            if chunk_count == 0 && tailroom < data.len() && tailroom < CHUNK_MAX_SIZE / 10 {
                // The first chunk would be pointlessly small; prefer a
                // fresh page, unless that does not gain anything.
                if let Err(e) = self.advance_page() {
                    break Err(e);
                }
                let fresh = match self.pages.current_mut() {
                    Ok(page) => page.var_data_tailroom(),
                    Err(e) => break Err(e),
                };
                if fresh == tailroom {
                    break Err(Error::NotEnoughSpace);
                }
                continue;
            } else if tailroom == 0 {
                break Err(Error::NotEnoughSpace);
            }

            let chunk = (data.len() - offset).min(tailroom);
            debug_assert!(start as usize + chunk_count as usize + 1 <= CHUNK_ANY as usize);

            let write = match self.pages.current_mut() {
                Ok(page) => page.write_item(
                    &mut self.partition,
                    ns,
                    ItemType::BlobData,
                    key,
                    &data[offset..offset + chunk],
                    Some(start + chunk_count),
                ),
                Err(e) => Err(e),
            };
            if let Err(e) = write {
                break Err(e);
            }

            chunk_count += 1;
            offset += chunk;
            let remaining = data.len() - offset;

            if remaining != 0 || tailroom - chunk < ENTRY_SIZE {
                if let Err(e) = self.advance_page() {
                    break Err(e);
                }
            }

            if remaining == 0 {
                let index_data =
                    BlobIndexData::new(data.len() as u32, chunk_count, chunk_start);
                let write = match self.pages.current_mut() {
                    Ok(page) => page.write_item(
                        &mut self.partition,
                        ns,
                        ItemType::BlobIdx,
                        key,
                        &index_data.to_bytes(),
                        None,
                    ),
                    Err(e) => Err(e),
                };
                break write.map(|_| ());
            }
        };

        if let Err(e) = result {
            // Best-effort rollback of the chunks written so far. The
            // original error wins over anything that fails in here.
            for n in 0..chunk_count {
                if let Ok(chunk) = self.locate(
                    Some(ns),
                    Some(ItemType::BlobData),
                    Some(key),
                    Some(start + n),
                    None,
                ) {
                    let span = chunk.span();
                    let _ = self.pages.pages[chunk.pos].erase_span(
                        &mut self.partition,
                        chunk.index,
                        span,
                    );
                }
            }
            return Err(e);
        }

        Ok(())
    }

    fn advance_page(&mut self) -> Result<(), Error> {
        self.pages.current_mut()?.mark_full(&mut self.partition)?;
        self.pages.request_new_page(&mut self.partition)
    }

    /// Reads a value into `buf`, returning the number of bytes. Blobs fall
    /// back to the old single-page format when no index exists.
    pub fn read_item(
        &mut self,
        ns: u8,
        datatype: ItemType,
        key: &Key,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let result = self.read_item_inner(ns, datatype, key, buf);
        self.track(result)
    }

    fn read_item_inner(
        &mut self,
        ns: u8,
        datatype: ItemType,
        key: &Key,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        self.ensure_active()?;

        match datatype {
            ItemType::BlobData | ItemType::BlobIdx | ItemType::Any => {
                return Err(Error::InvalidArg);
            }
            ItemType::Blob => match self.read_multi_page_blob(ns, key, buf) {
                Ok(n) => return Ok(n),
                Err(Error::NotFound) => {} // try the old format below
                Err(e) => return Err(e),
            },
            _ => {}
        }

        let loc = self.locate(Some(ns), Some(datatype), Some(key), None, None)?;
        match datatype.fixed_width() {
            Some(width) => {
                if buf.len() < width {
                    return Err(Error::InvalidLength);
                }
                buf[..width].copy_from_slice(unsafe { &loc.item.data.raw[..width] });
                Ok(width)
            }
            None => self.pages.pages[loc.pos].read_var_payload(
                &mut self.partition,
                loc.index,
                &loc.item,
                buf,
            ),
        }
    }

    fn read_multi_page_blob(
        &mut self,
        ns: u8,
        key: &Key,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let loc = self.locate(Some(ns), Some(ItemType::BlobIdx), Some(key), None, None)?;
        let blob_index = unsafe { loc.item.data.blob_index };

        let size = blob_index.data_size as usize;
        if buf.len() < size {
            return Err(Error::InvalidLength);
        }

        // Clamp so a corrupt index cannot make the chunk ordinals wrap.
        let chunk_count = blob_index.chunk_count.min(CHUNK_ANY - blob_index.chunk_start);

        let mut offset = 0usize;
        for n in 0..chunk_count {
            let chunk = match self.locate(
                Some(ns),
                Some(ItemType::BlobData),
                Some(key),
                Some(blob_index.chunk_start + n),
                None,
            ) {
                Ok(chunk) => chunk,
                Err(Error::NotFound) => {
                    // A chunk is gone; drop the rest of the blob so the
                    // space is reusable instead of sitting half-readable.
                    let _ = self.erase_multi_page_blob(ns, key, None);
                    return Err(Error::NotFound);
                }
                Err(e) => return Err(e),
            };

            let chunk_size = unsafe { chunk.item.data.var_len.size } as usize;
            if offset + chunk_size > size {
                let _ = self.erase_multi_page_blob(ns, key, None);
                return Err(Error::NotFound);
            }

            match self.pages.pages[chunk.pos].read_var_payload(
                &mut self.partition,
                chunk.index,
                &chunk.item,
                &mut buf[offset..offset + chunk_size],
            ) {
                Ok(n) => offset += n,
                Err(Error::NotFound) => {
                    let _ = self.erase_multi_page_blob(ns, key, None);
                    return Err(Error::NotFound);
                }
                Err(e) => return Err(e),
            }
        }

        if offset != size {
            let _ = self.erase_multi_page_blob(ns, key, None);
            return Err(Error::NotFound);
        }

        Ok(size)
    }

    /// Compares a stored blob of the given generation against `data`.
    fn cmp_multi_page_blob(
        &mut self,
        ns: u8,
        key: &Key,
        data: &[u8],
        version: VerOffset,
    ) -> Result<(), Error> {
        let loc = self.locate(
            Some(ns),
            Some(ItemType::BlobIdx),
            Some(key),
            None,
            Some(version),
        )?;
        let blob_index = unsafe { loc.item.data.blob_index };

        if blob_index.data_size as usize != data.len() {
            return Err(Error::ContentDiffers);
        }

        let chunk_count = blob_index.chunk_count.min(CHUNK_ANY - blob_index.chunk_start);

        let mut offset = 0usize;
        for n in 0..chunk_count {
            let chunk = self.locate(
                Some(ns),
                Some(ItemType::BlobData),
                Some(key),
                Some(blob_index.chunk_start + n),
                None,
            )?;
            let chunk_size = unsafe { chunk.item.data.var_len.size } as usize;
            if offset + chunk_size > data.len() {
                return Err(Error::ContentDiffers);
            }
            self.pages.pages[chunk.pos].cmp_item(
                &mut self.partition,
                chunk.index,
                &chunk.item,
                &data[offset..offset + chunk_size],
            )?;
            offset += chunk_size;
        }

        if offset != data.len() {
            return Err(Error::ContentDiffers);
        }
        Ok(())
    }

    /// Size of the stored value for the variable-length types.
    pub fn get_item_data_size(
        &mut self,
        ns: u8,
        datatype: ItemType,
        key: &Key,
    ) -> Result<usize, Error> {
        let result = self.get_item_data_size_inner(ns, datatype, key);
        self.track(result)
    }

    fn get_item_data_size_inner(
        &mut self,
        ns: u8,
        datatype: ItemType,
        key: &Key,
    ) -> Result<usize, Error> {
        self.ensure_active()?;

        match datatype {
            ItemType::Str | ItemType::Blob => {}
            _ => return Err(Error::InvalidArg),
        }

        match self.locate(Some(ns), Some(datatype), Some(key), None, None) {
            Ok(loc) => return Ok(unsafe { loc.item.data.var_len.size } as usize),
            Err(Error::NotFound) if datatype == ItemType::Blob => {}
            Err(e) => return Err(e),
        }

        let loc = self.locate(Some(ns), Some(ItemType::BlobIdx), Some(key), None, None)?;
        Ok(unsafe { loc.item.data.blob_index.data_size } as usize)
    }

    /// Removes a value. With `datatype` unset the first item under the key
    /// decides; blob parts route to the full blob erase.
    pub fn erase_item(
        &mut self,
        ns: u8,
        datatype: Option<ItemType>,
        key: &Key,
    ) -> Result<(), Error> {
        let result = self.erase_item_inner(ns, datatype, key);
        self.track(result)
    }

    fn erase_item_inner(
        &mut self,
        ns: u8,
        datatype: Option<ItemType>,
        key: &Key,
    ) -> Result<(), Error> {
        self.ensure_active()?;

        if datatype == Some(ItemType::Blob) {
            return match self.erase_multi_page_blob(ns, key, None) {
                // No index; the value may exist in the old format.
                Err(Error::NotFound) => {
                    let old = self.locate(Some(ns), Some(ItemType::Blob), Some(key), None, None)?;
                    let span = old.span();
                    self.pages.pages[old.pos].erase_span(&mut self.partition, old.index, span)
                }
                other => other,
            };
        }

        let loc = self.locate(Some(ns), datatype, Some(key), None, None)?;
        match loc.item.item_type() {
            Some(ItemType::BlobData) | Some(ItemType::BlobIdx) => {
                self.erase_multi_page_blob(ns, key, None)
            }
            _ => {
                let span = loc.span();
                self.pages.pages[loc.pos].erase_span(&mut self.partition, loc.index, span)
            }
        }
    }

    /// Erases a blob: the index first, making the remaining chunks orphans
    /// in one atomic transition, then each chunk. Chunks already missing
    /// are skipped.
    fn erase_multi_page_blob(
        &mut self,
        ns: u8,
        key: &Key,
        chunk_start: Option<VerOffset>,
    ) -> Result<(), Error> {
        let loc = self.locate(Some(ns), Some(ItemType::BlobIdx), Some(key), None, chunk_start)?;
        let blob_index = unsafe { loc.item.data.blob_index };

        self.pages.pages[loc.pos].erase_span(&mut self.partition, loc.index, 1)?;

        let start = chunk_start.map_or(blob_index.chunk_start, |v| v as u8);
        let chunk_count = blob_index.chunk_count.min(CHUNK_ANY - start);
        for n in 0..chunk_count {
            match self.locate(
                Some(ns),
                Some(ItemType::BlobData),
                Some(key),
                Some(start + n),
                None,
            ) {
                Ok(chunk) => {
                    let span = chunk.span();
                    self.pages.pages[chunk.pos].erase_span(
                        &mut self.partition,
                        chunk.index,
                        span,
                    )?;
                }
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Erases every item carrying the namespace index. The index itself
    /// stays allocated.
    pub fn erase_namespace(&mut self, ns: u8) -> Result<(), Error> {
        let result = self.erase_namespace_inner(ns);
        self.track(result)
    }

    fn erase_namespace_inner(&mut self, ns: u8) -> Result<(), Error> {
        self.ensure_active()?;

        for pos in 0..self.pages.pages.len() {
            loop {
                match self.pages.pages[pos].erase_item(
                    &mut self.partition,
                    Some(ns),
                    None,
                    None,
                    None,
                    None,
                ) {
                    Ok(()) => continue,
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Sum of the entry spans occupied by a namespace.
    pub fn calc_entries_in_namespace(&mut self, ns: u8) -> Result<usize, Error> {
        let result = self.calc_entries_inner(ns);
        self.track(result)
    }

    fn calc_entries_inner(&mut self, ns: u8) -> Result<usize, Error> {
        self.ensure_active()?;

        let mut used = 0;
        for pos in 0..self.pages.pages.len() {
            let mut start = 0;
            loop {
                let page = &self.pages.pages[pos];
                match page.find_item(&mut self.partition, Some(ns), None, None, &mut start, None, None)
                {
                    Ok((index, item)) => {
                        let span = (item.span.max(1) as usize).min(ENTRY_COUNT - index);
                        used += span;
                        start = index + span;
                    }
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(used)
    }

    pub fn fill_stats(&mut self) -> Result<Stats, Error> {
        let result = self.fill_stats_inner();
        self.track(result)
    }

    fn fill_stats_inner(&mut self) -> Result<Stats, Error> {
        self.ensure_active()?;

        let (used_entries, free_entries, total_entries) = self.pages.entry_totals();

        let mut all_pages: Vec<_> = self
            .pages
            .pages
            .iter()
            .chain(self.pages.free_pages.iter())
            .collect();
        // sorted by sector for stable output
        all_pages.sort_by_key(|page| page.sector());

        let mut pages = PageCounts::default();
        let entries_per_page = all_pages
            .into_iter()
            .map(|page| {
                match page.state() {
                    PageState::Uninitialized => pages.empty += 1,
                    PageState::Active => pages.active += 1,
                    PageState::Full => pages.full += 1,
                    PageState::Freeing => pages.freeing += 1,
                    PageState::Corrupt | PageState::Invalid => pages.corrupt += 1,
                }

                if page.state() == PageState::Corrupt {
                    EntryStatistics {
                        illegal: ENTRY_COUNT as u32,
                        ..EntryStatistics::default()
                    }
                } else {
                    page.entry_statistics()
                }
            })
            .collect();

        Ok(Stats {
            used_entries,
            free_entries,
            total_entries,
            namespace_count: self.namespaces.len(),
            pages,
            entries_per_page,
        })
    }

    /// Iterates the user-visible items, optionally bound to one namespace
    /// and one datatype. Any mutation invalidates the iterator, which the
    /// exclusive borrow enforces.
    pub fn find_entry(
        &mut self,
        namespace: Option<&Key>,
        item_type: Option<ItemType>,
    ) -> Result<EntryIter<'_, F>, Error> {
        if let Err(e) = self.ensure_active() {
            self.last_error = Some(e.clone());
            return Err(e);
        }
        let ns_filter = match namespace {
            Some(name) => match self.open_namespace(name, false) {
                Ok(index) => Some(index),
                Err(e) => {
                    self.last_error = Some(e.clone());
                    return Err(e);
                }
            },
            None => None,
        };
        self.last_error = None;
        Ok(EntryIter {
            storage: self,
            page_pos: 0,
            entry_index: 0,
            ns_filter,
            type_filter: item_type,
        })
    }

    pub(crate) fn namespace_name(&self, index: u8) -> Option<Key> {
        self.namespaces
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.name)
    }
}

/// One user item yielded by [`EntryIter`]. A multi-page blob shows up once,
/// through its first chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ns_index: u8,
    pub namespace: Option<Key>,
    pub key: Key,
    pub item_type: ItemType,
    pub span: u8,
}

/// Ordered traversal of user items in page-activation order.
pub struct EntryIter<'s, F: Platform> {
    storage: &'s mut Storage<F>,
    page_pos: usize,
    entry_index: usize,
    ns_filter: Option<u8>,
    type_filter: Option<ItemType>,
}

fn iterable(item: &Item) -> bool {
    if item.ns == NS_INDEX {
        return false;
    }
    match item.item_type() {
        None | Some(ItemType::BlobIdx) | Some(ItemType::Blob) => false,
        Some(ItemType::BlobData) => {
            item.chunk_index == VerOffset::V0 as u8 || item.chunk_index == VerOffset::V1 as u8
        }
        Some(_) => true,
    }
}

impl<'s, F: Platform> EntryIter<'s, F> {
    /// Restarts the traversal from the oldest page.
    pub fn reset(&mut self) {
        self.page_pos = 0;
        self.entry_index = 0;
    }

    fn next_entry(&mut self) -> Result<Option<Entry>, Error> {
        while self.page_pos < self.storage.pages.pages.len() {
            let page = &self.storage.pages.pages[self.page_pos];
            match page.find_item(
                &mut self.storage.partition,
                self.ns_filter,
                self.type_filter,
                None,
                &mut self.entry_index,
                None,
                None,
            ) {
                Ok((index, item)) => {
                    let span = (item.span.max(1) as usize).min(ENTRY_COUNT - index);
                    self.entry_index = index + span;
                    if !iterable(&item) {
                        continue;
                    }
                    let namespace = self.storage.namespace_name(item.ns);
                    return Ok(Some(Entry {
                        ns_index: item.ns,
                        namespace,
                        key: item.key,
                        item_type: item.item_type().unwrap_or(ItemType::Any),
                        span: item.span,
                    }));
                }
                Err(Error::NotFound) => {
                    self.page_pos += 1;
                    self.entry_index = 0;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl<'s, F: Platform> Iterator for EntryIter<'s, F> {
    type Item = Result<Entry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
