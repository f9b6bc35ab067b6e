//! Bookkeeping for a single flash sector.
//!
//! A page appends items into a fixed array of 32 byte entries and tracks
//! their lifecycle in a two-bit-per-entry bitmap. The commit point of every
//! write is the bitmap transition to `Written`, programmed strictly after
//! the descriptor, payload and CRCs are on flash: an interruption before
//! that point leaves entry bytes under an `Empty` state, which the next
//! mount either recovers (CRCs intact) or tombstones.

use crate::Key;
use crate::error::Error;
use crate::partition::{Partition, sector_offset};
use crate::platform::Platform;
use crate::raw::{
    CHUNK_ANY, ENTRY_ARRAY_OFFSET, ENTRY_BITMAP_OFFSET, ENTRY_BITMAP_SIZE, ENTRY_COUNT, ENTRY_SIZE,
    EntryState, Item, ItemData, ItemType, PAGE_HEADER_SIZE, PageHeader, PageState, SECTOR_SIZE,
    VarLengthData, VerOffset,
};
use core::cmp::Ordering;
use core::ops::Range;

#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) struct Page {
    sector: u16,
    state: PageState,
    sequence: u32,
    bitmap: [u8; ENTRY_BITMAP_SIZE],
    used_entries: usize,
    erased_entries: usize,
    next_free: usize,
}

/// Span of an item clamped to the remainder of the page, so that a corrupt
/// span byte can never push a scan out of bounds.
fn span_at(item: &Item, index: usize) -> usize {
    (item.span.max(1) as usize).min(ENTRY_COUNT - index)
}

fn entry_offset(sector: u16, index: usize) -> u32 {
    sector_offset(sector) + (ENTRY_ARRAY_OFFSET + index * ENTRY_SIZE) as u32
}

impl Page {
    pub(crate) fn uninitialized(sector: u16) -> Self {
        Self {
            sector,
            state: PageState::Uninitialized,
            sequence: 0,
            bitmap: [0xFF; ENTRY_BITMAP_SIZE],
            used_entries: 0,
            erased_entries: 0,
            next_free: 0,
        }
    }

    pub(crate) fn sector(&self) -> u16 {
        self.sector
    }

    pub(crate) fn state(&self) -> PageState {
        self.state
    }

    pub(crate) fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn used_entries(&self) -> usize {
        self.used_entries
    }

    pub(crate) fn erased_entries(&self) -> usize {
        self.erased_entries
    }

    pub(crate) fn free_entries(&self) -> usize {
        ENTRY_COUNT - self.next_free
    }

    /// Payload bytes a new variable-length item could carry, not counting
    /// the descriptor entry it would also need.
    pub(crate) fn var_data_tailroom(&self) -> usize {
        if self.state != PageState::Active {
            return 0;
        }
        match self.free_entries() {
            0 => 0,
            free => (free - 1) * ENTRY_SIZE,
        }
    }

    pub(crate) fn initialize<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
        sequence: u32,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("page initialize: sector {} seq {}", self.sector, sequence);

        let mut header = PageHeader {
            state: PageState::Active as u32,
            sequence,
            version: 0xFE,
            _reserved: [0xFF; 19],
            crc: 0,
        };
        header.crc = header.calculate_crc32(F::crc32);

        part.write(sector_offset(self.sector), &header.to_bytes())?;

        self.state = PageState::Active;
        self.sequence = sequence;
        self.bitmap = [0xFF; ENTRY_BITMAP_SIZE];
        self.used_entries = 0;
        self.erased_entries = 0;
        self.next_free = 0;

        Ok(())
    }

    fn set_state<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
        state: PageState,
    ) -> Result<(), Error> {
        part.write(
            sector_offset(self.sector),
            &(state as u32).to_le_bytes(),
        )?;
        self.state = state;
        Ok(())
    }

    pub(crate) fn mark_full<F: Platform>(&mut self, part: &mut Partition<F>) -> Result<(), Error> {
        match self.state {
            PageState::Full => Ok(()),
            PageState::Active => {
                #[cfg(feature = "defmt")]
                trace!("page mark_full: sector {}", self.sector);
                self.set_state(part, PageState::Full)
            }
            _ => Err(Error::InvalidState),
        }
    }

    pub(crate) fn mark_freeing<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
    ) -> Result<(), Error> {
        match self.state {
            PageState::Freeing => Ok(()),
            PageState::Full => {
                #[cfg(feature = "defmt")]
                trace!("page mark_freeing: sector {}", self.sector);
                self.set_state(part, PageState::Freeing)
            }
            _ => Err(Error::InvalidState),
        }
    }

    pub(crate) fn entry_state(&self, index: usize) -> EntryState {
        let byte = self.bitmap[index / 4];
        let bits = (byte >> ((index % 4) * 2)) & 0b11;
        // All four two-bit patterns are covered by the enum.
        EntryState::from_repr(bits).unwrap()
    }

    fn set_entry_state_range<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
        indices: Range<usize>,
        state: EntryState,
    ) -> Result<(), Error> {
        let raw_state = state as u8;
        for index in indices.clone() {
            let mask = 0b11u8 << ((index % 4) * 2);
            let bits = raw_state << ((index % 4) * 2);
            self.bitmap[index / 4] &= bits | !mask;
        }

        let start_byte = indices.start / 4;
        let end_byte = (indices.end - 1) / 4;

        // The program window is widened to the driver's word size; writing
        // back our bitmap copy only ever clears additional bits.
        let aligned_start = start_byte / F::WRITE_SIZE * F::WRITE_SIZE;
        let aligned_end = ((end_byte + 1).div_ceil(F::WRITE_SIZE) * F::WRITE_SIZE)
            .min(ENTRY_BITMAP_SIZE);

        part.write(
            sector_offset(self.sector)
                + (ENTRY_BITMAP_OFFSET + aligned_start) as u32,
            &self.bitmap[aligned_start..aligned_end],
        )
    }

    pub(crate) fn read_entry<F: Platform>(
        &self,
        part: &mut Partition<F>,
        index: usize,
    ) -> Result<Item, Error> {
        let mut buf = [0u8; ENTRY_SIZE];
        part.read(entry_offset(self.sector, index), &mut buf)?;
        Ok(Item::from_bytes(buf))
    }

    /// Linear scan from `*start` for the first written item matching every
    /// given filter; `None` matches anything. On a hit `*start` stays at
    /// the hit so the caller can resume past it by adding the span.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn find_item<F: Platform>(
        &self,
        part: &mut Partition<F>,
        ns: Option<u8>,
        datatype: Option<ItemType>,
        key: Option<&Key>,
        start: &mut usize,
        chunk_idx: Option<u8>,
        chunk_start: Option<VerOffset>,
    ) -> Result<(usize, Item), Error> {
        match self.state {
            PageState::Active | PageState::Full | PageState::Freeing => {}
            _ => return Err(Error::NotFound),
        }

        let mut index = *start;
        while index < self.next_free {
            if self.entry_state(index) != EntryState::Written {
                index += 1;
                continue;
            }

            let item = self.read_entry(part, index)?;
            let span = span_at(&item, index);

            if item.crc != item.calculate_crc32(F::crc32) {
                index += 1;
                continue;
            }

            if self.matches(&item, ns, datatype, key, chunk_idx, chunk_start) {
                *start = index;
                return Ok((index, item));
            }

            index += span;
        }

        Err(Error::NotFound)
    }

    #[allow(clippy::too_many_arguments)]
    fn matches(
        &self,
        item: &Item,
        ns: Option<u8>,
        datatype: Option<ItemType>,
        key: Option<&Key>,
        chunk_idx: Option<u8>,
        chunk_start: Option<VerOffset>,
    ) -> bool {
        if ns.is_some_and(|ns| item.ns != ns) {
            return false;
        }
        if datatype.is_some_and(|t| item.datatype != t as u8) {
            return false;
        }
        if key.is_some_and(|k| item.key != *k) {
            return false;
        }
        if chunk_idx.is_some_and(|ci| item.chunk_index != ci) {
            return false;
        }
        if let Some(version) = chunk_start {
            // A version filter selects one generation of a blob index.
            if item.item_type() != Some(ItemType::BlobIdx) {
                return false;
            }
            let stored = unsafe { item.data.blob_index.chunk_start };
            if stored != version as u8 {
                return false;
            }
        }
        true
    }

    /// Appends an item. Fixed-width payloads live inline in the descriptor
    /// entry, variable-length payloads span the following entries. Returns
    /// the entry index of the descriptor.
    pub(crate) fn write_item<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
        ns: u8,
        datatype: ItemType,
        key: &Key,
        data: &[u8],
        chunk_idx: Option<u8>,
    ) -> Result<usize, Error> {
        match self.state {
            PageState::Active => {}
            PageState::Full => return Err(Error::PageFull),
            _ => return Err(Error::InvalidState),
        }

        #[cfg(feature = "defmt")]
        trace!(
            "page write_item: sector {} ns {} entry {}",
            self.sector, ns, self.next_free
        );

        let chunk_index = chunk_idx.unwrap_or(CHUNK_ANY);

        let (span, item_data) = match datatype.fixed_width() {
            Some(width) => {
                if data.len() != width {
                    return Err(Error::InvalidLength);
                }
                let mut raw = [0xFF; 8];
                raw[..width].copy_from_slice(data);
                (1, ItemData { raw })
            }
            None => {
                if datatype == ItemType::Any {
                    return Err(Error::InvalidArg);
                }
                let span = 1 + data.len().div_ceil(ENTRY_SIZE);
                if span > ENTRY_COUNT {
                    return Err(Error::ValueTooLong);
                }
                let data_crc = F::crc32(u32::MAX, data);
                let var_len = VarLengthData::new(data.len() as u16, data_crc);
                (span, ItemData { var_len })
            }
        };

        if span > self.free_entries() {
            return Err(Error::PageFull);
        }

        let mut item = Item {
            ns,
            datatype: datatype as u8,
            span: span as u8,
            chunk_index,
            crc: 0,
            key: *key,
            data: item_data,
        };
        item.crc = item.calculate_crc32(F::crc32);

        let index = self.next_free;
        part.write(entry_offset(self.sector, index), &item.to_bytes())?;
        if span > 1 {
            part.write(entry_offset(self.sector, index + 1), data)?;
        }
        self.set_entry_state_range(part, index..index + span, EntryState::Written)?;

        self.used_entries += span;
        self.next_free += span;

        Ok(index)
    }

    /// Copies a variable-length payload into `out`, verifying the payload
    /// CRC. A corrupt payload is tombstoned and reported as absent.
    pub(crate) fn read_var_payload<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
        index: usize,
        item: &Item,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let size = unsafe { item.data.var_len.size } as usize;
        if out.len() < size {
            return Err(Error::InvalidLength);
        }

        let mut offset = 0;
        while offset < size {
            let mut entry = [0u8; ENTRY_SIZE];
            part.read(
                entry_offset(self.sector, index + 1 + offset / ENTRY_SIZE),
                &mut entry,
            )?;
            let n = (size - offset).min(ENTRY_SIZE);
            out[offset..offset + n].copy_from_slice(&entry[..n]);
            offset += n;
        }

        if F::crc32(u32::MAX, &out[..size]) != unsafe { item.data.var_len.data_crc } {
            #[cfg(feature = "defmt")]
            trace!(
                "page read_var_payload: payload CRC mismatch, tombstoning sector {} entry {}",
                self.sector, index
            );
            self.erase_span(part, index, span_at(item, index))?;
            return Err(Error::NotFound);
        }

        Ok(size)
    }

    /// Byte-compares the stored payload against `data` without copying it
    /// out.
    pub(crate) fn cmp_item<F: Platform>(
        &self,
        part: &mut Partition<F>,
        index: usize,
        item: &Item,
        data: &[u8],
    ) -> Result<(), Error> {
        match item.item_type().and_then(|t| t.fixed_width()) {
            Some(width) => {
                if data.len() != width || unsafe { &item.data.raw[..width] } != data {
                    return Err(Error::ContentDiffers);
                }
            }
            None => {
                let size = unsafe { item.data.var_len.size } as usize;
                if data.len() != size {
                    return Err(Error::ContentDiffers);
                }
                if F::crc32(u32::MAX, data) != unsafe { item.data.var_len.data_crc } {
                    return Err(Error::ContentDiffers);
                }
                let mut offset = 0;
                while offset < size {
                    let mut entry = [0u8; ENTRY_SIZE];
                    part.read(
                        entry_offset(self.sector, index + 1 + offset / ENTRY_SIZE),
                        &mut entry,
                    )?;
                    let n = (size - offset).min(ENTRY_SIZE);
                    if entry[..n] != data[offset..offset + n] {
                        return Err(Error::ContentDiffers);
                    }
                    offset += n;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn erase_span<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
        index: usize,
        span: usize,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!(
            "page erase_span: sector {} entries {}..{}",
            self.sector,
            index,
            index + span
        );

        self.set_entry_state_range(part, index..index + span, EntryState::Erased)?;
        self.erased_entries += span;
        self.used_entries = self.used_entries.saturating_sub(span);
        Ok(())
    }

    /// Finds and tombstones the first item matching the filters.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn erase_item<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
        ns: Option<u8>,
        datatype: Option<ItemType>,
        key: Option<&Key>,
        chunk_idx: Option<u8>,
        chunk_start: Option<VerOffset>,
    ) -> Result<(), Error> {
        let mut start = 0;
        let (index, item) =
            self.find_item(part, ns, datatype, key, &mut start, chunk_idx, chunk_start)?;
        self.erase_span(part, index, span_at(&item, index))
    }

    pub(crate) fn entry_statistics(&self) -> EntryStatistics {
        let mut stats = EntryStatistics::default();
        for index in 0..ENTRY_COUNT {
            match self.entry_state(index) {
                EntryState::Empty => stats.empty += 1,
                EntryState::Written => stats.written += 1,
                EntryState::Erased => stats.erased += 1,
                EntryState::Illegal => stats.illegal += 1,
            }
        }
        stats
    }

    /// Reconstructs the page from its sector, recovering or tombstoning
    /// entries whose write was interrupted.
    pub(crate) fn load<F: Platform>(
        part: &mut Partition<F>,
        sector: u16,
    ) -> Result<Page, Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        part.read(sector_offset(sector), &mut buf)?;

        if buf[..PAGE_HEADER_SIZE].iter().all(|&b| b == 0xFF) {
            let mut page = Page::uninitialized(sector);
            if buf.iter().any(|&b| b != 0xFF) {
                page.state = PageState::Corrupt;
            }
            return Ok(page);
        }

        let mut header_bytes = [0u8; PAGE_HEADER_SIZE];
        header_bytes.copy_from_slice(&buf[..PAGE_HEADER_SIZE]);
        let header = PageHeader::from_bytes(header_bytes);

        let mut page = Page::uninitialized(sector);
        page.sequence = header.sequence;
        page.state = PageState::from(header.state);
        page.bitmap
            .copy_from_slice(&buf[ENTRY_BITMAP_OFFSET..ENTRY_ARRAY_OFFSET]);

        match page.state {
            PageState::Active | PageState::Full | PageState::Freeing => {}
            // A header that is present but does not parse as a live state
            // makes the sector reclaimable only by erasing it.
            _ => {
                page.state = PageState::Corrupt;
                return Ok(page);
            }
        }

        if header.crc != header.calculate_crc32(F::crc32) {
            page.state = PageState::Corrupt;
            return Ok(page);
        }

        let mut index = 0;
        let mut high_water = 0;
        while index < ENTRY_COUNT {
            let mut entry = [0u8; ENTRY_SIZE];
            let off = ENTRY_ARRAY_OFFSET + index * ENTRY_SIZE;
            entry.copy_from_slice(&buf[off..off + ENTRY_SIZE]);
            let item = Item::from_bytes(entry);

            match page.entry_state(index) {
                EntryState::Erased | EntryState::Illegal => {
                    page.erased_entries += 1;
                    high_water = index + 1;
                    index += 1;
                }
                EntryState::Written => {
                    if item.crc != item.calculate_crc32(F::crc32) {
                        #[cfg(feature = "defmt")]
                        trace!(
                            "page load: item CRC mismatch, tombstoning sector {} entry {}",
                            sector, index
                        );
                        page.set_entry_state_range(part, index..index + 1, EntryState::Erased)?;
                        page.erased_entries += 1;
                        high_water = index + 1;
                        index += 1;
                    } else {
                        let span = span_at(&item, index);
                        page.used_entries += span;
                        high_water = index + span;
                        index += span;
                    }
                }
                EntryState::Empty => {
                    if item.is_blank() {
                        index += 1;
                        continue;
                    }
                    // Bytes under an uncommitted entry: a write was cut
                    // short. Recover the item if every CRC holds,
                    // tombstone it otherwise.
                    let span = span_at(&item, index);
                    if page.recoverable::<F>(&buf, index, &item) {
                        page.set_entry_state_range(part, index..index + span, EntryState::Written)?;
                        page.used_entries += span;
                    } else {
                        let span = if item.crc == item.calculate_crc32(F::crc32) {
                            span
                        } else {
                            1
                        };
                        page.set_entry_state_range(part, index..index + span, EntryState::Erased)?;
                        page.erased_entries += span;
                        high_water = index + span;
                        index += span;
                        continue;
                    }
                    high_water = index + span;
                    index += span;
                }
            }
        }

        page.next_free = high_water;
        Ok(page)
    }

    fn recoverable<F: Platform>(&self, buf: &[u8; SECTOR_SIZE], index: usize, item: &Item) -> bool {
        if item.crc != item.calculate_crc32(F::crc32) {
            return false;
        }
        let Some(datatype) = item.item_type() else {
            return false;
        };
        if datatype == ItemType::Any {
            return false;
        }
        if datatype.fixed_width().is_some() {
            return true;
        }

        let size = unsafe { item.data.var_len.size } as usize;
        let span = span_at(item, index);
        if size > (span.saturating_sub(1)) * ENTRY_SIZE || span != 1 + size.div_ceil(ENTRY_SIZE) {
            return false;
        }

        let payload_off = ENTRY_ARRAY_OFFSET + (index + 1) * ENTRY_SIZE;
        let payload = &buf[payload_off..payload_off + size];
        F::crc32(u32::MAX, payload) == unsafe { item.data.var_len.data_crc }
    }
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        self.sector == other.sector
    }
}

impl Eq for Page {}

impl PartialOrd for Page {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordering for the free-page heap: already-erased sectors are preferred,
/// then lower sector numbers.
impl Ord for Page {
    fn cmp(&self, other: &Self) -> Ordering {
        let uninit = self.state == PageState::Uninitialized;
        let other_uninit = other.state == PageState::Uninitialized;
        match (uninit, other_uninit) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => other.sector.cmp(&self.sector),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryStatistics {
    pub empty: u32,
    pub written: u32,
    pub erased: u32,
    pub illegal: u32,
}
