//! Ordered collection of pages covering the partition.
//!
//! Pages are kept in activation order with the active page last. One free
//! page is always held in reserve so that garbage collection has a target
//! to move live items into.

use crate::error::Error;
use crate::page::Page;
use crate::partition::Partition;
use crate::platform::Platform;
use crate::Key;
use crate::raw::{CHUNK_ANY, ENTRY_COUNT, PageState};
use alloc::collections::{BTreeMap, BinaryHeap};
use alloc::vec;
use alloc::vec::Vec;

#[cfg(feature = "defmt")]
use defmt::{trace, warn};

pub(crate) struct PageManager {
    pub(crate) pages: Vec<Page>,
    pub(crate) free_pages: BinaryHeap<Page>,
    high_sequence: u32,
}

impl PageManager {
    pub(crate) fn new() -> Self {
        Self {
            pages: Vec::new(),
            free_pages: BinaryHeap::new(),
            high_sequence: 0,
        }
    }

    /// The page currently receiving writes.
    pub(crate) fn current_mut(&mut self) -> Result<&mut Page, Error> {
        self.pages.last_mut().ok_or(Error::InvalidState)
    }

    fn next_sequence(&mut self) -> u32 {
        self.high_sequence += 1;
        self.high_sequence
    }

    /// Scans all sectors and reconstructs the page set: orders used pages
    /// by their sequence number, demotes stale active pages left behind by
    /// an interrupted page swap, completes an interrupted relocation,
    /// guarantees an active page, and erases the older copy of any
    /// duplicated item.
    pub(crate) fn load<F: Platform>(&mut self, part: &mut Partition<F>) -> Result<(), Error> {
        self.pages.clear();
        self.free_pages.clear();
        self.high_sequence = 0;

        let sectors = part.sector_count();
        if sectors < 2 {
            return Err(Error::NoFreePages);
        }

        for sector in 0..sectors {
            let page = Page::load(part, sector)?;
            match page.state() {
                PageState::Active | PageState::Full | PageState::Freeing => self.pages.push(page),
                _ => self.free_pages.push(page),
            }
        }

        self.pages.sort_by_key(Page::sequence);
        self.high_sequence = self.pages.iter().map(Page::sequence).max().unwrap_or(0);

        let newest_active = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state() == PageState::Active)
            .max_by_key(|(_, p)| p.sequence())
            .map(|(pos, _)| pos);

        if let Some(keep) = newest_active {
            for pos in 0..self.pages.len() {
                if pos != keep && self.pages[pos].state() == PageState::Active {
                    #[cfg(feature = "defmt")]
                    warn!(
                        "duplicate active page, demoting sector {}",
                        self.pages[pos].sector()
                    );
                    self.pages[pos].mark_full(part)?;
                }
            }
            let page = self.pages.remove(keep);
            self.pages.push(page);
        }

        self.continue_freeing(part)?;

        if !self.pages.iter().any(|p| p.state() == PageState::Active) {
            self.activate_free_page(part)?;
        }

        self.cleanup_duplicates(part)?;

        Ok(())
    }

    /// Called once the current page is full. Activates the spare free page
    /// when one exists beyond the reserve, otherwise reclaims the page with
    /// the most tombstones.
    pub(crate) fn request_new_page<F: Platform>(
        &mut self,
        part: &mut Partition<F>,
    ) -> Result<(), Error> {
        if self.free_pages.len() > 1 {
            self.activate_free_page(part)
        } else {
            self.garbage_collect(part)
        }
    }

    fn activate_free_page<F: Platform>(&mut self, part: &mut Partition<F>) -> Result<(), Error> {
        let mut page = self.free_pages.pop().ok_or(Error::NotEnoughSpace)?;
        if page.state() != PageState::Uninitialized {
            part.erase_sector(page.sector())?;
            page = Page::uninitialized(page.sector());
        }
        let sequence = self.next_sequence();
        page.initialize(part, sequence)?;
        self.pages.push(page);
        Ok(())
    }

    fn garbage_collect<F: Platform>(&mut self, part: &mut Partition<F>) -> Result<(), Error> {
        // Without a target page there is nothing to move live items into.
        if self.free_pages.is_empty() {
            return Err(Error::NotEnoughSpace);
        }

        // Weigh tombstone count against page age so that old, lightly
        // erased pages are eventually recycled too.
        let next_sequence = self.high_sequence + 1;
        let victim = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state() == PageState::Full && p.erased_entries() > 0)
            .max_by_key(|(_, p)| {
                p.erased_entries() * 10 + (next_sequence - p.sequence()) as usize
            })
            .map(|(pos, _)| pos)
            .ok_or(Error::NotEnoughSpace)?;

        #[cfg(feature = "defmt")]
        trace!(
            "garbage collect: reclaiming sector {}",
            self.pages[victim].sector()
        );

        self.pages[victim].mark_freeing(part)?;
        self.activate_free_page(part)?;

        let target = self.pages.len() - 1;
        Self::copy_items(&mut self.pages, part, victim, target)?;

        let sector = self.pages[victim].sector();
        part.erase_sector(sector)?;
        self.pages.remove(victim);
        self.free_pages.push(Page::uninitialized(sector));

        Ok(())
    }

    /// Finishes a relocation that was interrupted by power loss: items of
    /// the freeing page that did not make it into the target yet are copied
    /// now, then the source is erased.
    fn continue_freeing<F: Platform>(&mut self, part: &mut Partition<F>) -> Result<(), Error> {
        let Some(source) = self
            .pages
            .iter()
            .position(|p| p.state() == PageState::Freeing)
        else {
            return Ok(());
        };

        #[cfg(feature = "defmt")]
        trace!(
            "resuming interrupted relocation of sector {}",
            self.pages[source].sector()
        );

        if !self.pages.iter().any(|p| p.state() == PageState::Active) {
            self.activate_free_page(part)?;
        }
        let target = self
            .pages
            .iter()
            .position(|p| p.state() == PageState::Active)
            .ok_or(Error::InvalidState)?;

        Self::copy_items(&mut self.pages, part, source, target)?;

        let sector = self.pages[source].sector();
        part.erase_sector(sector)?;
        self.pages.remove(source);
        self.free_pages.push(Page::uninitialized(sector));

        Ok(())
    }

    /// Moves every live item of `source` into `target`, skipping items the
    /// target already holds so an interrupted copy can be resumed.
    fn copy_items<F: Platform>(
        pages: &mut [Page],
        part: &mut Partition<F>,
        source: usize,
        target: usize,
    ) -> Result<(), Error> {
        let (src, dst) = if source < target {
            let (left, right) = pages.split_at_mut(target);
            (&mut left[source], &mut right[0])
        } else {
            let (left, right) = pages.split_at_mut(source);
            (&mut right[0], &mut left[target])
        };

        let mut index = 0;
        while index < ENTRY_COUNT {
            let mut start = index;
            let (found, item) =
                match src.find_item(part, None, None, None, &mut start, None, None) {
                    Ok((found, item)) => (found, item),
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                };
            let span = (item.span.max(1) as usize).min(ENTRY_COUNT - found);
            index = found + span;

            let Some(datatype) = item.item_type() else {
                continue;
            };
            let chunk_idx = (item.chunk_index != CHUNK_ANY).then_some(item.chunk_index);

            let mut already = 0;
            if dst
                .find_item(
                    part,
                    Some(item.ns),
                    Some(datatype),
                    Some(&item.key),
                    &mut already,
                    Some(item.chunk_index),
                    None,
                )
                .is_ok()
            {
                continue;
            }

            let result = match datatype.fixed_width() {
                Some(width) => {
                    let inline = unsafe { item.data.raw };
                    dst.write_item(part, item.ns, datatype, &item.key, &inline[..width], chunk_idx)
                }
                None => {
                    let size = unsafe { item.data.var_len.size } as usize;
                    let mut data = vec![0u8; size];
                    match src.read_var_payload(part, found, &item, &mut data) {
                        Ok(_) => {}
                        // A corrupt payload was tombstoned; nothing to move.
                        Err(Error::NotFound) => continue,
                        Err(e) => return Err(e),
                    }
                    dst.write_item(part, item.ns, datatype, &item.key, &data, chunk_idx)
                }
            };

            match result {
                Ok(_) => {}
                Err(Error::PageFull) => return Err(Error::NotEnoughSpace),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Keeps the youngest copy of every `(ns, datatype, key, chunk_index)`
    /// tuple and tombstones the rest. Duplicates appear when power was cut
    /// between writing an updated item and erasing its predecessor.
    fn cleanup_duplicates<F: Platform>(&mut self, part: &mut Partition<F>) -> Result<(), Error> {
        type ItemId = (u8, u8, Key, u8);
        let mut seen: BTreeMap<ItemId, (usize, usize, usize)> = BTreeMap::new();
        let mut stale: Vec<(usize, usize, usize)> = Vec::new();

        for pos in 0..self.pages.len() {
            let mut start = 0;
            loop {
                let page = &self.pages[pos];
                let (index, item) =
                    match page.find_item(part, None, None, None, &mut start, None, None) {
                        Ok(hit) => hit,
                        Err(Error::NotFound) => break,
                        Err(e) => return Err(e),
                    };
                let span = (item.span.max(1) as usize).min(ENTRY_COUNT - index);
                start = index + span;

                let id: ItemId = (item.ns, item.datatype, item.key, item.chunk_index);
                if let Some(older) = seen.insert(id, (pos, index, span)) {
                    #[cfg(feature = "defmt")]
                    trace!(
                        "duplicate item, erasing older copy on sector {}",
                        self.pages[older.0].sector()
                    );
                    stale.push(older);
                }
            }
        }

        for (pos, index, span) in stale {
            self.pages[pos].erase_span(part, index, span)?;
        }

        Ok(())
    }

    /// Aggregate entry usage: `(used, free, total)`.
    pub(crate) fn entry_totals(&self) -> (usize, usize, usize) {
        let total = (self.pages.len() + self.free_pages.len()) * ENTRY_COUNT;
        let used = self.pages.iter().map(Page::used_entries).sum();
        let free = self.pages.iter().map(Page::free_entries).sum::<usize>()
            + self.free_pages.len() * ENTRY_COUNT;
        (used, free, total)
    }
}
