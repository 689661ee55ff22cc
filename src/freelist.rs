//! Free-page accounting.
//!
//! Pages released by a committed transaction are not immediately reusable:
//! an older read snapshot may still descend into them. Freed pages are
//! therefore parked in a pending map keyed by the freeing transaction id and
//! only migrate into the allocatable cache once every open reader began at a
//! later transaction. The allocatable cache itself is a coalescing extent
//! set with a largest-first heap so contiguous runs can be handed out
//! without scanning.
//!
//! On disk the free list is a chain of `FreeList` pages, each holding a next
//! pointer and a run of extents. The chain is rewritten wholesale on every
//! commit and its old pages are freed like any others.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, BTreeMap};

use tracing::trace;

use crate::error::{Result, SiloError};
use crate::meta::Meta;
use crate::page::{self, PageHeader, PageId, PageKind, TxId, PAGE_HDR_LEN};

/// A contiguous run of free pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Extent {
    pub start: PageId,
    pub len: u32,
}

impl Extent {
    pub fn new(start: PageId, len: u32) -> Self {
        Self { start, len }
    }

    /// Absorbs `other` when it starts exactly where `self` ends.
    pub fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.start.0 + self.len as u64 == other.start.0 {
            self.len += other.len;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct HeapExtent {
    start: PageId,
    len: u32,
}

impl Ord for HeapExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.len
            .cmp(&other.len)
            .then_with(|| other.start.0.cmp(&self.start.0))
    }
}

impl PartialOrd for HeapExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Extent> for HeapExtent {
    fn from(extent: Extent) -> Self {
        HeapExtent {
            start: extent.start,
            len: extent.len,
        }
    }
}

/// Allocatable free pages: sorted coalesced extents plus a largest-first heap.
#[derive(Clone, Default, Debug)]
pub(crate) struct FreeCache {
    extents: Vec<Extent>,
    heap: BinaryHeap<HeapExtent>,
}

impl FreeCache {
    pub fn from_extents(extents: Vec<Extent>) -> Self {
        let mut cache = Self {
            extents,
            heap: BinaryHeap::new(),
        };
        cache.rebuild();
        cache
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn page_count(&self) -> u64 {
        self.extents.iter().map(|e| e.len as u64).sum()
    }

    /// Takes a contiguous run of `n` pages, or `None` when no extent is
    /// large enough. The heap top is the largest extent, so a miss there is
    /// a miss everywhere.
    pub fn pop_run(&mut self, n: u32) -> Option<PageId> {
        debug_assert!(n > 0);
        let top = *self.heap.peek()?;
        if top.len < n {
            return None;
        }
        self.heap.pop();
        let run_start = top.start;
        match self
            .extents
            .binary_search_by_key(&top.start.0, |e| e.start.0)
        {
            Ok(pos) if self.extents[pos].len == top.len => {
                if top.len > n {
                    self.extents[pos].start.0 += n as u64;
                    self.extents[pos].len -= n;
                    self.heap.push(HeapExtent::from(self.extents[pos]));
                } else {
                    self.extents.remove(pos);
                }
                Some(run_start)
            }
            _ => {
                // Heap drifted from the extent list; rebuild and retry once.
                self.rebuild();
                let top = *self.heap.peek()?;
                if top.len < n {
                    None
                } else {
                    self.pop_run(n)
                }
            }
        }
    }

    pub fn extend(&mut self, mut extents: Vec<Extent>) {
        if extents.is_empty() {
            return;
        }
        self.extents.append(&mut extents);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        if self.extents.is_empty() {
            self.heap.clear();
            return;
        }
        self.extents.sort_by(|a, b| a.start.0.cmp(&b.start.0));
        let mut merged: Vec<Extent> = Vec::with_capacity(self.extents.len());
        for extent in self.extents.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.heap = BinaryHeap::from(
            merged
                .iter()
                .copied()
                .map(HeapExtent::from)
                .collect::<Vec<_>>(),
        );
        self.extents = merged;
    }
}

/// The full free-list state: allocatable cache plus deferred frees.
#[derive(Clone, Default, Debug)]
pub(crate) struct FreeList {
    cache: FreeCache,
    pending: BTreeMap<TxId, Vec<PageId>>,
}

impl FreeList {
    pub fn from_extents(extents: Vec<Extent>) -> Self {
        Self {
            cache: FreeCache::from_extents(extents),
            pending: BTreeMap::new(),
        }
    }

    /// Parks pages freed by transaction `tx_id` until readers drain.
    pub fn free(&mut self, tx_id: TxId, pages: impl IntoIterator<Item = PageId>) {
        let bucket = self.pending.entry(tx_id).or_default();
        for page in pages {
            debug_assert!(!page.is_null() && page.0 != 1, "cannot free a meta slot");
            bucket.push(page);
        }
    }

    /// Migrates pending frees into the allocatable cache.
    ///
    /// `oldest_reader` is the smallest transaction id any open reader began
    /// at; `None` means no readers are open and everything pending drains.
    pub fn release(&mut self, oldest_reader: Option<TxId>) {
        let drained: Vec<TxId> = match oldest_reader {
            Some(bound) => self
                .pending
                .range(..bound)
                .map(|(&tx_id, _)| tx_id)
                .collect(),
            None => self.pending.keys().copied().collect(),
        };
        if drained.is_empty() {
            return;
        }
        let mut extents = Vec::new();
        for tx_id in drained {
            if let Some(pages) = self.pending.remove(&tx_id) {
                extents.extend(pages.into_iter().map(|p| Extent::new(p, 1)));
            }
        }
        trace!(extents = extents.len(), "freelist.release");
        self.cache.extend(extents);
    }

    /// Takes a contiguous run of `n` already-reclaimable pages.
    pub fn allocate(&mut self, n: u32) -> Option<PageId> {
        self.cache.pop_run(n)
    }

    /// Every free page, reclaimable or pending, as coalesced extents.
    ///
    /// This is what gets persisted: after a crash or reopen no reader can
    /// exist, so pending frees are plain free pages to the next process.
    pub fn all_extents(&self) -> Vec<Extent> {
        let mut extents: Vec<Extent> = self.cache.extents().to_vec();
        extents.extend(
            self.pending
                .values()
                .flatten()
                .map(|&p| Extent::new(p, 1)),
        );
        FreeCache::from_extents(extents).extents().to_vec()
    }

    pub fn free_page_count(&self) -> u64 {
        self.cache.page_count()
            + self
                .pending
                .values()
                .map(|pages| pages.len() as u64)
                .sum::<u64>()
    }
}

/// Extents one free-list page can hold.
pub(crate) fn free_page_capacity(page_size: usize) -> usize {
    let payload = page_size
        .checked_sub(PAGE_HDR_LEN)
        .expect("page size smaller than header");
    payload.saturating_sub(16) / 16
}

/// Number of chain pages needed to persist `extent_count` extents.
pub(crate) fn chain_pages_needed(extent_count: usize, page_size: usize) -> usize {
    if extent_count == 0 {
        return 0;
    }
    let capacity = free_page_capacity(page_size);
    (extent_count + capacity - 1) / capacity
}

pub(crate) struct FreePage {
    pub next: PageId,
    pub extents: Vec<Extent>,
}

/// Decodes one free-list chain page.
pub(crate) fn read_free_page(buf: &[u8], page_id: PageId, meta: &Meta) -> Result<FreePage> {
    let page_size = meta.page_size as usize;
    let header = page::verify_page(buf, page_id, meta.salt, page_size)?;
    if header.kind != PageKind::FreeList {
        return Err(SiloError::Corrupt("free page kind mismatch"));
    }
    let payload = &buf[PAGE_HDR_LEN..page_size];
    let next = PageId(u64::from_be_bytes(payload[0..8].try_into().unwrap()));
    let count = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
    if payload[12..16] != [0; 4] {
        return Err(SiloError::Corrupt("free page reserved non-zero"));
    }
    if count > free_page_capacity(page_size) {
        return Err(SiloError::Corrupt("free page count exceeds capacity"));
    }
    let mut extents = Vec::with_capacity(count);
    for i in 0..count {
        let off = 16 + i * 16;
        let start = PageId(u64::from_be_bytes(
            payload[off..off + 8].try_into().unwrap(),
        ));
        let len = u32::from_be_bytes(payload[off + 8..off + 12].try_into().unwrap());
        if start.is_null() || len == 0 {
            return Err(SiloError::Corrupt("free page holds null extent"));
        }
        extents.push(Extent::new(start, len));
    }
    Ok(FreePage { next, extents })
}

/// Encodes one free-list chain page in place.
pub(crate) fn write_free_page(
    buf: &mut [u8],
    page_id: PageId,
    meta: &Meta,
    next: PageId,
    extents: &[Extent],
) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() < page_size {
        return Err(SiloError::Invalid("free page buffer too small"));
    }
    if extents.len() > free_page_capacity(page_size) {
        return Err(SiloError::Invalid("too many extents for one free page"));
    }
    buf[..page_size].fill(0);
    let header = PageHeader::new(page_id, PageKind::FreeList, meta.page_size, meta.salt)?;
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    let payload = &mut buf[PAGE_HDR_LEN..page_size];
    payload[..8].copy_from_slice(&next.0.to_be_bytes());
    payload[8..12].copy_from_slice(&(extents.len() as u32).to_be_bytes());
    // reserved already zeroed
    for (idx, extent) in extents.iter().enumerate() {
        let off = 16 + idx * 16;
        payload[off..off + 8].copy_from_slice(&extent.start.0.to_be_bytes());
        payload[off + 8..off + 12].copy_from_slice(&extent.len.to_be_bytes());
    }
    page::seal_page(&mut buf[..page_size], page_id, meta.salt)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::DEFAULT_PAGE_SIZE;

    fn meta() -> Meta {
        Meta {
            page_size: DEFAULT_PAGE_SIZE as u32,
            salt: 7,
            tx_id: 1,
            directory_root: PageId(2),
            freelist_head: PageId::NULL,
            page_count: 3,
        }
    }

    #[test]
    fn cache_coalesces_adjacent_extents() {
        let cache = FreeCache::from_extents(vec![
            Extent::new(PageId(10), 2),
            Extent::new(PageId(12), 3),
            Extent::new(PageId(20), 1),
        ]);
        assert_eq!(
            cache.extents(),
            &[Extent::new(PageId(10), 5), Extent::new(PageId(20), 1)]
        );
    }

    #[test]
    fn pop_run_prefers_largest_extent() {
        let mut cache = FreeCache::from_extents(vec![
            Extent::new(PageId(10), 2),
            Extent::new(PageId(20), 5),
        ]);
        assert_eq!(cache.pop_run(3), Some(PageId(20)));
        assert_eq!(
            cache.extents(),
            &[Extent::new(PageId(10), 2), Extent::new(PageId(23), 2)]
        );
        assert_eq!(cache.pop_run(4), None);
    }

    #[test]
    fn pending_pages_wait_for_readers() {
        let mut list = FreeList::default();
        list.free(5, [PageId(30), PageId(31)]);
        assert_eq!(list.allocate(1), None);

        // A reader pinned at tx 5 still sees those pages.
        list.release(Some(5));
        assert_eq!(list.allocate(1), None);

        // Reader gone; tx 5's frees drain.
        list.release(Some(6));
        assert_eq!(list.allocate(2), Some(PageId(30)));
    }

    #[test]
    fn release_without_readers_drains_everything() {
        let mut list = FreeList::default();
        list.free(3, [PageId(9)]);
        list.free(4, [PageId(10)]);
        list.release(None);
        assert_eq!(list.allocate(2), Some(PageId(9)));
    }

    #[test]
    fn all_extents_includes_pending() {
        let mut list = FreeList::from_extents(vec![Extent::new(PageId(8), 1)]);
        list.free(2, [PageId(9)]);
        assert_eq!(list.all_extents(), vec![Extent::new(PageId(8), 2)]);
    }

    #[test]
    fn free_page_roundtrip() {
        let meta = meta();
        let extents = vec![Extent::new(PageId(5), 2), Extent::new(PageId(9), 1)];
        let mut buf = vec![0u8; DEFAULT_PAGE_SIZE];
        write_free_page(&mut buf, PageId(4), &meta, PageId(11), &extents).unwrap();
        let decoded = read_free_page(&buf, PageId(4), &meta).unwrap();
        assert_eq!(decoded.next, PageId(11));
        assert_eq!(decoded.extents, extents);
    }

    #[test]
    fn free_page_rejects_tampering() {
        let meta = meta();
        let mut buf = vec![0u8; DEFAULT_PAGE_SIZE];
        write_free_page(&mut buf, PageId(4), &meta, PageId::NULL, &[]).unwrap();
        buf[60] ^= 0x01;
        assert!(read_free_page(&buf, PageId(4), &meta).is_err());
    }
}
