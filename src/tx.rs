//! Transactions.
//!
//! One writable transaction at a time, any number of read-only ones. A
//! reader pins the meta it saw at begin and never blocks; the writer stages
//! every change in memory (materialized nodes, recorded frees) and makes it
//! all durable in one batch at commit. Failure anywhere before the meta
//! flip leaves the previous meta authoritative, so rollback — explicit,
//! error-driven, or via drop — never has persistent effects to undo.

use std::cell::RefCell;
use std::time::Instant;

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use crate::bucket::{Bucket, BucketData};
use crate::db::Db;
use crate::error::{Result, SiloError};
use crate::freelist::{self, FreeList};
use crate::meta::Meta;
use crate::page::{PageId, TxId};

/// Arena index of the bucket directory inside every transaction.
pub(crate) const DIRECTORY: usize = 0;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// Accepting operations.
    Active,
    /// Writer: changes are durable.
    Committed,
    /// Writer: changes are discarded.
    RolledBack,
    /// Reader: snapshot pin dropped.
    Released,
}

pub(crate) struct TxInner {
    pub phase: TxPhase,
    pub writable: bool,
    /// Reader: immutable snapshot. Writer: working copy, tx id already
    /// advanced past the snapshot it grew from.
    pub meta: Meta,
    pub buckets: Vec<BucketData>,
    /// Pages this transaction has released; applied to the free list only
    /// at commit, keyed by this transaction's id.
    pub freed: Vec<PageId>,
}

/// A point-in-time view of the database, writable or read-only.
///
/// Obtained from [`Db::begin`], [`Db::begin_write`], or the [`Db::view`] /
/// [`Db::update`] closures. A transaction left active when dropped is
/// released (readers) or rolled back (writers).
pub struct Tx<'db> {
    pub(crate) db: &'db Db,
    pub(crate) inner: RefCell<TxInner>,
    _write_gate: Option<MutexGuard<'db, ()>>,
    start: Instant,
}

impl<'db> Tx<'db> {
    pub(crate) fn new_read(db: &'db Db, meta: Meta) -> Self {
        let root = meta.directory_root;
        debug!(tx_id = meta.tx_id, "tx.begin_read");
        Self {
            db,
            inner: RefCell::new(TxInner {
                phase: TxPhase::Active,
                writable: false,
                meta,
                buckets: vec![BucketData::from_root(root)],
                freed: Vec::new(),
            }),
            _write_gate: None,
            start: Instant::now(),
        }
    }

    pub(crate) fn new_write(db: &'db Db, mut meta: Meta, gate: MutexGuard<'db, ()>) -> Self {
        meta.tx_id += 1;
        let root = meta.directory_root;
        debug!(tx_id = meta.tx_id, "tx.begin_write");
        Self {
            db,
            inner: RefCell::new(TxInner {
                phase: TxPhase::Active,
                writable: true,
                meta,
                buckets: vec![BucketData::from_root(root)],
                freed: Vec::new(),
            }),
            _write_gate: Some(gate),
            start: Instant::now(),
        }
    }

    /// Identifier of this transaction: the snapshot id for readers, the id
    /// being produced for writers.
    pub fn id(&self) -> TxId {
        self.inner.borrow().meta.tx_id
    }

    /// Whether this transaction may mutate the database.
    pub fn writable(&self) -> bool {
        self.inner.borrow().writable
    }

    /// Current lifecycle state.
    pub fn phase(&self) -> TxPhase {
        self.inner.borrow().phase
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.inner.borrow().phase {
            TxPhase::Active => Ok(()),
            TxPhase::Committed => Err(SiloError::TxClosed("transaction already committed")),
            TxPhase::RolledBack => Err(SiloError::TxClosed("transaction rolled back")),
            TxPhase::Released => Err(SiloError::TxClosed("transaction released")),
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if !self.inner.borrow().writable {
            return Err(SiloError::TxClosed("read-only transaction"));
        }
        Ok(())
    }

    /// Opens an existing top-level bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        self.ensure_active()?;
        let id = self
            .inner
            .borrow_mut()
            .open_child(&self.db.pager, DIRECTORY, name)?;
        Ok(Bucket::new(self, id))
    }

    /// Opens a top-level bucket, creating it when absent. Idempotent.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        self.ensure_writable()?;
        let id = self
            .inner
            .borrow_mut()
            .create_child(&self.db.pager, DIRECTORY, name)?;
        Ok(Bucket::new(self, id))
    }

    /// Deletes a top-level bucket and everything under it.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.inner
            .borrow_mut()
            .delete_child(&self.db.pager, DIRECTORY, name)
    }

    /// Makes every change of this writable transaction durable.
    ///
    /// On any error the transaction is rolled back, the previous meta stays
    /// authoritative, and the error is returned.
    pub fn commit(self) -> Result<()> {
        self.ensure_writable()?;
        match self.commit_pipeline() {
            Ok(dirty_pages) => {
                let mut inner = self.inner.borrow_mut();
                inner.phase = TxPhase::Committed;
                info!(
                    tx_id = inner.meta.tx_id,
                    dirty_pages,
                    duration_ms = self.start.elapsed().as_millis() as u64,
                    "tx.commit"
                );
                Ok(())
            }
            Err(err) => {
                self.inner.borrow_mut().phase = TxPhase::RolledBack;
                warn!(%err, "tx.commit_failed");
                Err(err)
            }
        }
    }

    /// Discards a writable transaction, or releases a reader's snapshot.
    pub fn rollback(self) -> Result<()> {
        self.ensure_active()?;
        self.finish_without_commit();
        Ok(())
    }

    fn finish_without_commit(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.writable {
            inner.phase = TxPhase::RolledBack;
            debug!(tx_id = inner.meta.tx_id, "tx.rollback");
        } else {
            inner.phase = TxPhase::Released;
            self.db.release_reader(inner.meta.tx_id);
            debug!(tx_id = inner.meta.tx_id, "tx.release");
        }
    }

    /// Rebalances, spills, persists, and flips the meta. Returns the number
    /// of pages written. Nothing shared is touched until the flip succeeded.
    fn commit_pipeline(&self) -> Result<usize> {
        let pager = &self.db.pager;
        let page_size = pager.page_size();
        let mut inner = self.inner.borrow_mut();

        let (freelist, old_chain) = self.db.freelist_snapshot();
        let mut alloc = Allocator {
            freelist,
            page_count: inner.meta.page_count,
        };
        alloc.freelist.release(self.db.oldest_reader());

        let mut dirty: Vec<(PageId, Vec<u8>)> = Vec::new();
        let directory = inner.spill_bucket(pager, DIRECTORY, &mut alloc, &mut dirty)?;

        let mut meta = inner.meta.clone();
        meta.directory_root = directory.root;

        let Allocator {
            mut freelist,
            mut page_count,
        } = alloc;
        freelist.free(meta.tx_id, inner.freed.drain(..));
        freelist.free(meta.tx_id, old_chain);

        // Persist the free list. Chain pages come from file growth, never
        // from the free cache, so the extents being written stay stable
        // while they are written.
        let extents = freelist.all_extents();
        let chain_len = freelist::chain_pages_needed(extents.len(), page_size);
        let chain: Vec<PageId> = (0..chain_len)
            .map(|i| PageId(page_count + i as u64))
            .collect();
        page_count += chain_len as u64;
        meta.freelist_head = chain.first().copied().unwrap_or(PageId::NULL);
        meta.page_count = page_count;

        let capacity = freelist::free_page_capacity(page_size);
        for (i, window) in extents.chunks(capacity).enumerate() {
            let next = chain.get(i + 1).copied().unwrap_or(PageId::NULL);
            let mut buf = vec![0u8; page_size];
            freelist::write_free_page(&mut buf, chain[i], &meta, next, window)?;
            dirty.push((chain[i], buf));
        }

        // Recycled page ids may have stale images cached.
        pager.purge_cached(dirty.iter().map(|(id, _)| *id));
        pager.write_pages(&dirty)?;
        pager.sync()?;
        pager.write_meta(&meta)?;
        pager.sync()?;

        inner.meta = meta.clone();
        self.db.install_commit(meta, freelist, chain);
        Ok(dirty.len())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        let phase = self.inner.borrow().phase;
        if phase == TxPhase::Active {
            if self.inner.borrow().writable {
                warn!(
                    tx_id = self.inner.borrow().meta.tx_id,
                    "tx.dropped_active_rollback"
                );
            }
            self.finish_without_commit();
        }
    }
}

/// Page allocation state threaded through a commit: the writer's private
/// free-list clone plus the working end-of-file watermark.
pub(crate) struct Allocator {
    pub freelist: FreeList,
    pub page_count: u64,
}

impl Allocator {
    /// Returns a run of `n` contiguous pages, recycling released pages
    /// before growing the file.
    pub fn allocate(&mut self, n: u32) -> PageId {
        if let Some(id) = self.freelist.allocate(n) {
            return id;
        }
        let id = PageId(self.page_count);
        self.page_count += n as u64;
        id
    }
}
