//! The database handle.
//!
//! `Db` owns the page store and the shared mutable state: the current meta,
//! the free list, and the registry of open reader snapshots. It is `Send +
//! Sync`; share it across threads with an `Arc`. Readers run concurrently
//! with each other and with the single writer, each against the meta it
//! captured at begin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::freelist::FreeList;
use crate::meta::Meta;
use crate::page::{PageId, TxId};
use crate::pager::Pager;
use crate::tx::Tx;

/// Options supplied when opening a database.
#[derive(Clone, Debug)]
pub struct Options {
    /// How long to wait for the exclusive file lock before failing with
    /// [`crate::SiloError::Busy`]. Zero attempts the lock exactly once.
    pub timeout: Duration,
    /// Page size for a newly created database. When set on an existing
    /// database it must match the file or opening fails.
    pub page_size: Option<usize>,
    /// Capacity of the shared page cache, in pages.
    pub cache_pages: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            page_size: None,
            cache_pages: 2048,
        }
    }
}

impl Options {
    /// Sets the file-lock acquisition timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets (and, for existing files, asserts) the page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Sets the page cache capacity.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }
}

/// Point-in-time counters reported by [`Db::stats`].
#[derive(Clone, Copy, Debug)]
pub struct Stats {
    /// Id of the last committed transaction.
    pub tx_id: TxId,
    /// Total pages in the file, meta slots included.
    pub page_count: u64,
    /// Pages on the free list, reclaimable and pending together.
    pub free_pages: u64,
    /// Page size of this database file.
    pub page_size: usize,
}

struct DbShared {
    meta: Meta,
    freelist: FreeList,
    /// Pages occupied by the persisted free-list chain itself.
    freelist_pages: Vec<PageId>,
}

/// An open database file.
pub struct Db {
    pub(crate) pager: Pager,
    state: Mutex<DbShared>,
    readers: Mutex<BTreeMap<TxId, usize>>,
    write_gate: Mutex<()>,
    path: PathBuf,
}

impl Db {
    /// Opens or creates the database at `path`.
    ///
    /// Fails with [`crate::SiloError::Busy`] when another process holds the file
    /// lock past the configured timeout; filesystem errors (permissions,
    /// missing directories) surface as [`crate::SiloError::Io`].
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        let (pager, meta) = Pager::open(&path, &opts)?;
        let (freelist, freelist_pages) = Self::load_freelist(&pager, &meta)?;
        info!(
            path = %path.display(),
            tx_id = meta.tx_id,
            page_count = meta.page_count,
            free_pages = freelist.free_page_count(),
            "db.open"
        );
        Ok(Db {
            pager,
            state: Mutex::new(DbShared {
                meta,
                freelist,
                freelist_pages,
            }),
            readers: Mutex::new(BTreeMap::new()),
            write_gate: Mutex::new(()),
            path,
        })
    }

    fn load_freelist(pager: &Pager, meta: &Meta) -> Result<(FreeList, Vec<PageId>)> {
        let mut extents = Vec::new();
        let mut chain = Vec::new();
        let mut cursor = meta.freelist_head;
        while !cursor.is_null() {
            let buf = pager.read_page(cursor)?;
            let page = crate::freelist::read_free_page(&buf, cursor, meta)?;
            chain.push(cursor);
            extents.extend(page.extents);
            cursor = page.next;
        }
        Ok((FreeList::from_extents(extents), chain))
    }

    /// Path this database was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begins a read-only transaction. Never blocks.
    pub fn begin(&self) -> Result<Tx<'_>> {
        // Snapshot and pin atomically under the state lock: a snapshot that
        // registered late could watch its pages get recycled by a commit
        // that never saw the pin.
        let meta = {
            let state = self.state.lock();
            let meta = state.meta.clone();
            *self.readers.lock().entry(meta.tx_id).or_insert(0) += 1;
            meta
        };
        Ok(Tx::new_read(self, meta))
    }

    /// Begins the writable transaction, waiting for any current writer to
    /// finish first.
    pub fn begin_write(&self) -> Result<Tx<'_>> {
        let gate = self.write_gate.lock();
        let meta = self.state.lock().meta.clone();
        Ok(Tx::new_write(self, meta, gate))
    }

    /// Runs `f` inside a writable transaction: committed when `f` returns
    /// `Ok`, rolled back when it returns `Err`.
    pub fn update<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin_write()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback()?;
                Err(err)
            }
        }
    }

    /// Runs `f` inside a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin()?;
        let out = f(&tx);
        tx.rollback()?;
        out
    }

    /// Current database counters.
    pub fn stats(&self) -> Stats {
        let state = self.state.lock();
        Stats {
            tx_id: state.meta.tx_id,
            page_count: state.meta.page_count,
            free_pages: state.freelist.free_page_count(),
            page_size: state.meta.page_size as usize,
        }
    }

    pub(crate) fn freelist_snapshot(&self) -> (FreeList, Vec<PageId>) {
        let state = self.state.lock();
        (state.freelist.clone(), state.freelist_pages.clone())
    }

    /// Smallest transaction id any open reader is pinned to.
    pub(crate) fn oldest_reader(&self) -> Option<TxId> {
        self.readers.lock().keys().next().copied()
    }

    pub(crate) fn release_reader(&self, tx_id: TxId) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&tx_id) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&tx_id);
            }
        }
    }

    /// Publishes the results of a successful commit.
    pub(crate) fn install_commit(
        &self,
        meta: Meta,
        freelist: FreeList,
        freelist_pages: Vec<PageId>,
    ) {
        let mut state = self.state.lock();
        state.meta = meta;
        state.freelist = freelist;
        state.freelist_pages = freelist_pages;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SiloError;
    use tempfile::tempdir;

    fn open_db(dir: &tempfile::TempDir) -> Db {
        Db::open(dir.path().join("test.db"), Options::default()).unwrap()
    }

    #[test]
    fn put_get_roundtrip_across_transactions() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.update(|tx| {
            let bucket = tx.create_bucket_if_not_exists(b"people")?;
            bucket.put(b"alice", b"engineer")?;
            bucket.put(b"bob", b"analyst")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.bucket(b"people")?;
            assert_eq!(bucket.get(b"alice")?.as_deref(), Some(&b"engineer"[..]));
            assert_eq!(bucket.get(b"bob")?.as_deref(), Some(&b"analyst"[..]));
            assert_eq!(bucket.get(b"carol")?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn read_your_writes_within_transaction() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.update(|tx| {
            let bucket = tx.create_bucket_if_not_exists(b"b")?;
            bucket.put(b"k", b"v1")?;
            assert_eq!(bucket.get(b"k")?.as_deref(), Some(&b"v1"[..]));
            bucket.put(b"k", b"v2")?;
            assert_eq!(bucket.get(b"k")?.as_deref(), Some(&b"v2"[..]));
            bucket.delete(b"k")?;
            assert_eq!(bucket.get(b"k")?, None);
            bucket.put(b"k", b"v3")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert_eq!(tx.bucket(b"b")?.get(b"k")?.as_deref(), Some(&b"v3"[..]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn error_in_update_rolls_back() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.update(|tx| {
            tx.create_bucket_if_not_exists(b"b")?.put(b"keep", b"1")?;
            Ok(())
        })
        .unwrap();

        let result: Result<()> = db.update(|tx| {
            tx.bucket(b"b")?.put(b"lost", b"2")?;
            Err(SiloError::Invalid("boom"))
        });
        assert!(result.is_err());

        db.view(|tx| {
            let bucket = tx.bucket(b"b")?;
            assert_eq!(bucket.get(b"keep")?.as_deref(), Some(&b"1"[..]));
            assert_eq!(bucket.get(b"lost")?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn missing_bucket_is_distinguishable() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let err = db.view(|tx| tx.bucket(b"nope").map(|_| ())).unwrap_err();
        assert!(matches!(err, SiloError::BucketNotFound));
    }

    #[test]
    fn create_bucket_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.update(|tx| {
            tx.create_bucket_if_not_exists(b"b")?.put(b"k", b"v")?;
            // Second create returns the same bucket, contents intact.
            let again = tx.create_bucket_if_not_exists(b"b")?;
            assert_eq!(again.get(b"k")?.as_deref(), Some(&b"v"[..]));
            Ok(())
        })
        .unwrap();

        db.update(|tx| {
            let again = tx.create_bucket_if_not_exists(b"b")?;
            assert_eq!(again.get(b"k")?.as_deref(), Some(&b"v"[..]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn nested_buckets_and_cascading_delete() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.update(|tx| {
            let outer = tx.create_bucket_if_not_exists(b"outer")?;
            let inner = outer.create_bucket_if_not_exists(b"inner")?;
            inner.put(b"k", b"v")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let inner = tx.bucket(b"outer")?.bucket(b"inner")?;
            assert_eq!(inner.get(b"k")?.as_deref(), Some(&b"v"[..]));
            Ok(())
        })
        .unwrap();

        db.update(|tx| tx.delete_bucket(b"outer")).unwrap();

        let err = db.view(|tx| tx.bucket(b"outer").map(|_| ())).unwrap_err();
        assert!(matches!(err, SiloError::BucketNotFound));
    }

    #[test]
    fn deleting_missing_bucket_fails() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let err = db.update(|tx| tx.delete_bucket(b"ghost")).unwrap_err();
        assert!(matches!(err, SiloError::BucketNotFound));
    }

    #[test]
    fn keys_and_buckets_do_not_mix() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.update(|tx| {
            let bucket = tx.create_bucket_if_not_exists(b"b")?;
            bucket.put(b"plain", b"v")?;
            bucket.create_bucket_if_not_exists(b"sub")?;
            Ok(())
        })
        .unwrap();

        db.update(|tx| {
            let bucket = tx.bucket(b"b")?;
            assert!(matches!(
                bucket.get(b"sub"),
                Err(SiloError::Incompatible(_))
            ));
            assert!(matches!(
                bucket.put(b"sub", b"x"),
                Err(SiloError::Incompatible(_))
            ));
            assert!(matches!(
                bucket.delete(b"sub"),
                Err(SiloError::Incompatible(_))
            ));
            assert!(matches!(
                bucket.bucket(b"plain"),
                Err(SiloError::Incompatible(_))
            ));
            assert!(matches!(
                bucket.delete_bucket(b"plain"),
                Err(SiloError::Incompatible(_))
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn writes_through_read_transaction_are_rejected() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        db.update(|tx| {
            tx.create_bucket_if_not_exists(b"b")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.bucket(b"b")?;
            assert!(matches!(
                bucket.put(b"k", b"v"),
                Err(SiloError::TxClosed(_))
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn large_values_roundtrip_through_overflow_chains() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        db.update(|tx| {
            tx.create_bucket_if_not_exists(b"blobs")?.put(b"big", &big)?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert_eq!(tx.bucket(b"blobs")?.get(b"big")?.as_deref(), Some(&big[..]));
            Ok(())
        })
        .unwrap();

        // Overwriting releases the old chain; the file must not keep both.
        let stats_before = db.stats();
        db.update(|tx| {
            tx.bucket(b"blobs")?.put(b"big", b"small now")?;
            Ok(())
        })
        .unwrap();
        db.update(|tx| {
            let _ = tx; // empty commit so the prior tx's frees become reclaimable
            Ok(())
        })
        .unwrap();
        let stats_after = db.stats();
        assert!(stats_after.free_pages > stats_before.free_pages);

        db.view(|tx| {
            assert_eq!(
                tx.bucket(b"blobs")?.get(b"big")?.as_deref(),
                Some(&b"small now"[..])
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn many_keys_survive_splits_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = Db::open(&path, Options::default()).unwrap();
            db.update(|tx| {
                let bucket = tx.create_bucket_if_not_exists(b"b")?;
                for i in 0..2000u32 {
                    let key = format!("key_{i:06}");
                    let value = format!("value_{i}");
                    bucket.put(key.as_bytes(), value.as_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        }

        let db = Db::open(&path, Options::default()).unwrap();
        db.view(|tx| {
            let bucket = tx.bucket(b"b")?;
            for i in (0..2000u32).step_by(97) {
                let key = format!("key_{i:06}");
                assert_eq!(
                    bucket.get(key.as_bytes())?.as_deref(),
                    Some(format!("value_{i}").as_bytes())
                );
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn deletes_shrink_the_tree_and_free_pages() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.update(|tx| {
            let bucket = tx.create_bucket_if_not_exists(b"b")?;
            for i in 0..1000u32 {
                bucket.put(format!("key_{i:05}").as_bytes(), &[0xAB; 64])?;
            }
            Ok(())
        })
        .unwrap();

        db.update(|tx| {
            let bucket = tx.bucket(b"b")?;
            for i in 0..1000u32 {
                bucket.delete(format!("key_{i:05}").as_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.bucket(b"b")?;
            assert_eq!(bucket.get(b"key_00000")?, None);
            let mut cursor = bucket.cursor()?;
            assert!(cursor.first()?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn dropped_write_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        {
            let tx = db.begin_write().unwrap();
            tx.create_bucket_if_not_exists(b"b")
                .unwrap()
                .put(b"k", b"v")
                .unwrap();
            // dropped without commit
        }
        let err = db.view(|tx| tx.bucket(b"b").map(|_| ())).unwrap_err();
        assert!(matches!(err, SiloError::BucketNotFound));
    }

    #[test]
    fn cursor_iterates_in_key_order() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        db.update(|tx| {
            let bucket = tx.create_bucket_if_not_exists(b"b")?;
            for key in ["delta", "alpha", "echo", "charlie", "bravo"] {
                bucket.put(key.as_bytes(), key.as_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.bucket(b"b")?;
            let mut keys = Vec::new();
            bucket.for_each(|key, value| {
                assert!(value.is_some());
                keys.push(String::from_utf8(key.to_vec()).unwrap());
                Ok(())
            })?;
            assert_eq!(keys, vec!["alpha", "bravo", "charlie", "delta", "echo"]);

            let mut cursor = bucket.cursor()?;
            let (key, _) = cursor.seek(b"c")?.unwrap();
            assert_eq!(key, b"charlie");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn stats_reflect_commits() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let before = db.stats();
        db.update(|tx| {
            tx.create_bucket_if_not_exists(b"b")?.put(b"k", b"v")?;
            Ok(())
        })
        .unwrap();
        let after = db.stats();
        assert_eq!(after.tx_id, before.tx_id + 1);
        assert!(after.page_count >= before.page_count);
    }
}
