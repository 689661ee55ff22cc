//! Online compaction: rewrite a live database into a fresh file.
//!
//! The source is read under one snapshot, so compaction runs concurrently
//! with source readers and never observes writes that begin after it does.
//! Every live (bucket, key, value) triple is re-inserted into the
//! destination in key order; since keys arrive pre-sorted, destination
//! inserts always land on the rightmost edge of each tree and commit as
//! tightly packed sequential pages, with no free-list fragmentation and no
//! stale page versions.

use tracing::info;

use crate::bucket::Bucket;
use crate::cursor::Cursor;
use crate::db::Db;
use crate::error::{Result, SiloError};
use crate::tx::{Tx, DIRECTORY};

/// Copies every live entry of `src` into `dst`, returning the number of
/// key and value bytes copied.
///
/// `max_tx_bytes` bounds how many bytes one destination transaction
/// absorbs before it is committed and a new one begins; `0` writes the
/// whole destination in a single transaction. `dst` should be a freshly
/// created, empty database. On error the current destination transaction
/// rolls back and the unfinished destination file is left for the caller
/// to discard; the source is never modified.
pub fn compact(dst: &Db, src: &Db, max_tx_bytes: u64) -> Result<u64> {
    let src_tx = src.begin()?;
    let mut sink = Sink {
        db: dst,
        max_tx_bytes,
        tx: None,
        tx_bytes: 0,
        total_bytes: 0,
    };

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut cursor = Cursor::new(&src_tx, DIRECTORY);
    let mut item = cursor.first()?;
    while let Some((name, value)) = item {
        if value.is_some() {
            return Err(SiloError::Corrupt("plain value in bucket directory"));
        }
        let bucket = src_tx.bucket(&name)?;
        path.push(name);
        copy_bucket(&bucket, &mut path, &mut sink)?;
        path.pop();
        item = cursor.next()?;
    }

    sink.finish()?;
    let total = sink.total_bytes;
    src_tx.rollback()?;
    info!(bytes = total, "compact.done");
    Ok(total)
}

fn copy_bucket(
    bucket: &Bucket<'_, '_>,
    path: &mut Vec<Vec<u8>>,
    sink: &mut Sink<'_>,
) -> Result<()> {
    // Materialize the bucket itself so empty buckets survive compaction.
    sink.touch(path)?;

    let mut cursor = bucket.cursor()?;
    let mut item = cursor.first()?;
    while let Some((key, value)) = item {
        match value {
            Some(value) => sink.put(path, &key, &value)?,
            None => {
                let child = bucket.bucket(&key)?;
                path.push(key);
                copy_bucket(&child, path, sink)?;
                path.pop();
            }
        }
        item = cursor.next()?;
    }
    Ok(())
}

/// Destination writer with transaction batching.
struct Sink<'db> {
    db: &'db Db,
    max_tx_bytes: u64,
    tx: Option<Tx<'db>>,
    tx_bytes: u64,
    total_bytes: u64,
}

impl<'db> Sink<'db> {
    fn ensure_tx(&mut self) -> Result<()> {
        if self.tx.is_none() {
            self.tx = Some(self.db.begin_write()?);
        }
        Ok(())
    }

    /// Resolves (creating as needed) the bucket at `path` in the current
    /// transaction and applies `f` to it.
    fn with_bucket(
        &mut self,
        path: &[Vec<u8>],
        f: impl FnOnce(&Bucket<'_, 'db>) -> Result<()>,
    ) -> Result<()> {
        self.ensure_tx()?;
        let tx = self.tx.as_ref().expect("transaction just ensured");
        let mut bucket = tx.create_bucket_if_not_exists(&path[0])?;
        for name in &path[1..] {
            bucket = bucket.create_bucket_if_not_exists(name)?;
        }
        f(&bucket)
    }

    fn touch(&mut self, path: &[Vec<u8>]) -> Result<()> {
        self.with_bucket(path, |_| Ok(()))
    }

    fn put(&mut self, path: &[Vec<u8>], key: &[u8], value: &[u8]) -> Result<()> {
        self.with_bucket(path, |bucket| bucket.put(key, value))?;
        let bytes = (key.len() + value.len()) as u64;
        self.tx_bytes += bytes;
        self.total_bytes += bytes;
        if self.max_tx_bytes > 0 && self.tx_bytes >= self.max_tx_bytes {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
            self.tx_bytes = 0;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush()
    }
}
