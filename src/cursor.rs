//! Key-ordered traversal over one bucket.
//!
//! The cursor keeps an explicit descent stack of (page-or-node, index)
//! frames, so it walks committed pages and the write transaction's
//! materialized nodes through one code path. Entries come back in strictly
//! ascending key order; nested bucket entries carry no value.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::bucket::RootRef;
use crate::error::{Result, SiloError};
use crate::node::{self, Child, FLAG_BUCKET, FLAG_OVERFLOW};
use crate::overflow::{self, OverflowRef};
use crate::page::{PageHeader, PageId, PageKind};
use crate::tx::Tx;

/// One entry: the key, and the value unless the entry is a nested bucket.
pub type Entry = (Vec<u8>, Option<Vec<u8>>);

#[derive(Clone)]
enum Source {
    Page(Arc<Vec<u8>>),
    Node(usize),
}

struct ElemRef {
    source: Source,
    index: usize,
}

/// A cursor over one bucket, created by `Bucket::cursor`.
///
/// Positions are not stable across writes through the same transaction;
/// reposition with [`Cursor::first`] or [`Cursor::seek`] after mutating.
pub struct Cursor<'tx, 'db> {
    tx: &'tx Tx<'db>,
    bucket: usize,
    stack: SmallVec<[ElemRef; 8]>,
}

impl<'tx, 'db> Cursor<'tx, 'db> {
    pub(crate) fn new(tx: &'tx Tx<'db>, bucket: usize) -> Self {
        Self {
            tx,
            bucket,
            stack: SmallVec::new(),
        }
    }

    /// Positions at the first entry of the bucket.
    pub fn first(&mut self) -> Result<Option<Entry>> {
        self.tx.ensure_active()?;
        self.stack.clear();
        let root = self.root_source()?;
        self.descend_left(root)?;
        if self.top_exhausted()? {
            return self.advance();
        }
        self.current()
    }

    /// Positions at the first entry with key at or after `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        self.tx.ensure_active()?;
        self.stack.clear();
        let mut source = self.root_source()?;
        loop {
            if self.is_leaf(&source)? {
                let index = match self.leaf_position(&source, key)? {
                    Ok(found) => found,
                    Err(insert) => insert,
                };
                self.stack.push(ElemRef { source, index });
                break;
            }
            let index = self.branch_position(&source, key)?;
            let child = self.child_source(&source, index)?;
            self.stack.push(ElemRef { source, index });
            source = child;
        }
        if self.top_exhausted()? {
            return self.advance();
        }
        self.current()
    }

    /// Moves to the next entry in key order.
    pub fn next(&mut self) -> Result<Option<Entry>> {
        self.tx.ensure_active()?;
        let Some(top) = self.stack.last_mut() else {
            return Ok(None);
        };
        top.index += 1;
        if self.top_exhausted()? {
            return self.advance();
        }
        self.current()
    }

    /// Climbs out of exhausted frames, then dives to the next leaf entry.
    fn advance(&mut self) -> Result<Option<Entry>> {
        loop {
            self.stack.pop();
            if self.stack.is_empty() {
                return Ok(None);
            }
            {
                let top = self.stack.last_mut().expect("non-empty stack");
                top.index += 1;
            }
            let (source, index) = {
                let top = self.stack.last().expect("non-empty stack");
                (top.source.clone(), top.index)
            };
            if index < self.count(&source)? {
                let child = self.child_source(&source, index)?;
                self.descend_left(child)?;
                if self.top_exhausted()? {
                    continue;
                }
                return self.current();
            }
        }
    }

    fn root_source(&self) -> Result<Source> {
        let inner = self.tx.inner.borrow();
        if inner.buckets[self.bucket].deleted {
            return Err(SiloError::BucketNotFound);
        }
        match inner.buckets[self.bucket].root {
            RootRef::Node(idx) => Ok(Source::Node(idx)),
            RootRef::Page(id) => Ok(Source::Page(self.tx.db.pager.read_page(id)?)),
        }
    }

    fn descend_left(&mut self, mut source: Source) -> Result<()> {
        loop {
            if self.is_leaf(&source)? {
                self.stack.push(ElemRef { source, index: 0 });
                return Ok(());
            }
            let child = self.child_source(&source, 0)?;
            self.stack.push(ElemRef { source, index: 0 });
            source = child;
        }
    }

    fn top_exhausted(&self) -> Result<bool> {
        let top = self.stack.last().expect("positioned cursor");
        Ok(top.index >= self.count(&top.source)?)
    }

    fn is_leaf(&self, source: &Source) -> Result<bool> {
        match source {
            Source::Node(idx) => Ok(self.tx.inner.borrow().buckets[self.bucket].arena[*idx].is_leaf),
            Source::Page(buf) => match PageHeader::decode(buf)?.kind {
                PageKind::Leaf => Ok(true),
                PageKind::Branch => Ok(false),
                _ => Err(SiloError::Corrupt("cursor reached non-tree page")),
            },
        }
    }

    fn count(&self, source: &Source) -> Result<usize> {
        match source {
            Source::Node(idx) => {
                Ok(self.tx.inner.borrow().buckets[self.bucket].arena[*idx].inodes.len())
            }
            Source::Page(buf) => node::read_count(buf),
        }
    }

    fn leaf_position(
        &self,
        source: &Source,
        key: &[u8],
    ) -> Result<std::result::Result<usize, usize>> {
        match source {
            Source::Node(idx) => {
                Ok(self.tx.inner.borrow().buckets[self.bucket].arena[*idx].search(key))
            }
            Source::Page(buf) => node::leaf_search(buf, self.page_size(), key),
        }
    }

    fn branch_position(&self, source: &Source, key: &[u8]) -> Result<usize> {
        match source {
            Source::Node(idx) => {
                Ok(self.tx.inner.borrow().buckets[self.bucket].arena[*idx].child_index(key))
            }
            Source::Page(buf) => node::branch_child_index(buf, self.page_size(), key),
        }
    }

    fn child_source(&self, source: &Source, index: usize) -> Result<Source> {
        let page = match source {
            Source::Node(idx) => {
                match self.tx.inner.borrow().buckets[self.bucket].arena[*idx].inodes[index].child {
                    Child::Node(child) => return Ok(Source::Node(child)),
                    Child::Page(page) => page,
                }
            }
            Source::Page(buf) => {
                let (_, child) = node::branch_elem(buf, self.page_size(), index)?;
                child
            }
        };
        Ok(Source::Page(self.tx.db.pager.read_page(page)?))
    }

    /// Resolves the entry under the top frame.
    fn current(&self) -> Result<Option<Entry>> {
        let top = self.stack.last().expect("positioned cursor");
        let (flags, key, stored) = match &top.source {
            Source::Node(idx) => {
                let inner = self.tx.inner.borrow();
                let inode = &inner.buckets[self.bucket].arena[*idx].inodes[top.index];
                (inode.flags, inode.key.clone(), inode.value.clone())
            }
            Source::Page(buf) => {
                let (flags, key, value) = node::leaf_elem(buf, self.page_size(), top.index)?;
                (flags, key.to_vec(), value.to_vec())
            }
        };
        if flags & FLAG_BUCKET != 0 {
            return Ok(Some((key, None)));
        }
        if flags & FLAG_OVERFLOW != 0 {
            let vref = OverflowRef::decode(&stored)?;
            let pager = &self.tx.db.pager;
            let value = overflow::read_chain(vref, self.page_size(), &|id: PageId| {
                pager.read_page(id)
            })?;
            return Ok(Some((key, Some(value))));
        }
        Ok(Some((key, Some(stored))))
    }

    fn page_size(&self) -> usize {
        self.tx.db.pager.page_size()
    }
}
