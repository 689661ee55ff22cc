//! Buckets: named, independently-rooted key-value namespaces.
//!
//! The bucket directory is itself a tree whose keys are bucket names and
//! whose values are serialized bucket headers, so creating and deleting
//! buckets is ordinary tree mutation. Nested buckets nest the same way,
//! to any depth.
//!
//! A write transaction materializes the tree pages it touches into
//! in-memory nodes per bucket. Reads overlay those nodes on the committed
//! pages; commit rebalances underfull nodes, splits overfull ones, and
//! writes every dirty node to a freshly allocated page — the old pages are
//! released through the deferred free list, never modified.

use std::collections::HashMap;

use tracing::debug;

use crate::cursor::Cursor;
use crate::error::{Result, SiloError};
use crate::node::{
    self, Child, Inode, Node, FLAG_BUCKET, FLAG_OVERFLOW,
};
use crate::overflow::{self, OverflowRef};
use crate::page::PageId;
use crate::pager::Pager;
use crate::tx::{Allocator, Tx, TxInner};

const BUCKET_HEADER_LEN: usize = 12;

/// Serialized bucket value stored in the parent tree: root page plus flags.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct BucketHeader {
    pub root: PageId,
    pub flags: u32,
}

impl BucketHeader {
    pub fn encode(&self) -> [u8; BUCKET_HEADER_LEN] {
        let mut buf = [0u8; BUCKET_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.root.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != BUCKET_HEADER_LEN {
            return Err(SiloError::Corrupt("bucket header length mismatch"));
        }
        Ok(Self {
            root: PageId(u64::from_be_bytes(src[0..8].try_into().unwrap())),
            flags: u32::from_be_bytes(src[8..12].try_into().unwrap()),
        })
    }
}

/// Current root of a bucket's tree within a transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RootRef {
    /// Untouched: the committed page is still the root.
    Page(PageId),
    /// Materialized: the root lives in the bucket's node arena.
    Node(usize),
}

/// Per-bucket state owned by a transaction.
pub(crate) struct BucketData {
    pub root: RootRef,
    pub arena: Vec<Node>,
    /// Open nested buckets by name; indices into `TxInner::buckets`.
    pub open_children: HashMap<Vec<u8>, usize>,
    pub deleted: bool,
}

impl BucketData {
    pub fn from_root(root: PageId) -> Self {
        Self {
            root: RootRef::Page(root),
            arena: Vec::new(),
            open_children: HashMap::new(),
            deleted: false,
        }
    }

    fn fresh() -> Self {
        let mut data = Self {
            root: RootRef::Node(0),
            arena: vec![Node::new_leaf(None)],
            open_children: HashMap::new(),
            deleted: false,
        };
        data.arena[0].page_id = PageId::NULL;
        data
    }
}

/// Handle to one bucket inside a transaction.
///
/// Cheap to copy; all state lives in the transaction. Handles to a bucket
/// deleted later in the same transaction report `BucketNotFound`.
#[derive(Copy, Clone)]
pub struct Bucket<'tx, 'db> {
    tx: &'tx Tx<'db>,
    id: usize,
}

impl<'tx, 'db> Bucket<'tx, 'db> {
    pub(crate) fn new(tx: &'tx Tx<'db>, id: usize) -> Self {
        Self { tx, id }
    }

    fn ensure_open(&self) -> Result<()> {
        self.tx.ensure_active()?;
        if self.tx.inner.borrow().buckets[self.id].deleted {
            return Err(SiloError::BucketNotFound);
        }
        Ok(())
    }

    /// Looks up `key`, resolving overflow chains. `Ok(None)` when absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let pager = &self.tx.db.pager;
        let entry = self.tx.inner.borrow().get_entry(pager, self.id, key)?;
        match entry {
            None => Ok(None),
            Some((flags, stored)) => {
                if flags & FLAG_BUCKET != 0 {
                    return Err(SiloError::Incompatible("key names a nested bucket"));
                }
                if flags & FLAG_OVERFLOW != 0 {
                    let vref = OverflowRef::decode(&stored)?;
                    let value = overflow::read_chain(vref, pager.page_size(), &|id| {
                        pager.read_page(id)
                    })?;
                    return Ok(Some(value));
                }
                Ok(Some(stored))
            }
        }
    }

    /// Inserts or replaces `key`. Values larger than the inline ceiling
    /// move to an overflow chain at commit.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        self.ensure_open()?;
        self.tx
            .inner
            .borrow_mut()
            .put_user(&self.tx.db.pager, self.id, key, value)
    }

    /// Removes `key`. Deleting an absent key is a successful no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        self.ensure_open()?;
        self.tx
            .inner
            .borrow_mut()
            .delete_user(&self.tx.db.pager, self.id, key)
    }

    /// Opens an existing nested bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        self.ensure_open()?;
        let id = self
            .tx
            .inner
            .borrow_mut()
            .open_child(&self.tx.db.pager, self.id, name)?;
        Ok(Bucket::new(self.tx, id))
    }

    /// Opens a nested bucket, creating it when absent. Idempotent.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx, 'db>> {
        self.tx.ensure_writable()?;
        self.ensure_open()?;
        let id = self
            .tx
            .inner
            .borrow_mut()
            .create_child(&self.tx.db.pager, self.id, name)?;
        Ok(Bucket::new(self.tx, id))
    }

    /// Deletes a nested bucket and, cascading, everything under it.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        self.ensure_open()?;
        self.tx
            .inner
            .borrow_mut()
            .delete_child(&self.tx.db.pager, self.id, name)
    }

    /// A key-ordered cursor over this bucket.
    ///
    /// Mutating the bucket through the same transaction invalidates the
    /// cursor's position; restart with `seek` or `first` afterwards.
    pub fn cursor(&self) -> Result<Cursor<'tx, 'db>> {
        self.ensure_open()?;
        Ok(Cursor::new(self.tx, self.id))
    }

    /// Visits every entry in key order. Nested bucket entries arrive with a
    /// `None` value.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    ) -> Result<()> {
        let mut cursor = self.cursor()?;
        let mut item = cursor.first()?;
        while let Some((key, value)) = item {
            f(&key, value.as_deref())?;
            item = cursor.next()?;
        }
        Ok(())
    }
}

enum Found {
    Node(usize),
    Page(std::sync::Arc<Vec<u8>>),
}

impl TxInner {
    fn page_size(&self) -> usize {
        self.meta.page_size as usize
    }

    /// Point lookup over the hybrid of materialized nodes and committed
    /// pages. Returns the raw entry: flags plus stored bytes.
    pub(crate) fn get_entry(
        &self,
        pager: &Pager,
        bucket: usize,
        key: &[u8],
    ) -> Result<Option<(u8, Vec<u8>)>> {
        let page_size = self.page_size();
        let mut cur = match self.buckets[bucket].root {
            RootRef::Node(idx) => Found::Node(idx),
            RootRef::Page(id) => Found::Page(pager.read_page(id)?),
        };
        loop {
            match cur {
                Found::Node(idx) => {
                    let node = &self.buckets[bucket].arena[idx];
                    if node.is_leaf {
                        return Ok(node.search(key).ok().map(|i| {
                            let inode = &node.inodes[i];
                            (inode.flags, inode.value.clone())
                        }));
                    }
                    let pos = node.child_index(key);
                    cur = match node.inodes[pos].child {
                        Child::Node(i) => Found::Node(i),
                        Child::Page(p) => Found::Page(pager.read_page(p)?),
                    };
                }
                Found::Page(buf) => {
                    let header = crate::page::PageHeader::decode(&buf)?;
                    match header.kind {
                        crate::page::PageKind::Leaf => {
                            return Ok(match node::leaf_search(&buf, page_size, key)? {
                                Ok(i) => {
                                    let (flags, _, value) = node::leaf_elem(&buf, page_size, i)?;
                                    Some((flags, value.to_vec()))
                                }
                                Err(_) => None,
                            });
                        }
                        crate::page::PageKind::Branch => {
                            let pos = node::branch_child_index(&buf, page_size, key)?;
                            let (_, child) = node::branch_elem(&buf, page_size, pos)?;
                            cur = Found::Page(pager.read_page(child)?);
                        }
                        _ => return Err(SiloError::Corrupt("descent reached non-tree page")),
                    }
                }
            }
        }
    }

    fn materialize_page(
        &mut self,
        pager: &Pager,
        bucket: usize,
        page: PageId,
        parent: Option<usize>,
    ) -> Result<usize> {
        let buf = pager.read_page(page)?;
        let node = Node::from_page(&buf, self.page_size(), parent)?;
        let arena = &mut self.buckets[bucket].arena;
        arena.push(node);
        Ok(arena.len() - 1)
    }

    fn materialize_child(
        &mut self,
        pager: &Pager,
        bucket: usize,
        parent_idx: usize,
        pos: usize,
    ) -> Result<usize> {
        match self.buckets[bucket].arena[parent_idx].inodes[pos].child {
            Child::Node(idx) => Ok(idx),
            Child::Page(page) => {
                let idx = self.materialize_page(pager, bucket, page, Some(parent_idx))?;
                self.buckets[bucket].arena[parent_idx].inodes[pos].child = Child::Node(idx);
                Ok(idx)
            }
        }
    }

    /// Materializes the root-to-leaf path for `key`; returns the leaf.
    fn materialize_path(&mut self, pager: &Pager, bucket: usize, key: &[u8]) -> Result<usize> {
        let mut cur = match self.buckets[bucket].root {
            RootRef::Node(idx) => idx,
            RootRef::Page(page) => {
                let idx = self.materialize_page(pager, bucket, page, None)?;
                self.buckets[bucket].root = RootRef::Node(idx);
                idx
            }
        };
        loop {
            if self.buckets[bucket].arena[cur].is_leaf {
                return Ok(cur);
            }
            let pos = self.buckets[bucket].arena[cur].child_index(key);
            cur = self.materialize_child(pager, bucket, cur, pos)?;
        }
    }

    /// Insert without user-facing checks; used for bucket header rewrites.
    fn put_raw(
        &mut self,
        pager: &Pager,
        bucket: usize,
        flags: u8,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<()> {
        let leaf = self.materialize_path(pager, bucket, key)?;
        self.buckets[bucket].arena[leaf].put_leaf(flags, key, value);
        Ok(())
    }

    pub(crate) fn put_user(
        &mut self,
        pager: &Pager,
        bucket: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.check_key(key)?;
        if value.len() > u32::MAX as usize {
            return Err(SiloError::TooLarge);
        }
        let leaf = self.materialize_path(pager, bucket, key)?;
        if let Ok(pos) = self.buckets[bucket].arena[leaf].search(key) {
            let flags = self.buckets[bucket].arena[leaf].inodes[pos].flags;
            if flags & FLAG_BUCKET != 0 {
                return Err(SiloError::Incompatible("key names a nested bucket"));
            }
            if flags & FLAG_OVERFLOW != 0 {
                let stored = self.buckets[bucket].arena[leaf].inodes[pos].value.clone();
                self.free_overflow(pager, &stored)?;
            }
        }
        self.buckets[bucket].arena[leaf].put_leaf(0, key, value.to_vec());
        Ok(())
    }

    pub(crate) fn delete_user(&mut self, pager: &Pager, bucket: usize, key: &[u8]) -> Result<()> {
        let Some((flags, stored)) = self.get_entry(pager, bucket, key)? else {
            // Absent keys are a successful no-op; nothing is materialized.
            return Ok(());
        };
        if flags & FLAG_BUCKET != 0 {
            return Err(SiloError::Incompatible("cannot delete a bucket as a key"));
        }
        if flags & FLAG_OVERFLOW != 0 {
            self.free_overflow(pager, &stored)?;
        }
        let leaf = self.materialize_path(pager, bucket, key)?;
        self.buckets[bucket].arena[leaf].del_leaf(key);
        Ok(())
    }

    /// Releases the pages of a committed overflow chain at commit time.
    fn free_overflow(&mut self, pager: &Pager, stored: &[u8]) -> Result<()> {
        let vref = OverflowRef::decode(stored)?;
        let pages =
            overflow::chain_pages(vref, pager.page_size(), &|id| pager.read_page(id))?;
        self.freed.extend(pages);
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(SiloError::Invalid("key must not be empty"));
        }
        if key.len() > node::max_key_len(self.page_size()) {
            return Err(SiloError::TooLarge);
        }
        Ok(())
    }

    pub(crate) fn open_child(
        &mut self,
        pager: &Pager,
        parent: usize,
        name: &[u8],
    ) -> Result<usize> {
        if self.buckets[parent].deleted {
            return Err(SiloError::BucketNotFound);
        }
        if let Some(&idx) = self.buckets[parent].open_children.get(name) {
            return Ok(idx);
        }
        match self.get_entry(pager, parent, name)? {
            None => Err(SiloError::BucketNotFound),
            Some((flags, value)) => {
                if flags & FLAG_BUCKET == 0 {
                    return Err(SiloError::Incompatible("key is not a bucket"));
                }
                let header = BucketHeader::decode(&value)?;
                let idx = self.buckets.len();
                self.buckets.push(BucketData::from_root(header.root));
                self.buckets[parent].open_children.insert(name.to_vec(), idx);
                Ok(idx)
            }
        }
    }

    pub(crate) fn create_child(
        &mut self,
        pager: &Pager,
        parent: usize,
        name: &[u8],
    ) -> Result<usize> {
        self.check_key(name)?;
        if self.buckets[parent].deleted {
            return Err(SiloError::BucketNotFound);
        }
        if let Some(&idx) = self.buckets[parent].open_children.get(name) {
            return Ok(idx);
        }
        match self.get_entry(pager, parent, name)? {
            Some((flags, value)) => {
                if flags & FLAG_BUCKET == 0 {
                    return Err(SiloError::Incompatible("key is not a bucket"));
                }
                let header = BucketHeader::decode(&value)?;
                let idx = self.buckets.len();
                self.buckets.push(BucketData::from_root(header.root));
                self.buckets[parent].open_children.insert(name.to_vec(), idx);
                Ok(idx)
            }
            None => {
                debug!(name = %String::from_utf8_lossy(name), "bucket.create");
                let placeholder = BucketHeader {
                    root: PageId::NULL,
                    flags: 0,
                };
                self.put_raw(pager, parent, FLAG_BUCKET, name, placeholder.encode().to_vec())?;
                let idx = self.buckets.len();
                self.buckets.push(BucketData::fresh());
                self.buckets[parent].open_children.insert(name.to_vec(), idx);
                Ok(idx)
            }
        }
    }

    pub(crate) fn delete_child(
        &mut self,
        pager: &Pager,
        parent: usize,
        name: &[u8],
    ) -> Result<()> {
        if self.buckets[parent].deleted {
            return Err(SiloError::BucketNotFound);
        }
        let Some((flags, value)) = self.get_entry(pager, parent, name)? else {
            return Err(SiloError::BucketNotFound);
        };
        if flags & FLAG_BUCKET == 0 {
            return Err(SiloError::Incompatible("key is not a bucket"));
        }
        debug!(name = %String::from_utf8_lossy(name), "bucket.delete");

        if let Some(child) = self.buckets[parent].open_children.remove(name) {
            self.free_bucket_state(pager, child)?;
            self.mark_deleted_recursive(child);
        } else {
            let header = BucketHeader::decode(&value)?;
            if !header.root.is_null() {
                self.free_committed_tree(pager, header.root)?;
            }
        }

        let leaf = self.materialize_path(pager, parent, name)?;
        self.buckets[parent].arena[leaf].del_leaf(name);
        Ok(())
    }

    fn mark_deleted_recursive(&mut self, bucket: usize) {
        self.buckets[bucket].deleted = true;
        let children: Vec<usize> = self.buckets[bucket].open_children.values().copied().collect();
        for child in children {
            self.mark_deleted_recursive(child);
        }
    }

    /// Frees every page reachable from a committed subtree, nested buckets
    /// included. Valid only for subtrees with no open descendants.
    fn free_committed_tree(&mut self, pager: &Pager, root: PageId) -> Result<()> {
        let page_size = self.page_size();
        let mut queue = vec![root];
        while let Some(subtree) = queue.pop() {
            let mut pages = Vec::new();
            let mut headers = Vec::new();
            node::walk_subtree(
                subtree,
                page_size,
                &|id| pager.read_page(id),
                &mut pages,
                &mut headers,
            )?;
            self.freed.extend(pages);
            for (_, value) in headers {
                let header = BucketHeader::decode(&value)?;
                if !header.root.is_null() {
                    queue.push(header.root);
                }
            }
        }
        Ok(())
    }

    /// Frees a bucket's current tree: committed pages plus the pages its
    /// materialized nodes replaced. Consults open children so shared pages
    /// are freed exactly once — an open child's put-time frees must not be
    /// repeated by walking the stale committed image of its entries.
    fn free_bucket_state(&mut self, pager: &Pager, bucket: usize) -> Result<()> {
        match self.buckets[bucket].root {
            RootRef::Page(root) => self.free_committed_of_bucket(pager, bucket, root),
            RootRef::Node(root_idx) => self.free_node_tree(pager, bucket, root_idx),
        }
    }

    /// Frees a committed subtree belonging to `bucket`'s own tree. Bucket
    /// entries found in it are direct children of `bucket`, so the open-
    /// children map decides between freeing live state and committed state.
    fn free_committed_of_bucket(
        &mut self,
        pager: &Pager,
        bucket: usize,
        root: PageId,
    ) -> Result<()> {
        let page_size = self.page_size();
        let mut pages = Vec::new();
        let mut headers = Vec::new();
        node::walk_subtree(
            root,
            page_size,
            &|id| pager.read_page(id),
            &mut pages,
            &mut headers,
        )?;
        self.freed.extend(pages);
        for (name, value) in headers {
            if let Some(&child) = self.buckets[bucket].open_children.get(&name) {
                self.free_bucket_state(pager, child)?;
            } else {
                let header = BucketHeader::decode(&value)?;
                if !header.root.is_null() {
                    self.free_committed_tree(pager, header.root)?;
                }
            }
        }
        Ok(())
    }

    fn free_node_tree(&mut self, pager: &Pager, bucket: usize, idx: usize) -> Result<()> {
        enum Step {
            Overflow(Vec<u8>),
            OpenChild(usize),
            ClosedChild(PageId),
            ChildNode(usize),
            ChildPage(PageId),
        }
        let mut steps = Vec::new();
        let replaced_page = {
            let data = &self.buckets[bucket];
            let node = &data.arena[idx];
            for inode in &node.inodes {
                if node.is_leaf {
                    if inode.flags & FLAG_OVERFLOW != 0 {
                        steps.push(Step::Overflow(inode.value.clone()));
                    } else if inode.flags & FLAG_BUCKET != 0 {
                        if let Some(&child) = data.open_children.get(&inode.key) {
                            steps.push(Step::OpenChild(child));
                        } else {
                            let header = BucketHeader::decode(&inode.value)?;
                            if !header.root.is_null() {
                                steps.push(Step::ClosedChild(header.root));
                            }
                        }
                    }
                } else {
                    match inode.child {
                        Child::Node(i) => steps.push(Step::ChildNode(i)),
                        Child::Page(p) => steps.push(Step::ChildPage(p)),
                    }
                }
            }
            node.page_id
        };
        if !replaced_page.is_null() {
            self.freed.push(replaced_page);
        }
        for step in steps {
            match step {
                Step::Overflow(stored) => self.free_overflow(pager, &stored)?,
                Step::OpenChild(child) => self.free_bucket_state(pager, child)?,
                Step::ClosedChild(root) => self.free_committed_tree(pager, root)?,
                Step::ChildNode(i) => self.free_node_tree(pager, bucket, i)?,
                Step::ChildPage(p) => self.free_committed_of_bucket(pager, bucket, p)?,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Commit-time tree maintenance
    // -----------------------------------------------------------------

    /// Merges underfull nodes back into their siblings.
    fn rebalance_bucket(&mut self, pager: &Pager, bucket: usize) -> Result<()> {
        let mut idx = 0;
        while idx < self.buckets[bucket].arena.len() {
            self.rebalance_node(pager, bucket, idx)?;
            idx += 1;
        }
        Ok(())
    }

    fn rebalance_node(&mut self, pager: &Pager, bucket: usize, idx: usize) -> Result<()> {
        {
            let node = &mut self.buckets[bucket].arena[idx];
            if node.dead || !node.unbalanced {
                return Ok(());
            }
            node.unbalanced = false;
        }
        let page_size = self.page_size();
        let (size, count, is_leaf, parent, page_id) = {
            let node = &self.buckets[bucket].arena[idx];
            (
                node.size(),
                node.inodes.len(),
                node.is_leaf,
                node.parent,
                node.page_id,
            )
        };
        let min_keys = if is_leaf { 1 } else { 2 };
        if size > node::min_fill(page_size) && count >= min_keys {
            return Ok(());
        }

        let Some(parent_idx) = parent else {
            // Root: collapse a single-child branch; replace an emptied
            // branch with a fresh empty leaf. A root leaf is fine as is.
            if !is_leaf && count == 1 {
                let child_idx = match self.buckets[bucket].arena[idx].inodes[0].child {
                    Child::Node(i) => i,
                    Child::Page(p) => self.materialize_page(pager, bucket, p, None)?,
                };
                self.buckets[bucket].arena[child_idx].parent = None;
                if !page_id.is_null() {
                    self.freed.push(page_id);
                }
                self.buckets[bucket].arena[idx].dead = true;
                self.buckets[bucket].root = RootRef::Node(child_idx);
                self.buckets[bucket].arena[child_idx].unbalanced = true;
                return self.rebalance_node(pager, bucket, child_idx);
            }
            if !is_leaf && count == 0 {
                if !page_id.is_null() {
                    self.freed.push(page_id);
                }
                self.buckets[bucket].arena[idx].dead = true;
                let leaf = Node::new_leaf(None);
                self.buckets[bucket].arena.push(leaf);
                let leaf_idx = self.buckets[bucket].arena.len() - 1;
                self.buckets[bucket].root = RootRef::Node(leaf_idx);
            }
            return Ok(());
        };

        let anchor = self.buckets[bucket].arena[idx].anchor.clone();
        let ppos = match self.buckets[bucket].arena[parent_idx].search(&anchor) {
            Ok(pos) => pos,
            Err(_) => return Err(SiloError::Corrupt("node anchor missing from parent")),
        };

        if count == 0 {
            self.buckets[bucket].arena[parent_idx].inodes.remove(ppos);
            self.buckets[bucket].arena[parent_idx].unbalanced = true;
            if !page_id.is_null() {
                self.freed.push(page_id);
            }
            self.buckets[bucket].arena[idx].dead = true;
            return self.rebalance_node(pager, bucket, parent_idx);
        }

        if self.buckets[bucket].arena[parent_idx].inodes.len() < 2 {
            // No sibling to merge with; the parent is itself collapsible.
            self.buckets[bucket].arena[parent_idx].unbalanced = true;
            return self.rebalance_node(pager, bucket, parent_idx);
        }

        if ppos == 0 {
            // Merge the next sibling into this node.
            let sibling = self.materialize_child(pager, bucket, parent_idx, 1)?;
            let moved = std::mem::take(&mut self.buckets[bucket].arena[sibling].inodes);
            for inode in &moved {
                if let Child::Node(c) = inode.child {
                    self.buckets[bucket].arena[c].parent = Some(idx);
                }
            }
            let sib_page = self.buckets[bucket].arena[sibling].page_id;
            self.buckets[bucket].arena[idx].inodes.extend(moved);
            self.buckets[bucket].arena[sibling].dead = true;
            if !sib_page.is_null() {
                self.freed.push(sib_page);
            }
            self.buckets[bucket].arena[parent_idx].inodes.remove(1);
        } else {
            // Merge this node into the previous sibling.
            let sibling = self.materialize_child(pager, bucket, parent_idx, ppos - 1)?;
            let moved = std::mem::take(&mut self.buckets[bucket].arena[idx].inodes);
            for inode in &moved {
                if let Child::Node(c) = inode.child {
                    self.buckets[bucket].arena[c].parent = Some(sibling);
                }
            }
            self.buckets[bucket].arena[sibling].inodes.extend(moved);
            self.buckets[bucket].arena[idx].dead = true;
            if !page_id.is_null() {
                self.freed.push(page_id);
            }
            self.buckets[bucket].arena[parent_idx].inodes.remove(ppos);
        }
        self.buckets[bucket].arena[parent_idx].unbalanced = true;
        self.rebalance_node(pager, bucket, parent_idx)
    }

    /// Writes a bucket's dirty state to fresh pages, children first, and
    /// returns the header naming its new root.
    pub(crate) fn spill_bucket(
        &mut self,
        pager: &Pager,
        bucket: usize,
        alloc: &mut Allocator,
        dirty: &mut Vec<(PageId, Vec<u8>)>,
    ) -> Result<BucketHeader> {
        let mut children: Vec<(Vec<u8>, usize)> = self.buckets[bucket]
            .open_children
            .iter()
            .map(|(name, &idx)| (name.clone(), idx))
            .collect();
        children.sort();
        for (name, child) in children {
            if self.buckets[child].deleted {
                continue;
            }
            if matches!(self.buckets[child].root, RootRef::Page(_)) {
                continue; // untouched
            }
            let header = self.spill_bucket(pager, child, alloc, dirty)?;
            self.put_raw(pager, bucket, FLAG_BUCKET, &name, header.encode().to_vec())?;
        }

        self.rebalance_bucket(pager, bucket)?;

        match self.buckets[bucket].root {
            RootRef::Page(root) => Ok(BucketHeader { root, flags: 0 }),
            RootRef::Node(mut root_idx) => {
                let root = loop {
                    let parts = self.spill_node(pager, bucket, root_idx, alloc, dirty)?;
                    if parts.len() == 1 {
                        break parts.into_iter().next().expect("one part").1;
                    }
                    let mut branch = Node::new_branch(None);
                    branch.inodes = parts
                        .into_iter()
                        .map(|(key, id)| Inode::branch(key, Child::Page(id)))
                        .collect();
                    self.buckets[bucket].arena.push(branch);
                    root_idx = self.buckets[bucket].arena.len() - 1;
                };
                self.buckets[bucket].root = RootRef::Page(root);
                Ok(BucketHeader { root, flags: 0 })
            }
        }
    }

    /// Post-order spill of one node: children first, then overflow
    /// conversion, split, encode, allocate. Returns the (separator, page)
    /// pairs that replace this node in its parent.
    fn spill_node(
        &mut self,
        pager: &Pager,
        bucket: usize,
        idx: usize,
        alloc: &mut Allocator,
        dirty: &mut Vec<(PageId, Vec<u8>)>,
    ) -> Result<Vec<(Vec<u8>, PageId)>> {
        let page_size = self.page_size();
        let salt = self.meta.salt;
        let mut node = std::mem::replace(
            &mut self.buckets[bucket].arena[idx],
            Node::new_leaf(None),
        );
        self.buckets[bucket].arena[idx].dead = true;

        if !node.is_leaf {
            let mut resolved: Vec<Inode> = Vec::with_capacity(node.inodes.len());
            for inode in node.inodes {
                match inode.child {
                    Child::Page(page) => {
                        resolved.push(Inode::branch(inode.key, Child::Page(page)));
                    }
                    Child::Node(child_idx) => {
                        let parts = self.spill_node(pager, bucket, child_idx, alloc, dirty)?;
                        for (key, id) in parts {
                            resolved.push(Inode::branch(key, Child::Page(id)));
                        }
                    }
                }
            }
            node.inodes = resolved;
        } else {
            // Move oversized values out to overflow chains before sizing.
            let ceiling = node::max_entry_size(page_size);
            for inode in &mut node.inodes {
                if inode.flags == 0
                    && node::leaf_entry_size(inode.key.len(), inode.value.len()) > ceiling
                {
                    let value = std::mem::take(&mut inode.value);
                    let vref = overflow::write_chain(
                        &value,
                        page_size,
                        salt,
                        &mut || Ok(alloc.allocate(1)),
                        dirty,
                    )?;
                    inode.value = vref.encode().to_vec();
                    inode.flags = FLAG_OVERFLOW;
                }
            }
        }

        if !node.page_id.is_null() {
            self.freed.push(node.page_id);
        }

        let is_leaf = node.is_leaf;
        let parts = node.split_inodes(page_size);
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            let id = alloc.allocate(1);
            let key = part
                .first()
                .map(|inode| inode.key.clone())
                .unwrap_or_default();
            let buf = node::encode_node(id, page_size, salt, is_leaf, &part)?;
            dirty.push((id, buf));
            out.push((key, id));
        }
        Ok(out)
    }
}
