//! The page store: a fixed-size page abstraction over a single file.
//!
//! Owns the file handle, the exclusive OS file lock, the LRU page cache,
//! and the durable commit path. All reads are positioned, so any number of
//! reader threads share the handle without a seek cursor to race on. The
//! write path is only ever driven by the single active write transaction:
//! dirty pages first, `sync_data`, then the meta slot flip, then `sync_data`
//! again — the flip is the sole durability boundary.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::db::Options;
use crate::error::{Result, SiloError};
use crate::meta::{Meta, META_SLOTS};
use crate::node;
use crate::page::{self, PageHeader, PageId, MIN_PAGE_SIZE, PAGE_HDR_LEN};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const META_PROBE_SIZES: [usize; 8] = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

pub(crate) struct Pager {
    file: File,
    page_size: usize,
    salt: u64,
    cache: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
}

impl Pager {
    /// Opens or creates the database file and returns the authoritative meta.
    pub fn open(path: &Path, opts: &Options) -> Result<(Self, Meta)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock::acquire_exclusive(&file, opts.timeout)?;

        let file_len = file.metadata()?.len();
        let meta = if file_len == 0 {
            Self::init_file(&file, opts)?
        } else {
            Self::recover_meta(&file)?
        };

        if let Some(requested) = opts.page_size {
            if requested != meta.page_size as usize {
                return Err(SiloError::Invalid("page size does not match existing file"));
            }
        }

        let cache_size = NonZeroUsize::new(opts.cache_pages)
            .ok_or(SiloError::Invalid("page cache size must be non-zero"))?;
        debug!(
            page_size = meta.page_size,
            tx_id = meta.tx_id,
            page_count = meta.page_count,
            "pager.open"
        );
        Ok((
            Self {
                file,
                page_size: meta.page_size as usize,
                salt: meta.salt,
                cache: Mutex::new(LruCache::new(cache_size)),
            },
            meta,
        ))
    }

    /// Lays out a brand-new database: an empty directory leaf on page 2 and
    /// both meta slots pointing at it.
    fn init_file(file: &File, opts: &Options) -> Result<Meta> {
        let page_size = opts.page_size.unwrap_or(page::DEFAULT_PAGE_SIZE);
        if page_size < MIN_PAGE_SIZE || page_size > 65536 || !page_size.is_power_of_two() {
            return Err(SiloError::Invalid(
                "page size must be a power of two between 512 and 65536",
            ));
        }
        let salt: u64 = rand::random();

        let root = PageId(2);
        let leaf = node::encode_empty_leaf(root, page_size, salt)?;
        write_at(file, &leaf, root.0 * page_size as u64)?;

        let mut meta = Meta {
            page_size: page_size as u32,
            salt,
            tx_id: 0,
            directory_root: root,
            freelist_head: PageId::NULL,
            page_count: 3,
        };
        let mut buf = vec![0u8; page_size];
        for slot_tx in 0..2u64 {
            meta.tx_id = slot_tx;
            let slot = Meta::slot_for(slot_tx);
            meta.encode_page(slot, &mut buf)?;
            write_at(file, &buf, slot.0 * page_size as u64)?;
        }
        file.sync_data()?;
        info!(page_size, "pager.init");
        Ok(meta)
    }

    /// Reads both meta slots and picks the authoritative one.
    ///
    /// Slot 0 sits at offset zero, so its own header reveals the page size.
    /// When slot 0 is torn, slot 1's offset is unknown and a fixed set of
    /// candidate sizes is probed instead.
    fn recover_meta(file: &File) -> Result<Meta> {
        let slot0 = Self::read_meta_slot(file, META_SLOTS[0], None);
        let known_size = slot0.as_ref().ok().map(|m| m.page_size as usize);
        let slot1 = match known_size {
            Some(size) => Self::read_meta_slot(file, META_SLOTS[1], Some(size)),
            None => META_PROBE_SIZES
                .iter()
                .map(|&size| Self::read_meta_slot(file, META_SLOTS[1], Some(size)))
                .find(|r| r.is_ok())
                .unwrap_or(Err(SiloError::Corrupt("meta slot 1 unreadable"))),
        };
        let meta = Meta::select(slot0, slot1)?;
        Ok(meta)
    }

    fn read_meta_slot(file: &File, slot: PageId, size_hint: Option<usize>) -> Result<Meta> {
        let page_size = match size_hint {
            Some(size) => size,
            None => {
                let mut hdr = [0u8; PAGE_HDR_LEN];
                read_exact_at(file, &mut hdr, 0)?;
                PageHeader::decode(&hdr)?.page_size as usize
            }
        };
        if page_size < MIN_PAGE_SIZE || page_size > 65536 {
            return Err(SiloError::Corrupt("meta page size out of range"));
        }
        let mut buf = vec![0u8; page_size];
        read_exact_at(file, &mut buf, slot.0 * page_size as u64)?;
        let meta = Meta::decode_page(slot, &buf)?;
        if meta.page_size as usize != page_size {
            return Err(SiloError::Corrupt("meta slot offset inconsistent"));
        }
        Ok(meta)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads and verifies one non-meta page, through the LRU cache.
    pub fn read_page(&self, id: PageId) -> Result<Arc<Vec<u8>>> {
        if id.0 < 2 {
            return Err(SiloError::Invalid("meta slots are not readable pages"));
        }
        if let Some(buf) = self.cache.lock().get(&id.0) {
            return Ok(Arc::clone(buf));
        }
        let mut buf = vec![0u8; self.page_size];
        read_exact_at(&self.file, &mut buf, id.0 * self.page_size as u64)?;
        page::verify_page(&buf, id, self.salt, self.page_size)?;
        let buf = Arc::new(buf);
        self.cache.lock().put(id.0, Arc::clone(&buf));
        Ok(buf)
    }

    /// Writes a batch of sealed page images at their slots. Not durable
    /// until [`Pager::sync`].
    pub fn write_pages(&self, pages: &[(PageId, Vec<u8>)]) -> Result<()> {
        for (id, buf) in pages {
            debug_assert_eq!(buf.len(), self.page_size);
            debug_assert!(id.0 >= 2, "meta slots are written via write_meta");
            write_at(&self.file, buf, id.0 * self.page_size as u64)?;
        }
        Ok(())
    }

    /// Encodes and writes `meta` into its alternating slot. Not durable
    /// until [`Pager::sync`].
    pub fn write_meta(&self, meta: &Meta) -> Result<()> {
        let slot = Meta::slot_for(meta.tx_id);
        let mut buf = vec![0u8; self.page_size];
        meta.encode_page(slot, &mut buf)?;
        write_at(&self.file, &buf, slot.0 * self.page_size as u64)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Drops cached images for pages whose slots are being rewritten.
    /// Recycled free-list pages would otherwise serve stale bytes.
    pub fn purge_cached(&self, ids: impl IntoIterator<Item = PageId>) {
        let mut cache = self.cache.lock();
        for id in ids {
            cache.pop(&id.0);
        }
    }
}

fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)?;
        Ok(())
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                return Err(SiloError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }
        Ok(())
    }
}

fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)?;
        Ok(())
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut written = 0usize;
        while written < buf.len() {
            let n = file.seek_write(&buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(SiloError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            written += n;
        }
        Ok(())
    }
}

/// Exclusive advisory lock on the database file, retried until the caller's
/// timeout. The lock lives as long as the file handle; closing releases it.
#[allow(unsafe_code)]
mod lock {
    use std::fs::File;
    use std::io;
    use std::time::{Duration, Instant};

    use tracing::warn;

    use crate::error::{Result, SiloError};

    pub fn acquire_exclusive(file: &File, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match try_lock(file) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    if Instant::now() >= deadline {
                        warn!(timeout_ms = timeout.as_millis() as u64, "pager.lock_timeout");
                        return Err(SiloError::Busy);
                    }
                    std::thread::sleep(super::LOCK_RETRY_INTERVAL.min(
                        deadline.saturating_duration_since(Instant::now()),
                    ));
                }
                Err(err) => return Err(SiloError::Io(err)),
            }
        }
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<bool> {
        use std::os::fd::AsRawFd;
        // SAFETY: flock on an owned, open descriptor; no memory is involved.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<bool> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };
        use windows_sys::Win32::System::IO::OVERLAPPED;

        // SAFETY: LockFileEx on an owned, open handle with a zeroed OVERLAPPED.
        let ok = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            LockFileEx(
                file.as_raw_handle() as _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Options;
    use tempfile::tempdir;

    #[test]
    fn open_creates_and_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.db");

        let first_meta = {
            let (_pager, meta) = Pager::open(&path, &Options::default()).unwrap();
            meta
        };
        assert_eq!(first_meta.tx_id, 1);
        assert_eq!(first_meta.directory_root, PageId(2));
        assert_eq!(first_meta.page_count, 3);

        let (_pager, meta) = Pager::open(&path, &Options::default()).unwrap();
        assert_eq!(meta, first_meta);
    }

    #[test]
    fn read_page_verifies_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let (pager, meta) = Pager::open(&path, &Options::default()).unwrap();

        let root = pager.read_page(meta.directory_root).unwrap();
        assert_eq!(root.len(), pager.page_size());

        // Flip a payload byte on disk; the cached copy must be bypassed.
        pager.purge_cached([meta.directory_root]);
        let offset = meta.directory_root.0 * pager.page_size() as u64 + PAGE_HDR_LEN as u64 + 7;
        write_at(&pager.file, &[0xFF], offset).unwrap();
        assert!(matches!(
            pager.read_page(meta.directory_root),
            Err(SiloError::Corrupt(_))
        ));
    }

    #[test]
    fn meta_slots_are_not_readable_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let (pager, _meta) = Pager::open(&path, &Options::default()).unwrap();
        assert!(pager.read_page(PageId(0)).is_err());
        assert!(pager.read_page(PageId(1)).is_err());
    }

    #[test]
    fn mismatched_page_size_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.db");
        drop(Pager::open(&path, &Options::default()).unwrap());

        let opts = Options::default().page_size(8192);
        assert!(matches!(
            Pager::open(&path, &opts),
            Err(SiloError::Invalid(_))
        ));
    }

    #[test]
    fn torn_primary_slot_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let (pager, meta) = Pager::open(&path, &Options::default()).unwrap();
        let page_size = pager.page_size();
        drop(pager);

        // Tear whichever slot is authoritative; the other must take over.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let slot = Meta::slot_for(meta.tx_id);
        write_at(&file, &[0xFF; 64], slot.0 * page_size as u64).unwrap();
        drop(file);

        let (_pager, recovered) = Pager::open(&path, &Options::default()).unwrap();
        assert_eq!(recovered.tx_id, meta.tx_id - 1);
        assert_eq!(recovered.directory_root, meta.directory_root);
    }
}
