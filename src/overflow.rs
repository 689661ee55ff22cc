//! Overflow value chains.
//!
//! A value too large to inline in a leaf entry is stored in a linked chain
//! of overflow pages; the leaf keeps only a fixed-size reference. Chain
//! pages carry `{next, used, reserved}` ahead of their data slice, and the
//! reference carries a CRC over the value bytes so a chain stitched from the
//! wrong pages is rejected even when every page checksum passes.

use std::cmp::min;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Result, SiloError};
use crate::page::{self, PageHeader, PageId, PageKind, PAGE_HDR_LEN};

const OVERFLOW_HEADER_LEN: usize = 16;

/// Serialized length of an [`OverflowRef`] inside a leaf entry.
pub(crate) const OVERFLOW_REF_LEN: usize = 20;

/// Leaf-resident reference to an overflow chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct OverflowRef {
    pub start_page: PageId,
    pub n_pages: u32,
    pub len: u32,
    pub crc32: u32,
}

impl OverflowRef {
    pub fn encode(&self) -> [u8; OVERFLOW_REF_LEN] {
        let mut buf = [0u8; OVERFLOW_REF_LEN];
        buf[0..8].copy_from_slice(&self.start_page.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.n_pages.to_be_bytes());
        buf[12..16].copy_from_slice(&self.len.to_be_bytes());
        buf[16..20].copy_from_slice(&self.crc32.to_be_bytes());
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != OVERFLOW_REF_LEN {
            return Err(SiloError::Corrupt("overflow reference length mismatch"));
        }
        Ok(Self {
            start_page: PageId(u64::from_be_bytes(src[0..8].try_into().unwrap())),
            n_pages: u32::from_be_bytes(src[8..12].try_into().unwrap()),
            len: u32::from_be_bytes(src[12..16].try_into().unwrap()),
            crc32: u32::from_be_bytes(src[16..20].try_into().unwrap()),
        })
    }
}

/// Payload bytes one overflow page can carry.
pub(crate) fn data_capacity(page_size: usize) -> usize {
    page_size - PAGE_HDR_LEN - OVERFLOW_HEADER_LEN
}

/// Writes `bytes` into a freshly allocated chain.
///
/// `alloc` hands out one page id per call; encoded pages land in `dirty`.
pub(crate) fn write_chain(
    bytes: &[u8],
    page_size: usize,
    salt: u64,
    alloc: &mut dyn FnMut() -> Result<PageId>,
    dirty: &mut Vec<(PageId, Vec<u8>)>,
) -> Result<OverflowRef> {
    if bytes.len() > u32::MAX as usize {
        return Err(SiloError::TooLarge);
    }
    let capacity = data_capacity(page_size);
    let needed = if bytes.is_empty() {
        1
    } else {
        (bytes.len() + capacity - 1) / capacity
    };
    let mut pages = Vec::with_capacity(needed);
    for _ in 0..needed {
        pages.push(alloc()?);
    }

    let mut checksum = crc32fast::Hasher::new();
    let mut offset = 0usize;
    for (idx, &page_id) in pages.iter().enumerate() {
        let next = if idx + 1 < pages.len() {
            pages[idx + 1]
        } else {
            PageId::NULL
        };
        let chunk_len = min(bytes.len() - offset, capacity);
        let chunk = &bytes[offset..offset + chunk_len];
        checksum.update(chunk);

        let mut buf = vec![0u8; page_size];
        let header = PageHeader::new(page_id, PageKind::Overflow, page_size as u32, salt)?;
        header.encode(&mut buf[..PAGE_HDR_LEN])?;
        let payload = &mut buf[PAGE_HDR_LEN..];
        payload[0..8].copy_from_slice(&next.0.to_be_bytes());
        payload[8..12].copy_from_slice(&(chunk_len as u32).to_be_bytes());
        // reserved 12..16 already zeroed
        payload[OVERFLOW_HEADER_LEN..OVERFLOW_HEADER_LEN + chunk_len].copy_from_slice(chunk);
        page::seal_page(&mut buf, page_id, salt)?;
        dirty.push((page_id, buf));
        offset += chunk_len;
    }
    debug_assert_eq!(offset, bytes.len());
    trace!(pages = pages.len(), len = bytes.len(), "overflow.write");
    Ok(OverflowRef {
        start_page: pages[0],
        n_pages: pages.len() as u32,
        len: bytes.len() as u32,
        crc32: checksum.finalize(),
    })
}

/// Reads a chain back into one contiguous value.
pub(crate) fn read_chain(
    vref: OverflowRef,
    page_size: usize,
    read: &dyn Fn(PageId) -> Result<Arc<Vec<u8>>>,
) -> Result<Vec<u8>> {
    let mut dst = Vec::with_capacity(vref.len as usize);
    let mut current = vref.start_page;
    let mut pages_left = vref.n_pages;
    let mut remaining = vref.len as usize;
    let mut checksum = crc32fast::Hasher::new();
    while pages_left > 0 {
        if current.is_null() {
            return Err(SiloError::Corrupt("overflow chain terminated early"));
        }
        let buf = read(current)?;
        let (next, data) = decode_page(&buf, page_size)?;
        if data.len() > remaining {
            return Err(SiloError::Corrupt("overflow chain exceeded reported length"));
        }
        dst.extend_from_slice(data);
        checksum.update(data);
        remaining -= data.len();
        pages_left -= 1;
        current = next;
    }
    if !current.is_null() {
        return Err(SiloError::Corrupt("overflow chain longer than n_pages"));
    }
    if remaining != 0 {
        return Err(SiloError::Corrupt("overflow chain shorter than reported length"));
    }
    if checksum.finalize() != vref.crc32 {
        return Err(SiloError::Corrupt("overflow value checksum mismatch"));
    }
    trace!(pages = vref.n_pages, len = vref.len, "overflow.read");
    Ok(dst)
}

/// Collects the page ids of a chain, for freeing.
pub(crate) fn chain_pages(
    vref: OverflowRef,
    page_size: usize,
    read: &dyn Fn(PageId) -> Result<Arc<Vec<u8>>>,
) -> Result<Vec<PageId>> {
    let mut pages = Vec::with_capacity(vref.n_pages as usize);
    let mut current = vref.start_page;
    let mut remaining = vref.n_pages;
    while remaining > 0 {
        if current.is_null() {
            return Err(SiloError::Corrupt("overflow free chain shorter than expected"));
        }
        pages.push(current);
        let buf = read(current)?;
        let (next, _) = decode_page(&buf, page_size)?;
        current = next;
        remaining -= 1;
    }
    if !current.is_null() {
        return Err(SiloError::Corrupt("overflow free chain longer than expected"));
    }
    Ok(pages)
}

fn decode_page(data: &[u8], page_size: usize) -> Result<(PageId, &[u8])> {
    if data.len() < page_size {
        return Err(SiloError::Corrupt("overflow page truncated"));
    }
    let header = PageHeader::decode(&data[..PAGE_HDR_LEN])?;
    if header.kind != PageKind::Overflow {
        return Err(SiloError::Corrupt("page is not overflow kind"));
    }
    let payload = &data[PAGE_HDR_LEN..page_size];
    let next = PageId(u64::from_be_bytes(payload[..8].try_into().unwrap()));
    let used = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
    if payload[12..16] != [0; 4] {
        return Err(SiloError::Corrupt("overflow reserved bytes not zero"));
    }
    if used > data_capacity(page_size) {
        return Err(SiloError::Corrupt("overflow used bytes exceed capacity"));
    }
    Ok((next, &payload[OVERFLOW_HEADER_LEN..OVERFLOW_HEADER_LEN + used]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Sandbox {
        page_size: usize,
        salt: u64,
        next_id: u64,
        pages: HashMap<PageId, Arc<Vec<u8>>>,
    }

    impl Sandbox {
        fn new() -> Self {
            Self {
                page_size: 512,
                salt: 42,
                next_id: 2,
                pages: HashMap::new(),
            }
        }

        fn write(&mut self, bytes: &[u8]) -> OverflowRef {
            let mut dirty = Vec::new();
            let next_id = &mut self.next_id;
            let mut alloc = || {
                let id = PageId(*next_id);
                *next_id += 1;
                Ok(id)
            };
            let vref =
                write_chain(bytes, self.page_size, self.salt, &mut alloc, &mut dirty).unwrap();
            for (id, buf) in dirty {
                self.pages.insert(id, Arc::new(buf));
            }
            vref
        }

        fn reader(&self) -> impl Fn(PageId) -> Result<Arc<Vec<u8>>> + '_ {
            move |id| {
                self.pages
                    .get(&id)
                    .cloned()
                    .ok_or(SiloError::Corrupt("missing page"))
            }
        }
    }

    #[test]
    fn chain_roundtrip_multi_page() {
        let mut sandbox = Sandbox::new();
        let value: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let vref = sandbox.write(&value);
        assert!(vref.n_pages > 1);
        let back = read_chain(vref, sandbox.page_size, &sandbox.reader()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn empty_value_occupies_one_page() {
        let mut sandbox = Sandbox::new();
        let vref = sandbox.write(&[]);
        assert_eq!(vref.n_pages, 1);
        assert_eq!(
            read_chain(vref, sandbox.page_size, &sandbox.reader()).unwrap(),
            Vec::<u8>::new()
        );
    }

    #[test]
    fn chain_pages_walks_every_link() {
        let mut sandbox = Sandbox::new();
        let value = vec![7u8; 1500];
        let vref = sandbox.write(&value);
        let pages = chain_pages(vref, sandbox.page_size, &sandbox.reader()).unwrap();
        assert_eq!(pages.len(), vref.n_pages as usize);
    }

    #[test]
    fn corrupted_value_is_detected() {
        let mut sandbox = Sandbox::new();
        let value = vec![1u8; 600];
        let mut vref = sandbox.write(&value);
        vref.crc32 ^= 1;
        assert!(matches!(
            read_chain(vref, sandbox.page_size, &sandbox.reader()),
            Err(SiloError::Corrupt(_))
        ));
    }
}
