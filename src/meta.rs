//! The double-buffered meta record.
//!
//! Pages 0 and 1 each hold one full copy of the database meta. A commit
//! writes the new meta into slot `tx_id % 2`, alternating between the two,
//! so a crash mid-write can only tear the slot being replaced. On open the
//! slot with a valid checksum and the higher transaction id wins; the other
//! slot is the rollback fallback.

use tracing::warn;

use crate::error::{Result, SiloError};
use crate::page::{self, PageHeader, PageId, PageKind, TxId, PAGE_HDR_LEN};

/// Page ids of the two alternating meta slots.
pub(crate) const META_SLOTS: [PageId; 2] = [PageId(0), PageId(1)];

const META_PAYLOAD_LEN: usize = 32;

/// The root record naming the current state of the whole database.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Meta {
    /// Size of every page in the file. Fixed at creation.
    pub page_size: u32,
    /// Random value mixed into every page checksum, fixed at creation.
    pub salt: u64,
    /// Id of the transaction that produced this meta.
    pub tx_id: TxId,
    /// Root page of the bucket directory tree.
    pub directory_root: PageId,
    /// Head of the persisted free-list chain, null when empty.
    pub freelist_head: PageId,
    /// Total number of pages in the file, including the meta slots.
    pub page_count: u64,
}

impl Meta {
    /// The meta slot the next commit of `tx_id` must overwrite.
    pub fn slot_for(tx_id: TxId) -> PageId {
        META_SLOTS[(tx_id % 2) as usize]
    }

    /// Encodes this meta into a full page image for the given slot.
    pub fn encode_page(&self, slot: PageId, buf: &mut [u8]) -> Result<()> {
        let page_size = self.page_size as usize;
        if buf.len() < page_size {
            return Err(SiloError::Invalid("meta page buffer too small"));
        }
        buf[..page_size].fill(0);
        let header = PageHeader::new(slot, PageKind::Meta, self.page_size, self.salt)?;
        header.encode(&mut buf[..PAGE_HDR_LEN])?;
        let payload = &mut buf[PAGE_HDR_LEN..PAGE_HDR_LEN + META_PAYLOAD_LEN];
        payload[0..8].copy_from_slice(&self.tx_id.to_be_bytes());
        payload[8..16].copy_from_slice(&self.directory_root.0.to_be_bytes());
        payload[16..24].copy_from_slice(&self.freelist_head.0.to_be_bytes());
        payload[24..32].copy_from_slice(&self.page_count.to_be_bytes());
        page::seal_page(&mut buf[..page_size], slot, self.salt)?;
        Ok(())
    }

    /// Decodes and validates one meta slot.
    ///
    /// Self-validating: the salt and page size are taken from the slot's own
    /// header, then the checksum is verified against them, so no prior
    /// knowledge of the database parameters is required.
    pub fn decode_page(slot: PageId, buf: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(buf)?;
        if header.kind != PageKind::Meta {
            return Err(SiloError::Corrupt("meta slot holds non-meta page"));
        }
        if header.page_no != slot {
            return Err(SiloError::Corrupt("meta page number mismatch"));
        }
        let page_size = header.page_size as usize;
        if buf.len() < page_size {
            return Err(SiloError::Corrupt("meta page truncated"));
        }
        let mut scratch = buf[..page_size].to_vec();
        page::clear_crc32(&mut scratch)?;
        if page::page_crc32(slot.0, header.salt, &scratch) != header.crc32 {
            return Err(SiloError::Corrupt("meta page checksum mismatch"));
        }
        let payload = &buf[PAGE_HDR_LEN..PAGE_HDR_LEN + META_PAYLOAD_LEN];
        Ok(Self {
            page_size: header.page_size,
            salt: header.salt,
            tx_id: u64::from_be_bytes(payload[0..8].try_into().unwrap()),
            directory_root: PageId(u64::from_be_bytes(payload[8..16].try_into().unwrap())),
            freelist_head: PageId(u64::from_be_bytes(payload[16..24].try_into().unwrap())),
            page_count: u64::from_be_bytes(payload[24..32].try_into().unwrap()),
        })
    }

    /// Picks the authoritative meta out of the two decoded slots.
    ///
    /// Higher transaction id with a valid checksum wins. A single torn slot
    /// is tolerated and logged; two torn slots mean the file is not a
    /// recoverable database.
    pub fn select(slot0: Result<Self>, slot1: Result<Self>) -> Result<Self> {
        match (slot0, slot1) {
            (Ok(a), Ok(b)) => {
                if a.page_size != b.page_size || a.salt != b.salt {
                    return Err(SiloError::Corrupt("meta slots disagree on file identity"));
                }
                Ok(if a.tx_id >= b.tx_id { a } else { b })
            }
            (Ok(meta), Err(err)) => {
                warn!(slot = 1, %err, "meta.slot_invalid");
                Ok(meta)
            }
            (Err(err), Ok(meta)) => {
                warn!(slot = 0, %err, "meta.slot_invalid");
                Ok(meta)
            }
            (Err(_), Err(_)) => Err(SiloError::Corrupt("both meta slots invalid")),
        }
    }
}
