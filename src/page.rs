//! On-disk page metadata shared by every component that touches the file.
//!
//! Every page in the database starts with the same fixed-size header. The
//! header carries enough redundancy (magic, echoed page number, salt) that a
//! page read from the wrong offset, from a different database, or after a
//! torn write is rejected before any payload byte is interpreted.

use std::convert::TryFrom;
use std::fmt;

use crate::error::{Result, SiloError};

/// Stable identifier of a page inside the database file.
///
/// Page ids 0 and 1 are the two meta slots. Id 0 doubles as the null link in
/// chain pointers and empty roots, which is unambiguous because no link may
/// legally target a meta page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl PageId {
    /// The null link value.
    pub const NULL: PageId = PageId(0);

    /// True when this id is used as a null link.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing transaction identifier.
pub type TxId = u64;

pub(crate) const PAGE_MAGIC: [u8; 4] = *b"SILO";
pub(crate) const PAGE_FORMAT_VERSION: u16 = 1;

/// Default page size for newly created databases.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size the engine accepts.
pub const MIN_PAGE_SIZE: usize = 512;

/// Length of the fixed header at the start of every page.
pub const PAGE_HDR_LEN: usize = 32;

/// Byte offsets for fixed header fields.
pub(crate) mod header {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const PAGE_KIND: usize = 6;
    pub const RESERVED: usize = 7;
    pub const PAGE_SIZE: Range<usize> = 8..12;
    pub const PAGE_NO: Range<usize> = 12..20;
    pub const SALT: Range<usize> = 20..28;
    pub const CRC32: Range<usize> = 28..32;
}

/// Discriminates the payload layout of a page.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// One of the two alternating meta slots.
    Meta = 1,
    /// A link in the persisted free-list chain.
    FreeList = 2,
    /// B+tree leaf holding (key, value) entries.
    Leaf = 3,
    /// B+tree branch holding (separator, child) entries.
    Branch = 4,
    /// A link in an overflow value chain.
    Overflow = 5,
}

impl PageKind {
    pub(crate) const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = SiloError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Meta),
            2 => Ok(PageKind::FreeList),
            3 => Ok(PageKind::Leaf),
            4 => Ok(PageKind::Branch),
            5 => Ok(PageKind::Overflow),
            _ => Err(SiloError::Corrupt("unknown page kind")),
        }
    }
}

/// The fixed header present at the start of every page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    pub format_version: u16,
    pub kind: PageKind,
    pub page_size: u32,
    pub page_no: PageId,
    pub salt: u64,
    pub crc32: u32,
}

impl PageHeader {
    pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(SiloError::Invalid("page size smaller than header"));
        }
        Ok(Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            page_size,
            page_no,
            salt,
            crc32: 0,
        })
    }

    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(SiloError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::RESERVED] = 0;
        hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
        hdr[header::SALT].copy_from_slice(&self.salt.to_be_bytes());
        hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(SiloError::Corrupt("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        let magic: [u8; 4] = hdr[header::MAGIC].try_into().unwrap();
        if magic != PAGE_MAGIC {
            return Err(SiloError::Corrupt("invalid page magic"));
        }
        let format_version = u16::from_be_bytes(hdr[header::FORMAT_VERSION].try_into().unwrap());
        if format_version != PAGE_FORMAT_VERSION {
            return Err(SiloError::Corrupt("unsupported page format version"));
        }
        if hdr[header::RESERVED] != 0 {
            return Err(SiloError::Corrupt("page header reserved byte not zero"));
        }
        let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
        let page_size = u32::from_be_bytes(hdr[header::PAGE_SIZE].try_into().unwrap());
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(SiloError::Corrupt("page size smaller than header"));
        }
        let page_no = PageId(u64::from_be_bytes(hdr[header::PAGE_NO].try_into().unwrap()));
        let salt = u64::from_be_bytes(hdr[header::SALT].try_into().unwrap());
        let crc32 = u32::from_be_bytes(hdr[header::CRC32].try_into().unwrap());
        Ok(Self {
            format_version,
            kind,
            page_size,
            page_no,
            salt,
            crc32,
        })
    }
}

/// Computes the checksum of a page image.
///
/// The page number and the database salt are mixed in ahead of the payload so
/// that a page copied to a different slot, or a page from another database
/// file, fails verification even when its bytes are internally consistent.
pub(crate) fn page_crc32(page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Zeroes the CRC field ahead of checksum computation or verification.
pub(crate) fn clear_crc32(buf: &mut [u8]) -> Result<()> {
    if buf.len() < header::CRC32.end {
        return Err(SiloError::Invalid("page header buffer too small"));
    }
    buf[header::CRC32].fill(0);
    Ok(())
}

/// Stamps the checksum of a fully encoded page into its header.
pub(crate) fn seal_page(buf: &mut [u8], page_no: PageId, salt: u64) -> Result<()> {
    clear_crc32(buf)?;
    let crc = page_crc32(page_no.0, salt, buf);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Verifies a page image against its embedded checksum and identity fields.
pub(crate) fn verify_page(buf: &[u8], expect_no: PageId, salt: u64, page_size: usize) -> Result<PageHeader> {
    if buf.len() < page_size {
        return Err(SiloError::Corrupt("page truncated"));
    }
    let hdr = PageHeader::decode(buf)?;
    if hdr.page_no != expect_no {
        return Err(SiloError::Corrupt("page number mismatch"));
    }
    if hdr.salt != salt {
        return Err(SiloError::Corrupt("page salt mismatch"));
    }
    if hdr.page_size as usize != page_size {
        return Err(SiloError::Corrupt("page size mismatch"));
    }
    let mut scratch = buf[..page_size].to_vec();
    clear_crc32(&mut scratch)?;
    if page_crc32(expect_no.0, salt, &scratch) != hdr.crc32 {
        return Err(SiloError::Corrupt("page checksum mismatch"));
    }
    Ok(hdr)
}
