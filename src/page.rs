//! Fixed-size pages, the header page layout and the page access traits the
//! B-tree is written against.
//!
//! Every page starts with a one-byte [`PageType`] tag and ends with a 4-byte
//! CRC32 trailer covering the rest of the page. Multi-byte integers are
//! big-endian.
//!
//! ```text
//! Header page (page 0)
//! Offset  Size  Field
//! 0       1     page type (Header)
//! 8       8     magic "SmplDoc\0"
//! 16      4     format version
//! 20      4     page size
//! 24      4     page count
//! 28      4     free list head (0 = empty)
//! 32      4     free page count
//! 36      4     catalog root page
//! 40      8     last committed LSN
//! ```

use crate::error::{DbError, DbResult};

/// Page number within the data file. Page 0 is always the header page.
pub type PageId = u32;

/// Sentinel page id meaning "no page".
pub const NO_PAGE: PageId = 0;
/// Bytes reserved at the end of every page for the CRC32 trailer.
pub const PAGE_TRAILER_SIZE: usize = 4;
/// File magic stored in the header page.
pub const MAGIC: [u8; 8] = *b"SmplDoc\0";
/// On-disk format version written by this build.
pub const FORMAT_VERSION: u32 = 1;
/// Bytes of the header page that must be readable before the page size is known.
pub const HEADER_PREFIX_SIZE: usize = 24;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Header = 1,
    BTreeInternal = 2,
    BTreeLeaf = 3,
    Overflow = 4,
    Free = 5,
}

impl TryFrom<u8> for PageType {
    type Error = DbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PageType::Header),
            2 => Ok(PageType::BTreeInternal),
            3 => Ok(PageType::BTreeLeaf),
            4 => Ok(PageType::Overflow),
            5 => Ok(PageType::Free),
            other => Err(DbError::corrupt(format!("unknown page type {other}"))),
        }
    }
}

/// The raw contents of one page
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    contents: Vec<u8>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("len", &self.contents.len())
            .field("type", &self.contents.first())
            .finish()
    }
}

impl Page {
    const CRC_BYTES: usize = PAGE_TRAILER_SIZE;

    /// Create a zeroed page of the given size
    pub fn new(page_size: usize) -> Self {
        Self {
            contents: vec![0; page_size],
        }
    }

    /// Create a zeroed page tagged with `page_type`
    pub fn with_type(page_size: usize, page_type: PageType) -> Self {
        let mut page = Self::new(page_size);
        page.contents[0] = page_type as u8;
        page
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { contents: bytes }
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Bytes available to page content, excluding the checksum trailer.
    pub fn usable_size(&self) -> usize {
        self.contents.len() - Self::CRC_BYTES
    }

    pub fn bytes(&self) -> &[u8] {
        &self.contents
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.contents
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.contents
    }

    pub fn page_type(&self) -> DbResult<PageType> {
        PageType::try_from(self.contents[0])
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.contents[offset]
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        self.contents[offset] = value;
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.contents[offset..offset + 2]);
        u16::from_be_bytes(bytes)
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) {
        self.contents[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Get an integer from the page at the given offset
    pub fn get_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.contents[offset..offset + 4]);
        u32::from_be_bytes(bytes)
    }

    /// Set an integer at the given offset
    pub fn set_u32(&mut self, offset: usize, value: u32) {
        self.contents[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.contents[offset..offset + 8]);
        u64::from_be_bytes(bytes)
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) {
        self.contents[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    /// Copy raw bytes into the page at the given offset
    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.contents[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.contents[offset..offset + len]
    }

    fn compute_crc32(&self) -> u32 {
        crc32fast::hash(&self.contents[..self.usable_size()])
    }

    /// Stamp the checksum trailer. Called before a page image leaves memory.
    pub fn seal(&mut self) {
        let crc = self.compute_crc32();
        let offset = self.usable_size();
        self.set_u32(offset, crc);
    }

    pub fn verify_crc32(&self) -> bool {
        self.get_u32(self.usable_size()) == self.compute_crc32()
    }

    /// Check the trailer of a page read back from disk.
    pub fn verify(&self, page_id: PageId) -> DbResult<()> {
        if self.verify_crc32() {
            Ok(())
        } else {
            Err(DbError::corrupt_page(page_id, "checksum mismatch"))
        }
    }
}

/// Bounds-checked big-endian reader over a byte slice. Overruns surface as
/// [`DbError::CorruptData`] instead of panics.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub(crate) fn take(&mut self, len: usize) -> DbResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                DbError::corrupt(format!(
                    "read of {len} bytes at offset {} overruns buffer of {} bytes",
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> DbResult<()> {
        self.take(len).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> DbResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> DbResult<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    pub(crate) fn u32(&mut self) -> DbResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    pub(crate) fn u64(&mut self) -> DbResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    pub(crate) fn i64(&mut self) -> DbResult<i64> {
        Ok(self.u64()? as i64)
    }

    pub(crate) fn f64(&mut self) -> DbResult<f64> {
        Ok(f64::from_bits(self.u64()?))
    }
}

/// In-memory copy of the header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub page_count: u32,
    pub free_list_head: PageId,
    pub free_page_count: u32,
    pub catalog_root: PageId,
    pub last_lsn: u64,
}

impl DbHeader {
    const MAGIC_OFFSET: usize = 8;
    const VERSION_OFFSET: usize = 16;
    const PAGE_SIZE_OFFSET: usize = 20;
    const PAGE_COUNT_OFFSET: usize = 24;
    const FREE_HEAD_OFFSET: usize = 28;
    const FREE_COUNT_OFFSET: usize = 32;
    const CATALOG_ROOT_OFFSET: usize = 36;
    const LAST_LSN_OFFSET: usize = 40;

    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            page_count: 1,
            free_list_head: NO_PAGE,
            free_page_count: 0,
            catalog_root: NO_PAGE,
            last_lsn: 0,
        }
    }

    /// Validate magic and version from the fixed prefix of the header page
    /// and return the stored page size.
    pub fn peek_page_size(prefix: &[u8]) -> DbResult<usize> {
        if prefix.len() < HEADER_PREFIX_SIZE {
            return Err(DbError::corrupt("header page is truncated"));
        }
        if prefix[Self::MAGIC_OFFSET..Self::MAGIC_OFFSET + MAGIC.len()] != MAGIC {
            return Err(DbError::corrupt("bad magic number in header page"));
        }
        let mut reader = ByteReader::at(prefix, Self::VERSION_OFFSET);
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(DbError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(reader.u32()? as usize)
    }

    pub fn from_page(page: &Page) -> DbResult<Self> {
        if page.page_type()? != PageType::Header {
            return Err(DbError::corrupt_page(0, "not a header page"));
        }
        let page_size = Self::peek_page_size(page.bytes())?;
        if page_size != page.len() {
            return Err(DbError::corrupt_page(
                0,
                format!("header page size {page_size} does not match {}", page.len()),
            ));
        }
        Ok(Self {
            page_size: page_size as u32,
            page_count: page.get_u32(Self::PAGE_COUNT_OFFSET),
            free_list_head: page.get_u32(Self::FREE_HEAD_OFFSET),
            free_page_count: page.get_u32(Self::FREE_COUNT_OFFSET),
            catalog_root: page.get_u32(Self::CATALOG_ROOT_OFFSET),
            last_lsn: page.get_u64(Self::LAST_LSN_OFFSET),
        })
    }

    pub fn to_page(&self) -> Page {
        let mut page = Page::with_type(self.page_size as usize, PageType::Header);
        page.set_bytes(Self::MAGIC_OFFSET, &MAGIC);
        page.set_u32(Self::VERSION_OFFSET, FORMAT_VERSION);
        page.set_u32(Self::PAGE_SIZE_OFFSET, self.page_size);
        page.set_u32(Self::PAGE_COUNT_OFFSET, self.page_count);
        page.set_u32(Self::FREE_HEAD_OFFSET, self.free_list_head);
        page.set_u32(Self::FREE_COUNT_OFFSET, self.free_page_count);
        page.set_u32(Self::CATALOG_ROOT_OFFSET, self.catalog_root);
        page.set_u64(Self::LAST_LSN_OFFSET, self.last_lsn);
        page.seal();
        page
    }
}

/// Layout of a page sitting on the free list.
pub struct FreePage;

impl FreePage {
    const NEXT_OFFSET: usize = 4;

    pub fn build(page_size: usize, next: PageId) -> Page {
        let mut page = Page::with_type(page_size, PageType::Free);
        page.set_u32(Self::NEXT_OFFSET, next);
        page
    }

    pub fn next(page: &Page, page_id: PageId) -> DbResult<PageId> {
        if page.page_type()? != PageType::Free {
            return Err(DbError::corrupt_page(page_id, "free list entry is not a free page"));
        }
        Ok(page.get_u32(Self::NEXT_OFFSET))
    }
}

/// Read access to a consistent set of pages.
pub trait PageRead {
    fn page_size(&self) -> usize;

    fn read_page(&self, page_id: PageId) -> DbResult<Page>;
}

/// Read-write access used by the B-tree. Implemented by a transaction's
/// staged page set (and an in-memory store in tests).
pub trait PageWrite: PageRead {
    fn write_page(&mut self, page_id: PageId, page: Page) -> DbResult<()>;

    fn allocate_page(&mut self) -> DbResult<PageId>;

    fn free_page(&mut self, page_id: PageId) -> DbResult<()>;
}
