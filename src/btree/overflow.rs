//! Overflow chains for values too large to store inline in a leaf.
//!
//! ```text
//! [u8 type][3 bytes 0][u32 next page (0 = end)][u32 chunk len][chunk]
//! ```

use crate::{
    error::{DbError, DbResult},
    page::{Page, PageId, PageRead, PageType, PageWrite, NO_PAGE},
};

const NEXT_OFFSET: usize = 4;
const CHUNK_LEN_OFFSET: usize = 8;
const CHUNK_OFFSET: usize = 12;

fn chunk_capacity(page_size: usize) -> usize {
    page_size - crate::page::PAGE_TRAILER_SIZE - CHUNK_OFFSET
}

/// Store `value` across freshly allocated overflow pages and return the
/// first page id.
pub(crate) fn write_chain<P: PageWrite>(pages: &mut P, value: &[u8]) -> DbResult<PageId> {
    let page_size = pages.page_size();
    let chunks: Vec<&[u8]> = if value.is_empty() {
        vec![value]
    } else {
        value.chunks(chunk_capacity(page_size)).collect()
    };
    let mut ids = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        ids.push(pages.allocate_page()?);
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let mut page = Page::with_type(page_size, PageType::Overflow);
        page.set_u32(NEXT_OFFSET, ids.get(i + 1).copied().unwrap_or(NO_PAGE));
        page.set_u32(CHUNK_LEN_OFFSET, chunk.len() as u32);
        page.set_bytes(CHUNK_OFFSET, chunk);
        pages.write_page(ids[i], page)?;
    }
    Ok(ids[0])
}

fn next_in_chain(page: &Page, page_id: PageId) -> DbResult<(PageId, usize)> {
    if page.page_type()? != PageType::Overflow {
        return Err(DbError::corrupt_page(page_id, "expected an overflow page"));
    }
    let chunk_len = page.get_u32(CHUNK_LEN_OFFSET) as usize;
    if chunk_len > chunk_capacity(page.len()) {
        return Err(DbError::corrupt_page(page_id, "overflow chunk length overruns page"));
    }
    Ok((page.get_u32(NEXT_OFFSET), chunk_len))
}

/// Page ids of a chain holding `len` bytes, in order.
pub(crate) fn chain_pages<P: PageRead>(pages: &P, first: PageId, len: u32) -> DbResult<Vec<PageId>> {
    let max_pages = (len as usize).div_ceil(chunk_capacity(pages.page_size())).max(1);
    let mut ids = Vec::with_capacity(max_pages);
    let mut current = first;
    while current != NO_PAGE {
        if ids.len() == max_pages {
            return Err(DbError::corrupt_page(first, "overflow chain is longer than its value"));
        }
        let page = pages.read_page(current)?;
        let (next, _) = next_in_chain(&page, current)?;
        ids.push(current);
        current = next;
    }
    Ok(ids)
}

pub(crate) fn read_chain<P: PageRead>(pages: &P, first: PageId, len: u32) -> DbResult<Vec<u8>> {
    let len = len as usize;
    let max_pages = len.div_ceil(chunk_capacity(pages.page_size())).max(1);
    let mut value = Vec::with_capacity(len);
    let mut current = first;
    let mut visited = 0;
    while current != NO_PAGE && value.len() < len {
        visited += 1;
        if visited > max_pages {
            return Err(DbError::corrupt_page(first, "overflow chain is longer than its value"));
        }
        let page = pages.read_page(current)?;
        let (next, chunk_len) = next_in_chain(&page, current)?;
        value.extend_from_slice(page.get_bytes(CHUNK_OFFSET, chunk_len));
        current = next;
    }
    if value.len() != len {
        return Err(DbError::corrupt_page(
            first,
            format!("overflow chain holds {} bytes, expected {len}", value.len()),
        ));
    }
    Ok(value)
}

/// Return every page of the chain to the free list.
pub(crate) fn free_chain<P: PageWrite>(pages: &mut P, first: PageId, len: u32) -> DbResult<()> {
    for page_id in chain_pages(pages, first, len)? {
        pages.free_page(page_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mem::MemPages;

    #[test]
    fn test_chain_round_trip_and_free() {
        let mut pages = MemPages::new(512);
        let value: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let first = write_chain(&mut pages, &value).unwrap();
        let ids = chain_pages(&pages, first, value.len() as u32).unwrap();
        assert_eq!(ids.len(), 5);
        assert_eq!(read_chain(&pages, first, value.len() as u32).unwrap(), value);

        free_chain(&mut pages, first, value.len() as u32).unwrap();
        assert_eq!(pages.free_count(), 5);
    }

    #[test]
    fn test_short_chain_is_corrupt() {
        let mut pages = MemPages::new(512);
        let first = write_chain(&mut pages, &[1u8; 100]).unwrap();
        assert!(matches!(
            read_chain(&pages, first, 101),
            Err(DbError::CorruptData(_))
        ));
    }
}
