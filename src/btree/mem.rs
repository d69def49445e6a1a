//! In-memory page set for exercising the tree without a file.

use std::collections::HashMap;

use crate::{
    error::{DbError, DbResult},
    page::{Page, PageId, PageRead, PageWrite},
};

#[derive(Debug)]
pub(crate) struct MemPages {
    page_size: usize,
    pages: HashMap<PageId, Page>,
    free: Vec<PageId>,
    next_id: PageId,
}

impl MemPages {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: HashMap::new(),
            free: Vec::new(),
            next_id: 1,
        }
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pages handed out and not freed
    pub(crate) fn live_count(&self) -> usize {
        (self.next_id as usize - 1) - self.free.len()
    }
}

impl PageRead for MemPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId) -> DbResult<Page> {
        self.pages
            .get(&page_id)
            .cloned()
            .ok_or_else(|| DbError::corrupt_page(page_id, "never written"))
    }
}

impl PageWrite for MemPages {
    fn write_page(&mut self, page_id: PageId, page: Page) -> DbResult<()> {
        assert_eq!(page.len(), self.page_size);
        self.pages.insert(page_id, page);
        Ok(())
    }

    fn allocate_page(&mut self) -> DbResult<PageId> {
        if let Some(page_id) = self.free.pop() {
            return Ok(page_id);
        }
        let page_id = self.next_id;
        self.next_id += 1;
        Ok(page_id)
    }

    fn free_page(&mut self, page_id: PageId) -> DbResult<()> {
        assert!(!self.free.contains(&page_id), "double free of page {page_id}");
        self.pages.remove(&page_id);
        self.free.push(page_id);
        Ok(())
    }
}
