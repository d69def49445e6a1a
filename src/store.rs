//! The committed page store: the data file, its header, the clean page cache
//! and the journal, plus open-time recovery.
//!
//! Readers outside a transaction take a [`Snapshot`], a shared hold on the
//! generation gate. Applying a commit holds the gate exclusively and bumps
//! the generation, so a snapshot never sees half of a commit.

use std::path::Path;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CacheStats, PageCache},
    config::{Config, SyncMode},
    error::{DbError, DbResult},
    file_manager::FileManager,
    journal::Journal,
    page::{DbHeader, Page, PageId, PageRead, HEADER_PREFIX_SIZE},
};

#[derive(Debug)]
pub struct PageStore {
    file: FileManager,
    journal: Journal,
    cache: PageCache,
    page_size: usize,
    sync: SyncMode,
    header: RwLock<DbHeader>,
    generation: RwLock<u64>,
    poisoned: Mutex<Option<String>>,
}

impl PageStore {
    /// Open or create the data file at `path`, replaying a committed journal
    /// left behind by a crash.
    pub fn open(path: &Path, config: &Config) -> DbResult<Self> {
        config.validate()?;
        let file = FileManager::open(path)?;
        let journal = Journal::open(path)?;

        Self::recover(&file, &journal, config.sync)?;

        let page_size = if file.is_empty()? {
            let header = DbHeader::new(config.page_size);
            file.write(0, &header.to_page())?;
            if config.sync == SyncMode::Full {
                file.sync()?;
            }
            info!(path = %path.display(), page_size = config.page_size, "created database file");
            config.page_size
        } else {
            let mut prefix = [0u8; HEADER_PREFIX_SIZE];
            let read = file.read_prefix(&mut prefix)?;
            if read < HEADER_PREFIX_SIZE {
                return Err(DbError::corrupt_page(0, "header page is truncated"));
            }
            let stored = DbHeader::peek_page_size(&prefix)?;
            if stored != config.page_size {
                warn!(
                    configured = config.page_size,
                    stored, "page size from the existing file overrides the configured one"
                );
            }
            stored
        };

        let header_page = file.read(0, page_size)?;
        header_page.verify(0)?;
        let header = DbHeader::from_page(&header_page)?;
        info!(
            path = %path.display(),
            page_size,
            page_count = header.page_count,
            free_pages = header.free_page_count,
            "opened database"
        );

        Ok(Self {
            file,
            journal,
            cache: PageCache::new(config.cache_size),
            page_size,
            sync: config.sync,
            header: RwLock::new(header),
            generation: RwLock::new(0),
            poisoned: Mutex::new(None),
        })
    }

    /// Redo a committed transaction found in the journal, or discard an
    /// uncommitted one.
    fn recover(file: &FileManager, journal: &Journal, sync: SyncMode) -> DbResult<()> {
        if journal.is_empty()? {
            return Ok(());
        }
        let scan = journal.scan()?;
        match scan.committed_pages() {
            Some((lsn, pages)) => {
                info!(lsn, pages = pages.len(), "replaying committed journal");
                for (page_id, image) in &pages {
                    let page = Page::from_bytes(image.to_vec());
                    page.verify(*page_id)?;
                    file.write(*page_id, &page)?;
                }
                file.sync()?;
            }
            None => {
                info!(
                    records = scan.records.len(),
                    torn = scan.torn,
                    "discarding uncommitted journal"
                );
            }
        }
        journal.reset(sync == SyncMode::Full)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync
    }

    /// The last committed header
    pub fn header(&self) -> DbHeader {
        *self.header.read()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.read()
    }

    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub(crate) fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            store: self,
            generation: self.generation.read(),
        }
    }

    /// Refuse all further work until reopen. The data file may hold part of
    /// a commit whose marker is already durable in the journal.
    pub(crate) fn poison(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "page store poisoned, reopen to recover");
        self.poisoned.lock().get_or_insert(reason);
    }

    pub(crate) fn ensure_usable(&self) -> DbResult<()> {
        match self.poisoned.lock().as_ref() {
            Some(reason) => Err(DbError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    /// Read a committed page without taking the generation gate. Only the
    /// writer may call this: it is the only party that moves the gate.
    pub(crate) fn read_committed(&self, page_id: PageId) -> DbResult<Page> {
        self.ensure_usable()?;
        let page_count = self.header.read().page_count;
        if page_id >= page_count {
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("page {page_id} is out of range (page count {page_count})"),
            )));
        }
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        }
        let page = self.file.read(page_id, self.page_size)?;
        page.verify(page_id)?;
        self.cache.insert(page_id, page.clone());
        Ok(page)
    }

    /// Write committed page images in place and publish the new header.
    /// The caller has already made the journal durable.
    pub(crate) fn apply(&self, pages: &[(PageId, Page)], header: DbHeader) -> DbResult<()> {
        let mut generation = self.generation.write();
        for (page_id, page) in pages {
            self.file.write(*page_id, page)?;
            if *page_id != 0 {
                self.cache.insert(*page_id, page.clone());
            }
        }
        *self.header.write() = header;
        *generation += 1;
        debug!(pages = pages.len(), generation = *generation, "applied commit");
        Ok(())
    }

    /// Drop every cached page. Used after a failed apply, when the cache may
    /// hold images the file does not.
    pub(crate) fn invalidate_cache(&self) {
        self.cache.clear();
    }

    /// fsync the data file
    pub fn flush(&self) -> DbResult<()> {
        if self.sync == SyncMode::Full {
            self.file.sync()?;
        }
        Ok(())
    }

    pub fn file_len(&self) -> DbResult<u64> {
        self.file.len()
    }
}

/// A consistent read view of the committed store. Holds the generation gate
/// shared until dropped, so keep it for one read step only.
pub struct Snapshot<'a> {
    store: &'a PageStore,
    generation: RwLockReadGuard<'a, u64>,
}

impl Snapshot<'_> {
    pub fn generation(&self) -> u64 {
        *self.generation
    }

    pub fn header(&self) -> DbHeader {
        self.store.header()
    }
}

impl PageRead for Snapshot<'_> {
    fn page_size(&self) -> usize {
        self.store.page_size
    }

    fn read_page(&self, page_id: PageId) -> DbResult<Page> {
        self.store.read_committed(page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        journal::LogRecord,
        page::{PageType, FORMAT_VERSION},
        test_utils::{test_config, TestDir},
    };

    #[test]
    fn test_create_then_reopen() {
        let dir = TestDir::new();
        let path = dir.join("store.db");
        {
            let store = PageStore::open(&path, &test_config()).unwrap();
            assert_eq!(store.header().page_count, 1);
            assert_eq!(store.page_size(), 512);
        }
        let store = PageStore::open(&path, &test_config().page_size(4096)).unwrap();
        assert_eq!(store.page_size(), 512);
        assert_eq!(store.file_len().unwrap(), 512);
    }

    #[test]
    fn test_apply_bumps_generation_and_caches() {
        let dir = TestDir::new();
        let store = PageStore::open(&dir.join("store.db"), &test_config()).unwrap();
        let mut header = store.header();
        header.page_count = 2;
        let mut page = Page::with_type(512, PageType::BTreeLeaf);
        page.seal();
        store
            .apply(&[(1, page.clone()), (0, header.to_page())], header)
            .unwrap();
        assert_eq!(store.generation(), 1);
        assert_eq!(store.snapshot().read_page(1).unwrap(), page);
        assert_eq!(store.cache_stats().get().0, 1);
    }

    #[test]
    fn test_out_of_range_read_fails() {
        let dir = TestDir::new();
        let store = PageStore::open(&dir.join("store.db"), &test_config()).unwrap();
        assert!(matches!(store.snapshot().read_page(5), Err(DbError::Io(_))));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let dir = TestDir::new();
        let path = dir.join("store.db");
        drop(PageStore::open(&path, &test_config()).unwrap());
        {
            let fm = FileManager::open(&path).unwrap();
            let mut page = fm.read(0, 512).unwrap();
            page.set_u32(16, FORMAT_VERSION + 1);
            page.seal();
            fm.write(0, &page).unwrap();
        }
        let err = PageStore::open(&path, &test_config()).unwrap_err();
        assert!(matches!(err, DbError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = TestDir::new();
        let path = dir.join("store.db");
        std::fs::write(&path, vec![7u8; 512]).unwrap();
        let err = PageStore::open(&path, &test_config()).unwrap_err();
        assert!(matches!(err, DbError::CorruptData(_)));
    }

    #[test]
    fn test_recovery_replays_committed_journal() {
        let dir = TestDir::new();
        let path = dir.join("store.db");
        let header = {
            let store = PageStore::open(&path, &test_config()).unwrap();
            store.header()
        };
        let mut new_header = header;
        new_header.page_count = 2;
        new_header.last_lsn = 3;
        let mut leaf = Page::with_type(512, PageType::BTreeLeaf);
        leaf.set_u32(4, 77);
        leaf.seal();
        {
            let journal = Journal::open(&path).unwrap();
            journal
                .append(&[
                    LogRecord::PageWrite {
                        lsn: 1,
                        txn_id: 1,
                        page_id: 1,
                        before: None,
                        after: leaf.bytes().to_vec(),
                    },
                    LogRecord::PageWrite {
                        lsn: 2,
                        txn_id: 1,
                        page_id: 0,
                        before: None,
                        after: new_header.to_page().into_bytes(),
                    },
                    LogRecord::Commit { lsn: 3, txn_id: 1 },
                ])
                .unwrap();
        }
        let store = PageStore::open(&path, &test_config()).unwrap();
        assert_eq!(store.header(), new_header);
        assert_eq!(store.snapshot().read_page(1).unwrap().get_u32(4), 77);
        assert!(store.journal().is_empty().unwrap());
    }

    #[test]
    fn test_recovery_discards_uncommitted_journal() {
        let dir = TestDir::new();
        let path = dir.join("store.db");
        drop(PageStore::open(&path, &test_config()).unwrap());
        let mut header = DbHeader::new(512);
        header.page_count = 9;
        {
            let journal = Journal::open(&path).unwrap();
            journal
                .append(&[LogRecord::PageWrite {
                    lsn: 1,
                    txn_id: 1,
                    page_id: 0,
                    before: None,
                    after: header.to_page().into_bytes(),
                }])
                .unwrap();
        }
        let store = PageStore::open(&path, &test_config()).unwrap();
        assert_eq!(store.header().page_count, 1);
        assert!(store.journal().is_empty().unwrap());
    }
}
