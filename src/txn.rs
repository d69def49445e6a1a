//! Single-writer transactions over the page store.
//!
//! A transaction stages every page mutation in memory. Commit journals the
//! staged images, makes the commit marker durable and only then writes the
//! pages in place. Rolling back is dropping the staged set.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use tracing::{debug, info, warn};

use crate::{
    config::SyncMode,
    error::{DbError, DbResult},
    journal::LogRecord,
    page::{DbHeader, FreePage, Page, PageId, PageRead, PageWrite, NO_PAGE},
    store::PageStore,
};

/// Process-wide writer lock. Acquisition never waits.
#[derive(Debug, Default)]
pub(crate) struct WriterLock {
    held: AtomicBool,
}

impl WriterLock {
    fn try_acquire(self: &Arc<Self>) -> Option<WriterGuard> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| WriterGuard {
                lock: Arc::clone(self),
            })
    }

    pub(crate) fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the writer lock on drop
#[derive(Debug)]
pub(crate) struct WriterGuard {
    lock: Arc<WriterLock>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct TransactionManager {
    store: Arc<PageStore>,
    writer: Arc<WriterLock>,
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    pub fn new(store: Arc<PageStore>) -> Self {
        Self {
            store,
            writer: Arc::new(WriterLock::default()),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// Start the writer transaction, failing fast if one is already active.
    pub fn begin(&self) -> DbResult<Transaction> {
        self.store.ensure_usable()?;
        let guard = self
            .writer
            .try_acquire()
            .ok_or(DbError::TransactionConflict)?;
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let header = self.store.header();
        debug!(txn_id = id, "begin transaction");
        Ok(Transaction {
            id,
            store: Arc::clone(&self.store),
            guard: Some(guard),
            header,
            next_lsn: header.last_lsn + 1,
            dirty: HashMap::new(),
            savepoint: None,
            state: TxnState::Active,
        })
    }

    pub fn writer_active(&self) -> bool {
        self.writer.is_held()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Aborted,
    Finished,
}

/// A staged page image with the committed image it replaces.
#[derive(Debug, Clone)]
struct DirtyPage {
    before: Option<Page>,
    after: Page,
    lsn: u64,
}

/// Undo information for the statement in progress: the staged state each
/// page had before the statement first touched it.
#[derive(Debug)]
struct Savepoint {
    pages: HashMap<PageId, Option<DirtyPage>>,
    header: DbHeader,
}

/// Simulated crash points for recovery tests.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashPoint {
    /// Page records are journaled but the commit marker is not.
    BeforeMarker,
    /// The commit marker is durable but nothing was applied.
    AfterMarker,
    /// The commit marker is durable and writing the data file fails after
    /// the header page went out.
    ApplyFails,
}

/// The writer transaction. Dropping an active transaction rolls it back.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    store: Arc<PageStore>,
    guard: Option<WriterGuard>,
    header: DbHeader,
    next_lsn: u64,
    dirty: HashMap<PageId, DirtyPage>,
    savepoint: Option<Savepoint>,
    state: TxnState,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Number of pages staged so far
    pub fn dirty_pages(&self) -> usize {
        self.dirty.len()
    }

    pub(crate) fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    pub(crate) fn catalog_root(&self) -> PageId {
        self.header.catalog_root
    }

    pub(crate) fn set_catalog_root(&mut self, root: PageId) {
        self.header.catalog_root = root;
    }

    pub(crate) fn header(&self) -> DbHeader {
        self.header
    }

    fn ensure_active(&self) -> DbResult<()> {
        match self.state {
            TxnState::Active => Ok(()),
            _ => Err(DbError::TransactionAborted),
        }
    }

    /// Run one statement atomically. A recoverable error undoes only this
    /// statement's changes; any other error aborts the whole transaction.
    pub(crate) fn run_statement<T>(
        &mut self,
        statement: impl FnOnce(&mut Self) -> DbResult<T>,
    ) -> DbResult<T> {
        self.ensure_active()?;
        self.savepoint = Some(Savepoint {
            pages: HashMap::new(),
            header: self.header,
        });
        let result = statement(self);
        let savepoint = self.savepoint.take();
        match result {
            Ok(value) => Ok(value),
            Err(err) if err.is_recoverable() => {
                if let Some(savepoint) = savepoint {
                    self.undo(savepoint);
                }
                debug!(txn_id = self.id, error = %err, "statement rolled back");
                Err(err)
            }
            Err(err) => {
                warn!(txn_id = self.id, error = %err, "transaction aborted");
                self.abort();
                Err(err)
            }
        }
    }

    fn undo(&mut self, savepoint: Savepoint) {
        for (page_id, previous) in savepoint.pages {
            match previous {
                Some(dirty) => {
                    self.dirty.insert(page_id, dirty);
                }
                None => {
                    self.dirty.remove(&page_id);
                }
            }
        }
        self.header = savepoint.header;
    }

    fn abort(&mut self) {
        self.dirty.clear();
        self.savepoint = None;
        self.state = TxnState::Aborted;
        self.guard = None;
    }

    fn remember_for_savepoint(&mut self, page_id: PageId) {
        if let Some(savepoint) = self.savepoint.as_mut() {
            savepoint
                .pages
                .entry(page_id)
                .or_insert_with(|| self.dirty.get(&page_id).cloned());
        }
    }

    /// Take a fresh LSN. Also stamps catalog entries at creation.
    pub(crate) fn next_lsn(&mut self) -> u64 {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        lsn
    }

    fn stage(&mut self, page_id: PageId, page: Page) -> DbResult<()> {
        self.remember_for_savepoint(page_id);
        let lsn = self.next_lsn();
        if let Some(dirty) = self.dirty.get_mut(&page_id) {
            dirty.after = page;
            dirty.lsn = lsn;
            return Ok(());
        }
        let before = if page_id < self.store.header().page_count {
            Some(self.store.read_committed(page_id)?)
        } else {
            None
        };
        self.dirty.insert(
            page_id,
            DirtyPage {
                before,
                after: page,
                lsn,
            },
        );
        Ok(())
    }

    /// Make the staged changes durable and visible. Succeeds once the
    /// commit marker is durable, even if the data file cannot be updated
    /// afterwards; the store is then poisoned until reopened.
    pub fn commit(mut self) -> DbResult<()> {
        self.commit_inner(None)
    }

    /// Commit, stopping at `crash` as if the process died there.
    #[cfg(test)]
    pub(crate) fn commit_with_crash(mut self, crash: CrashPoint) -> DbResult<()> {
        self.commit_inner(Some(crash))
    }

    fn commit_inner(&mut self, crash: Option<CrashPoint>) -> DbResult<()> {
        self.ensure_active()?;
        if self.dirty.is_empty() && self.header == self.store.header() {
            self.finish();
            return Ok(());
        }

        let mut ordered: BTreeMap<PageId, DirtyPage> = self.dirty.drain().collect();
        let commit_lsn = self.next_lsn();
        self.header.last_lsn = commit_lsn;
        ordered.insert(
            0,
            DirtyPage {
                before: Some(self.store.header().to_page()),
                after: self.header.to_page(),
                lsn: commit_lsn,
            },
        );

        let mut records = Vec::with_capacity(ordered.len() + 1);
        let mut images = Vec::with_capacity(ordered.len());
        for (page_id, mut dirty) in ordered {
            dirty.after.seal();
            records.push(LogRecord::PageWrite {
                lsn: dirty.lsn,
                txn_id: self.id,
                page_id,
                before: dirty.before.map(Page::into_bytes),
                after: dirty.after.bytes().to_vec(),
            });
            images.push((page_id, dirty.after));
        }

        let store = Arc::clone(&self.store);
        match self.write_through(&store, &records, &images, commit_lsn, crash) {
            Ok(()) => {
                info!(
                    txn_id = self.id,
                    pages = images.len(),
                    lsn = commit_lsn,
                    "committed transaction"
                );
                self.finish();
                Ok(())
            }
            Err(err) => {
                warn!(txn_id = self.id, error = %err, "commit failed");
                self.abort();
                Err(err)
            }
        }
    }

    /// Journal, commit point, apply, journal reset.
    fn write_through(
        &self,
        store: &PageStore,
        records: &[LogRecord],
        images: &[(PageId, Page)],
        commit_lsn: u64,
        crash: Option<CrashPoint>,
    ) -> DbResult<()> {
        let sync = store.sync_mode() == SyncMode::Full;
        let journal = store.journal();
        journal.append(records)?;
        if sync {
            journal.sync()?;
        }
        if crash == Some(CrashPoint::BeforeMarker) {
            return Ok(());
        }
        journal.append(&[LogRecord::Commit {
            lsn: commit_lsn,
            txn_id: self.id,
        }])?;
        if sync {
            journal.sync()?;
        }
        if crash == Some(CrashPoint::AfterMarker) {
            return Ok(());
        }

        // The marker is durable. A failure past this point leaves the file
        // holding part of the commit.
        if let Err(err) = self.apply_images(store, images, crash).and_then(|()| store.flush()) {
            store.invalidate_cache();
            store.poison(format!(
                "commit {commit_lsn} is durable but was not written to the data file: {err}"
            ));
            return Ok(());
        }
        if let Err(err) = journal.reset(sync) {
            warn!(txn_id = self.id, error = %err, "journal reset failed, keeping it for recovery");
        }
        Ok(())
    }

    fn apply_images(
        &self,
        store: &PageStore,
        images: &[(PageId, Page)],
        crash: Option<CrashPoint>,
    ) -> DbResult<()> {
        if crash == Some(CrashPoint::ApplyFails) {
            store.apply(&images[..1], store.header())?;
            return Err(DbError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        store.apply(images, self.header)
    }

    /// Discard every staged change.
    pub fn rollback(mut self) -> DbResult<()> {
        debug!(txn_id = self.id, pages = self.dirty.len(), "rollback transaction");
        self.dirty.clear();
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        self.state = TxnState::Finished;
        self.savepoint = None;
        self.guard = None;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            debug!(txn_id = self.id, "dropping active transaction, rolling back");
            self.dirty.clear();
            self.finish();
        }
    }
}

impl PageRead for Transaction {
    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn read_page(&self, page_id: PageId) -> DbResult<Page> {
        if let Some(dirty) = self.dirty.get(&page_id) {
            return Ok(dirty.after.clone());
        }
        if page_id >= self.header.page_count {
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("page {page_id} is out of range"),
            )));
        }
        self.store.read_committed(page_id)
    }
}

impl PageWrite for Transaction {
    fn write_page(&mut self, page_id: PageId, page: Page) -> DbResult<()> {
        if page_id == NO_PAGE || page_id >= self.header.page_count {
            return Err(DbError::corrupt_page(page_id, "write to unallocated page"));
        }
        if page.len() != self.page_size() {
            return Err(DbError::corrupt_page(page_id, "page image has the wrong size"));
        }
        self.stage(page_id, page)
    }

    fn allocate_page(&mut self) -> DbResult<PageId> {
        if self.header.free_list_head != NO_PAGE {
            let page_id = self.header.free_list_head;
            let free = self.read_page(page_id)?;
            self.header.free_list_head = FreePage::next(&free, page_id)?;
            self.header.free_page_count = self.header.free_page_count.saturating_sub(1);
            debug!(page_id, "reused free page");
            return Ok(page_id);
        }
        let page_id = self.header.page_count;
        self.header.page_count += 1;
        let page_size = self.page_size();
        self.stage(page_id, Page::new(page_size))?;
        debug!(page_id, "extended data file");
        Ok(page_id)
    }

    fn free_page(&mut self, page_id: PageId) -> DbResult<()> {
        let page = FreePage::build(self.page_size(), self.header.free_list_head);
        self.write_page(page_id, page)?;
        self.header.free_list_head = page_id;
        self.header.free_page_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{
        page::PageType,
        test_utils::{test_config, TestDir},
    };

    fn setup() -> (TestDir, Arc<PageStore>, TransactionManager) {
        let dir = TestDir::new();
        let store = Arc::new(PageStore::open(&dir.join("txn.db"), &test_config()).unwrap());
        let manager = TransactionManager::new(Arc::clone(&store));
        (dir, store, manager)
    }

    fn leaf(marker: u32) -> Page {
        let mut page = Page::with_type(512, PageType::BTreeLeaf);
        page.set_u32(4, marker);
        page
    }

    #[test]
    fn test_second_begin_conflicts() {
        let (_dir, _store, manager) = setup();
        let txn = manager.begin().unwrap();
        assert!(matches!(manager.begin(), Err(DbError::TransactionConflict)));
        txn.rollback().unwrap();
        assert!(manager.begin().is_ok());
    }

    #[test]
    fn test_concurrent_begin_exactly_one_wins() {
        let (_dir, _store, manager) = setup();
        let manager = Arc::new(manager);
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let result = manager.begin();
                    // hold the winner until both threads have tried
                    barrier.wait();
                    result.map(|_| ())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(DbError::TransactionConflict))));
    }

    #[test]
    fn test_commit_makes_pages_visible() {
        let (_dir, store, manager) = setup();
        let mut txn = manager.begin().unwrap();
        let page_id = txn.allocate_page().unwrap();
        txn.write_page(page_id, leaf(11)).unwrap();
        assert_eq!(txn.read_page(page_id).unwrap().get_u32(4), 11);
        assert!(store.snapshot().read_page(page_id).is_err());
        txn.commit().unwrap();

        assert_eq!(store.snapshot().read_page(page_id).unwrap().get_u32(4), 11);
        assert_eq!(store.header().page_count, 2);
        assert!(store.header().last_lsn > 0);
        assert!(store.journal().is_empty().unwrap());
        assert!(!manager.writer_active());
    }

    #[test]
    fn test_rollback_and_drop_discard_changes() {
        let (_dir, store, manager) = setup();
        let mut txn = manager.begin().unwrap();
        let page_id = txn.allocate_page().unwrap();
        txn.write_page(page_id, leaf(1)).unwrap();
        txn.rollback().unwrap();
        assert_eq!(store.header().page_count, 1);

        {
            let mut txn = manager.begin().unwrap();
            txn.allocate_page().unwrap();
        }
        assert_eq!(store.header().page_count, 1);
        assert!(!manager.writer_active());
    }

    #[test]
    fn test_free_list_is_reused_lifo() {
        let (_dir, store, manager) = setup();
        let mut txn = manager.begin().unwrap();
        let a = txn.allocate_page().unwrap();
        let b = txn.allocate_page().unwrap();
        txn.write_page(a, leaf(1)).unwrap();
        txn.write_page(b, leaf(2)).unwrap();
        txn.commit().unwrap();

        let mut txn = manager.begin().unwrap();
        txn.free_page(a).unwrap();
        txn.free_page(b).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.header().free_page_count, 2);
        assert_eq!(store.header().free_list_head, b);

        let mut txn = manager.begin().unwrap();
        assert_eq!(txn.allocate_page().unwrap(), b);
        assert_eq!(txn.allocate_page().unwrap(), a);
        assert_eq!(txn.allocate_page().unwrap(), 3);
        assert_eq!(txn.header().free_page_count, 0);
    }

    #[test]
    fn test_recoverable_error_undoes_statement_only() {
        let (_dir, _store, manager) = setup();
        let mut txn = manager.begin().unwrap();
        let kept = txn
            .run_statement(|txn| {
                let id = txn.allocate_page()?;
                txn.write_page(id, leaf(1))?;
                Ok(id)
            })
            .unwrap();
        let result: DbResult<()> = txn.run_statement(|txn| {
            txn.write_page(kept, leaf(2))?;
            let id = txn.allocate_page()?;
            txn.write_page(id, leaf(3))?;
            Err(DbError::DuplicateKey("k".into()))
        });
        assert!(matches!(result, Err(DbError::DuplicateKey(_))));
        assert!(txn.is_active());
        assert_eq!(txn.read_page(kept).unwrap().get_u32(4), 1);
        assert_eq!(txn.header().page_count, 2);
        assert_eq!(txn.dirty_pages(), 1);
    }

    #[test]
    fn test_fatal_error_aborts_transaction() {
        let (_dir, store, manager) = setup();
        let mut txn = manager.begin().unwrap();
        let result: DbResult<()> = txn.run_statement(|txn| {
            txn.allocate_page()?;
            Err(DbError::corrupt("broken node"))
        });
        assert!(matches!(result, Err(DbError::CorruptData(_))));
        assert!(!txn.is_active());
        assert!(!manager.writer_active());
        assert!(matches!(
            txn.run_statement(|_| Ok(())),
            Err(DbError::TransactionAborted)
        ));
        assert!(matches!(txn.commit(), Err(DbError::TransactionAborted)));
        assert_eq!(store.header().page_count, 1);
    }

    #[test]
    fn test_crash_before_marker_discards() {
        let dir = TestDir::new();
        let path = dir.join("crash.db");
        {
            let store = Arc::new(PageStore::open(&path, &test_config()).unwrap());
            let manager = TransactionManager::new(Arc::clone(&store));
            let mut txn = manager.begin().unwrap();
            let id = txn.allocate_page().unwrap();
            txn.write_page(id, leaf(5)).unwrap();
            txn.commit_with_crash(CrashPoint::BeforeMarker).unwrap();
            assert!(!store.journal().is_empty().unwrap());
        }
        let store = PageStore::open(&path, &test_config()).unwrap();
        assert_eq!(store.header().page_count, 1);
    }

    #[test]
    fn test_crash_after_marker_redoes() {
        let dir = TestDir::new();
        let path = dir.join("crash.db");
        let page_id = {
            let store = Arc::new(PageStore::open(&path, &test_config()).unwrap());
            let manager = TransactionManager::new(Arc::clone(&store));
            let mut txn = manager.begin().unwrap();
            let id = txn.allocate_page().unwrap();
            txn.write_page(id, leaf(5)).unwrap();
            txn.commit_with_crash(CrashPoint::AfterMarker).unwrap();
            assert_eq!(store.header().page_count, 1);
            id
        };
        let store = PageStore::open(&path, &test_config()).unwrap();
        assert_eq!(store.header().page_count, 2);
        assert_eq!(store.snapshot().read_page(page_id).unwrap().get_u32(4), 5);
    }

    #[test]
    fn test_failed_apply_after_marker_poisons_until_reopen() {
        let dir = TestDir::new();
        let path = dir.join("poison.db");
        let page_id = {
            let store = Arc::new(PageStore::open(&path, &test_config()).unwrap());
            let manager = TransactionManager::new(Arc::clone(&store));
            let mut txn = manager.begin().unwrap();
            let id = txn.allocate_page().unwrap();
            txn.write_page(id, leaf(9)).unwrap();
            txn.commit_with_crash(CrashPoint::ApplyFails).unwrap();

            assert!(!manager.writer_active());
            assert!(matches!(manager.begin(), Err(DbError::Poisoned(_))));
            assert!(matches!(
                store.snapshot().read_page(0),
                Err(DbError::Poisoned(_))
            ));
            assert!(!store.journal().is_empty().unwrap());
            id
        };
        let store = PageStore::open(&path, &test_config()).unwrap();
        assert_eq!(store.header().page_count, 2);
        assert_eq!(store.snapshot().read_page(page_id).unwrap().get_u32(4), 9);
        assert!(store.journal().is_empty().unwrap());

        let manager = TransactionManager::new(Arc::new(store));
        assert!(manager.begin().is_ok());
    }
}
