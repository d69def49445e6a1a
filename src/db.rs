//! The database handle: file lifecycle, transaction scopes and collection
//! handles.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use crate::{
    btree::{BTree, TreeStats},
    catalog::{Catalog, CollectionMeta},
    collection::Collection,
    config::Config,
    error::{DbError, DbResult},
    page::{FreePage, PageId, PageRead, NO_PAGE},
    store::PageStore,
    txn::{Transaction, TransactionManager},
};

struct DbInner {
    path: PathBuf,
    store: Arc<PageStore>,
    txns: TransactionManager,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if let Err(err) = self.store.flush() {
            warn!(path = %self.path.display(), error = %err, "flush on close failed");
        }
    }
}

/// An open database file. Cheap to clone; every clone shares the same
/// store and writer lock. The file is flushed and its lock released when
/// the last clone is dropped.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("page_size", &self.inner.store.page_size())
            .finish()
    }
}

/// Point-in-time counters for one database.
#[derive(Debug, Clone, PartialEq)]
pub struct DbStats {
    pub page_size: usize,
    pub page_count: u32,
    pub free_pages: u32,
    pub file_len: u64,
    pub journal_len: u64,
    pub collections: usize,
    pub generation: u64,
    pub last_lsn: u64,
    pub cached_pages: usize,
    pub cache_capacity: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub transaction_active: bool,
}

/// Result of [`Database::check`] for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionCheck {
    pub name: String,
    pub documents: usize,
    pub primary: TreeStats,
    pub indexes: Vec<(String, TreeStats)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub catalog: TreeStats,
    pub collections: Vec<CollectionCheck>,
    pub free_pages: usize,
    pub page_count: u32,
}

impl Database {
    /// Open or create the database at `path`. A journal left by a crash is
    /// replayed or discarded before anything else happens.
    pub fn open(path: impl AsRef<Path>, config: Config) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Arc::new(PageStore::open(&path, &config)?);
        let txns = TransactionManager::new(Arc::clone(&store));

        if store.header().catalog_root == NO_PAGE {
            let mut txn = txns.begin()?;
            let catalog = Catalog::create(&mut txn)?;
            txn.set_catalog_root(catalog.root());
            txn.commit()?;
            info!(root = catalog.root(), "initialized catalog");
        }

        Ok(Self {
            inner: Arc::new(DbInner { path, store, txns }),
        })
    }

    /// Flush and release this handle. The file closes once every clone is
    /// gone.
    pub fn close(self) -> DbResult<()> {
        self.inner.store.flush()?;
        info!(path = %self.inner.path.display(), "closed database handle");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn page_size(&self) -> usize {
        self.inner.store.page_size()
    }

    pub(crate) fn store(&self) -> &Arc<PageStore> {
        &self.inner.store
    }

    /// Start the single writer transaction. Fails fast with
    /// [`DbError::TransactionConflict`] while another one is active.
    pub fn begin_transaction(&self) -> DbResult<Transaction> {
        self.inner.txns.begin()
    }

    /// Run `f` in a fresh transaction, committing on success and rolling
    /// back on error.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Transaction) -> DbResult<T>) -> DbResult<T> {
        let mut txn = self.begin_transaction()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.rollback()?;
                Err(err)
            }
        }
    }

    /// Handle on a collection. Nothing is created until the first write.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.clone(), name)
    }

    pub fn list_collection_names(&self) -> DbResult<Vec<String>> {
        let snapshot = self.inner.store.snapshot();
        let catalog = Catalog::open(snapshot.header().catalog_root);
        Ok(catalog
            .list(&snapshot)?
            .into_iter()
            .map(|meta| meta.name)
            .collect())
    }

    /// Remove a collection with all its documents and indexes.
    pub fn drop_collection(&self, name: &str) -> DbResult<()> {
        self.transaction(|txn| txn.drop_collection(name))
    }

    pub fn stats(&self) -> DbResult<DbStats> {
        let store = &self.inner.store;
        let (cache_hits, cache_misses) = store.cache_stats().get();
        let snapshot = store.snapshot();
        let header = snapshot.header();
        let collections = Catalog::open(header.catalog_root).list(&snapshot)?.len();
        Ok(DbStats {
            page_size: store.page_size(),
            page_count: header.page_count,
            free_pages: header.free_page_count,
            file_len: store.file_len()?,
            journal_len: store.journal().len()?,
            collections,
            generation: snapshot.generation(),
            last_lsn: header.last_lsn,
            cached_pages: store.cached_pages(),
            cache_capacity: store.cache_capacity(),
            cache_hits,
            cache_misses,
            transaction_active: self.inner.txns.writer_active(),
        })
    }

    /// Verify every tree and account for every page: each page below the
    /// page count must be the header, part of exactly one tree, or on the
    /// free list. Index entry counts must match the document counts.
    pub fn check(&self) -> DbResult<CheckReport> {
        let snapshot = self.inner.store.snapshot();
        let header = snapshot.header();
        let catalog = Catalog::open(header.catalog_root);
        let catalog_stats = catalog.tree().check(&snapshot)?;
        let mut used = catalog_stats.total_pages();

        let mut collections = Vec::new();
        for meta in catalog.list(&snapshot)? {
            let report = check_collection(&snapshot, &meta)?;
            used += report.primary.total_pages();
            used += report
                .indexes
                .iter()
                .map(|(_, stats)| stats.total_pages())
                .sum::<usize>();
            collections.push(report);
        }

        let free_pages = count_free_list(&snapshot, header.free_list_head, header.page_count)?;
        if free_pages != header.free_page_count as usize {
            return Err(DbError::corrupt(format!(
                "free list holds {free_pages} pages, header records {}",
                header.free_page_count
            )));
        }
        let accounted = 1 + used + free_pages;
        if accounted != header.page_count as usize {
            return Err(DbError::corrupt(format!(
                "{accounted} pages accounted for, file holds {}",
                header.page_count
            )));
        }
        info!(
            collections = collections.len(),
            pages = header.page_count,
            "consistency check passed"
        );
        Ok(CheckReport {
            catalog: catalog_stats,
            collections,
            free_pages,
            page_count: header.page_count,
        })
    }
}

fn check_collection<P: PageRead>(pages: &P, meta: &CollectionMeta) -> DbResult<CollectionCheck> {
    let primary = meta.primary().check(pages)?;
    let mut indexes = Vec::new();
    for index in &meta.indexes {
        let stats = BTree::open(index.root).check(pages)?;
        if stats.entries != primary.entries {
            return Err(DbError::corrupt(format!(
                "index {} on {} holds {} entries for {} documents",
                index.field, meta.name, stats.entries, primary.entries
            )));
        }
        indexes.push((index.field.clone(), stats));
    }
    Ok(CollectionCheck {
        name: meta.name.clone(),
        documents: primary.entries,
        primary,
        indexes,
    })
}

fn count_free_list<P: PageRead>(pages: &P, head: PageId, page_count: u32) -> DbResult<usize> {
    let mut count = 0;
    let mut next = head;
    while next != NO_PAGE {
        if count >= page_count as usize {
            return Err(DbError::corrupt("free list has a cycle"));
        }
        next = FreePage::next(&pages.read_page(next)?, next)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::{
        fs::OpenOptions,
        io::{Read, Seek, SeekFrom, Write},
        sync::Barrier,
        thread,
    };

    use super::*;
    use crate::{
        doc,
        test_utils::{open_test_db, test_config, TestDir},
    };

    #[test]
    fn test_open_creates_catalog_and_reopens() {
        let dir = TestDir::new();
        let path = dir.join("app.db");
        {
            let db = Database::open(&path, test_config()).unwrap();
            assert!(db.list_collection_names().unwrap().is_empty());
            db.collection("users").insert_one(doc! { "_id" => 1 }).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&path, test_config()).unwrap();
        assert_eq!(db.list_collection_names().unwrap(), vec!["users"]);
        assert_eq!(db.collection("users").count_documents(doc! {}).unwrap(), 1);
    }

    #[test]
    fn test_existing_page_size_wins() {
        let dir = TestDir::new();
        let path = dir.join("sized.db");
        drop(Database::open(&path, test_config()).unwrap());
        let db = Database::open(&path, test_config().page_size(4096)).unwrap();
        assert_eq!(db.page_size(), 512);
    }

    #[test]
    fn test_concurrent_begin_exactly_one_wins() {
        let (_dir, db) = open_test_db();
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let result = db.begin_transaction();
                    // hold the winner until both have tried
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
        assert!(db.begin_transaction().is_ok());
    }

    #[test]
    fn test_transaction_helper_rolls_back_on_error() {
        let (_dir, db) = open_test_db();
        let result: DbResult<()> = db.transaction(|txn| {
            txn.collection("items").insert_one(doc! { "_id" => 1 })?;
            Err(DbError::invalid("changed my mind"))
        });
        assert!(result.is_err());
        assert!(db.list_collection_names().unwrap().is_empty());
        assert!(db.begin_transaction().is_ok());
    }

    #[test]
    fn test_drop_collection_frees_pages() {
        let (_dir, db) = open_test_db();
        let items = db.collection("items");
        items.create_index("n").unwrap();
        for i in 0..200 {
            items.insert_one(doc! { "_id" => i, "n" => i % 7 }).unwrap();
        }
        let before = db.stats().unwrap();
        db.drop_collection("items").unwrap();
        let after = db.stats().unwrap();
        assert_eq!(after.page_count, before.page_count);
        assert!(after.free_pages > before.free_pages);
        assert_eq!(after.collections, 0);
        assert!(matches!(
            db.drop_collection("items"),
            Err(DbError::NotFound(_))
        ));
        db.check().unwrap();

        // freed pages are reused before the file grows
        for i in 0..50 {
            db.collection("again").insert_one(doc! { "_id" => i }).unwrap();
        }
        assert_eq!(db.stats().unwrap().page_count, before.page_count);
        db.check().unwrap();
    }

    #[test]
    fn test_stats_track_writer_and_cache() {
        let (_dir, db) = open_test_db();
        assert!(!db.stats().unwrap().transaction_active);

        let txn = db.begin_transaction().unwrap();
        let stats = db.stats().unwrap();
        assert!(stats.transaction_active);
        assert_eq!(stats.cache_capacity, test_config().cache_size);
        txn.rollback().unwrap();
        assert!(!db.stats().unwrap().transaction_active);
    }

    #[test]
    fn test_corrupt_page_is_confined_to_its_collection() {
        let dir = TestDir::new();
        let path = dir.join("corrupt.db");
        let damaged_root = {
            let db = Database::open(&path, test_config()).unwrap();
            for name in ["damaged", "intact"] {
                db.collection(name)
                    .insert_many((0..5).map(|i| doc! { "_id" => i, "name" => name }))
                    .unwrap();
            }
            let snapshot = db.store().snapshot();
            let meta = Catalog::open(snapshot.header().catalog_root)
                .get(&snapshot, "damaged")
                .unwrap()
                .unwrap();
            meta.root
        };
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let offset = u64::from(damaged_root) * 512 + 40;
            let mut byte = [0u8; 1];
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.read_exact(&mut byte).unwrap();
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&[byte[0] ^ 0xFF]).unwrap();
        }

        let db = Database::open(&path, test_config()).unwrap();
        let damaged = db
            .collection("damaged")
            .find(doc! {})
            .and_then(|cursor| cursor.collect::<DbResult<Vec<_>>>());
        assert!(matches!(damaged, Err(DbError::CorruptData(_))));
        assert_eq!(db.collection("intact").count_documents(doc! {}).unwrap(), 5);
        assert!(matches!(db.check(), Err(DbError::CorruptData(_))));
    }

    #[test]
    fn test_check_reports_every_tree() {
        let (_dir, db) = open_test_db();
        let people = db.collection("people");
        people.create_index("age").unwrap();
        for i in 0..300 {
            people
                .insert_one(doc! { "_id" => i, "age" => i % 50, "bio" => "x".repeat(i as usize % 200) })
                .unwrap();
        }
        let report = db.check().unwrap();
        assert_eq!(report.collections.len(), 1);
        let people_report = &report.collections[0];
        assert_eq!(people_report.documents, 300);
        assert_eq!(people_report.indexes[0].1.entries, 300);
        assert!(people_report.primary.height > 1);
        assert!(people_report.primary.overflow_pages > 0);
    }
}
