//! Collections: CRUD over a primary tree keyed by `_id`, with secondary
//! indexes kept in step inside the same transaction.
//!
//! [`Collection`] runs each operation in its own implicit transaction and
//! reads the committed store. [`TxnCollection`] runs inside a caller's
//! [`Transaction`] and sees its uncommitted writes. Both share the engine
//! functions below.
//!
//! A secondary index entry is keyed by `key(field value) ++ key(_id)` and
//! stores the encoded `_id`. Documents without the field are indexed under
//! `null`.

use std::ops::Bound;

use tracing::{debug, info};

use crate::{
    bson::{self, key, Document, ObjectId, Value},
    btree::{BTree, InsertMode, RangeCursor},
    catalog::{self, Catalog, CollectionMeta, IndexMeta},
    db::Database,
    error::{DbError, DbResult},
    page::{PageId, PageRead, NO_PAGE},
    query::{Filter, KeyRange, Plan, Update},
    txn::Transaction,
};

/// Outcome of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Documents the filter selected
    pub matched: usize,
    /// Documents whose content changed
    pub modified: usize,
}

fn load_meta<P: PageRead>(
    pages: &P,
    catalog_root: PageId,
    name: &str,
) -> DbResult<Option<CollectionMeta>> {
    if catalog_root == NO_PAGE {
        return Ok(None);
    }
    Catalog::open(catalog_root).get(pages, name)
}

fn txn_meta(txn: &Transaction, name: &str) -> DbResult<Option<CollectionMeta>> {
    load_meta(txn, txn.catalog_root(), name)
}

fn ensure_meta(txn: &mut Transaction, name: &str) -> DbResult<CollectionMeta> {
    if let Some(meta) = txn_meta(txn, name)? {
        return Ok(meta);
    }
    catalog::validate_name(name)?;
    let primary = BTree::create(txn)?;
    let created_lsn = txn.next_lsn();
    let meta = CollectionMeta::new(name, primary.root(), created_lsn);
    Catalog::open(txn.catalog_root()).put(txn, &meta)?;
    info!(collection = name, root = meta.root, "created collection");
    Ok(meta)
}

fn index_value(doc: &Document, field: &str) -> Value {
    doc.get_path(field).cloned().unwrap_or(Value::Null)
}

fn index_key(value: &Value, pk: &[u8]) -> Vec<u8> {
    let mut composite = key::encode(value);
    composite.extend_from_slice(pk);
    composite
}

fn add_index_entry(
    txn: &mut Transaction,
    index: &IndexMeta,
    value: &Value,
    pk: &[u8],
) -> DbResult<()> {
    let tree = BTree::open(index.root);
    if index.unique {
        let prefix = key::encode(value);
        let end = key::after_prefix(&prefix);
        let taken = tree
            .range_scan(&*txn, Bound::Included(prefix.as_slice()), Bound::Excluded(end.as_slice()))
            .next()
            .transpose()?
            .is_some();
        if taken {
            return Err(DbError::DuplicateKey(format!(
                "{} = {value} violates a unique index",
                index.field
            )));
        }
    }
    tree.insert(txn, &index_key(value, pk), pk, InsertMode::Insert)
}

fn remove_index_entry(
    txn: &mut Transaction,
    index: &IndexMeta,
    value: &Value,
    pk: &[u8],
) -> DbResult<()> {
    BTree::open(index.root)
        .delete(txn, &index_key(value, pk))
        .map_err(|err| match err {
            // a missing entry means the index and the primary tree disagree
            DbError::NotFound(_) => DbError::corrupt(format!(
                "index {} has no entry for a live document",
                index.field
            )),
            other => other,
        })
}

fn insert_document(
    txn: &mut Transaction,
    meta: &CollectionMeta,
    mut doc: Document,
) -> DbResult<Value> {
    if doc.id().is_none() {
        doc.insert_first("_id", ObjectId::new());
    }
    let id = doc.id().cloned().unwrap_or(Value::Null);
    let pk = key::encode_primary_key(&id)?;
    let bytes = bson::encode(&doc)?;
    meta.primary()
        .insert(txn, &pk, &bytes, InsertMode::Insert)
        .map_err(|err| match err {
            DbError::DuplicateKey(_) => {
                DbError::DuplicateKey(format!("_id {id} already exists in {}", meta.name))
            }
            other => other,
        })?;
    for index in &meta.indexes {
        add_index_entry(txn, index, &index_value(&doc, &index.field), &pk)?;
    }
    Ok(id)
}

fn delete_document(
    txn: &mut Transaction,
    meta: &CollectionMeta,
    pk: &[u8],
    doc: &Document,
) -> DbResult<()> {
    meta.primary().delete(txn, pk)?;
    for index in &meta.indexes {
        remove_index_entry(txn, index, &index_value(doc, &index.field), pk)?;
    }
    Ok(())
}

/// Replace `old` by `new` under the same primary key. Index entries whose
/// value changed are removed before their replacements go in.
fn replace_document(
    txn: &mut Transaction,
    meta: &CollectionMeta,
    pk: &[u8],
    old: &Document,
    new: &Document,
) -> DbResult<()> {
    let bytes = bson::encode(new)?;
    meta.primary().insert(txn, pk, &bytes, InsertMode::Upsert)?;
    for index in &meta.indexes {
        let before = index_value(old, &index.field);
        let after = index_value(new, &index.field);
        if key::encode(&before) == key::encode(&after) {
            continue;
        }
        remove_index_entry(txn, index, &before, pk)?;
        add_index_entry(txn, index, &after, pk)?;
    }
    Ok(())
}

/// Matching documents with their primary keys, collected before any of
/// them is modified.
fn collect_matches(
    txn: &Transaction,
    meta: &CollectionMeta,
    filter: Filter,
    limit: Option<usize>,
) -> DbResult<Vec<(Vec<u8>, Document)>> {
    let mut scan = DocScan::new(Some(meta), filter, 0);
    let mut matches = Vec::new();
    while limit.map_or(true, |limit| matches.len() < limit) {
        match scan.next(txn, 0, txn.catalog_root())? {
            Some(found) => matches.push(found),
            None => break,
        }
    }
    Ok(matches)
}

fn update_documents(
    txn: &mut Transaction,
    name: &str,
    filter: Filter,
    update: &Update,
    limit: Option<usize>,
) -> DbResult<UpdateResult> {
    let Some(meta) = txn_meta(txn, name)? else {
        return Ok(UpdateResult::default());
    };
    let matches = collect_matches(txn, &meta, filter, limit)?;
    let mut result = UpdateResult {
        matched: matches.len(),
        modified: 0,
    };
    for (pk, old) in matches {
        let mut new = old.clone();
        update.apply(&mut new)?;
        if new == old {
            continue;
        }
        replace_document(txn, &meta, &pk, &old, &new)?;
        result.modified += 1;
    }
    debug!(collection = name, matched = result.matched, modified = result.modified, "updated");
    Ok(result)
}

fn delete_documents(
    txn: &mut Transaction,
    name: &str,
    filter: Filter,
    limit: Option<usize>,
) -> DbResult<usize> {
    let Some(meta) = txn_meta(txn, name)? else {
        return Ok(0);
    };
    let matches = collect_matches(txn, &meta, filter, limit)?;
    for (pk, doc) in &matches {
        delete_document(txn, &meta, pk, doc)?;
    }
    debug!(collection = name, deleted = matches.len(), "deleted");
    Ok(matches.len())
}

fn validate_index_field(field: &str) -> DbResult<()> {
    if field.is_empty() || field.starts_with('$') || field.split('.').any(str::is_empty) {
        return Err(DbError::invalid(format!("invalid index field {field:?}")));
    }
    if field == "_id" {
        return Err(DbError::invalid("_id is always indexed by the primary tree"));
    }
    Ok(())
}

fn create_index(txn: &mut Transaction, name: &str, field: &str, unique: bool) -> DbResult<()> {
    validate_index_field(field)?;
    let mut meta = ensure_meta(txn, name)?;
    if let Some(existing) = meta.index(field) {
        if existing.unique == unique {
            return Ok(());
        }
        return Err(DbError::invalid(format!(
            "index on {field} already exists with different options"
        )));
    }

    let index = IndexMeta {
        field: field.to_string(),
        root: BTree::create(txn)?.root(),
        unique,
        created_lsn: txn.next_lsn(),
    };
    let existing = meta
        .primary()
        .range_scan(&*txn, Bound::Unbounded, Bound::Unbounded)
        .map(|entry| {
            let (pk, bytes) = entry?;
            let value = bson::extract_field(&bytes, field)?.unwrap_or(Value::Null);
            Ok((pk, value))
        })
        .collect::<DbResult<Vec<_>>>()?;
    for (pk, value) in &existing {
        add_index_entry(txn, &index, value, pk)?;
    }

    meta.indexes.push(index);
    Catalog::open(txn.catalog_root()).put(txn, &meta)?;
    info!(collection = name, field, unique, entries = existing.len(), "created index");
    Ok(())
}

fn drop_index(txn: &mut Transaction, name: &str, field: &str) -> DbResult<()> {
    let not_found = || DbError::NotFound(format!("index {field} on {name}"));
    let mut meta = txn_meta(txn, name)?.ok_or_else(not_found)?;
    let position = meta
        .indexes
        .iter()
        .position(|index| index.field == field)
        .ok_or_else(not_found)?;
    let index = meta.indexes.remove(position);
    BTree::open(index.root).destroy(txn)?;
    Catalog::open(txn.catalog_root()).put(txn, &meta)?;
    info!(collection = name, field, "dropped index");
    Ok(())
}

fn drop_collection(txn: &mut Transaction, name: &str) -> DbResult<()> {
    let meta = txn_meta(txn, name)?
        .ok_or_else(|| DbError::NotFound(format!("collection {name}")))?;
    for index in &meta.indexes {
        BTree::open(index.root).destroy(txn)?;
    }
    meta.primary().destroy(txn)?;
    Catalog::open(txn.catalog_root()).remove(txn, name)?;
    info!(collection = name, "dropped collection");
    Ok(())
}

#[derive(Debug)]
enum Source {
    Primary,
    Index { field: String, created_lsn: u64 },
}

/// Execution state of one query: the chosen access path, a restartable
/// cursor over it and the filter re-checked on each document.
#[derive(Debug)]
struct DocScan {
    collection: String,
    primary: PageId,
    created_lsn: u64,
    source: Source,
    filter: Filter,
    /// `None` once exhausted or when the collection does not exist
    cursor: Option<RangeCursor>,
    generation: u64,
}

impl DocScan {
    fn new(meta: Option<&CollectionMeta>, filter: Filter, generation: u64) -> Self {
        let Some(meta) = meta else {
            return Self {
                collection: String::new(),
                primary: NO_PAGE,
                created_lsn: 0,
                source: Source::Primary,
                filter,
                cursor: None,
                generation,
            };
        };
        let full = KeyRange {
            start: Vec::new(),
            end: vec![key::MAX_KEY],
        };
        let plan = Plan::choose(meta, &filter);
        debug!(collection = %meta.name, %plan, "chose access path");
        let (source, tree, range) = match plan {
            Plan::PrimaryRange(range) => (Source::Primary, meta.primary(), range),
            Plan::IndexRange { field, range } => {
                let (root, created_lsn) = meta
                    .index(&field)
                    .map_or((NO_PAGE, 0), |index| (index.root, index.created_lsn));
                (Source::Index { field, created_lsn }, BTree::open(root), range)
            }
            Plan::FullScan => (Source::Primary, meta.primary(), full),
        };
        let (start, end) = range.bounds();
        Self {
            collection: meta.name.clone(),
            primary: meta.root,
            created_lsn: meta.created_lsn,
            source,
            filter,
            cursor: Some(tree.cursor(start, end)),
            generation,
        }
    }

    /// After a commit the collection or its driving index may be gone, or
    /// dropped and re-created on the same root page.
    fn revalidate<P: PageRead>(&mut self, pages: &P, catalog_root: PageId) -> DbResult<()> {
        let meta = load_meta(pages, catalog_root, &self.collection)?;
        let Some(meta) = meta.filter(|meta| meta.created_lsn == self.created_lsn) else {
            debug!(collection = %self.collection, "collection dropped under an open cursor");
            self.cursor = None;
            return Ok(());
        };
        if let Source::Index { field, created_lsn } = &self.source {
            if meta.index(field).map(|index| index.created_lsn) != Some(*created_lsn) {
                self.cursor = None;
                return Err(DbError::NotFound(format!(
                    "index {field} on {} was dropped while a cursor was open",
                    self.collection
                )));
            }
        }
        Ok(())
    }

    fn next<P: PageRead>(
        &mut self,
        pages: &P,
        generation: u64,
        catalog_root: PageId,
    ) -> DbResult<Option<(Vec<u8>, Document)>> {
        if self.cursor.is_some() && generation != self.generation {
            self.revalidate(pages, catalog_root)?;
            self.generation = generation;
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        loop {
            let Some((entry_key, entry_value)) = cursor.next(pages, generation)? else {
                self.cursor = None;
                return Ok(None);
            };
            let (pk, bytes) = match self.source {
                Source::Primary => (entry_key, entry_value),
                Source::Index { .. } => {
                    let bytes = BTree::open(self.primary)
                        .lookup(pages, &entry_value)?
                        .ok_or_else(|| {
                            DbError::corrupt(format!(
                                "index entry in {} points at a missing document",
                                self.collection
                            ))
                        })?;
                    (entry_value, bytes)
                }
            };
            let doc = bson::decode(&bytes)?;
            if self.filter.matches(&doc) {
                return Ok(Some((pk, doc)));
            }
        }
    }

    fn finish(&mut self) {
        self.cursor = None;
    }
}

/// Lazy query results over the committed store. Each step takes a fresh
/// snapshot, so commits made while iterating become visible at the next
/// step; keys already returned are never returned again.
pub struct Cursor {
    db: Database,
    scan: DocScan,
}

impl Iterator for Cursor {
    type Item = DbResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let snapshot = self.db.store().snapshot();
        let step = self.scan.next(
            &snapshot,
            snapshot.generation(),
            snapshot.header().catalog_root,
        );
        drop(snapshot);
        match step {
            Ok(found) => found.map(|(_, doc)| Ok(doc)),
            Err(err) => {
                self.scan.finish();
                Some(Err(err))
            }
        }
    }
}

/// Lazy query results inside a transaction, including its staged writes.
pub struct TxnCursor<'t> {
    txn: &'t Transaction,
    scan: DocScan,
}

impl Iterator for TxnCursor<'_> {
    type Item = DbResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.scan.next(self.txn, 0, self.txn.catalog_root()) {
            Ok(found) => found.map(|(_, doc)| Ok(doc)),
            Err(err) => {
                self.scan.finish();
                Some(Err(err))
            }
        }
    }
}

/// A collection handle bound to a database. Every write runs in its own
/// transaction and fails with [`DbError::TransactionConflict`] while another
/// transaction is active.
#[derive(Debug, Clone)]
pub struct Collection {
    db: Database,
    name: String,
}

impl Collection {
    pub(crate) fn new(db: Database, name: &str) -> Self {
        Self {
            db,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn write<T>(&self, f: impl FnOnce(&mut TxnCollection<'_>) -> DbResult<T>) -> DbResult<T> {
        self.db.transaction(|txn| f(&mut txn.collection(&self.name)))
    }

    fn meta(&self) -> DbResult<Option<CollectionMeta>> {
        let snapshot = self.db.store().snapshot();
        load_meta(&snapshot, snapshot.header().catalog_root, &self.name)
    }

    pub fn insert_one(&self, doc: Document) -> DbResult<Value> {
        self.write(|col| col.insert_one(doc))
    }

    /// Insert every document or none of them.
    pub fn insert_many(&self, docs: impl IntoIterator<Item = Document>) -> DbResult<Vec<Value>> {
        self.write(|col| col.insert_many(docs))
    }

    pub fn find(&self, filter: Document) -> DbResult<Cursor> {
        let filter = Filter::parse(&filter)?;
        let snapshot = self.db.store().snapshot();
        let meta = load_meta(&snapshot, snapshot.header().catalog_root, &self.name)?;
        let scan = DocScan::new(meta.as_ref(), filter, snapshot.generation());
        drop(snapshot);
        Ok(Cursor {
            db: self.db.clone(),
            scan,
        })
    }

    pub fn find_one(&self, filter: Document) -> DbResult<Option<Document>> {
        self.find(filter)?.next().transpose()
    }

    pub fn count_documents(&self, filter: Document) -> DbResult<usize> {
        self.find(filter)?.try_fold(0, |count, doc| doc.map(|_| count + 1))
    }

    pub fn update_one(&self, filter: Document, update: Document) -> DbResult<UpdateResult> {
        self.write(|col| col.update_one(filter, update))
    }

    pub fn update_many(&self, filter: Document, update: Document) -> DbResult<UpdateResult> {
        self.write(|col| col.update_many(filter, update))
    }

    pub fn delete_one(&self, filter: Document) -> DbResult<usize> {
        self.write(|col| col.delete_one(filter))
    }

    pub fn delete_many(&self, filter: Document) -> DbResult<usize> {
        self.write(|col| col.delete_many(filter))
    }

    pub fn create_index(&self, field: &str) -> DbResult<()> {
        self.write(|col| col.create_index(field))
    }

    pub fn create_unique_index(&self, field: &str) -> DbResult<()> {
        self.write(|col| col.create_unique_index(field))
    }

    pub fn drop_index(&self, field: &str) -> DbResult<()> {
        self.write(|col| col.drop_index(field))
    }

    pub fn list_indexes(&self) -> DbResult<Vec<IndexMeta>> {
        Ok(self.meta()?.map(|meta| meta.indexes).unwrap_or_default())
    }

    /// The access path `find` would use for `filter`.
    pub fn explain(&self, filter: Document) -> DbResult<Plan> {
        let filter = Filter::parse(&filter)?;
        Ok(self
            .meta()?
            .map_or(Plan::FullScan, |meta| Plan::choose(&meta, &filter)))
    }
}

impl Transaction {
    /// A collection handle whose operations join this transaction.
    pub fn collection(&mut self, name: &str) -> TxnCollection<'_> {
        TxnCollection {
            txn: self,
            name: name.to_string(),
        }
    }

    /// Names of every collection, including ones created by this
    /// transaction.
    pub fn list_collection_names(&self) -> DbResult<Vec<String>> {
        Ok(Catalog::open(self.catalog_root())
            .list(self)?
            .into_iter()
            .map(|meta| meta.name)
            .collect())
    }

    /// Remove a collection with all its documents and indexes.
    pub fn drop_collection(&mut self, name: &str) -> DbResult<()> {
        self.run_statement(|txn| drop_collection(txn, name))
    }
}

/// A collection seen through an open transaction. Each write is one
/// statement: if it fails with a recoverable error only that statement is
/// undone and the transaction stays usable.
#[derive(Debug)]
pub struct TxnCollection<'t> {
    txn: &'t mut Transaction,
    name: String,
}

impl TxnCollection<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert_one(&mut self, doc: Document) -> DbResult<Value> {
        let name = self.name.as_str();
        self.txn.run_statement(|txn| {
            let meta = ensure_meta(txn, name)?;
            insert_document(txn, &meta, doc)
        })
    }

    pub fn insert_many(&mut self, docs: impl IntoIterator<Item = Document>) -> DbResult<Vec<Value>> {
        let name = self.name.as_str();
        self.txn.run_statement(|txn| {
            let meta = ensure_meta(txn, name)?;
            docs.into_iter()
                .map(|doc| insert_document(txn, &meta, doc))
                .collect()
        })
    }

    pub fn find(&self, filter: Document) -> DbResult<TxnCursor<'_>> {
        let filter = Filter::parse(&filter)?;
        let meta = txn_meta(&*self.txn, &self.name)?;
        Ok(TxnCursor {
            txn: &*self.txn,
            scan: DocScan::new(meta.as_ref(), filter, 0),
        })
    }

    pub fn find_one(&self, filter: Document) -> DbResult<Option<Document>> {
        self.find(filter)?.next().transpose()
    }

    pub fn count_documents(&self, filter: Document) -> DbResult<usize> {
        self.find(filter)?.try_fold(0, |count, doc| doc.map(|_| count + 1))
    }

    fn update(&mut self, filter: Document, update: Document, limit: Option<usize>) -> DbResult<UpdateResult> {
        let filter = Filter::parse(&filter)?;
        let update = Update::parse(&update)?;
        let name = self.name.as_str();
        self.txn
            .run_statement(|txn| update_documents(txn, name, filter, &update, limit))
    }

    pub fn update_one(&mut self, filter: Document, update: Document) -> DbResult<UpdateResult> {
        self.update(filter, update, Some(1))
    }

    pub fn update_many(&mut self, filter: Document, update: Document) -> DbResult<UpdateResult> {
        self.update(filter, update, None)
    }

    fn delete(&mut self, filter: Document, limit: Option<usize>) -> DbResult<usize> {
        let filter = Filter::parse(&filter)?;
        let name = self.name.as_str();
        self.txn
            .run_statement(|txn| delete_documents(txn, name, filter, limit))
    }

    pub fn delete_one(&mut self, filter: Document) -> DbResult<usize> {
        self.delete(filter, Some(1))
    }

    pub fn delete_many(&mut self, filter: Document) -> DbResult<usize> {
        self.delete(filter, None)
    }

    pub fn create_index(&mut self, field: &str) -> DbResult<()> {
        let name = self.name.as_str();
        self.txn
            .run_statement(|txn| create_index(txn, name, field, false))
    }

    /// Like [`create_index`](Self::create_index), but a second document with
    /// an equal value is rejected with [`DbError::DuplicateKey`].
    pub fn create_unique_index(&mut self, field: &str) -> DbResult<()> {
        let name = self.name.as_str();
        self.txn
            .run_statement(|txn| create_index(txn, name, field, true))
    }

    pub fn drop_index(&mut self, field: &str) -> DbResult<()> {
        let name = self.name.as_str();
        self.txn.run_statement(|txn| drop_index(txn, name, field))
    }

    pub fn list_indexes(&self) -> DbResult<Vec<IndexMeta>> {
        Ok(txn_meta(&*self.txn, &self.name)?
            .map(|meta| meta.indexes)
            .unwrap_or_default())
    }
}
