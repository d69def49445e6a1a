//! Collection registry.
//!
//! The catalog is a B-tree keyed by the key-encoded collection name. Each
//! value is a codec-encoded metadata document:
//!
//! ```text
//! { name: "users", root: 7, created: 41,
//!   indexes: [ { field: "age", root: 12, unique: false, created: 55 } ] }
//! ```
//!
//! `created` is the LSN the entry was stamped with. Root pages come back
//! off the free list, so a dropped and re-created tree can share its old
//! root; the LSN tells the two apart.
//!
//! ```text
//! ```

use std::ops::Bound;

use tracing::debug;

use crate::{
    bson::{self, key, Document, Value},
    btree::{BTree, InsertMode},
    error::{DbError, DbResult},
    page::{PageId, PageRead, PageWrite},
};

/// A secondary index on one (possibly dotted) field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub field: String,
    pub root: PageId,
    pub unique: bool,
    pub created_lsn: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMeta {
    pub name: String,
    /// Root of the primary tree, keyed by encoded `_id`
    pub root: PageId,
    pub created_lsn: u64,
    pub indexes: Vec<IndexMeta>,
}

fn page_id_field(doc: &Document, field: &str) -> DbResult<PageId> {
    let value = doc
        .get(field)
        .ok_or_else(|| DbError::corrupt(format!("catalog entry is missing {field}")))?;
    value
        .as_i64()
        .and_then(|v| PageId::try_from(v).ok())
        .ok_or_else(|| DbError::corrupt(format!("catalog {field} is not a page id: {value}")))
}

fn lsn_field(doc: &Document, field: &str) -> DbResult<u64> {
    doc.get(field)
        .and_then(Value::as_i64)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| DbError::corrupt(format!("catalog {field} is not an LSN")))
}

fn lsn_value(lsn: u64) -> Value {
    Value::Int(i64::try_from(lsn).unwrap_or(i64::MAX))
}

impl CollectionMeta {
    pub fn new(name: &str, root: PageId, created_lsn: u64) -> Self {
        Self {
            name: name.to_string(),
            root,
            created_lsn,
            indexes: Vec::new(),
        }
    }

    pub fn primary(&self) -> BTree {
        BTree::open(self.root)
    }

    pub fn index(&self, field: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|index| index.field == field)
    }

    fn to_document(&self) -> Document {
        let indexes = self
            .indexes
            .iter()
            .map(|index| {
                Value::Document(crate::doc! {
                    "field" => index.field.as_str(),
                    "root" => index.root,
                    "unique" => index.unique,
                    "created" => lsn_value(index.created_lsn),
                })
            })
            .collect::<Vec<_>>();
        crate::doc! {
            "name" => self.name.as_str(),
            "root" => self.root,
            "created" => lsn_value(self.created_lsn),
            "indexes" => indexes,
        }
    }

    fn from_document(doc: &Document) -> DbResult<Self> {
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| DbError::corrupt("catalog entry has no name"))?;
        let indexes = doc
            .get("indexes")
            .and_then(Value::as_array)
            .ok_or_else(|| DbError::corrupt(format!("catalog entry {name} has no index list")))?
            .iter()
            .map(|entry| {
                let entry = entry
                    .as_document()
                    .ok_or_else(|| DbError::corrupt("index descriptor is not a document"))?;
                Ok(IndexMeta {
                    field: entry
                        .get("field")
                        .and_then(Value::as_str)
                        .ok_or_else(|| DbError::corrupt("index descriptor has no field"))?
                        .to_string(),
                    root: page_id_field(entry, "root")?,
                    unique: entry.get("unique").and_then(Value::as_bool).unwrap_or(false),
                    created_lsn: lsn_field(entry, "created")?,
                })
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            root: page_id_field(doc, "root")?,
            created_lsn: lsn_field(doc, "created")?,
            indexes,
        })
    }
}

/// Reject names that cannot be stored or typed back at the prompt.
pub fn validate_name(name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::invalid("collection name is empty"));
    }
    if name.contains('\0') || name.starts_with('$') {
        return Err(DbError::invalid(format!("invalid collection name {name:?}")));
    }
    Ok(())
}

fn name_key(name: &str) -> Vec<u8> {
    key::encode(&Value::from(name))
}

#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    tree: BTree,
}

impl Catalog {
    pub fn open(root: PageId) -> Self {
        Self {
            tree: BTree::open(root),
        }
    }

    pub fn create<P: PageWrite>(pages: &mut P) -> DbResult<Self> {
        Ok(Self {
            tree: BTree::create(pages)?,
        })
    }

    pub fn root(&self) -> PageId {
        self.tree.root()
    }

    pub fn tree(&self) -> BTree {
        self.tree
    }

    pub fn get<P: PageRead>(&self, pages: &P, name: &str) -> DbResult<Option<CollectionMeta>> {
        match self.tree.lookup(pages, &name_key(name))? {
            Some(bytes) => CollectionMeta::from_document(&bson::decode(&bytes)?).map(Some),
            None => Ok(None),
        }
    }

    /// Insert or replace the entry for `meta.name`.
    pub fn put<P: PageWrite>(&self, pages: &mut P, meta: &CollectionMeta) -> DbResult<()> {
        let bytes = bson::encode(&meta.to_document())?;
        self.tree
            .insert(pages, &name_key(&meta.name), &bytes, InsertMode::Upsert)?;
        debug!(collection = %meta.name, indexes = meta.indexes.len(), "stored catalog entry");
        Ok(())
    }

    pub fn remove<P: PageWrite>(&self, pages: &mut P, name: &str) -> DbResult<()> {
        self.tree
            .delete(pages, &name_key(name))
            .map_err(|err| match err {
                DbError::NotFound(_) => DbError::NotFound(format!("collection {name}")),
                other => other,
            })
    }

    /// Every collection, in name order.
    pub fn list<P: PageRead>(&self, pages: &P) -> DbResult<Vec<CollectionMeta>> {
        self.tree
            .range_scan(pages, Bound::Unbounded, Bound::Unbounded)
            .map(|entry| {
                let (_, bytes) = entry?;
                CollectionMeta::from_document(&bson::decode(&bytes)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mem::MemPages;

    #[test]
    fn test_put_get_list_remove() {
        let mut pages = MemPages::new(512);
        let catalog = Catalog::create(&mut pages).unwrap();
        assert!(catalog.get(&pages, "users").unwrap().is_none());

        let mut users = CollectionMeta::new("users", 9, 3);
        users.indexes.push(IndexMeta {
            field: "address.city".into(),
            root: 11,
            unique: true,
            created_lsn: 8,
        });
        catalog.put(&mut pages, &users).unwrap();
        catalog.put(&mut pages, &CollectionMeta::new("audit", 4, 12)).unwrap();

        assert_eq!(catalog.get(&pages, "users").unwrap(), Some(users.clone()));
        let names: Vec<_> = catalog
            .list(&pages)
            .unwrap()
            .into_iter()
            .map(|meta| meta.name)
            .collect();
        assert_eq!(names, vec!["audit", "users"]);

        users.indexes.clear();
        catalog.put(&mut pages, &users).unwrap();
        assert!(catalog.get(&pages, "users").unwrap().unwrap().indexes.is_empty());

        catalog.remove(&mut pages, "users").unwrap();
        assert!(matches!(
            catalog.remove(&mut pages, "users"),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("users").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("$system").is_err());
        assert!(validate_name("a\0b").is_err());
    }
}
