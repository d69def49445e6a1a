//! An embedded, single-file document store.
//!
//! Documents live in B-trees on fixed-size pages of one data file. A single
//! writer transaction stages page images in memory and commits them through
//! a write-ahead journal; readers see whole committed transactions only.
//!
//! ```no_run
//! use simpledoc::{doc, Config, Database};
//!
//! let db = Database::open("app.db", Config::default())?;
//! let people = db.collection("people");
//! people.create_index("age")?;
//! people.insert_one(doc! { "name" => "Ada", "age" => 36 })?;
//! for person in people.find(doc! { "age" => doc! { "$gte" => 30 } })? {
//!     println!("{}", person?);
//! }
//! # Ok::<(), simpledoc::DbError>(())
//! ```

pub mod bson;
pub mod btree;
mod cache;
pub mod catalog;
mod collection;
pub mod config;
mod db;
pub mod error;
mod file_manager;
mod journal;
pub mod page;
pub mod query;
mod store;
#[cfg(test)]
mod test_utils;
mod txn;

pub use bson::{Document, ObjectId, Value};
pub use cache::CacheStats;
pub use catalog::IndexMeta;
pub use collection::{Collection, Cursor, TxnCollection, TxnCursor, UpdateResult};
pub use config::{Config, SyncMode};
pub use db::{CheckReport, CollectionCheck, Database, DbStats};
pub use error::{DbError, DbResult};
pub use query::Plan;
pub use store::{PageStore, Snapshot};
pub use txn::Transaction;
