//! Filters, update operators and access-path selection.

mod filter;
mod update;

use std::fmt;

pub use filter::{Filter, KeyRange, Op, Predicate};
pub use update::{Update, UpdateOp};

use crate::catalog::CollectionMeta;

/// How a filter is executed against one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Range over the primary tree, driven by `_id` predicates
    PrimaryRange(KeyRange),
    /// Range over a secondary index, fetching documents by primary key
    IndexRange { field: String, range: KeyRange },
    /// Every document in primary-key order
    FullScan,
}

/// Intersection of every seekable predicate on `field`.
fn range_on(filter: &Filter, field: &str) -> Option<KeyRange> {
    filter
        .predicates()
        .iter()
        .filter(|predicate| predicate.field == field)
        .filter_map(Predicate::key_range)
        .reduce(KeyRange::intersect)
}

impl Plan {
    /// Pick the access path. The driving predicates are still re-checked on
    /// every fetched document along with the rest of the filter.
    pub fn choose(meta: &CollectionMeta, filter: &Filter) -> Self {
        if let Some(range) = range_on(filter, "_id") {
            return Plan::PrimaryRange(range);
        }
        filter
            .predicates()
            .iter()
            .filter(|predicate| predicate.is_seekable() && meta.index(&predicate.field).is_some())
            .find_map(|predicate| {
                range_on(filter, &predicate.field).map(|range| Plan::IndexRange {
                    field: predicate.field.clone(),
                    range,
                })
            })
            .unwrap_or(Plan::FullScan)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::PrimaryRange(_) => write!(f, "primary key range"),
            Plan::IndexRange { field, .. } => write!(f, "index range on {field}"),
            Plan::FullScan => write!(f, "full scan"),
        }
    }
}
