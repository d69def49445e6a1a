//! Restartable range cursors.
//!
//! A cursor remembers the root-to-leaf path it is walking as `(page_id,
//! child slot)` pairs, a buffered copy of the current leaf and the last key it
//! returned. When the caller reports a different generation than the one the
//! path was built under, the path is thrown away and the cursor re-seeks to
//! just after the last returned key.

use std::ops::Bound;

use crate::{
    error::DbResult,
    page::{PageId, PageRead},
};

use super::{
    load_node,
    node::{LeafEntry, Node},
    resolve_value,
};

pub(crate) fn owned_bound(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(key.to_vec()),
        Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

#[derive(Debug, Clone)]
pub struct RangeCursor {
    root: PageId,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    path: Vec<(PageId, usize)>,
    leaf: Option<(PageId, Vec<LeafEntry>)>,
    slot: usize,
    last_key: Option<Vec<u8>>,
    generation: Option<u64>,
    done: bool,
}

impl RangeCursor {
    pub fn new(root: PageId, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Self {
        Self {
            root,
            start: owned_bound(start),
            end: owned_bound(end),
            path: Vec::new(),
            leaf: None,
            slot: 0,
            last_key: None,
            generation: None,
            done: false,
        }
    }

    /// The last key handed out, if any.
    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Current position as `(page_id, slot)` from the root down to the leaf.
    pub fn position(&self) -> Vec<(PageId, usize)> {
        let mut position = self.path.clone();
        if let Some((leaf_id, _)) = &self.leaf {
            position.push((*leaf_id, self.slot));
        }
        position
    }

    /// Advance and return the next `(key, value)` in range. `generation`
    /// identifies the page set the caller is reading; a change forces a
    /// re-seek.
    pub fn next<P: PageRead>(
        &mut self,
        pages: &P,
        generation: u64,
    ) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        if self.generation != Some(generation) {
            self.seek(pages)?;
            self.generation = Some(generation);
        }
        loop {
            let Some((_, entries)) = &self.leaf else {
                self.done = true;
                return Ok(None);
            };
            if let Some(entry) = entries.get(self.slot) {
                if !self.below_end(&entry.key) {
                    self.done = true;
                    self.leaf = None;
                    return Ok(None);
                }
                let key = entry.key.clone();
                let value = resolve_value(pages, &entry.value)?;
                self.slot += 1;
                self.last_key = Some(key.clone());
                return Ok(Some((key, value)));
            }
            self.next_leaf(pages)?;
        }
    }

    fn below_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
            Bound::Unbounded => true,
        }
    }

    fn lower_bound(&self) -> Bound<Vec<u8>> {
        match &self.last_key {
            Some(last) => Bound::Excluded(last.clone()),
            None => self.start.clone(),
        }
    }

    /// Rebuild the path down to the first entry at or after the lower bound.
    fn seek<P: PageRead>(&mut self, pages: &P) -> DbResult<()> {
        self.path.clear();
        let lower = self.lower_bound();
        let mut page_id = self.root;
        loop {
            match load_node(pages, page_id)? {
                Node::Internal(internal) => {
                    let idx = match &lower {
                        Bound::Included(key) | Bound::Excluded(key) => internal.child_index(key),
                        Bound::Unbounded => 0,
                    };
                    self.path.push((page_id, idx));
                    page_id = internal.children[idx];
                }
                Node::Leaf(leaf) => {
                    self.slot = match &lower {
                        Bound::Included(key) => leaf
                            .entries
                            .partition_point(|entry| entry.key.as_slice() < key.as_slice()),
                        Bound::Excluded(key) => leaf
                            .entries
                            .partition_point(|entry| entry.key.as_slice() <= key.as_slice()),
                        Bound::Unbounded => 0,
                    };
                    self.leaf = Some((page_id, leaf.entries));
                    return Ok(());
                }
            }
        }
    }

    /// Move to the leftmost leaf of the next subtree along the path.
    fn next_leaf<P: PageRead>(&mut self, pages: &P) -> DbResult<()> {
        self.leaf = None;
        while let Some((page_id, idx)) = self.path.pop() {
            let Node::Internal(internal) = load_node(pages, page_id)? else {
                continue;
            };
            if idx + 1 >= internal.children.len() {
                continue;
            }
            self.path.push((page_id, idx + 1));
            let mut child = internal.children[idx + 1];
            loop {
                match load_node(pages, child)? {
                    Node::Internal(internal) => {
                        self.path.push((child, 0));
                        child = internal.children[0];
                    }
                    Node::Leaf(leaf) => {
                        self.slot = 0;
                        self.leaf = Some((child, leaf.entries));
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Iterator over a range of one page set that cannot change while borrowed.
pub struct RangeIter<'a, P: PageRead> {
    pages: &'a P,
    cursor: RangeCursor,
}

impl<'a, P: PageRead> RangeIter<'a, P> {
    pub(crate) fn new(pages: &'a P, cursor: RangeCursor) -> Self {
        Self { pages, cursor }
    }
}

impl<P: PageRead> Iterator for RangeIter<'_, P> {
    type Item = DbResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next(self.pages, 0).transpose()
    }
}
