//! B+tree over memcmp-ordered byte keys, stored in pages.
//!
//! The tree is addressed by its root page id, which never changes for the
//! life of the tree: a root split moves the root's entries into two new
//! children, and a root left with a single child absorbs that child.
//! Structural changes walk back up an explicit path stack instead of
//! recursing.

mod cursor;
#[cfg(test)]
pub(crate) mod mem;
mod node;
mod overflow;

use std::ops::Bound;

use tracing::debug;

use crate::{
    error::{DbError, DbResult},
    page::{PageId, PageRead, PageWrite, PAGE_TRAILER_SIZE},
};

pub use cursor::{RangeCursor, RangeIter};
use node::{InternalNode, LeafEntry, LeafNode, LeafValue, Node};

/// What to do when the key being inserted already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Fail with [`DbError::DuplicateKey`]
    Insert,
    /// Replace the stored value
    Upsert,
}

fn usable_size(page_size: usize) -> usize {
    page_size - PAGE_TRAILER_SIZE
}

/// Largest key accepted by a tree on pages of `page_size` bytes.
pub fn max_key_len(page_size: usize) -> usize {
    usable_size(page_size) / 8
}

/// Values longer than this are moved to an overflow chain.
fn inline_value_limit(page_size: usize) -> usize {
    usable_size(page_size) / 4
}

/// Minimum encoded size of a non-root node.
fn min_fill(page_size: usize) -> usize {
    usable_size(page_size) / 4
}

pub(super) fn load_node<P: PageRead>(pages: &P, page_id: PageId) -> DbResult<Node> {
    Node::decode(&pages.read_page(page_id)?, page_id)
}

fn store_node<P: PageWrite>(pages: &mut P, page_id: PageId, node: &Node) -> DbResult<()> {
    let page_size = pages.page_size();
    if node.encoded_size() > usable_size(page_size) {
        return Err(DbError::corrupt_page(page_id, "node does not fit in its page"));
    }
    pages.write_page(page_id, node.encode(page_size))
}

pub(super) fn resolve_value<P: PageRead>(pages: &P, value: &LeafValue) -> DbResult<Vec<u8>> {
    match value {
        LeafValue::Inline(bytes) => Ok(bytes.clone()),
        LeafValue::Overflow { len, first_page } => overflow::read_chain(pages, *first_page, *len),
    }
}

fn release_value<P: PageWrite>(pages: &mut P, value: &LeafValue) -> DbResult<()> {
    if let LeafValue::Overflow { len, first_page } = value {
        overflow::free_chain(pages, *first_page, *len)?;
    }
    Ok(())
}

/// An internal node on the way down, with the child slot that was taken.
struct PathEntry {
    page_id: PageId,
    node: InternalNode,
    child: usize,
}

/// Shape of a tree as seen by [`BTree::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: usize,
    pub entries: usize,
    pub leaf_pages: usize,
    pub internal_pages: usize,
    pub overflow_pages: usize,
}

impl TreeStats {
    pub fn total_pages(&self) -> usize {
        self.leaf_pages + self.internal_pages + self.overflow_pages
    }
}

/// Handle on one tree. Cheap to copy; all state lives in the pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTree {
    root: PageId,
}

impl BTree {
    pub fn open(root: PageId) -> Self {
        Self { root }
    }

    /// Allocate an empty root leaf.
    pub fn create<P: PageWrite>(pages: &mut P) -> DbResult<Self> {
        let root = pages.allocate_page()?;
        store_node(pages, root, &Node::empty_leaf())?;
        debug!(root, "created tree");
        Ok(Self { root })
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    /// Descend to the leaf that would hold `key`, recording the path.
    fn descend<P: PageRead>(
        &self,
        pages: &P,
        key: &[u8],
    ) -> DbResult<(Vec<PathEntry>, PageId, LeafNode)> {
        let mut path = Vec::new();
        let mut page_id = self.root;
        loop {
            match load_node(pages, page_id)? {
                Node::Internal(internal) => {
                    if internal.children.len() != internal.keys.len() + 1 {
                        return Err(DbError::corrupt_page(page_id, "child count does not match keys"));
                    }
                    let child = internal.child_index(key);
                    let next = internal.children[child];
                    path.push(PathEntry {
                        page_id,
                        node: internal,
                        child,
                    });
                    page_id = next;
                }
                Node::Leaf(leaf) => return Ok((path, page_id, leaf)),
            }
        }
    }

    /// Point lookup returning `None` for a missing key.
    pub fn lookup<P: PageRead>(&self, pages: &P, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let (_, _, leaf) = self.descend(pages, key)?;
        match leaf.search(key) {
            Ok(slot) => Ok(Some(resolve_value(pages, &leaf.entries[slot].value)?)),
            Err(_) => Ok(None),
        }
    }

    /// Point lookup failing with [`DbError::NotFound`] for a missing key.
    pub fn get<P: PageRead>(&self, pages: &P, key: &[u8]) -> DbResult<Vec<u8>> {
        self.lookup(pages, key)?
            .ok_or_else(|| DbError::NotFound(format!("key {}", hex(key))))
    }

    pub fn contains<P: PageRead>(&self, pages: &P, key: &[u8]) -> DbResult<bool> {
        let (_, _, leaf) = self.descend(pages, key)?;
        Ok(leaf.search(key).is_ok())
    }

    pub fn insert<P: PageWrite>(
        &self,
        pages: &mut P,
        key: &[u8],
        value: &[u8],
        mode: InsertMode,
    ) -> DbResult<()> {
        let page_size = pages.page_size();
        let max = max_key_len(page_size);
        if key.len() > max {
            return Err(DbError::KeyTooLarge { len: key.len(), max });
        }
        let (path, leaf_id, mut leaf) = self.descend(pages, key)?;
        let existing = leaf.search(key);
        if existing.is_ok() && mode == InsertMode::Insert {
            return Err(DbError::DuplicateKey(hex(key)));
        }
        let stored = if value.len() > inline_value_limit(page_size) {
            LeafValue::Overflow {
                len: value.len() as u32,
                first_page: overflow::write_chain(pages, value)?,
            }
        } else {
            LeafValue::Inline(value.to_vec())
        };
        match existing {
            Ok(slot) => {
                let old = std::mem::replace(&mut leaf.entries[slot].value, stored);
                release_value(pages, &old)?;
            }
            Err(slot) => leaf.entries.insert(
                slot,
                LeafEntry {
                    key: key.to_vec(),
                    value: stored,
                },
            ),
        }
        self.rebalance(pages, path, leaf_id, Node::Leaf(leaf))
    }

    /// Remove `key`, failing with [`DbError::NotFound`] if it is absent.
    pub fn delete<P: PageWrite>(&self, pages: &mut P, key: &[u8]) -> DbResult<()> {
        let (path, leaf_id, mut leaf) = self.descend(pages, key)?;
        let slot = leaf
            .search(key)
            .map_err(|_| DbError::NotFound(format!("key {}", hex(key))))?;
        let removed = leaf.entries.remove(slot);
        release_value(pages, &removed.value)?;
        self.rebalance(pages, path, leaf_id, Node::Leaf(leaf))
    }

    /// Write `node` back to `page_id`, splitting, borrowing or merging up the
    /// path until every touched node is within bounds.
    fn rebalance<P: PageWrite>(
        &self,
        pages: &mut P,
        mut path: Vec<PathEntry>,
        mut page_id: PageId,
        mut node: Node,
    ) -> DbResult<()> {
        let page_size = pages.page_size();
        let capacity = usable_size(page_size);
        loop {
            let size = node.encoded_size();
            if size > capacity {
                let (separator, right) = match &mut node {
                    Node::Leaf(leaf) => {
                        let (separator, right) = leaf.split();
                        (separator, Node::Leaf(right))
                    }
                    Node::Internal(internal) => {
                        let (separator, right) = internal.split();
                        (separator, Node::Internal(right))
                    }
                };
                let Some(parent) = path.pop() else {
                    let left_id = pages.allocate_page()?;
                    let right_id = pages.allocate_page()?;
                    store_node(pages, left_id, &node)?;
                    store_node(pages, right_id, &right)?;
                    let root = Node::Internal(InternalNode {
                        keys: vec![separator],
                        children: vec![left_id, right_id],
                    });
                    debug!(root = self.root, left_id, right_id, "split root");
                    return store_node(pages, self.root, &root);
                };
                let right_id = pages.allocate_page()?;
                store_node(pages, page_id, &node)?;
                store_node(pages, right_id, &right)?;
                debug!(page_id, right_id, "split node");
                let PathEntry {
                    page_id: parent_id,
                    node: mut parent_node,
                    child,
                } = parent;
                parent_node.keys.insert(child, separator);
                parent_node.children.insert(child + 1, right_id);
                page_id = parent_id;
                node = Node::Internal(parent_node);
                continue;
            }

            let Some(parent) = path.pop() else {
                // root: absorb a lone child
                if let Node::Internal(internal) = &node {
                    if internal.keys.is_empty() {
                        let child_id = internal.children[0];
                        let child = load_node(pages, child_id)?;
                        store_node(pages, self.root, &child)?;
                        pages.free_page(child_id)?;
                        debug!(root = self.root, child_id, "collapsed root");
                        return Ok(());
                    }
                }
                return store_node(pages, page_id, &node);
            };

            if size >= min_fill(page_size) {
                return store_node(pages, page_id, &node);
            }

            let PathEntry {
                page_id: parent_id,
                node: mut parent_node,
                child,
            } = parent;
            if parent_node.children.len() < 2 {
                return Err(DbError::corrupt_page(parent_id, "internal node without siblings"));
            }
            let left_slot = if child > 0 { child - 1 } else { child };
            let left_id = parent_node.children[left_slot];
            let right_id = parent_node.children[left_slot + 1];
            let (left, right) = if child > 0 {
                (load_node(pages, left_id)?, node)
            } else {
                (node, load_node(pages, right_id)?)
            };
            let separator = parent_node.keys[left_slot].clone();

            match Self::join(left, right, separator, capacity, parent_id)? {
                Joined::Merged(merged) => {
                    store_node(pages, left_id, &merged)?;
                    pages.free_page(right_id)?;
                    parent_node.keys.remove(left_slot);
                    parent_node.children.remove(left_slot + 1);
                    debug!(left_id, right_id, "merged nodes");
                }
                Joined::Redistributed(left, separator, right) => {
                    store_node(pages, left_id, &left)?;
                    store_node(pages, right_id, &right)?;
                    parent_node.keys[left_slot] = separator;
                    debug!(left_id, right_id, "redistributed nodes");
                }
            }
            page_id = parent_id;
            node = Node::Internal(parent_node);
        }
    }

    /// Combine two adjacent siblings into one node if they fit, otherwise
    /// share their entries evenly.
    fn join(
        left: Node,
        right: Node,
        separator: Vec<u8>,
        capacity: usize,
        parent_id: PageId,
    ) -> DbResult<Joined> {
        match (left, right) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.entries.extend(right.entries);
                if left.encoded_size() <= capacity {
                    return Ok(Joined::Merged(Node::Leaf(left)));
                }
                let (separator, right) = left.split();
                Ok(Joined::Redistributed(Node::Leaf(left), separator, Node::Leaf(right)))
            }
            (Node::Internal(mut left), Node::Internal(right)) => {
                left.keys.push(separator);
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                if left.encoded_size() <= capacity {
                    return Ok(Joined::Merged(Node::Internal(left)));
                }
                let (separator, right) = left.split();
                Ok(Joined::Redistributed(
                    Node::Internal(left),
                    separator,
                    Node::Internal(right),
                ))
            }
            _ => Err(DbError::corrupt_page(
                parent_id,
                "children of one node sit at different levels",
            )),
        }
    }

    /// Lazy ordered scan over `[start, end)` style bounds.
    pub fn range_scan<'a, P: PageRead>(
        &self,
        pages: &'a P,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
    ) -> RangeIter<'a, P> {
        RangeIter::new(pages, self.cursor(start, end))
    }

    /// A detached cursor, for callers that re-acquire their page set per step.
    pub fn cursor(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> RangeCursor {
        RangeCursor::new(self.root, start, end)
    }

    /// Number of levels from the root to the leaves.
    pub fn height<P: PageRead>(&self, pages: &P) -> DbResult<usize> {
        let mut height = 1;
        let mut page_id = self.root;
        while let Node::Internal(internal) = load_node(pages, page_id)? {
            height += 1;
            page_id = internal.children[0];
        }
        Ok(height)
    }

    /// Entry count, by walking every leaf.
    pub fn len<P: PageRead>(&self, pages: &P) -> DbResult<usize> {
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(page_id) = stack.pop() {
            match load_node(pages, page_id)? {
                Node::Internal(internal) => stack.extend(internal.children),
                Node::Leaf(leaf) => count += leaf.entries.len(),
            }
        }
        Ok(count)
    }

    pub fn is_empty<P: PageRead>(&self, pages: &P) -> DbResult<bool> {
        Ok(match load_node(pages, self.root)? {
            Node::Leaf(leaf) => leaf.entries.is_empty(),
            Node::Internal(_) => false,
        })
    }

    /// Free every page of the tree, the root included.
    pub fn destroy<P: PageWrite>(self, pages: &mut P) -> DbResult<()> {
        let mut stack = vec![self.root];
        while let Some(page_id) = stack.pop() {
            match load_node(pages, page_id)? {
                Node::Internal(internal) => stack.extend(internal.children),
                Node::Leaf(leaf) => {
                    for entry in &leaf.entries {
                        release_value(pages, &entry.value)?;
                    }
                }
            }
            pages.free_page(page_id)?;
        }
        debug!(root = self.root, "destroyed tree");
        Ok(())
    }

    /// Verify ordering, separator bounds, fill and uniform leaf depth.
    pub fn check<P: PageRead>(&self, pages: &P) -> DbResult<TreeStats> {
        let page_size = pages.page_size();
        let capacity = usable_size(page_size);
        let mut stats = TreeStats::default();
        let mut leaf_depth: Option<usize> = None;
        // (page, depth, lower bound inclusive, upper bound exclusive)
        let mut stack: Vec<(PageId, usize, Option<Vec<u8>>, Option<Vec<u8>>)> =
            vec![(self.root, 1, None, None)];

        while let Some((page_id, depth, lower, upper)) = stack.pop() {
            let node = load_node(pages, page_id)?;
            let size = node.encoded_size();
            if size > capacity {
                return Err(DbError::corrupt_page(page_id, "node overflows its page"));
            }
            if page_id != self.root && size < min_fill(page_size) {
                return Err(DbError::corrupt_page(
                    page_id,
                    format!("node holds {size} bytes, below the minimum fill"),
                ));
            }
            let keys: Vec<&[u8]> = match &node {
                Node::Leaf(leaf) => leaf.entries.iter().map(|e| e.key.as_slice()).collect(),
                Node::Internal(internal) => internal.keys.iter().map(Vec::as_slice).collect(),
            };
            if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(DbError::corrupt_page(page_id, "keys are not strictly increasing"));
            }
            let out_of_bounds = keys.iter().any(|key| {
                lower.as_deref().is_some_and(|lower| *key < lower)
                    || upper.as_deref().is_some_and(|upper| *key >= upper)
            });
            if out_of_bounds {
                return Err(DbError::corrupt_page(page_id, "key outside its separator bounds"));
            }

            match node {
                Node::Leaf(leaf) => {
                    stats.leaf_pages += 1;
                    stats.entries += leaf.entries.len();
                    match leaf_depth {
                        None => leaf_depth = Some(depth),
                        Some(expected) if expected != depth => {
                            return Err(DbError::corrupt_page(page_id, "leaves at different depths"))
                        }
                        Some(_) => {}
                    }
                    for entry in &leaf.entries {
                        if let LeafValue::Overflow { len, first_page } = entry.value {
                            stats.overflow_pages +=
                                overflow::chain_pages(pages, first_page, len)?.len();
                        }
                    }
                }
                Node::Internal(internal) => {
                    stats.internal_pages += 1;
                    if internal.keys.is_empty() || internal.children.len() != internal.keys.len() + 1 {
                        return Err(DbError::corrupt_page(page_id, "malformed internal node"));
                    }
                    for (i, child) in internal.children.iter().enumerate() {
                        let child_lower = if i == 0 {
                            lower.clone()
                        } else {
                            Some(internal.keys[i - 1].clone())
                        };
                        let child_upper = if i == internal.keys.len() {
                            upper.clone()
                        } else {
                            Some(internal.keys[i].clone())
                        };
                        stack.push((*child, depth + 1, child_lower, child_upper));
                    }
                }
            }
        }
        stats.height = leaf_depth.unwrap_or(1);
        Ok(stats)
    }
}

enum Joined {
    Merged(Node),
    Redistributed(Node, Vec<u8>, Node),
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
