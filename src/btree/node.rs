//! On-page layout of B-tree nodes.
//!
//! A node is decoded from and encoded to a whole page. Occupancy is measured
//! in encoded bytes against the usable page size (page size minus the
//! checksum trailer).
//!
//! ```text
//! Leaf:      [u8 type][u8 0][u16 count] then per entry
//!            [u16 key len][key][u8 kind] kind 0: [u32 len][bytes]
//!                                        kind 1: [u32 total len][u32 first overflow page]
//! Internal:  [u8 type][u8 0][u16 key count][u32 child 0] then per key
//!            [u16 key len][key][u32 child i + 1]
//! ```

use crate::{
    error::{DbError, DbResult},
    page::{ByteReader, Page, PageId, PageType},
};

const LEAF_HEADER_SIZE: usize = 4;
const INTERNAL_HEADER_SIZE: usize = 8;

const VALUE_INLINE: u8 = 0;
const VALUE_OVERFLOW: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeafValue {
    Inline(Vec<u8>),
    Overflow { len: u32, first_page: PageId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) value: LeafValue,
}

impl LeafEntry {
    pub(crate) fn encoded_size(&self) -> usize {
        let value = match &self.value {
            LeafValue::Inline(bytes) => 4 + bytes.len(),
            LeafValue::Overflow { .. } => 8,
        };
        2 + self.key.len() + 1 + value
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LeafNode {
    pub(crate) entries: Vec<LeafEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InternalNode {
    pub(crate) keys: Vec<Vec<u8>>,
    pub(crate) children: Vec<PageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

fn internal_entry_size(key: &[u8]) -> usize {
    2 + key.len() + 4
}

/// Index `i` in `1..sizes.len()` that splits `sizes` into two runs with the
/// smallest possible larger half.
fn balanced_split_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let mut best = 1;
    let mut best_cost = usize::MAX;
    let mut left = 0;
    for (i, size) in sizes.iter().enumerate().take(sizes.len() - 1) {
        left += size;
        let cost = left.max(total - left);
        if cost < best_cost {
            best_cost = cost;
            best = i + 1;
        }
    }
    best
}

impl LeafNode {
    pub(crate) fn encoded_size(&self) -> usize {
        LEAF_HEADER_SIZE + self.entries.iter().map(LeafEntry::encoded_size).sum::<usize>()
    }

    /// `Ok(slot)` if the key is present, otherwise `Err(insertion slot)`.
    pub(crate) fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
    }

    /// Move the upper part of the entries into a new node, balancing bytes.
    /// Returns the separator (first key of the right node) and the right node.
    pub(crate) fn split(&mut self) -> (Vec<u8>, LeafNode) {
        let sizes: Vec<usize> = self.entries.iter().map(LeafEntry::encoded_size).collect();
        let at = balanced_split_point(&sizes);
        let right = LeafNode {
            entries: self.entries.split_off(at),
        };
        (right.entries[0].key.clone(), right)
    }

    fn decode(reader: &mut ByteReader<'_>, count: usize) -> DbResult<Self> {
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = reader.u16()? as usize;
            let key = reader.take(key_len)?.to_vec();
            let value = match reader.u8()? {
                VALUE_INLINE => {
                    let len = reader.u32()? as usize;
                    LeafValue::Inline(reader.take(len)?.to_vec())
                }
                VALUE_OVERFLOW => LeafValue::Overflow {
                    len: reader.u32()?,
                    first_page: reader.u32()?,
                },
                other => {
                    return Err(DbError::corrupt(format!("unknown leaf value kind {other}")))
                }
            };
            entries.push(LeafEntry { key, value });
        }
        Ok(Self { entries })
    }
}

impl InternalNode {
    pub(crate) fn encoded_size(&self) -> usize {
        INTERNAL_HEADER_SIZE
            + self
                .keys
                .iter()
                .map(|key| internal_entry_size(key))
                .sum::<usize>()
    }

    /// Index of the child whose range contains `key`. Child `i` holds keys in
    /// `[keys[i - 1], keys[i])`.
    pub(crate) fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|separator| separator.as_slice() <= key)
    }

    /// Split around a middle key, which moves up to the parent.
    pub(crate) fn split(&mut self) -> (Vec<u8>, InternalNode) {
        let sizes: Vec<usize> = self.keys.iter().map(|key| internal_entry_size(key)).collect();
        let mid = if sizes.len() < 3 {
            1
        } else {
            // the middle key itself leaves both halves
            balanced_split_point(&sizes).clamp(1, sizes.len() - 2)
        };
        let right_keys = self.keys.split_off(mid + 1);
        let separator = self.keys.pop().unwrap_or_default();
        let right_children = self.children.split_off(mid + 1);
        (
            separator,
            InternalNode {
                keys: right_keys,
                children: right_children,
            },
        )
    }

    fn decode(reader: &mut ByteReader<'_>, count: usize) -> DbResult<Self> {
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        children.push(reader.u32()?);
        for _ in 0..count {
            let key_len = reader.u16()? as usize;
            keys.push(reader.take(key_len)?.to_vec());
            children.push(reader.u32()?);
        }
        Ok(Self { keys, children })
    }
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Node::Leaf(LeafNode::default())
    }

    pub(crate) fn encoded_size(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.encoded_size(),
            Node::Internal(internal) => internal.encoded_size(),
        }
    }

    pub(crate) fn decode(page: &Page, page_id: PageId) -> DbResult<Self> {
        let usable = &page.bytes()[..page.usable_size()];
        let mut reader = ByteReader::new(usable);
        let page_type = PageType::try_from(reader.u8()?)
            .map_err(|e| DbError::corrupt_page(page_id, e))?;
        reader.skip(1)?;
        let count = reader.u16()? as usize;
        let node = match page_type {
            PageType::BTreeLeaf => Node::Leaf(LeafNode::decode(&mut reader, count)?),
            PageType::BTreeInternal => Node::Internal(InternalNode::decode(&mut reader, count)?),
            other => {
                return Err(DbError::corrupt_page(
                    page_id,
                    format!("expected a B-tree node, found {other:?}"),
                ))
            }
        };
        Ok(node)
    }

    /// Serialize into a fresh page. The caller guarantees the node fits.
    pub(crate) fn encode(&self, page_size: usize) -> Page {
        let mut out = Vec::with_capacity(page_size);
        match self {
            Node::Leaf(leaf) => {
                out.push(PageType::BTreeLeaf as u8);
                out.push(0);
                out.extend_from_slice(&(leaf.entries.len() as u16).to_be_bytes());
                for entry in &leaf.entries {
                    out.extend_from_slice(&(entry.key.len() as u16).to_be_bytes());
                    out.extend_from_slice(&entry.key);
                    match &entry.value {
                        LeafValue::Inline(bytes) => {
                            out.push(VALUE_INLINE);
                            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                            out.extend_from_slice(bytes);
                        }
                        LeafValue::Overflow { len, first_page } => {
                            out.push(VALUE_OVERFLOW);
                            out.extend_from_slice(&len.to_be_bytes());
                            out.extend_from_slice(&first_page.to_be_bytes());
                        }
                    }
                }
            }
            Node::Internal(internal) => {
                out.push(PageType::BTreeInternal as u8);
                out.push(0);
                out.extend_from_slice(&(internal.keys.len() as u16).to_be_bytes());
                out.extend_from_slice(&internal.children[0].to_be_bytes());
                for (key, child) in internal.keys.iter().zip(&internal.children[1..]) {
                    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
                    out.extend_from_slice(key);
                    out.extend_from_slice(&child.to_be_bytes());
                }
            }
        }
        out.resize(page_size, 0);
        Page::from_bytes(out)
    }
}
