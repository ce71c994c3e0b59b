mod btree;
mod iterator;
mod node;

pub use btree::BTreeIndex;
pub use iterator::TreeScan;
pub use node::{TreeNodeHeader, TreeNodePage, RID_SIZE, TREE_NODE_HEADER_SIZE};

use crate::buffer::{PageNo, PAGE_SIZE};
use crate::catalog::DataType;

/// Composite key shape of one index: per-column types and fixed widths.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKeySchema {
    pub col_types: Vec<DataType>,
    pub col_lens: Vec<u32>,
    pub col_tot_len: u32,
}

impl IndexKeySchema {
    pub fn new(col_types: Vec<DataType>, col_lens: Vec<u32>) -> Self {
        let col_tot_len = col_lens.iter().sum();
        Self {
            col_types,
            col_lens,
            col_tot_len,
        }
    }

    pub fn num_cols(&self) -> usize {
        self.col_types.len()
    }

    /// Number of leading columns a probe key of `key_len` bytes covers.
    pub fn probe_cols(&self, key_len: usize) -> usize {
        let mut covered = 0usize;
        let mut cols = 0usize;
        for len in &self.col_lens {
            if covered >= key_len {
                break;
            }
            covered += *len as usize;
            cols += 1;
        }
        cols
    }
}

/// Header page (page 0) of an index file.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexFileHeader {
    pub root_page_no: PageNo,
    pub first_leaf: PageNo,
    pub last_leaf: PageNo,
    pub btree_order: u32,
    pub num_pages: u32,
    pub key_schema: IndexKeySchema,
}

impl IndexFileHeader {
    /// Node capacity: one slot beyond the order so a node can hold the
    /// overflowing entry while it is being split.
    pub fn capacity(&self) -> usize {
        self.btree_order as usize + 1
    }

    /// Underflow threshold for non-root nodes.
    pub fn min_size(&self) -> usize {
        self.capacity() / 2
    }

    /// Largest order whose node page (header + keys + rids) still fits a
    /// page.
    pub fn max_order_for(col_tot_len: u32) -> u32 {
        let per_entry = col_tot_len as usize + RID_SIZE;
        let available = PAGE_SIZE - TREE_NODE_HEADER_SIZE;
        (available / per_entry) as u32 - 1
    }
}

/// Position of an index iterator inside a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot_no: u32,
}

impl Iid {
    pub fn new(page_no: PageNo, slot_no: u32) -> Self {
        Self { page_no, slot_no }
    }
}
