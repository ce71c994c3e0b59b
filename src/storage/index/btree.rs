use log::debug;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, FileId, PageId, PageNo, PageRef, INVALID_PAGE_NO};
use crate::error::{QuarryError, QuarryResult};
use crate::expression::compare_key_prefix;
use crate::storage::codec::{IndexFileHeaderCodec, TreeNodePageCodec};
use crate::storage::index::{Iid, IndexFileHeader, IndexKeySchema, TreeNodePage};
use crate::storage::Rid;
use crate::transaction::Transaction;

/// Ordered multi-column index mapping composite keys to data rids.
///
/// A single per-tree mutex (around the cached file header) serializes
/// lookups, mutations and iterator setup; the header page is written
/// through at the end of every mutating operation.
#[derive(Debug)]
pub struct BTreeIndex {
    file_id: FileId,
    buffer_pool: Arc<BufferPoolManager>,
    state: Mutex<IndexFileHeader>,
}

impl BTreeIndex {
    /// Initialize a fresh index file: page 0 receives the file header.
    /// `order` defaults to the largest value fitting a page.
    pub fn create(
        buffer_pool: Arc<BufferPoolManager>,
        file_id: FileId,
        key_schema: IndexKeySchema,
        order: Option<u32>,
    ) -> QuarryResult<Self> {
        let max_order = IndexFileHeader::max_order_for(key_schema.col_tot_len);
        let btree_order = order.unwrap_or(max_order);
        if btree_order < 2 || btree_order > max_order {
            return Err(QuarryError::Storage(format!(
                "btree order {btree_order} out of range 2..={max_order}"
            )));
        }
        let header = IndexFileHeader {
            root_page_no: INVALID_PAGE_NO,
            first_leaf: INVALID_PAGE_NO,
            last_leaf: INVALID_PAGE_NO,
            btree_order,
            num_pages: 0,
            key_schema,
        };

        let header_page = buffer_pool.new_page(file_id)?;
        if header_page.page_id().page_no != 0 {
            return Err(QuarryError::Internal(
                "index file header must land on page 0 of a fresh file".to_string(),
            ));
        }
        header_page
            .write()
            .set_data(&IndexFileHeaderCodec::encode(&header));

        Ok(Self {
            file_id,
            buffer_pool,
            state: Mutex::new(header),
        })
    }

    pub fn open(buffer_pool: Arc<BufferPoolManager>, file_id: FileId) -> QuarryResult<Self> {
        let header_page = buffer_pool.fetch_page(PageId::new(file_id, 0))?;
        let (header, _) = IndexFileHeaderCodec::decode(header_page.read().data())?;
        drop(header_page);
        Ok(Self {
            file_id,
            buffer_pool,
            state: Mutex::new(header),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn key_schema(&self) -> IndexKeySchema {
        self.state.lock().key_schema.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().root_page_no == INVALID_PAGE_NO
    }

    pub fn order(&self) -> u32 {
        self.state.lock().btree_order
    }

    /// Point lookup. At most one rid per key (duplicate keys are
    /// rejected on insert).
    pub fn get_value(&self, key: &[u8]) -> QuarryResult<Vec<Rid>> {
        let hdr = self.state.lock();
        if hdr.root_page_no == INVALID_PAGE_NO {
            return Ok(Vec::new());
        }
        self.check_key(&hdr, key)?;
        let (_leaf_ref, leaf, _) = self.find_leaf(&hdr, key, hdr.key_schema.num_cols())?;
        Ok(leaf.leaf_lookup(&hdr.key_schema, key)?.into_iter().collect())
    }

    /// Insert a key/rid pair. Returns false (and changes nothing) when
    /// the key is already present.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> QuarryResult<bool> {
        let mut hdr = self.state.lock();
        self.check_key(&hdr, key)?;

        if hdr.root_page_no == INVALID_PAGE_NO {
            let (node_ref, mut node, node_no) = self.create_node(&mut hdr, true)?;
            node.insert(&hdr.key_schema, key, rid)?;
            self.write_node(&node_ref, &hdr, &node);
            hdr.root_page_no = node_no;
            hdr.first_leaf = node_no;
            hdr.last_leaf = node_no;
            self.write_header(&hdr)?;
            debug!("index {} started new tree at page {}", self.file_id, node_no);
            return Ok(true);
        }

        let (leaf_ref, mut leaf, leaf_no) = self.find_leaf(&hdr, key, hdr.key_schema.num_cols())?;
        let old_size = leaf.size();
        let insert_at = leaf.lower_bound(&hdr.key_schema, key)?;
        let new_size = leaf.insert(&hdr.key_schema, key, rid)?;
        if new_size == old_size {
            return Ok(false);
        }

        if new_size == hdr.capacity() {
            self.split_and_insert_parent(&mut hdr, leaf_ref, leaf, leaf_no)?;
        } else {
            self.write_node(&leaf_ref, &hdr, &leaf);
            drop(leaf_ref);
        }
        // an insert at slot 0 changes the separators above
        if insert_at == 0 && old_size > 0 {
            self.maintain_parent(&hdr, leaf_no)?;
        }
        self.write_header(&hdr)?;
        Ok(true)
    }

    /// Delete a key. Returns false when the key is absent. Pages freed
    /// by merges are recorded in the transaction's deletion set.
    pub fn delete_entry(&self, key: &[u8], txn: Option<&Transaction>) -> QuarryResult<bool> {
        let mut hdr = self.state.lock();
        self.check_key(&hdr, key)?;
        if hdr.root_page_no == INVALID_PAGE_NO {
            return Ok(false);
        }

        let (leaf_ref, mut leaf, leaf_no) = self.find_leaf(&hdr, key, hdr.key_schema.num_cols())?;
        let idx = leaf.lower_bound(&hdr.key_schema, key)?;
        let found = idx < leaf.size()
            && compare_key_prefix(
                &leaf.keys[idx],
                key,
                &hdr.key_schema.col_types,
                &hdr.key_schema.col_lens,
                hdr.key_schema.num_cols(),
            )? == Ordering::Equal;
        if !found {
            return Ok(false);
        }

        leaf.erase_pair(idx);
        self.write_node(&leaf_ref, &hdr, &leaf);
        let remaining = leaf.size();
        drop(leaf_ref);

        if idx == 0 && remaining > 0 {
            self.maintain_parent(&hdr, leaf_no)?;
        }
        if leaf_no == hdr.root_page_no || remaining < hdr.min_size() {
            self.coalesce_or_redistribute(&mut hdr, leaf_no, txn)?;
        }
        self.write_header(&hdr)?;
        Ok(true)
    }

    /// Iid of the first entry `>= key` (`key` may cover only a leading
    /// prefix of the index columns).
    pub fn lower_bound(&self, key: &[u8]) -> QuarryResult<Iid> {
        self.bound(key, false)
    }

    /// Iid of the first entry `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> QuarryResult<Iid> {
        self.bound(key, true)
    }

    pub fn leaf_begin(&self) -> Iid {
        let hdr = self.state.lock();
        Iid::new(hdr.first_leaf, 0)
    }

    /// One past the last entry of the last leaf.
    pub fn leaf_end(&self) -> QuarryResult<Iid> {
        let hdr = self.state.lock();
        if hdr.last_leaf == INVALID_PAGE_NO {
            return Ok(Iid::new(INVALID_PAGE_NO, 0));
        }
        let (_page_ref, node) = self.fetch_node(&hdr, hdr.last_leaf)?;
        Ok(Iid::new(hdr.last_leaf, node.size() as u32))
    }

    /// Data rid stored at an iterator position.
    pub fn get_rid(&self, iid: Iid) -> QuarryResult<Rid> {
        let hdr = self.state.lock();
        if iid.page_no == INVALID_PAGE_NO {
            return Err(QuarryError::IndexEntryNotFound);
        }
        let (_page_ref, node) = self.fetch_node(&hdr, iid.page_no)?;
        if iid.slot_no as usize >= node.size() {
            return Err(QuarryError::IndexEntryNotFound);
        }
        Ok(node.rids[iid.slot_no as usize])
    }

    /// Size and successor of a leaf; drives iterator advancement.
    pub(crate) fn leaf_info(&self, page_no: PageNo) -> QuarryResult<(u32, PageNo)> {
        let hdr = self.state.lock();
        if page_no == INVALID_PAGE_NO {
            return Err(QuarryError::IndexEntryNotFound);
        }
        let (_page_ref, node) = self.fetch_node(&hdr, page_no)?;
        Ok((node.size() as u32, node.header.next_leaf))
    }

    pub fn flush(&self) -> QuarryResult<()> {
        self.buffer_pool.flush_all_pages(self.file_id)
    }

    fn check_key(&self, hdr: &IndexFileHeader, key: &[u8]) -> QuarryResult<()> {
        if key.len() != hdr.key_schema.col_tot_len as usize {
            return Err(QuarryError::Storage(format!(
                "composite key is {} bytes, index keys are {}",
                key.len(),
                hdr.key_schema.col_tot_len
            )));
        }
        Ok(())
    }

    fn fetch_node(
        &self,
        hdr: &IndexFileHeader,
        page_no: PageNo,
    ) -> QuarryResult<(PageRef, TreeNodePage)> {
        let page_ref = self
            .buffer_pool
            .fetch_page(PageId::new(self.file_id, page_no))?;
        let node = TreeNodePageCodec::decode(page_ref.read().data(), hdr)?;
        Ok((page_ref, node))
    }

    fn write_node(&self, page_ref: &PageRef, hdr: &IndexFileHeader, node: &TreeNodePage) {
        page_ref.write().set_data(&TreeNodePageCodec::encode(node, hdr));
    }

    fn write_header(&self, hdr: &IndexFileHeader) -> QuarryResult<()> {
        let page = self.buffer_pool.fetch_page(PageId::new(self.file_id, 0))?;
        page.write().set_data(&IndexFileHeaderCodec::encode(hdr));
        Ok(())
    }

    fn create_node(
        &self,
        hdr: &mut IndexFileHeader,
        is_leaf: bool,
    ) -> QuarryResult<(PageRef, TreeNodePage, PageNo)> {
        let page_ref = self.buffer_pool.new_page(self.file_id)?;
        let page_no = page_ref.page_id().page_no;
        hdr.num_pages += 1;
        let node = if is_leaf {
            TreeNodePage::new_leaf()
        } else {
            TreeNodePage::new_internal()
        };
        Ok((page_ref, node, page_no))
    }

    /// Free a node's page: the file header's page count shrinks and the
    /// frame is surrendered. Always paired; a pinned page here is a
    /// pin-discipline violation.
    fn release_node_handle(
        &self,
        hdr: &mut IndexFileHeader,
        page_no: PageNo,
        txn: Option<&Transaction>,
    ) -> QuarryResult<()> {
        hdr.num_pages -= 1;
        let page_id = PageId::new(self.file_id, page_no);
        if !self.buffer_pool.delete_page(page_id)? {
            return Err(QuarryError::Internal(format!(
                "released index node {page_no} is still pinned"
            )));
        }
        if let Some(txn) = txn {
            txn.record_freed_index_page(page_id);
        }
        debug!("index {} released node page {}", self.file_id, page_no);
        Ok(())
    }

    /// Root-to-leaf descent. The probe may cover only the leading
    /// `num_cols` columns.
    fn find_leaf(
        &self,
        hdr: &IndexFileHeader,
        key: &[u8],
        num_cols: usize,
    ) -> QuarryResult<(PageRef, TreeNodePage, PageNo)> {
        let mut page_no = hdr.root_page_no;
        loop {
            let (page_ref, node) = self.fetch_node(hdr, page_no)?;
            if node.is_leaf() {
                return Ok((page_ref, node, page_no));
            }
            page_no = node.internal_lookup_by(|entry| {
                compare_key_prefix(
                    entry,
                    key,
                    &hdr.key_schema.col_types,
                    &hdr.key_schema.col_lens,
                    num_cols,
                )
            })?;
        }
    }

    /// Split an overflowing node: the right half moves to a fresh
    /// sibling, the leaf chain and `last_leaf` are patched, and the
    /// sibling's first key is pushed into the parent (recursively).
    fn split_and_insert_parent(
        &self,
        hdr: &mut IndexFileHeader,
        node_ref: PageRef,
        mut node: TreeNodePage,
        node_no: PageNo,
    ) -> QuarryResult<()> {
        let split_at = hdr.capacity() / 2;
        let (keys, rids) = node.split_off(split_at);
        let (sib_ref, mut sibling, sib_no) = self.create_node(hdr, node.is_leaf())?;
        sibling.header.parent = node.header.parent;
        sibling.absorb(keys, rids);
        debug!(
            "index {} split node {} into sibling {} ({} | {} keys)",
            self.file_id,
            node_no,
            sib_no,
            node.size(),
            sibling.size()
        );

        if node.is_leaf() {
            sibling.header.prev_leaf = node_no;
            sibling.header.next_leaf = node.header.next_leaf;
            if node.header.next_leaf != INVALID_PAGE_NO {
                let (next_ref, mut next) = self.fetch_node(hdr, node.header.next_leaf)?;
                next.header.prev_leaf = sib_no;
                self.write_node(&next_ref, hdr, &next);
            } else {
                hdr.last_leaf = sib_no;
            }
            node.header.next_leaf = sib_no;
        }

        let parent_no = node.header.parent;
        let node_first = node.first_key().to_vec();
        let split_key = sibling.first_key().to_vec();
        self.write_node(&node_ref, hdr, &node);
        self.write_node(&sib_ref, hdr, &sibling);
        if !sibling.is_leaf() {
            for i in 0..sibling.size() {
                self.maintain_child(hdr, &sibling, sib_no, i)?;
            }
        }
        drop(node_ref);
        drop(sib_ref);
        self.insert_into_parent(hdr, node_no, node_first, parent_no, split_key, sib_no)
    }

    fn insert_into_parent(
        &self,
        hdr: &mut IndexFileHeader,
        left_no: PageNo,
        left_first_key: Vec<u8>,
        parent_no: PageNo,
        key: Vec<u8>,
        right_no: PageNo,
    ) -> QuarryResult<()> {
        if parent_no == INVALID_PAGE_NO {
            // the root split: a new root one level up takes both halves
            let (root_ref, mut root, root_no) = self.create_node(hdr, false)?;
            root.insert_pair(0, left_first_key, Rid::new(left_no, 0));
            root.insert_pair(1, key, Rid::new(right_no, 0));
            self.write_node(&root_ref, hdr, &root);
            drop(root_ref);
            hdr.root_page_no = root_no;
            for child_no in [left_no, right_no] {
                let (child_ref, mut child) = self.fetch_node(hdr, child_no)?;
                child.header.parent = root_no;
                self.write_node(&child_ref, hdr, &child);
            }
            debug!("index {} grew a new root at page {}", self.file_id, root_no);
            return Ok(());
        }

        let (parent_ref, mut parent) = self.fetch_node(hdr, parent_no)?;
        parent.insert(&hdr.key_schema, &key, Rid::new(right_no, 0))?;
        if parent.size() == hdr.capacity() {
            self.split_and_insert_parent(hdr, parent_ref, parent, parent_no)
        } else {
            self.write_node(&parent_ref, hdr, &parent);
            Ok(())
        }
    }

    /// Repair an underflowing node, preferring redistribution from the
    /// left predecessor, merging otherwise; recurses up the tree.
    fn coalesce_or_redistribute(
        &self,
        hdr: &mut IndexFileHeader,
        node_no: PageNo,
        txn: Option<&Transaction>,
    ) -> QuarryResult<()> {
        let (node_ref, node) = self.fetch_node(hdr, node_no)?;
        if node_no == hdr.root_page_no {
            return self.adjust_root(hdr, node_ref, node, node_no, txn);
        }
        if node.size() >= hdr.min_size() {
            return Ok(());
        }

        let parent_no = node.header.parent;
        let (parent_ref, mut parent) = self.fetch_node(hdr, parent_no)?;
        let node_idx = parent.find_child(node_no).ok_or_else(|| {
            QuarryError::Internal(format!(
                "node {node_no} missing from its parent {parent_no}"
            ))
        })?;
        // prefer the left predecessor; the leftmost child takes its
        // right successor
        let nbr_idx = if node_idx > 0 { node_idx - 1 } else { node_idx + 1 };
        let nbr_no = parent.value_at(nbr_idx);
        let (nbr_ref, mut nbr) = self.fetch_node(hdr, nbr_no)?;

        if node.size() + nbr.size() >= 2 * hdr.min_size() {
            let mut node = node;
            self.redistribute(hdr, &mut node, node_no, node_idx, &mut nbr, nbr_idx, &mut parent)?;
            self.write_node(&node_ref, hdr, &node);
            self.write_node(&nbr_ref, hdr, &nbr);
            self.write_node(&parent_ref, hdr, &parent);
            drop(node_ref);
            drop(nbr_ref);
            drop(parent_ref);
            self.maintain_parent(hdr, node_no)?;
            self.maintain_parent(hdr, nbr_no)?;
            return Ok(());
        }

        // merge right-into-left; swap so the neighbor is the left node
        let (left_no, left_ref, mut left, right_no, right_ref, right) = if node_idx > 0 {
            (nbr_no, nbr_ref, nbr, node_no, node_ref, node)
        } else {
            (node_no, node_ref, node, nbr_no, nbr_ref, nbr)
        };
        debug!(
            "index {} merging node {} into {}",
            self.file_id, right_no, left_no
        );

        let absorbed_from = left.size();
        left.absorb(right.keys.clone(), right.rids.clone());
        if left.is_leaf() {
            if hdr.last_leaf == right_no {
                hdr.last_leaf = left_no;
            }
            left.header.next_leaf = right.header.next_leaf;
            if right.header.next_leaf != INVALID_PAGE_NO {
                let (next_ref, mut next) = self.fetch_node(hdr, right.header.next_leaf)?;
                next.header.prev_leaf = left_no;
                self.write_node(&next_ref, hdr, &next);
            }
        }
        self.write_node(&left_ref, hdr, &left);
        if !left.is_leaf() {
            for i in absorbed_from..left.size() {
                self.maintain_child(hdr, &left, left_no, i)?;
            }
        }

        let right_idx = parent.find_child(right_no).ok_or_else(|| {
            QuarryError::Internal(format!(
                "node {right_no} missing from its parent {parent_no}"
            ))
        })?;
        parent.erase_pair(right_idx);
        self.write_node(&parent_ref, hdr, &parent);
        let parent_size = parent.size();

        drop(left_ref);
        drop(right_ref);
        drop(parent_ref);
        self.release_node_handle(hdr, right_no, txn)?;
        self.maintain_parent(hdr, left_no)?;

        if parent_no == hdr.root_page_no || parent_size < hdr.min_size() {
            self.coalesce_or_redistribute(hdr, parent_no, txn)?;
        }
        Ok(())
    }

    /// Move one pair from the sibling into the underflowing node and
    /// refresh the parent separator at the moved boundary.
    fn redistribute(
        &self,
        hdr: &IndexFileHeader,
        node: &mut TreeNodePage,
        node_no: PageNo,
        node_idx: usize,
        nbr: &mut TreeNodePage,
        nbr_idx: usize,
        parent: &mut TreeNodePage,
    ) -> QuarryResult<()> {
        if node_idx > 0 {
            // left predecessor donates its greatest pair
            let (key, rid) = nbr.erase_pair(nbr.size() - 1);
            node.insert_pair(0, key, rid);
            parent.keys[node_idx] = node.first_key().to_vec();
            self.maintain_child(hdr, node, node_no, 0)?;
        } else {
            // right successor donates its least pair
            let (key, rid) = nbr.erase_pair(0);
            node.insert_pair(node.size(), key, rid);
            parent.keys[nbr_idx] = nbr.first_key().to_vec();
            self.maintain_child(hdr, node, node_no, node.size() - 1)?;
        }
        Ok(())
    }

    /// Shrink the tree at the top: promote a lone child of an internal
    /// root, or drop an emptied leaf root entirely.
    fn adjust_root(
        &self,
        hdr: &mut IndexFileHeader,
        root_ref: PageRef,
        root: TreeNodePage,
        root_no: PageNo,
        txn: Option<&Transaction>,
    ) -> QuarryResult<()> {
        if !root.is_leaf() && root.size() == 1 {
            let child_no = root.value_at(0);
            let (child_ref, mut child) = self.fetch_node(hdr, child_no)?;
            child.header.parent = INVALID_PAGE_NO;
            self.write_node(&child_ref, hdr, &child);
            drop(child_ref);
            hdr.root_page_no = child_no;
            drop(root_ref);
            self.release_node_handle(hdr, root_no, txn)?;
            debug!("index {} root collapsed into page {}", self.file_id, child_no);
        } else if root.is_leaf() && root.size() == 0 {
            hdr.root_page_no = INVALID_PAGE_NO;
            hdr.first_leaf = INVALID_PAGE_NO;
            hdr.last_leaf = INVALID_PAGE_NO;
            drop(root_ref);
            self.release_node_handle(hdr, root_no, txn)?;
            debug!("index {} is now empty", self.file_id);
        }
        Ok(())
    }

    /// Walk upward overwriting stale separators until the stored key
    /// matches the child's first key.
    fn maintain_parent(&self, hdr: &IndexFileHeader, start_no: PageNo) -> QuarryResult<()> {
        let mut curr_no = start_no;
        loop {
            let (_curr_ref, curr) = self.fetch_node(hdr, curr_no)?;
            let parent_no = curr.header.parent;
            if parent_no == INVALID_PAGE_NO || curr.size() == 0 {
                return Ok(());
            }
            let first_key = curr.first_key().to_vec();
            let (parent_ref, mut parent) = self.fetch_node(hdr, parent_no)?;
            let rank = parent.find_child(curr_no).ok_or_else(|| {
                QuarryError::Internal(format!(
                    "node {curr_no} missing from its parent {parent_no}"
                ))
            })?;
            if parent.keys[rank] == first_key {
                return Ok(());
            }
            parent.keys[rank] = first_key;
            self.write_node(&parent_ref, hdr, &parent);
            curr_no = parent_no;
        }
    }

    /// Point the i-th child of an internal node back at that node.
    fn maintain_child(
        &self,
        hdr: &IndexFileHeader,
        node: &TreeNodePage,
        node_no: PageNo,
        child_idx: usize,
    ) -> QuarryResult<()> {
        if node.is_leaf() {
            return Ok(());
        }
        let child_no = node.value_at(child_idx);
        let (child_ref, mut child) = self.fetch_node(hdr, child_no)?;
        if child.header.parent != node_no {
            child.header.parent = node_no;
            self.write_node(&child_ref, hdr, &child);
        }
        Ok(())
    }

    fn bound(&self, key: &[u8], upper: bool) -> QuarryResult<Iid> {
        let hdr = self.state.lock();
        if hdr.root_page_no == INVALID_PAGE_NO {
            return Ok(Iid::new(INVALID_PAGE_NO, 0));
        }
        let num_cols = hdr.key_schema.probe_cols(key.len());
        let (_leaf_ref, leaf, leaf_no) = self.find_leaf(&hdr, key, num_cols)?;
        let cmp = |entry: &[u8]| {
            compare_key_prefix(
                entry,
                key,
                &hdr.key_schema.col_types,
                &hdr.key_schema.col_lens,
                num_cols,
            )
        };
        let idx = if upper {
            leaf.upper_bound_by(cmp)?
        } else {
            leaf.lower_bound_by(cmp)?
        };
        if idx == leaf.size() && leaf.header.next_leaf != INVALID_PAGE_NO {
            // one past a non-final leaf: the position is the next
            // leaf's first slot
            return Ok(Iid::new(leaf.header.next_leaf, 0));
        }
        Ok(Iid::new(leaf_no, idx as u32))
    }

    /// All keys in leaf-chain order; diagnostic helper.
    pub fn collect_keys(&self) -> QuarryResult<Vec<Vec<u8>>> {
        let hdr = self.state.lock();
        let mut keys = Vec::new();
        let mut page_no = hdr.first_leaf;
        while page_no != INVALID_PAGE_NO {
            let (_page_ref, node) = self.fetch_node(&hdr, page_no)?;
            keys.extend(node.keys.iter().cloned());
            page_no = node.header.next_leaf;
        }
        Ok(keys)
    }

    /// Structural self-check: size bounds on every non-root node, parent
    /// pointers and separators on every internal edge, and a sorted,
    /// doubly linked leaf chain. Diagnostic; used heavily by tests.
    pub fn verify_integrity(&self) -> QuarryResult<()> {
        let hdr = self.state.lock();
        if hdr.root_page_no == INVALID_PAGE_NO {
            if hdr.first_leaf != INVALID_PAGE_NO || hdr.last_leaf != INVALID_PAGE_NO {
                return Err(integrity("empty tree still anchors a leaf chain"));
            }
            return Ok(());
        }
        self.verify_node(&hdr, hdr.root_page_no, true)?;
        self.verify_leaf_chain(&hdr)
    }

    fn verify_node(
        &self,
        hdr: &IndexFileHeader,
        page_no: PageNo,
        is_root: bool,
    ) -> QuarryResult<()> {
        let (_page_ref, node) = self.fetch_node(hdr, page_no)?;
        if !is_root
            && (node.size() < hdr.min_size() || node.size() > hdr.btree_order as usize)
        {
            return Err(integrity(&format!(
                "node {} holds {} keys outside [{}, {}]",
                page_no,
                node.size(),
                hdr.min_size(),
                hdr.btree_order
            )));
        }
        for i in 1..node.size() {
            if compare_key_prefix(
                &node.keys[i - 1],
                &node.keys[i],
                &hdr.key_schema.col_types,
                &hdr.key_schema.col_lens,
                hdr.key_schema.num_cols(),
            )? != Ordering::Less
            {
                return Err(integrity(&format!("node {page_no} keys out of order")));
            }
        }
        if node.is_leaf() {
            return Ok(());
        }
        for i in 0..node.size() {
            let child_no = node.value_at(i);
            let (_child_ref, child) = self.fetch_node(hdr, child_no)?;
            if child.header.parent != page_no {
                return Err(integrity(&format!(
                    "child {child_no} does not point back at parent {page_no}"
                )));
            }
            if child.size() > 0 && child.first_key() != node.keys[i].as_slice() {
                return Err(integrity(&format!(
                    "separator {i} of node {page_no} does not equal the first key of child {child_no}"
                )));
            }
            self.verify_node(hdr, child_no, false)?;
        }
        Ok(())
    }

    fn verify_leaf_chain(&self, hdr: &IndexFileHeader) -> QuarryResult<()> {
        let mut page_no = hdr.first_leaf;
        let mut prev = INVALID_PAGE_NO;
        let mut last_key: Option<Vec<u8>> = None;
        let mut last_seen = INVALID_PAGE_NO;
        while page_no != INVALID_PAGE_NO {
            let (_page_ref, node) = self.fetch_node(hdr, page_no)?;
            if !node.is_leaf() {
                return Err(integrity(&format!("page {page_no} in leaf chain is internal")));
            }
            if node.header.prev_leaf != prev {
                return Err(integrity(&format!("leaf {page_no} has a broken prev link")));
            }
            for key in &node.keys {
                if let Some(last) = &last_key {
                    if compare_key_prefix(
                        last,
                        key,
                        &hdr.key_schema.col_types,
                        &hdr.key_schema.col_lens,
                        hdr.key_schema.num_cols(),
                    )? == Ordering::Greater
                    {
                        return Err(integrity("leaf chain keys decrease"));
                    }
                }
                last_key = Some(key.clone());
            }
            prev = page_no;
            last_seen = page_no;
            page_no = node.header.next_leaf;
        }
        if last_seen != hdr.last_leaf {
            return Err(integrity("leaf chain does not terminate at last_leaf"));
        }
        Ok(())
    }
}

fn integrity(msg: &str) -> QuarryError {
    QuarryError::Internal(format!("index integrity violation: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataType;
    use crate::storage::disk_manager::DiskManager;
    use tempfile::TempDir;

    fn setup(order: u32) -> (TempDir, Arc<BTreeIndex>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::new());
        let file_id = disk_manager
            .create_file(temp_dir.path().join("t_a.idx"))
            .unwrap();
        let pool = Arc::new(BufferPoolManager::new(64, disk_manager));
        let schema = IndexKeySchema::new(vec![DataType::Int32], vec![4]);
        let index = Arc::new(BTreeIndex::create(pool, file_id, schema, Some(order)).unwrap());
        (temp_dir, index)
    }

    fn key(i: i32) -> Vec<u8> {
        i.to_le_bytes().to_vec()
    }

    #[test]
    fn insert_then_get_then_delete() {
        let (_dir, index) = setup(4);
        assert!(index.insert_entry(&key(42), Rid::new(1, 7)).unwrap());
        assert_eq!(index.get_value(&key(42)).unwrap(), vec![Rid::new(1, 7)]);
        // duplicate rejected
        assert!(!index.insert_entry(&key(42), Rid::new(9, 9)).unwrap());
        assert_eq!(index.get_value(&key(42)).unwrap(), vec![Rid::new(1, 7)]);

        assert!(index.delete_entry(&key(42), None).unwrap());
        assert!(index.get_value(&key(42)).unwrap().is_empty());
        assert!(!index.delete_entry(&key(42), None).unwrap());
        assert!(index.is_empty());
    }

    #[test]
    fn split_boundary_counts() {
        // order 4: a leaf splits when it reaches 5 keys, the left half
        // keeping floor(5/2) = 2
        let (_dir, index) = setup(4);
        for i in 1..=5 {
            index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
        }
        index.verify_integrity().unwrap();
        let hdr = index.state.lock();
        assert_ne!(hdr.root_page_no, hdr.first_leaf);
        let (_r, first) = index.fetch_node(&hdr, hdr.first_leaf).unwrap();
        assert_eq!(first.size(), 2);
        let (_r, second) = index.fetch_node(&hdr, first.header.next_leaf).unwrap();
        assert_eq!(second.size(), 3);
        assert_eq!(hdr.last_leaf, first.header.next_leaf);
    }

    #[test]
    fn ascending_fill_keeps_invariants() {
        let (_dir, index) = setup(4);
        for i in 1..=100 {
            index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
            index.verify_integrity().unwrap();
        }
        let keys = index.collect_keys().unwrap();
        assert_eq!(keys.len(), 100);
        assert_eq!(keys, (1..=100).map(key).collect::<Vec<_>>());
        for i in 1..=100 {
            assert_eq!(index.get_value(&key(i)).unwrap(), vec![Rid::new(1, i as u32)]);
        }
    }

    #[test]
    fn fill_then_drain_front_keeps_invariants() {
        let (_dir, index) = setup(4);
        for i in 1..=100 {
            index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
        }
        for i in 1..=50 {
            assert!(index.delete_entry(&key(i), None).unwrap());
            index.verify_integrity().unwrap();
            let keys = index.collect_keys().unwrap();
            assert_eq!(keys, ((i + 1)..=100).map(key).collect::<Vec<_>>());
        }
    }

    #[test]
    fn redistribute_at_boundary_then_merge_below_it() {
        // order 4, min size 2: two sibling leaves of 1 and 3 keys hold
        // 2*min together and must redistribute; 1 and 2 keys must merge
        let (_dir, index) = setup(4);
        for i in 1..=5 {
            index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
        }

        assert!(index.delete_entry(&key(1), None).unwrap());
        index.verify_integrity().unwrap();
        {
            let hdr = index.state.lock();
            // still two leaves below the root, rebalanced to 2 | 2
            assert_ne!(hdr.root_page_no, hdr.first_leaf);
            let (_r, first) = index.fetch_node(&hdr, hdr.first_leaf).unwrap();
            assert_eq!(first.size(), 2);
            let (_r, second) = index.fetch_node(&hdr, first.header.next_leaf).unwrap();
            assert_eq!(second.size(), 2);
        }

        assert!(index.delete_entry(&key(2), None).unwrap());
        index.verify_integrity().unwrap();
        {
            let hdr = index.state.lock();
            // merged into a single leaf root holding 3, 4, 5
            assert_eq!(hdr.root_page_no, hdr.first_leaf);
            assert_eq!(hdr.first_leaf, hdr.last_leaf);
            let (_r, root) = index.fetch_node(&hdr, hdr.root_page_no).unwrap();
            assert!(root.is_leaf());
            assert_eq!(root.size(), 3);
        }
        assert_eq!(
            index.collect_keys().unwrap(),
            (3..=5).map(key).collect::<Vec<_>>()
        );
    }

    #[test]
    fn random_workload_keeps_invariants() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let (_dir, index) = setup(4);
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);
        let mut values: Vec<i32> = (1..=200).collect();
        values.shuffle(&mut rng);
        for v in &values {
            index.insert_entry(&key(*v), Rid::new(2, *v as u32)).unwrap();
        }
        index.verify_integrity().unwrap();

        values.shuffle(&mut rng);
        for (n, v) in values.iter().enumerate() {
            assert!(index.delete_entry(&key(*v), None).unwrap(), "delete {v}");
            if n % 10 == 0 {
                index.verify_integrity().unwrap();
            }
        }
        assert!(index.is_empty());
        index.verify_integrity().unwrap();
    }

    #[test]
    fn bounds_and_leaf_positions() {
        let (_dir, index) = setup(4);
        for i in [10, 20, 30, 40, 50, 60] {
            index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
        }
        // absent key: bounds agree
        assert_eq!(
            index.lower_bound(&key(35)).unwrap(),
            index.upper_bound(&key(35)).unwrap()
        );
        // present key: lower points at it, upper one past it
        let lower = index.lower_bound(&key(30)).unwrap();
        let upper = index.upper_bound(&key(30)).unwrap();
        assert_ne!(lower, upper);
        assert_eq!(index.get_rid(lower).unwrap(), Rid::new(1, 30));

        // below the smallest key: the very beginning
        assert_eq!(index.lower_bound(&key(1)).unwrap(), index.leaf_begin());
        // above the greatest key: the very end
        assert_eq!(index.lower_bound(&key(99)).unwrap(), index.leaf_end().unwrap());
        assert!(index.get_rid(index.leaf_end().unwrap()).is_err());
    }

    #[test]
    fn reopen_preserves_tree() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t_a.idx");
        let disk_manager = Arc::new(DiskManager::new());
        let schema = IndexKeySchema::new(vec![DataType::Int32], vec![4]);
        {
            let file_id = disk_manager.create_file(&path).unwrap();
            let pool = Arc::new(BufferPoolManager::new(64, disk_manager.clone()));
            let index = BTreeIndex::create(pool, file_id, schema.clone(), Some(4)).unwrap();
            for i in 1..=20 {
                index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
            }
            index.flush().unwrap();
            disk_manager.close_file(file_id).unwrap();
        }
        let file_id = disk_manager.open_file(&path).unwrap();
        let pool = Arc::new(BufferPoolManager::new(64, disk_manager));
        let index = BTreeIndex::open(pool, file_id).unwrap();
        index.verify_integrity().unwrap();
        assert_eq!(index.collect_keys().unwrap().len(), 20);
        assert_eq!(index.get_value(&key(13)).unwrap(), vec![Rid::new(1, 13)]);
    }
}
