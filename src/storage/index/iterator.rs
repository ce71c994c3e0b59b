use std::sync::Arc;

use crate::buffer::INVALID_PAGE_NO;
use crate::error::QuarryResult;
use crate::storage::index::{BTreeIndex, Iid};
use crate::storage::Rid;

/// Lazy, non-restartable scan over index entries in `[begin, end)`,
/// advancing within a leaf and following `next_leaf` at boundaries.
#[derive(Debug)]
pub struct TreeScan {
    index: Arc<BTreeIndex>,
    iid: Iid,
    end: Iid,
}

impl TreeScan {
    pub fn new(index: Arc<BTreeIndex>, begin: Iid, end: Iid) -> Self {
        Self { index, iid: begin, end }
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    /// Data rid at the current position.
    pub fn rid(&self) -> QuarryResult<Rid> {
        self.index.get_rid(self.iid)
    }

    pub fn next(&mut self) -> QuarryResult<()> {
        if self.is_end() {
            return Ok(());
        }
        let (size, next_leaf) = self.index.leaf_info(self.iid.page_no)?;
        self.iid.slot_no += 1;
        if self.iid.slot_no >= size
            && self.iid.page_no != self.end.page_no
            && next_leaf != INVALID_PAGE_NO
        {
            self.iid = Iid::new(next_leaf, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolManager;
    use crate::catalog::DataType;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::index::IndexKeySchema;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<BTreeIndex>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::new());
        let file_id = disk_manager
            .create_file(temp_dir.path().join("t_a.idx"))
            .unwrap();
        let pool = Arc::new(BufferPoolManager::new(64, disk_manager));
        let schema = IndexKeySchema::new(vec![DataType::Int32], vec![4]);
        let index = Arc::new(BTreeIndex::create(pool, file_id, schema, Some(4)).unwrap());
        (temp_dir, index)
    }

    fn key(i: i32) -> Vec<u8> {
        i.to_le_bytes().to_vec()
    }

    fn collect(scan: &mut TreeScan) -> Vec<Rid> {
        let mut rids = Vec::new();
        while !scan.is_end() {
            rids.push(scan.rid().unwrap());
            scan.next().unwrap();
        }
        rids
    }

    #[test]
    fn full_scan_crosses_leaves_in_order() {
        let (_dir, index) = setup();
        for i in 1..=30 {
            index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
        }
        let mut scan = TreeScan::new(
            index.clone(),
            index.leaf_begin(),
            index.leaf_end().unwrap(),
        );
        let rids = collect(&mut scan);
        assert_eq!(rids, (1..=30).map(|i| Rid::new(1, i)).collect::<Vec<_>>());
    }

    #[test]
    fn half_open_range() {
        let (_dir, index) = setup();
        for i in (10..=100).step_by(10) {
            index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
        }
        let begin = index.lower_bound(&key(30)).unwrap();
        let end = index.lower_bound(&key(70)).unwrap();
        let mut scan = TreeScan::new(index.clone(), begin, end);
        let rids = collect(&mut scan);
        assert_eq!(
            rids,
            vec![Rid::new(1, 30), Rid::new(1, 40), Rid::new(1, 50), Rid::new(1, 60)]
        );
    }

    #[test]
    fn empty_range_yields_nothing() {
        let (_dir, index) = setup();
        for i in 1..=10 {
            index.insert_entry(&key(i), Rid::new(1, i as u32)).unwrap();
        }
        let at = index.lower_bound(&key(5)).unwrap();
        let mut scan = TreeScan::new(index.clone(), at, at);
        assert!(scan.is_end());
        assert!(collect(&mut scan).is_empty());
    }

    #[test]
    fn empty_tree_scan() {
        let (_dir, index) = setup();
        let mut scan = TreeScan::new(
            index.clone(),
            index.leaf_begin(),
            index.leaf_end().unwrap(),
        );
        assert!(scan.is_end());
        assert!(collect(&mut scan).is_empty());
    }
}
