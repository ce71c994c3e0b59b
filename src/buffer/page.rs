use crate::buffer::buffer_pool::PoolState;
use crate::utils::cache::Replacer;
use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub type FileId = u32;
pub type PageNo = u32;

/// Page number 0 of every file holds its header, so 0 doubles as the
/// "no page" sentinel in free lists and leaf chains.
pub const INVALID_PAGE_NO: PageNo = 0;
pub const PAGE_SIZE: usize = 4096;

/// Identity of a page on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub file_id: FileId,
    pub page_no: PageNo,
}

impl PageId {
    pub fn new(file_id: FileId, page_no: PageNo) -> Self {
        Self { file_id, page_no }
    }
}

#[derive(Debug)]
pub struct Page {
    pub page_id: PageId,
    data: [u8; PAGE_SIZE],
    // reference count; frames with a positive count are never evicted
    pub pin_count: AtomicU32,
    pub is_dirty: bool,
}

impl Page {
    pub fn empty() -> Self {
        Self::new(PageId::new(0, INVALID_PAGE_NO))
    }

    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
            pin_count: AtomicU32::new(0),
            is_dirty: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the page body; the page is marked dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        &mut self.data
    }

    /// Replace the whole page body. `bytes` may be shorter than a page;
    /// the remainder is zeroed.
    pub fn set_data(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= PAGE_SIZE);
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.data[bytes.len()..].fill(0);
        self.is_dirty = true;
    }

    pub(crate) fn reset(&mut self) {
        self.page_id = PageId::new(0, INVALID_PAGE_NO);
        self.data = [0; PAGE_SIZE];
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty = false;
    }
}

/// Pinned handle to a buffer-pool page. Dropping the handle unpins the
/// page; a pin count reaching zero makes the frame an eviction candidate.
#[derive(Debug)]
pub struct PageRef {
    pub(crate) page: Arc<RwLock<Page>>,
    pub(crate) state: Arc<Mutex<PoolState>>,
}

impl PageRef {
    pub fn page_id(&self) -> PageId {
        self.page.read().page_id
    }
}

impl Deref for PageRef {
    type Target = Arc<RwLock<Page>>;

    fn deref(&self) -> &Self::Target {
        &self.page
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let (page_id, now_unpinned) = {
            let page = self.page.read();
            let prev = page.pin_count.fetch_sub(1, Ordering::SeqCst);
            (page.page_id, prev == 1)
        };
        if now_unpinned {
            let mut state = self.state.lock();
            // Another thread may have re-pinned the page between the
            // decrement above and this lock; re-check before surrendering
            // the frame to the replacer.
            if self.page.read().pin_count.load(Ordering::SeqCst) == 0 {
                if let Some(frame_id) = state.page_table.get(&page_id).copied() {
                    state.replacer.unpin(frame_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_data_zero_fills_tail() {
        let mut page = Page::new(PageId::new(1, 1));
        page.data_mut()[..3].copy_from_slice(&[9, 9, 9]);
        page.set_data(&[1, 2]);
        assert_eq!(&page.data()[..3], &[1, 2, 0]);
        assert!(page.is_dirty);
    }
}
