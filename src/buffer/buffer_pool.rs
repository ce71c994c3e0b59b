use bytes::Bytes;
use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::page::{FileId, Page, PageId, PageRef};
use crate::error::{QuarryError, QuarryResult};
use crate::storage::disk_manager::DiskManager;
use crate::utils::cache::{LruReplacer, Replacer};

pub type FrameId = usize;

/// Bookkeeping shared by the pool and its pin guards. A single mutex
/// serializes page-table, free-list and replacer mutations.
#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) page_table: HashMap<PageId, FrameId>,
    pub(crate) free_list: VecDeque<FrameId>,
    pub(crate) replacer: LruReplacer,
}

#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Vec<Arc<RwLock<Page>>>,
    state: Arc<Mutex<PoolState>>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(num_frames: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut free_list = VecDeque::with_capacity(num_frames);
        let mut pool = Vec::with_capacity(num_frames);
        for frame_id in 0..num_frames {
            free_list.push_back(frame_id);
            pool.push(Arc::new(RwLock::new(Page::empty())));
        }
        Self {
            pool,
            state: Arc::new(Mutex::new(PoolState {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
                replacer: LruReplacer::new(num_frames),
            })),
            disk_manager,
        }
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Pin the page in memory, reading it from disk on a miss. Fails when
    /// every frame is pinned and the free list is empty.
    pub fn fetch_page(&self, page_id: PageId) -> QuarryResult<PageRef> {
        let mut state = self.state.lock();
        if let Some(frame_id) = state.page_table.get(&page_id).copied() {
            let page = self.pool[frame_id].clone();
            page.read().pin_count.fetch_add(1, Ordering::SeqCst);
            state.replacer.pin(frame_id);
            return Ok(self.make_ref(page));
        }

        let frame_id = self.find_victim_frame(&mut state)?;
        let data = self.disk_manager.read_page(page_id)?;

        let mut new_page = Page::new(page_id);
        new_page.data_mut().copy_from_slice(&data);
        new_page.is_dirty = false;
        new_page.pin_count.store(1, Ordering::SeqCst);
        *self.pool[frame_id].write() = new_page;

        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(self.make_ref(self.pool[frame_id].clone()))
    }

    /// Allocate a fresh page number in `file_id` and pin a zeroed page
    /// for it.
    pub fn new_page(&self, file_id: FileId) -> QuarryResult<PageRef> {
        let mut state = self.state.lock();
        let frame_id = self.find_victim_frame(&mut state)?;

        let page_no = self.disk_manager.allocate_page(file_id)?;
        let page_id = PageId::new(file_id, page_no);
        debug!("buffer pool allocated page {:?}", page_id);

        let new_page = Page::new(page_id);
        new_page.pin_count.store(1, Ordering::SeqCst);
        *self.pool[frame_id].write() = new_page;

        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(self.make_ref(self.pool[frame_id].clone()))
    }

    /// Write the page image back to disk regardless of the dirty bit.
    /// Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> QuarryResult<bool> {
        let state = self.state.lock();
        let Some(frame_id) = state.page_table.get(&page_id).copied() else {
            return Ok(false);
        };
        self.flush_frame(frame_id, page_id)?;
        Ok(true)
    }

    /// Flush every resident page that belongs to `file_id`.
    pub fn flush_all_pages(&self, file_id: FileId) -> QuarryResult<()> {
        let state = self.state.lock();
        let targets: Vec<(PageId, FrameId)> = state
            .page_table
            .iter()
            .filter(|(pid, _)| pid.file_id == file_id)
            .map(|(pid, frame)| (*pid, *frame))
            .collect();
        for (page_id, frame_id) in targets {
            self.flush_frame(frame_id, page_id)?;
        }
        Ok(())
    }

    /// Drop the page from the pool. Absent pages succeed trivially; a
    /// pinned page cannot be deleted.
    pub fn delete_page(&self, page_id: PageId) -> QuarryResult<bool> {
        let mut state = self.state.lock();
        let Some(frame_id) = state.page_table.get(&page_id).copied() else {
            return Ok(true);
        };
        let page = self.pool[frame_id].clone();
        if page.read().pin_count.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        self.flush_frame(frame_id, page_id)?;
        state.page_table.remove(&page_id);
        state.replacer.pin(frame_id);
        page.write().reset();
        state.free_list.push_back(frame_id);
        Ok(true)
    }

    /// Evict every resident page of a file without writing it back; used
    /// when the file itself is being destroyed. Fails if any page of the
    /// file is still pinned.
    pub fn discard_file_pages(&self, file_id: FileId) -> QuarryResult<()> {
        let mut state = self.state.lock();
        let targets: Vec<(PageId, FrameId)> = state
            .page_table
            .iter()
            .filter(|(pid, _)| pid.file_id == file_id)
            .map(|(pid, frame)| (*pid, *frame))
            .collect();
        for (page_id, frame_id) in targets {
            let page = self.pool[frame_id].clone();
            if page.read().pin_count.load(Ordering::SeqCst) > 0 {
                return Err(QuarryError::Storage(format!(
                    "cannot discard pinned page {:?}",
                    page_id
                )));
            }
            state.page_table.remove(&page_id);
            state.replacer.pin(frame_id);
            page.write().reset();
            state.free_list.push_back(frame_id);
        }
        Ok(())
    }

    fn make_ref(&self, page: Arc<RwLock<Page>>) -> PageRef {
        PageRef {
            page,
            state: self.state.clone(),
        }
    }

    fn flush_frame(&self, frame_id: FrameId, page_id: PageId) -> QuarryResult<()> {
        let image = {
            let page = self.pool[frame_id].read();
            Bytes::copy_from_slice(page.data())
        };
        self.disk_manager.write_page(page_id, &image)?;
        self.pool[frame_id].write().is_dirty = false;
        Ok(())
    }

    /// Take a frame from the free list, or evict the replacer's victim
    /// (writing it back first when dirty).
    fn find_victim_frame(&self, state: &mut MutexGuard<PoolState>) -> QuarryResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }
        let Some(frame_id) = state.replacer.victim() else {
            return Err(QuarryError::Storage(
                "buffer pool exhausted: all frames pinned".to_string(),
            ));
        };
        let (old_page_id, is_dirty) = {
            let page = self.pool[frame_id].read();
            (page.page_id, page.is_dirty)
        };
        if is_dirty {
            let image = {
                let page = self.pool[frame_id].read();
                Bytes::copy_from_slice(page.data())
            };
            self.disk_manager.write_page(old_page_id, &image)?;
        }
        debug!("buffer pool evicted page {:?}", old_page_id);
        state.page_table.remove(&old_page_id);
        Ok(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(num_frames: usize) -> (TempDir, Arc<BufferPoolManager>, FileId) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::new());
        let file_id = disk_manager
            .create_file(temp_dir.path().join("test.tbl"))
            .unwrap();
        let pool = Arc::new(BufferPoolManager::new(num_frames, disk_manager));
        (temp_dir, pool, file_id)
    }

    #[test]
    fn new_page_until_exhausted() {
        let (_dir, pool, file_id) = setup(3);

        let page1 = pool.new_page(file_id).unwrap();
        let page1_id = page1.page_id();
        let _page2 = pool.new_page(file_id).unwrap();
        let _page3 = pool.new_page(file_id).unwrap();

        // every frame pinned: no room for a fourth page
        assert!(pool.new_page(file_id).is_err());

        // dropping a pin frees a frame for reuse
        drop(page1);
        let page4 = pool.new_page(file_id).unwrap();
        assert_ne!(page4.page_id(), page1_id);
        assert!(pool.fetch_page(page1_id).is_err());
    }

    #[test]
    fn fetch_round_trips_written_data() {
        let (_dir, pool, file_id) = setup(2);

        let page = pool.new_page(file_id).unwrap();
        let page_id = page.page_id();
        page.write().set_data(b"hello page");
        drop(page);

        // force eviction by filling the pool with other pages
        let p2 = pool.new_page(file_id).unwrap();
        let p3 = pool.new_page(file_id).unwrap();
        drop(p2);
        drop(p3);

        let page = pool.fetch_page(page_id).unwrap();
        assert_eq!(&page.read().data()[..10], b"hello page");
        assert_eq!(page.read().pin_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unpinned_clean_fetch_is_noop_on_disk() {
        let (_dir, pool, file_id) = setup(2);

        let page = pool.new_page(file_id).unwrap();
        let page_id = page.page_id();
        page.write().set_data(b"stable");
        drop(page);
        pool.flush_page(page_id).unwrap();
        let before = pool.disk_manager().read_page(page_id).unwrap();

        let page = pool.fetch_page(page_id).unwrap();
        drop(page);

        // evict it without any mutation in between
        let p = pool.new_page(file_id).unwrap();
        let q = pool.new_page(file_id).unwrap();
        drop(p);
        drop(q);

        let after = pool.disk_manager().read_page(page_id).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn delete_page_semantics() {
        let (_dir, pool, file_id) = setup(3);

        let page = pool.new_page(file_id).unwrap();
        let page_id = page.page_id();

        // pinned: refuse
        assert!(!pool.delete_page(page_id).unwrap());
        drop(page);

        assert!(pool.delete_page(page_id).unwrap());
        // absent: trivially ok
        assert!(pool.delete_page(page_id).unwrap());

        // refetch reads the flushed (zero) image from disk
        let page = pool.fetch_page(page_id).unwrap();
        assert!(page.read().data().iter().all(|b| *b == 0));
    }

    #[test]
    fn pin_count_tracks_outstanding_handles() {
        let (_dir, pool, file_id) = setup(3);

        let page = pool.new_page(file_id).unwrap();
        let page_id = page.page_id();
        let again = pool.fetch_page(page_id).unwrap();
        assert_eq!(page.read().pin_count.load(Ordering::SeqCst), 2);
        drop(again);
        assert_eq!(page.read().pin_count.load(Ordering::SeqCst), 1);
    }
}
