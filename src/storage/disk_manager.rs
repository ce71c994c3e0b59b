use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::{FileId, PageId, PageNo, PAGE_SIZE};
use crate::error::{QuarryError, QuarryResult};

static EMPTY_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

#[derive(Debug)]
struct FileState {
    path: PathBuf,
    // one thread at a time may seek/read/write the handle
    file: Mutex<File>,
    next_page_no: AtomicU32,
}

/// Pager over a set of paged files addressed by `(file_id, page_no)`.
/// File ids are process-local and never reused.
#[derive(Debug, Default)]
pub struct DiskManager {
    files: RwLock<HashMap<FileId, Arc<FileState>>>,
    next_file_id: AtomicU32,
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(1),
        }
    }

    /// Create a new paged file and open it. The file must not exist.
    pub fn create_file(&self, path: impl AsRef<Path>) -> QuarryResult<FileId> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                QuarryError::Storage(format!("cannot create file {}: {}", path.display(), e))
            })?;
        Ok(self.install(path, file, 0))
    }

    /// Open an existing paged file.
    pub fn open_file(&self, path: impl AsRef<Path>) -> QuarryResult<FileId> {
        let path = path.as_ref().to_path_buf();
        {
            let files = self.files.read();
            if let Some((file_id, _)) = files.iter().find(|(_, s)| s.path == path) {
                return Ok(*file_id);
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                QuarryError::Storage(format!("cannot open file {}: {}", path.display(), e))
            })?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(QuarryError::Internal(format!(
                "file {} size {} is not a multiple of the page size",
                path.display(),
                len
            )));
        }
        Ok(self.install(path, file, (len / PAGE_SIZE as u64) as PageNo))
    }

    pub fn close_file(&self, file_id: FileId) -> QuarryResult<()> {
        self.files
            .write()
            .remove(&file_id)
            .map(|_| ())
            .ok_or_else(|| QuarryError::Storage(format!("file {} is not open", file_id)))
    }

    /// Delete a file from disk. The file must not be open.
    pub fn remove_file(&self, path: impl AsRef<Path>) -> QuarryResult<()> {
        let path = path.as_ref();
        if self.files.read().values().any(|s| s.path == path) {
            return Err(QuarryError::Storage(format!(
                "cannot remove open file {}",
                path.display()
            )));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn is_open(&self, file_id: FileId) -> bool {
        self.files.read().contains_key(&file_id)
    }

    pub fn file_path(&self, file_id: FileId) -> QuarryResult<PathBuf> {
        Ok(self.state(file_id)?.path.clone())
    }

    pub fn read_page(&self, page_id: PageId) -> QuarryResult<[u8; PAGE_SIZE]> {
        let state = self.state(page_id.file_id)?;
        let mut guard = state.file.lock();
        guard.seek(SeekFrom::Start(page_id.page_no as u64 * PAGE_SIZE as u64))?;
        let mut page = [0u8; PAGE_SIZE];
        guard.read_exact(&mut page)?;
        Ok(page)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> QuarryResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(QuarryError::Internal(format!(
                "page image size {} is not {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let state = self.state(page_id.file_id)?;
        let mut guard = state.file.lock();
        guard.seek(SeekFrom::Start(page_id.page_no as u64 * PAGE_SIZE as u64))?;
        guard.write_all(data)?;
        guard.flush()?;
        Ok(())
    }

    /// Extend the file with a zeroed page and return its page number.
    pub fn allocate_page(&self, file_id: FileId) -> QuarryResult<PageNo> {
        let state = self.state(file_id)?;
        let page_no = state.next_page_no.fetch_add(1, Ordering::SeqCst);
        let mut guard = state.file.lock();
        guard.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        guard.write_all(&EMPTY_PAGE)?;
        guard.flush()?;
        debug!("allocated page {} in file {}", page_no, file_id);
        Ok(page_no)
    }

    pub fn num_pages(&self, file_id: FileId) -> QuarryResult<PageNo> {
        Ok(self.state(file_id)?.next_page_no.load(Ordering::SeqCst))
    }

    fn install(&self, path: PathBuf, file: File, next_page_no: PageNo) -> FileId {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        self.files.write().insert(
            file_id,
            Arc::new(FileState {
                path,
                file: Mutex::new(file),
                next_page_no: AtomicU32::new(next_page_no),
            }),
        );
        file_id
    }

    fn state(&self, file_id: FileId) -> QuarryResult<Arc<FileState>> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| QuarryError::Storage(format!("file {} is not open", file_id)))
    }
}
