use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, FileId, PageId, PageNo, INVALID_PAGE_NO, PAGE_SIZE};
use crate::error::{QuarryError, QuarryResult};
use crate::storage::codec::heap_page::HEAP_PAGE_HEADER_SIZE;
use crate::storage::codec::{HeapFileHeaderCodec, HeapPageHeaderCodec};
use crate::storage::heap::{HeapFileHeader, HeapPageHeader, Record};
use crate::storage::Rid;
use crate::utils::bitmap;

/// Heap file of fixed-size records with a per-page occupancy bitmap and a
/// free-with-space page list threaded through page headers.
#[derive(Debug)]
pub struct HeapFile {
    file_id: FileId,
    buffer_pool: Arc<BufferPoolManager>,
    header: Mutex<HeapFileHeader>,
}

impl HeapFile {
    /// Initialize a fresh heap file: page 0 receives the file header.
    pub fn create(
        buffer_pool: Arc<BufferPoolManager>,
        file_id: FileId,
        record_size: u32,
    ) -> QuarryResult<Self> {
        if record_size == 0 || record_size as usize > PAGE_SIZE - HEAP_PAGE_HEADER_SIZE - 1 {
            return Err(QuarryError::Storage(format!(
                "record size {record_size} does not fit a page"
            )));
        }
        let (records_per_page, bitmap_size) = Self::page_layout(record_size);
        let header = HeapFileHeader {
            record_size,
            num_pages: 0,
            records_per_page,
            bitmap_size,
            first_free_page: INVALID_PAGE_NO,
        };

        let header_page = buffer_pool.new_page(file_id)?;
        if header_page.page_id().page_no != 0 {
            return Err(QuarryError::Internal(
                "heap file header must land on page 0 of a fresh file".to_string(),
            ));
        }
        header_page
            .write()
            .set_data(&HeapFileHeaderCodec::encode(&header));

        Ok(Self {
            file_id,
            buffer_pool,
            header: Mutex::new(header),
        })
    }

    /// Open an existing heap file by decoding its header page.
    pub fn open(buffer_pool: Arc<BufferPoolManager>, file_id: FileId) -> QuarryResult<Self> {
        let header_page = buffer_pool.fetch_page(PageId::new(file_id, 0))?;
        let (header, _) = HeapFileHeaderCodec::decode(header_page.read().data())?;
        drop(header_page);
        Ok(Self {
            file_id,
            buffer_pool,
            header: Mutex::new(header),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn record_size(&self) -> u32 {
        self.header.lock().record_size
    }

    pub fn num_pages(&self) -> u32 {
        self.header.lock().num_pages
    }

    /// Largest slot count n with header + ceil(n/8) + n*record_size
    /// fitting a page, and the matching bitmap width.
    fn page_layout(record_size: u32) -> (u32, u32) {
        let usable = (PAGE_SIZE - HEAP_PAGE_HEADER_SIZE) as u32;
        let mut n = usable * 8 / (record_size * 8 + 1);
        while n > 0 && n.div_ceil(8) + n * record_size > usable {
            n -= 1;
        }
        (n, n.div_ceil(8))
    }

    fn slot_offset(header: &HeapFileHeader, slot_no: u32) -> usize {
        HEAP_PAGE_HEADER_SIZE + header.bitmap_size as usize + (slot_no * header.record_size) as usize
    }

    fn bitmap_range(header: &HeapFileHeader) -> std::ops::Range<usize> {
        HEAP_PAGE_HEADER_SIZE..HEAP_PAGE_HEADER_SIZE + header.bitmap_size as usize
    }

    fn check_rid(header: &HeapFileHeader, rid: Rid) -> QuarryResult<()> {
        if rid.page_no == INVALID_PAGE_NO
            || rid.page_no > header.num_pages
            || rid.slot_no >= header.records_per_page
        {
            return Err(QuarryError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        Ok(())
    }

    fn write_header(&self, header: &HeapFileHeader) -> QuarryResult<()> {
        let page = self.buffer_pool.fetch_page(PageId::new(self.file_id, 0))?;
        page.write().set_data(&HeapFileHeaderCodec::encode(header));
        Ok(())
    }

    /// Append a zeroed data page and link it at the head of the free
    /// list. A zeroed page already encodes an empty page header.
    fn allocate_data_page(&self, header: &mut MutexGuard<HeapFileHeader>) -> QuarryResult<PageNo> {
        let page = self.buffer_pool.new_page(self.file_id)?;
        let page_no = page.page_id().page_no;
        {
            let mut guard = page.write();
            let page_header = HeapPageHeader {
                next_free_page: header.first_free_page,
                num_records: 0,
            };
            let bytes = HeapPageHeaderCodec::encode(&page_header);
            guard.data_mut()[..bytes.len()].copy_from_slice(&bytes);
        }
        header.num_pages += 1;
        header.first_free_page = page_no;
        debug!("heap file {} grew to {} pages", self.file_id, header.num_pages);
        Ok(page_no)
    }

    /// Place a record in the first free slot of the first page with
    /// space, growing the file when none exists.
    pub fn insert_record(&self, data: &[u8]) -> QuarryResult<Rid> {
        let mut header = self.header.lock();
        if data.len() != header.record_size as usize {
            return Err(QuarryError::Storage(format!(
                "record payload is {} bytes, table records are {}",
                data.len(),
                header.record_size
            )));
        }
        let page_no = if header.first_free_page == INVALID_PAGE_NO {
            self.allocate_data_page(&mut header)?
        } else {
            header.first_free_page
        };

        let page = self.buffer_pool.fetch_page(PageId::new(self.file_id, page_no))?;
        let slot_no = {
            let mut guard = page.write();
            let (mut page_header, _) = HeapPageHeaderCodec::decode(guard.data())?;
            let bitmap_range = Self::bitmap_range(&header);
            let slot = bitmap::first_zero(
                &guard.data()[bitmap_range.clone()],
                header.records_per_page as usize,
            )
            .ok_or_else(|| {
                QuarryError::Internal(format!(
                    "page {page_no} is on the free list but has no free slot"
                ))
            })?;

            let offset = Self::slot_offset(&header, slot as u32);
            let record_size = header.record_size as usize;
            let data_mut = guard.data_mut();
            data_mut[offset..offset + record_size].copy_from_slice(data);
            bitmap::set(&mut data_mut[bitmap_range], slot);
            page_header.num_records += 1;

            // page just became full: unlink it from the free list
            if page_header.num_records == header.records_per_page {
                header.first_free_page = page_header.next_free_page;
                page_header.next_free_page = INVALID_PAGE_NO;
            }
            let bytes = HeapPageHeaderCodec::encode(&page_header);
            guard.data_mut()[..bytes.len()].copy_from_slice(&bytes);
            slot as u32
        };
        self.write_header(&header)?;
        Ok(Rid::new(page_no, slot_no))
    }

    /// Clear the slot's bitmap bit; a previously full page rejoins the
    /// free list.
    pub fn delete_record(&self, rid: Rid) -> QuarryResult<()> {
        let mut header = self.header.lock();
        Self::check_rid(&header, rid)?;
        let page = self
            .buffer_pool
            .fetch_page(PageId::new(self.file_id, rid.page_no))?;
        let mut guard = page.write();
        let (mut page_header, _) = HeapPageHeaderCodec::decode(guard.data())?;
        let bitmap_range = Self::bitmap_range(&header);
        if !bitmap::get(&guard.data()[bitmap_range.clone()], rid.slot_no as usize) {
            return Err(QuarryError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }

        let was_full = page_header.num_records == header.records_per_page;
        bitmap::clear(&mut guard.data_mut()[bitmap_range], rid.slot_no as usize);
        page_header.num_records -= 1;
        if was_full {
            page_header.next_free_page = header.first_free_page;
            header.first_free_page = rid.page_no;
        }
        let bytes = HeapPageHeaderCodec::encode(&page_header);
        guard.data_mut()[..bytes.len()].copy_from_slice(&bytes);
        drop(guard);
        drop(page);

        if was_full {
            self.write_header(&header)?;
        }
        Ok(())
    }

    /// Overwrite the slot payload; the existence bit is untouched.
    pub fn update_record(&self, rid: Rid, data: &[u8]) -> QuarryResult<()> {
        let header = self.header.lock();
        Self::check_rid(&header, rid)?;
        if data.len() != header.record_size as usize {
            return Err(QuarryError::Storage(format!(
                "record payload is {} bytes, table records are {}",
                data.len(),
                header.record_size
            )));
        }
        let page = self
            .buffer_pool
            .fetch_page(PageId::new(self.file_id, rid.page_no))?;
        let mut guard = page.write();
        if !bitmap::get(
            &guard.data()[Self::bitmap_range(&header)],
            rid.slot_no as usize,
        ) {
            return Err(QuarryError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        let offset = Self::slot_offset(&header, rid.slot_no);
        guard.data_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy the record out; the returned buffer outlives the page pin.
    pub fn get_record(&self, rid: Rid) -> QuarryResult<Record> {
        let header = self.header.lock();
        Self::check_rid(&header, rid)?;
        let page = self
            .buffer_pool
            .fetch_page(PageId::new(self.file_id, rid.page_no))?;
        let guard = page.read();
        if !bitmap::get(
            &guard.data()[Self::bitmap_range(&header)],
            rid.slot_no as usize,
        ) {
            return Err(QuarryError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        let offset = Self::slot_offset(&header, rid.slot_no);
        Ok(Record::new(
            guard.data()[offset..offset + header.record_size as usize].to_vec(),
        ))
    }

    /// O(1) existence probe via the bitmap; out-of-range rids are simply
    /// absent.
    pub fn is_record(&self, rid: Rid) -> QuarryResult<bool> {
        let header = self.header.lock();
        if Self::check_rid(&header, rid).is_err() {
            return Ok(false);
        }
        let page = self
            .buffer_pool
            .fetch_page(PageId::new(self.file_id, rid.page_no))?;
        let guard = page.read();
        Ok(bitmap::get(
            &guard.data()[Self::bitmap_range(&header)],
            rid.slot_no as usize,
        ))
    }

    /// First occupied slot at or after `start` in `(page, slot)` order.
    /// Drives the heap scan.
    pub(crate) fn next_occupied(&self, start: Rid) -> QuarryResult<Option<Rid>> {
        let header = *self.header.lock();
        let mut slot = start.slot_no as usize;
        for page_no in start.page_no..=header.num_pages {
            if page_no == INVALID_PAGE_NO {
                continue;
            }
            let page = self
                .buffer_pool
                .fetch_page(PageId::new(self.file_id, page_no))?;
            let guard = page.read();
            if let Some(found) = bitmap::next_set(
                &guard.data()[Self::bitmap_range(&header)],
                slot,
                header.records_per_page as usize,
            ) {
                return Ok(Some(Rid::new(page_no, found as u32)));
            }
            slot = 0;
        }
        Ok(None)
    }

    pub fn flush(&self) -> QuarryResult<()> {
        self.buffer_pool.flush_all_pages(self.file_id)
    }
}
