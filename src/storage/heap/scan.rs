use std::sync::Arc;

use crate::error::QuarryResult;
use crate::storage::heap::HeapFile;
use crate::storage::Rid;

/// Lazy scan over a heap file's occupied slots in ascending
/// `(page, slot)` order. Not restartable; create a new scan instead.
/// Pages allocated after a position was taken are visited, but records
/// inserted behind the cursor are not revisited; unset slots are never
/// produced.
#[derive(Debug)]
pub struct HeapScan {
    heap: Arc<HeapFile>,
    rid: Option<Rid>,
}

impl HeapScan {
    /// Position on the first occupied slot, starting at page 1.
    pub fn new(heap: Arc<HeapFile>) -> QuarryResult<Self> {
        let rid = heap.next_occupied(Rid::new(1, 0))?;
        Ok(Self { heap, rid })
    }

    /// Advance to the next occupied slot strictly after the current one.
    pub fn next(&mut self) -> QuarryResult<()> {
        if let Some(current) = self.rid {
            self.rid = self
                .heap
                .next_occupied(Rid::new(current.page_no, current.slot_no + 1))?;
        }
        Ok(())
    }

    pub fn rid(&self) -> Option<Rid> {
        self.rid
    }

    pub fn is_end(&self) -> bool {
        self.rid.is_none()
    }
}
