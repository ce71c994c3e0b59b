use std::sync::Arc;

use crate::catalog::ColumnMeta;
use crate::error::{QuarryError, QuarryResult};
use crate::execution::{ExecContext, Executor};
use crate::expression::{eval_conditions, Condition};
use crate::storage::heap::{HeapFile, HeapScan, Record};
use crate::storage::Rid;

/// Full-table scan filtered by AND-combined predicates.
pub struct SeqScanExecutor {
    heap: Arc<HeapFile>,
    cols: Vec<ColumnMeta>,
    len: usize,
    conds: Vec<Condition>,
    scan: Option<HeapScan>,
}

impl SeqScanExecutor {
    pub fn new(heap: Arc<HeapFile>, cols: Vec<ColumnMeta>, conds: Vec<Condition>) -> Self {
        let len = cols.iter().map(|c| c.len as usize).sum();
        Self {
            heap,
            cols,
            len,
            conds,
            scan: None,
        }
    }

    /// Walk forward until the current record satisfies every predicate.
    fn seek_match(&mut self) -> QuarryResult<()> {
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| QuarryError::Execution("scan used before begin".to_string()))?;
        while let Some(rid) = scan.rid() {
            let record = self.heap.get_record(rid)?;
            if eval_conditions(&self.cols, &record.data, &self.conds)? {
                return Ok(());
            }
            scan.next()?;
        }
        Ok(())
    }
}

impl Executor for SeqScanExecutor {
    fn begin(&mut self, ctx: &ExecContext) -> QuarryResult<()> {
        ctx.lock_manager
            .lock_shared_on_table(&ctx.txn, self.heap.file_id())?;
        self.scan = Some(HeapScan::new(self.heap.clone())?);
        self.seek_match()
    }

    fn next(&mut self, _ctx: &ExecContext) -> QuarryResult<()> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
        }
        self.seek_match()
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn rid(&self) -> Option<Rid> {
        self.scan.as_ref().and_then(|s| s.rid())
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn columns(&self) -> &[ColumnMeta] {
        &self.cols
    }

    fn tuple(&self) -> QuarryResult<Record> {
        let rid = self
            .rid()
            .ok_or_else(|| QuarryError::Execution("scan has no current tuple".to_string()))?;
        self.heap.get_record(rid)
    }
}
