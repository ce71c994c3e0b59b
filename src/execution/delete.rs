use std::sync::Arc;

use crate::catalog::{ColumnMeta, TableMeta};
use crate::error::{QuarryError, QuarryResult};
use crate::execution::{ExecContext, Executor};
use crate::expression::{eval_conditions, Condition};
use crate::storage::heap::{HeapFile, Record};
use crate::storage::index::BTreeIndex;
use crate::storage::Rid;

/// Delete a pre-computed rid list, re-verifying every predicate against
/// the live record and maintaining the table's indexes. Rows that
/// vanished since planning are skipped. Produces no tuples.
pub struct DeleteExecutor {
    heap: Arc<HeapFile>,
    table: TableMeta,
    indexes: Vec<Arc<BTreeIndex>>,
    conds: Vec<Condition>,
    rids: Vec<Rid>,
    done: bool,
    deleted: usize,
}

impl DeleteExecutor {
    pub fn new(
        heap: Arc<HeapFile>,
        table: TableMeta,
        indexes: Vec<Arc<BTreeIndex>>,
        conds: Vec<Condition>,
        rids: Vec<Rid>,
    ) -> Self {
        Self {
            heap,
            table,
            indexes,
            conds,
            rids,
            done: false,
            deleted: 0,
        }
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted
    }
}

impl Executor for DeleteExecutor {
    /// Locks the table with write intent plus each target row, then
    /// performs every deletion.
    fn begin(&mut self, ctx: &ExecContext) -> QuarryResult<()> {
        ctx.lock_manager
            .lock_intention_exclusive_on_table(&ctx.txn, self.heap.file_id())?;
        for rid in &self.rids {
            ctx.lock_manager
                .lock_exclusive_on_record(&ctx.txn, self.heap.file_id(), *rid)?;
        }

        for rid in self.rids.clone() {
            if !self.heap.is_record(rid)? {
                continue;
            }
            let record = self.heap.get_record(rid)?;
            if !eval_conditions(&self.table.cols, &record.data, &self.conds)? {
                continue;
            }
            for (meta, index) in self.table.indexes.iter().zip(self.indexes.iter()) {
                let key = meta.key_from_record(&record.data);
                index.delete_entry(&key, Some(ctx.txn.as_ref()))?;
            }
            self.heap.delete_record(rid)?;
            self.deleted += 1;
        }
        self.done = true;
        Ok(())
    }

    fn next(&mut self, _ctx: &ExecContext) -> QuarryResult<()> {
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.done
    }

    fn rid(&self) -> Option<Rid> {
        None
    }

    fn tuple_len(&self) -> usize {
        0
    }

    fn columns(&self) -> &[ColumnMeta] {
        &[]
    }

    fn tuple(&self) -> QuarryResult<Record> {
        Err(QuarryError::Execution(
            "delete produces no tuples".to_string(),
        ))
    }
}
