use log::warn;
use std::sync::Arc;

use crate::catalog::{ColumnMeta, IndexMeta};
use crate::error::{QuarryError, QuarryResult};
use crate::execution::{ExecContext, Executor};
use crate::expression::{eval_conditions, CompOp, Condition, ConditionRhs};
use crate::storage::heap::{HeapFile, Record};
use crate::storage::index::{BTreeIndex, Iid, TreeScan};
use crate::storage::Rid;

/// Range scan over an index, narrowed by predicates on the index's
/// leading column; all predicates are re-checked against the fetched
/// record as residuals.
pub struct IndexScanExecutor {
    heap: Arc<HeapFile>,
    index: Arc<BTreeIndex>,
    index_meta: IndexMeta,
    cols: Vec<ColumnMeta>,
    len: usize,
    conds: Vec<Condition>,
    scan: Option<TreeScan>,
    rid: Option<Rid>,
}

impl IndexScanExecutor {
    /// Conditions whose left side lives on another table are swapped at
    /// construction so every lhs refers to the scanned table.
    pub fn new(
        heap: Arc<HeapFile>,
        index: Arc<BTreeIndex>,
        index_meta: IndexMeta,
        table_name: &str,
        cols: Vec<ColumnMeta>,
        conds: Vec<Condition>,
    ) -> QuarryResult<Self> {
        let len = cols.iter().map(|c| c.len as usize).sum();
        let conds = conds
            .iter()
            .map(|c| c.oriented_to(table_name))
            .collect::<QuarryResult<Vec<Condition>>>()?;
        Ok(Self {
            heap,
            index,
            index_meta,
            cols,
            len,
            conds,
            scan: None,
            rid: None,
        })
    }

    /// Narrow `[begin, end)` with the first literal predicate on the
    /// leading index column. `!=` never narrows.
    fn select_range(&self) -> QuarryResult<(Iid, Iid)> {
        let mut lower = self.index.leaf_begin();
        let mut upper = self.index.leaf_end()?;
        let leading_col = &self.index_meta.col_names[0];
        for cond in &self.conds {
            let ConditionRhs::Value { raw, .. } = &cond.rhs else {
                continue;
            };
            if cond.op == CompOp::Ne || &cond.lhs.column != leading_col {
                continue;
            }
            match cond.op {
                CompOp::Eq => {
                    lower = self.index.lower_bound(raw)?;
                    upper = self.index.upper_bound(raw)?;
                }
                CompOp::Lt => upper = self.index.lower_bound(raw)?,
                CompOp::Le => upper = self.index.upper_bound(raw)?,
                CompOp::Gt => lower = self.index.upper_bound(raw)?,
                CompOp::Ge => lower = self.index.lower_bound(raw)?,
                CompOp::Ne => unreachable!(),
            }
            break;
        }
        Ok((lower, upper))
    }

    /// Walk the range until a live record satisfies every residual
    /// predicate. Rids whose record vanished underneath the index are
    /// skipped.
    fn seek_match(&mut self) -> QuarryResult<()> {
        self.rid = None;
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| QuarryError::Execution("scan used before begin".to_string()))?;
        while !scan.is_end() {
            let rid = scan.rid()?;
            match self.heap.get_record(rid) {
                Ok(record) => {
                    if eval_conditions(&self.cols, &record.data, &self.conds)? {
                        self.rid = Some(rid);
                        return Ok(());
                    }
                }
                Err(QuarryError::RecordNotFound { page_no, slot_no }) => {
                    warn!("index entry points at missing record ({page_no}, {slot_no})");
                }
                Err(e) => return Err(e),
            }
            scan.next()?;
        }
        Ok(())
    }
}

impl Executor for IndexScanExecutor {
    fn begin(&mut self, ctx: &ExecContext) -> QuarryResult<()> {
        ctx.lock_manager
            .lock_shared_on_table(&ctx.txn, self.heap.file_id())?;
        let (lower, upper) = self.select_range()?;
        self.scan = Some(TreeScan::new(self.index.clone(), lower, upper));
        self.seek_match()
    }

    fn next(&mut self, _ctx: &ExecContext) -> QuarryResult<()> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
        }
        self.seek_match()
    }

    fn is_end(&self) -> bool {
        self.rid.is_none()
    }

    fn rid(&self) -> Option<Rid> {
        self.rid
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn columns(&self) -> &[ColumnMeta] {
        &self.cols
    }

    fn tuple(&self) -> QuarryResult<Record> {
        let rid = self
            .rid
            .ok_or_else(|| QuarryError::Execution("scan has no current tuple".to_string()))?;
        self.heap.get_record(rid)
    }
}
