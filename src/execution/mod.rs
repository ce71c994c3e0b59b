mod delete;
mod index_scan;
mod nested_loop_join;
mod seq_scan;

pub use delete::DeleteExecutor;
pub use index_scan::IndexScanExecutor;
pub use nested_loop_join::NestedLoopJoinExecutor;
pub use seq_scan::SeqScanExecutor;

use std::sync::Arc;

use crate::catalog::ColumnMeta;
use crate::error::QuarryResult;
use crate::storage::heap::Record;
use crate::storage::Rid;
use crate::transaction::{LockManager, Transaction};

/// Per-query execution state shared by every operator in a pipeline.
pub struct ExecContext {
    pub lock_manager: Arc<LockManager>,
    pub txn: Arc<Transaction>,
}

impl ExecContext {
    pub fn new(lock_manager: Arc<LockManager>, txn: Arc<Transaction>) -> Self {
        Self { lock_manager, txn }
    }
}

/// Pull-based physical operator. `begin` positions on the first
/// qualifying tuple, `next` advances past the current one; both leave
/// the operator at end-of-stream when nothing qualifies.
pub trait Executor {
    fn begin(&mut self, ctx: &ExecContext) -> QuarryResult<()>;

    fn next(&mut self, ctx: &ExecContext) -> QuarryResult<()>;

    fn is_end(&self) -> bool;

    /// Heap position of the current tuple; None for operators whose
    /// output rows have no single backing record.
    fn rid(&self) -> Option<Rid>;

    fn tuple_len(&self) -> usize;

    fn columns(&self) -> &[ColumnMeta];

    /// Materialize the current output tuple.
    fn tuple(&self) -> QuarryResult<Record>;
}
