use thiserror::Error;

pub type QuarryResult<T, E = QuarryError> = Result<T, E>;

/// Why a transaction was aborted by the concurrency layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A lock request conflicted with granted locks; under the no-wait
    /// policy the requester aborts instead of blocking.
    DeadlockPrevention,
    /// A lock was requested after the transaction entered its shrinking
    /// phase (or after it terminated).
    LockOnShrinking,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::DeadlockPrevention => write!(f, "deadlock prevention"),
            AbortReason::LockOnShrinking => write!(f, "lock on shrinking"),
        }
    }
}

#[derive(Debug, Error)]
pub enum QuarryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("database {0} already exists")]
    DatabaseExists(String),

    #[error("database {0} not found")]
    DatabaseNotFound(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("column {0} not found")]
    ColumnNotFound(String),

    #[error("index {0} already exists")]
    IndexExists(String),

    #[error("index {0} not found")]
    IndexNotFound(String),

    #[error("record at page {page_no} slot {slot_no} not found")]
    RecordNotFound { page_no: u32, slot_no: u32 },

    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAbort { txn_id: u64, reason: AbortReason },
}

impl QuarryError {
    /// True for errors that abort the surrounding transaction rather than
    /// merely failing the current statement.
    pub fn is_transaction_abort(&self) -> bool {
        matches!(self, QuarryError::TransactionAbort { .. })
    }
}
