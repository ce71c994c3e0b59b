mod lock_manager;

pub use lock_manager::{LockManager, LockMode};

use parking_lot::Mutex;
use std::collections::HashSet;

use crate::buffer::{FileId, PageId};
use crate::storage::Rid;

pub type TransactionId = u64;

/// Two-phase-locking lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Identity of a lockable data item: a whole table or one row of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table(FileId),
    Row(FileId, Rid),
}

/// Transaction handle. The lock manager drives the state machine and
/// lock set through shared references, so both are interior-mutable.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: Mutex<TransactionState>,
    lock_set: Mutex<HashSet<LockDataId>>,
    // index pages freed on this transaction's behalf, reclaimed at commit
    freed_index_pages: Mutex<Vec<PageId>>,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Default),
            lock_set: Mutex::new(HashSet::new()),
            freed_index_pages: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn lock_set(&self) -> Vec<LockDataId> {
        self.lock_set.lock().iter().copied().collect()
    }

    pub(crate) fn add_lock(&self, id: LockDataId) {
        self.lock_set.lock().insert(id);
    }

    pub(crate) fn remove_lock(&self, id: &LockDataId) {
        self.lock_set.lock().remove(id);
    }

    pub(crate) fn take_lock_set(&self) -> Vec<LockDataId> {
        self.lock_set.lock().drain().collect()
    }

    pub fn record_freed_index_page(&self, page_id: PageId) {
        self.freed_index_pages.lock().push(page_id);
    }

    pub fn take_freed_index_pages(&self) -> Vec<PageId> {
        std::mem::take(&mut self.freed_index_pages.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_and_lock_set() {
        let txn = Transaction::new(1);
        assert_eq!(txn.state(), TransactionState::Default);
        txn.set_state(TransactionState::Growing);
        assert_eq!(txn.state(), TransactionState::Growing);

        txn.add_lock(LockDataId::Table(3));
        txn.add_lock(LockDataId::Row(3, Rid::new(1, 2)));
        assert_eq!(txn.lock_set().len(), 2);
        txn.remove_lock(&LockDataId::Table(3));
        assert_eq!(txn.lock_set().len(), 1);
        assert_eq!(txn.take_lock_set().len(), 1);
        assert!(txn.lock_set().is_empty());
    }
}
