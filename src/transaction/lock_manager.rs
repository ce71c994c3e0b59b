use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::buffer::FileId;
use crate::error::{AbortReason, QuarryError, QuarryResult};
use crate::storage::Rid;
use crate::transaction::{LockDataId, Transaction, TransactionId, TransactionState};

/// Lock modes of multigranularity table locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Exclusivity rank used for the group mode: X > SIX > S > IX > IS.
    fn rank(self) -> u8 {
        match self {
            LockMode::IntentionShared => 1,
            LockMode::IntentionExclusive => 2,
            LockMode::Shared => 3,
            LockMode::SharedIntentionExclusive => 4,
            LockMode::Exclusive => 5,
        }
    }

    /// Whether holding `self` already satisfies a request for `other`.
    fn covers(self, other: LockMode) -> bool {
        match other {
            LockMode::IntentionShared => true,
            LockMode::IntentionExclusive => matches!(
                self,
                LockMode::IntentionExclusive
                    | LockMode::SharedIntentionExclusive
                    | LockMode::Exclusive
            ),
            LockMode::Shared => matches!(
                self,
                LockMode::Shared | LockMode::SharedIntentionExclusive | LockMode::Exclusive
            ),
            LockMode::SharedIntentionExclusive => matches!(
                self,
                LockMode::SharedIntentionExclusive | LockMode::Exclusive
            ),
            LockMode::Exclusive => matches!(self, LockMode::Exclusive),
        }
    }

    /// Compatibility of a requested mode against one granted mode.
    fn compatible_with(self, held: LockMode) -> bool {
        match self {
            LockMode::IntentionShared => held != LockMode::Exclusive,
            LockMode::IntentionExclusive => matches!(
                held,
                LockMode::IntentionShared | LockMode::IntentionExclusive
            ),
            LockMode::Shared => matches!(held, LockMode::IntentionShared | LockMode::Shared),
            LockMode::SharedIntentionExclusive => held == LockMode::IntentionShared,
            LockMode::Exclusive => false,
        }
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

/// Per-item request queue with its cached group mode and the counters
/// that drive SIX upgrade decisions.
#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    group_lock_mode: Option<LockMode>,
    shared_count: usize,
    ix_count: usize,
}

impl LockRequestQueue {
    /// Recompute the cached group mode and counters from the surviving
    /// requests.
    fn refresh(&mut self) {
        self.group_lock_mode = self
            .requests
            .iter()
            .filter(|r| r.granted)
            .map(|r| r.mode)
            .max_by_key(|m| m.rank());
        self.shared_count = self.count_of(|m| {
            matches!(m, LockMode::Shared | LockMode::SharedIntentionExclusive)
        });
        self.ix_count = self.count_of(|m| {
            matches!(
                m,
                LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
            )
        });
    }

    fn count_of(&self, pred: impl Fn(LockMode) -> bool) -> usize {
        self.requests
            .iter()
            .filter(|r| r.granted && pred(r.mode))
            .count()
    }
}

/// Table-level multigranularity lock manager under strict 2PL with a
/// no-wait policy: a request that would block aborts its transaction
/// instead. Row-level requests are accepted trivially; they are the
/// extension point for finer granularity.
#[derive(Debug, Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockRequestQueue>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_shared_on_table(&self, txn: &Transaction, file_id: FileId) -> QuarryResult<()> {
        self.lock_table_mode(txn, file_id, LockMode::Shared)
    }

    pub fn lock_exclusive_on_table(&self, txn: &Transaction, file_id: FileId) -> QuarryResult<()> {
        self.lock_table_mode(txn, file_id, LockMode::Exclusive)
    }

    pub fn lock_intention_shared_on_table(
        &self,
        txn: &Transaction,
        file_id: FileId,
    ) -> QuarryResult<()> {
        self.lock_table_mode(txn, file_id, LockMode::IntentionShared)
    }

    pub fn lock_intention_exclusive_on_table(
        &self,
        txn: &Transaction,
        file_id: FileId,
    ) -> QuarryResult<()> {
        self.lock_table_mode(txn, file_id, LockMode::IntentionExclusive)
    }

    /// Row-level shared lock: granted unconditionally.
    pub fn lock_shared_on_record(
        &self,
        _txn: &Transaction,
        _file_id: FileId,
        _rid: Rid,
    ) -> QuarryResult<()> {
        Ok(())
    }

    /// Row-level exclusive lock: granted unconditionally.
    pub fn lock_exclusive_on_record(
        &self,
        _txn: &Transaction,
        _file_id: FileId,
        _rid: Rid,
    ) -> QuarryResult<()> {
        Ok(())
    }

    /// Release one lock. The first unlock moves the transaction into
    /// its shrinking phase; unlocking after termination is a protocol
    /// violation.
    pub fn unlock(&self, txn: &Transaction, lock_data_id: LockDataId) -> QuarryResult<bool> {
        match txn.state() {
            TransactionState::Growing => txn.set_state(TransactionState::Shrinking),
            TransactionState::Default | TransactionState::Shrinking => {}
            _ => {
                return Err(QuarryError::TransactionAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::LockOnShrinking,
                })
            }
        }
        Ok(self.remove_request(txn.id(), lock_data_id, Some(txn)))
    }

    /// Drop every lock the transaction holds; used on commit and abort.
    pub fn release_all(&self, txn: &Transaction) {
        for lock_data_id in txn.take_lock_set() {
            self.remove_request(txn.id(), lock_data_id, None);
        }
    }

    fn remove_request(
        &self,
        txn_id: TransactionId,
        lock_data_id: LockDataId,
        txn: Option<&Transaction>,
    ) -> bool {
        let mut table = self.lock_table.lock();
        let Some(queue) = table.get_mut(&lock_data_id) else {
            return false;
        };
        let before = queue.requests.len();
        queue.requests.retain(|r| r.txn_id != txn_id);
        let removed = queue.requests.len() != before;
        queue.refresh();
        if queue.requests.is_empty() {
            table.remove(&lock_data_id);
        }
        if let Some(txn) = txn {
            txn.remove_lock(&lock_data_id);
        }
        removed
    }

    /// Move the transaction into (or keep it in) the growing phase;
    /// locking while shrinking or after termination aborts.
    fn check_growing(&self, txn: &Transaction) -> QuarryResult<()> {
        match txn.state() {
            TransactionState::Default => {
                txn.set_state(TransactionState::Growing);
                Ok(())
            }
            TransactionState::Growing => Ok(()),
            _ => Err(QuarryError::TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            }),
        }
    }

    fn lock_table_mode(
        &self,
        txn: &Transaction,
        file_id: FileId,
        mode: LockMode,
    ) -> QuarryResult<()> {
        self.check_growing(txn)?;
        let lock_data_id = LockDataId::Table(file_id);
        let mut table = self.lock_table.lock();
        let queue = table.entry(lock_data_id).or_default();

        if let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
        {
            return Self::upgrade(queue, pos, mode, txn.id());
        }

        // no-wait: an incompatible request aborts instead of blocking
        if let Some(group) = queue.group_lock_mode {
            if !mode.compatible_with_group(group) {
                warn!(
                    "txn {} aborted: {:?} lock on table {} conflicts with group {:?}",
                    txn.id(),
                    mode,
                    file_id,
                    group
                );
                return Err(QuarryError::TransactionAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::DeadlockPrevention,
                });
            }
        }

        queue.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            granted: true,
        });
        queue.refresh();
        txn.add_lock(lock_data_id);
        debug!("txn {} granted {:?} on table {}", txn.id(), mode, file_id);
        Ok(())
    }

    /// Handle a repeated request on an item the transaction already
    /// holds. Permitted upgrades: IS->S, IS->IX, IX->SIX (sole intention
    /// writer), S->SIX (sole reader), and any mode to X when the
    /// requester is alone in the queue. Everything else aborts.
    fn upgrade(
        queue: &mut LockRequestQueue,
        pos: usize,
        requested: LockMode,
        txn_id: TransactionId,
    ) -> QuarryResult<()> {
        let held = queue.requests[pos].mode;
        if held.covers(requested) {
            return Ok(());
        }
        let upgraded = match (held, requested) {
            (LockMode::IntentionShared, LockMode::Shared) => Some(LockMode::Shared),
            (LockMode::IntentionShared, LockMode::IntentionExclusive) => {
                Some(LockMode::IntentionExclusive)
            }
            (LockMode::IntentionExclusive, LockMode::Shared) if queue.ix_count == 1 => {
                Some(LockMode::SharedIntentionExclusive)
            }
            (LockMode::Shared, LockMode::IntentionExclusive) if queue.shared_count == 1 => {
                Some(LockMode::SharedIntentionExclusive)
            }
            (_, LockMode::Exclusive) if queue.requests.len() == 1 => Some(LockMode::Exclusive),
            _ => None,
        };
        match upgraded {
            Some(new_mode) => {
                queue.requests[pos].mode = new_mode;
                queue.refresh();
                debug!("txn {} upgraded {:?} to {:?}", txn_id, held, new_mode);
                Ok(())
            }
            None => {
                warn!(
                    "txn {} aborted: cannot upgrade {:?} to {:?}",
                    txn_id, held, requested
                );
                Err(QuarryError::TransactionAbort {
                    txn_id,
                    reason: AbortReason::DeadlockPrevention,
                })
            }
        }
    }
}

impl LockMode {
    /// No-wait admission test against a queue's cached group mode.
    fn compatible_with_group(self, group: LockMode) -> bool {
        self.compatible_with(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadlock_prevented(result: QuarryResult<()>) -> bool {
        matches!(
            result,
            Err(QuarryError::TransactionAbort {
                reason: AbortReason::DeadlockPrevention,
                ..
            })
        )
    }

    #[test]
    fn shared_locks_coexist() {
        let manager = LockManager::new();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        manager.lock_shared_on_table(&t1, 7).unwrap();
        manager.lock_shared_on_table(&t2, 7).unwrap();
        assert_eq!(t1.state(), TransactionState::Growing);
        manager.unlock(&t1, LockDataId::Table(7)).unwrap();
        manager.unlock(&t2, LockDataId::Table(7)).unwrap();
    }

    #[test]
    fn exclusive_conflict_aborts_second_requester() {
        let manager = LockManager::new();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        manager.lock_exclusive_on_table(&t1, 7).unwrap();
        assert!(deadlock_prevented(manager.lock_exclusive_on_table(&t2, 7)));
        assert!(deadlock_prevented(manager.lock_shared_on_table(&t2, 7)));

        // after release a fresh transaction gets the lock
        manager.release_all(&t1);
        t1.set_state(TransactionState::Committed);
        let t3 = Transaction::new(3);
        manager.lock_exclusive_on_table(&t3, 7).unwrap();
    }

    #[test]
    fn intention_modes_follow_matrix() {
        let manager = LockManager::new();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        let t3 = Transaction::new(3);

        manager.lock_intention_shared_on_table(&t1, 7).unwrap();
        manager.lock_intention_exclusive_on_table(&t2, 7).unwrap();
        // S conflicts with the granted IX
        assert!(deadlock_prevented(manager.lock_shared_on_table(&t3, 7)));
        // another IX coexists
        manager.lock_intention_exclusive_on_table(&t3, 7).unwrap();
    }

    #[test]
    fn upgrades() {
        let manager = LockManager::new();

        // IS -> S
        let t1 = Transaction::new(1);
        manager.lock_intention_shared_on_table(&t1, 1).unwrap();
        manager.lock_shared_on_table(&t1, 1).unwrap();

        // sole reader: S -> SIX via an IX request
        let t2 = Transaction::new(2);
        manager.lock_shared_on_table(&t2, 2).unwrap();
        manager.lock_intention_exclusive_on_table(&t2, 2).unwrap();
        // the SIX holder blocks an outside IS? no: IS is compatible,
        // but S is not
        let t3 = Transaction::new(3);
        manager.lock_intention_shared_on_table(&t3, 2).unwrap();
        assert!(deadlock_prevented(manager.lock_shared_on_table(&Transaction::new(4), 2)));

        // alone in the queue: S -> X
        let t5 = Transaction::new(5);
        manager.lock_shared_on_table(&t5, 3).unwrap();
        manager.lock_exclusive_on_table(&t5, 3).unwrap();

        // not alone: S -> X is refused
        let t6 = Transaction::new(6);
        let t7 = Transaction::new(7);
        manager.lock_shared_on_table(&t6, 4).unwrap();
        manager.lock_shared_on_table(&t7, 4).unwrap();
        assert!(deadlock_prevented(manager.lock_exclusive_on_table(&t6, 4)));
    }

    #[test]
    fn trivial_upgrade_is_noop() {
        let manager = LockManager::new();
        let t1 = Transaction::new(1);
        manager.lock_exclusive_on_table(&t1, 9).unwrap();
        // weaker re-requests succeed silently
        manager.lock_shared_on_table(&t1, 9).unwrap();
        manager.lock_intention_exclusive_on_table(&t1, 9).unwrap();
        // still exclusive to others
        assert!(deadlock_prevented(
            manager.lock_intention_shared_on_table(&Transaction::new(2), 9)
        ));
    }

    #[test]
    fn unlock_then_relock_aborts() {
        let manager = LockManager::new();
        let t1 = Transaction::new(1);
        manager.lock_shared_on_table(&t1, 7).unwrap();
        manager.unlock(&t1, LockDataId::Table(7)).unwrap();
        assert_eq!(t1.state(), TransactionState::Shrinking);
        let result = manager.lock_shared_on_table(&t1, 7);
        assert!(matches!(
            result,
            Err(QuarryError::TransactionAbort {
                reason: AbortReason::LockOnShrinking,
                ..
            })
        ));
    }

    #[test]
    fn group_mode_tracks_strongest_granted() {
        let manager = LockManager::new();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        manager.lock_intention_shared_on_table(&t1, 7).unwrap();
        manager.lock_shared_on_table(&t2, 7).unwrap();
        {
            let table = manager.lock_table.lock();
            let queue = table.get(&LockDataId::Table(7)).unwrap();
            assert_eq!(queue.group_lock_mode, Some(LockMode::Shared));
            assert_eq!(queue.shared_count, 1);
            assert_eq!(queue.ix_count, 0);
        }
        manager.unlock(&t2, LockDataId::Table(7)).unwrap();
        {
            let table = manager.lock_table.lock();
            let queue = table.get(&LockDataId::Table(7)).unwrap();
            assert_eq!(queue.group_lock_mode, Some(LockMode::IntentionShared));
        }
    }

    #[test]
    fn row_locks_always_grant() {
        let manager = LockManager::new();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        let rid = Rid::new(1, 1);
        manager.lock_exclusive_on_record(&t1, 7, rid).unwrap();
        manager.lock_exclusive_on_record(&t2, 7, rid).unwrap();
        manager.lock_shared_on_record(&t2, 7, rid).unwrap();
    }

    #[test]
    fn release_all_clears_every_queue() {
        let manager = LockManager::new();
        let t1 = Transaction::new(1);
        manager.lock_shared_on_table(&t1, 1).unwrap();
        manager.lock_intention_exclusive_on_table(&t1, 2).unwrap();
        assert_eq!(t1.lock_set().len(), 2);
        manager.release_all(&t1);
        assert!(t1.lock_set().is_empty());
        assert!(manager.lock_table.lock().is_empty());
    }
}
