//! Units of work and row-level locks.
//!
//! A gap-free draw locks its sequence (or date-range) row and stages the new
//! counter value on the [`Transaction`]. The value reaches SQL only at
//! [`Transaction::commit`]; [`Transaction::rollback`] (or drop) discards it.
//! Either way the locks are released when the transaction ends, waking any
//! drawer blocked on the same row.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use openerp_core::{Caller, ServiceError};
use openerp_sql::{SQLStore, Statement, Value};
use tracing::{debug, warn};

/// A lockable counter row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    Sequence(i64),
    DateRange(i64),
}

impl RowKey {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            RowKey::Sequence(_) => "ir_sequence",
            RowKey::DateRange(_) => "ir_sequence_date_range",
        }
    }

    pub(crate) fn id(&self) -> i64 {
        match self {
            RowKey::Sequence(id) | RowKey::DateRange(id) => *id,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.table(), self.id())
    }
}

/// Exclusive row locks, each owned by one transaction until it ends.
#[derive(Default)]
pub struct RowLocks {
    owners: Mutex<HashMap<RowKey, u64>>,
    released: Condvar,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `row` for transaction `txn`, waiting at most `wait`.
    ///
    /// Re-locking a row the transaction already owns returns immediately.
    pub fn acquire(&self, row: RowKey, txn: u64, wait: Duration) -> Result<(), ServiceError> {
        let deadline = Instant::now() + wait;
        let mut owners = self
            .owners
            .lock()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        loop {
            match owners.get(&row) {
                None => {
                    owners.insert(row, txn);
                    return Ok(());
                }
                Some(&owner) if owner == txn => return Ok(()),
                Some(&owner) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!("txn {txn}: could not lock {row} held by txn {owner} within {wait:?}");
                        return Err(ServiceError::Busy(format!(
                            "could not obtain lock on {row}: held by another transaction"
                        )));
                    }
                    let (guard, _) = self
                        .released
                        .wait_timeout(owners, deadline - now)
                        .map_err(|e| ServiceError::Internal(e.to_string()))?;
                    owners = guard;
                }
            }
        }
    }

    /// Release every row in `rows` owned by `txn` and wake waiters.
    pub fn release(&self, txn: u64, rows: &[RowKey]) {
        if rows.is_empty() {
            return;
        }
        // A poisoned map still holds valid ownership data; keep releasing.
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows {
            if owners.get(row) == Some(&txn) {
                owners.remove(row);
            }
        }
        drop(owners);
        self.released.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn owner(&self, row: RowKey) -> Option<u64> {
        let owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        owners.get(&row).copied()
    }
}

/// A unit of work that numbers one or more business documents.
///
/// Obtained from `SequenceService::begin`. Dropping an unfinished
/// transaction rolls it back.
pub struct Transaction {
    id: u64,
    caller: Caller,
    sql: Arc<dyn SQLStore>,
    locks: Arc<RowLocks>,
    lock_wait: Duration,
    held: Vec<RowKey>,
    staged: BTreeMap<RowKey, i64>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        caller: Caller,
        sql: Arc<dyn SQLStore>,
        locks: Arc<RowLocks>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            id,
            caller,
            sql,
            locks,
            lock_wait,
            held: Vec::new(),
            staged: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Whether this transaction holds the lock on `row`.
    pub(crate) fn holds(&self, row: RowKey) -> bool {
        self.held.contains(&row)
    }

    /// Take the exclusive lock on `row` for the rest of the transaction.
    pub(crate) fn lock_row(&mut self, row: RowKey) -> Result<(), ServiceError> {
        if self.held.contains(&row) {
            return Ok(());
        }
        self.locks.acquire(row, self.id, self.lock_wait)?;
        self.held.push(row);
        Ok(())
    }

    /// The `number_next` value this transaction has staged for `row`.
    pub(crate) fn staged(&self, row: RowKey) -> Option<i64> {
        self.staged.get(&row).copied()
    }

    /// Stage a new `number_next` for a row this transaction has locked.
    pub(crate) fn stage(&mut self, row: RowKey, number_next: i64) -> Result<(), ServiceError> {
        if !self.held.contains(&row) {
            return Err(ServiceError::Internal(format!(
                "txn {}: staging {row} without holding its lock",
                self.id
            )));
        }
        self.staged.insert(row, number_next);
        Ok(())
    }

    /// Write staged counters atomically, then release all locks.
    pub fn commit(mut self) -> Result<(), ServiceError> {
        let statements: Vec<Statement> = self
            .staged
            .iter()
            .map(|(row, next)| {
                Statement::new(
                    format!("UPDATE {} SET number_next = ?1 WHERE id = ?2", row.table()),
                    vec![Value::Integer(*next), Value::Integer(row.id())],
                )
            })
            .collect();

        let result = if statements.is_empty() {
            Ok(0)
        } else {
            self.sql.exec_batch(&statements)
        };

        self.finish();
        result
            .map(|_| debug!("txn {} committed {} counter(s)", self.id, statements.len()))
            .map_err(|e| ServiceError::Storage(format!("commit failed: {e}")))
    }

    /// Discard staged counters and release all locks.
    pub fn rollback(mut self) {
        debug!("txn {} rolled back", self.id);
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.staged.clear();
        let held = std::mem::take(&mut self.held);
        self.locks.release(self.id, &held);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if !self.staged.is_empty() {
                warn!("txn {} dropped without commit; discarding staged counters", self.id);
            }
            self.finish();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("caller", &self.caller.user)
            .field("held", &self.held)
            .field("staged", &self.staged)
            .finish()
    }
}
