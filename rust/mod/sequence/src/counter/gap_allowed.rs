use std::sync::Arc;

use openerp_core::ServiceError;

use super::{Counter, NativeSequences};
use crate::txn::Transaction;

/// Counter backed by a native counter.
///
/// Draws commit immediately and ignore the caller's transaction, so a
/// rollback leaves a hole in the numbering.
pub struct GapAllowedCounter {
    name: String,
    stored_next: i64,
    native: Arc<NativeSequences>,
}

impl GapAllowedCounter {
    /// `stored_next` is the row's `number_next`, reported by `peek` when the
    /// native counter does not exist.
    pub fn new(name: String, stored_next: i64, native: Arc<NativeSequences>) -> Self {
        Self {
            name,
            stored_next,
            native,
        }
    }
}

impl Counter for GapAllowedCounter {
    fn next(&self, _txn: &mut Transaction) -> Result<i64, ServiceError> {
        self.native.nextval(&self.name)
    }

    fn reset(&self, _txn: &mut Transaction, value: i64) -> Result<(), ServiceError> {
        self.native.alter(&self.name, None, Some(value))
    }

    fn peek(&self) -> Result<i64, ServiceError> {
        Ok(self.native.peek(&self.name)?.unwrap_or(self.stored_next))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use openerp_core::Caller;
    use openerp_kv::RedbStore;
    use openerp_sql::SqliteStore;

    use super::*;
    use crate::txn::RowLocks;

    fn txn(id: u64) -> Transaction {
        Transaction::new(
            id,
            Caller::new("tester"),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(RowLocks::new()),
            Duration::ZERO,
        )
    }

    #[test]
    fn rollback_leaves_a_gap() {
        let native = Arc::new(NativeSequences::new(Arc::new(
            RedbStore::open_in_memory().unwrap(),
        )));
        native.create("ir_sequence_001", 1, 1).unwrap();
        let counter = GapAllowedCounter::new("ir_sequence_001".into(), 1, Arc::clone(&native));

        let mut tx = txn(1);
        assert_eq!(counter.next(&mut tx).unwrap(), 1);
        tx.rollback();

        let mut tx = txn(2);
        assert_eq!(counter.next(&mut tx).unwrap(), 2);
        assert_eq!(counter.peek().unwrap(), 3);

        counter.reset(&mut tx, 50).unwrap();
        tx.rollback();
        assert_eq!(counter.peek().unwrap(), 50);
    }

    #[test]
    fn peek_falls_back_to_stored_value() {
        let native = Arc::new(NativeSequences::new(Arc::new(
            RedbStore::open_in_memory().unwrap(),
        )));
        let counter = GapAllowedCounter::new("ir_sequence_009".into(), 42, native);
        assert_eq!(counter.peek().unwrap(), 42);
        assert!(matches!(counter.next(&mut txn(1)), Err(ServiceError::NotFound(_))));
    }
}
