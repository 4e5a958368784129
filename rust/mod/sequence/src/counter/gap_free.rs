use std::sync::Arc;

use openerp_core::ServiceError;
use openerp_sql::{SQLStore, Value};

use super::Counter;
use crate::txn::{RowKey, Transaction};

/// Counter backed by the `number_next` column of a locked row.
///
/// `next` takes the row lock for the rest of the transaction and stages the
/// advanced value on it, so numbers are only consumed when the transaction
/// commits.
pub struct GapFreeCounter {
    row: RowKey,
    increment: i64,
    sql: Arc<dyn SQLStore>,
}

impl GapFreeCounter {
    pub fn new(row: RowKey, increment: i64, sql: Arc<dyn SQLStore>) -> Self {
        Self {
            row,
            increment,
            sql,
        }
    }

    fn stored(&self) -> Result<i64, ServiceError> {
        let rows = self
            .sql
            .query(
                &format!("SELECT number_next FROM {} WHERE id = ?1", self.row.table()),
                &[Value::Integer(self.row.id())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        rows.first()
            .and_then(|r| r.get_i64("number_next"))
            .ok_or_else(|| ServiceError::NotFound(format!("{} not found", self.row)))
    }
}

impl Counter for GapFreeCounter {
    fn next(&self, txn: &mut Transaction) -> Result<i64, ServiceError> {
        txn.lock_row(self.row)?;
        let current = match txn.staged(self.row) {
            Some(value) => value,
            None => self.stored()?,
        };
        let advanced = current.checked_add(self.increment).ok_or_else(|| {
            ServiceError::Validation(format!("counter of {} reached its limit", self.row))
        })?;
        txn.stage(self.row, advanced)?;
        Ok(current)
    }

    fn reset(&self, txn: &mut Transaction, value: i64) -> Result<(), ServiceError> {
        txn.lock_row(self.row)?;
        txn.stage(self.row, value)
    }

    fn peek(&self) -> Result<i64, ServiceError> {
        self.stored()
    }
}
