//! Counters behind sequences and date ranges.
//!
//! [`Counter`] is the one seam between the draw logic and the two storage
//! strategies: [`GapAllowedCounter`] (native counter, non-transactional) and
//! [`GapFreeCounter`] (locked SQL row, transactional).

mod gap_allowed;
mod gap_free;
mod native;

pub use gap_allowed::GapAllowedCounter;
pub use gap_free::GapFreeCounter;
pub use native::{NativeSequences, NativeState};

use openerp_core::ServiceError;

use crate::txn::Transaction;

/// A source of raw sequence values.
pub trait Counter {
    /// Consume and return the next value.
    fn next(&self, txn: &mut Transaction) -> Result<i64, ServiceError>;

    /// Make `value` the next value to be drawn.
    fn reset(&self, txn: &mut Transaction, value: i64) -> Result<(), ServiceError>;

    /// The next value as committed, without consuming it.
    fn peek(&self) -> Result<i64, ServiceError>;
}

/// Native counter name of a sequence.
pub fn native_name(sequence_id: i64) -> String {
    format!("ir_sequence_{sequence_id:03}")
}

/// Native counter name of one of a sequence's date ranges.
pub fn native_range_name(sequence_id: i64, range_id: i64) -> String {
    format!("ir_sequence_{sequence_id:03}_{range_id:03}")
}
