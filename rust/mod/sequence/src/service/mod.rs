pub mod date_range;
pub mod next;
pub mod schema;
pub mod sequence;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use openerp_core::{Authenticator, Caller, ServiceError, merge_patch, now_rfc3339};
use openerp_kv::KVStore;
use openerp_sql::{SQLError, SQLStore};

use crate::cache::CodeCache;
use crate::counter::{
    Counter, GapAllowedCounter, GapFreeCounter, NativeSequences, native_name, native_range_name,
};
use crate::model::{DateRange, Implementation, Sequence};
use crate::txn::{RowKey, RowLocks, Transaction};

pub use self::sequence::SequenceFilters;

/// Permission to read sequence configuration and draw numbers.
pub const PERM_READ: &str = "base:sequence:read";
/// Permission to change sequence configuration.
pub const PERM_WRITE: &str = "base:sequence:write";

/// Tunables of a [`SequenceService`].
#[derive(Debug, Clone)]
pub struct SequenceSettings {
    /// How long a gap-free draw waits for a row held by another transaction
    /// before failing with `Busy`. Zero fails immediately.
    pub lock_wait: Duration,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_millis(5000),
        }
    }
}

/// Sequence service: configuration, counters and draws.
pub struct SequenceService {
    pub(crate) sql: Arc<dyn SQLStore>,
    pub(crate) native: Arc<NativeSequences>,
    pub(crate) locks: Arc<RowLocks>,
    pub(crate) auth: Arc<dyn Authenticator>,
    pub(crate) cache: CodeCache,
    /// Serializes lazy date-range creation.
    pub(crate) range_guard: Mutex<()>,
    next_txn: AtomicU64,
    settings: SequenceSettings,
}

impl SequenceService {
    pub fn new(
        sql: Arc<dyn SQLStore>,
        kv: Arc<dyn KVStore>,
        auth: Arc<dyn Authenticator>,
        settings: SequenceSettings,
    ) -> Result<Self, ServiceError> {
        schema::init_schema(sql.as_ref())?;
        Ok(Self {
            sql,
            native: Arc::new(NativeSequences::new(kv)),
            locks: Arc::new(RowLocks::new()),
            auth,
            cache: CodeCache::new(),
            range_guard: Mutex::new(()),
            next_txn: AtomicU64::new(1),
            settings,
        })
    }

    pub fn settings(&self) -> &SequenceSettings {
        &self.settings
    }

    /// The native counter registry, e.g. to register dependents.
    pub fn native_counters(&self) -> &NativeSequences {
        &self.native
    }

    /// Start a unit of work on behalf of `caller`.
    pub fn begin(&self, caller: Caller) -> Transaction {
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        Transaction::new(
            id,
            caller,
            Arc::clone(&self.sql),
            Arc::clone(&self.locks),
            self.settings.lock_wait,
        )
    }

    /// Run `f` in a fresh transaction: commit on `Ok`, roll back on `Err`.
    pub fn with_transaction<T>(
        &self,
        caller: Caller,
        f: impl FnOnce(&mut Transaction) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let mut txn = self.begin(caller);
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    pub(crate) fn check(&self, caller: &Caller, permission: &str) -> Result<(), ServiceError> {
        self.auth.check(caller, permission)
    }

    pub(crate) fn sequence_counter(&self, seq: &Sequence) -> Box<dyn Counter> {
        match seq.implementation {
            Implementation::Standard => Box::new(GapAllowedCounter::new(
                native_name(seq.id),
                seq.number_next,
                Arc::clone(&self.native),
            )),
            Implementation::NoGap => Box::new(GapFreeCounter::new(
                RowKey::Sequence(seq.id),
                seq.number_increment,
                Arc::clone(&self.sql),
            )),
        }
    }

    /// A date range counts with its parent's implementation and increment.
    pub(crate) fn range_counter(&self, seq: &Sequence, range: &DateRange) -> Box<dyn Counter> {
        match seq.implementation {
            Implementation::Standard => Box::new(GapAllowedCounter::new(
                native_range_name(seq.id, range.id),
                range.number_next,
                Arc::clone(&self.native),
            )),
            Implementation::NoGap => Box::new(GapFreeCounter::new(
                RowKey::DateRange(range.id),
                seq.number_increment,
                Arc::clone(&self.sql),
            )),
        }
    }

    /// Apply a JSON merge-patch to a record.
    ///
    /// `id` and `createAt` are immutable. A `numberNextActual` entry is an
    /// inverse write: it sets `numberNext` unless the patch sets that too.
    pub(crate) fn apply_patch<T: Serialize + DeserializeOwned>(
        current: &T,
        patch: serde_json::Value,
    ) -> Result<T, ServiceError> {
        let mut json =
            serde_json::to_value(current).map_err(|e| ServiceError::Internal(e.to_string()))?;
        let now = now_rfc3339();

        let mut patch_filtered = patch;
        if let Some(obj) = patch_filtered.as_object_mut() {
            obj.remove("id");
            obj.remove("createAt");
            obj.remove("sequenceId");
            if let Some(actual) = obj.remove("numberNextActual") {
                if !actual.is_null() && !obj.contains_key("numberNext") {
                    obj.insert("numberNext".into(), actual);
                }
            }
            if json.get("updateAt").is_some() || json.get("createAt").is_some() {
                obj.insert("updateAt".into(), serde_json::json!(now));
            }
        }

        merge_patch(&mut json, &patch_filtered);
        serde_json::from_value(json).map_err(|e| ServiceError::Validation(e.to_string()))
    }
}

/// Map a SQL failure, reporting constraint violations as conflicts.
pub(crate) fn sql_error(e: SQLError) -> ServiceError {
    if e.is_constraint() {
        ServiceError::Conflict(e.to_string())
    } else {
        ServiceError::Storage(e.to_string())
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::{admin, service};
    use super::*;
    use crate::model::NewSequence;

    #[test]
    fn with_transaction_rolls_back_on_error() {
        let svc = service();
        let mut input = NewSequence::new("Moves");
        input.implementation = Implementation::NoGap;
        let seq = svc.create_sequence(&admin(), input).unwrap();

        let result: Result<(), ServiceError> = svc.with_transaction(admin(), |txn| {
            svc.next_by_id(txn, seq.id, None)?;
            Err(ServiceError::Validation("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(svc.get_sequence(&admin(), seq.id).unwrap().number_next_actual, 1);

        let value = svc
            .with_transaction(admin(), |txn| svc.next_by_id(txn, seq.id, None))
            .unwrap();
        assert_eq!(value, "1");
        assert_eq!(svc.get_sequence(&admin(), seq.id).unwrap().number_next_actual, 2);
    }

    #[test]
    fn patch_keeps_immutable_fields_and_maps_inverse_field() {
        let seq = Sequence {
            id: 3,
            name: "Invoices".into(),
            code: None,
            implementation: Implementation::Standard,
            active: true,
            prefix: None,
            suffix: None,
            number_next: 1,
            number_next_actual: 7,
            number_increment: 1,
            padding: 0,
            company_id: None,
            use_date_range: false,
            create_at: Some("2024-01-01T00:00:00+00:00".into()),
            update_at: None,
        };
        let patched: Sequence = SequenceService::apply_patch(
            &seq,
            json!({"id": 99, "createAt": "x", "numberNextActual": 40, "padding": 5}),
        )
        .unwrap();
        assert_eq!(patched.id, 3);
        assert_eq!(patched.create_at.as_deref(), Some("2024-01-01T00:00:00+00:00"));
        assert_eq!(patched.number_next, 40);
        assert_eq!(patched.padding, 5);
        assert!(patched.update_at.is_some());

        let rejected = SequenceService::apply_patch(&seq, json!({"implementation": "gapless"}));
        assert!(matches!(rejected, Err(ServiceError::Validation(_))));
    }

    #[test]
    fn transaction_ids_are_unique() {
        let svc = service();
        let a = svc.begin(admin());
        let b = svc.begin(admin());
        assert_ne!(a.id(), b.id());
    }
}
