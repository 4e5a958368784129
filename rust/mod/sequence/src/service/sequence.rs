use std::collections::HashMap;

use openerp_core::{Caller, ListParams, ListResult, ServiceError, now_rfc3339};
use openerp_sql::{Row, Statement, Value};
use tracing::{info, warn};

use super::{PERM_READ, PERM_WRITE, SequenceService, sql_error};
use crate::counter::{native_name, native_range_name};
use crate::model::{DateRange, Implementation, NewSequence, Sequence};
use crate::txn::{RowKey, Transaction};

const COLUMNS: &str = "id, name, code, implementation, active, prefix, suffix, number_next, \
     number_increment, padding, company_id, use_date_range, create_at, update_at";

/// Optional filters of [`SequenceService::list_sequences`].
#[derive(Debug, Clone, Default)]
pub struct SequenceFilters {
    pub code: Option<String>,
    pub company_id: Option<i64>,
    pub active: Option<bool>,
}

fn validate(name: &str, increment: i64) -> Result<(), ServiceError> {
    if name.trim().is_empty() {
        return Err(ServiceError::Validation("sequence name must not be empty".into()));
    }
    if increment == 0 {
        return Err(ServiceError::Validation("Step must not be zero.".into()));
    }
    Ok(())
}

fn row_to_sequence(row: &Row) -> Result<Sequence, ServiceError> {
    let missing = |col: &str| ServiceError::Internal(format!("ir_sequence: missing column {col}"));
    let implementation = row
        .get_str("implementation")
        .and_then(Implementation::parse)
        .ok_or_else(|| missing("implementation"))?;
    let number_next = row.get_i64("number_next").ok_or_else(|| missing("number_next"))?;

    Ok(Sequence {
        id: row.get_i64("id").ok_or_else(|| missing("id"))?,
        name: row.get_str("name").ok_or_else(|| missing("name"))?.to_string(),
        code: row.get_str("code").map(str::to_string),
        implementation,
        active: row.get_bool("active").unwrap_or(true),
        prefix: row.get_str("prefix").map(str::to_string),
        suffix: row.get_str("suffix").map(str::to_string),
        number_next,
        number_next_actual: number_next,
        number_increment: row
            .get_i64("number_increment")
            .ok_or_else(|| missing("number_increment"))?,
        padding: row.get_i64("padding").unwrap_or(0).max(0) as u32,
        company_id: row.get_i64("company_id"),
        use_date_range: row.get_bool("use_date_range").unwrap_or(false),
        create_at: row.get_str("create_at").map(str::to_string),
        update_at: row.get_str("update_at").map(str::to_string),
    })
}

impl SequenceService {
    pub fn create_sequence(
        &self,
        caller: &Caller,
        input: NewSequence,
    ) -> Result<Sequence, ServiceError> {
        self.check(caller, PERM_WRITE)?;
        validate(&input.name, input.number_increment)?;

        let now = now_rfc3339();
        let rows = self
            .sql
            .query(
                "INSERT INTO ir_sequence (name, code, implementation, active, prefix, suffix, \
                 number_next, number_increment, padding, company_id, use_date_range, create_at, update_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12) RETURNING id",
                &[
                    Value::Text(input.name.clone()),
                    Value::opt_text(input.code.as_deref()),
                    Value::Text(input.implementation.as_str().to_string()),
                    Value::Integer(input.active as i64),
                    Value::opt_text(input.prefix.as_deref()),
                    Value::opt_text(input.suffix.as_deref()),
                    Value::Integer(input.number_next),
                    Value::Integer(input.number_increment),
                    Value::Integer(input.padding as i64),
                    Value::opt_integer(input.company_id),
                    Value::Integer(input.use_date_range as i64),
                    Value::Text(now),
                ],
            )
            .map_err(sql_error)?;
        let id = rows
            .first()
            .and_then(|r| r.get_i64("id"))
            .ok_or_else(|| ServiceError::Internal("insert returned no id".into()))?;

        if input.implementation == Implementation::Standard {
            if let Err(e) =
                self.native
                    .create(&native_name(id), input.number_increment, input.number_next)
            {
                // Leave no row without its counter behind.
                let _ = self.sql.exec(
                    "DELETE FROM ir_sequence WHERE id = ?1",
                    &[Value::Integer(id)],
                );
                return Err(e);
            }
        }

        if let Some(code) = &input.code {
            self.cache.invalidate(code);
        }
        info!(
            "user {} created sequence {id} '{}' ({})",
            caller.user,
            input.name,
            input.implementation.as_str()
        );
        self.load_sequence(id)
    }

    pub fn get_sequence(&self, caller: &Caller, id: i64) -> Result<Sequence, ServiceError> {
        self.check(caller, PERM_READ)?;
        self.load_sequence(id)
    }

    pub fn list_sequences(
        &self,
        caller: &Caller,
        params: &ListParams,
        filters: &SequenceFilters,
    ) -> Result<ListResult<Sequence>, ServiceError> {
        self.check(caller, PERM_READ)?;

        let mut where_clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(code) = &filters.code {
            values.push(Value::Text(code.clone()));
            where_clauses.push(format!("code = ?{}", values.len()));
        }
        if let Some(company_id) = filters.company_id {
            values.push(Value::Integer(company_id));
            where_clauses.push(format!("company_id = ?{}", values.len()));
        }
        if let Some(active) = filters.active {
            values.push(Value::Integer(active as i64));
            where_clauses.push(format!("active = ?{}", values.len()));
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let count_rows = self
            .sql
            .query(&format!("SELECT COUNT(*) as cnt FROM ir_sequence{where_sql}"), &values)
            .map_err(sql_error)?;
        let total = count_rows
            .first()
            .and_then(|r| r.get_i64("cnt"))
            .unwrap_or(0) as usize;

        let limit_idx = values.len() + 1;
        let offset_idx = values.len() + 2;
        values.push(Value::Integer(params.limit.min(500) as i64));
        values.push(Value::Integer(params.offset as i64));
        let rows = self
            .sql
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM ir_sequence{where_sql} ORDER BY id LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
                ),
                &values,
            )
            .map_err(sql_error)?;

        let items = rows
            .iter()
            .map(|row| {
                let mut seq = row_to_sequence(row)?;
                seq.number_next_actual = self.sequence_counter(&seq).peek()?;
                Ok(seq)
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        Ok(ListResult { items, total })
    }

    /// Merge-patch a sequence.
    ///
    /// Holds the locks of the sequence row and all its date-range rows while
    /// counters are migrated, so no gap-free draw is in flight meanwhile.
    pub fn update_sequence(
        &self,
        caller: &Caller,
        id: i64,
        patch: serde_json::Value,
    ) -> Result<Sequence, ServiceError> {
        self.check(caller, PERM_WRITE)?;
        let restart = ["numberNext", "numberNextActual"]
            .iter()
            .any(|k| patch.get(*k).is_some_and(|v| !v.is_null()));

        let mut txn = self.begin(caller.clone());
        let (current, mut ranges) = self.lock_sequence(&mut txn, id)?;
        let mut updated: Sequence = Self::apply_patch(&current, patch)?;
        validate(&updated.name, updated.number_increment)?;

        let parent = native_name(id);
        let range_names: Vec<String> = ranges.iter().map(|r| native_range_name(id, r.id)).collect();
        let mut dropped = Vec::new();

        match (current.implementation, updated.implementation) {
            (Implementation::Standard, Implementation::Standard) => {
                if updated.number_increment != current.number_increment {
                    for name in std::iter::once(&parent).chain(&range_names) {
                        self.native.alter(name, Some(updated.number_increment), None)?;
                    }
                }
            }
            (Implementation::Standard, Implementation::NoGap) => {
                let mut names = range_names.clone();
                names.push(parent.clone());
                dropped = self.native.drop_all(&names)?;
                let carried: HashMap<&str, i64> =
                    dropped.iter().map(|(name, next)| (name.as_str(), *next)).collect();
                if !restart {
                    if let Some(next) = carried.get(parent.as_str()) {
                        updated.number_next = *next;
                    }
                }
                for (range, name) in ranges.iter_mut().zip(&range_names) {
                    if let Some(next) = carried.get(name.as_str()) {
                        range.number_next = *next;
                    }
                }
            }
            (Implementation::NoGap, Implementation::Standard) => {
                let inc = updated.number_increment;
                self.native.ensure(&parent, inc, updated.number_next)?;
                self.native.alter(&parent, Some(inc), Some(updated.number_next))?;
                for (range, name) in ranges.iter().zip(&range_names) {
                    self.native.ensure(name, inc, range.number_next)?;
                    self.native.alter(name, Some(inc), Some(range.number_next))?;
                }
            }
            (Implementation::NoGap, Implementation::NoGap) => {}
        }

        if restart {
            self.sequence_counter(&updated)
                .reset(&mut txn, updated.number_next)?;
        }

        let mut statements = vec![Statement::new(
            "UPDATE ir_sequence SET name = ?1, code = ?2, implementation = ?3, active = ?4, \
             prefix = ?5, suffix = ?6, number_next = ?7, number_increment = ?8, padding = ?9, \
             company_id = ?10, use_date_range = ?11, update_at = ?12 WHERE id = ?13",
            vec![
                Value::Text(updated.name.clone()),
                Value::opt_text(updated.code.as_deref()),
                Value::Text(updated.implementation.as_str().to_string()),
                Value::Integer(updated.active as i64),
                Value::opt_text(updated.prefix.as_deref()),
                Value::opt_text(updated.suffix.as_deref()),
                Value::Integer(updated.number_next),
                Value::Integer(updated.number_increment),
                Value::Integer(updated.padding as i64),
                Value::opt_integer(updated.company_id),
                Value::Integer(updated.use_date_range as i64),
                Value::opt_text(updated.update_at.as_deref()),
                Value::Integer(id),
            ],
        )];
        if current.implementation != updated.implementation {
            statements.extend(ranges.iter().map(|r| {
                Statement::new(
                    "UPDATE ir_sequence_date_range SET number_next = ?1 WHERE id = ?2",
                    vec![Value::Integer(r.number_next), Value::Integer(r.id)],
                )
            }));
        }
        if let Err(e) = self.sql.exec_batch(&statements) {
            self.restore_counters(&dropped, current.number_increment);
            return Err(sql_error(e));
        }
        txn.commit()?;

        for code in [&current.code, &updated.code].into_iter().flatten() {
            self.cache.invalidate(code);
        }
        info!("user {} updated sequence {id} '{}'", caller.user, updated.name);
        self.load_sequence(id)
    }

    /// Delete a sequence, its date ranges and every native counter they own.
    pub fn delete_sequence(&self, caller: &Caller, id: i64) -> Result<(), ServiceError> {
        self.check(caller, PERM_WRITE)?;

        let mut txn = self.begin(caller.clone());
        let (current, ranges) = self.lock_sequence(&mut txn, id)?;

        let mut names: Vec<String> = ranges.iter().map(|r| native_range_name(id, r.id)).collect();
        names.push(native_name(id));
        let dropped = self.native.drop_all(&names)?;

        let deleted = self.sql.exec_batch(&[
            Statement::new(
                "DELETE FROM ir_sequence_date_range WHERE sequence_id = ?1",
                vec![Value::Integer(id)],
            ),
            Statement::new("DELETE FROM ir_sequence WHERE id = ?1", vec![Value::Integer(id)]),
        ]);
        if let Err(e) = deleted {
            self.restore_counters(&dropped, current.number_increment);
            return Err(sql_error(e));
        }
        txn.commit()?;

        if let Some(code) = &current.code {
            self.cache.invalidate(code);
        }
        info!("user {} deleted sequence {id} '{}'", caller.user, current.name);
        Ok(())
    }

    /// Lock sequence `id` and all of its date ranges, then read them.
    ///
    /// Nothing is read before its lock is held, so a gap-free draw that
    /// commits meanwhile is never overwritten with a stale `number_next`.
    fn lock_sequence(
        &self,
        txn: &mut Transaction,
        id: i64,
    ) -> Result<(Sequence, Vec<DateRange>), ServiceError> {
        txn.lock_row(RowKey::Sequence(id))?;
        let seq = self.stored_sequence(id)?;
        let mut ranges = self.stored_ranges(id)?;
        // Ranges created while locking are picked up by the next pass.
        loop {
            let unlocked: Vec<RowKey> = ranges
                .iter()
                .map(|r| RowKey::DateRange(r.id))
                .filter(|row| !txn.holds(*row))
                .collect();
            if unlocked.is_empty() {
                return Ok((seq, ranges));
            }
            for row in unlocked {
                txn.lock_row(row)?;
            }
            ranges = self.stored_ranges(id)?;
        }
    }

    /// Recreate native counters dropped ahead of a SQL write that failed.
    pub(crate) fn restore_counters(&self, dropped: &[(String, i64)], increment: i64) {
        for (name, next) in dropped {
            if let Err(e) = self.native.create(name, increment, *next) {
                warn!("could not restore native counter {name} at {next}: {e}");
            }
        }
    }

    /// The stored row, `number_next_actual` left equal to `number_next`.
    pub(crate) fn stored_sequence(&self, id: i64) -> Result<Sequence, ServiceError> {
        let rows = self
            .sql
            .query(
                &format!("SELECT {COLUMNS} FROM ir_sequence WHERE id = ?1"),
                &[Value::Integer(id)],
            )
            .map_err(sql_error)?;
        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("sequence {id} not found")))?;
        row_to_sequence(row)
    }

    /// The stored row with its computed `number_next_actual`.
    pub(crate) fn load_sequence(&self, id: i64) -> Result<Sequence, ServiceError> {
        let mut seq = self.stored_sequence(id)?;
        seq.number_next_actual = self.sequence_counter(&seq).peek()?;
        Ok(seq)
    }

    /// Active sequences carrying `code`, ordered by name then id.
    pub(crate) fn sequences_with_code(&self, code: &str) -> Result<Vec<(i64, Option<i64>)>, ServiceError> {
        let rows = self
            .sql
            .query(
                "SELECT id, company_id FROM ir_sequence WHERE code = ?1 AND active = 1 ORDER BY name, id",
                &[Value::Text(code.to_string())],
            )
            .map_err(sql_error)?;
        rows.iter()
            .map(|r| {
                r.get_i64("id")
                    .map(|id| (id, r.get_i64("company_id")))
                    .ok_or_else(|| ServiceError::Internal("ir_sequence: missing column id".into()))
            })
            .collect()
    }

    pub(crate) fn stored_ranges(&self, sequence_id: i64) -> Result<Vec<DateRange>, ServiceError> {
        let rows = self
            .sql
            .query(
                "SELECT id, sequence_id, date_from, date_to, number_next FROM ir_sequence_date_range \
                 WHERE sequence_id = ?1 ORDER BY date_from",
                &[Value::Integer(sequence_id)],
            )
            .map_err(sql_error)?;
        rows.iter().map(super::date_range::row_to_range).collect()
    }
}
