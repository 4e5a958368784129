use chrono::{Datelike, Days, NaiveDate};
use openerp_core::{Caller, ServiceError};
use openerp_sql::{Row, Statement, Value};
use tracing::info;

use super::{PERM_READ, PERM_WRITE, SequenceService, sql_error};
use crate::counter::native_range_name;
use crate::model::{DateRange, Implementation, NewDateRange, Sequence};
use crate::txn::RowKey;

const COLUMNS: &str = "id, sequence_id, date_from, date_to, number_next";

fn parse_date(row: &Row, col: &str) -> Result<NaiveDate, ServiceError> {
    let text = row
        .get_str(col)
        .ok_or_else(|| ServiceError::Internal(format!("ir_sequence_date_range: missing column {col}")))?;
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| ServiceError::Internal(format!("ir_sequence_date_range.{col} '{text}': {e}")))
}

pub(crate) fn row_to_range(row: &Row) -> Result<DateRange, ServiceError> {
    let missing =
        |col: &str| ServiceError::Internal(format!("ir_sequence_date_range: missing column {col}"));
    let number_next = row.get_i64("number_next").ok_or_else(|| missing("number_next"))?;
    Ok(DateRange {
        id: row.get_i64("id").ok_or_else(|| missing("id"))?,
        sequence_id: row.get_i64("sequence_id").ok_or_else(|| missing("sequence_id"))?,
        date_from: parse_date(row, "date_from")?,
        date_to: parse_date(row, "date_to")?,
        number_next,
        number_next_actual: number_next,
    })
}

fn date_value(date: NaiveDate) -> Value {
    Value::Text(date.format("%Y-%m-%d").to_string())
}

fn check_bounds(date_from: NaiveDate, date_to: NaiveDate) -> Result<(), ServiceError> {
    if date_from > date_to {
        return Err(ServiceError::Validation(format!(
            "date range starts after it ends ({date_from} > {date_to})"
        )));
    }
    Ok(())
}

impl SequenceService {
    pub fn list_date_ranges(
        &self,
        caller: &Caller,
        sequence_id: i64,
    ) -> Result<Vec<DateRange>, ServiceError> {
        self.check(caller, PERM_READ)?;
        let seq = self.stored_sequence(sequence_id)?;
        self.stored_ranges(sequence_id)?
            .into_iter()
            .map(|mut range| {
                range.number_next_actual = self.range_counter(&seq, &range).peek()?;
                Ok(range)
            })
            .collect()
    }

    /// Create a date range by hand. It must not overlap its siblings.
    pub fn create_date_range(
        &self,
        caller: &Caller,
        sequence_id: i64,
        input: NewDateRange,
    ) -> Result<DateRange, ServiceError> {
        self.check(caller, PERM_WRITE)?;
        check_bounds(input.date_from, input.date_to)?;
        let seq = self.stored_sequence(sequence_id)?;

        let _guard = self
            .range_guard
            .lock()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.check_overlap(sequence_id, input.date_from, input.date_to, None)?;

        let rows = self
            .sql
            .query(
                &format!(
                    "INSERT INTO ir_sequence_date_range (sequence_id, date_from, date_to, number_next) \
                     VALUES (?1, ?2, ?3, ?4) RETURNING {COLUMNS}"
                ),
                &[
                    Value::Integer(sequence_id),
                    date_value(input.date_from),
                    date_value(input.date_to),
                    Value::Integer(input.number_next),
                ],
            )
            .map_err(sql_error)?;
        let mut range = rows
            .first()
            .map(row_to_range)
            .ok_or_else(|| ServiceError::Internal("insert returned no row".into()))??;

        if seq.implementation == Implementation::Standard {
            self.native.ensure(
                &native_range_name(sequence_id, range.id),
                seq.number_increment,
                range.number_next,
            )?;
        }
        range.number_next_actual = self.range_counter(&seq, &range).peek()?;
        info!(
            "user {} created date range {} [{}, {}] of sequence {sequence_id}",
            caller.user, range.id, range.date_from, range.date_to
        );
        Ok(range)
    }

    /// Merge-patch a date range's bounds and `numberNext`.
    pub fn update_date_range(
        &self,
        caller: &Caller,
        range_id: i64,
        patch: serde_json::Value,
    ) -> Result<DateRange, ServiceError> {
        self.check(caller, PERM_WRITE)?;
        let restart = ["numberNext", "numberNextActual"]
            .iter()
            .any(|k| patch.get(*k).is_some_and(|v| !v.is_null()));

        let mut txn = self.begin(caller.clone());
        txn.lock_row(RowKey::DateRange(range_id))?;
        let current = self.stored_range(range_id)?;
        let seq = self.stored_sequence(current.sequence_id)?;
        let updated: DateRange = Self::apply_patch(&current, patch)?;
        check_bounds(updated.date_from, updated.date_to)?;

        {
            let _guard = self
                .range_guard
                .lock()
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            self.check_overlap(seq.id, updated.date_from, updated.date_to, Some(range_id))?;
            self.sql
                .exec(
                    "UPDATE ir_sequence_date_range SET date_from = ?1, date_to = ?2, number_next = ?3 \
                     WHERE id = ?4",
                    &[
                        date_value(updated.date_from),
                        date_value(updated.date_to),
                        Value::Integer(updated.number_next),
                        Value::Integer(range_id),
                    ],
                )
                .map_err(sql_error)?;
        }

        if restart {
            self.range_counter(&seq, &updated)
                .reset(&mut txn, updated.number_next)?;
        }
        txn.commit()?;

        info!("user {} updated date range {range_id} of sequence {}", caller.user, seq.id);
        let mut range = self.stored_range(range_id)?;
        range.number_next_actual = self.range_counter(&seq, &range).peek()?;
        Ok(range)
    }

    pub fn delete_date_range(&self, caller: &Caller, range_id: i64) -> Result<(), ServiceError> {
        self.check(caller, PERM_WRITE)?;
        let mut txn = self.begin(caller.clone());
        txn.lock_row(RowKey::DateRange(range_id))?;
        let range = self.stored_range(range_id)?;
        let seq = self.stored_sequence(range.sequence_id)?;

        let dropped = self
            .native
            .drop_all(&[native_range_name(range.sequence_id, range_id)])?;
        let deleted = self.sql.exec_batch(&[Statement::new(
            "DELETE FROM ir_sequence_date_range WHERE id = ?1",
            vec![Value::Integer(range_id)],
        )]);
        if let Err(e) = deleted {
            self.restore_counters(&dropped, seq.number_increment);
            return Err(sql_error(e));
        }
        txn.commit()?;

        info!(
            "user {} deleted date range {range_id} of sequence {}",
            caller.user, range.sequence_id
        );
        Ok(())
    }

    pub(crate) fn stored_range(&self, range_id: i64) -> Result<DateRange, ServiceError> {
        let rows = self
            .sql
            .query(
                &format!("SELECT {COLUMNS} FROM ir_sequence_date_range WHERE id = ?1"),
                &[Value::Integer(range_id)],
            )
            .map_err(sql_error)?;
        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("date range {range_id} not found")))?;
        row_to_range(row)
    }

    /// The date range of `sequence_id` containing `date`, if any.
    pub(crate) fn find_date_range(
        &self,
        sequence_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DateRange>, ServiceError> {
        let rows = self
            .sql
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM ir_sequence_date_range \
                     WHERE sequence_id = ?1 AND date_from <= ?2 AND date_to >= ?2 \
                     ORDER BY date_from DESC LIMIT 1"
                ),
                &[Value::Integer(sequence_id), date_value(date)],
            )
            .map_err(sql_error)?;
        rows.first().map(row_to_range).transpose()
    }

    /// Find the date range containing `date`, creating it when missing.
    ///
    /// A new range spans the calendar year of `date`, shortened so it ends
    /// the day before the nearest later sibling starts and starts the day
    /// after the nearest earlier sibling ends. Creation commits at once and
    /// survives a rollback of the drawing transaction.
    pub(crate) fn resolve_date_range(
        &self,
        seq: &Sequence,
        date: NaiveDate,
    ) -> Result<DateRange, ServiceError> {
        // A range found without the guard may still be waiting for its
        // native counter; its creator holds the guard until it exists.
        if let Some(range) = self.find_date_range(seq.id, date)? {
            if seq.implementation == Implementation::NoGap
                || self.native.exists(&native_range_name(seq.id, range.id))?
            {
                return Ok(range);
            }
        }

        let _guard = self
            .range_guard
            .lock()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        if let Some(range) = self.find_date_range(seq.id, date)? {
            return Ok(range);
        }

        let (date_from, date_to) = self.free_bounds(seq.id, date)?;
        let inserted = self
            .sql
            .query(
                &format!(
                    "INSERT INTO ir_sequence_date_range (sequence_id, date_from, date_to, number_next) \
                     VALUES (?1, ?2, ?3, 1) ON CONFLICT(sequence_id, date_from) DO NOTHING \
                     RETURNING {COLUMNS}"
                ),
                &[Value::Integer(seq.id), date_value(date_from), date_value(date_to)],
            )
            .map_err(sql_error)?;

        let range = match inserted.first() {
            Some(row) => {
                let range = row_to_range(row)?;
                info!(
                    "created date range {} [{}, {}] of sequence {}",
                    range.id, range.date_from, range.date_to, seq.id
                );
                range
            }
            // Another writer of the same database got there first.
            None => self.find_date_range(seq.id, date)?.ok_or_else(|| {
                ServiceError::Conflict(format!(
                    "date range of sequence {} starting {date_from} exists but does not cover {date}",
                    seq.id
                ))
            })?,
        };

        if seq.implementation == Implementation::Standard {
            self.native.ensure(
                &native_range_name(seq.id, range.id),
                seq.number_increment,
                range.number_next,
            )?;
        }
        Ok(range)
    }

    /// Default bounds for a new range around `date`.
    fn free_bounds(
        &self,
        sequence_id: i64,
        date: NaiveDate,
    ) -> Result<(NaiveDate, NaiveDate), ServiceError> {
        let year = date.year();
        let internal = || ServiceError::Internal(format!("no calendar year around {date}"));
        let mut date_from = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(internal)?;
        let mut date_to = NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(internal)?;

        let later = self
            .sql
            .query(
                "SELECT date_from FROM ir_sequence_date_range \
                 WHERE sequence_id = ?1 AND date_from > ?2 AND date_from <= ?3 \
                 ORDER BY date_from ASC LIMIT 1",
                &[Value::Integer(sequence_id), date_value(date), date_value(date_to)],
            )
            .map_err(sql_error)?;
        if let Some(row) = later.first() {
            date_to = parse_date(row, "date_from")?
                .checked_sub_days(Days::new(1))
                .ok_or_else(internal)?;
        }

        let earlier = self
            .sql
            .query(
                "SELECT date_to FROM ir_sequence_date_range \
                 WHERE sequence_id = ?1 AND date_to < ?2 AND date_to >= ?3 \
                 ORDER BY date_to DESC LIMIT 1",
                &[Value::Integer(sequence_id), date_value(date), date_value(date_from)],
            )
            .map_err(sql_error)?;
        if let Some(row) = earlier.first() {
            date_from = parse_date(row, "date_to")?
                .checked_add_days(Days::new(1))
                .ok_or_else(internal)?;
        }

        Ok((date_from, date_to))
    }

    fn check_overlap(
        &self,
        sequence_id: i64,
        date_from: NaiveDate,
        date_to: NaiveDate,
        exclude: Option<i64>,
    ) -> Result<(), ServiceError> {
        let rows = self
            .sql
            .query(
                "SELECT id, date_from, date_to FROM ir_sequence_date_range \
                 WHERE sequence_id = ?1 AND date_from <= ?3 AND date_to >= ?2 AND id != ?4 LIMIT 1",
                &[
                    Value::Integer(sequence_id),
                    date_value(date_from),
                    date_value(date_to),
                    Value::Integer(exclude.unwrap_or(0)),
                ],
            )
            .map_err(sql_error)?;
        match rows.first() {
            Some(row) => Err(ServiceError::Validation(format!(
                "[{date_from}, {date_to}] overlaps date range [{}, {}]",
                row.get_str("date_from").unwrap_or_default(),
                row.get_str("date_to").unwrap_or_default()
            ))),
            None => Ok(()),
        }
    }
}
