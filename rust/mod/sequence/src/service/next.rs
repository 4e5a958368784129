use chrono::{NaiveDate, NaiveTime, Utc};
use openerp_core::ServiceError;
use tracing::debug;

use super::{PERM_READ, SequenceService};
use crate::cache::CodeEntry;
use crate::interpolate::{InterpolationDates, interpolate};
use crate::model::{DateRange, Implementation, Sequence};
use crate::txn::{RowKey, Transaction};

impl SequenceService {
    /// Draw the next formatted value of sequence `id`.
    ///
    /// `date` is the logical date of the document; today (UTC) when absent.
    pub fn next_by_id(
        &self,
        txn: &mut Transaction,
        id: i64,
        date: Option<NaiveDate>,
    ) -> Result<String, ServiceError> {
        self.check(txn.caller(), PERM_READ)?;
        self.draw(txn, id, date)
    }

    /// Draw from the active sequence carrying `code`.
    ///
    /// A sequence of the caller's company is preferred over one without a
    /// company. Returns `None` when no sequence matches.
    pub fn next_by_code(
        &self,
        txn: &mut Transaction,
        code: &str,
        date: Option<NaiveDate>,
    ) -> Result<Option<String>, ServiceError> {
        self.check(txn.caller(), PERM_READ)?;

        let candidates = match self.cache.get(code) {
            Some(hit) => hit,
            None => {
                debug!("code cache miss for '{code}'");
                let seen = self.cache.generation();
                let entries = self
                    .sequences_with_code(code)?
                    .into_iter()
                    .map(|(id, company_id)| CodeEntry { id, company_id })
                    .collect();
                self.cache.insert(code, entries, seen)
            }
        };

        let company = txn.caller().company_id;
        let chosen = candidates
            .iter()
            .filter(|c| company.is_some() && c.company_id == company)
            .chain(candidates.iter().filter(|c| c.company_id.is_none()))
            .next()
            .copied();

        let Some(entry) = chosen else {
            debug!(
                "no sequence with code '{code}' for company {company:?} (user {})",
                txn.caller().user
            );
            return Ok(None);
        };

        self.draw(txn, entry.id, date).map(Some)
    }

    /// The configuration a draw from sequence `id` on `day` uses.
    ///
    /// A gap-free draw locks its counter row first and reads again, so the
    /// increment and the row it counts on are those of the last committed
    /// change. Configuration writers take the same lock.
    fn draw_target(
        &self,
        txn: &mut Transaction,
        id: i64,
        day: NaiveDate,
    ) -> Result<(Sequence, Option<DateRange>), ServiceError> {
        loop {
            let seq = self.stored_sequence(id)?;
            let range = if seq.use_date_range {
                Some(self.resolve_date_range(&seq, day)?)
            } else {
                None
            };
            if seq.implementation == Implementation::Standard {
                return Ok((seq, range));
            }
            let row = range
                .as_ref()
                .map_or(RowKey::Sequence(id), |r| RowKey::DateRange(r.id));
            if txn.holds(row) {
                return Ok((seq, range));
            }
            txn.lock_row(row)?;
        }
    }

    fn draw(
        &self,
        txn: &mut Transaction,
        id: i64,
        date: Option<NaiveDate>,
    ) -> Result<String, ServiceError> {
        let now = Utc::now().naive_utc();
        let effective = date.map(|d| d.and_time(NaiveTime::MIN)).unwrap_or(now);
        let mut dates = InterpolationDates {
            effective,
            range: effective,
            now,
        };

        let (seq, range) = self.draw_target(txn, id, effective.date())?;
        let counter = match &range {
            Some(range) => {
                dates.range = range.date_from.and_time(NaiveTime::MIN);
                self.range_counter(&seq, range)
            }
            None => self.sequence_counter(&seq),
        };

        // Templates are rendered before drawing so a broken one costs no number.
        let render = |template: &Option<String>| {
            template
                .as_deref()
                .map(|t| interpolate(t, &dates))
                .transpose()
                .map(Option::unwrap_or_default)
                .map_err(|e| {
                    ServiceError::Validation(format!(
                        "Invalid prefix or suffix for sequence '{}': {e}",
                        seq.name
                    ))
                })
        };
        let prefix = render(&seq.prefix)?;
        let suffix = render(&seq.suffix)?;

        let number = counter.next(txn)?;
        Ok(format!(
            "{prefix}{number:0width$}{suffix}",
            width = seq.padding as usize
        ))
    }
}
