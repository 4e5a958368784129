use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

fn default_one() -> i64 {
    1
}

/// DateRange: a per-period subsequence with its own counter.
///
/// Bounds are inclusive. Ranges of one sequence never overlap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    #[serde(default)]
    pub id: i64,

    pub sequence_id: i64,

    pub date_from: NaiveDate,

    pub date_to: NaiveDate,

    #[serde(default = "default_one")]
    pub number_next: i64,

    /// The number the next draw in this range will produce. Computed.
    #[serde(default)]
    pub number_next_actual: i64,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.date_from <= date && date <= self.date_to
    }
}

/// Input for creating a date range by hand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewDateRange {
    pub date_from: NaiveDate,

    pub date_to: NaiveDate,

    #[serde(default = "default_one")]
    pub number_next: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_inclusive() {
        let range = DateRange {
            id: 1,
            sequence_id: 1,
            date_from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            number_next: 1,
            number_next_actual: 1,
        };
        assert!(range.contains(range.date_from));
        assert!(range.contains(range.date_to));
        assert!(!range.contains(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()));
    }

    #[test]
    fn dates_use_iso_format() {
        let input: NewDateRange =
            serde_json::from_str(r#"{"dateFrom": "2024-04-01", "dateTo": "2025-03-31"}"#).unwrap();
        assert_eq!(input.number_next, 1);
        assert_eq!(input.date_to, NaiveDate::from_ymd_opt(2025, 3, 31).unwrap());
    }
}
