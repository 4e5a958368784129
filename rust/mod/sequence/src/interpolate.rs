//! Prefix / suffix template interpolation.
//!
//! Templates embed `%(key)s` placeholders and `%%` for a literal percent:
//!
//! ```rust
//! use chrono::NaiveDate;
//! use sequence::interpolate::{interpolate, InterpolationDates};
//!
//! let at = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
//! let prefix = interpolate("INV/%(year)s/%(month)s/", &InterpolationDates::at(at)).unwrap();
//! assert_eq!(prefix, "INV/2024/03/");
//! ```
//!
//! Every key exists in three flavours: plain (`year`) reads the logical date
//! of the draw, `range_year` reads the start of the date range drawn from and
//! `current_year` reads the wall clock.

use chrono::NaiveDateTime;

/// Placeholder names and their strftime equivalents.
pub const KEYS: &[(&str, &str)] = &[
    ("year", "%Y"),
    ("month", "%m"),
    ("day", "%d"),
    ("y", "%y"),
    ("doy", "%j"),
    ("woy", "%W"),
    ("weekday", "%w"),
    ("h24", "%H"),
    ("h12", "%I"),
    ("min", "%M"),
    ("sec", "%S"),
];

/// The three instants a template can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpolationDates {
    /// Logical date of the draw (plain keys).
    pub effective: NaiveDateTime,
    /// Start of the date range being drawn from (`range_*` keys).
    pub range: NaiveDateTime,
    /// Wall-clock time of the draw (`current_*` keys).
    pub now: NaiveDateTime,
}

impl InterpolationDates {
    /// All three flavours at the same instant.
    pub fn at(instant: NaiveDateTime) -> Self {
        Self {
            effective: instant,
            range: instant,
            now: instant,
        }
    }

    fn resolve(&self, key: &str) -> Option<String> {
        let (instant, base) = if let Some(base) = key.strip_prefix("range_") {
            (self.range, base)
        } else if let Some(base) = key.strip_prefix("current_") {
            (self.now, base)
        } else {
            (self.effective, key)
        };
        KEYS.iter()
            .find(|(name, _)| *name == base)
            .map(|(_, fmt)| instant.format(fmt).to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown placeholder '{0}'")]
    UnknownKey(String),

    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("unsupported conversion '%{0}' at byte {1}")]
    BadConversion(char, usize),
}

/// Expand `template` against `dates`.
pub fn interpolate(template: &str, dates: &InterpolationDates) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, '%')) => out.push('%'),
            Some((open, '(')) => {
                let start = open + 1;
                let close = template[start..]
                    .find(')')
                    .map(|i| start + i)
                    .ok_or(TemplateError::Unterminated(pos))?;
                let key = &template[start..close];

                while chars.next_if(|&(i, _)| i <= close).is_some() {}

                match chars.next() {
                    Some((_, 's')) => {}
                    Some((i, other)) => return Err(TemplateError::BadConversion(other, i)),
                    None => return Err(TemplateError::Unterminated(pos)),
                }

                let value = dates
                    .resolve(key)
                    .ok_or_else(|| TemplateError::UnknownKey(key.to_string()))?;
                out.push_str(&value);
            }
            Some((i, other)) => return Err(TemplateError::BadConversion(other, i)),
            None => return Err(TemplateError::Unterminated(pos)),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn instant(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn every_key_renders() {
        // Tuesday, 65th day of a leap year, ISO-ish week 10 (Monday based).
        let dates = InterpolationDates::at(instant(2024, 3, 5, 14, 7, 9));
        let cases = [
            ("year", "2024"),
            ("month", "03"),
            ("day", "05"),
            ("y", "24"),
            ("doy", "065"),
            ("woy", "10"),
            ("weekday", "2"),
            ("h24", "14"),
            ("h12", "02"),
            ("min", "07"),
            ("sec", "09"),
        ];
        for (key, want) in cases {
            let got = interpolate(&format!("%({key})s"), &dates).unwrap();
            assert_eq!(got, want, "key {key}");
        }
    }

    #[test]
    fn flavours_read_their_own_instant() {
        let dates = InterpolationDates {
            effective: instant(2024, 12, 31, 0, 0, 0),
            range: instant(2024, 4, 1, 0, 0, 0),
            now: instant(2026, 1, 2, 9, 0, 0),
        };
        let got = interpolate("%(year)s|%(range_month)s|%(current_year)s", &dates).unwrap();
        assert_eq!(got, "2024|04|2026");
    }

    #[test]
    fn literal_text_and_escaped_percent() {
        let dates = InterpolationDates::at(instant(2024, 1, 1, 0, 0, 0));
        assert_eq!(interpolate("100%% SO-", &dates).unwrap(), "100% SO-");
        assert_eq!(interpolate("", &dates).unwrap(), "");
        assert_eq!(interpolate("Ω/%(y)s", &dates).unwrap(), "Ω/24");
    }

    #[test]
    fn malformed_templates_are_rejected() {
        let dates = InterpolationDates::at(instant(2024, 1, 1, 0, 0, 0));
        assert_eq!(
            interpolate("%(fiscal)s", &dates),
            Err(TemplateError::UnknownKey("fiscal".into()))
        );
        assert_eq!(interpolate("INV/%(year", &dates), Err(TemplateError::Unterminated(4)));
        assert_eq!(interpolate("%(year)", &dates), Err(TemplateError::Unterminated(0)));
        assert_eq!(
            interpolate("%(year)d", &dates),
            Err(TemplateError::BadConversion('d', 7))
        );
        assert_eq!(interpolate("50%", &dates), Err(TemplateError::Unterminated(2)));
        assert_eq!(interpolate("%Y", &dates), Err(TemplateError::BadConversion('Y', 1)));
    }
}
