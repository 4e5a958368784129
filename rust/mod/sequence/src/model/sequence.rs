use serde::{Deserialize, Serialize};

/// How a sequence's counter is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Implementation {
    /// Native counter: non-blocking, numbers consumed by a rolled-back
    /// transaction are lost.
    #[default]
    Standard,
    /// Locked row counter: no gaps, concurrent draws on the same row wait.
    NoGap,
}

impl Implementation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Implementation::Standard => "standard",
            Implementation::NoGap => "no_gap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Implementation::Standard),
            "no_gap" => Some(Implementation::NoGap),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> i64 {
    1
}

/// Sequence: a named source of document numbers (`INV/2024/0001`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    #[serde(default)]
    pub id: i64,

    pub name: String,

    /// Business code used by `next_by_code` (e.g. "account.invoice").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default)]
    pub implementation: Implementation,

    #[serde(default = "default_true")]
    pub active: bool,

    /// Prefix template, e.g. `INV/%(year)s/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,

    /// Configured next number. For `no_gap` this is the live counter;
    /// for `standard` the native counter is authoritative.
    #[serde(default = "default_one")]
    pub number_next: i64,

    /// The number the next draw will produce. Computed, never stored.
    #[serde(default)]
    pub number_next_actual: i64,

    #[serde(default = "default_one")]
    pub number_increment: i64,

    /// Minimum digit count; the counter is left-padded with zeros.
    #[serde(default)]
    pub padding: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<i64>,

    /// Draw from per-period subsequences instead of the sequence itself.
    #[serde(default)]
    pub use_date_range: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_at: Option<String>,
}

/// Input for creating a sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewSequence {
    pub name: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub implementation: Implementation,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub suffix: Option<String>,

    #[serde(default = "default_one")]
    pub number_next: i64,

    #[serde(default = "default_one")]
    pub number_increment: i64,

    #[serde(default)]
    pub padding: u32,

    #[serde(default)]
    pub company_id: Option<i64>,

    #[serde(default)]
    pub use_date_range: bool,
}

impl NewSequence {
    /// A `standard` sequence starting at 1 with step 1 and no templates.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: None,
            implementation: Implementation::Standard,
            active: true,
            prefix: None,
            suffix: None,
            number_next: 1,
            number_increment: 1,
            padding: 0,
            company_id: None,
            use_date_range: false,
        }
    }
}
