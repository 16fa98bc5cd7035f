//! Core records shared by case memory, the outcome tracker and the pipeline.

use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Stable id linking a decision, its embedding and its feedback.
pub fn correlation_id(subject_id: &str, as_of: NaiveDate) -> String {
    format!("{}@{}", subject_id, as_of.format("%Y-%m-%d"))
}

/// A finalized decision for one subject-period pair. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub correlation_id: String,
    pub subject_id: String,
    pub as_of: NaiveDate,
    /// true = include / buy, false = reject / hold
    pub verdict: bool,
    pub rationale_text: String,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(subject_id: &str, as_of: NaiveDate, verdict: bool, rationale_text: String) -> Self {
        Self {
            correlation_id: correlation_id(subject_id, as_of),
            subject_id: subject_id.to_string(),
            as_of,
            verdict,
            rationale_text,
            created_at: Utc::now(),
        }
    }
}

/// Vector for a decision, 1:1 with [`Decision`].
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub correlation_id: String,
    pub vector: Vec<f32>,
}

/// A forward window over which a realized return is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Horizon {
    Days(u32),
    Weeks(u32),
    Months(u32),
}

impl Horizon {
    pub const ONE_WEEK: Horizon = Horizon::Weeks(1);
    pub const ONE_MONTH: Horizon = Horizon::Months(1);
    pub const THREE_MONTHS: Horizon = Horizon::Months(3);
    pub const SIX_MONTHS: Horizon = Horizon::Months(6);

    pub fn defaults() -> Vec<Horizon> {
        vec![
            Self::ONE_WEEK,
            Self::ONE_MONTH,
            Self::THREE_MONTHS,
            Self::SIX_MONTHS,
        ]
    }

    /// Last calendar day of the window starting at `start`.
    pub fn window_end(&self, start: NaiveDate) -> Option<NaiveDate> {
        match *self {
            Horizon::Days(n) => start.checked_add_days(Days::new(n as u64)),
            Horizon::Weeks(n) => start.checked_add_days(Days::new(7 * n as u64)),
            Horizon::Months(n) => start.checked_add_months(Months::new(n)),
        }
    }

    /// Rough length in days, used for ordering only.
    pub fn approx_days(&self) -> u64 {
        match *self {
            Horizon::Days(n) => n as u64,
            Horizon::Weeks(n) => n as u64 * 7,
            Horizon::Months(n) => n as u64 * 30,
        }
    }

    pub fn label(&self) -> String {
        match *self {
            Horizon::Days(n) => format!("{}d", n),
            Horizon::Weeks(n) => format!("{}w", n),
            Horizon::Months(n) => format!("{}m", n),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Horizon::Days(_) => 0,
            Horizon::Weeks(_) => 1,
            Horizon::Months(_) => 2,
        }
    }
}

impl Ord for Horizon {
    fn cmp(&self, other: &Self) -> Ordering {
        self.approx_days()
            .cmp(&other.approx_days())
            .then(self.rank().cmp(&other.rank()))
    }
}

impl PartialOrd for Horizon {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for Horizon {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s.len() < 2 {
            return Err(format!("invalid horizon '{}'", s));
        }
        let (count, unit) = s.split_at(s.len() - 1);
        let n: u32 = count
            .parse()
            .map_err(|_| format!("invalid horizon count in '{}'", s))?;
        if n == 0 {
            return Err(format!("horizon '{}' must be positive", s));
        }
        match unit {
            "d" => Ok(Horizon::Days(n)),
            "w" => Ok(Horizon::Weeks(n)),
            "m" => Ok(Horizon::Months(n)),
            _ => Err(format!("unknown horizon unit in '{}' (use d, w or m)", s)),
        }
    }
}

impl TryFrom<String> for Horizon {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Horizon> for String {
    fn from(h: Horizon) -> Self {
        h.label()
    }
}

/// Realized outcome of a decision over every configured horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub correlation_id: String,
    /// Percent return per horizon; complete by construction
    pub returns: BTreeMap<Horizon, f64>,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
}

/// A retrieved neighbour: decision joined with its feedback. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarCase {
    /// Insertion position in the vector index
    pub position: usize,
    pub similarity: f32,
    pub decision: Decision,
    pub feedback: Option<FeedbackRecord>,
}

/// Answer to a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Retrieval {
    Cases { cases: Vec<SimilarCase> },
    /// Too few decisions recorded for similarity to mean anything
    InsufficientData { population: usize, required: usize },
}

impl Retrieval {
    pub fn cases(&self) -> Option<&[SimilarCase]> {
        match self {
            Retrieval::Cases { cases } => Some(cases),
            Retrieval::InsufficientData { .. } => None,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, Retrieval::InsufficientData { .. })
    }
}

/// Result of [`crate::memory::CaseMemory::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Recorded { position: usize },
    /// The correlation id was already in the ledger; nothing was written
    AlreadyRecorded,
}

/// Result of [`crate::outcome::OutcomeTracker::compute_feedback`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackStatus {
    Recorded(FeedbackRecord),
    AlreadyRecorded(FeedbackRecord),
    /// At least one horizon is unresolved; nothing was written
    Pending {
        resolved: BTreeMap<Horizon, f64>,
        missing: Vec<Horizon>,
    },
}

impl FeedbackStatus {
    pub fn record(&self) -> Option<&FeedbackRecord> {
        match self {
            FeedbackStatus::Recorded(r) | FeedbackStatus::AlreadyRecorded(r) => Some(r),
            FeedbackStatus::Pending { .. } => None,
        }
    }
}
