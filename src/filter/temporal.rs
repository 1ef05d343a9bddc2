use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{StoreError, StoreResult};

/// How a stored time range is compared against the filter range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeOp {
    #[default]
    Intersects,
    Contains,
    Equals,
}

impl RangeOp {
    pub fn sql_operator(&self) -> &'static str {
        match self {
            RangeOp::Intersects => "&&",
            RangeOp::Contains => "@>",
            RangeOp::Equals => "=",
        }
    }
}

/// Temporal constraint on a time-valued field.
///
/// `Latest` and `Current` carry no bounds, so a latest-value query can never
/// be combined with a range on the same field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TemporalFilter {
    /// Closed interval `[min, max]`. Bounds are RFC 3339 instants or one of
    /// `-infinity`, `infinity`, `now`.
    Range {
        min: String,
        max: String,
        #[serde(default)]
        op: RangeOp,
    },
    /// Only the most recent record per partition.
    Latest,
    /// Records valid at the current time.
    Current,
}

impl TemporalFilter {
    pub fn range(min: impl Into<String>, max: impl Into<String>) -> Self {
        TemporalFilter::Range {
            min: min.into(),
            max: max.into(),
            op: RangeOp::default(),
        }
    }

    pub fn between(min: DateTime<Utc>, max: DateTime<Utc>) -> Self {
        Self::range(
            min.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            max.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        )
    }

    pub fn latest() -> Self {
        TemporalFilter::Latest
    }

    pub fn current() -> Self {
        TemporalFilter::Current
    }

    pub fn with_op(self, op: RangeOp) -> Self {
        match self {
            TemporalFilter::Range { min, max, .. } => TemporalFilter::Range { min, max, op },
            other => other,
        }
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, TemporalFilter::Latest)
    }

    pub fn op(&self) -> RangeOp {
        match self {
            TemporalFilter::Range { op, .. } => *op,
            _ => RangeOp::default(),
        }
    }

    /// Parse and check the range bounds.
    ///
    /// Returns `None` for the non-range modes.
    pub fn bounds(&self) -> StoreResult<Option<(TimeBound, TimeBound)>> {
        let TemporalFilter::Range { min, max, .. } = self else {
            return Ok(None);
        };
        let lower = TimeBound::parse(min).map_err(|e| {
            StoreError::Validation(format!("invalid lower time bound '{}': {}", min, e))
        })?;
        let upper = TimeBound::parse(max).map_err(|e| {
            StoreError::Validation(format!("invalid upper time bound '{}': {}", max, e))
        })?;
        if lower.cmp_resolved(&upper) == Ordering::Greater {
            return Err(StoreError::Validation(format!(
                "time range lower bound {} is after upper bound {}",
                min, max
            )));
        }
        Ok(Some((lower, upper)))
    }
}

/// One end of a time range, as accepted by PostgreSQL timestamptz input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    NegInfinity,
    At(DateTime<Utc>),
    Now,
    Infinity,
}

impl TimeBound {
    pub fn parse(raw: &str) -> Result<Self, chrono::ParseError> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("-infinity") {
            Ok(TimeBound::NegInfinity)
        } else if raw.eq_ignore_ascii_case("infinity") {
            Ok(TimeBound::Infinity)
        } else if raw.eq_ignore_ascii_case("now") {
            Ok(TimeBound::Now)
        } else {
            DateTime::parse_from_rfc3339(raw).map(|t| TimeBound::At(t.with_timezone(&Utc)))
        }
    }

    fn resolved(&self) -> Option<DateTime<Utc>> {
        match self {
            TimeBound::At(t) => Some(*t),
            TimeBound::Now => Some(Utc::now()),
            _ => None,
        }
    }

    fn cmp_resolved(&self, other: &TimeBound) -> Ordering {
        match (self, other) {
            (TimeBound::NegInfinity, TimeBound::NegInfinity)
            | (TimeBound::Infinity, TimeBound::Infinity) => Ordering::Equal,
            (TimeBound::NegInfinity, _) | (_, TimeBound::Infinity) => Ordering::Less,
            (_, TimeBound::NegInfinity) | (TimeBound::Infinity, _) => Ordering::Greater,
            (a, b) => a.resolved().cmp(&b.resolved()),
        }
    }
}

/// Earliest instant PostgreSQL timestamptz can hold (4713 BC), rounded up.
fn min_instant() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(-4699, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn max_instant() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(3000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl fmt::Display for TimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBound::NegInfinity => write!(f, "-infinity"),
            TimeBound::Infinity => write!(f, "infinity"),
            TimeBound::Now => write!(f, "now"),
            TimeBound::At(t) if *t < min_instant() => write!(f, "-infinity"),
            TimeBound::At(t) if *t > max_instant() => write!(f, "infinity"),
            TimeBound::At(t) => write!(
                f,
                "{}",
                t.trunc_subsecs(0).to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bounds() {
        let filter = TemporalFilter::range("2024-01-01T00:00:00Z", "2024-02-01T12:30:00.750Z");
        let (min, max) = filter.bounds().unwrap().unwrap();
        assert_eq!(min.to_string(), "2024-01-01T00:00:00Z");
        // sub-second precision is dropped
        assert_eq!(max.to_string(), "2024-02-01T12:30:00Z");
    }

    #[test]
    fn test_offset_normalized_to_utc() {
        let filter = TemporalFilter::range("2024-01-01T02:00:00+02:00", "infinity");
        let (min, max) = filter.bounds().unwrap().unwrap();
        assert_eq!(min.to_string(), "2024-01-01T00:00:00Z");
        assert_eq!(max, TimeBound::Infinity);
    }

    #[test]
    fn test_malformed_bound() {
        let err = TemporalFilter::range("yesterday", "2024-01-01T00:00:00Z")
            .bounds()
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(err.to_string().contains("lower time bound 'yesterday'"));
    }

    #[test]
    fn test_non_monotonic_bounds() {
        let err = TemporalFilter::range("2024-02-01T00:00:00Z", "2024-01-01T00:00:00Z")
            .bounds()
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(err.to_string().contains("is after upper bound"));
    }

    #[test]
    fn test_infinite_bounds_order() {
        assert!(TemporalFilter::range("-infinity", "infinity").bounds().is_ok());
        assert!(TemporalFilter::range("-infinity", "now").bounds().is_ok());
        assert!(TemporalFilter::range("infinity", "-infinity").bounds().is_err());
        assert!(TemporalFilter::range("now", "-infinity").bounds().is_err());
    }

    #[test]
    fn test_far_instants_clamped() {
        let far = TimeBound::parse("3500-06-01T00:00:00Z").unwrap();
        assert_eq!(far.to_string(), "infinity");
        let early = TimeBound::At(DateTime::<Utc>::MIN_UTC);
        assert_eq!(early.to_string(), "-infinity");
    }

    #[test]
    fn test_latest_has_no_bounds() {
        assert!(TemporalFilter::latest().bounds().unwrap().is_none());
        assert!(TemporalFilter::latest().is_latest());
        assert!(!TemporalFilter::current().is_latest());
    }

    #[test]
    fn test_with_op_only_affects_range() {
        let f = TemporalFilter::range("now", "infinity").with_op(RangeOp::Contains);
        assert_eq!(f.op(), RangeOp::Contains);
        assert_eq!(TemporalFilter::latest().with_op(RangeOp::Equals), TemporalFilter::Latest);
        assert_eq!(RangeOp::Intersects.sql_operator(), "&&");
    }

    #[test]
    fn test_serde_modes() {
        let f: TemporalFilter = serde_json::from_str(r#"{"mode":"latest"}"#).unwrap();
        assert_eq!(f, TemporalFilter::Latest);
        let f: TemporalFilter = serde_json::from_str(
            r#"{"mode":"range","min":"2024-01-01T00:00:00Z","max":"now","op":"contains"}"#,
        )
        .unwrap();
        assert_eq!(f.op(), RangeOp::Contains);
    }
}
