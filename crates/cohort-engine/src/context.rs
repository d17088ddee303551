//! Evaluation context and parameter values.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

/// Well-known parameter name for the start of a reporting window.
pub const START_DATE: &str = "startDate";

/// Well-known parameter name for the end of a reporting window.
pub const END_DATE: &str = "endDate";

/// Named parameters passed to a calculation call.
pub type ParamBag = BTreeMap<String, ParamValue>;

/// A single parameter value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamValue {
    /// Boolean switch.
    Bool(bool),
    /// Whole number (counts, day offsets, thresholds).
    Integer(i64),
    /// Decimal threshold.
    Decimal(f64),
    /// Free text or coded identifier.
    Text(String),
    /// Calendar date.
    Date(NaiveDate),
    /// Instant in time.
    DateTime(DateTime<Utc>),
}

impl ParamValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Integer(_) => ParamKind::Integer,
            ParamValue::Decimal(_) => ParamKind::Decimal,
            ParamValue::Text(_) => ParamKind::Text,
            ParamValue::Date(_) => ParamKind::Date,
            ParamValue::DateTime(_) => ParamKind::DateTime,
        }
    }

    /// Returns the boolean value, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an `Integer`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns a numeric value; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(n) => Some(*n as f64),
            ParamValue::Decimal(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text value, if this is `Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the calendar date of a `Date` or `DateTime`.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            ParamValue::Date(d) => Some(*d),
            ParamValue::DateTime(dt) => Some(dt.date_naive()),
            _ => None,
        }
    }

    /// Returns an instant; a `Date` maps to midnight UTC.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            ParamValue::DateTime(dt) => Some(*dt),
            ParamValue::Date(d) => d
                .and_hms_opt(0, 0, 0)
                .map(|midnight| Utc.from_utc_datetime(&midnight)),
            _ => None,
        }
    }
}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ParamValue::Bool(b) => b.hash(state),
            ParamValue::Integer(n) => n.hash(state),
            ParamValue::Decimal(n) => n.to_bits().hash(state),
            ParamValue::Text(s) => s.hash(state),
            ParamValue::Date(d) => d.hash(state),
            ParamValue::DateTime(dt) => dt.hash(state),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Integer(n) => write!(f, "{}", n),
            ParamValue::Decimal(n) => write!(f, "{}", n),
            ParamValue::Text(s) => write!(f, "{}", s),
            ParamValue::Date(d) => write!(f, "{}", d),
            ParamValue::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Decimal(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<NaiveDate> for ParamValue {
    fn from(value: NaiveDate) -> Self {
        ParamValue::Date(value)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(value: DateTime<Utc>) -> Self {
        ParamValue::DateTime(value)
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamKind {
    /// `ParamValue::Bool`
    Bool,
    /// `ParamValue::Integer`
    Integer,
    /// `ParamValue::Decimal` (integers are accepted)
    Decimal,
    /// `ParamValue::Text`
    Text,
    /// `ParamValue::Date`
    Date,
    /// `ParamValue::DateTime` (dates are accepted)
    DateTime,
}

impl ParamKind {
    /// Checks whether `value` is acceptable for a parameter of this kind.
    pub fn accepts(&self, value: &ParamValue) -> bool {
        matches!(
            (self, value),
            (ParamKind::Bool, ParamValue::Bool(_))
                | (ParamKind::Integer, ParamValue::Integer(_))
                | (ParamKind::Decimal, ParamValue::Decimal(_))
                | (ParamKind::Decimal, ParamValue::Integer(_))
                | (ParamKind::Text, ParamValue::Text(_))
                | (ParamKind::Date, ParamValue::Date(_))
                | (ParamKind::DateTime, ParamValue::DateTime(_))
                | (ParamKind::DateTime, ParamValue::Date(_))
        )
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::Bool => "bool",
            ParamKind::Integer => "integer",
            ParamKind::Decimal => "decimal",
            ParamKind::Text => "text",
            ParamKind::Date => "date",
            ParamKind::DateTime => "datetime",
        };
        f.write_str(name)
    }
}

/// Stable fingerprint of a parameter bag.
pub fn params_fingerprint(params: &ParamBag) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (name, value) in params {
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

/// Immutable snapshot shared by every calculation and filter in one
/// evaluation run.
///
/// `now` is frozen when the context is built, so two calculations evaluated
/// in the same run always agree on the reference instant even if wall-clock
/// time moves on mid-batch.
///
/// # Example
///
/// ```rust
/// use chrono::{NaiveDate, TimeZone, Utc};
/// use cohort_engine::EvaluationContext;
///
/// let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
/// let ctx = EvaluationContext::new(now)
///     .with_window(
///         NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
///         NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
///     )
///     .with_param("vlThreshold", 1000_i64);
///
/// assert_eq!(ctx.now(), now);
/// assert_eq!(ctx.param("vlThreshold").and_then(|v| v.as_i64()), Some(1000));
/// assert!(ctx.start_date().is_some());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    now: DateTime<Utc>,
    params: Arc<ParamBag>,
}

impl EvaluationContext {
    /// Creates a context frozen at `now` with no parameters.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            params: Arc::new(ParamBag::new()),
        }
    }

    /// Creates a context frozen at the current wall-clock instant.
    pub fn at_wall_clock() -> Self {
        Self::new(Utc::now())
    }

    /// Adds a named parameter (construction only; the built context is immutable).
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Arc::make_mut(&mut self.params).insert(name.into(), value.into());
        self
    }

    /// Sets `startDate` and `endDate`.
    pub fn with_window(self, start: impl Into<ParamValue>, end: impl Into<ParamValue>) -> Self {
        self.with_param(START_DATE, start).with_param(END_DATE, end)
    }

    /// The frozen reference instant.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Calendar date of `now` (UTC).
    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    /// All context parameters.
    pub fn params(&self) -> &ParamBag {
        &self.params
    }

    /// Looks up a context parameter.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// `startDate` as an instant, if set.
    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.param(START_DATE).and_then(ParamValue::as_datetime)
    }

    /// `endDate` as an instant, if set.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.param(END_DATE).and_then(ParamValue::as_datetime)
    }

    /// End of the evaluation window: `endDate` if set, otherwise `now`.
    pub fn window_end(&self) -> DateTime<Utc> {
        self.end_date().unwrap_or(self.now)
    }

    /// Instant `days` days before `now`, saturating at the representable range.
    pub fn days_before_now(&self, days: i64) -> DateTime<Utc> {
        Duration::try_days(days)
            .and_then(|span| self.now.checked_sub_signed(span))
            .unwrap_or(if days > 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            })
    }
}
