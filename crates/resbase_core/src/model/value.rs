//! Attribute values.
//!
//! # Responsibility
//! - Define the closed set of value shapes attribute handlers persist.
//! - Provide canonical text forms for numeric and date values.
//!
//! # Invariants
//! - `Decimal` text is always canonical, so equal numbers compare equal.
//! - Dates carry millisecond precision in UTC.
//! - Composite values (`DateRange`, `ParameterBag`) track in-place mutation
//!   with a dirty flag that is ignored by equality.

use crate::model::ids::{ClassId, PermissionId, ResourceId, RoleId, SubjectId};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

static DECIMAL_SYNTAX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([+-])?([0-9]+)(?:\.([0-9]+))?$").expect("decimal pattern is valid")
});

/// Arbitrary-precision decimal number in canonical text form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal(String);

impl Decimal {
    /// Parses and canonicalizes decimal text (`-007.50` becomes `-7.5`).
    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        let captures = DECIMAL_SYNTAX
            .captures(trimmed)
            .ok_or_else(|| format!("`{trimmed}` is not a decimal number"))?;

        let negative = captures.get(1).is_some_and(|sign| sign.as_str() == "-");
        let integer = captures.get(2).map_or("0", |m| m.as_str()).trim_start_matches('0');
        let fraction = captures
            .get(3)
            .map_or("", |m| m.as_str())
            .trim_end_matches('0');

        let integer = if integer.is_empty() { "0" } else { integer };
        let is_zero = integer == "0" && fraction.is_empty();

        let mut canonical = String::with_capacity(trimmed.len());
        if negative && !is_zero {
            canonical.push('-');
        }
        canonical.push_str(integer);
        if !fraction.is_empty() {
            canonical.push('.');
            canonical.push_str(fraction);
        }
        Ok(Self(canonical))
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> (bool, &str, &str) {
        let (negative, digits) = match self.0.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, self.0.as_str()),
        };
        match digits.split_once('.') {
            Some((integer, fraction)) => (negative, integer, fraction),
            None => (negative, digits, ""),
        }
    }
}

fn compare_magnitude(left: (&str, &str), right: (&str, &str)) -> Ordering {
    left.0
        .len()
        .cmp(&right.0.len())
        .then_with(|| left.0.cmp(right.0))
        .then_with(|| {
            let width = left.1.len().max(right.1.len());
            let pad = |s: &str| format!("{s:0<width$}");
            pad(left.1).cmp(&pad(right.1))
        })
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let (left_negative, left_int, left_frac) = self.parts();
        let (right_negative, right_int, right_frac) = other.parts();
        match (left_negative, right_negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => compare_magnitude((left_int, left_frac), (right_int, right_frac)),
            (true, true) => compare_magnitude((right_int, right_frac), (left_int, left_frac)),
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Decimal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Converts epoch milliseconds to a UTC timestamp.
pub fn date_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// Truncates a timestamp to millisecond precision.
pub fn truncate_to_millis(value: DateTime<Utc>) -> DateTime<Utc> {
    date_from_millis(value.timestamp_millis()).unwrap_or(value)
}

/// Canonical external form: RFC 3339, UTC, milliseconds.
pub fn format_date(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses RFC 3339, `YYYY-MM-DD` (midnight UTC), or epoch milliseconds.
pub fn parse_date(text: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(truncate_to_millis(parsed.with_timezone(&Utc)));
    }
    if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    if let Ok(millis) = trimmed.parse::<i64>() {
        return date_from_millis(millis)
            .ok_or_else(|| format!("epoch milliseconds `{millis}` out of range"));
    }
    Err(format!("`{trimmed}` is not a date"))
}

/// Two-field date range; either bound may be open.
#[derive(Debug, Clone, Default)]
pub struct DateRange {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    dirty: bool,
}

impl DateRange {
    /// Builds a range; `end` before `start` is rejected.
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self, String> {
        let range = Self {
            start: start.map(truncate_to_millis),
            end: end.map(truncate_to_millis),
            dirty: false,
        };
        range.validate()?;
        Ok(range)
    }

    /// Parses `start/end`; either side may be empty.
    pub fn parse(text: &str) -> Result<Self, String> {
        let (start, end) = text
            .split_once('/')
            .ok_or_else(|| format!("`{text}` is not a date range (expected `start/end`)"))?;
        let parse_bound = |bound: &str| -> Result<Option<DateTime<Utc>>, String> {
            if bound.trim().is_empty() {
                Ok(None)
            } else {
                parse_date(bound).map(Some)
            }
        };
        Self::new(parse_bound(start)?, parse_bound(end)?)
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn set_start(&mut self, start: Option<DateTime<Utc>>) -> Result<(), String> {
        let previous = self.start;
        self.start = start.map(truncate_to_millis);
        if let Err(err) = self.validate() {
            self.start = previous;
            return Err(err);
        }
        self.dirty = true;
        Ok(())
    }

    pub fn set_end(&mut self, end: Option<DateTime<Utc>>) -> Result<(), String> {
        let previous = self.end;
        self.end = end.map(truncate_to_millis);
        if let Err(err) = self.validate() {
            self.end = previous;
            return Err(err);
        }
        self.dirty = true;
        Ok(())
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| start <= instant)
            && self.end.map_or(true, |end| instant <= end)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn validate(&self) -> Result<(), String> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if end < start => Err(format!(
                "date range end {} is before start {}",
                format_date(&end),
                format_date(&start)
            )),
            _ => Ok(()),
        }
    }
}

impl PartialEq for DateRange {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.end == other.end
    }
}

impl Display for DateRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bound = |value: &Option<DateTime<Utc>>| value.as_ref().map(format_date).unwrap_or_default();
        write!(f, "{}/{}", bound(&self.start), bound(&self.end))
    }
}

/// Keyed parameter bag persisted through the parameter store.
#[derive(Debug, Clone, Default)]
pub struct ParameterBag {
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl ParameterBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, String>) -> Self {
        Self {
            entries,
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if self.entries.get(&key) != Some(&value) {
            self.entries.insert(key, value);
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl PartialEq for ParameterBag {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterBag {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::from_entries(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// One attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Decimal(Decimal),
    Date(DateTime<Utc>),
    DateRange(DateRange),
    /// Fixed-length string (at most 255 characters).
    String(String),
    Text(String),
    Parameters(ParameterBag),
    Resource(ResourceId),
    Role(RoleId),
    Subject(SubjectId),
    Permission(PermissionId),
    ResourceClass(ClassId),
    ResourceList(Vec<ResourceId>),
}

impl AttributeValue {
    /// Short shape name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Long(_) => "long",
            Self::Decimal(_) => "decimal",
            Self::Date(_) => "date",
            Self::DateRange(_) => "date_range",
            Self::String(_) => "string",
            Self::Text(_) => "text",
            Self::Parameters(_) => "parameters",
            Self::Resource(_) => "resource",
            Self::Role(_) => "role",
            Self::Subject(_) => "subject",
            Self::Permission(_) => "permission",
            Self::ResourceClass(_) => "resource_class",
            Self::ResourceList(_) => "resource_list",
        }
    }

    pub fn date_from_millis(millis: i64) -> Option<Self> {
        date_from_millis(millis).map(Self::Date)
    }

    /// Clears in-place mutation markers of composite values.
    pub fn mark_clean(&mut self) {
        match self {
            Self::DateRange(range) => range.mark_clean(),
            Self::Parameters(bag) => bag.mark_clean(),
            _ => {}
        }
    }
}

/// Untyped input accepted by `AttributeHandler::to_attribute_value`.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Value(AttributeValue),
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<AttributeValue> for RawValue {
    fn from(value: AttributeValue) -> Self {
        Self::Value(value)
    }
}

impl From<Option<AttributeValue>> for RawValue {
    fn from(value: Option<AttributeValue>) -> Self {
        value.map_or(Self::Null, Self::Value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for RawValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<ResourceId> for RawValue {
    fn from(value: ResourceId) -> Self {
        Self::Value(AttributeValue::Resource(value))
    }
}

#[cfg(test)]
mod tests {
    use super::{format_date, parse_date, DateRange, Decimal, ParameterBag};

    #[test]
    fn decimal_canonicalizes() {
        assert_eq!(Decimal::parse("-007.50").unwrap().as_str(), "-7.5");
        assert_eq!(Decimal::parse("+12").unwrap().as_str(), "12");
        assert_eq!(Decimal::parse("-0.000").unwrap().as_str(), "0");
        assert_eq!(Decimal::parse("0.25").unwrap().as_str(), "0.25");
        assert_eq!(
            Decimal::parse("123456789012345678901234567890.1").unwrap().as_str(),
            "123456789012345678901234567890.1"
        );
        assert!(Decimal::parse("1e5").is_err());
        assert!(Decimal::parse("1.").is_err());
        assert!(Decimal::parse("").is_err());
    }

    #[test]
    fn decimal_orders_numerically() {
        let d = |s: &str| Decimal::parse(s).unwrap();
        assert!(d("10") > d("9.99"));
        assert!(d("-10") < d("-9.99"));
        assert!(d("0.5") > d("0.25"));
        assert!(d("-1") < d("0"));
        assert_eq!(d("1.50"), d("1.5"));
    }

    #[test]
    fn dates_parse_and_format_canonically() {
        let date = parse_date("2024-01-31T12:00:00.123456Z").unwrap();
        assert_eq!(format_date(&date), "2024-01-31T12:00:00.123Z");
        let day = parse_date("2024-02-01").unwrap();
        assert_eq!(format_date(&day), "2024-02-01T00:00:00.000Z");
        let millis = parse_date("0").unwrap();
        assert_eq!(format_date(&millis), "1970-01-01T00:00:00.000Z");
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn date_range_parses_open_bounds_and_rejects_inversion() {
        let range = DateRange::parse("2024-01-01/").unwrap();
        assert!(range.start().is_some());
        assert!(range.end().is_none());
        assert_eq!(range.to_string(), "2024-01-01T00:00:00.000Z/");
        assert!(DateRange::parse("2024-02-01/2024-01-01").is_err());
        assert!(DateRange::parse("2024-02-01").is_err());
    }

    #[test]
    fn date_range_mutation_marks_dirty_but_not_inequality() {
        let mut range = DateRange::parse("2024-01-01/2024-12-31").unwrap();
        let original = range.clone();
        assert!(!range.is_dirty());
        range.set_end(None).unwrap();
        assert!(range.is_dirty());
        assert_ne!(range, original);

        let mut same = original.clone();
        same.set_start(original.start()).unwrap();
        assert!(same.is_dirty());
        assert_eq!(same, original);
    }

    #[test]
    fn date_range_setter_keeps_previous_bound_on_error() {
        let mut range = DateRange::parse("2024-01-01/2024-12-31").unwrap();
        let late = parse_date("2025-06-01").unwrap();
        assert!(range.set_start(Some(late)).is_err());
        assert_eq!(range.to_string(), "2024-01-01T00:00:00.000Z/2024-12-31T00:00:00.000Z");
        assert!(!range.is_dirty());
    }

    #[test]
    fn parameter_bag_tracks_changes() {
        let mut bag: ParameterBag = [("a", "1")].into_iter().collect();
        assert!(!bag.is_dirty());
        bag.set("a", "1");
        assert!(!bag.is_dirty());
        bag.set("b", "2");
        assert!(bag.is_dirty());
        bag.mark_clean();
        assert_eq!(bag.remove("a").as_deref(), Some("1"));
        assert!(bag.is_dirty());
        assert_eq!(bag.len(), 1);
    }
}
