//! Schema-aware field comparison strategies.
//!
//! Each field's comparison strategy is chosen from its declared schema type,
//! never from the runtime shape of the value. A field declared as a date is
//! normalized to ISO-8601 before comparison; a string field holding
//! `10/23/2017` is compared as the literal string.

use chrono::{NaiveDate, NaiveDateTime, SecondsFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::sync::OnceLock;

use crate::pipeline::hierarchy::{non_null_branch, schema_type};
use crate::types::object::{is_blank, value_to_text, ResolvedObject};

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    DateTime,
}

impl FieldType {
    /// Type of a single property schema.
    pub fn from_schema(property: &Value) -> Self {
        let property = non_null_branch(property);
        let format = property.get("format").and_then(Value::as_str);

        match (schema_type(&property), format) {
            (_, Some("date")) => Self::Date,
            (_, Some("date-time")) => Self::DateTime,
            (Some("number"), _) => Self::Number,
            (Some("integer"), _) => Self::Integer,
            (Some("boolean"), _) => Self::Boolean,
            _ => Self::String,
        }
    }

    /// Resolve a field's type by searching the schema, including nested
    /// objects and array items. Unknown fields are strings.
    pub fn resolve(schema: &Value, field: &str) -> Self {
        find_property(schema, field)
            .map(|p| Self::from_schema(&p))
            .unwrap_or(Self::String)
    }

    fn strategy(self) -> &'static FieldStrategy {
        match self {
            Self::String => &STRING_STRATEGY,
            Self::Number => &NUMBER_STRATEGY,
            Self::Integer => &INTEGER_STRATEGY,
            Self::Boolean => &BOOLEAN_STRATEGY,
            Self::Date => &DATE_STRATEGY,
            Self::DateTime => &DATE_TIME_STRATEGY,
        }
    }

    /// Normalize a value for comparison; `None` if it is blank.
    pub fn normalize(self, value: &Value) -> Option<Value> {
        if is_blank(Some(value)) {
            return None;
        }
        (self.strategy().normalize)(value)
    }

    /// Equality after normalization. Two empty values are equal; an empty
    /// and a present value are not.
    pub fn values_equal(self, a: Option<&Value>, b: Option<&Value>) -> bool {
        match (is_blank(a), is_blank(b)) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => {
                let (Some(a), Some(b)) = (a, b) else {
                    return false;
                };
                match (self.normalize(a), self.normalize(b)) {
                    (Some(a), Some(b)) => (self.strategy().equals)(&a, &b),
                    _ => false,
                }
            }
        }
    }

    /// Build a search condition from a query criterion. `None` means the
    /// criterion is skipped (e.g. an empty keyword array).
    pub fn condition(self, criterion: &Value) -> Option<Condition> {
        if is_blank(Some(criterion)) {
            return None;
        }
        (self.strategy().condition)(criterion)
    }

    fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::DateTime)
    }
}

/// Strategy table entry.
struct FieldStrategy {
    normalize: fn(&Value) -> Option<Value>,
    equals: fn(&Value, &Value) -> bool,
    condition: fn(&Value) -> Option<Condition>,
}

static STRING_STRATEGY: FieldStrategy = FieldStrategy {
    normalize: normalize_string,
    equals: text_equals_ignore_case,
    condition: string_condition,
};

static NUMBER_STRATEGY: FieldStrategy = FieldStrategy {
    normalize: normalize_number,
    equals: numbers_equal,
    condition: numeric_condition,
};

static INTEGER_STRATEGY: FieldStrategy = FieldStrategy {
    normalize: normalize_integer,
    equals: numbers_equal,
    condition: numeric_condition,
};

static BOOLEAN_STRATEGY: FieldStrategy = FieldStrategy {
    normalize: normalize_boolean,
    equals: values_identical,
    condition: boolean_condition,
};

static DATE_STRATEGY: FieldStrategy = FieldStrategy {
    normalize: normalize_date,
    equals: values_identical,
    condition: date_condition,
};

static DATE_TIME_STRATEGY: FieldStrategy = FieldStrategy {
    normalize: normalize_date_time,
    equals: values_identical,
    condition: date_time_condition,
};

// =============================================================================
// Normalization
// =============================================================================

fn normalize_string(value: &Value) -> Option<Value> {
    match value {
        Value::Array(items) => Some(Value::String(
            items.iter().map(value_to_text).collect::<Vec<_>>().join(", "),
        )),
        other => Some(Value::String(value_to_text(other).trim().to_string())),
    }
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn normalize_number(value: &Value) -> Option<Value> {
    to_f64(value)
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn normalize_integer(value: &Value) -> Option<Value> {
    let n = to_f64(value)?;
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Some(Value::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number)
    }
}

/// Parse common truthy/falsy literals.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 1.0 => Some(true),
            Some(x) if x == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "y" => Some(true),
            "0" | "false" | "f" | "no" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn normalize_boolean(value: &Value) -> Option<Value> {
    parse_bool(value).map(Value::Bool)
}

fn ordinal_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").expect("valid ordinal regex"))
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%Y/%m/%d",
    "%m/%d/%y",
    "%m.%d.%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %B, %Y",
    "%Y%m%d",
];

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

/// Parse a date in any of the common input formats.
///
/// Month names (full or abbreviated) and ordinal day suffixes are accepted.
/// Date-times are truncated to their date.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let cleaned = ordinal_suffix().replace_all(input.trim(), "$1");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cleaned, fmt).ok())
        .or_else(|| parse_date_time(cleaned).map(|dt| dt.date()))
}

/// Parse a date-time; plain dates read as midnight.
pub fn parse_date_time(input: &str) -> Option<NaiveDateTime> {
    let trimmed = input.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_utc());
    }
    if let Some(dt) = DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
    {
        return Some(dt);
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn normalize_date(value: &Value) -> Option<Value> {
    let text = value_to_text(value);
    let normalized = parse_date(&text)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| text.trim().to_string());
    Some(Value::String(normalized))
}

fn normalize_date_time(value: &Value) -> Option<Value> {
    let text = value_to_text(value);
    let normalized = parse_date_time(&text)
        .map(|dt| dt.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| text.trim().to_string());
    Some(Value::String(normalized))
}

// =============================================================================
// Equality
// =============================================================================

fn values_identical(a: &Value, b: &Value) -> bool {
    a == b
}

fn text_equals_ignore_case(a: &Value, b: &Value) -> bool {
    value_to_text(a).to_lowercase() == value_to_text(b).to_lowercase()
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (to_f64(a), to_f64(b)) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => false,
    }
}

// =============================================================================
// Search conditions
// =============================================================================

/// A compiled SQL-LIKE pattern (`%` any run, `_` any char), case-sensitive.
#[derive(Debug, Clone)]
pub struct LikePattern {
    pub raw: String,
    regex: Regex,
}

impl LikePattern {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let mut pattern = String::from("(?s)^");
        for ch in raw.chars() {
            match ch {
                '%' => pattern.push_str(".*"),
                '_' => pattern.push('.'),
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        pattern.push('$');
        Regex::new(&pattern).ok().map(|regex| Self { raw, regex })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Comparison operator for numeric criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
}

impl NumericOp {
    fn parse(op: &str) -> Option<Self> {
        match op.trim().to_lowercase().as_str() {
            "=" | "==" | "eq" => Some(Self::Eq),
            ">" | "gt" => Some(Self::Gt),
            ">=" | "gte" => Some(Self::Gte),
            "<" | "lt" => Some(Self::Lt),
            "<=" | "lte" => Some(Self::Lte),
            "between" => Some(Self::Between),
            _ => None,
        }
    }
}

/// One field condition of a candidate search.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Case-sensitive LIKE pattern
    Like(LikePattern),

    /// Every keyword must appear, case-insensitive, any order
    AllKeywords(Vec<String>),

    /// Equality with an already-normalized value
    Equals(Value),

    /// Numeric comparison (`value2` is the upper bound for `between`)
    Compare {
        op: NumericOp,
        value: f64,
        value2: Option<f64>,
    },
}

fn keywords(items: &[Value]) -> Option<Condition> {
    let keywords: Vec<String> = items
        .iter()
        .map(value_to_text)
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        None
    } else {
        Some(Condition::AllKeywords(keywords))
    }
}

fn string_condition(criterion: &Value) -> Option<Condition> {
    match criterion {
        Value::Array(items) => keywords(items),
        other => LikePattern::new(value_to_text(other)).map(Condition::Like),
    }
}

fn numeric_condition(criterion: &Value) -> Option<Condition> {
    match criterion {
        Value::Object(map) => {
            let op = map
                .get("operator")
                .or_else(|| map.get("op"))
                .and_then(Value::as_str)
                .and_then(NumericOp::parse)
                .unwrap_or(NumericOp::Eq);
            let value = map.get("value").and_then(to_f64)?;
            let value2 = map.get("value2").and_then(to_f64);
            if op == NumericOp::Between && value2.is_none() {
                return None;
            }
            Some(Condition::Compare { op, value, value2 })
        }
        other => to_f64(other).map(|value| Condition::Compare {
            op: NumericOp::Eq,
            value,
            value2: None,
        }),
    }
}

fn boolean_condition(criterion: &Value) -> Option<Condition> {
    parse_bool(criterion).map(|b| Condition::Equals(Value::Bool(b)))
}

/// Date criteria: the non-wildcard core is normalized, wildcards kept.
fn temporal_condition(criterion: &Value, normalize: fn(&Value) -> Option<Value>) -> Option<Condition> {
    match criterion {
        Value::Array(items) => {
            let normalized: Vec<Value> = items.iter().filter_map(normalize).collect();
            keywords(&normalized)
        }
        other => {
            let text = value_to_text(other);
            let trimmed = text.trim();
            if trimmed.contains('%') || trimmed.contains('_') && parse_date(trimmed).is_none() {
                let core = trimmed.trim_matches('%');
                let prefix = if trimmed.starts_with('%') { "%" } else { "" };
                let suffix = if trimmed.len() > 1 && trimmed.ends_with('%') { "%" } else { "" };
                let core = normalize(&Value::String(core.to_string()))
                    .map(|v| value_to_text(&v))
                    .unwrap_or_else(|| core.to_string());
                LikePattern::new(format!("{prefix}{core}{suffix}")).map(Condition::Like)
            } else {
                normalize(other).map(Condition::Equals)
            }
        }
    }
}

fn date_condition(criterion: &Value) -> Option<Condition> {
    temporal_condition(criterion, normalize_date)
}

fn date_time_condition(criterion: &Value) -> Option<Condition> {
    temporal_condition(criterion, normalize_date_time)
}

/// A typed predicate on one field of a resolved object.
#[derive(Debug, Clone)]
pub struct FieldPredicate {
    pub field: String,
    pub field_type: FieldType,
    pub condition: Condition,
}

impl FieldPredicate {
    /// Build a predicate; `None` when the criterion is skipped.
    pub fn new(field: impl Into<String>, field_type: FieldType, criterion: &Value) -> Option<Self> {
        field_type.condition(criterion).map(|condition| Self {
            field: field.into(),
            field_type,
            condition,
        })
    }

    /// Whether the object's stored value satisfies the condition.
    pub fn matches(&self, object: &ResolvedObject) -> bool {
        let Some(stored) = object.field(&self.field) else {
            return false;
        };
        if is_blank(Some(&stored)) {
            return false;
        }

        // Stored dates are normalized the same way as the criterion.
        let stored = if self.field_type.is_temporal() {
            match self.field_type.normalize(&stored) {
                Some(v) => v,
                None => return false,
            }
        } else {
            stored
        };

        match &self.condition {
            Condition::Like(pattern) => pattern.is_match(&searchable_text(&stored)),
            Condition::AllKeywords(keywords) => {
                let haystack = searchable_text(&stored).to_lowercase();
                keywords
                    .iter()
                    .all(|k| haystack.contains(&k.to_lowercase()))
            }
            Condition::Equals(expected) => self
                .field_type
                .normalize(&stored)
                .map(|actual| (self.field_type.strategy().equals)(&actual, expected))
                .unwrap_or(false),
            Condition::Compare { op, value, value2 } => {
                let Some(actual) = to_f64(&stored) else {
                    return false;
                };
                match op {
                    NumericOp::Eq => (actual - value).abs() < f64::EPSILON,
                    NumericOp::Gt => actual > *value,
                    NumericOp::Gte => actual >= *value,
                    NumericOp::Lt => actual < *value,
                    NumericOp::Lte => actual <= *value,
                    NumericOp::Between => {
                        let upper = value2.unwrap_or(*value);
                        actual >= *value && actual <= upper
                    }
                }
            }
        }
    }
}

fn searchable_text(value: &Value) -> String {
    match value {
        Value::Array(items) => items.iter().map(value_to_text).collect::<Vec<_>>().join(" "),
        other => value_to_text(other),
    }
}

/// Find a property schema by key anywhere in a schema.
fn find_property(schema: &Value, field: &str) -> Option<Value> {
    let schema = non_null_branch(schema);

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        if let Some(property) = properties.get(field) {
            return Some(property.clone());
        }
        for property in properties.values() {
            if let Some(found) = find_property(property, field) {
                return Some(found);
            }
        }
    }

    if let Some(items) = schema.get("items") {
        return find_property(items, field);
    }

    None
}
