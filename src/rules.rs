//! Rule engine and smart-group classification
//!
//! A [`SmartGroup`] matches a record when every one of its rules evaluates
//! true. Membership is never cached: [`classify`] recomputes it from the
//! current field values each time it runs.

use crate::proxy::ProxyRecord;
use serde::{Deserialize, Serialize};

/// Record attribute a rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    Name,
    Host,
    #[serde(alias = "scheme")]
    Protocol,
    Country,
    CountryCode,
    Status,
    Group,
    Latency,
    Score,
    Speed,
}

impl RuleField {
    pub fn is_numeric(&self) -> bool {
        matches!(self, RuleField::Latency | RuleField::Score | RuleField::Speed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Contains,
    NotContains,
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
}

impl RuleOperator {
    fn accepts(&self, field: RuleField) -> bool {
        match self {
            RuleOperator::Equals | RuleOperator::NotEquals => true,
            RuleOperator::GreaterThan | RuleOperator::LessThan => field.is_numeric(),
            RuleOperator::Contains | RuleOperator::NotContains => !field.is_numeric(),
        }
    }
}

/// Right-hand side of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Number(f64),
    Text(String),
}

impl RuleValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            RuleValue::Number(n) => Some(*n),
            RuleValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
        .filter(|n| n.is_finite())
    }

    fn as_text(&self) -> String {
        match self {
            RuleValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            RuleValue::Number(n) => n.to_string(),
            RuleValue::Text(s) => s.to_lowercase(),
        }
    }
}

impl From<f64> for RuleValue {
    fn from(n: f64) -> Self {
        RuleValue::Number(n)
    }
}

impl From<&str> for RuleValue {
    fn from(s: &str) -> Self {
        RuleValue::Text(s.to_string())
    }
}

/// A single predicate over a record field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub field: RuleField,
    pub operator: RuleOperator,
    pub value: RuleValue,
}

impl Rule {
    pub fn new(field: RuleField, operator: RuleOperator, value: impl Into<RuleValue>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
        }
    }
}

/// Named group whose membership is derived from rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl SmartGroup {
    pub fn new(name: &str, rules: Vec<Rule>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            color: String::new(),
            rules,
        }
    }

    /// All rules hold; an empty rule list matches everything
    pub fn matches(&self, record: &ProxyRecord) -> bool {
        self.rules.iter().all(|rule| evaluate(record, rule))
    }
}

enum FieldValue {
    Number(f64),
    Text(String),
}

fn field_value(record: &ProxyRecord, field: RuleField) -> Option<FieldValue> {
    let text = |s: &str| FieldValue::Text(s.to_lowercase());
    match field {
        RuleField::Name => Some(text(&record.name)),
        RuleField::Host => Some(text(&record.host)),
        RuleField::Protocol => Some(text(&record.scheme.to_string())),
        RuleField::Country => record
            .country_name
            .as_deref()
            .or(record.country_code.as_deref())
            .map(text),
        RuleField::CountryCode => record.country_code.as_deref().map(text),
        RuleField::Status => Some(FieldValue::Text(record.status.to_string())),
        RuleField::Group => record.manual_group.as_deref().map(text),
        // The -1 sentinel is not a measurement
        RuleField::Latency => record.latency().map(|l| FieldValue::Number(l as f64)),
        RuleField::Score => Some(FieldValue::Number(f64::from(record.score))),
        RuleField::Speed => Some(FieldValue::Number(f64::from(record.speed_kbps))),
    }
}

/// Evaluate one rule against a record
///
/// Absent values, failed numeric coercion and operators that do not apply
/// to the field's type all evaluate to false.
pub fn evaluate(record: &ProxyRecord, rule: &Rule) -> bool {
    if !rule.operator.accepts(rule.field) {
        return false;
    }

    match field_value(record, rule.field) {
        None => false,
        Some(FieldValue::Number(actual)) => {
            let Some(expected) = rule.value.as_number() else {
                return false;
            };
            match rule.operator {
                RuleOperator::Equals => actual == expected,
                RuleOperator::NotEquals => actual != expected,
                RuleOperator::GreaterThan => actual > expected,
                RuleOperator::LessThan => actual < expected,
                RuleOperator::Contains | RuleOperator::NotContains => false,
            }
        }
        Some(FieldValue::Text(actual)) => {
            let expected = rule.value.as_text();
            match rule.operator {
                RuleOperator::Contains => actual.contains(expected.as_str()),
                RuleOperator::NotContains => !actual.contains(expected.as_str()),
                RuleOperator::Equals => actual == expected,
                RuleOperator::NotEquals => actual != expected,
                RuleOperator::GreaterThan | RuleOperator::LessThan => false,
            }
        }
    }
}

/// Names of every group matching the record, in group order
pub fn memberships(record: &ProxyRecord, groups: &[SmartGroup]) -> Vec<String> {
    groups
        .iter()
        .filter(|group| group.matches(record))
        .map(|group| group.name.clone())
        .collect()
}

/// Recompute `dynamic_groups` on every record from scratch
pub fn classify(records: &mut [ProxyRecord], groups: &[SmartGroup]) {
    for record in records.iter_mut() {
        record.dynamic_groups = memberships(record, groups);
    }
}
