//! Filters over failed jobs.
//!
//! A [`FailedJobCriteria`] holds at most one filter per field; filters are
//! combined with AND. The same criteria evaluates in memory through
//! [`FailedJobCriteria::matches`] and renders to a SQL `WHERE` fragment through
//! [`FailedJobCriteria::to_sql`].
//!
//! Text filters compared with `=` or `!=` whose value contains `*` are wildcard
//! matches. The `like` operator accepts `*` and `%` for any run of characters
//! and `_` for one character; it is case-insensitive.

use super::FailedJob;
use crate::error::ValidationError;
use crate::message::Timestamp;
use regex::RegexBuilder;
use std::collections::BTreeMap;
use std::str::FromStr;

#[cfg(test)]
#[path = "criteria_tests.rs"]
mod tests;

// ============================================================================
// Fields and operators
// ============================================================================

/// Filterable field of a [`FailedJob`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CriteriaField {
    Id,
    Name,
    Connection,
    Queue,
    Error,
    FailedAt,
    FirstFailedAt,
    Attempts,
}

impl CriteriaField {
    /// Column holding the field in the failed jobs table
    pub fn column(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
            Self::Connection => "connection",
            Self::Queue => "queue",
            Self::Error => "error",
            Self::FailedAt => "failed_at",
            Self::FirstFailedAt => "first_failed_at",
            Self::Attempts => "attempts",
        }
    }

    fn kind(&self) -> ValueKind {
        match self {
            Self::FailedAt | Self::FirstFailedAt => ValueKind::Time,
            Self::Attempts => ValueKind::Number,
            _ => ValueKind::Text,
        }
    }
}

impl FromStr for CriteriaField {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "id" => Self::Id,
            "name" => Self::Name,
            "connection" => Self::Connection,
            "queue" => Self::Queue,
            "error" => Self::Error,
            "failed_at" => Self::FailedAt,
            "first_failed_at" => Self::FirstFailedAt,
            "attempts" => Self::Attempts,
            _ => {
                return Err(ValidationError::InvalidFormat {
                    field: "criteria".to_string(),
                    message: format!("unknown field '{}'", s),
                })
            }
        };
        Ok(field)
    }
}

/// Comparison applied by a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl Operator {
    fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
        }
    }
}

impl FromStr for Operator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Ok(Self::Eq),
            "!=" | "<>" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "like" => Ok(Self::Like),
            other => Err(ValidationError::InvalidFormat {
                field: "criteria".to_string(),
                message: format!("unknown operator '{}'", other),
            }),
        }
    }
}

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Time,
    Number,
}

/// Operand of a filter; also the bind value of rendered SQL
#[derive(Debug, Clone, PartialEq)]
pub enum CriteriaValue {
    Text(String),
    Time(Timestamp),
    Number(i64),
}

impl From<&str> for CriteriaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CriteriaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Timestamp> for CriteriaValue {
    fn from(value: Timestamp) -> Self {
        Self::Time(value)
    }
}

impl From<i64> for CriteriaValue {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<u32> for CriteriaValue {
    fn from(value: u32) -> Self {
        Self::Number(i64::from(value))
    }
}

impl CriteriaValue {
    /// Coerce into the kind a field stores
    fn coerce(self, field: CriteriaField) -> Result<Self, ValidationError> {
        let invalid = |message: String| ValidationError::InvalidFormat {
            field: field.column().to_string(),
            message,
        };

        match (field.kind(), self) {
            (ValueKind::Text, value @ Self::Text(_)) => Ok(value),
            (ValueKind::Time, value @ Self::Time(_)) => Ok(value),
            (ValueKind::Time, Self::Number(millis)) => Ok(Self::Time(Timestamp::from_millis(millis))),
            (ValueKind::Time, Self::Text(text)) => Timestamp::from_str(&text)
                .map(Self::Time)
                .map_err(|_| invalid(format!("'{}' is not a timestamp", text))),
            (ValueKind::Number, value @ Self::Number(_)) => Ok(value),
            (ValueKind::Number, Self::Text(text)) => text
                .trim()
                .parse()
                .map(Self::Number)
                .map_err(|_| invalid(format!("'{}' is not a number", text))),
            (_, value) => Err(invalid(format!("{:?} does not apply to this field", value))),
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// One filter: operator plus operand
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub operator: Operator,
    pub value: CriteriaValue,
}

impl Filter {
    fn is_wildcard(&self) -> bool {
        matches!(self.operator, Operator::Eq | Operator::Ne)
            && self.value.as_text().is_some_and(|text| text.contains('*'))
    }
}

// ============================================================================
// Criteria
// ============================================================================

/// AND-combined filters, one per field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailedJobCriteria {
    filters: BTreeMap<CriteriaField, Filter>,
}

impl FailedJobCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter of `field`, replacing any previous one
    pub fn filter(
        mut self,
        field: CriteriaField,
        operator: Operator,
        value: impl Into<CriteriaValue>,
    ) -> Result<Self, ValidationError> {
        if operator == Operator::Like && field.kind() != ValueKind::Text {
            return Err(ValidationError::InvalidFormat {
                field: field.column().to_string(),
                message: "'like' only applies to text fields".to_string(),
            });
        }

        let value = value.into().coerce(field)?;
        self.filters.insert(field, Filter { operator, value });
        Ok(self)
    }

    /// Parse a `field operator value` triple, e.g. from a command line
    pub fn parse(self, field: &str, operator: &str, value: &str) -> Result<Self, ValidationError> {
        self.filter(field.parse()?, operator.parse()?, value)
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        self.text(CriteriaField::Id, id.into())
    }

    /// Match the job name; `*` acts as a wildcard
    pub fn name(self, name: impl Into<String>) -> Self {
        self.text(CriteriaField::Name, name.into())
    }

    pub fn connection(self, connection: impl Into<String>) -> Self {
        self.text(CriteriaField::Connection, connection.into())
    }

    pub fn queue(self, queue: impl Into<String>) -> Self {
        self.text(CriteriaField::Queue, queue.into())
    }

    /// Case-insensitive match on the error text
    pub fn error_like(mut self, pattern: impl Into<String>) -> Self {
        self.filters.insert(
            CriteriaField::Error,
            Filter {
                operator: Operator::Like,
                value: CriteriaValue::Text(pattern.into()),
            },
        );
        self
    }

    /// Jobs whose last failure happened strictly before `time`
    pub fn failed_before(mut self, time: Timestamp) -> Self {
        self.filters.insert(
            CriteriaField::FailedAt,
            Filter {
                operator: Operator::Lt,
                value: CriteriaValue::Time(time),
            },
        );
        self
    }

    pub fn min_attempts(mut self, attempts: u32) -> Self {
        self.filters.insert(
            CriteriaField::Attempts,
            Filter {
                operator: Operator::Ge,
                value: attempts.into(),
            },
        );
        self
    }

    fn text(mut self, field: CriteriaField, value: String) -> Self {
        self.filters.insert(
            field,
            Filter {
                operator: Operator::Eq,
                value: CriteriaValue::Text(value),
            },
        );
        self
    }

    pub fn get(&self, field: CriteriaField) -> Option<&Filter> {
        self.filters.get(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Evaluate against a job in memory
    pub fn matches(&self, job: &FailedJob) -> bool {
        self.filters
            .iter()
            .all(|(field, filter)| filter_matches(filter, &field_value(job, *field)))
    }

    /// Render a `WHERE` fragment with `?` placeholders and its bind values
    pub fn to_sql(&self) -> (String, Vec<CriteriaValue>) {
        if self.filters.is_empty() {
            return ("1 = 1".to_string(), Vec::new());
        }

        let mut clauses = Vec::with_capacity(self.filters.len());
        let mut binds = Vec::with_capacity(self.filters.len());

        for (field, filter) in &self.filters {
            let column = field.column();
            match (&filter.value, filter.is_wildcard(), filter.operator) {
                (CriteriaValue::Text(text), true, operator) => {
                    let negate = if operator == Operator::Ne { "NOT " } else { "" };
                    clauses.push(format!("{} {}LIKE ?", column, negate));
                    binds.push(CriteriaValue::Text(text.replace('*', "%")));
                }
                (CriteriaValue::Text(text), false, Operator::Like) => {
                    clauses.push(format!("{} LIKE ?", column));
                    binds.push(CriteriaValue::Text(text.replace('*', "%")));
                }
                (value, _, operator) => {
                    clauses.push(format!("{} {} ?", column, operator.sql()));
                    binds.push(value.clone());
                }
            }
        }

        (clauses.join(" AND "), binds)
    }
}

fn field_value(job: &FailedJob, field: CriteriaField) -> CriteriaValue {
    match field {
        CriteriaField::Id => CriteriaValue::Text(job.id.to_string()),
        CriteriaField::Name => CriteriaValue::Text(job.name.clone()),
        CriteriaField::Connection => CriteriaValue::Text(job.connection.clone()),
        CriteriaField::Queue => CriteriaValue::Text(job.queue.clone()),
        CriteriaField::Error => CriteriaValue::Text(job.error.clone()),
        CriteriaField::FailedAt => CriteriaValue::Time(job.failed_at),
        CriteriaField::FirstFailedAt => CriteriaValue::Time(job.first_failed_at),
        CriteriaField::Attempts => CriteriaValue::Number(i64::from(job.attempts)),
    }
}

fn filter_matches(filter: &Filter, actual: &CriteriaValue) -> bool {
    if filter.is_wildcard() || filter.operator == Operator::Like {
        let (Some(pattern), Some(text)) = (filter.value.as_text(), actual.as_text()) else {
            return false;
        };
        let matched = like(pattern, text);
        return if filter.operator == Operator::Ne { !matched } else { matched };
    }

    let ordering = match (actual, &filter.value) {
        (CriteriaValue::Text(a), CriteriaValue::Text(b)) => a.cmp(b),
        (CriteriaValue::Time(a), CriteriaValue::Time(b)) => a.as_millis().cmp(&b.as_millis()),
        (CriteriaValue::Number(a), CriteriaValue::Number(b)) => a.cmp(b),
        _ => return false,
    };

    match filter.operator {
        Operator::Eq => ordering.is_eq(),
        Operator::Ne => ordering.is_ne(),
        Operator::Lt => ordering.is_lt(),
        Operator::Le => ordering.is_le(),
        Operator::Gt => ordering.is_gt(),
        Operator::Ge => ordering.is_ge(),
        Operator::Like => false,
    }
}

/// Case-insensitive whole-string match of a LIKE/wildcard pattern
fn like(pattern: &str, text: &str) -> bool {
    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    let mut literal = String::new();

    for c in pattern.chars() {
        let wildcard = match c {
            '*' | '%' => Some(".*"),
            '_' => Some("."),
            _ => None,
        };
        match wildcard {
            Some(token) => {
                expression.push_str(&regex::escape(&literal));
                literal.clear();
                expression.push_str(token);
            }
            None => literal.push(c),
        }
    }
    expression.push_str(&regex::escape(&literal));
    expression.push('$');

    RegexBuilder::new(&expression)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}
