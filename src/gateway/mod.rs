//! Remote data gateway: the table-oriented store every other module talks to.
//!
//! Two backends implement [`Gateway`]:
//! - `rest`: the hosted PostgREST-style API, used in production.
//! - `sqlite`: a local SQLite file for development and tests.
//!
//! Both classify "unknown column" failures into [`GatewayError::UnknownColumn`]
//! at the boundary so callers never parse messages themselves.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::model::Record;

pub mod rest;
pub mod sqlite;

pub use rest::RestGateway;
pub use sqlite::SqliteGateway;

/// PostgREST error code for a column missing from the schema cache.
pub const SCHEMA_CACHE_MISS: &str = "PGRST204";
/// Postgres `undefined_column`.
pub const UNDEFINED_COLUMN: &str = "42703";

static SCHEMA_CACHE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Could not find the '([^']+)' column of '([^']+)' in the schema cache")
        .expect("valid schema cache regex")
});
static PG_UNDEFINED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"column "?(?:[A-Za-z0-9_]+\.)?([A-Za-z0-9_]+)"? does not exist"#)
        .expect("valid undefined column regex")
});
static SQLITE_NO_COLUMN_NAMED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"table (\S+) has no column named (\S+)").expect("valid sqlite column regex")
});
static SQLITE_NO_SUCH_COLUMN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"no such column: (\S+)").expect("valid sqlite column regex"));
static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Could not find the '{column}' column of '{table}' in the schema cache")]
    UnknownColumn { table: String, column: String },
    #[error("{message}")]
    Api {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
    #[error("gateway unreachable: {0}")]
    Transport(String),
    #[error("invalid gateway payload: {0}")]
    Decode(String),
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
}

impl GatewayError {
    /// Build an error from a backend `{code, message}` pair, recognising the
    /// schema-mismatch shapes.
    pub fn from_api(table: &str, status: Option<u16>, code: Option<&str>, message: &str) -> Self {
        if let Some(column) = unknown_column_in(code, message) {
            return GatewayError::UnknownColumn {
                table: table.to_string(),
                column,
            };
        }
        GatewayError::Api {
            status,
            code: code.map(str::to_string),
            message: message.to_string(),
        }
    }

    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, GatewayError::UnknownColumn { .. })
    }

    pub fn unknown_column(&self) -> Option<&str> {
        match self {
            GatewayError::UnknownColumn { column, .. } => Some(column),
            _ => None,
        }
    }
}

/// Extract the offending column from a backend error, if it is a schema mismatch.
pub fn unknown_column_in(code: Option<&str>, message: &str) -> Option<String> {
    if let Some(caps) = SCHEMA_CACHE_RE.captures(message) {
        return Some(caps[1].to_string());
    }
    match code {
        Some(SCHEMA_CACHE_MISS) | Some(UNDEFINED_COLUMN) | None => {}
        Some(_) => return None,
    }
    if let Some(caps) = PG_UNDEFINED_RE.captures(message) {
        return Some(strip_qualifier(&caps[1]));
    }
    // "table <t> has no column named <c>" captures the table first.
    if let Some(caps) = SQLITE_NO_COLUMN_NAMED_RE.captures(message) {
        return Some(strip_qualifier(&caps[2]));
    }
    SQLITE_NO_SUCH_COLUMN_RE
        .captures(message)
        .map(|caps| strip_qualifier(&caps[1]))
}

fn strip_qualifier(column: &str) -> String {
    column
        .rsplit('.')
        .next()
        .unwrap_or(column)
        .trim_matches('"')
        .to_string()
}

pub fn validate_ident(name: &str) -> Result<&str, GatewayError> {
    if IDENT_RE.is_match(name) {
        Ok(name)
    } else {
        Err(GatewayError::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Lte,
    /// Value is a JSON array of candidates.
    In,
}

impl Op {
    pub fn postgrest(&self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Neq => "neq",
            Op::Lte => "lte",
            Op::In => "in",
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Neq => "<>",
            Op::Lte => "<=",
            Op::In => "IN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op: Op,
    pub value: Value,
}

/// Conjunction of predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate {
            column: column.to_string(),
            op: Op::Eq,
            value: value.into(),
        });
        self
    }

    pub fn neq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate {
            column: column.to_string(),
            op: Op::Neq,
            value: value.into(),
        });
        self
    }

    pub fn lte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate {
            column: column.to_string(),
            op: Op::Lte,
            value: value.into(),
        });
        self
    }

    pub fn any_of<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.predicates.push(Predicate {
            column: column.to_string(),
            op: Op::In,
            value: Value::Array(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Whether a record satisfies every predicate. A missing column only
    /// matches `eq null`.
    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|p| {
            let actual = match record.get(&p.column) {
                Some(actual) => actual,
                None => return p.op == Op::Eq && p.value.is_null(),
            };
            match p.op {
                Op::Eq => values_equal(actual, &p.value),
                Op::Neq => !values_equal(actual, &p.value),
                Op::Lte => compare_lte(actual, &p.value),
                Op::In => p
                    .value
                    .as_array()
                    .map_or(false, |candidates| candidates.iter().any(|c| values_equal(actual, c))),
            }
        })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Bool(x), Value::Number(y)) | (Value::Number(y), Value::Bool(x)) => {
            y.as_i64() == Some(i64::from(*x))
        }
        _ => a == b,
    }
}

fn compare_lte(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() <= y.as_f64(),
        (Value::String(x), Value::String(y)) => x <= y,
        _ => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Projection {
    #[default]
    All,
    Columns(Vec<String>),
}

impl Projection {
    pub fn columns(cols: &[&str]) -> Self {
        Projection::Columns(cols.iter().map(|c| c.to_string()).collect())
    }

    pub fn to_select(&self) -> String {
        match self {
            Projection::All => "*".to_string(),
            Projection::Columns(cols) => cols.join(","),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub projection: Projection,
    pub filter: Filter,
    pub order: Option<Order>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>, GatewayError>;

    /// Insert rows in one batch and return them as stored.
    async fn insert(&self, table: &str, rows: &[Record]) -> Result<Vec<Record>, GatewayError>;

    /// Patch matching rows; returns how many matched.
    async fn update(&self, table: &str, filter: &Filter, patch: &Record)
        -> Result<u64, GatewayError>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, GatewayError>;

    async fn upsert(
        &self,
        table: &str,
        rows: &[Record],
        on_conflict: &str,
    ) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_schema_cache_message() {
        let err = GatewayError::from_api(
            "volunteers",
            Some(400),
            Some("PGRST204"),
            "Could not find the 'ghost_field' column of 'volunteers' in the schema cache",
        );
        assert_eq!(err.unknown_column(), Some("ghost_field"));
        assert!(err.is_schema_mismatch());
        assert_eq!(
            err.to_string(),
            "Could not find the 'ghost_field' column of 'volunteers' in the schema cache"
        );
    }

    #[test]
    fn parses_postgres_undefined_column() {
        let col = unknown_column_in(
            Some("42703"),
            "column volunteers.skills does not exist",
        );
        assert_eq!(col.as_deref(), Some("skills"));
    }

    #[test]
    fn parses_sqlite_messages() {
        let col = unknown_column_in(
            None,
            "error returned from database: table donations has no column named ghost",
        );
        assert_eq!(col.as_deref(), Some("ghost"));
        let col = unknown_column_in(None, "no such column: nickname");
        assert_eq!(col.as_deref(), Some("nickname"));
    }

    #[test]
    fn other_codes_are_not_schema_mismatch() {
        let err = GatewayError::from_api(
            "donations",
            Some(403),
            Some("42501"),
            "permission denied for table donations",
        );
        assert!(!err.is_schema_mismatch());
        assert_eq!(err.to_string(), "permission denied for table donations");
    }

    #[test]
    fn filter_matches_loose_booleans() {
        let record: Record = json!({ "id": "1", "is_available": 1, "status": "pending" })
            .as_object()
            .cloned()
            .unwrap();
        assert!(Filter::new().eq("is_available", true).matches(&record));
        assert!(Filter::new().eq("status", "pending").matches(&record));
        assert!(!Filter::new().neq("status", "pending").matches(&record));
        assert!(!Filter::new().eq("missing", "x").matches(&record));
        assert!(Filter::new()
            .any_of("status", ["approved", "pending"])
            .matches(&record));
        assert!(!Filter::new().any_of("status", ["approved"]).matches(&record));
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_ident("blood_requests").is_ok());
        assert!(validate_ident("x; DROP TABLE y").is_err());
        assert!(validate_ident("1abc").is_err());
    }
}
