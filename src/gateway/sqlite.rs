//! SQLite-backed gateway for local development and tests.
//!
//! Rows are schemaless on the way in and out: statements are assembled from
//! the record's keys, so a key with no matching column fails the same way the
//! hosted backend does and surfaces as [`GatewayError::UnknownColumn`].

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::query::Query as SqlxQuery;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::instrument;

use super::{unknown_column_in, validate_ident, Filter, Gateway, GatewayError, Query};
use crate::model::Record;

pub type Pool = SqlitePool;
type Statement<'q> = SqlxQuery<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Debug, Clone)]
pub struct SqliteGateway {
    pool: Pool,
}

impl SqliteGateway {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        let normalized = prepare_sqlite_url(database_url);
        let options = SqliteConnectOptions::from_str(&normalized)
            .map_err(|e| GatewayError::Transport(e.to_string()))?
            .create_if_missing(true);
        let in_memory = normalized.starts_with("sqlite::memory");
        // Every connection to :memory: is a fresh database.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        if !in_memory {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&pool)
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
        }
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

// Backticks, not double quotes: SQLite reads an unknown "name" as a string literal.
fn quote(ident: &str) -> Result<String, GatewayError> {
    Ok(format!("`{}`", validate_ident(ident)?))
}

fn where_clause(filter: &Filter) -> Result<String, GatewayError> {
    if filter.is_empty() {
        return Ok(String::new());
    }
    let parts = filter
        .predicates
        .iter()
        .map(|p| {
            let col = quote(&p.column)?;
            Ok(match (&p.value, p.op) {
                (Value::Null, super::Op::Eq) => format!("{} IS NULL", col),
                (Value::Null, super::Op::Neq) => format!("{} IS NOT NULL", col),
                // Ordering against NULL is never true, and null values are not bound.
                (Value::Null, _) => "0".to_string(),
                (Value::Array(items), super::Op::In) if items.is_empty() => "0".to_string(),
                (Value::Array(items), super::Op::In) => {
                    format!("{} IN ({})", col, vec!["?"; items.len()].join(", "))
                }
                (_, op) => format!("{} {} ?", col, op.sql()),
            })
        })
        .collect::<Result<Vec<_>, GatewayError>>()?;
    Ok(format!(" WHERE {}", parts.join(" AND ")))
}

fn bind_value<'q>(stmt: Statement<'q>, value: &Value) -> Statement<'q> {
    match value {
        Value::Null => stmt.bind(Option::<String>::None),
        Value::Bool(b) => stmt.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => stmt.bind(i),
            None => stmt.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => stmt.bind(s.clone()),
        other => stmt.bind(other.to_string()),
    }
}

fn bind_filter<'q>(mut stmt: Statement<'q>, filter: &Filter) -> Statement<'q> {
    for p in filter.predicates.iter().filter(|p| !p.value.is_null()) {
        match (&p.value, p.op) {
            (Value::Array(items), super::Op::In) => {
                for item in items {
                    stmt = bind_value(stmt, item);
                }
            }
            (value, _) => stmt = bind_value(stmt, value),
        }
    }
    stmt
}

fn row_to_record(row: &SqliteRow) -> Result<Record, sqlx::Error> {
    let mut record = Record::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => {
                    Value::from(row.try_get_unchecked::<i64, _>(i)?)
                }
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                    Number::from_f64(row.try_get_unchecked::<f64, _>(i)?)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
                "BLOB" => Value::Null,
                _ => Value::String(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn map_sqlx(table: &str, err: sqlx::Error) -> GatewayError {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match unknown_column_in(None, &message) {
                Some(column) => GatewayError::UnknownColumn {
                    table: table.to_string(),
                    column,
                },
                None => GatewayError::Api {
                    status: None,
                    code: db.code().map(|c| c.into_owned()),
                    message,
                },
            }
        }
        sqlx::Error::Io(e) => GatewayError::Transport(e.to_string()),
        other @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) => {
            GatewayError::Transport(other.to_string())
        }
        other => GatewayError::Decode(other.to_string()),
    }
}

fn with_id(row: &Record) -> Record {
    let mut row = row.clone();
    if row.get("id").map_or(true, Value::is_null) {
        row.insert(
            "id".to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
    }
    row
}

#[async_trait]
impl Gateway for SqliteGateway {
    #[instrument(skip_all, fields(table = %table))]
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>, GatewayError> {
        let columns = match &query.projection {
            super::Projection::All => "*".to_string(),
            super::Projection::Columns(cols) => cols
                .iter()
                .map(|c| quote(c))
                .collect::<Result<Vec<_>, _>>()?
                .join(", "),
        };
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            columns,
            quote(table)?,
            where_clause(&query.filter)?
        );
        if let Some(order) = &query.order {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                quote(&order.column)?,
                if order.ascending { "ASC" } else { "DESC" }
            ));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = bind_filter(sqlx::query(&sql), &query.filter)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx(table, e))?;
        rows.iter()
            .map(|r| row_to_record(r).map_err(|e| map_sqlx(table, e)))
            .collect()
    }

    #[instrument(skip_all, fields(table = %table, rows = rows.len()))]
    async fn insert(&self, table: &str, rows: &[Record]) -> Result<Vec<Record>, GatewayError> {
        let table_sql = quote(table)?;
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx(table, e))?;
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let row = with_id(row);
            let columns = row
                .keys()
                .map(|k| quote(k))
                .collect::<Result<Vec<_>, _>>()?;
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                table_sql,
                columns.join(", "),
                placeholders
            );
            let mut stmt = sqlx::query(&sql);
            for value in row.values() {
                stmt = bind_value(stmt, value);
            }
            let rec = stmt
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx(table, e))?;
            stored.push(row_to_record(&rec).map_err(|e| map_sqlx(table, e))?);
        }
        tx.commit().await.map_err(|e| map_sqlx(table, e))?;
        Ok(stored)
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        patch: &Record,
    ) -> Result<u64, GatewayError> {
        if filter.is_empty() {
            return Err(GatewayError::Api {
                status: None,
                code: None,
                message: "UPDATE requires a filter".to_string(),
            });
        }
        if patch.is_empty() {
            let sql = format!(
                "SELECT COUNT(*) FROM {}{}",
                quote(table)?,
                where_clause(filter)?
            );
            let count: i64 = bind_filter(sqlx::query(&sql), filter)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx(table, e))?
                .try_get(0)
                .map_err(|e| map_sqlx(table, e))?;
            return Ok(count as u64);
        }

        let assignments = patch
            .keys()
            .map(|k| Ok(format!("{} = ?", quote(k)?)))
            .collect::<Result<Vec<_>, GatewayError>>()?;
        let sql = format!(
            "UPDATE {} SET {}{}",
            quote(table)?,
            assignments.join(", "),
            where_clause(filter)?
        );
        let mut stmt = sqlx::query(&sql);
        for value in patch.values() {
            stmt = bind_value(stmt, value);
        }
        let result = bind_filter(stmt, filter)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(table, e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, GatewayError> {
        if filter.is_empty() {
            return Err(GatewayError::Api {
                status: None,
                code: None,
                message: "DELETE requires a filter".to_string(),
            });
        }
        let sql = format!("DELETE FROM {}{}", quote(table)?, where_clause(filter)?);
        let result = bind_filter(sqlx::query(&sql), filter)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(table, e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn upsert(
        &self,
        table: &str,
        rows: &[Record],
        on_conflict: &str,
    ) -> Result<(), GatewayError> {
        let table_sql = quote(table)?;
        let conflict_sql = quote(on_conflict)?;
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx(table, e))?;
        for row in rows {
            let row = with_id(row);
            let columns = row
                .keys()
                .map(|k| quote(k))
                .collect::<Result<Vec<_>, _>>()?;
            let updates = row
                .keys()
                .filter(|k| k.as_str() != on_conflict && k.as_str() != "id")
                .map(|k| {
                    let col = quote(k)?;
                    Ok(format!("{} = excluded.{}", col, col))
                })
                .collect::<Result<Vec<_>, GatewayError>>()?;
            let action = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
                table_sql,
                columns.join(", "),
                vec!["?"; columns.len()].join(", "),
                conflict_sql,
                action
            );
            let mut stmt = sqlx::query(&sql);
            for value in row.values() {
                stmt = bind_value(stmt, value);
            }
            stmt.execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx(table, e))?;
        }
        tx.commit().await.map_err(|e| map_sqlx(table, e))?;
        Ok(())
    }
}
