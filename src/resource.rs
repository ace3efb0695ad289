//! Generic list/create/update/remove client for one backend table.
//!
//! The live schema can lag behind what callers send (columns added in code
//! before the migration lands). Writes therefore drop any field the gateway
//! reports as unknown and try again, up to [`MAX_WRITE_ATTEMPTS`] times.
//! Dropped fields are remembered so later writes skip them up front.

use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::gateway::{Filter, Gateway, GatewayError, Order, Projection, Query};
use crate::model::Record;
use crate::notice::{Confirm, ConfirmPrompt, LogSink, Notice, NoticeSink};

pub const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("too many column mismatches (dropped: {})", .dropped.join(", "))]
    TooManyMismatches { dropped: Vec<String> },
    #[error("no record with {field} = {id}")]
    NotFound { field: String, id: Value },
    #[error("undo token belongs to table {0}")]
    ForeignToken(String),
}

/// A deleted record, kept so the delete can be reverted.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoToken {
    table: String,
    record: Record,
}

impl UndoToken {
    pub fn record(&self) -> &Record {
        &self.record
    }
}

enum WriteOp {
    Insert,
    Update(Filter),
}

pub struct ResourceClient {
    gateway: Arc<dyn Gateway>,
    table: String,
    id_field: String,
    order: Option<Order>,
    projection: Projection,
    allowed: Option<BTreeSet<String>>,
    dropped: HashSet<String>,
    records: Vec<Record>,
    notices: Arc<dyn NoticeSink>,
}

impl ResourceClient {
    pub fn new(gateway: Arc<dyn Gateway>, table: impl Into<String>) -> Self {
        Self {
            gateway,
            table: table.into(),
            id_field: "id".to_string(),
            order: Some(Order {
                column: "created_at".to_string(),
                ascending: false,
            }),
            projection: Projection::All,
            allowed: None,
            dropped: HashSet::new(),
            records: Vec::new(),
            notices: Arc::new(LogSink),
        }
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    /// List in whatever order the backend returns rows.
    pub fn unordered(mut self) -> Self {
        self.order = None;
        self
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn id_field(mut self, field: &str) -> Self {
        self.id_field = field.to_string();
        self
    }

    /// Declare the columns this table is known to have; anything else is
    /// removed from payloads before they are sent.
    pub fn with_allowed_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_notices(mut self, notices: Arc<dyn NoticeSink>) -> Self {
        self.notices = notices;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Columns dropped so far because the backend did not know them.
    pub fn dropped_fields(&self) -> Vec<String> {
        let mut fields: Vec<_> = self.dropped.iter().cloned().collect();
        fields.sort();
        fields
    }

    /// Fetch the table. A missing order column drops the ordering and a
    /// projection naming a missing column falls back to `*`, each once; any
    /// other failure leaves the held records untouched.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn list(&mut self) -> Result<&[Record], ResourceError> {
        let mut query = Query::all().project(self.projection.clone());
        if let Some(order) = &self.order {
            query = query.order_by(&order.column, order.ascending);
        }
        let mut result = self.gateway.select(&self.table, &query).await;
        if let Err(err) = &result {
            let order_missing = query
                .order
                .as_ref()
                .is_some_and(|o| err.unknown_column() == Some(o.column.as_str()));
            if order_missing {
                warn!(%err, "order column does not exist; listing unordered");
                query.order = None;
                result = self.gateway.select(&self.table, &query).await;
            }
        }
        if let Err(err) = &result {
            if err.is_schema_mismatch() && query.projection != Projection::All {
                warn!(%err, "projection does not match schema; retrying with all columns");
                query = query.project(Projection::All);
                result = self.gateway.select(&self.table, &query).await;
            }
        }
        match result {
            Ok(rows) => {
                self.records = rows;
                Ok(&self.records)
            }
            Err(err) => {
                self.notices
                    .push(Notice::failure("Failed to load data", err.to_string()));
                Err(err.into())
            }
        }
    }

    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn create(&mut self, fields: Record) -> Result<(), ResourceError> {
        let result = self.write(WriteOp::Insert, fields).await;
        self.finish(result, "Created successfully", "Failed to create")
            .await
    }

    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn update(&mut self, id: &Value, mut fields: Record) -> Result<(), ResourceError> {
        fields.remove(&self.id_field);
        let filter = Filter::new().eq(&self.id_field, id.clone());
        let result = self.write(WriteOp::Update(filter), fields).await;
        self.finish(result, "Updated successfully", "Failed to update")
            .await
    }

    /// Delete after confirmation. `Ok(None)` means the operator declined.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn remove(
        &mut self,
        id: &Value,
        prompt: &ConfirmPrompt,
        confirm: &dyn Confirm,
    ) -> Result<Option<UndoToken>, ResourceError> {
        if !confirm.confirm(prompt) {
            info!(%id, "delete declined");
            return Ok(None);
        }

        let result = self.delete_held(id).await;
        match result {
            Ok(record) => {
                self.notices
                    .push(Notice::success("Deleted successfully").with_action("Undo"));
                self.relist().await;
                Ok(Some(UndoToken {
                    table: self.table.clone(),
                    record,
                }))
            }
            Err(err) => {
                self.notices
                    .push(Notice::failure("Failed to delete", err.to_string()));
                Err(err)
            }
        }
    }

    /// Re-insert a deleted record. The backend assigns it a new identifier.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn undo(&mut self, token: UndoToken) -> Result<(), ResourceError> {
        if token.table != self.table {
            return Err(ResourceError::ForeignToken(token.table));
        }
        let mut record = token.record;
        record.remove(&self.id_field);
        let result = self.write(WriteOp::Insert, record).await;
        self.finish(result, "Restored", "Failed to restore").await
    }

    async fn delete_held(&mut self, id: &Value) -> Result<Record, ResourceError> {
        let held = self
            .records
            .iter()
            .find(|r| r.get(&self.id_field) == Some(id))
            .cloned();
        let filter = Filter::new().eq(&self.id_field, id.clone());
        let record = match held {
            Some(record) => record,
            None => self
                .gateway
                .select(&self.table, &Query::all().filter(filter.clone()).limit(1))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| self.not_found(id))?,
        };
        if self.gateway.delete(&self.table, &filter).await? == 0 {
            return Err(self.not_found(id));
        }
        Ok(record)
    }

    fn not_found(&self, id: &Value) -> ResourceError {
        ResourceError::NotFound {
            field: self.id_field.clone(),
            id: id.clone(),
        }
    }

    fn prestrip(&self, payload: &mut Record) {
        payload.retain(|key, _| {
            let known = self.allowed.as_ref().map_or(true, |a| a.contains(key));
            let keep = known && !self.dropped.contains(key);
            if !keep {
                warn!(table = %self.table, field = %key, "omitting field not in schema");
            }
            keep
        });
    }

    async fn write(&mut self, op: WriteOp, mut payload: Record) -> Result<(), ResourceError> {
        self.prestrip(&mut payload);
        let mut dropped = Vec::new();
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let result = match &op {
                WriteOp::Insert => self
                    .gateway
                    .insert(&self.table, std::slice::from_ref(&payload))
                    .await
                    .map(|_| 1),
                WriteOp::Update(filter) => {
                    self.gateway.update(&self.table, filter, &payload).await
                }
            };
            match result {
                Ok(0) => {
                    let id = match &op {
                        WriteOp::Update(filter) => filter
                            .predicates
                            .first()
                            .map(|p| p.value.clone())
                            .unwrap_or(Value::Null),
                        WriteOp::Insert => Value::Null,
                    };
                    return Err(self.not_found(&id));
                }
                Ok(_) => return Ok(()),
                Err(GatewayError::UnknownColumn { column, .. }) if payload.contains_key(&column) => {
                    warn!(table = %self.table, %column, attempt, "dropping field unknown to backend");
                    payload.remove(&column);
                    self.dropped.insert(column.clone());
                    dropped.push(column);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ResourceError::TooManyMismatches { dropped })
    }

    async fn finish(
        &mut self,
        result: Result<(), ResourceError>,
        ok_title: &str,
        err_title: &str,
    ) -> Result<(), ResourceError> {
        match result {
            Ok(()) => {
                self.notices.push(Notice::success(ok_title));
                self.relist().await;
                Ok(())
            }
            Err(err) => {
                self.notices.push(Notice::failure(err_title, err.to_string()));
                Err(err)
            }
        }
    }

    // Failures are already reported by `list` itself.
    async fn relist(&mut self) {
        if let Err(err) = self.list().await {
            warn!(%err, "re-list after write failed");
        }
    }
}
