#![allow(dead_code)]

use async_trait::async_trait;
use ngo_desk::gateway::{Filter, Gateway, GatewayError, Projection, Query};
use ngo_desk::model::{Notification, Record};
use ngo_desk::sender::{NotificationSender, SendError};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Select(String),
    Insert(String, usize),
    Update(String, Record),
    Delete(String),
    Upsert(String, usize),
}

/// Schema-aware in-memory backend. Writing or filtering on a column the
/// table does not declare fails with `UnknownColumn`, like the hosted API.
#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<BTreeMap<String, Vec<Record>>>,
    schemas: Mutex<BTreeMap<String, BTreeSet<String>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    next_id: AtomicU64,
}

pub const REQUEST_COLUMNS: &[&str] = &[
    "id",
    "patient_name",
    "blood_group",
    "required_date",
    "location",
    "contact",
    "status",
    "urgency",
    "hospital",
    "bags_needed",
    "verified",
    "verified_at",
    "requested_by",
    "created_at",
];

pub const DONOR_COLUMNS: &[&str] = &[
    "id",
    "full_name",
    "blood_group",
    "phone",
    "email",
    "location",
    "is_available",
    "show_phone",
    "created_at",
];

pub const NOTIFICATION_COLUMNS: &[&str] = &[
    "id",
    "channel",
    "recipient_phone",
    "recipient_email",
    "subject",
    "message",
    "status",
    "attempts",
    "next_attempt_at",
    "last_error",
    "sent_at",
    "created_at",
];

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway with the blood workflow tables declared.
    pub fn blood() -> Self {
        Self::new()
            .with_table("blood_requests", REQUEST_COLUMNS)
            .with_table("blood_donors", DONOR_COLUMNS)
            .with_table("notification_queue", NOTIFICATION_COLUMNS)
    }

    pub fn with_table(self, table: &str, columns: &[&str]) -> Self {
        self.schemas.lock().unwrap().insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default();
        self
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Value::Object(map) = row {
                stored.push(map);
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every later call on `table` fails with a 503.
    pub fn fail_table(&self, table: &str) {
        self.failing.lock().unwrap().insert(table.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn inserts_into(&self, table: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Insert(t, _) if t == table))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn guard<'a, I>(&self, table: &str, columns: I) -> Result<(), GatewayError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        if self.failing.lock().unwrap().contains(table) {
            return Err(GatewayError::Api {
                status: Some(503),
                code: None,
                message: format!("{} is unavailable", table),
            });
        }
        let schemas = self.schemas.lock().unwrap();
        let Some(known) = schemas.get(table) else {
            return Ok(());
        };
        match columns.into_iter().find(|c| !known.contains(*c)) {
            Some(column) => Err(GatewayError::UnknownColumn {
                table: table.to_string(),
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }

    fn assign_id(&self, row: &mut Record) {
        if row.get("id").map_or(true, Value::is_null) {
            let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            row.insert("id".into(), Value::String(format!("mem-{}", id)));
        }
    }
}

fn filter_columns(filter: &Filter) -> Vec<String> {
    filter.predicates.iter().map(|p| p.column.clone()).collect()
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>, GatewayError> {
        self.record(Call::Select(table.to_string()));
        let mut columns = filter_columns(&query.filter);
        if let Projection::Columns(cols) = &query.projection {
            columns.extend(cols.iter().cloned());
        }
        if let Some(order) = &query.order {
            columns.push(order.column.clone());
        }
        self.guard(table, &columns)?;

        let mut rows: Vec<Record> = self
            .rows(table)
            .into_iter()
            .filter(|r| query.filter.matches(r))
            .collect();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit as usize);
        }
        if let Projection::Columns(cols) = &query.projection {
            rows = rows
                .into_iter()
                .map(|r| r.into_iter().filter(|(k, _)| cols.contains(k)).collect())
                .collect();
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: &[Record]) -> Result<Vec<Record>, GatewayError> {
        self.record(Call::Insert(table.to_string(), rows.len()));
        for row in rows {
            self.guard(table, row.keys())?;
        }
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = row.clone();
            self.assign_id(&mut row);
            stored.push(row);
        }
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        patch: &Record,
    ) -> Result<u64, GatewayError> {
        self.record(Call::Update(table.to_string(), patch.clone()));
        let mut columns = filter_columns(filter);
        columns.extend(patch.keys().cloned());
        self.guard(table, &columns)?;

        let mut tables = self.tables.lock().unwrap();
        let mut matched = 0;
        for row in tables.entry(table.to_string()).or_default().iter_mut() {
            if filter.matches(row) {
                for (k, v) in patch {
                    row.insert(k.clone(), v.clone());
                }
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, GatewayError> {
        self.record(Call::Delete(table.to_string()));
        self.guard(table, &filter_columns(filter))?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        let before = rows.len();
        rows.retain(|r| !filter.matches(r));
        Ok((before - rows.len()) as u64)
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Record],
        on_conflict: &str,
    ) -> Result<(), GatewayError> {
        self.record(Call::Upsert(table.to_string(), rows.len()));
        for row in rows {
            self.guard(table, row.keys())?;
        }
        for row in rows {
            let key = row.get(on_conflict).cloned().unwrap_or(Value::Null);
            let mut tables = self.tables.lock().unwrap();
            let stored = tables.entry(table.to_string()).or_default();
            match stored.iter_mut().find(|r| r.get(on_conflict) == Some(&key)) {
                Some(existing) => {
                    for (k, v) in row {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                None => {
                    let mut row = row.clone();
                    self.assign_id(&mut row);
                    stored.push(row);
                }
            }
        }
        Ok(())
    }
}

/// Sender that records what it was asked to deliver and replays scripted results.
#[derive(Default)]
pub struct RecordingSender {
    results: Mutex<VecDeque<Result<(), SendError>>>,
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSender {
    pub fn with_results(results: Vec<Result<(), SendError>>) -> Self {
        Self {
            results: Mutex::new(VecDeque::from(results)),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(notification.clone());
        self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}
