use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, instrument, warn};

use super::{validate_ident, Filter, Gateway, GatewayError, Query};
use crate::model::Record;

/// Gateway over a PostgREST endpoint (`{base}/rest/v1/{table}`).
#[derive(Clone)]
pub struct RestGateway {
    http: Client,
    base_url: Url,
    api_key: String,
    access_token: Option<String>,
}

impl fmt::Debug for RestGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize, Default)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl RestGateway {
    pub fn new(base_url: Url, api_key: String) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .user_agent("ngo-desk/0.1")
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
            access_token: None,
        })
    }

    /// Act on behalf of a signed-in user instead of the anonymous key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn endpoint(&self, table: &str) -> Result<Url, GatewayError> {
        let table = validate_ident(table)?;
        self.base_url
            .join(&format!("rest/v1/{}", table))
            .map_err(|e| GatewayError::Transport(format!("invalid base URL: {}", e)))
    }

    pub fn build_request(
        &self,
        method: Method,
        table: &str,
        params: &[(String, String)],
        body: Option<&Value>,
        prefer: Option<&str>,
    ) -> Result<reqwest::Request, GatewayError> {
        let mut url = self.endpoint(table)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        let mut builder = self
            .http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", bearer))
            .header("Accept", "application/json");
        if let Some(prefer) = prefer {
            builder = builder.header("Prefer", prefer);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build request: {}", e)))
    }

    async fn execute(&self, table: &str, request: reqwest::Request) -> Result<Value, GatewayError> {
        debug!(method=%request.method(), url=%request.url(), "sending gateway request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(table, "rate limited by gateway");
        }
        if !status.is_success() {
            let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
            let message = body.message.unwrap_or_else(|| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    text.clone()
                }
            });
            return Err(GatewayError::from_api(
                table,
                Some(status.as_u16()),
                body.code.as_deref(),
                &message,
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

/// Query-string encoding of a filter, e.g. `status=eq.pending`.
pub fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    filter
        .predicates
        .iter()
        .map(|p| {
            let rhs = match (&p.value, p.op) {
                (Value::Null, super::Op::Eq) => "is.null".to_string(),
                (Value::Null, super::Op::Neq) => "not.is.null".to_string(),
                (Value::Array(items), super::Op::In) => {
                    let items: Vec<String> = items
                        .iter()
                        .map(|v| match v {
                            Value::String(s) => format!("\"{}\"", s),
                            other => other.to_string(),
                        })
                        .collect();
                    format!("in.({})", items.join(","))
                }
                (Value::String(s), op) => format!("{}.{}", op.postgrest(), s),
                (other, op) => format!("{}.{}", op.postgrest(), other),
            };
            (p.column.clone(), rhs)
        })
        .collect()
}

pub fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), query.projection.to_select())];
    params.extend(filter_params(&query.filter));
    if let Some(order) = &query.order {
        let dir = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", order.column, dir)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

fn into_rows(value: Value) -> Result<Vec<Record>, GatewayError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(GatewayError::Decode(format!("expected row object, got {}", other))),
            })
            .collect(),
        Value::Object(map) => Ok(vec![map]),
        other => Err(GatewayError::Decode(format!("expected row array, got {}", other))),
    }
}

#[async_trait]
impl Gateway for RestGateway {
    #[instrument(skip_all, fields(table = %table))]
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>, GatewayError> {
        let request = self.build_request(Method::GET, table, &query_params(query), None, None)?;
        into_rows(self.execute(table, request).await?)
    }

    #[instrument(skip_all, fields(table = %table, rows = rows.len()))]
    async fn insert(&self, table: &str, rows: &[Record]) -> Result<Vec<Record>, GatewayError> {
        let body = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        let request = self.build_request(
            Method::POST,
            table,
            &[],
            Some(&body),
            Some("return=representation"),
        )?;
        into_rows(self.execute(table, request).await?)
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        patch: &Record,
    ) -> Result<u64, GatewayError> {
        let body = Value::Object(patch.clone());
        let request = self.build_request(
            Method::PATCH,
            table,
            &filter_params(filter),
            Some(&body),
            Some("return=representation"),
        )?;
        Ok(into_rows(self.execute(table, request).await?)?.len() as u64)
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, GatewayError> {
        let request = self.build_request(
            Method::DELETE,
            table,
            &filter_params(filter),
            None,
            Some("return=representation"),
        )?;
        Ok(into_rows(self.execute(table, request).await?)?.len() as u64)
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn upsert(
        &self,
        table: &str,
        rows: &[Record],
        on_conflict: &str,
    ) -> Result<(), GatewayError> {
        let on_conflict = validate_ident(on_conflict)?;
        let body = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        let request = self.build_request(
            Method::POST,
            table,
            &[("on_conflict".to_string(), on_conflict.to_string())],
            Some(&body),
            Some("resolution=merge-duplicates,return=minimal"),
        )?;
        self.execute(table, request).await?;
        Ok(())
    }
}
