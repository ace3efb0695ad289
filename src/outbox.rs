use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::gateway::{Filter, Gateway, Query};
use crate::model::{from_record, Notification, NotificationStatus, Record, NOTIFICATION_QUEUE};
use crate::sender::NotificationSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub max_backoff_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_backoff_secs: 3600,
        }
    }
}

/// Exponential backoff: 5s * 2^attempt, capped (a cap <= 0 means uncapped).
pub fn backoff_secs(attempt: i64, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

async fn next_due(gateway: &dyn Gateway, now: DateTime<Utc>) -> Result<Option<Record>> {
    let pending = Filter::new().eq("status", NotificationStatus::Pending.as_str());
    let fresh = Query::all()
        .filter(pending.clone().eq("next_attempt_at", Value::Null))
        .order_by("created_at", true)
        .limit(1);
    if let Some(row) = gateway.select(NOTIFICATION_QUEUE, &fresh).await?.pop() {
        return Ok(Some(row));
    }
    let retry = Query::all()
        .filter(pending.lte("next_attempt_at", timestamp(now)))
        .order_by("next_attempt_at", true)
        .limit(1);
    Ok(gateway.select(NOTIFICATION_QUEUE, &retry).await?.pop())
}

/// Send the oldest due notification. Returns whether one was processed.
#[instrument(skip_all)]
pub async fn process_next(
    gateway: &dyn Gateway,
    sender: &dyn NotificationSender,
    policy: RetryPolicy,
) -> Result<bool> {
    let now = Utc::now();
    let Some(row) = next_due(gateway, now).await? else {
        return Ok(false);
    };
    let id = row.get("id").cloned().unwrap_or(Value::Null);
    let by_id = Filter::new().eq("id", id.clone());

    let notification: Notification = match from_record(&row) {
        Ok(n) => n,
        Err(err) => {
            warn!(%id, %err, "undecodable notification row; marking failed");
            let mut patch = Record::new();
            patch.insert("status".into(), json!(NotificationStatus::Failed.as_str()));
            patch.insert("last_error".into(), json!(err.to_string()));
            gateway.update(NOTIFICATION_QUEUE, &by_id, &patch).await?;
            return Ok(true);
        }
    };

    let mut patch = Record::new();
    match sender.send(&notification).await {
        Ok(()) => {
            patch.insert("status".into(), json!(NotificationStatus::Sent.as_str()));
            patch.insert("sent_at".into(), json!(timestamp(now)));
            info!(%id, channel = notification.channel.as_str(), "notification sent");
        }
        Err(err) => {
            let attempt = notification.attempts;
            let attempts = attempt + 1;
            patch.insert("attempts".into(), json!(attempts));
            patch.insert("last_error".into(), json!(err.to_string()));
            if err.is_permanent() || attempts >= policy.max_attempts {
                patch.insert("status".into(), json!(NotificationStatus::Failed.as_str()));
                warn!(%id, %err, attempts, "notification failed permanently");
            } else {
                let delay = backoff_secs(attempt, policy.max_backoff_secs);
                patch.insert(
                    "next_attempt_at".into(),
                    json!(timestamp(now + Duration::seconds(delay))),
                );
                warn!(%id, %err, attempts, delay, "notification failed; backoff");
            }
        }
    }
    gateway.update(NOTIFICATION_QUEUE, &by_id, &patch).await?;
    Ok(true)
}

/// Process due notifications until none are left; returns how many were handled.
pub async fn drain(
    gateway: &dyn Gateway,
    sender: &dyn NotificationSender,
    policy: RetryPolicy,
) -> Result<usize> {
    let mut processed = 0;
    while process_next(gateway, sender, policy).await? {
        processed += 1;
    }
    Ok(processed)
}
