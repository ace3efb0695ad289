use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Channel, Notification};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no {0} provider configured")]
    NotConfigured(&'static str),
    #[error("notification has no recipient")]
    NoRecipient,
    #[error("provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("provider unreachable: {0}")]
    Transport(String),
}

impl SendError {
    /// Retrying will not help.
    pub fn is_permanent(&self) -> bool {
        match self {
            SendError::NoRecipient => true,
            SendError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            SendError::NotConfigured(_) | SendError::Transport(_) => false,
        }
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), SendError>;
}

/// Sends email through an HTTP email API (`POST {api_url}/emails`).
#[derive(Clone)]
pub struct EmailApiSender {
    http: Client,
    api_url: Url,
    api_key: String,
    from: String,
}

impl fmt::Debug for EmailApiSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailApiSender")
            .field("api_url", &self.api_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl EmailApiSender {
    pub fn new(mut api_url: Url, api_key: String, from: String) -> Result<Self, SendError> {
        // `join` replaces the last segment unless the base ends with a slash.
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("ngo-desk/0.1")
            .build()
            .map_err(|e| SendError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_url,
            api_key,
            from,
        })
    }

    pub fn build_request(&self, notification: &Notification) -> Result<reqwest::Request, SendError> {
        let to = notification
            .recipient_email
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or(SendError::NoRecipient)?;
        let endpoint = self
            .api_url
            .join("emails")
            .map_err(|e| SendError::Transport(format!("invalid email API URL: {}", e)))?;
        let body = json!({
            "from": self.from,
            "to": [to],
            "subject": notification.subject.as_deref().unwrap_or("Notification"),
            "text": notification.message,
        });
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .build()
            .map_err(|e| SendError::Transport(format!("failed to build email request: {}", e)))
    }
}

#[async_trait]
impl NotificationSender for EmailApiSender {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        let request = self.build_request(notification)?;
        debug!(url=%request.url(), "sending email");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(SendError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Writes the message to the log instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        let recipient = notification.recipient().ok_or(SendError::NoRecipient)?;
        info!(
            channel = notification.channel.as_str(),
            recipient,
            subject = notification.subject.as_deref().unwrap_or(""),
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Picks a sender by channel.
#[derive(Default, Clone)]
pub struct ChannelRouter {
    pub email: Option<Arc<dyn NotificationSender>>,
    pub sms: Option<Arc<dyn NotificationSender>>,
    pub push: Option<Arc<dyn NotificationSender>>,
}

#[async_trait]
impl NotificationSender for ChannelRouter {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        let sender = match notification.channel {
            Channel::Email => self.email.as_ref(),
            Channel::Sms => self.sms.as_ref(),
            Channel::Push => self.push.as_ref(),
        };
        match sender {
            Some(sender) => sender.send(notification).await,
            None => Err(SendError::NotConfigured(notification.channel.as_str())),
        }
    }
}
