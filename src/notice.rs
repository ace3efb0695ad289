//! Transient user-facing notices and the confirmation prompt used before
//! destructive actions.

use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub description: Option<String>,
    /// Label of the follow-up action offered with the notice (e.g. "Undo").
    pub action: Option<String>,
}

impl Notice {
    pub fn success(title: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Success,
            title: title.into(),
            description: None,
            action: None,
        }
    }

    pub fn failure(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Failure,
            title: title.into(),
            description: Some(description.into()),
            action: None,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_action(mut self, label: impl Into<String>) -> Self {
        self.action = Some(label.into());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.kind == NoticeKind::Failure
    }
}

pub trait NoticeSink: Send + Sync {
    fn push(&self, notice: Notice);
}

/// Writes notices to the log; used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NoticeSink for LogSink {
    fn push(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::Success => info!(title = %notice.title, "{}", notice.description.unwrap_or_default()),
            NoticeKind::Failure => warn!(title = %notice.title, "{}", notice.description.unwrap_or_default()),
        }
    }
}

/// Keeps every notice in memory so callers can render or inspect them later.
#[derive(Debug, Default)]
pub struct RecordingSink {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingSink {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<Notice> {
        self.notices().pop()
    }
}

impl NoticeSink for RecordingSink {
    fn push(&self, notice: Notice) {
        if let Ok(mut guard) = self.notices.lock() {
            guard.push(notice);
        }
    }
}

impl<T: NoticeSink + ?Sized> NoticeSink for std::sync::Arc<T> {
    fn push(&self, notice: Notice) {
        (**self).push(notice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmPrompt {
    pub title: String,
    pub description: String,
}

impl ConfirmPrompt {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

impl Default for ConfirmPrompt {
    fn default() -> Self {
        Self::new(
            "Are you sure?",
            "This action cannot be undone. This will permanently delete this item.",
        )
    }
}

/// Asks the operator before a destructive action goes through.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &ConfirmPrompt) -> bool;
}

/// Fixed answer, for scripted callers and tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&self, _prompt: &ConfirmPrompt) -> bool {
        self.0
    }
}
