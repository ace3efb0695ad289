//! Site settings (copy, theme colors, fonts, payment instructions).
//!
//! The `site_settings` table is a loose key/value store whose rows have been
//! written by several generations of the admin console: the key may sit in
//! `key`, `setting_key` or `name`, values may be JSON-encoded or raw, and some
//! keys have older spellings. All of that is resolved here, once, into a
//! typed [`SiteSettings`].

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

use crate::gateway::{Gateway, GatewayError, Query};
use crate::model::{Record, SITE_SETTINGS};

pub const SETTINGS_VERSION: u32 = 2;

const KEY_COLUMNS: [&str; 3] = ["key", "setting_key", "name"];
const VALUE_COLUMNS: [&str; 2] = ["value", "setting_value"];

static HEX_COLOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").expect("valid color regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteSettings {
    pub version: u32,
    pub site_name: String,
    pub tagline: Option<String>,
    pub primary_color: String,
    pub secondary_color: String,
    pub font_family: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub payment_instructions: Option<String>,
    /// Keys this version does not model, kept verbatim.
    pub extra: BTreeMap<String, String>,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            site_name: "Our Foundation".to_string(),
            tagline: None,
            primary_color: "#16a34a".to_string(),
            secondary_color: "#0f172a".to_string(),
            font_family: "Inter".to_string(),
            contact_email: None,
            contact_phone: None,
            payment_instructions: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Canonical name for a settings key, folding older spellings.
pub fn canonical_key(key: &str) -> String {
    let key = key.trim();
    let snake = to_snake(key);
    match snake.as_str() {
        "site_title" | "org_name" | "organization_name" => "site_name".to_string(),
        "hero_subtitle" | "site_tagline" => "tagline".to_string(),
        "theme_primary" | "brand_color" => "primary_color".to_string(),
        "theme_secondary" => "secondary_color".to_string(),
        "font" | "theme_font" => "font_family".to_string(),
        "email" => "contact_email".to_string(),
        "phone" => "contact_phone".to_string(),
        "payment_info" | "bank_details" => "payment_instructions".to_string(),
        "settings_version" => "version".to_string(),
        _ => snake,
    }
}

fn to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else if ch == '-' || ch == ' ' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    out
}

/// Plain-string form of a stored value. JSON-encoded strings are decoded and
/// stray wrapping quotes removed; `None` for null.
pub fn normalize_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
                match serde_json::from_str::<String>(trimmed) {
                    Ok(inner) => Some(inner),
                    Err(_) => Some(trimmed[1..trimmed.len() - 1].to_string()),
                }
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn first_present<'a>(row: &'a Record, columns: &[&str]) -> Option<&'a Value> {
    columns
        .iter()
        .filter_map(|c| row.get(*c))
        .find(|v| !v.is_null())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl SiteSettings {
    /// Build settings from raw rows. Later rows win for duplicate keys.
    pub fn from_rows(rows: &[Record]) -> Self {
        let mut settings = SiteSettings::default();
        for row in rows {
            let Some(key) = first_present(row, &KEY_COLUMNS).and_then(|k| k.as_str()) else {
                debug!(?row, "settings row without a key column");
                continue;
            };
            let Some(value) = first_present(row, &VALUE_COLUMNS).and_then(normalize_value) else {
                continue;
            };
            settings.set(key, value);
        }
        settings
    }

    pub fn set(&mut self, key: &str, value: String) {
        match canonical_key(key).as_str() {
            "version" => match value.parse() {
                Ok(v) => self.version = v,
                Err(_) => warn!(%value, "ignoring non-numeric settings version"),
            },
            "site_name" => {
                if !value.is_empty() {
                    self.site_name = value;
                }
            }
            "tagline" => self.tagline = non_empty(value),
            "primary_color" => set_color(&mut self.primary_color, "primary_color", value),
            "secondary_color" => set_color(&mut self.secondary_color, "secondary_color", value),
            "font_family" => {
                if !value.is_empty() {
                    self.font_family = value;
                }
            }
            "contact_email" => self.contact_email = non_empty(value),
            "contact_phone" => self.contact_phone = non_empty(value),
            "payment_instructions" => self.payment_instructions = non_empty(value),
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match canonical_key(key).as_str() {
            "version" => Some(self.version.to_string()),
            "site_name" => Some(self.site_name.clone()),
            "tagline" => self.tagline.clone(),
            "primary_color" => Some(self.primary_color.clone()),
            "secondary_color" => Some(self.secondary_color.clone()),
            "font_family" => Some(self.font_family.clone()),
            "contact_email" => self.contact_email.clone(),
            "contact_phone" => self.contact_phone.clone(),
            "payment_instructions" => self.payment_instructions.clone(),
            other => self.extra.get(other).cloned(),
        }
    }
}

fn set_color(slot: &mut String, key: &str, value: String) {
    if HEX_COLOR_RE.is_match(&value) {
        *slot = value;
    } else {
        warn!(key, %value, "ignoring invalid color");
    }
}

#[instrument(skip_all)]
pub async fn load(gateway: &dyn Gateway) -> Result<SiteSettings, GatewayError> {
    let rows = gateway.select(SITE_SETTINGS, &Query::all()).await?;
    Ok(SiteSettings::from_rows(&rows))
}

/// Write one setting under its canonical key.
#[instrument(skip_all, fields(key = %key))]
pub async fn save(gateway: &dyn Gateway, key: &str, value: &str) -> Result<(), GatewayError> {
    let key = canonical_key(key);
    let mut row = Record::new();
    row.insert("key".into(), json!(key));
    row.insert("value".into(), json!(value));
    row.insert("updated_at".into(), json!(Utc::now().to_rfc3339()));
    gateway.upsert(SITE_SETTINGS, &[row], "key").await
}
