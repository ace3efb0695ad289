use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A row as exchanged with the backend: column name -> JSON value.
pub type Record = Map<String, Value>;

pub const BLOOD_REQUESTS: &str = "blood_requests";
pub const BLOOD_DONORS: &str = "blood_donors";
pub const NOTIFICATION_QUEUE: &str = "notification_queue";
pub const SITE_SETTINGS: &str = "site_settings";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BloodGroup {
    #[serde(rename = "A+")]
    APos,
    #[serde(rename = "A-")]
    ANeg,
    #[serde(rename = "B+")]
    BPos,
    #[serde(rename = "B-")]
    BNeg,
    #[serde(rename = "AB+")]
    AbPos,
    #[serde(rename = "AB-")]
    AbNeg,
    #[serde(rename = "O+")]
    OPos,
    #[serde(rename = "O-")]
    ONeg,
}

impl BloodGroup {
    pub const ALL: [BloodGroup; 8] = [
        BloodGroup::APos,
        BloodGroup::ANeg,
        BloodGroup::BPos,
        BloodGroup::BNeg,
        BloodGroup::AbPos,
        BloodGroup::AbNeg,
        BloodGroup::OPos,
        BloodGroup::ONeg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BloodGroup::APos => "A+",
            BloodGroup::ANeg => "A-",
            BloodGroup::BPos => "B+",
            BloodGroup::BNeg => "B-",
            BloodGroup::AbPos => "AB+",
            BloodGroup::AbNeg => "AB-",
            BloodGroup::OPos => "O+",
            BloodGroup::ONeg => "O-",
        }
    }
}

impl fmt::Display for BloodGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BloodGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        BloodGroup::ALL
            .into_iter()
            .find(|g| g.as_str() == normalized)
            .ok_or_else(|| format!("unknown blood group '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Fulfilled,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Fulfilled => "fulfilled",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    /// `pending -> approved | rejected`, `approved -> fulfilled | cancelled`.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Approved)
                | (RequestStatus::Pending, RequestStatus::Rejected)
                | (RequestStatus::Approved, RequestStatus::Fulfilled)
                | (RequestStatus::Approved, RequestStatus::Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Rejected | RequestStatus::Fulfilled | RequestStatus::Cancelled
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    #[default]
    Normal,
    Urgent,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Normal => "normal",
            Urgency::Urgent => "urgent",
            Urgency::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodRequest {
    pub id: Value,
    pub patient_name: String,
    pub blood_group: BloodGroup,
    #[serde(default)]
    pub required_date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    pub status: RequestStatus,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub hospital: Option<String>,
    #[serde(default)]
    pub bags_needed: Option<i64>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub verified: bool,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodDonor {
    pub id: Value,
    pub full_name: String,
    pub blood_group: BloodGroup,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// `None` means the column was absent; only an explicit `false` excludes a donor.
    #[serde(default, deserialize_with = "flexible_opt_bool")]
    pub is_available: Option<bool>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub show_phone: bool,
}

impl BloodDonor {
    pub fn is_unavailable(&self) -> bool {
        self.is_available == Some(false)
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }
}

/// Donor as shown on public pages.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PublicDonor {
    pub full_name: String,
    pub blood_group: BloodGroup,
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub message: String,
    #[serde(default)]
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: i64,
}

impl Notification {
    pub fn recipient(&self) -> Option<&str> {
        match self.channel {
            Channel::Email => self.recipient_email.as_deref(),
            Channel::Sms | Channel::Push => self.recipient_phone.as_deref(),
        }
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Serialize any domain value into a backend row.
pub fn to_record<T: Serialize>(value: &T) -> Result<Record, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

pub fn from_record<T: for<'de> Deserialize<'de>>(record: &Record) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(record.clone()))
}

// SQLite has no boolean type; rows come back with 0/1 integers.
fn flexible_opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
        Some(Value::String(s)) => match s.as_str() {
            "true" | "t" | "1" => Ok(Some(true)),
            "false" | "f" | "0" => Ok(Some(false)),
            other => Err(serde::de::Error::custom(format!("invalid boolean '{}'", other))),
        },
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid boolean {}",
            other
        ))),
    }
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(flexible_opt_bool(deserializer)?.unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blood_group_parses_case_insensitively() {
        assert_eq!("ab+".parse::<BloodGroup>().unwrap(), BloodGroup::AbPos);
        assert_eq!(" O- ".parse::<BloodGroup>().unwrap(), BloodGroup::ONeg);
        assert!("C+".parse::<BloodGroup>().is_err());
    }

    #[test]
    fn status_machine_allows_only_defined_edges() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Fulfilled));
        assert!(Approved.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Fulfilled));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Fulfilled.can_transition_to(Cancelled));
        assert!(Cancelled.is_terminal());
        assert!(!Approved.is_terminal());
    }

    #[test]
    fn donor_accepts_integer_booleans() {
        let row = json!({
            "id": "d1",
            "full_name": "Rahim",
            "blood_group": "B+",
            "is_available": 0,
            "show_phone": 1
        });
        let donor: BloodDonor = serde_json::from_value(row).unwrap();
        assert!(donor.is_unavailable());
        assert!(donor.show_phone);
    }

    #[test]
    fn donor_without_availability_column_is_available() {
        let row = json!({ "id": 7, "full_name": "Nila", "blood_group": "O+" });
        let donor: BloodDonor = serde_json::from_value(row).unwrap();
        assert_eq!(donor.is_available, None);
        assert!(!donor.is_unavailable());
        assert!(!donor.show_phone);
    }

    #[test]
    fn notification_record_omits_unused_recipient() {
        let n = Notification {
            id: None,
            channel: Channel::Sms,
            recipient_phone: Some("01700000000".into()),
            recipient_email: None,
            subject: Some("s".into()),
            message: "m".into(),
            status: NotificationStatus::Pending,
            attempts: 0,
        };
        let rec = to_record(&n).unwrap();
        assert_eq!(rec["channel"], "sms");
        assert_eq!(rec["status"], "pending");
        assert!(rec.get("recipient_email").is_none());
        assert!(rec.get("id").is_none());
        assert!(rec.get("attempts").is_none());
    }
}
