//! Blood request approval and donor matching.
//!
//! Requests move `pending -> approved | rejected` and `approved -> fulfilled |
//! cancelled`. Every transition is a conditional update on the current status,
//! so two operators acting on the same request cannot silently overwrite each
//! other. Approval fans out one notification per matching donor; that fan-out
//! is best-effort and never undoes the approval.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::gateway::{Filter, Gateway, GatewayError, Query};
use crate::model::{
    from_record, to_record, BloodDonor, BloodGroup, BloodRequest, Channel, Notification,
    NotificationStatus, PublicDonor, Record, RequestStatus, Urgency, BLOOD_DONORS, BLOOD_REQUESTS,
    NOTIFICATION_QUEUE,
};
use crate::notice::{LogSink, Notice, NoticeSink};

#[derive(Debug, Error)]
pub enum BloodError {
    #[error("Please sign in to submit a blood request")]
    AuthRequired,
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("cannot move a {from} request to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("request {0} was changed by someone else; reload and try again")]
    Conflict(Value),
    #[error("no record with id {0}")]
    NotFound(Value),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("invalid row: {0}")]
    Decode(#[from] serde_json::Error),
}

use BloodGroup::*;

/// Donor groups that can give to a recipient of `recipient`.
pub fn compatible_donor_groups(recipient: BloodGroup) -> &'static [BloodGroup] {
    match recipient {
        APos => &[APos, ANeg, OPos, ONeg],
        ANeg => &[ANeg, ONeg],
        BPos => &[BPos, BNeg, OPos, ONeg],
        BNeg => &[BNeg, ONeg],
        AbPos => &[APos, ANeg, BPos, BNeg, AbPos, AbNeg, OPos, ONeg],
        AbNeg => &[ANeg, BNeg, AbNeg, ONeg],
        OPos => &[OPos, ONeg],
        ONeg => &[ONeg],
    }
}

pub fn can_donate(donor: BloodGroup, recipient: BloodGroup) -> bool {
    compatible_donor_groups(recipient).contains(&donor)
}

/// Compatible donors not explicitly marked unavailable.
pub fn matching_donors<'a>(request: &BloodRequest, donors: &'a [BloodDonor]) -> Vec<&'a BloodDonor> {
    donors
        .iter()
        .filter(|d| can_donate(d.blood_group, request.blood_group) && !d.is_unavailable())
        .collect()
}

/// Donors safe to show publicly: unavailable donors are dropped and phone
/// numbers are hidden unless the donor opted in.
pub fn public_donors(donors: &[BloodDonor]) -> Vec<PublicDonor> {
    donors
        .iter()
        .filter(|d| !d.is_unavailable())
        .map(|d| PublicDonor {
            full_name: d.full_name.clone(),
            blood_group: d.blood_group,
            location: d.location.clone(),
            phone: if d.show_phone {
                d.phone().map(str::to_string)
            } else {
                None
            },
        })
        .collect()
}

fn or<'a>(value: &'a Option<String>, fallback: &'a str) -> &'a str {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
}

/// The message sent to one donor about an approved request.
pub fn donor_notification(donor: &BloodDonor, request: &BloodRequest) -> Notification {
    let message = format!(
        "Dear {}, a patient needs {} blood at {}, {}. Please contact {} if you can donate.",
        donor.full_name,
        request.blood_group,
        or(&request.hospital, "the hospital"),
        or(&request.location, "location not given"),
        or(&request.contact, "the coordinator"),
    );
    let (channel, recipient_phone, recipient_email) = match donor.phone() {
        Some(phone) => (Channel::Sms, Some(phone.to_string()), None),
        None => (Channel::Email, None, donor.email.clone()),
    };
    Notification {
        id: None,
        channel,
        recipient_phone,
        recipient_email,
        subject: Some(format!("Urgent: {} blood needed", request.blood_group)),
        message,
        status: NotificationStatus::Pending,
        attempts: 0,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BloodRequestForm {
    #[serde(default)]
    pub patient_name: String,
    #[serde(default)]
    pub blood_group: Option<BloodGroup>,
    #[serde(default)]
    pub required_date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub hospital: Option<String>,
    #[serde(default)]
    pub bags_needed: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DonorForm {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub blood_group: Option<BloodGroup>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub show_phone: bool,
}

/// The signed-in user submitting a form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalReport {
    pub request_id: Value,
    /// Compatible available donors found for the request.
    pub matched: usize,
    /// Notifications actually queued.
    pub notified: usize,
    /// Set when the approval stood but the donor fan-out did not go through.
    pub enqueue_error: Option<String>,
}

impl ApprovalReport {
    pub fn summary(&self) -> String {
        if self.enqueue_error.is_some() {
            "approved, donor notifications could not be queued".to_string()
        } else if self.notified == 0 {
            "approved, no matching donors found".to_string()
        } else {
            format!("approved, {} donors notified", self.notified)
        }
    }
}

pub struct BloodDesk {
    gateway: Arc<dyn Gateway>,
    notices: Arc<dyn NoticeSink>,
    admin_email: String,
}

impl BloodDesk {
    pub fn new(gateway: Arc<dyn Gateway>, admin_email: impl Into<String>) -> Self {
        Self {
            gateway,
            notices: Arc::new(LogSink),
            admin_email: admin_email.into(),
        }
    }

    pub fn with_notices(mut self, notices: Arc<dyn NoticeSink>) -> Self {
        self.notices = notices;
        self
    }

    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<BloodRequest>, BloodError> {
        let mut query = Query::all().order_by("created_at", false);
        if let Some(status) = status {
            query = query.filter(Filter::new().eq("status", status.as_str()));
        }
        let rows = self.gateway.select(BLOOD_REQUESTS, &query).await?;
        rows.iter()
            .map(|r| from_record(r).map_err(BloodError::from))
            .collect()
    }

    pub async fn get_request(&self, id: &Value) -> Result<BloodRequest, BloodError> {
        let query = Query::all()
            .filter(Filter::new().eq("id", id.clone()))
            .limit(1);
        let row = self
            .gateway
            .select(BLOOD_REQUESTS, &query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BloodError::NotFound(id.clone()))?;
        Ok(from_record(&row)?)
    }

    pub async fn list_donors(&self) -> Result<Vec<BloodDonor>, BloodError> {
        let rows = self
            .gateway
            .select(BLOOD_DONORS, &Query::all().order_by("full_name", true))
            .await?;
        rows.iter()
            .map(|r| from_record(r).map_err(BloodError::from))
            .collect()
    }

    /// Donors who could serve `request`, fetched by compatible group.
    pub async fn find_matching_donors(
        &self,
        request: &BloodRequest,
    ) -> Result<Vec<BloodDonor>, BloodError> {
        let groups = compatible_donor_groups(request.blood_group)
            .iter()
            .map(|g| g.as_str());
        let query = Query::all().filter(Filter::new().any_of("blood_group", groups));
        let rows = self.gateway.select(BLOOD_DONORS, &query).await?;
        let mut donors = Vec::with_capacity(rows.len());
        for row in &rows {
            match from_record::<BloodDonor>(row) {
                Ok(donor) => donors.push(donor),
                Err(err) => {
                    let id = row.get("id").cloned().unwrap_or(Value::Null);
                    warn!(donor_id = %id, %err, "skipping undecodable donor row");
                }
            }
        }
        Ok(matching_donors(request, &donors)
            .into_iter()
            .cloned()
            .collect())
    }

    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn approve_request(
        &self,
        request: &BloodRequest,
    ) -> Result<ApprovalReport, BloodError> {
        let now = Utc::now();
        let mut patch = Record::new();
        patch.insert("verified".into(), Value::Bool(true));
        patch.insert("verified_at".into(), Value::String(now.to_rfc3339()));
        if let Err(err) = self
            .transition(request, RequestStatus::Approved, patch)
            .await
        {
            self.notices
                .push(Notice::failure("Failed to approve request", err.to_string()));
            return Err(err);
        }

        let mut report = ApprovalReport {
            request_id: request.id.clone(),
            matched: 0,
            notified: 0,
            enqueue_error: None,
        };
        if let Err(err) = self.notify_donors(request, &mut report).await {
            warn!(
                %err,
                matched = report.matched,
                "request approved but donor notifications were not queued"
            );
            report.enqueue_error = Some(err.to_string());
        }
        info!(matched = report.matched, notified = report.notified, "request approved");
        self.notices
            .push(Notice::success("Request approved").described(report.summary()));
        Ok(report)
    }

    async fn notify_donors(
        &self,
        request: &BloodRequest,
        report: &mut ApprovalReport,
    ) -> Result<(), BloodError> {
        let donors = self.find_matching_donors(request).await?;
        report.matched = donors.len();
        if donors.is_empty() {
            return Ok(());
        }
        let rows = donors
            .iter()
            .map(|d| to_record(&donor_notification(d, request)))
            .collect::<Result<Vec<_>, _>>()?;
        self.gateway.insert(NOTIFICATION_QUEUE, &rows).await?;
        report.notified = rows.len();
        Ok(())
    }

    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn reject_request(&self, request: &BloodRequest) -> Result<(), BloodError> {
        let mut patch = Record::new();
        patch.insert("verified".into(), Value::Bool(false));
        self.transition_with_notice(request, RequestStatus::Rejected, patch, "Request rejected")
            .await
    }

    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn fulfil_request(&self, request: &BloodRequest) -> Result<(), BloodError> {
        self.transition_with_notice(
            request,
            RequestStatus::Fulfilled,
            Record::new(),
            "Request marked fulfilled",
        )
        .await
    }

    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn cancel_request(&self, request: &BloodRequest) -> Result<(), BloodError> {
        self.transition_with_notice(
            request,
            RequestStatus::Cancelled,
            Record::new(),
            "Request cancelled",
        )
        .await
    }

    async fn transition_with_notice(
        &self,
        request: &BloodRequest,
        to: RequestStatus,
        patch: Record,
        title: &str,
    ) -> Result<(), BloodError> {
        match self.transition(request, to, patch).await {
            Ok(()) => {
                self.notices.push(Notice::success(title));
                Ok(())
            }
            Err(err) => {
                self.notices
                    .push(Notice::failure("Failed to update request", err.to_string()));
                Err(err)
            }
        }
    }

    async fn transition(
        &self,
        request: &BloodRequest,
        to: RequestStatus,
        mut patch: Record,
    ) -> Result<(), BloodError> {
        let from = request.status;
        if !from.can_transition_to(to) {
            return Err(BloodError::InvalidTransition { from, to });
        }
        patch.insert("status".into(), Value::String(to.as_str().to_string()));
        let filter = Filter::new()
            .eq("id", request.id.clone())
            .eq("status", from.as_str());
        let matched = self.gateway.update(BLOOD_REQUESTS, &filter, &patch).await?;
        if matched == 0 {
            return Err(BloodError::Conflict(request.id.clone()));
        }
        debug!(%from, %to, "request status changed");
        Ok(())
    }

    /// Submit a new request as `requester`. Returns the stored row's id.
    #[instrument(skip_all)]
    pub async fn register_request(
        &self,
        form: &BloodRequestForm,
        requester: Option<&Requester>,
    ) -> Result<Value, BloodError> {
        let result = self.insert_request(form, requester).await;
        match &result {
            Ok(_) => self.notices.push(Notice::success("Blood request submitted")),
            Err(err) => self
                .notices
                .push(Notice::failure("Failed to submit request", err.to_string())),
        }
        result
    }

    async fn insert_request(
        &self,
        form: &BloodRequestForm,
        requester: Option<&Requester>,
    ) -> Result<Value, BloodError> {
        let patient_name = form.patient_name.trim();
        if patient_name.is_empty() {
            return Err(BloodError::MissingField("patient_name"));
        }
        let blood_group = form
            .blood_group
            .ok_or(BloodError::MissingField("blood_group"))?;
        let requester = requester.ok_or(BloodError::AuthRequired)?;

        let mut row = Record::new();
        row.insert("patient_name".into(), json!(patient_name));
        row.insert("blood_group".into(), json!(blood_group.as_str()));
        row.insert("required_date".into(), json!(form.required_date));
        row.insert("location".into(), json!(form.location));
        row.insert("contact".into(), json!(form.contact));
        row.insert("status".into(), json!(RequestStatus::Pending.as_str()));
        row.insert("verified".into(), Value::Bool(false));
        row.insert("requested_by".into(), json!(requester.id));
        // Unset optionals are left out so backend defaults apply.
        if let Some(urgency) = form.urgency {
            row.insert("urgency".into(), json!(urgency.as_str()));
        }
        if let Some(hospital) = form.hospital.as_deref().filter(|h| !h.trim().is_empty()) {
            row.insert("hospital".into(), json!(hospital));
        }
        if let Some(bags) = form.bags_needed.filter(|b| *b > 0) {
            row.insert("bags_needed".into(), json!(bags));
        }

        let stored = self.gateway.insert(BLOOD_REQUESTS, &[row]).await?;
        let id = stored
            .first()
            .and_then(|r| r.get("id").cloned())
            .unwrap_or(Value::Null);
        info!(%id, %blood_group, "blood request registered");

        self.alert_admin(patient_name, blood_group, form).await;
        Ok(id)
    }

    async fn alert_admin(&self, patient_name: &str, blood_group: BloodGroup, form: &BloodRequestForm) {
        let alert = Notification {
            id: None,
            channel: Channel::Email,
            recipient_phone: None,
            recipient_email: Some(self.admin_email.clone()),
            subject: Some(format!("New blood request: {}", blood_group)),
            message: format!(
                "{} needs {} blood at {}, {}. Contact: {}. Review it in the admin panel.",
                patient_name,
                blood_group,
                or(&form.hospital, "an unspecified hospital"),
                or(&form.location, "location not given"),
                or(&form.contact, "not given"),
            ),
            status: NotificationStatus::Pending,
            attempts: 0,
        };
        let queued = match to_record(&alert) {
            Ok(row) => self
                .gateway
                .insert(NOTIFICATION_QUEUE, &[row])
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(err) = queued {
            warn!(%err, "admin alert for new blood request was not queued");
        }
    }

    #[instrument(skip_all)]
    pub async fn register_donor(&self, form: &DonorForm) -> Result<Value, BloodError> {
        let full_name = form.full_name.trim();
        if full_name.is_empty() {
            return Err(BloodError::MissingField("full_name"));
        }
        let blood_group = form
            .blood_group
            .ok_or(BloodError::MissingField("blood_group"))?;

        let mut row = Record::new();
        row.insert("full_name".into(), json!(full_name));
        row.insert("blood_group".into(), json!(blood_group.as_str()));
        row.insert("phone".into(), json!(form.phone));
        row.insert("email".into(), json!(form.email));
        row.insert("location".into(), json!(form.location));
        row.insert("is_available".into(), Value::Bool(true));
        row.insert("show_phone".into(), Value::Bool(form.show_phone));

        let stored = self.gateway.insert(BLOOD_DONORS, &[row]).await?;
        self.notices.push(Notice::success("Donor registered"));
        Ok(stored
            .first()
            .and_then(|r| r.get("id").cloned())
            .unwrap_or(Value::Null))
    }

    /// Donors are never deleted, only marked (un)available.
    #[instrument(skip_all, fields(donor_id = %id))]
    pub async fn set_donor_availability(
        &self,
        id: &Value,
        available: bool,
    ) -> Result<(), BloodError> {
        let mut patch = Record::new();
        patch.insert("is_available".into(), Value::Bool(available));
        let matched = self
            .gateway
            .update(BLOOD_DONORS, &Filter::new().eq("id", id.clone()), &patch)
            .await?;
        if matched == 0 {
            return Err(BloodError::NotFound(id.clone()));
        }
        self.notices.push(Notice::success(if available {
            "Donor marked available"
        } else {
            "Donor marked unavailable"
        }));
        Ok(())
    }
}
