//! Core domain model for Rate Guardian: contacts, loan profiles, computed
//! opportunities, alerts and the audit records that surround them.
//!
//! Everything in this crate is pure. Persistence lives in `rg-storage` and
//! orchestration in `rg-engine`.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod classify;
pub mod fingerprint;
pub mod opportunity;

pub use classify::{
    classify, ClassificationResult, ClassificationSubject, ContactAlertSubject, Decision,
    Disposition, IntakeShape, ProductCategory, ThresholdSet, ThresholdVersion,
};
pub use fingerprint::{content_fingerprint, state_hash};
pub use opportunity::{evaluate, OpportunityCheck, OpportunityEstimate, Tier};

pub const CRATE_NAME: &str = "rg-core";

/// Hard cap on contacts processed by a single run.
pub const DEFAULT_MAX_CONTACTS: usize = 50;
/// Contacts not evaluated within this many hours are due again.
pub const LOOKBACK_HOURS: i64 = 24;
/// Fresh intake rows from this source are re-evaluated for a week.
pub const RECENT_INTAKE_SOURCE: &str = "intake_v7";
pub const RECENT_INTAKE_DAYS: i64 = 7;

/// Lead record as produced by intake. The engine only writes the monitoring
/// flags and the opportunity snapshot back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Contact {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub flag_monitor: bool,
    pub trigger_flag: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub existing_rate: Option<f64>,
    pub loan_amount: Option<f64>,
    pub oppty_tier: Option<Tier>,
    pub oppty_score: Option<u32>,
    pub monthly_savings_est: Option<f64>,
    pub total_savings: Option<f64>,
    pub breakeven_months: Option<u32>,
    pub rate_delta_bps: Option<i64>,
    pub eligible_rate_today: Option<f64>,
}

impl Contact {
    /// Display name used on alerts: name, then email, then a placeholder.
    pub fn display_name(&self) -> String {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        present(&self.name)
            .or_else(|| present(&self.email))
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Whether the contact is due for (re-)evaluation at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let lookback = now - Duration::hours(LOOKBACK_HOURS);
        let recency = now - Duration::days(RECENT_INTAKE_DAYS);
        let recent_intake = self.source.as_deref() == Some(RECENT_INTAKE_SOURCE)
            && self.created_at.map(|c| c >= recency).unwrap_or(false);

        self.flag_monitor
            || recent_intake
            || self.trigger_flag
            || self.last_run_at.map(|t| t <= lookback).unwrap_or(true)
    }
}

/// Write-back applied to a contact after it went through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEvaluation {
    pub evaluated_at: DateTime<Utc>,
    pub estimate: Option<OpportunityEstimate>,
}

impl ContactEvaluation {
    pub fn apply_to(&self, contact: &mut Contact) {
        contact.last_run_at = Some(self.evaluated_at);
        contact.trigger_flag = false;
        if let Some(est) = &self.estimate {
            contact.oppty_tier = Some(est.tier);
            contact.oppty_score = Some(est.score);
            contact.monthly_savings_est = Some(est.monthly_savings);
            contact.total_savings = Some(est.total_savings);
            contact.breakeven_months = Some(est.breakeven_months);
            contact.rate_delta_bps = Some(est.rate_delta_bps);
            contact.eligible_rate_today = Some(est.market_rate);
        }
    }
}

/// Selection parameters for one run. `limit` is clamped by [`EligibilityQuery::new`].
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityQuery {
    pub limit: usize,
    pub contact_id: Option<String>,
    pub email: Option<String>,
    pub now: DateTime<Utc>,
}

impl EligibilityQuery {
    pub fn new(
        limit: Option<usize>,
        contact_id: Option<String>,
        email: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            limit: limit
                .unwrap_or(DEFAULT_MAX_CONTACTS)
                .clamp(1, DEFAULT_MAX_CONTACTS),
            contact_id: contact_id.filter(|s| !s.trim().is_empty()),
            email: email
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty()),
            now,
        }
    }

    /// Override filters plus the due-window predicate.
    pub fn matches(&self, contact: &Contact) -> bool {
        if let Some(id) = &self.contact_id {
            if &contact.id != id {
                return false;
            }
        }
        if let Some(email) = &self.email {
            let matches_email = contact
                .email
                .as_deref()
                .map(|e| e.to_lowercase() == *email)
                .unwrap_or(false);
            if !matches_email {
                return false;
            }
        }
        contact.is_due(self.now)
    }
}

/// Normalized loan attributes from the richer intake path. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanProfile {
    pub id: Uuid,
    pub contact_id: String,
    pub property_fingerprint: String,
    pub loan_fingerprint: String,
    pub loan_type_raw: Option<String>,
    pub product_normalized: Option<String>,
    pub loan_amount: Option<f64>,
    pub current_rate: Option<f64>,
    pub market_rate: Option<f64>,
    pub credit_score: Option<u32>,
    pub rate_lock_date: Option<NaiveDate>,
    pub arm_adjustment_date: Option<NaiveDate>,
}

impl LoanProfile {
    /// Content fingerprint over the fields that define a loan.
    pub fn compute_fingerprint(&self) -> String {
        let amount = self.loan_amount.map(|v| v.to_string()).unwrap_or_default();
        let rate = self.current_rate.map(|v| v.to_string()).unwrap_or_default();
        let lock = self.rate_lock_date.map(|d| d.to_string()).unwrap_or_default();
        let arm = self
            .arm_adjustment_date
            .map(|d| d.to_string())
            .unwrap_or_default();
        content_fingerprint(&[
            self.contact_id.as_str(),
            self.property_fingerprint.as_str(),
            self.loan_type_raw.as_deref().unwrap_or_default(),
            amount.as_str(),
            rate.as_str(),
            lock.as_str(),
            arm.as_str(),
        ])
    }
}

/// Latest computed opportunity for a contact; one row per contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub id: Uuid,
    pub contact_id: String,
    pub estimate: OpportunityEstimate,
    pub updated_at: DateTime<Utc>,
}

pub const ALERT_LOAN_TYPE_REFI: &str = "refi";

/// Immutable opportunity event. Only the delivery fields change after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub contact_id: String,
    pub name: String,
    pub loan_type: String,
    pub current_rate: f64,
    pub market_rate: f64,
    pub delta: i64,
    pub estimated_savings: f64,
    pub message_type: String,
    pub inserted_at: DateTime<Utc>,
    pub alert_sent: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn from_estimate(
        contact: &Contact,
        estimate: &OpportunityEstimate,
        inserted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id: contact.id.clone(),
            name: contact.display_name(),
            loan_type: ALERT_LOAN_TYPE_REFI.to_string(),
            current_rate: estimate.existing_rate,
            market_rate: estimate.market_rate,
            delta: estimate.rate_delta_bps,
            estimated_savings: estimate.monthly_savings,
            message_type: estimate.tier.as_str().to_string(),
            inserted_at,
            alert_sent: false,
            attempts: 0,
            last_error: None,
            processed_at: None,
        }
    }

    pub fn payload(&self) -> AlertPayload {
        AlertPayload {
            id: self.id,
            contact_id: self.contact_id.clone(),
            name: self.name.clone(),
            loan_type: self.loan_type.clone(),
            current_rate: self.current_rate,
            market_rate: self.market_rate,
            delta: self.delta,
            estimated_savings: self.estimated_savings,
            message_type: self.message_type.clone(),
            timestamp: self.inserted_at,
        }
    }
}

/// Wire shape of an alert sent to the downstream webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub id: Uuid,
    pub contact_id: String,
    pub name: String,
    pub loan_type: String,
    pub current_rate: f64,
    pub market_rate: f64,
    pub delta: i64,
    pub estimated_savings: f64,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Delivery state written back onto an alert after a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryUpdate {
    pub delivered: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Dedup audit row; `(contact_id, alert_date)` is unique at the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateAlert {
    pub id: Uuid,
    pub contact_id: String,
    pub opportunity_id: Uuid,
    pub alert_date: NaiveDate,
    pub alert_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl RateAlert {
    pub fn pending(
        contact_id: &str,
        opportunity_id: Uuid,
        alert_date: NaiveDate,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id: contact_id.to_string(),
            opportunity_id,
            alert_date,
            alert_type: "rate_drop".to_string(),
            status: "pending".to_string(),
            created_at,
        }
    }
}

/// Durable classification decision keyed by `state_hash`. Never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub id: Uuid,
    pub state_hash: String,
    pub contact_id: String,
    pub property_fingerprint: String,
    pub loan_fingerprint: String,
    pub loan_profile_id: Option<Uuid>,
    pub alert_id: Option<Uuid>,
    pub threshold_version_id: String,
    pub opportunity: bool,
    pub decision: Decision,
    pub disposition: Disposition,
    pub reason: String,
    pub rule_id: String,
    pub threshold_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(RunStatus::Started),
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub contacts_processed: u32,
    pub opportunities_found: u32,
    pub alerts_sent: u32,
}

/// One row per engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLedgerEntry {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: RunStats,
    pub status: RunStatus,
    pub last_error: Option<String>,
}

/// Caller-visible run result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub contacts_processed: u32,
    pub opportunities_found: u32,
    pub alerts_sent: u32,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Payload kept for manual replay after delivery retries ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub alert_id: Option<Uuid>,
    pub contact_id: Option<String>,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}
