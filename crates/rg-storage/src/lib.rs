//! Persistence collaborator + signed HTTP delivery utilities for Rate Guardian.
//!
//! The engine only talks to storage through [`GuardianStore`]. Every write is a
//! single-row insert, update or upsert scoped to one identity key; uniqueness
//! that guards against duplicate alerts is enforced by the backend, and
//! surfaces as [`StoreError::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rg_core::{
    Alert, Classification, Contact, ContactEvaluation, DeadLetter, DeliveryUpdate,
    EligibilityQuery, LoanProfile, OpportunityRecord, RateAlert, RunLedgerEntry,
};
use thiserror::Error;
use uuid::Uuid;

pub mod delivery;
pub mod memory;
pub mod postgres;

pub use delivery::{
    secrets_match, sign_payload, verify_signature, LinearBackoff, OutboundRequest, RecordingSleeper,
    ReqwestTransport, SignatureError, Sleeper, TokioSleeper, TransportError, TransportResponse,
    WebhookTransport, ALERT_ID_HEADER, SIGNATURE_HEADER,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "rg-storage";

/// PostgreSQL SQLSTATE for a unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique key already holds a row. Expected on dedup paths.
    #[error("unique constraint conflict{}", .constraint.as_deref().map(|c| format!(" on {c}")).unwrap_or_default())]
    Conflict { constraint: Option<String> },
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value in {column}: {value}")]
    Decode { column: &'static str, value: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return StoreError::Conflict {
                    constraint: db.constraint().map(str::to_string),
                };
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage operations consumed by the engine.
#[async_trait]
pub trait GuardianStore: Send + Sync {
    /// Filtered, ordered (newest first), limited contact page.
    async fn select_eligible_contacts(&self, query: &EligibilityQuery) -> StoreResult<Vec<Contact>>;

    async fn update_contact_evaluation(
        &self,
        contact_id: &str,
        evaluation: &ContactEvaluation,
    ) -> StoreResult<()>;

    async fn loan_profile_for_contact(&self, contact_id: &str) -> StoreResult<Option<LoanProfile>>;

    /// Upsert keyed by `contact_id`; returns the stored row (its id survives updates).
    async fn upsert_opportunity(&self, record: &OpportunityRecord) -> StoreResult<OpportunityRecord>;

    async fn find_rate_alert(
        &self,
        contact_id: &str,
        alert_date: NaiveDate,
    ) -> StoreResult<Option<RateAlert>>;

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()>;

    /// Fails with [`StoreError::Conflict`] when `(contact_id, alert_date)` exists.
    async fn insert_rate_alert(&self, rate_alert: &RateAlert) -> StoreResult<()>;

    /// Adds `update.attempts` to the alert's attempt counter.
    async fn record_delivery(&self, alert_id: Uuid, update: &DeliveryUpdate) -> StoreResult<()>;

    /// Undelivered alerts, oldest first.
    async fn pending_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>>;

    /// Alerts with a contact, oldest first, for the classification pass.
    async fn alerts_for_classification(&self, limit: usize) -> StoreResult<Vec<Alert>>;

    /// Insert ignoring a `state_hash` conflict. `true` when a row was written.
    async fn insert_classification(&self, classification: &Classification) -> StoreResult<bool>;

    async fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> StoreResult<()>;

    async fn start_run(&self, entry: &RunLedgerEntry) -> StoreResult<()>;

    async fn complete_run(&self, entry: &RunLedgerEntry) -> StoreResult<()>;

    /// Claim the run-window `bucket`; `false` when another run holds it.
    async fn try_acquire_run_lock(
        &self,
        bucket: &str,
        run_id: Uuid,
        acquired_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
}
