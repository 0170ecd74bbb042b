//! Alert deduplicator and writer: at most one alert per contact per UTC day.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rg_core::{Alert, Contact, OpportunityRecord, RateAlert};
use rg_storage::{GuardianStore, StoreError};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum AlertCreation {
    Created(Alert),
    /// A dedup row for today already existed before the write.
    AlreadyAlerted,
    /// Another writer claimed today's dedup row between our read and write.
    RaceLost { orphaned_alert_id: uuid::Uuid },
}

impl AlertCreation {
    pub fn created(&self) -> Option<&Alert> {
        match self {
            AlertCreation::Created(alert) => Some(alert),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct AlertWriter {
    store: Arc<dyn GuardianStore>,
}

impl AlertWriter {
    pub fn new(store: Arc<dyn GuardianStore>) -> Self {
        Self { store }
    }

    /// Insert the alert, then its dedup row. The unique `(contact_id, alert_date)`
    /// key is what actually guards against concurrent runs; the read up front
    /// only saves work.
    pub async fn create_alert(
        &self,
        contact: &Contact,
        opportunity: &OpportunityRecord,
        now: DateTime<Utc>,
    ) -> Result<AlertCreation, StoreError> {
        let alert_date = now.date_naive();
        if let Some(existing) = self.store.find_rate_alert(&contact.id, alert_date).await? {
            info!(
                stage = "alerts:skip",
                contact_id = %contact.id,
                %alert_date,
                rate_alert_id = %existing.id,
                "alert already recorded today"
            );
            return Ok(AlertCreation::AlreadyAlerted);
        }

        let alert = Alert::from_estimate(contact, &opportunity.estimate, now);
        self.store.insert_alert(&alert).await?;

        let rate_alert = RateAlert::pending(&contact.id, opportunity.id, alert_date, now);
        match self.store.insert_rate_alert(&rate_alert).await {
            Ok(()) => {
                info!(
                    stage = "alerts:created",
                    contact_id = %contact.id,
                    alert_id = %alert.id,
                    tier = %alert.message_type,
                    "alert created"
                );
                Ok(AlertCreation::Created(alert))
            }
            Err(err) if err.is_conflict() => {
                warn!(
                    stage = "alerts:race-lost",
                    contact_id = %contact.id,
                    alert_id = %alert.id,
                    "dedup row claimed concurrently; alert left orphaned"
                );
                Ok(AlertCreation::RaceLost {
                    orphaned_alert_id: alert.id,
                })
            }
            Err(err) => Err(err),
        }
    }
}
