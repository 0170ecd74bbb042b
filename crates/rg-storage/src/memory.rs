//! In-process [`GuardianStore`] used by tests and local dry runs.
//!
//! Unique keys mirror the SQL schema: one opportunity per contact, one
//! rate alert per `(contact_id, alert_date)`, one classification per
//! `state_hash` and one run lock per bucket.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rg_core::{
    Alert, Classification, Contact, ContactEvaluation, DeadLetter, DeliveryUpdate,
    EligibilityQuery, LoanProfile, OpportunityRecord, RateAlert, RunLedgerEntry,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{GuardianStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Tables {
    contacts: Vec<Contact>,
    loan_profiles: Vec<LoanProfile>,
    opportunities: HashMap<String, OpportunityRecord>,
    alerts: Vec<Alert>,
    rate_alerts: BTreeMap<(String, NaiveDate), RateAlert>,
    classifications: BTreeMap<String, Classification>,
    dead_letters: Vec<DeadLetter>,
    runs: BTreeMap<Uuid, RunLedgerEntry>,
    run_locks: BTreeMap<String, Uuid>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_contact(&self, contact: Contact) {
        let mut tables = self.tables.lock().await;
        tables.contacts.retain(|c| c.id != contact.id);
        tables.contacts.push(contact);
    }

    pub async fn insert_loan_profile(&self, profile: LoanProfile) {
        self.tables.lock().await.loan_profiles.push(profile);
    }

    pub async fn contact(&self, contact_id: &str) -> Option<Contact> {
        self.tables
            .lock()
            .await
            .contacts
            .iter()
            .find(|c| c.id == contact_id)
            .cloned()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.tables.lock().await.alerts.clone()
    }

    pub async fn rate_alerts(&self) -> Vec<RateAlert> {
        self.tables.lock().await.rate_alerts.values().cloned().collect()
    }

    pub async fn opportunities(&self) -> Vec<OpportunityRecord> {
        self.tables.lock().await.opportunities.values().cloned().collect()
    }

    pub async fn classifications(&self) -> Vec<Classification> {
        self.tables
            .lock()
            .await
            .classifications
            .values()
            .cloned()
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.tables.lock().await.dead_letters.clone()
    }

    pub async fn runs(&self) -> Vec<RunLedgerEntry> {
        self.tables.lock().await.runs.values().cloned().collect()
    }

    pub async fn run(&self, run_id: Uuid) -> Option<RunLedgerEntry> {
        self.tables.lock().await.runs.get(&run_id).cloned()
    }
}

#[async_trait]
impl GuardianStore for MemoryStore {
    async fn select_eligible_contacts(&self, query: &EligibilityQuery) -> StoreResult<Vec<Contact>> {
        let tables = self.tables.lock().await;
        let mut selected: Vec<Contact> = tables
            .contacts
            .iter()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        selected.truncate(query.limit);
        Ok(selected)
    }

    async fn update_contact_evaluation(
        &self,
        contact_id: &str,
        evaluation: &ContactEvaluation,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let contact = tables
            .contacts
            .iter_mut()
            .find(|c| c.id == contact_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "contact",
                key: contact_id.to_string(),
            })?;
        evaluation.apply_to(contact);
        Ok(())
    }

    async fn loan_profile_for_contact(&self, contact_id: &str) -> StoreResult<Option<LoanProfile>> {
        Ok(self
            .tables
            .lock()
            .await
            .loan_profiles
            .iter()
            .rev()
            .find(|p| p.contact_id == contact_id)
            .cloned())
    }

    async fn upsert_opportunity(&self, record: &OpportunityRecord) -> StoreResult<OpportunityRecord> {
        let mut tables = self.tables.lock().await;
        let stored = match tables.opportunities.get(&record.contact_id) {
            Some(existing) => OpportunityRecord {
                id: existing.id,
                ..record.clone()
            },
            None => record.clone(),
        };
        tables
            .opportunities
            .insert(record.contact_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn find_rate_alert(
        &self,
        contact_id: &str,
        alert_date: NaiveDate,
    ) -> StoreResult<Option<RateAlert>> {
        Ok(self
            .tables
            .lock()
            .await
            .rate_alerts
            .get(&(contact_id.to_string(), alert_date))
            .cloned())
    }

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.alerts.iter().any(|a| a.id == alert.id) {
            return Err(StoreError::Conflict {
                constraint: Some("alerts_pkey".into()),
            });
        }
        tables.alerts.push(alert.clone());
        Ok(())
    }

    async fn insert_rate_alert(&self, rate_alert: &RateAlert) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let key = (rate_alert.contact_id.clone(), rate_alert.alert_date);
        if tables.rate_alerts.contains_key(&key) {
            return Err(StoreError::Conflict {
                constraint: Some("rate_alerts_contact_id_alert_date_key".into()),
            });
        }
        tables.rate_alerts.insert(key, rate_alert.clone());
        Ok(())
    }

    async fn record_delivery(&self, alert_id: Uuid, update: &DeliveryUpdate) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let alert = tables
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "alert",
                key: alert_id.to_string(),
            })?;
        alert.alert_sent = update.delivered;
        alert.attempts += update.attempts;
        alert.last_error = update.last_error.clone();
        alert.processed_at = Some(update.processed_at);
        Ok(())
    }

    async fn pending_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<Alert> = tables
            .alerts
            .iter()
            .filter(|a| !a.alert_sent)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.inserted_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn alerts_for_classification(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        let tables = self.tables.lock().await;
        let mut alerts: Vec<Alert> = tables
            .alerts
            .iter()
            .filter(|a| !a.contact_id.is_empty())
            .cloned()
            .collect();
        alerts.sort_by_key(|a| a.inserted_at);
        alerts.truncate(limit);
        Ok(alerts)
    }

    async fn insert_classification(&self, classification: &Classification) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables
            .classifications
            .contains_key(&classification.state_hash)
        {
            return Ok(false);
        }
        tables
            .classifications
            .insert(classification.state_hash.clone(), classification.clone());
        Ok(true)
    }

    async fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> StoreResult<()> {
        self.tables
            .lock()
            .await
            .dead_letters
            .push(dead_letter.clone());
        Ok(())
    }

    async fn start_run(&self, entry: &RunLedgerEntry) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.runs.contains_key(&entry.run_id) {
            return Err(StoreError::Conflict {
                constraint: Some("rg_run_ledger_pkey".into()),
            });
        }
        tables.runs.insert(entry.run_id, entry.clone());
        Ok(())
    }

    async fn complete_run(&self, entry: &RunLedgerEntry) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(&entry.run_id) {
            Some(row) => {
                *row = entry.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "run",
                key: entry.run_id.to_string(),
            }),
        }
    }

    async fn try_acquire_run_lock(
        &self,
        bucket: &str,
        run_id: Uuid,
        _acquired_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.run_locks.contains_key(bucket) {
            return Ok(false);
        }
        tables.run_locks.insert(bucket.to_string(), run_id);
        Ok(true)
    }
}
