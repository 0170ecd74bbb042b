//! Rate Guardian engine orchestration.
//!
//! One run: ledger start, contact selection, then for each contact in turn
//! calculate -> classify -> dedupe/persist -> dispatch, then ledger completion.
//! Per-contact failures downgrade the run to `partial`; only configuration and
//! selection failures stop it.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use rg_adapters::{rate_source_for, RateSource, RateSourceError};
use rg_core::classify::normalize_product;
use rg_core::{
    classify, truncate_chars, Alert, ClassificationSubject, Contact, ContactAlertSubject,
    Decision, DeliveryUpdate, EligibilityQuery, OpportunityCheck, OpportunityRecord, RunResult,
    RunStats, RunStatus,
};
use rg_storage::{GuardianStore, PgStore, ReqwestTransport, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod alerts;
pub mod classification;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod ledger;
pub mod selector;
pub mod stages;

pub use alerts::{AlertCreation, AlertWriter};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    ActiveThresholds, Capability, ConfigError, EngineConfig, StoreSettings, ThresholdRegistry,
    WebhookSettings,
};
pub use dispatch::{Delivered, DeliveryError, WebhookDispatcher};
pub use ledger::RunLedger;

pub const CRATE_NAME: &str = "rg-engine";

/// Undelivered alerts handled per relay call.
pub const RELAY_BATCH: usize = 20;
/// Alerts scanned per standalone classification pass.
pub const CLASSIFY_BATCH: usize = 250;
pub const DELIVERY_ERROR_CHARS: usize = 2000;
pub const RUN_WINDOW_MINUTES: u32 = 15;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("contact selection failed: {0}")]
    Selection(#[source] StoreError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("rate source error: {0}")]
    RateSource(#[from] RateSourceError),
    #[error("could not encode classification snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Manual trigger parameters; all optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunRequest {
    pub limit: Option<usize>,
    pub contact_id: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunResult),
    /// Another run holds the current window.
    Skipped { bucket: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelaySummary {
    pub sent: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    NoOpportunity,
    Held,
    Deduplicated,
    Alerted { delivered: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Alert created by this run; failure is dead-lettered.
    First,
    /// Retry of an undelivered alert from the relay.
    Relay,
}

/// Floor `now` to its 15-minute window, formatted `YYYY-MM-DDTHH:MM`.
pub fn run_window_bucket(now: DateTime<Utc>) -> String {
    let minute = now.minute() - now.minute() % RUN_WINDOW_MINUTES;
    format!("{}:{:02}", now.format("%Y-%m-%dT%H"), minute)
}

pub struct RateGuardianEngine {
    store: Arc<dyn GuardianStore>,
    rates: Arc<dyn RateSource>,
    thresholds: ActiveThresholds,
    clock: Arc<dyn Clock>,
    dispatcher: Capability<WebhookDispatcher>,
    ledger: RunLedger,
    alerts: AlertWriter,
    max_contacts: usize,
    run_lock_enabled: bool,
}

impl RateGuardianEngine {
    pub fn new(
        store: Arc<dyn GuardianStore>,
        rates: Arc<dyn RateSource>,
        thresholds: ActiveThresholds,
        clock: Arc<dyn Clock>,
        dispatcher: Capability<WebhookDispatcher>,
    ) -> Self {
        Self {
            ledger: RunLedger::new(store.clone(), clock.clone()),
            alerts: AlertWriter::new(store.clone()),
            store,
            rates,
            thresholds,
            clock,
            dispatcher,
            max_contacts: rg_core::DEFAULT_MAX_CONTACTS,
            run_lock_enabled: false,
        }
    }

    pub fn with_max_contacts(mut self, max_contacts: usize) -> Self {
        self.max_contacts = max_contacts.max(1);
        self
    }

    pub fn with_run_lock(mut self, enabled: bool) -> Self {
        self.run_lock_enabled = enabled;
        self
    }

    /// Production wiring: Postgres store, configured rate source, reqwest transport.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let settings = config.store.require().context("store configuration")?;
        let store = PgStore::connect_lazy(&settings.database_url)
            .context("creating postgres pool")?;
        Self::from_config_with_store(config, Arc::new(store))
    }

    pub fn from_config_with_store(
        config: &EngineConfig,
        store: Arc<dyn GuardianStore>,
    ) -> Result<Self> {
        let rates: Arc<dyn RateSource> = Arc::from(
            rate_source_for(&config.rate_source).context("resolving RG_RATE_SOURCE")?,
        );
        let registry = ThresholdRegistry::from_workspace_root(&config.workspace_root)?;
        let thresholds = registry
            .active(
                config.threshold_version.as_deref(),
                &config.threshold_overrides,
            )
            .context("resolving threshold version")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let dispatcher = match config.webhook.as_ref() {
            Capability::Available(settings) => {
                let transport =
                    ReqwestTransport::new(config.http_timeout(), Some(config.user_agent.as_str()))?;
                Capability::Available(WebhookDispatcher::new(
                    settings.clone(),
                    Arc::new(transport),
                    store.clone(),
                    clock.clone(),
                ))
            }
            Capability::Unavailable(err) => Capability::Unavailable(err),
        };

        info!(
            stage = "engine:init",
            rate_source = rates.source_id(),
            threshold_version = %thresholds.version.version_name,
            threshold_version_id = %thresholds.version.id,
            webhook = dispatcher.is_available(),
            "engine configured"
        );

        Ok(Self::new(store, rates, thresholds, clock, dispatcher)
            .with_max_contacts(config.max_contacts)
            .with_run_lock(config.run_lock_enabled))
    }

    pub fn store(&self) -> &Arc<dyn GuardianStore> {
        &self.store
    }

    pub fn thresholds(&self) -> &ActiveThresholds {
        &self.thresholds
    }

    pub fn dispatcher(&self) -> &Capability<WebhookDispatcher> {
        &self.dispatcher
    }

    /// Entry point for cron and manual triggers; honours the run-window lock.
    pub async fn trigger(&self, request: RunRequest) -> Result<RunOutcome, EngineError> {
        let run_id = Uuid::new_v4();
        if self.run_lock_enabled {
            let now = self.clock.now();
            let bucket = run_window_bucket(now);
            if !self.store.try_acquire_run_lock(&bucket, run_id, now).await? {
                info!(stage = "engine:lock:held", %bucket, "run window already taken; skipping");
                return Ok(RunOutcome::Skipped { bucket });
            }
        }
        self.execute(run_id, request).await.map(RunOutcome::Completed)
    }

    pub async fn run_once(&self, request: RunRequest) -> Result<RunResult, EngineError> {
        self.execute(Uuid::new_v4(), request).await
    }

    async fn execute(&self, run_id: Uuid, request: RunRequest) -> Result<RunResult, EngineError> {
        let dispatcher = self.dispatcher.require()?;

        let started = self.ledger.start_run_with_id(run_id).await;
        let mut stats = RunStats::default();
        let mut status = RunStatus::Success;
        let mut last_error: Option<String> = None;

        let query = EligibilityQuery::new(
            Some(request.limit.unwrap_or(self.max_contacts).min(self.max_contacts)),
            request.contact_id.clone(),
            request.email.clone(),
            self.clock.now(),
        );

        match selector::select_contacts(self.store.as_ref(), &query).await {
            Err(err) => {
                let err = EngineError::Selection(err);
                error!(stage = "engine:run:error", %run_id, error = %err, "run aborted");
                status = RunStatus::Failed;
                last_error = Some(err.to_string());
            }
            Ok(contacts) => {
                for contact in &contacts {
                    stats.contacts_processed += 1;
                    match self.process_contact(contact, dispatcher, &mut stats).await {
                        Ok(outcome) => info!(
                            stage = "engine:contact:done",
                            %run_id,
                            contact_id = %contact.id,
                            outcome = ?outcome,
                            "contact processed"
                        ),
                        Err(err) => {
                            status = RunStatus::Partial;
                            error!(
                                stage = "engine:contact:error",
                                %run_id,
                                contact_id = %contact.id,
                                error = %err,
                                "contact processing failed"
                            );
                            last_error = Some(err.to_string());
                        }
                    }
                }
            }
        }

        let completed = self
            .ledger
            .complete_run(&started, stats, status, last_error)
            .await;
        Ok(RunResult {
            run_id: completed.run_id,
            contacts_processed: completed.stats.contacts_processed,
            opportunities_found: completed.stats.opportunities_found,
            alerts_sent: completed.stats.alerts_sent,
            status: completed.status,
            last_error: completed.last_error,
        })
    }

    async fn process_contact(
        &self,
        contact: &Contact,
        dispatcher: &WebhookDispatcher,
        stats: &mut RunStats,
    ) -> Result<ContactOutcome, EngineError> {
        let now = self.clock.now();
        let loan = self.store.loan_profile_for_contact(&contact.id).await?;
        let product = loan
            .as_ref()
            .map(|profile| normalize_product(profile.product_label()));

        let estimate =
            match stages::compute_opportunity(self.rates.as_ref(), contact, product).await? {
                OpportunityCheck::Eligible(estimate) => estimate,
                OpportunityCheck::BelowFloor { .. } => {
                    stages::write_back(self.store.as_ref(), contact, now, None).await;
                    return Ok(ContactOutcome::NoOpportunity);
                }
            };

        let record = self
            .store
            .upsert_opportunity(&OpportunityRecord {
                id: Uuid::new_v4(),
                contact_id: contact.id.clone(),
                estimate: estimate.clone(),
                updated_at: now,
            })
            .await?;
        stats.opportunities_found += 1;

        let result = classification::classify_evaluation(
            &estimate,
            loan.as_ref(),
            &self.thresholds,
            now.date_naive(),
        );
        if let Some(profile) = &loan {
            let row =
                classification::build_classification(&contact.id, profile, None, &result, now)?;
            classification::record_classification(self.store.as_ref(), &row).await?;
        }

        if result.decision == Decision::Hold {
            info!(
                stage = "classification:hold",
                contact_id = %contact.id,
                disposition = result.disposition.as_str(),
                reason = %result.reason,
                "alert suppressed by product threshold"
            );
            stages::write_back(self.store.as_ref(), contact, now, Some(&estimate)).await;
            return Ok(ContactOutcome::Held);
        }

        let outcome = match self.alerts.create_alert(contact, &record, now).await? {
            AlertCreation::Created(alert) => {
                stats.alerts_sent += 1;
                let delivered = self.deliver(dispatcher, &alert, Delivery::First).await;
                ContactOutcome::Alerted { delivered }
            }
            AlertCreation::AlreadyAlerted | AlertCreation::RaceLost { .. } => {
                ContactOutcome::Deduplicated
            }
        };

        stages::write_back(self.store.as_ref(), contact, now, Some(&estimate)).await;
        Ok(outcome)
    }

    /// Dispatch one alert and record its delivery state. Never fails the caller.
    async fn deliver(&self, dispatcher: &WebhookDispatcher, alert: &Alert, mode: Delivery) -> bool {
        let outcome = match mode {
            Delivery::First => dispatcher.dispatch(alert).await,
            Delivery::Relay => dispatcher.redeliver(alert).await,
        };
        let (delivered, update) = match outcome {
            Ok(done) => (
                true,
                DeliveryUpdate {
                    delivered: true,
                    attempts: done.attempts,
                    last_error: None,
                    processed_at: self.clock.now(),
                },
            ),
            Err(err) => {
                let message = match &err {
                    DeliveryError::Exhausted { last_error, .. } => last_error.clone(),
                    other => other.to_string(),
                };
                (
                    false,
                    DeliveryUpdate {
                        delivered: false,
                        attempts: err.attempts(),
                        last_error: Some(truncate_chars(&message, DELIVERY_ERROR_CHARS)),
                        processed_at: self.clock.now(),
                    },
                )
            }
        };

        if let Err(err) = self.store.record_delivery(alert.id, &update).await {
            warn!(
                stage = "alerts:delivery:update:error",
                alert_id = %alert.id,
                error = %err,
                "failed to record delivery state"
            );
        }
        delivered
    }

    /// Retry delivery for undelivered alerts, oldest first.
    pub async fn relay_pending_alerts(&self) -> Result<RelaySummary, EngineError> {
        let dispatcher = self.dispatcher.require()?;
        let pending = self.store.pending_alerts(RELAY_BATCH).await?;
        let mut summary = RelaySummary::default();
        for alert in &pending {
            if self.deliver(dispatcher, alert, Delivery::Relay).await {
                summary.sent += 1;
            } else {
                summary.failed += 1;
            }
        }
        info!(
            stage = "relay:complete",
            sent = summary.sent,
            failed = summary.failed,
            "pending alerts relayed"
        );
        Ok(summary)
    }

    /// Classify recorded alerts against their loan profiles. Returns the number
    /// of new classification rows.
    pub async fn classify_pending(&self) -> Result<u32, EngineError> {
        let alerts = self.store.alerts_for_classification(CLASSIFY_BATCH).await?;
        let now = self.clock.now();
        let mut inserted = 0;
        for alert in &alerts {
            let loan = match self.store.loan_profile_for_contact(&alert.contact_id).await {
                Ok(Some(loan)) => loan,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        stage = "classification:loan:error",
                        alert_id = %alert.id,
                        error = %err,
                        "failed to load loan profile"
                    );
                    continue;
                }
            };
            let subject = ContactAlertSubject::new(alert, Some(&loan));
            let result = classify(
                &subject,
                &self.thresholds.version,
                &self.thresholds.thresholds,
                now.date_naive(),
            );
            let row = classification::build_classification(
                &alert.contact_id,
                &loan,
                Some(alert.id),
                &result,
                now,
            )?;
            match classification::record_classification(self.store.as_ref(), &row).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    stage = "classification:error",
                    alert_id = %alert.id,
                    error = %err,
                    "classification skipped"
                ),
            }
        }
        Ok(inserted)
    }
}

pub async fn maybe_build_scheduler(
    engine: Arc<RateGuardianEngine>,
    config: &EngineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.engine_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            match engine.trigger(RunRequest::default()).await {
                Ok(RunOutcome::Completed(result)) => info!(
                    stage = "scheduler:run",
                    run_id = %result.run_id,
                    status = result.status.as_str(),
                    "scheduled run finished"
                ),
                Ok(RunOutcome::Skipped { bucket }) => {
                    info!(stage = "scheduler:skip", %bucket, "scheduled run skipped")
                }
                Err(err) => error!(stage = "scheduler:error", error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_engine_once_from_env(request: RunRequest) -> Result<RunResult> {
    let config = EngineConfig::from_env()?;
    let engine = RateGuardianEngine::from_config(&config)?;
    Ok(engine.run_once(request).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::ScriptedTransport;
    use chrono::{Duration, NaiveDate, TimeZone};
    use rg_adapters::FixedRate;
    use async_trait::async_trait;
    use rg_core::{
        Classification, ContactEvaluation, DeadLetter, LoanProfile, RateAlert, RunLedgerEntry,
        ThresholdSet, ThresholdVersion,
    };
    use rg_storage::{MemoryStore, RecordingSleeper, StoreResult};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 7, 0).single().unwrap()
    }

    fn active() -> ActiveThresholds {
        ActiveThresholds {
            version: ThresholdVersion {
                id: "tv-1".into(),
                version_name: "v1".into(),
            },
            thresholds: ThresholdSet::new().with("trigger_threshold_15yr", 100),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<FixedClock>,
        engine: RateGuardianEngine,
    }

    fn harness(market_rate: f64, script: Vec<Result<u16, &'static str>>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new(script));
        let clock = Arc::new(FixedClock::new(now()));
        let dispatcher = WebhookDispatcher::new(
            WebhookSettings {
                url: "https://hook.test".into(),
                secret: "s".into(),
            },
            transport.clone(),
            store.clone(),
            clock.clone(),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new()));
        let engine = RateGuardianEngine::new(
            store.clone(),
            Arc::new(FixedRate(market_rate)),
            active(),
            clock.clone(),
            Capability::Available(dispatcher),
        );
        Harness {
            store,
            transport,
            clock,
            engine,
        }
    }

    fn contact(id: &str, existing_rate: f64) -> Contact {
        Contact {
            id: id.into(),
            name: Some(format!("Contact {id}")),
            existing_rate: Some(existing_rate),
            loan_amount: Some(350_000.0),
            created_at: Some(now() - Duration::days(30)),
            ..Default::default()
        }
    }

    fn loan(contact_id: &str, label: &str) -> LoanProfile {
        LoanProfile {
            id: Uuid::new_v4(),
            contact_id: contact_id.into(),
            property_fingerprint: format!("prop-{contact_id}"),
            loan_fingerprint: format!("loan-{contact_id}"),
            loan_type_raw: Some(label.into()),
            product_normalized: None,
            loan_amount: Some(350_000.0),
            current_rate: Some(6.5),
            market_rate: None,
            credit_score: None,
            rate_lock_date: None,
            arm_adjustment_date: None,
        }
    }

    #[test]
    fn run_window_buckets_floor_to_quarter_hours() {
        assert_eq!(run_window_bucket(now()), "2026-03-02T12:00");
        let late = Utc.with_ymd_and_hms(2026, 3, 2, 23, 59, 59).single().unwrap();
        assert_eq!(run_window_bucket(late), "2026-03-02T23:45");
    }

    #[tokio::test]
    async fn same_day_rerun_does_not_duplicate_alerts() {
        let h = harness(5.7, vec![Ok(200)]);
        h.store.insert_contact(contact("c1", 6.5)).await;

        let first = h.engine.run_once(RunRequest::default()).await.unwrap();
        assert_eq!(first.alerts_sent, 1);

        // Force the contact due again within the same UTC day.
        h.clock.advance(Duration::hours(1));
        let mut again = h.store.contact("c1").await.unwrap();
        again.trigger_flag = true;
        h.store.insert_contact(again).await;

        let second = h.engine.run_once(RunRequest::default()).await.unwrap();
        assert_eq!(second.contacts_processed, 1);
        assert_eq!(second.opportunities_found, 1);
        assert_eq!(second.alerts_sent, 0);
        assert_eq!(h.store.alerts().await.len(), 1);
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn below_floor_contact_is_stamped_without_opportunity() {
        let h = harness(6.3, vec![Ok(200)]);
        h.store.insert_contact(contact("c1", 6.5)).await;

        let result = h.engine.run_once(RunRequest::default()).await.unwrap();
        assert_eq!(result.contacts_processed, 1);
        assert_eq!(result.opportunities_found, 0);
        assert_eq!(result.status, RunStatus::Success);
        assert!(h.store.opportunities().await.is_empty());

        let stored = h.store.contact("c1").await.unwrap();
        assert_eq!(stored.last_run_at, Some(now()));
        assert!(stored.oppty_tier.is_none());
    }

    #[tokio::test]
    async fn product_threshold_holds_alert_and_records_classification() {
        let h = harness(5.7, vec![Ok(200)]);
        h.store.insert_contact(contact("c1", 6.5)).await;
        h.store.insert_loan_profile(loan("c1", "15 year fixed")).await;

        let result = h.engine.run_once(RunRequest::default()).await.unwrap();
        assert_eq!(result.opportunities_found, 1);
        assert_eq!(result.alerts_sent, 0);
        assert!(h.store.alerts().await.is_empty());

        let rows = h.store.classifications().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].decision, Decision::Hold);
        assert_eq!(rows[0].threshold_version_id, "tv-1");
    }

    #[tokio::test]
    async fn failed_delivery_keeps_alert_and_run_successful() {
        let h = harness(5.7, vec![Ok(500)]);
        h.store.insert_contact(contact("c1", 6.5)).await;

        let result = h.engine.run_once(RunRequest::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.alerts_sent, 1);

        let alert = &h.store.alerts().await[0];
        assert!(!alert.alert_sent);
        assert_eq!(alert.attempts, 3);
        assert_eq!(h.store.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn relay_redelivers_pending_alerts() {
        let h = harness(5.7, vec![Ok(500), Ok(500), Ok(500), Ok(200)]);
        h.store.insert_contact(contact("c1", 6.5)).await;
        h.engine.run_once(RunRequest::default()).await.unwrap();

        let summary = h.engine.relay_pending_alerts().await.unwrap();
        assert_eq!(summary, RelaySummary { sent: 1, failed: 0 });

        let alert = &h.store.alerts().await[0];
        assert!(alert.alert_sent);
        assert_eq!(alert.attempts, 4);
        assert!(alert.last_error.is_none());
        assert_eq!(h.engine.relay_pending_alerts().await.unwrap(), RelaySummary::default());
    }

    #[tokio::test]
    async fn missing_webhook_configuration_is_reported_before_any_work() {
        let store = Arc::new(MemoryStore::new());
        store.insert_contact(contact("c1", 6.5)).await;
        let engine = RateGuardianEngine::new(
            store.clone(),
            Arc::new(FixedRate(5.7)),
            active(),
            Arc::new(FixedClock::new(now())),
            Capability::Unavailable(ConfigError::Missing("ROSIE_WEBHOOK_SECRET")),
        );

        let err = engine.run_once(RunRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Config(ConfigError::Missing("ROSIE_WEBHOOK_SECRET"))
        ));
        assert!(store.runs().await.is_empty());
        assert!(matches!(
            engine.relay_pending_alerts().await,
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn run_lock_skips_second_trigger_in_window() {
        let h = harness(5.7, vec![Ok(200)]);
        let engine = h.engine.with_run_lock(true);

        assert!(matches!(
            engine.trigger(RunRequest::default()).await.unwrap(),
            RunOutcome::Completed(_)
        ));
        match engine.trigger(RunRequest::default()).await.unwrap() {
            RunOutcome::Skipped { bucket } => assert_eq!(bucket, "2026-03-02T12:00"),
            other => panic!("expected skip, got {other:?}"),
        }
        assert_eq!(h.store.runs().await.len(), 1);

        h.clock.advance(Duration::minutes(15));
        assert!(matches!(
            engine.trigger(RunRequest::default()).await.unwrap(),
            RunOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn classify_pending_is_idempotent_per_state() {
        let h = harness(5.7, vec![Ok(200)]);
        h.store.insert_contact(contact("c1", 6.5)).await;
        h.store.insert_contact(contact("c2", 6.5)).await;
        h.store.insert_loan_profile(loan("c2", "30 year fixed")).await;
        h.engine.run_once(RunRequest::default()).await.unwrap();

        // c1 has no loan profile and is skipped; c2 was classified during the run.
        assert_eq!(h.engine.classify_pending().await.unwrap(), 0);
        assert_eq!(h.store.classifications().await.len(), 1);

        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert_eq!(h.store.rate_alerts().await[0].alert_date, today);
    }

    #[tokio::test]
    async fn manual_limit_is_capped_by_engine_maximum() {
        let h = harness(5.7, vec![Ok(200)]);
        for i in 0..5 {
            h.store.insert_contact(contact(&format!("c{i}"), 6.5)).await;
        }
        let engine = h.engine.with_max_contacts(3);
        let result = engine
            .run_once(RunRequest {
                limit: Some(40),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.contacts_processed, 3);
    }

    #[tokio::test]
    async fn repeated_relay_of_a_failing_alert_keeps_one_dead_letter() {
        let h = harness(5.7, vec![Ok(500)]);
        h.store.insert_contact(contact("c1", 6.5)).await;
        h.engine.run_once(RunRequest::default()).await.unwrap();
        assert_eq!(h.store.dead_letters().await.len(), 1);

        for _ in 0..2 {
            let summary = h.engine.relay_pending_alerts().await.unwrap();
            assert_eq!(summary, RelaySummary { sent: 0, failed: 1 });
        }

        assert_eq!(h.store.dead_letters().await.len(), 1);
        let alert = &h.store.alerts().await[0];
        assert!(!alert.alert_sent);
        assert_eq!(alert.attempts, 9);
        assert_eq!(alert.last_error.as_deref(), Some("upstream said 500"));
    }

    /// Memory store that fails selected calls.
    struct FaultyStore {
        inner: MemoryStore,
        fail_selection: bool,
        fail_upsert_for: Option<&'static str>,
    }

    impl FaultyStore {
        fn new(fail_selection: bool, fail_upsert_for: Option<&'static str>) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_selection,
                fail_upsert_for,
            }
        }
    }

    #[async_trait]
    impl GuardianStore for FaultyStore {
        async fn select_eligible_contacts(&self, q: &EligibilityQuery) -> StoreResult<Vec<Contact>> {
            if self.fail_selection {
                return Err(StoreError::Unavailable("contacts table offline".into()));
            }
            self.inner.select_eligible_contacts(q).await
        }
        async fn update_contact_evaluation(&self, id: &str, e: &ContactEvaluation) -> StoreResult<()> {
            self.inner.update_contact_evaluation(id, e).await
        }
        async fn loan_profile_for_contact(&self, id: &str) -> StoreResult<Option<LoanProfile>> {
            self.inner.loan_profile_for_contact(id).await
        }
        async fn upsert_opportunity(&self, r: &OpportunityRecord) -> StoreResult<OpportunityRecord> {
            if self.fail_upsert_for == Some(r.contact_id.as_str()) {
                return Err(StoreError::Unavailable("opportunity write rejected".into()));
            }
            self.inner.upsert_opportunity(r).await
        }
        async fn find_rate_alert(&self, id: &str, d: NaiveDate) -> StoreResult<Option<RateAlert>> {
            self.inner.find_rate_alert(id, d).await
        }
        async fn insert_alert(&self, a: &Alert) -> StoreResult<()> {
            self.inner.insert_alert(a).await
        }
        async fn insert_rate_alert(&self, r: &RateAlert) -> StoreResult<()> {
            self.inner.insert_rate_alert(r).await
        }
        async fn record_delivery(&self, id: Uuid, u: &DeliveryUpdate) -> StoreResult<()> {
            self.inner.record_delivery(id, u).await
        }
        async fn pending_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>> {
            self.inner.pending_alerts(limit).await
        }
        async fn alerts_for_classification(&self, limit: usize) -> StoreResult<Vec<Alert>> {
            self.inner.alerts_for_classification(limit).await
        }
        async fn insert_classification(&self, c: &Classification) -> StoreResult<bool> {
            self.inner.insert_classification(c).await
        }
        async fn insert_dead_letter(&self, d: &DeadLetter) -> StoreResult<()> {
            self.inner.insert_dead_letter(d).await
        }
        async fn start_run(&self, e: &RunLedgerEntry) -> StoreResult<()> {
            self.inner.start_run(e).await
        }
        async fn complete_run(&self, e: &RunLedgerEntry) -> StoreResult<()> {
            self.inner.complete_run(e).await
        }
        async fn try_acquire_run_lock(
            &self,
            bucket: &str,
            run_id: Uuid,
            at: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.inner.try_acquire_run_lock(bucket, run_id, at).await
        }
    }

    fn engine_over(store: Arc<FaultyStore>) -> RateGuardianEngine {
        let clock = Arc::new(FixedClock::new(now()));
        let dispatcher = WebhookDispatcher::new(
            WebhookSettings {
                url: "https://hook.test".into(),
                secret: "s".into(),
            },
            Arc::new(ScriptedTransport::new(vec![Ok(200)])),
            store.clone(),
            clock.clone(),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new()));
        RateGuardianEngine::new(
            store,
            Arc::new(FixedRate(5.7)),
            active(),
            clock,
            Capability::Available(dispatcher),
        )
    }

    #[tokio::test]
    async fn failing_contact_marks_run_partial_and_later_contacts_still_run() {
        let store = Arc::new(FaultyStore::new(false, Some("bad")));
        // Newer contacts are selected first, so "bad" fails before "good" runs.
        let mut bad = contact("bad", 6.5);
        bad.created_at = Some(now() - Duration::days(1));
        store.inner.insert_contact(bad).await;
        store.inner.insert_contact(contact("good", 6.5)).await;
        let engine = engine_over(store.clone());

        let result = engine.run_once(RunRequest::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.contacts_processed, 2);
        assert_eq!(result.opportunities_found, 1);
        assert_eq!(result.alerts_sent, 1);
        let last_error = result.last_error.clone().unwrap();
        assert!(last_error.contains("opportunity write rejected"), "{last_error}");

        let alerts = store.inner.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].contact_id, "good");

        let run = store.inner.run(result.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.last_error, result.last_error);
        assert_eq!(run.stats.opportunities_found, 1);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn selection_failure_marks_run_failed_and_completes_ledger() {
        let store = Arc::new(FaultyStore::new(true, None));
        store.inner.insert_contact(contact("c1", 6.5)).await;
        let engine = engine_over(store.clone());

        let result = engine.run_once(RunRequest::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.contacts_processed, 0);
        assert_eq!(result.alerts_sent, 0);
        let last_error = result.last_error.clone().unwrap();
        assert!(last_error.starts_with("contact selection failed"), "{last_error}");
        assert!(last_error.contains("contacts table offline"));

        let runs = store.inner.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].last_error, result.last_error);
        assert_eq!(runs[0].completed_at, Some(now()));
        assert!(store.inner.alerts().await.is_empty());
    }
}
