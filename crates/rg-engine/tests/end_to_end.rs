use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use rg_adapters::FixedRate;
use rg_core::{Contact, RunStatus, ThresholdSet, ThresholdVersion, Tier};
use rg_engine::{
    ActiveThresholds, Capability, FixedClock, RateGuardianEngine, RunOutcome, RunRequest,
    WebhookDispatcher, WebhookSettings,
};
use rg_storage::{
    verify_signature, MemoryStore, OutboundRequest, RecordingSleeper, TransportError,
    TransportResponse, WebhookTransport, SIGNATURE_HEADER,
};

#[derive(Default)]
struct AcceptingReceiver {
    received: Mutex<Vec<OutboundRequest>>,
}

#[async_trait]
impl WebhookTransport for AcceptingReceiver {
    async fn post(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.received.lock().unwrap().push(request.clone());
        Ok(TransportResponse {
            status: 200,
            body: r#"{"status":"received"}"#.into(),
        })
    }
}

#[tokio::test]
async fn single_contact_run_creates_delivers_and_records_one_alert() {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .insert_contact(Contact {
            id: "contact-1".into(),
            name: Some("Ann Borrower".into()),
            email: Some("ann@example.com".into()),
            existing_rate: Some(6.5),
            loan_amount: Some(350_000.0),
            created_at: Some(now - Duration::days(2)),
            ..Default::default()
        })
        .await;

    let receiver = Arc::new(AcceptingReceiver::default());
    let clock = Arc::new(FixedClock::new(now));
    let dispatcher = WebhookDispatcher::new(
        WebhookSettings {
            url: "https://rosie.test/api/rosie-alert".into(),
            secret: "s".into(),
        },
        receiver.clone(),
        store.clone(),
        clock.clone(),
    )
    .with_sleeper(Arc::new(RecordingSleeper::new()));

    let engine = RateGuardianEngine::new(
        store.clone(),
        Arc::new(FixedRate(5.7)),
        ActiveThresholds {
            version: ThresholdVersion {
                id: "tv-2026-03".into(),
                version_name: "2026-03".into(),
            },
            thresholds: ThresholdSet::new().with("trigger_threshold_30yr", 50),
        },
        clock,
        Capability::Available(dispatcher),
    )
    .with_run_lock(true);

    let result = match engine.trigger(RunRequest::default()).await.unwrap() {
        RunOutcome::Completed(result) => result,
        RunOutcome::Skipped { bucket } => panic!("unexpected skip in {bucket}"),
    };
    assert_eq!(result.contacts_processed, 1);
    assert_eq!(result.opportunities_found, 1);
    assert_eq!(result.alerts_sent, 1);
    assert_eq!(result.status, RunStatus::Success);
    assert!(result.last_error.is_none());

    let alerts = store.alerts().await;
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.delta, 80);
    assert_eq!(alert.message_type, "C");
    assert!((alert.estimated_savings - 233.33).abs() < 0.01);
    assert!(alert.alert_sent);
    assert_eq!(alert.attempts, 1);

    let rate_alerts = store.rate_alerts().await;
    assert_eq!(rate_alerts.len(), 1);
    assert_eq!(rate_alerts[0].alert_date, now.date_naive());

    let sent = receiver.received.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        verify_signature(Some("s"), &sent[0].body, sent[0].header(SIGNATURE_HEADER)),
        Ok(())
    );
    assert!(store.dead_letters().await.is_empty());

    let runs = store.runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, result.run_id);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].stats.alerts_sent, 1);
    assert!(runs[0].completed_at.is_some());

    let contact = store.contact("contact-1").await.unwrap();
    assert_eq!(contact.oppty_tier, Some(Tier::C));
    assert_eq!(contact.rate_delta_bps, Some(80));
    assert_eq!(contact.eligible_rate_today, Some(5.7));
    assert!(!contact.trigger_flag);

    // Same window: the lock turns the second trigger into a no-op.
    assert!(matches!(
        engine.trigger(RunRequest::default()).await.unwrap(),
        RunOutcome::Skipped { .. }
    ));
    assert_eq!(store.runs().await.len(), 1);
}
