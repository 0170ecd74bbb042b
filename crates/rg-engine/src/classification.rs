//! Classification stage: product-aware rules applied to engine subjects, and
//! the hash-keyed audit row that makes re-classification idempotent.

use chrono::{DateTime, NaiveDate, Utc};
use rg_core::{
    classify, state_hash, ClassificationResult, ContactAlertSubject, Classification, LoanProfile,
    OpportunityEstimate,
};
use rg_storage::{GuardianStore, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ActiveThresholds;

/// Classify a freshly computed opportunity. With a loan profile the rules read
/// the normalized loan (its rate, today's market rate); without one they read
/// the flat contact-level figures.
pub fn classify_evaluation(
    estimate: &OpportunityEstimate,
    loan: Option<&LoanProfile>,
    active: &ActiveThresholds,
    as_of: NaiveDate,
) -> ClassificationResult {
    match loan {
        Some(profile) => {
            let mut subject = profile.clone();
            subject.market_rate = Some(estimate.market_rate);
            if subject.current_rate.filter(|r| r.is_finite() && *r > 0.0).is_none() {
                subject.current_rate = Some(estimate.existing_rate);
            }
            classify(&subject, &active.version, &active.thresholds, as_of)
        }
        None => {
            let subject = ContactAlertSubject {
                loan_type: None,
                current_rate: Some(estimate.existing_rate),
                market_rate: Some(estimate.market_rate),
                loan: None,
            };
            classify(&subject, &active.version, &active.thresholds, as_of)
        }
    }
}

/// Build the durable row for a decision about `loan`.
pub fn build_classification(
    contact_id: &str,
    loan: &LoanProfile,
    alert_id: Option<Uuid>,
    result: &ClassificationResult,
    created_at: DateTime<Utc>,
) -> Result<Classification, serde_json::Error> {
    let threshold_version_id = result.threshold_snapshot.threshold_version_id.clone();
    Ok(Classification {
        id: Uuid::new_v4(),
        state_hash: state_hash(
            contact_id,
            &loan.property_fingerprint,
            &loan.loan_fingerprint,
            &threshold_version_id,
        ),
        contact_id: contact_id.to_string(),
        property_fingerprint: loan.property_fingerprint.clone(),
        loan_fingerprint: loan.loan_fingerprint.clone(),
        loan_profile_id: Some(loan.id),
        alert_id,
        threshold_version_id,
        opportunity: result.opportunity,
        decision: result.decision,
        disposition: result.disposition,
        reason: result.reason.clone(),
        rule_id: result.rule_id.clone(),
        threshold_snapshot: serde_json::to_value(&result.threshold_snapshot)?,
        created_at,
    })
}

/// Insert-ignore keyed by the state hash. `true` when a new row was written.
pub async fn record_classification(
    store: &dyn GuardianStore,
    classification: &Classification,
) -> Result<bool, StoreError> {
    match store.insert_classification(classification).await {
        Ok(true) => {
            info!(
                stage = "classification:recorded",
                contact_id = %classification.contact_id,
                decision = classification.decision.as_str(),
                disposition = classification.disposition.as_str(),
                rule_id = %classification.rule_id,
                "classification recorded"
            );
            Ok(true)
        }
        Ok(false) => {
            info!(
                stage = "classification:duplicate",
                contact_id = %classification.contact_id,
                state_hash = %classification.state_hash,
                "state already classified"
            );
            Ok(false)
        }
        Err(err) if err.is_conflict() => Ok(false),
        Err(err) => {
            warn!(
                stage = "classification:error",
                contact_id = %classification.contact_id,
                error = %err,
                "failed to record classification"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rg_core::{Decision, Disposition, IntakeShape, ThresholdSet, ThresholdVersion};
    use rg_storage::MemoryStore;

    fn active(id: &str) -> ActiveThresholds {
        ActiveThresholds {
            version: ThresholdVersion {
                id: id.into(),
                version_name: "v1".into(),
            },
            thresholds: ThresholdSet::new()
                .with("trigger_threshold_30yr", 50)
                .with("trigger_threshold_15yr", 90),
        }
    }

    fn estimate() -> OpportunityEstimate {
        rg_core::evaluate(Some(6.5), Some(350_000.0), 5.7)
            .estimate()
            .unwrap()
            .clone()
    }

    fn loan(label: &str) -> LoanProfile {
        LoanProfile {
            id: Uuid::new_v4(),
            contact_id: "c1".into(),
            property_fingerprint: "prop-1".into(),
            loan_fingerprint: "loan-1".into(),
            loan_type_raw: Some(label.into()),
            product_normalized: None,
            loan_amount: Some(350_000.0),
            current_rate: Some(6.5),
            market_rate: Some(1.0),
            credit_score: Some(720),
            rate_lock_date: None,
            arm_adjustment_date: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[test]
    fn flat_contact_shape_uses_default_product() {
        let result = classify_evaluation(&estimate(), None, &active("tv-1"), today());
        assert_eq!(result.threshold_snapshot.intake_shape, IntakeShape::ContactAlert);
        assert_eq!(result.threshold_snapshot.delta_bps, 80);
        assert_eq!(result.decision, Decision::Notify);
    }

    #[test]
    fn loan_shape_uses_todays_market_rate_and_product_threshold() {
        let profile = loan("15 year fixed");
        let result = classify_evaluation(&estimate(), Some(&profile), &active("tv-1"), today());
        assert_eq!(result.threshold_snapshot.intake_shape, IntakeShape::NormalizedLoan);
        assert_eq!(result.threshold_snapshot.market_rate, 5.7);
        assert_eq!(result.threshold_snapshot.threshold_bps, 90.0);
        assert_eq!(result.decision, Decision::Hold);
        assert_eq!(result.disposition, Disposition::Hold);
    }

    #[tokio::test]
    async fn unchanged_state_classifies_once_and_version_bump_adds_one() {
        let store = MemoryStore::new();
        let profile = loan("30 year fixed");
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).single().unwrap();

        for _ in 0..3 {
            let result = classify_evaluation(&estimate(), Some(&profile), &active("tv-1"), today());
            let row = build_classification("c1", &profile, None, &result, at).unwrap();
            record_classification(&store, &row).await.unwrap();
        }
        assert_eq!(store.classifications().await.len(), 1);

        let result = classify_evaluation(&estimate(), Some(&profile), &active("tv-2"), today());
        let row = build_classification("c1", &profile, None, &result, at).unwrap();
        assert!(record_classification(&store, &row).await.unwrap());
        assert_eq!(store.classifications().await.len(), 2);
    }

    #[test]
    fn snapshot_is_stored_as_json() {
        let profile = loan("Jumbo");
        let result = classify_evaluation(&estimate(), Some(&profile), &active("tv-1"), today());
        let row = build_classification("c1", &profile, None, &result, Utc::now()).unwrap();
        assert_eq!(row.threshold_snapshot["product"], "jumbo");
        assert_eq!(row.threshold_snapshot["threshold_key"], "trigger_threshold_jumbo");
        assert_eq!(row.rule_id, "guardian-os-core-v1:v1:jumbo:trigger_threshold_jumbo");
        assert_eq!(row.state_hash.len(), 64);
    }
}
