//! Per-contact stages that sit between selection and alerting.

use chrono::{DateTime, Utc};
use rg_adapters::{RateSource, RateSourceError};
use rg_core::{
    evaluate, Contact, ContactEvaluation, OpportunityCheck, OpportunityEstimate, ProductCategory,
};
use rg_storage::GuardianStore;
use tracing::{info, warn};

/// Fetch the market rate and run the calculator for one contact.
pub async fn compute_opportunity(
    rates: &dyn RateSource,
    contact: &Contact,
    product: Option<ProductCategory>,
) -> Result<OpportunityCheck, RateSourceError> {
    let market_rate = rates.current_rate(product).await?;
    let check = evaluate(contact.existing_rate, contact.loan_amount, market_rate);
    match &check {
        OpportunityCheck::BelowFloor {
            rate_delta_bps,
            loan_amount,
        } => info!(
            stage = "opportunity:skip",
            contact_id = %contact.id,
            rate_delta_bps,
            loan_amount,
            market_rate,
            "below eligibility floor"
        ),
        OpportunityCheck::Eligible(est) => info!(
            stage = "opportunity:computed",
            contact_id = %contact.id,
            rate_delta_bps = est.rate_delta_bps,
            score = est.score,
            tier = est.tier.as_str(),
            market_rate,
            "opportunity computed"
        ),
    }
    Ok(check)
}

/// Record that the contact was evaluated. Failures are logged only.
pub async fn write_back(
    store: &dyn GuardianStore,
    contact: &Contact,
    evaluated_at: DateTime<Utc>,
    estimate: Option<&OpportunityEstimate>,
) {
    let evaluation = ContactEvaluation {
        evaluated_at,
        estimate: estimate.cloned(),
    };
    if let Err(err) = store.update_contact_evaluation(&contact.id, &evaluation).await {
        warn!(
            stage = "engine:contact:update:error",
            contact_id = %contact.id,
            error = %err,
            "failed to update contact post run"
        );
    }
}
