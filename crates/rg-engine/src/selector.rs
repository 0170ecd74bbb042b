//! Eligibility selector: the bounded page of contacts a run works on.

use rg_core::{Contact, EligibilityQuery};
use rg_storage::{GuardianStore, StoreError};
use tracing::info;

pub async fn select_contacts(
    store: &dyn GuardianStore,
    query: &EligibilityQuery,
) -> Result<Vec<Contact>, StoreError> {
    let contacts = store.select_eligible_contacts(query).await?;
    if contacts.is_empty() {
        info!(
            stage = "engine:no-contacts",
            limit = query.limit,
            contact_id = query.contact_id.as_deref().unwrap_or_default(),
            "no eligible contacts found"
        );
    } else {
        info!(
            stage = "contacts:selected",
            count = contacts.len(),
            limit = query.limit,
            "selected eligible contacts"
        );
    }
    Ok(contacts)
}
