//! Run ledger. Observability only: write failures are logged and never stop a run.

use std::sync::Arc;

use rg_core::{RunLedgerEntry, RunStats, RunStatus};
use rg_storage::GuardianStore;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::Clock;

#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn GuardianStore>,
    clock: Arc<dyn Clock>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn GuardianStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn start_run(&self) -> RunLedgerEntry {
        self.start_run_with_id(Uuid::new_v4()).await
    }

    pub async fn start_run_with_id(&self, run_id: Uuid) -> RunLedgerEntry {
        let entry = RunLedgerEntry {
            run_id,
            started_at: self.clock.now(),
            completed_at: None,
            stats: RunStats::default(),
            status: RunStatus::Started,
            last_error: None,
        };
        match self.store.start_run(&entry).await {
            Ok(()) => info!(stage = "runLedger:start", %run_id, "run started"),
            Err(err) => error!(
                stage = "runLedger:start:error",
                %run_id,
                error = %err,
                "failed to insert run"
            ),
        }
        entry
    }

    pub async fn complete_run(
        &self,
        started: &RunLedgerEntry,
        stats: RunStats,
        status: RunStatus,
        last_error: Option<String>,
    ) -> RunLedgerEntry {
        let entry = RunLedgerEntry {
            completed_at: Some(self.clock.now()),
            stats,
            status,
            last_error,
            ..started.clone()
        };
        match self.store.complete_run(&entry).await {
            Ok(()) => info!(
                stage = "runLedger:complete",
                run_id = %entry.run_id,
                status = status.as_str(),
                contacts_processed = stats.contacts_processed,
                opportunities_found = stats.opportunities_found,
                alerts_sent = stats.alerts_sent,
                "run completed"
            ),
            Err(err) => error!(
                stage = "runLedger:complete:error",
                run_id = %entry.run_id,
                error = %err,
                "failed to update run"
            ),
        }
        entry
    }
}
