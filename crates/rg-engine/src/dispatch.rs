//! Webhook dispatcher: signed delivery with bounded linear retry and a
//! dead-letter record once attempts run out.

use std::sync::Arc;

use rg_core::{truncate_chars, Alert, DeadLetter};
use rg_storage::{
    GuardianStore, LinearBackoff, OutboundRequest, Sleeper, TokioSleeper, WebhookTransport,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::WebhookSettings;

pub const DEAD_LETTER_ERROR_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: String,
        dead_lettered: bool,
    },
    #[error("could not encode alert payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Exhausted { attempts, .. } => *attempts,
            DeliveryError::Encode(_) => 0,
        }
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    settings: WebhookSettings,
    transport: Arc<dyn WebhookTransport>,
    store: Arc<dyn GuardianStore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    backoff: LinearBackoff,
}

impl WebhookDispatcher {
    pub fn new(
        settings: WebhookSettings,
        transport: Arc<dyn WebhookTransport>,
        store: Arc<dyn GuardianStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            transport,
            store,
            clock,
            sleeper: Arc::new(TokioSleeper),
            backoff: LinearBackoff::default(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_backoff(mut self, backoff: LinearBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// First delivery of a new alert. Exhausted retries leave a dead letter.
    pub async fn dispatch(&self, alert: &Alert) -> Result<Delivered, DeliveryError> {
        let span = info_span!("webhook_dispatch", alert_id = %alert.id, contact_id = %alert.contact_id);
        self.dispatch_inner(alert, true).instrument(span).await
    }

    /// Relay of an alert that already failed once. The alert row carries the
    /// failure state, so no further dead letter is written.
    pub async fn redeliver(&self, alert: &Alert) -> Result<Delivered, DeliveryError> {
        let span = info_span!("webhook_redeliver", alert_id = %alert.id, contact_id = %alert.contact_id);
        self.dispatch_inner(alert, false).instrument(span).await
    }

    async fn dispatch_inner(
        &self,
        alert: &Alert,
        dead_letter_on_failure: bool,
    ) -> Result<Delivered, DeliveryError> {
        let payload = serde_json::to_value(alert.payload())?;
        let body = serde_json::to_vec(&payload)?;
        let request = OutboundRequest::signed_json(
            &self.settings.url,
            body,
            &self.settings.secret,
            &alert.id.to_string(),
        );

        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.transport.post(&request).await {
                Ok(resp) if resp.is_success() => {
                    info!(stage = "webhook:sent", attempt, status = resp.status, "webhook delivered");
                    return Ok(Delivered { attempts: attempt });
                }
                Ok(resp) => {
                    last_error = if resp.body.is_empty() {
                        format!("HTTP {}", resp.status)
                    } else {
                        resp.body
                    };
                    warn!(
                        stage = "webhook:retry",
                        attempt,
                        status = resp.status,
                        error = %last_error,
                        "webhook attempt failed"
                    );
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(stage = "webhook:retry", attempt, error = %last_error, "webhook network error");
                }
            }
            if attempt < max_attempts {
                self.sleeper
                    .sleep(self.backoff.delay_for_attempt(attempt))
                    .await;
            }
        }

        error!(stage = "webhook:failed", attempts = max_attempts, error = %last_error, "failed to deliver webhook");
        if !dead_letter_on_failure {
            return Err(DeliveryError::Exhausted {
                attempts: max_attempts,
                last_error,
                dead_lettered: false,
            });
        }
        let dead_letter = DeadLetter {
            id: Uuid::new_v4(),
            alert_id: Some(alert.id),
            contact_id: Some(alert.contact_id.clone()),
            payload,
            attempts: max_attempts,
            last_error: truncate_chars(&last_error, DEAD_LETTER_ERROR_CHARS),
            created_at: self.clock.now(),
        };
        let dead_lettered = match self.store.insert_dead_letter(&dead_letter).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    stage = "webhook:dead-letter:error",
                    error = %err,
                    "failed to persist webhook failure"
                );
                false
            }
        };

        Err(DeliveryError::Exhausted {
            attempts: max_attempts,
            last_error,
            dead_lettered,
        })
    }
}
