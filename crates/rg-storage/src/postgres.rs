//! PostgreSQL-backed [`GuardianStore`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rg_core::{
    Alert, Classification, Contact, ContactEvaluation, DeadLetter, DeliveryUpdate,
    EligibilityQuery, LoanProfile, OpportunityEstimate, OpportunityRecord,
    RateAlert, RunLedgerEntry, Tier, LOOKBACK_HOURS, RECENT_INTAKE_DAYS, RECENT_INTAKE_SOURCE,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{GuardianStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool that connects on first use, so a process can start without the database.
    pub fn connect_lazy(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!(stage = "store:migrate", "migrations applied");
        Ok(())
    }
}

fn to_u32(column: &'static str, value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Decode {
        column,
        value: value.to_string(),
    })
}

fn to_i32(column: &'static str, value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Decode {
        column,
        value: value.to_string(),
    })
}

fn bps_to_i32(column: &'static str, value: i64) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Decode {
        column,
        value: value.to_string(),
    })
}

fn opt_u32(column: &'static str, value: Option<i32>) -> StoreResult<Option<u32>> {
    value.map(|v| to_u32(column, v)).transpose()
}

fn contact_from_row(row: &PgRow) -> StoreResult<Contact> {
    let tier: Option<String> = row.try_get("oppty_tier")?;
    let delta: Option<i32> = row.try_get("rate_delta_bps")?;
    Ok(Contact {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
        flag_monitor: row.try_get("flag_monitor")?,
        trigger_flag: row.try_get("trigger_flag")?,
        last_run_at: row.try_get("last_run_at")?,
        existing_rate: row.try_get("existing_rate")?,
        loan_amount: row.try_get("loan_amount")?,
        oppty_tier: tier.as_deref().and_then(Tier::parse),
        oppty_score: opt_u32("oppty_score", row.try_get("oppty_score")?)?,
        monthly_savings_est: row.try_get("monthly_savings_est")?,
        total_savings: row.try_get("total_savings")?,
        breakeven_months: opt_u32("breakeven_months", row.try_get("breakeven_months")?)?,
        rate_delta_bps: delta.map(i64::from),
        eligible_rate_today: row.try_get("eligible_rate_today")?,
    })
}

fn loan_profile_from_row(row: &PgRow) -> StoreResult<LoanProfile> {
    Ok(LoanProfile {
        id: row.try_get("id")?,
        contact_id: row.try_get("contact_id")?,
        property_fingerprint: row.try_get("property_fingerprint")?,
        loan_fingerprint: row.try_get("loan_fingerprint")?,
        loan_type_raw: row.try_get("loan_type_raw")?,
        product_normalized: row.try_get("product_normalized")?,
        loan_amount: row.try_get("loan_amount")?,
        current_rate: row.try_get("current_rate")?,
        market_rate: row.try_get("market_rate")?,
        credit_score: opt_u32("credit_score", row.try_get("credit_score")?)?,
        rate_lock_date: row.try_get("rate_lock_date")?,
        arm_adjustment_date: row.try_get("arm_adjustment_date")?,
    })
}

fn opportunity_from_row(row: &PgRow) -> StoreResult<OpportunityRecord> {
    let tier: String = row.try_get("tier")?;
    let delta: i32 = row.try_get("rate_delta_bps")?;
    Ok(OpportunityRecord {
        id: row.try_get("id")?,
        contact_id: row.try_get("contact_id")?,
        estimate: OpportunityEstimate {
            market_rate: row.try_get("market_rate")?,
            existing_rate: row.try_get("existing_rate")?,
            loan_amount: row.try_get("loan_amount")?,
            rate_delta_bps: i64::from(delta),
            monthly_savings: row.try_get("monthly_savings")?,
            total_savings: row.try_get("total_savings")?,
            breakeven_months: to_u32("breakeven_months", row.try_get("breakeven_months")?)?,
            score: to_u32("score", row.try_get("score")?)?,
            tier: Tier::parse(&tier).ok_or(StoreError::Decode {
                column: "tier",
                value: tier.clone(),
            })?,
        },
        updated_at: row.try_get("updated_at")?,
    })
}

fn alert_from_row(row: &PgRow) -> StoreResult<Alert> {
    let delta: i32 = row.try_get("delta")?;
    Ok(Alert {
        id: row.try_get("id")?,
        contact_id: row.try_get("contact_id")?,
        name: row.try_get("name")?,
        loan_type: row.try_get("loan_type")?,
        current_rate: row.try_get("current_rate")?,
        market_rate: row.try_get("market_rate")?,
        delta: i64::from(delta),
        estimated_savings: row.try_get("estimated_savings")?,
        message_type: row.try_get("message_type")?,
        inserted_at: row.try_get("inserted_at")?,
        alert_sent: row.try_get("alert_sent")?,
        attempts: to_u32("attempts", row.try_get("attempts")?)?,
        last_error: row.try_get("last_error")?,
        processed_at: row.try_get("processed_at")?,
    })
}

const ALERT_COLUMNS: &str = "id, contact_id, name, loan_type, current_rate, market_rate, delta, \
     estimated_savings, message_type, inserted_at, alert_sent, attempts, last_error, processed_at";

#[async_trait]
impl GuardianStore for PgStore {
    async fn select_eligible_contacts(&self, query: &EligibilityQuery) -> StoreResult<Vec<Contact>> {
        let lookback = query.now - chrono::Duration::hours(LOOKBACK_HOURS);
        let recency = query.now - chrono::Duration::days(RECENT_INTAKE_DAYS);
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT id, name, email, phone, source, created_at, flag_monitor, trigger_flag,
                   last_run_at, existing_rate, loan_amount, oppty_tier, oppty_score,
                   monthly_savings_est, total_savings, breakeven_months, rate_delta_bps,
                   eligible_rate_today
              FROM contacts
             WHERE ($1::text IS NULL OR id = $1)
               AND ($2::text IS NULL OR lower(email) = $2)
               AND (
                    flag_monitor
                 OR (source = $3 AND created_at >= $4)
                 OR trigger_flag
                 OR last_run_at IS NULL
                 OR last_run_at <= $5
               )
             ORDER BY created_at DESC NULLS LAST
             LIMIT $6
            "#,
        )
        .bind(query.contact_id.as_deref())
        .bind(query.email.as_deref())
        .bind(RECENT_INTAKE_SOURCE)
        .bind(recency)
        .bind(lookback)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(contact_from_row).collect()
    }

    async fn update_contact_evaluation(
        &self,
        contact_id: &str,
        evaluation: &ContactEvaluation,
    ) -> StoreResult<()> {
        let est = evaluation.estimate.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE contacts
               SET last_run_at = $2,
                   trigger_flag = FALSE,
                   oppty_tier = COALESCE($3, oppty_tier),
                   oppty_score = COALESCE($4, oppty_score),
                   monthly_savings_est = COALESCE($5, monthly_savings_est),
                   total_savings = COALESCE($6, total_savings),
                   breakeven_months = COALESCE($7, breakeven_months),
                   rate_delta_bps = COALESCE($8, rate_delta_bps),
                   eligible_rate_today = COALESCE($9, eligible_rate_today)
             WHERE id = $1
            "#,
        )
        .bind(contact_id)
        .bind(evaluation.evaluated_at)
        .bind(est.map(|e| e.tier.as_str()))
        .bind(est.map(|e| to_i32("oppty_score", e.score)).transpose()?)
        .bind(est.map(|e| e.monthly_savings))
        .bind(est.map(|e| e.total_savings))
        .bind(
            est.map(|e| to_i32("breakeven_months", e.breakeven_months))
                .transpose()?,
        )
        .bind(
            est.map(|e| bps_to_i32("rate_delta_bps", e.rate_delta_bps))
                .transpose()?,
        )
        .bind(est.map(|e| e.market_rate))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "contact",
                key: contact_id.to_string(),
            });
        }
        Ok(())
    }

    async fn loan_profile_for_contact(&self, contact_id: &str) -> StoreResult<Option<LoanProfile>> {
        let row = sqlx::query(
            r#"
            SELECT id, contact_id, property_fingerprint, loan_fingerprint, loan_type_raw,
                   product_normalized, loan_amount, current_rate, market_rate, credit_score,
                   rate_lock_date, arm_adjustment_date
              FROM rg_loan_profiles
             WHERE contact_id = $1
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(loan_profile_from_row).transpose()
    }

    async fn upsert_opportunity(&self, record: &OpportunityRecord) -> StoreResult<OpportunityRecord> {
        let est = &record.estimate;
        let row = sqlx::query(
            r#"
            INSERT INTO rate_opportunities
                (id, contact_id, market_rate, existing_rate, loan_amount, rate_delta_bps,
                 monthly_savings, total_savings, breakeven_months, score, tier, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (contact_id) DO UPDATE
               SET market_rate = EXCLUDED.market_rate,
                   existing_rate = EXCLUDED.existing_rate,
                   loan_amount = EXCLUDED.loan_amount,
                   rate_delta_bps = EXCLUDED.rate_delta_bps,
                   monthly_savings = EXCLUDED.monthly_savings,
                   total_savings = EXCLUDED.total_savings,
                   breakeven_months = EXCLUDED.breakeven_months,
                   score = EXCLUDED.score,
                   tier = EXCLUDED.tier,
                   updated_at = EXCLUDED.updated_at
            RETURNING id, contact_id, market_rate, existing_rate, loan_amount, rate_delta_bps,
                      monthly_savings, total_savings, breakeven_months, score, tier, updated_at
            "#,
        )
        .bind(record.id)
        .bind(&record.contact_id)
        .bind(est.market_rate)
        .bind(est.existing_rate)
        .bind(est.loan_amount)
        .bind(bps_to_i32("rate_delta_bps", est.rate_delta_bps)?)
        .bind(est.monthly_savings)
        .bind(est.total_savings)
        .bind(to_i32("breakeven_months", est.breakeven_months)?)
        .bind(to_i32("score", est.score)?)
        .bind(est.tier.as_str())
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;

        opportunity_from_row(&row)
    }

    async fn find_rate_alert(
        &self,
        contact_id: &str,
        alert_date: NaiveDate,
    ) -> StoreResult<Option<RateAlert>> {
        let row = sqlx::query(
            r#"
            SELECT id, contact_id, opportunity_id, alert_date, alert_type, status, created_at
              FROM rate_alerts
             WHERE contact_id = $1 AND alert_date = $2
            "#,
        )
        .bind(contact_id)
        .bind(alert_date)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(RateAlert {
                id: row.try_get("id")?,
                contact_id: row.try_get("contact_id")?,
                opportunity_id: row.try_get("opportunity_id")?,
                alert_date: row.try_get("alert_date")?,
                alert_type: row.try_get("alert_type")?,
                status: row.try_get("status")?,
                created_at: row.try_get("created_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts
                (id, contact_id, name, loan_type, current_rate, market_rate, delta,
                 estimated_savings, message_type, inserted_at, alert_sent, attempts,
                 last_error, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(alert.id)
        .bind(&alert.contact_id)
        .bind(&alert.name)
        .bind(&alert.loan_type)
        .bind(alert.current_rate)
        .bind(alert.market_rate)
        .bind(bps_to_i32("delta", alert.delta)?)
        .bind(alert.estimated_savings)
        .bind(&alert.message_type)
        .bind(alert.inserted_at)
        .bind(alert.alert_sent)
        .bind(to_i32("attempts", alert.attempts)?)
        .bind(alert.last_error.as_deref())
        .bind(alert.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_rate_alert(&self, rate_alert: &RateAlert) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_alerts
                (id, contact_id, opportunity_id, alert_date, alert_type, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(rate_alert.id)
        .bind(&rate_alert.contact_id)
        .bind(rate_alert.opportunity_id)
        .bind(rate_alert.alert_date)
        .bind(&rate_alert.alert_type)
        .bind(&rate_alert.status)
        .bind(rate_alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivery(&self, alert_id: Uuid, update: &DeliveryUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
               SET alert_sent = $2,
                   attempts = attempts + $3,
                   last_error = $4,
                   processed_at = $5
             WHERE id = $1
            "#,
        )
        .bind(alert_id)
        .bind(update.delivered)
        .bind(to_i32("attempts", update.attempts)?)
        .bind(update.last_error.as_deref())
        .bind(update.processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "alert",
                key: alert_id.to_string(),
            });
        }
        Ok(())
    }

    async fn pending_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE alert_sent = FALSE \
             ORDER BY inserted_at ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn alerts_for_classification(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE contact_id IS NOT NULL AND contact_id <> '' \
             ORDER BY inserted_at ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn insert_classification(&self, classification: &Classification) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO rg_classifications
                (id, state_hash, contact_id, property_fingerprint, loan_fingerprint,
                 loan_profile_id, alert_id, threshold_version_id, opportunity, decision,
                 disposition, reason, rule_id, threshold_snapshot, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (state_hash) DO NOTHING
            "#,
        )
        .bind(classification.id)
        .bind(&classification.state_hash)
        .bind(&classification.contact_id)
        .bind(&classification.property_fingerprint)
        .bind(&classification.loan_fingerprint)
        .bind(classification.loan_profile_id)
        .bind(classification.alert_id)
        .bind(&classification.threshold_version_id)
        .bind(classification.opportunity)
        .bind(classification.decision.as_str())
        .bind(classification.disposition.as_str())
        .bind(&classification.reason)
        .bind(&classification.rule_id)
        .bind(&classification.threshold_snapshot)
        .bind(classification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rg_webhook_dead_letter
                (id, alert_id, contact_id, payload, attempts, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(dead_letter.id)
        .bind(dead_letter.alert_id)
        .bind(dead_letter.contact_id.as_deref())
        .bind(&dead_letter.payload)
        .bind(to_i32("attempts", dead_letter.attempts)?)
        .bind(&dead_letter.last_error)
        .bind(dead_letter.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn start_run(&self, entry: &RunLedgerEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rg_run_ledger
                (run_id, started_at, contacts_processed, opportunities_found, alerts_sent, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.run_id)
        .bind(entry.started_at)
        .bind(to_i32("contacts_processed", entry.stats.contacts_processed)?)
        .bind(to_i32("opportunities_found", entry.stats.opportunities_found)?)
        .bind(to_i32("alerts_sent", entry.stats.alerts_sent)?)
        .bind(entry.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run(&self, entry: &RunLedgerEntry) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE rg_run_ledger
               SET completed_at = $2,
                   contacts_processed = $3,
                   opportunities_found = $4,
                   alerts_sent = $5,
                   status = $6,
                   last_error = $7
             WHERE run_id = $1
            "#,
        )
        .bind(entry.run_id)
        .bind(entry.completed_at)
        .bind(to_i32("contacts_processed", entry.stats.contacts_processed)?)
        .bind(to_i32("opportunities_found", entry.stats.opportunities_found)?)
        .bind(to_i32("alerts_sent", entry.stats.alerts_sent)?)
        .bind(entry.status.as_str())
        .bind(entry.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                key: entry.run_id.to_string(),
            });
        }
        Ok(())
    }

    async fn try_acquire_run_lock(
        &self,
        bucket: &str,
        run_id: Uuid,
        acquired_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO rg_run_locks (bucket, run_id, acquired_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (bucket) DO NOTHING
            "#,
        )
        .bind(bucket)
        .bind(run_id)
        .bind(acquired_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
