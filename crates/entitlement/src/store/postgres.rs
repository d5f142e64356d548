//! Postgres entitlement store
//!
//! Every mutation is a single conditional statement: phase persists are
//! guarded by `version`, the job counter by an increment-if-below-limit,
//! the monthly reset by a month comparison on `last_counter_reset_at`, and
//! event dedup by `INSERT .. ON CONFLICT DO NOTHING`. The partial unique
//! index on live statuses enforces at-most-one live subscription per
//! tenant.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};
use crate::event::{BillingEvent, ProcessedOutcome};
use crate::plan::{JobLimit, Plan};
use crate::subscription::{Phase, Subscription};
use crate::usage::ReserveOutcome;

use super::{EntitlementStore, TransitionUpdate};

const LIVE_STATUSES: &str = "('trial','active','past_due','grace_period')";
const ENTITLED_STATUSES: &str = "('trial','active','grace_period')";

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, tenant_id, plan_id, status,
    period_start, period_end, grace_ends_at, grace_days,
    payment_failed_at, ended_at, expired_at, suspension_reason,
    trial_ends_at, external_customer_ref, external_subscription_ref,
    last_event_at, jobs_created_this_month, last_counter_reset_at,
    created_at, version
"#;

/// Postgres-backed implementation of [`EntitlementStore`]
#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the crate's SQL migrations
    pub async fn run_migrations(&self) -> EntitlementResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EntitlementError::Storage(e.to_string()))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    monthly_price_cents: i64,
    job_limit: Option<i32>,
    member_limit: i32,
    features: serde_json::Value,
    is_custom: bool,
    custom_owner_tenant_id: Option<Uuid>,
}

impl PlanRow {
    fn into_plan(self) -> EntitlementResult<Plan> {
        let job_limit = match self.job_limit {
            None => JobLimit::Unlimited,
            Some(n) if n >= 0 => JobLimit::Limited(n as u32),
            Some(n) => {
                return Err(EntitlementError::Storage(format!(
                    "plan {} has negative job_limit {n}",
                    self.id
                )))
            }
        };
        let features: Vec<String> = serde_json::from_value(self.features)
            .map_err(|e| EntitlementError::Storage(format!("plan {} features: {e}", self.id)))?;
        Ok(Plan {
            id: self.id,
            name: self.name,
            monthly_price_cents: self.monthly_price_cents,
            job_limit,
            member_limit: self.member_limit.max(1) as u32,
            features,
            is_custom: self.is_custom,
            custom_owner_tenant_id: self.custom_owner_tenant_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    plan_id: Uuid,
    status: String,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    grace_ends_at: Option<OffsetDateTime>,
    grace_days: Option<i32>,
    payment_failed_at: Option<OffsetDateTime>,
    ended_at: Option<OffsetDateTime>,
    expired_at: Option<OffsetDateTime>,
    suspension_reason: Option<String>,
    trial_ends_at: Option<OffsetDateTime>,
    external_customer_ref: Option<String>,
    external_subscription_ref: Option<String>,
    last_event_at: Option<OffsetDateTime>,
    jobs_created_this_month: i64,
    last_counter_reset_at: OffsetDateTime,
    created_at: OffsetDateTime,
    version: i64,
}

impl SubscriptionRow {
    fn into_subscription(self) -> EntitlementResult<Subscription> {
        let corrupt = |what: &str| {
            EntitlementError::Storage(format!(
                "subscription {} in status '{}' missing {what}",
                self.id, self.status
            ))
        };
        let phase = match self.status.as_str() {
            "trial" => Phase::Trial {
                trial_ends_at: self.trial_ends_at.ok_or_else(|| corrupt("trial_ends_at"))?,
            },
            "active" => Phase::Active {
                period_start: self.period_start.ok_or_else(|| corrupt("period_start"))?,
                period_end: self.period_end.ok_or_else(|| corrupt("period_end"))?,
            },
            "past_due" => Phase::PastDue {
                period_end: self.period_end.ok_or_else(|| corrupt("period_end"))?,
                payment_failed_at: self
                    .payment_failed_at
                    .ok_or_else(|| corrupt("payment_failed_at"))?,
            },
            "grace_period" => Phase::GracePeriod {
                grace_ends_at: self.grace_ends_at.ok_or_else(|| corrupt("grace_ends_at"))?,
                granted_days: self.grace_days.ok_or_else(|| corrupt("grace_days"))?.max(0) as u32,
            },
            "canceled" => Phase::Canceled {
                ended_at: self.ended_at.ok_or_else(|| corrupt("ended_at"))?,
                suspension_reason: self.suspension_reason,
            },
            "expired" => Phase::Expired {
                expired_at: self.expired_at.ok_or_else(|| corrupt("expired_at"))?,
            },
            other => {
                return Err(EntitlementError::Storage(format!(
                    "subscription {} has unknown status '{other}'",
                    self.id
                )))
            }
        };
        Ok(Subscription {
            id: self.id,
            tenant_id: self.tenant_id,
            plan_id: self.plan_id,
            phase,
            trial_ends_at: self.trial_ends_at,
            external_customer_ref: self.external_customer_ref,
            external_subscription_ref: self.external_subscription_ref,
            last_event_at: self.last_event_at,
            jobs_created_this_month: self.jobs_created_this_month,
            last_counter_reset_at: self.last_counter_reset_at,
            created_at: self.created_at,
            version: self.version,
        })
    }
}

/// Nullable column values for one phase variant
struct PhaseColumns {
    status: &'static str,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    grace_ends_at: Option<OffsetDateTime>,
    grace_days: Option<i32>,
    payment_failed_at: Option<OffsetDateTime>,
    ended_at: Option<OffsetDateTime>,
    expired_at: Option<OffsetDateTime>,
    suspension_reason: Option<String>,
}

fn phase_columns(phase: &Phase) -> PhaseColumns {
    let mut columns = PhaseColumns {
        status: phase.status().as_str(),
        period_start: None,
        period_end: None,
        grace_ends_at: None,
        grace_days: None,
        payment_failed_at: None,
        ended_at: None,
        expired_at: None,
        suspension_reason: None,
    };
    match phase {
        Phase::Trial { .. } => {}
        Phase::Active {
            period_start,
            period_end,
        } => {
            columns.period_start = Some(*period_start);
            columns.period_end = Some(*period_end);
        }
        Phase::PastDue {
            period_end,
            payment_failed_at,
        } => {
            columns.period_end = Some(*period_end);
            columns.payment_failed_at = Some(*payment_failed_at);
        }
        Phase::GracePeriod {
            grace_ends_at,
            granted_days,
        } => {
            columns.grace_ends_at = Some(*grace_ends_at);
            columns.grace_days = Some(*granted_days as i32);
        }
        Phase::Canceled {
            ended_at,
            suspension_reason,
        } => {
            columns.ended_at = Some(*ended_at);
            columns.suspension_reason = suspension_reason.clone();
        }
        Phase::Expired { expired_at } => {
            columns.expired_at = Some(*expired_at);
        }
    }
    columns
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn insert_plan(&self, plan: &Plan) -> EntitlementResult<()> {
        let job_limit: Option<i32> = plan.job_limit.cap().map(|l| l as i32);
        sqlx::query(
            r#"
            INSERT INTO entitlement_plans
                (id, name, monthly_price_cents, job_limit, member_limit,
                 features, is_custom, custom_owner_tenant_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(plan.monthly_price_cents)
        .bind(job_limit)
        .bind(plan.member_limit as i32)
        .bind(serde_json::json!(plan.features))
        .bind(plan.is_custom)
        .bind(plan.custom_owner_tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn plan(&self, plan_id: Uuid) -> EntitlementResult<Plan> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, monthly_price_cents, job_limit, member_limit,
                   features, is_custom, custom_owner_tenant_id
            FROM entitlement_plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(EntitlementError::PlanNotFound(plan_id))?.into_plan()
    }

    async fn insert_subscription(&self, sub: &Subscription) -> EntitlementResult<()> {
        let columns = phase_columns(&sub.phase);
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, tenant_id, plan_id, status,
                 period_start, period_end, grace_ends_at, grace_days,
                 payment_failed_at, ended_at, expired_at, suspension_reason,
                 trial_ends_at, external_customer_ref, external_subscription_ref,
                 last_event_at, jobs_created_this_month, last_counter_reset_at,
                 created_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(sub.id)
        .bind(sub.tenant_id)
        .bind(sub.plan_id)
        .bind(columns.status)
        .bind(columns.period_start)
        .bind(columns.period_end)
        .bind(columns.grace_ends_at)
        .bind(columns.grace_days)
        .bind(columns.payment_failed_at)
        .bind(columns.ended_at)
        .bind(columns.expired_at)
        .bind(columns.suspension_reason)
        .bind(sub.trial_ends_at)
        .bind(&sub.external_customer_ref)
        .bind(&sub.external_subscription_ref)
        .bind(sub.last_event_at)
        .bind(sub.jobs_created_this_month)
        .bind(sub.last_counter_reset_at)
        .bind(sub.created_at)
        .bind(sub.version)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                EntitlementError::AlreadySubscribed(sub.tenant_id)
            }
            _ => EntitlementError::from(e),
        })?;
        Ok(())
    }

    async fn current_subscription(
        &self,
        tenant_id: Uuid,
    ) -> EntitlementResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn live_subscriptions(&self) -> EntitlementResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE status IN {LIVE_STATUSES}"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect()
    }

    async fn all_subscriptions(&self) -> EntitlementResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect()
    }

    async fn persist_transition(
        &self,
        update: TransitionUpdate,
    ) -> EntitlementResult<Subscription> {
        let columns = phase_columns(&update.phase);
        let mut tx = self.pool.begin().await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = $1,
                period_start = $2,
                period_end = $3,
                grace_ends_at = $4,
                grace_days = $5,
                payment_failed_at = $6,
                ended_at = $7,
                expired_at = $8,
                suspension_reason = $9,
                last_event_at = $10,
                plan_id = COALESCE($11, plan_id),
                jobs_created_this_month =
                    CASE WHEN $12 THEN 0 ELSE jobs_created_this_month END,
                last_counter_reset_at =
                    CASE WHEN $12 THEN $10 ELSE last_counter_reset_at END,
                version = version + 1
            WHERE id = $13 AND version = $14
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(columns.status)
        .bind(columns.period_start)
        .bind(columns.period_end)
        .bind(columns.grace_ends_at)
        .bind(columns.grace_days)
        .bind(columns.payment_failed_at)
        .bind(columns.ended_at)
        .bind(columns.expired_at)
        .bind(columns.suspension_reason)
        .bind(update.last_event_at)
        .bind(update.new_plan_id)
        .bind(update.reset_counters)
        .bind(update.subscription_id)
        .bind(update.expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(EntitlementError::Conflict(update.tenant_id));
        };

        if let Some(event) = &update.processed_event {
            sqlx::query(
                r#"
                INSERT INTO billing_events
                    (event_id, tenant_id, kind, occurred_at, payload, outcome)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&event.event_id)
            .bind(event.tenant_id)
            .bind(event.kind.as_str())
            .bind(event.occurred_at)
            .bind(&event.payload)
            .bind(ProcessedOutcome::Applied.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        row.into_subscription()
    }

    async fn processed_outcome(
        &self,
        event_id: &str,
    ) -> EntitlementResult<Option<ProcessedOutcome>> {
        let outcome: Option<String> =
            sqlx::query_scalar("SELECT outcome FROM billing_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        match outcome {
            None => Ok(None),
            Some(raw) => ProcessedOutcome::parse(&raw).map(Some).ok_or_else(|| {
                EntitlementError::Storage(format!("event {event_id} has unknown outcome '{raw}'"))
            }),
        }
    }

    async fn mark_event_processed(
        &self,
        event: &BillingEvent,
        outcome: ProcessedOutcome,
    ) -> EntitlementResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_events
                (event_id, tenant_id, kind, occurred_at, payload, outcome)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(event.tenant_id)
        .bind(event.kind.as_str())
        .bind(event.occurred_at)
        .bind(&event.payload)
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_reserve_job_slot(
        &self,
        tenant_id: Uuid,
        reservation_id: Uuid,
    ) -> EntitlementResult<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;

        // Increment-if-below-limit in one statement: two concurrent callers
        // can never both pass the comparison and both increment past it.
        let granted: Option<(i64, Option<i32>)> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions s
            SET jobs_created_this_month = s.jobs_created_this_month + 1
            FROM entitlement_plans p
            WHERE p.id = s.plan_id
              AND s.tenant_id = $1
              AND s.status IN {ENTITLED_STATUSES}
              AND (p.job_limit IS NULL OR s.jobs_created_this_month < p.job_limit)
            RETURNING s.jobs_created_this_month, p.job_limit
            "#
        ))
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((new_count, job_limit)) = granted {
            sqlx::query(
                r#"
                INSERT INTO entitlement_reservations (id, tenant_id, state)
                VALUES ($1, $2, 'open')
                "#,
            )
            .bind(reservation_id)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            let remaining = job_limit.map(|limit| (i64::from(limit) - new_count).max(0));
            return Ok(ReserveOutcome::Granted { remaining });
        }
        drop(tx);

        // Nothing matched: either no entitled subscription, or the counter
        // is at the cap. One read distinguishes the two for reporting.
        let state: Option<(i64, Option<i32>)> = sqlx::query_as(&format!(
            r#"
            SELECT s.jobs_created_this_month, p.job_limit
            FROM subscriptions s
            JOIN entitlement_plans p ON p.id = s.plan_id
            WHERE s.tenant_id = $1 AND s.status IN {ENTITLED_STATUSES}
            "#
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        match state {
            Some((current, Some(limit))) => Ok(ReserveOutcome::LimitReached {
                limit: i64::from(limit),
                current,
            }),
            _ => Ok(ReserveOutcome::NoActiveSubscription),
        }
    }

    async fn commit_reservation(&self, reservation_id: Uuid) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            UPDATE entitlement_reservations
            SET state = 'committed', resolved_at = NOW()
            WHERE id = $1 AND state = 'open'
            "#,
        )
        .bind(reservation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_reservation(&self, reservation_id: Uuid) -> EntitlementResult<()> {
        let mut tx = self.pool.begin().await?;

        // The state guard makes a double release a no-op
        let released: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE entitlement_reservations
            SET state = 'released', resolved_at = NOW()
            WHERE id = $1 AND state = 'open'
            RETURNING tenant_id
            "#,
        )
        .bind(reservation_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((tenant_id,)) = released {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET jobs_created_this_month = GREATEST(jobs_created_this_month - 1, 0)
                WHERE id = (
                    SELECT id FROM subscriptions
                    WHERE tenant_id = $1
                    ORDER BY created_at DESC
                    LIMIT 1
                )
                "#,
            )
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reset_counter_if_due(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> EntitlementResult<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE subscriptions
            SET jobs_created_this_month = 0, last_counter_reset_at = $2
            WHERE tenant_id = $1
              AND status IN {ENTITLED_STATUSES}
              AND date_trunc('month', last_counter_reset_at) < date_trunc('month', $2)
            "#
        ))
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_member_count(&self, tenant_id: Uuid) -> EntitlementResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM team_members WHERE tenant_id = $1 AND status = 'active'",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
