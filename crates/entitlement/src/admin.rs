//! Admin operations
//!
//! Each is a direct state-machine event, not a metered check. Reasons are
//! mandatory and flow into the audit trail and lifecycle notifications.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EntitlementResult;
use crate::notify::NotificationSink;
use crate::plan::{JobLimit, Plan};
use crate::reconciler::PaymentEventReconciler;
use crate::store::{EntitlementStore, TransitionUpdate};
use crate::subscription::{LifecycleEvent, Subscription};

/// Fields for a tenant-specific custom plan
#[derive(Debug, Clone)]
pub struct CustomPlanParams {
    pub name: String,
    pub monthly_price_cents: i64,
    pub job_limit: JobLimit,
    pub member_limit: u32,
    pub features: Vec<String>,
}

pub struct AdminService {
    store: Arc<dyn EntitlementStore>,
    reconciler: PaymentEventReconciler,
    config: EngineConfig,
}

impl AdminService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        notifier: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        let reconciler =
            PaymentEventReconciler::new(store.clone(), notifier, config.clone());
        Self {
            store,
            reconciler,
            config,
        }
    }

    /// Grant a past-due tenant a grace window pending payment resolution.
    /// `days = None` uses the configured default.
    pub async fn grant_grace_period(
        &self,
        tenant_id: Uuid,
        days: Option<u32>,
        reason: impl Into<String>,
    ) -> EntitlementResult<Subscription> {
        self.grant_grace_period_at(tenant_id, days, reason, OffsetDateTime::now_utc())
            .await
    }

    /// As [`Self::grant_grace_period`] with an explicit clock
    pub async fn grant_grace_period_at(
        &self,
        tenant_id: Uuid,
        days: Option<u32>,
        reason: impl Into<String>,
        now: OffsetDateTime,
    ) -> EntitlementResult<Subscription> {
        let days = days.unwrap_or(self.config.default_grace_days);
        let reason = reason.into();
        tracing::info!(
            tenant_id = %tenant_id,
            days = days,
            reason = %reason,
            "Admin grace period grant"
        );
        self.reconciler
            .apply_direct(tenant_id, LifecycleEvent::GraceGranted { days, reason }, now)
            .await
    }

    /// Suspend a tenant outright; applies from any non-terminal state
    pub async fn suspend(
        &self,
        tenant_id: Uuid,
        reason: impl Into<String>,
    ) -> EntitlementResult<Subscription> {
        self.suspend_at(tenant_id, reason, OffsetDateTime::now_utc())
            .await
    }

    /// As [`Self::suspend`] with an explicit clock
    pub async fn suspend_at(
        &self,
        tenant_id: Uuid,
        reason: impl Into<String>,
        now: OffsetDateTime,
    ) -> EntitlementResult<Subscription> {
        let reason = reason.into();
        tracing::warn!(
            tenant_id = %tenant_id,
            reason = %reason,
            "Admin suspension"
        );
        self.reconciler
            .apply_direct(tenant_id, LifecycleEvent::Suspended { reason }, now)
            .await
    }

    /// Create a tenant-owned custom plan and put the tenant on it. A live
    /// subscription is moved in place; otherwise a fresh active
    /// subscription is created (custom-plan activation).
    pub async fn apply_custom_plan(
        &self,
        tenant_id: Uuid,
        params: CustomPlanParams,
    ) -> EntitlementResult<(Plan, Subscription)> {
        let plan = Plan::custom(
            tenant_id,
            params.name,
            params.monthly_price_cents,
            params.job_limit,
            params.member_limit,
        )
        .with_features(params.features);
        self.store.insert_plan(&plan).await?;

        let now = OffsetDateTime::now_utc();
        let sub = match self.store.current_subscription(tenant_id).await? {
            Some(existing) if existing.status().is_live() => {
                let mut update = TransitionUpdate::for_subscription(
                    &existing,
                    existing.phase.clone(),
                    now,
                );
                update.new_plan_id = Some(plan.id);
                self.store.persist_transition(update).await?
            }
            _ => {
                let sub =
                    Subscription::new_active(tenant_id, plan.id, now, self.config.cycle_days);
                self.store.insert_subscription(&sub).await?;
                sub
            }
        };

        tracing::info!(
            tenant_id = %tenant_id,
            plan_id = %plan.id,
            plan_name = %plan.name,
            "Custom plan applied"
        );
        Ok((plan, sub))
    }
}
