// Entitlement crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! HireDesk Entitlement Engine
//!
//! Subscription lifecycle and usage enforcement for hiring tenants.
//!
//! ## Features
//!
//! - **Plan Catalog**: Standard and tenant-owned custom plans with job and
//!   member limits
//! - **Lifecycle State Machine**: trial, active, past_due, grace_period,
//!   canceled, expired; pure transitions with side-effect intents
//! - **Event Reconciliation**: Idempotent, order-tolerant application of
//!   payment-processor events
//! - **Usage Metering**: Atomic monthly job counters with two-phase
//!   reservations, plus member-seat guards
//! - **Entitlement Gate**: Fail-closed authorization for metered actions
//! - **Lifecycle Sweeps**: Time-based expiries and monthly counter resets,
//!   safe to run from multiple workers
//! - **Invariant Checks**: Runnable consistency checks over stored state

pub mod admin;
pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod invariants;
pub mod notify;
pub mod plan;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

// Admin
pub use admin::{AdminService, CustomPlanParams};

// Config
pub use config::EngineConfig;

// Error
pub use error::{EntitlementError, EntitlementResult};

// Events
pub use event::{BillingEvent, BillingEventKind, ProcessedOutcome};

// Gate
pub use gate::{Decision, DenyReason, EntitlementGate, Reservation, ResourceKind};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notify::{
    CollectingSink, LifecycleNotification, NotificationSink, TracingNotificationSink,
};

// Plans
pub use plan::{JobLimit, Plan};

// Reconciler
pub use reconciler::{ApplyOutcome, PaymentEventReconciler};

// Scheduler
pub use scheduler::{LifecycleScheduler, SweepSummary};

// Store
pub use store::{EntitlementStore, MemoryStore, PgEntitlementStore, TransitionUpdate};

// Subscriptions
pub use subscription::{
    evaluate, LifecycleEvent, Phase, SideEffect, Subscription, SubscriptionStatus, Transition,
};

// Usage
pub use usage::ReserveOutcome;

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

/// Top-level handle wiring every component to one store and one
/// notification sink. The worker and the application layer construct this
/// once and call into the parts they need.
pub struct EntitlementEngine {
    store: Arc<dyn EntitlementStore>,
    config: EngineConfig,
    reconciler: PaymentEventReconciler,
    scheduler: LifecycleScheduler,
    gate: EntitlementGate,
    admin: AdminService,
    invariants: InvariantChecker,
}

impl EntitlementEngine {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        notifier: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            reconciler: PaymentEventReconciler::new(
                store.clone(),
                notifier.clone(),
                config.clone(),
            ),
            scheduler: LifecycleScheduler::new(store.clone(), notifier.clone(), config.clone()),
            gate: EntitlementGate::new(store.clone()),
            admin: AdminService::new(store.clone(), notifier, config.clone()),
            invariants: InvariantChecker::new(store.clone()),
            store,
            config,
        }
    }

    /// Engine over Postgres with lifecycle notifications going to the log
    pub fn with_postgres(pool: sqlx::PgPool, config: EngineConfig) -> Self {
        Self::new(
            Arc::new(PgEntitlementStore::new(pool)),
            Arc::new(TracingNotificationSink),
            config,
        )
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &PaymentEventReconciler {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &LifecycleScheduler {
        &self.scheduler
    }

    pub fn gate(&self) -> &EntitlementGate {
        &self.gate
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    pub fn invariants(&self) -> &InvariantChecker {
        &self.invariants
    }

    /// Onboard a tenant onto a plan with the configured trial window
    pub async fn start_trial(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> EntitlementResult<Subscription> {
        self.start_trial_at(tenant_id, plan_id, OffsetDateTime::now_utc())
            .await
    }

    /// As [`Self::start_trial`] with an explicit clock
    pub async fn start_trial_at(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
    ) -> EntitlementResult<Subscription> {
        // Validate the plan before creating anything
        let plan = self.store.plan(plan_id).await?;
        let sub = Subscription::new_trial(tenant_id, plan_id, now, self.config.trial_days);
        self.store.insert_subscription(&sub).await?;
        tracing::info!(
            tenant_id = %tenant_id,
            plan_id = %plan_id,
            plan_name = %plan.name,
            trial_ends_at = %(now + time::Duration::days(self.config.trial_days)),
            "Trial subscription started"
        );
        Ok(sub)
    }

    /// Start a fresh paid subscription for a tenant whose previous
    /// subscription ended. No second trial; the new row starts active.
    pub async fn resubscribe(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> EntitlementResult<Subscription> {
        self.resubscribe_at(tenant_id, plan_id, OffsetDateTime::now_utc())
            .await
    }

    /// As [`Self::resubscribe`] with an explicit clock
    pub async fn resubscribe_at(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
    ) -> EntitlementResult<Subscription> {
        self.store.plan(plan_id).await?;
        let sub = Subscription::new_active(tenant_id, plan_id, now, self.config.cycle_days);
        self.store.insert_subscription(&sub).await?;
        tracing::info!(
            tenant_id = %tenant_id,
            plan_id = %plan_id,
            "Tenant resubscribed"
        );
        Ok(sub)
    }
}
