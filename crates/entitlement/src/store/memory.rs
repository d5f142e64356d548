//! In-memory entitlement store
//!
//! Backs tests and single-instance deployments. One async mutex over the
//! whole keyed state gives every trait method the same atomicity the
//! Postgres backend gets from single conditional statements.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};
use crate::event::{BillingEvent, ProcessedOutcome};
use crate::plan::{JobLimit, Plan};
use crate::subscription::Subscription;
use crate::usage::{reset_is_due, ReserveOutcome};

use super::{EntitlementStore, TransitionUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Open,
    Committed,
    Released,
}

struct ReservationRecord {
    tenant_id: Uuid,
    state: ReservationState,
}

struct ProcessedRecord {
    #[allow(dead_code)] // retained for audit parity with the durable store
    event: BillingEvent,
    outcome: ProcessedOutcome,
}

#[derive(Default)]
struct Inner {
    plans: HashMap<Uuid, Plan>,
    /// Most recent subscription per tenant (live or terminal)
    current: HashMap<Uuid, Subscription>,
    /// Older terminal subscriptions displaced by resubscription
    history: Vec<Subscription>,
    processed: HashMap<String, ProcessedRecord>,
    reservations: HashMap<Uuid, ReservationRecord>,
    members: HashMap<Uuid, i64>,
}

/// In-memory implementation of [`EntitlementStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage; every operation fails until cleared.
    /// Lets tests verify the gate fails closed.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Roster helper: a member joined the tenant
    pub async fn record_member_added(&self, tenant_id: Uuid) {
        *self.inner.lock().await.members.entry(tenant_id).or_insert(0) += 1;
    }

    /// Roster helper: a member left or was deactivated
    pub async fn record_member_removed(&self, tenant_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(count) = inner.members.get_mut(&tenant_id) {
            *count = (*count - 1).max(0);
        }
    }

    fn check_available(&self) -> EntitlementResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EntitlementError::Storage("storage offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn insert_plan(&self, plan: &Plan) -> EntitlementResult<()> {
        self.check_available()?;
        self.inner.lock().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn plan(&self, plan_id: Uuid) -> EntitlementResult<Plan> {
        self.check_available()?;
        self.inner
            .lock()
            .await
            .plans
            .get(&plan_id)
            .cloned()
            .ok_or(EntitlementError::PlanNotFound(plan_id))
    }

    async fn insert_subscription(&self, sub: &Subscription) -> EntitlementResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.current.get(&sub.tenant_id) {
            if existing.status().is_live() {
                return Err(EntitlementError::AlreadySubscribed(sub.tenant_id));
            }
            let displaced = existing.clone();
            inner.history.push(displaced);
        }
        inner.current.insert(sub.tenant_id, sub.clone());
        Ok(())
    }

    async fn current_subscription(
        &self,
        tenant_id: Uuid,
    ) -> EntitlementResult<Option<Subscription>> {
        self.check_available()?;
        Ok(self.inner.lock().await.current.get(&tenant_id).cloned())
    }

    async fn live_subscriptions(&self) -> EntitlementResult<Vec<Subscription>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .await
            .current
            .values()
            .filter(|s| s.status().is_live())
            .cloned()
            .collect())
    }

    async fn all_subscriptions(&self) -> EntitlementResult<Vec<Subscription>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut subs: Vec<Subscription> = inner.current.values().cloned().collect();
        subs.extend(inner.history.iter().cloned());
        Ok(subs)
    }

    async fn persist_transition(
        &self,
        update: TransitionUpdate,
    ) -> EntitlementResult<Subscription> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let sub = inner
            .current
            .get_mut(&update.tenant_id)
            .ok_or(EntitlementError::NotFound(update.tenant_id))?;
        if sub.id != update.subscription_id || sub.version != update.expected_version {
            return Err(EntitlementError::Conflict(update.tenant_id));
        }

        sub.phase = update.phase;
        sub.last_event_at = Some(update.last_event_at);
        sub.version += 1;
        if let Some(plan_id) = update.new_plan_id {
            sub.plan_id = plan_id;
        }
        if update.reset_counters {
            sub.jobs_created_this_month = 0;
            sub.last_counter_reset_at = update.last_event_at;
        }
        let updated = sub.clone();

        if let Some(event) = update.processed_event {
            inner
                .processed
                .entry(event.event_id.clone())
                .or_insert(ProcessedRecord {
                    event,
                    outcome: ProcessedOutcome::Applied,
                });
        }

        Ok(updated)
    }

    async fn processed_outcome(
        &self,
        event_id: &str,
    ) -> EntitlementResult<Option<ProcessedOutcome>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .await
            .processed
            .get(event_id)
            .map(|r| r.outcome))
    }

    async fn mark_event_processed(
        &self,
        event: &BillingEvent,
        outcome: ProcessedOutcome,
    ) -> EntitlementResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.processed.contains_key(&event.event_id) {
            return Ok(false);
        }
        inner.processed.insert(
            event.event_id.clone(),
            ProcessedRecord {
                event: event.clone(),
                outcome,
            },
        );
        Ok(true)
    }

    async fn try_reserve_job_slot(
        &self,
        tenant_id: Uuid,
        reservation_id: Uuid,
    ) -> EntitlementResult<ReserveOutcome> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let Some(sub) = inner.current.get(&tenant_id) else {
            return Ok(ReserveOutcome::NoActiveSubscription);
        };
        if !sub.phase.is_entitled() {
            return Ok(ReserveOutcome::NoActiveSubscription);
        }
        let plan = inner
            .plans
            .get(&sub.plan_id)
            .ok_or(EntitlementError::PlanNotFound(sub.plan_id))?;

        let current = sub.jobs_created_this_month;
        match plan.job_limit {
            JobLimit::Limited(limit) if current >= i64::from(limit) => {
                Ok(ReserveOutcome::LimitReached {
                    limit: i64::from(limit),
                    current,
                })
            }
            job_limit => {
                let remaining = job_limit.remaining(current + 1);
                let sub = inner
                    .current
                    .get_mut(&tenant_id)
                    .ok_or(EntitlementError::NotFound(tenant_id))?;
                sub.jobs_created_this_month += 1;
                inner.reservations.insert(
                    reservation_id,
                    ReservationRecord {
                        tenant_id,
                        state: ReservationState::Open,
                    },
                );
                Ok(ReserveOutcome::Granted { remaining })
            }
        }
    }

    async fn commit_reservation(&self, reservation_id: Uuid) -> EntitlementResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if let Some(reservation) = inner.reservations.get_mut(&reservation_id) {
            if reservation.state == ReservationState::Open {
                reservation.state = ReservationState::Committed;
            }
        }
        Ok(())
    }

    async fn release_reservation(&self, reservation_id: Uuid) -> EntitlementResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(reservation) = inner.reservations.get_mut(&reservation_id) else {
            return Ok(());
        };
        if reservation.state != ReservationState::Open {
            return Ok(());
        }
        reservation.state = ReservationState::Released;
        let tenant_id = reservation.tenant_id;
        if let Some(sub) = inner.current.get_mut(&tenant_id) {
            sub.jobs_created_this_month = (sub.jobs_created_this_month - 1).max(0);
        }
        Ok(())
    }

    async fn reset_counter_if_due(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> EntitlementResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(sub) = inner.current.get_mut(&tenant_id) else {
            return Ok(false);
        };
        if !sub.phase.is_entitled() || !reset_is_due(sub.last_counter_reset_at, now) {
            return Ok(false);
        }
        sub.jobs_created_this_month = 0;
        sub.last_counter_reset_at = now;
        Ok(true)
    }

    async fn active_member_count(&self, tenant_id: Uuid) -> EntitlementResult<i64> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .await
            .members
            .get(&tenant_id)
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Phase;
    use time::macros::datetime;

    fn now() -> OffsetDateTime {
        datetime!(2025-06-10 12:00 UTC)
    }

    async fn store_with_plan(limit: JobLimit) -> (MemoryStore, Plan) {
        let store = MemoryStore::new();
        let plan = Plan::standard("Growth", 9900, limit, 10);
        store.insert_plan(&plan).await.unwrap();
        (store, plan)
    }

    #[tokio::test]
    async fn second_live_subscription_is_rejected() {
        let (store, plan) = store_with_plan(JobLimit::Limited(5)).await;
        let tenant = Uuid::new_v4();
        let first = Subscription::new_trial(tenant, plan.id, now(), 7);
        store.insert_subscription(&first).await.unwrap();

        let second = Subscription::new_trial(tenant, plan.id, now(), 7);
        let err = store.insert_subscription(&second).await.unwrap_err();
        assert!(matches!(err, EntitlementError::AlreadySubscribed(t) if t == tenant));
    }

    #[tokio::test]
    async fn resubscribe_after_terminal_keeps_history() {
        let (store, plan) = store_with_plan(JobLimit::Limited(5)).await;
        let tenant = Uuid::new_v4();
        let first = Subscription::new_trial(tenant, plan.id, now(), 7);
        store.insert_subscription(&first).await.unwrap();

        let update = TransitionUpdate::for_subscription(
            &first,
            Phase::Expired { expired_at: now() },
            now(),
        );
        store.persist_transition(update).await.unwrap();

        let second = Subscription::new_active(tenant, plan.id, now(), 30);
        store.insert_subscription(&second).await.unwrap();
        assert_eq!(store.all_subscriptions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let (store, plan) = store_with_plan(JobLimit::Limited(5)).await;
        let tenant = Uuid::new_v4();
        let sub = Subscription::new_trial(tenant, plan.id, now(), 7);
        store.insert_subscription(&sub).await.unwrap();

        let winner = TransitionUpdate::for_subscription(
            &sub,
            Phase::Active {
                period_start: now(),
                period_end: now() + time::Duration::days(30),
            },
            now(),
        );
        store.persist_transition(winner).await.unwrap();

        // Same expected_version again: the snapshot is stale now
        let loser = TransitionUpdate::for_subscription(
            &sub,
            Phase::Expired { expired_at: now() },
            now(),
        );
        let err = store.persist_transition(loser).await.unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(t) if t == tenant));
    }

    #[tokio::test]
    async fn release_decrements_exactly_once() {
        let (store, plan) = store_with_plan(JobLimit::Limited(2)).await;
        let tenant = Uuid::new_v4();
        let sub = Subscription::new_trial(tenant, plan.id, now(), 7);
        store.insert_subscription(&sub).await.unwrap();

        let reservation = Uuid::new_v4();
        let outcome = store.try_reserve_job_slot(tenant, reservation).await.unwrap();
        assert_eq!(outcome, ReserveOutcome::Granted { remaining: Some(1) });

        store.release_reservation(reservation).await.unwrap();
        store.release_reservation(reservation).await.unwrap();

        let current = store
            .current_subscription(tenant)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.jobs_created_this_month, 0);
    }

    #[tokio::test]
    async fn unavailable_store_errors_out() {
        let (store, _plan) = store_with_plan(JobLimit::Unlimited).await;
        store.set_unavailable(true);
        let err = store.current_subscription(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EntitlementError::Storage(_)));
    }
}
