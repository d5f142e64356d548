//! Payment event reconciliation
//!
//! Consumes normalized billing events from the processor, deduplicates
//! them, enforces per-tenant temporal ordering, and feeds the state
//! machine. The processor redelivers at-least-once and out of order;
//! everything here is built to tolerate both.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EntitlementError, EntitlementResult};
use crate::event::{BillingEvent, ProcessedOutcome};
use crate::notify::{forward_effects, NotificationSink};
use crate::store::{EntitlementStore, TransitionUpdate};
use crate::subscription::{evaluate, LifecycleEvent, SideEffect, SubscriptionStatus, Transition};

/// Outcome of applying one billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event moved the subscription to a new status
    Applied {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    /// Valid event, no state change (recorded so redelivery is a duplicate)
    NoTransition,
    /// Event id was already processed; nothing happened
    Duplicate,
    /// Event is older than the last applied event; recorded, not applied
    Stale,
}

pub struct PaymentEventReconciler {
    store: Arc<dyn EntitlementStore>,
    notifier: Arc<dyn NotificationSink>,
    config: EngineConfig,
}

impl PaymentEventReconciler {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        notifier: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Apply one normalized billing event.
    ///
    /// Idempotent: re-applying the same event id, in any interleaving with
    /// other events, yields the same final state as applying it once. A
    /// lost version race is retried from scratch (including the dedup
    /// check, since the winner may have been processing this very event);
    /// an exhausted retry budget surfaces as `TemporarilyUnavailable`.
    pub async fn apply(&self, event: &BillingEvent) -> EntitlementResult<ApplyOutcome> {
        for attempt in 0..=self.config.max_conflict_retries {
            match self.try_apply(event).await {
                Err(EntitlementError::Conflict(tenant_id))
                    if attempt < self.config.max_conflict_retries =>
                {
                    tracing::debug!(
                        tenant_id = %tenant_id,
                        event_id = %event.event_id,
                        attempt = attempt + 1,
                        "Lost transition race, retrying event"
                    );
                }
                Err(EntitlementError::Conflict(tenant_id)) => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        event_id = %event.event_id,
                        "Conflict retry budget exhausted"
                    );
                    return Err(EntitlementError::TemporarilyUnavailable);
                }
                other => return other,
            }
        }
        Err(EntitlementError::TemporarilyUnavailable)
    }

    async fn try_apply(&self, event: &BillingEvent) -> EntitlementResult<ApplyOutcome> {
        if let Some(outcome) = self.store.processed_outcome(&event.event_id).await? {
            tracing::info!(
                event_id = %event.event_id,
                tenant_id = %event.tenant_id,
                first_outcome = %outcome,
                "Duplicate billing event ignored"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        let sub = self
            .store
            .current_subscription(event.tenant_id)
            .await?
            .ok_or(EntitlementError::NotFound(event.tenant_id))?;

        // Temporal ordering guard: an event older than the last applied one
        // must never regress the lifecycle.
        if let Some(last) = sub.last_event_at {
            if event.occurred_at < last {
                let newly = self
                    .store
                    .mark_event_processed(event, ProcessedOutcome::Stale)
                    .await?;
                if !newly {
                    return Ok(ApplyOutcome::Duplicate);
                }
                tracing::info!(
                    event_id = %event.event_id,
                    tenant_id = %event.tenant_id,
                    occurred_at = %event.occurred_at,
                    last_event_at = %last,
                    "Stale billing event rejected"
                );
                return Ok(ApplyOutcome::Stale);
            }
        }

        let lifecycle_event = event.kind.to_lifecycle_event();
        match evaluate(
            &sub.phase,
            &lifecycle_event,
            event.occurred_at,
            self.config.cycle_days,
        ) {
            Transition::NoChange => {
                let newly = self
                    .store
                    .mark_event_processed(event, ProcessedOutcome::NoTransition)
                    .await?;
                Ok(if newly {
                    ApplyOutcome::NoTransition
                } else {
                    ApplyOutcome::Duplicate
                })
            }
            Transition::Changed { phase, effects } => {
                let from = sub.status();
                let to = phase.status();
                let mut update =
                    TransitionUpdate::for_subscription(&sub, phase, event.occurred_at);
                update.reset_counters = effects.contains(&SideEffect::ResetCounters);
                update.processed_event = Some(event.clone());

                self.store.persist_transition(update).await?;

                tracing::info!(
                    event_id = %event.event_id,
                    tenant_id = %event.tenant_id,
                    kind = %event.kind,
                    from = %from,
                    to = %to,
                    "Billing event applied"
                );
                forward_effects(&self.notifier, event.tenant_id, event.occurred_at, &effects)
                    .await;
                Ok(ApplyOutcome::Applied { from, to })
            }
        }
    }

    /// Apply an admin-originated lifecycle event with the same retry
    /// discipline as billing events. Returns `InvalidTransition` when the
    /// current state does not accept the event.
    pub(crate) async fn apply_direct(
        &self,
        tenant_id: Uuid,
        lifecycle_event: LifecycleEvent,
        now: OffsetDateTime,
    ) -> EntitlementResult<crate::subscription::Subscription> {
        for attempt in 0..=self.config.max_conflict_retries {
            let sub = self
                .store
                .current_subscription(tenant_id)
                .await?
                .ok_or(EntitlementError::NotFound(tenant_id))?;

            match evaluate(&sub.phase, &lifecycle_event, now, self.config.cycle_days) {
                Transition::NoChange => {
                    return Err(EntitlementError::InvalidTransition {
                        tenant_id,
                        reason: format!(
                            "event {lifecycle_event:?} does not apply in status {}",
                            sub.status()
                        ),
                    });
                }
                Transition::Changed { phase, effects } => {
                    let mut update = TransitionUpdate::for_subscription(&sub, phase, now);
                    update.reset_counters = effects.contains(&SideEffect::ResetCounters);

                    match self.store.persist_transition(update).await {
                        Ok(updated) => {
                            forward_effects(&self.notifier, tenant_id, now, &effects).await;
                            return Ok(updated);
                        }
                        Err(EntitlementError::Conflict(_))
                            if attempt < self.config.max_conflict_retries => {}
                        Err(EntitlementError::Conflict(_)) => {
                            return Err(EntitlementError::TemporarilyUnavailable)
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(EntitlementError::TemporarilyUnavailable)
    }
}
