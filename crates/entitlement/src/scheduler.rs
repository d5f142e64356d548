//! Lifecycle sweeps
//!
//! `run_once` is driven by an external time-based trigger (the worker's
//! cron jobs). Several worker instances may sweep concurrently during a
//! deploy; safety comes from the store's conditional updates, not from
//! locking. A transition lost to a concurrent writer is simply skipped and
//! picked up by the next sweep.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::error::{EntitlementError, EntitlementResult};
use crate::notify::{forward_effects, NotificationSink};
use crate::store::{EntitlementStore, TransitionUpdate};
use crate::subscription::{evaluate, LifecycleEvent, SubscriptionStatus, Transition};

/// Counts from one sweep, logged by the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub scanned: usize,
    pub expired_trials: usize,
    pub expired_periods: usize,
    pub expired_grace: usize,
    pub counters_reset: usize,
    /// Transitions lost to a concurrent writer; the next sweep catches them
    pub conflicts: usize,
    pub errors: usize,
}

pub struct LifecycleScheduler {
    store: Arc<dyn EntitlementStore>,
    notifier: Arc<dyn NotificationSink>,
    config: EngineConfig,
}

impl LifecycleScheduler {
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

    /// One full sweep: time-based expiries for every live subscription,
    /// then monthly counter resets for the entitled ones.
    pub async fn run_once(&self, now: OffsetDateTime) -> EntitlementResult<SweepSummary> {
        let subs = self.store.live_subscriptions().await?;
        let mut summary = SweepSummary {
            scanned: subs.len(),
            ..SweepSummary::default()
        };

        for sub in subs {
            let from = sub.status();
            let mut expired = false;

            match evaluate(&sub.phase, &LifecycleEvent::Tick, now, self.config.cycle_days) {
                Transition::NoChange => {}
                Transition::Changed { phase, effects } => {
                    let update = TransitionUpdate::for_subscription(&sub, phase, now);
                    match self.store.persist_transition(update).await {
                        Ok(_) => {
                            expired = true;
                            match from {
                                SubscriptionStatus::Trial => summary.expired_trials += 1,
                                SubscriptionStatus::GracePeriod => summary.expired_grace += 1,
                                _ => summary.expired_periods += 1,
                            }
                            forward_effects(&self.notifier, sub.tenant_id, now, &effects).await;
                        }
                        Err(EntitlementError::Conflict(_)) => {
                            summary.conflicts += 1;
                        }
                        Err(e) => {
                            tracing::error!(
                                tenant_id = %sub.tenant_id,
                                error = %e,
                                "Failed to persist expiry transition"
                            );
                            summary.errors += 1;
                        }
                    }
                }
            }

            if !expired && sub.phase.is_entitled() {
                match self.store.reset_counter_if_due(sub.tenant_id, now).await {
                    Ok(true) => summary.counters_reset += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            tenant_id = %sub.tenant_id,
                            error = %e,
                            "Failed to apply monthly counter reset"
                        );
                        summary.errors += 1;
                    }
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            expired_trials = summary.expired_trials,
            expired_periods = summary.expired_periods,
            expired_grace = summary.expired_grace,
            counters_reset = summary.counters_reset,
            conflicts = summary.conflicts,
            errors = summary.errors,
            "Lifecycle sweep complete"
        );
        Ok(summary)
    }
}
