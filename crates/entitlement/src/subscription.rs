//! Subscription records and the lifecycle state machine
//!
//! The state machine is a pure function: given a phase snapshot, an event
//! and the current time it returns either no change or a new phase plus a
//! list of side-effect intents. It performs no I/O, so re-running it against
//! the same inputs is always safe. Persistence and notification happen in
//! the reconciler and scheduler, never here.
//!
//! Explicit events take priority over time-based expiry: evaluating an
//! explicit event never applies expiry, and expiry is applied only through
//! the synthetic `Tick` event emitted by the scheduler.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Six-state lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    GracePeriod,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::GracePeriod => "grace_period",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Live statuses hold the at-most-one-per-tenant slot
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial
                | SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::GracePeriod
        )
    }

    /// Terminal statuses accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::Expired
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle phase: one variant per status, each carrying only the fields
/// that exist in that status. "gracePeriodEndDate is set iff grace_period"
/// is a shape here, not a runtime check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Phase {
    Trial {
        trial_ends_at: OffsetDateTime,
    },
    Active {
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    },
    PastDue {
        /// Period end carried over from the active phase
        period_end: OffsetDateTime,
        payment_failed_at: OffsetDateTime,
    },
    GracePeriod {
        grace_ends_at: OffsetDateTime,
        granted_days: u32,
    },
    Canceled {
        ended_at: OffsetDateTime,
        suspension_reason: Option<String>,
    },
    Expired {
        expired_at: OffsetDateTime,
    },
}

impl Phase {
    pub fn status(&self) -> SubscriptionStatus {
        match self {
            Phase::Trial { .. } => SubscriptionStatus::Trial,
            Phase::Active { .. } => SubscriptionStatus::Active,
            Phase::PastDue { .. } => SubscriptionStatus::PastDue,
            Phase::GracePeriod { .. } => SubscriptionStatus::GracePeriod,
            Phase::Canceled { .. } => SubscriptionStatus::Canceled,
            Phase::Expired { .. } => SubscriptionStatus::Expired,
        }
    }

    /// Statuses entitled to metered resources: trial, active, grace period.
    /// Past-due tenants regain access only through an explicit grace grant.
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            Phase::Trial { .. } | Phase::Active { .. } | Phase::GracePeriod { .. }
        )
    }
}

/// Events fed into the state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Normalized processor event: a payment settled
    PaymentSucceeded,
    /// Normalized processor event: a payment attempt failed
    PaymentFailed,
    /// Normalized processor event: the processor-side subscription ended
    SubscriptionCanceled,
    /// Normalized processor event: renewal confirmed for another cycle
    SubscriptionRenewed,
    /// Admin grants a grace window to a past-due tenant
    GraceGranted { days: u32, reason: String },
    /// Admin suspends the tenant outright
    Suspended { reason: String },
    /// Synthetic scheduler event: apply time-based expiry only
    Tick,
}

/// Side-effect intents returned alongside a phase change. The caller
/// persists or forwards them; the state machine only declares them.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Zero the monthly job counter (a new paid cycle begins)
    ResetCounters,
    /// Emit a lifecycle notification to the external notification subsystem
    Notify {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        reason: String,
    },
}

/// Outcome of evaluating one event against one phase snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    NoChange,
    Changed {
        phase: Phase,
        effects: Vec<SideEffect>,
    },
}

fn notify(from: &Phase, to: &Phase, reason: impl Into<String>) -> SideEffect {
    SideEffect::Notify {
        from: from.status(),
        to: to.status(),
        reason: reason.into(),
    }
}

/// Evaluate one event against a phase snapshot.
///
/// Pure and idempotent: no I/O, and feeding the resulting phase the same
/// event again yields `NoChange` for every event except period-extending
/// renewals, which are deduplicated upstream by event id.
pub fn evaluate(
    phase: &Phase,
    event: &LifecycleEvent,
    now: OffsetDateTime,
    cycle_days: i64,
) -> Transition {
    if phase.status().is_terminal() {
        return Transition::NoChange;
    }

    let fresh_period = || Phase::Active {
        period_start: now,
        period_end: now + Duration::days(cycle_days),
    };

    match event {
        LifecycleEvent::PaymentSucceeded => match phase {
            Phase::Trial { .. } | Phase::PastDue { .. } | Phase::GracePeriod { .. } => {
                let next = fresh_period();
                let effects = vec![
                    SideEffect::ResetCounters,
                    notify(phase, &next, "payment_succeeded"),
                ];
                Transition::Changed {
                    phase: next,
                    effects,
                }
            }
            // Renewal payment on an already-active subscription: extend the
            // period, keep the status, start a fresh counter cycle.
            Phase::Active { .. } => Transition::Changed {
                phase: fresh_period(),
                effects: vec![SideEffect::ResetCounters],
            },
            _ => Transition::NoChange,
        },

        LifecycleEvent::SubscriptionRenewed => match phase {
            Phase::Active { .. } => Transition::Changed {
                phase: fresh_period(),
                effects: vec![SideEffect::ResetCounters],
            },
            _ => Transition::NoChange,
        },

        LifecycleEvent::PaymentFailed => match phase {
            Phase::Active { period_end, .. } => {
                let next = Phase::PastDue {
                    period_end: *period_end,
                    payment_failed_at: now,
                };
                let effects = vec![notify(phase, &next, "payment_failed")];
                Transition::Changed {
                    phase: next,
                    effects,
                }
            }
            _ => Transition::NoChange,
        },

        LifecycleEvent::SubscriptionCanceled => match phase {
            Phase::Active { .. } => {
                let next = Phase::Canceled {
                    ended_at: now,
                    suspension_reason: None,
                };
                let effects = vec![notify(phase, &next, "canceled_by_processor")];
                Transition::Changed {
                    phase: next,
                    effects,
                }
            }
            _ => Transition::NoChange,
        },

        LifecycleEvent::GraceGranted { days, reason } => match phase {
            Phase::PastDue { .. } => {
                let next = Phase::GracePeriod {
                    grace_ends_at: now + Duration::days(i64::from(*days)),
                    granted_days: *days,
                };
                let effects = vec![notify(phase, &next, format!("grace_granted: {reason}"))];
                Transition::Changed {
                    phase: next,
                    effects,
                }
            }
            _ => Transition::NoChange,
        },

        LifecycleEvent::Suspended { reason } => {
            let next = Phase::Canceled {
                ended_at: now,
                suspension_reason: Some(reason.clone()),
            };
            let effects = vec![notify(phase, &next, format!("suspended: {reason}"))];
            Transition::Changed {
                phase: next,
                effects,
            }
        }

        LifecycleEvent::Tick => {
            let deadline = match phase {
                Phase::Trial { trial_ends_at } => Some((*trial_ends_at, "trial_expired")),
                Phase::Active { period_end, .. } => Some((*period_end, "period_expired")),
                Phase::PastDue { period_end, .. } => Some((*period_end, "period_expired")),
                Phase::GracePeriod { grace_ends_at, .. } => {
                    Some((*grace_ends_at, "grace_period_expired"))
                }
                _ => None,
            };
            match deadline {
                Some((at, reason)) if now > at => {
                    let next = Phase::Expired { expired_at: now };
                    let effects = vec![notify(phase, &next, reason)];
                    Transition::Changed {
                        phase: next,
                        effects,
                    }
                }
                _ => Transition::NoChange,
            }
        }
    }
}

/// One subscription row. At most one live subscription per tenant; terminal
/// rows are retained for history and a new row is created on resubscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub phase: Phase,
    /// Set iff the subscription ever had a trial phase; retained after
    /// leaving trial for audit.
    pub trial_ends_at: Option<OffsetDateTime>,
    pub external_customer_ref: Option<String>,
    pub external_subscription_ref: Option<String>,
    /// Timestamp of the last applied billing event or expiry tick; events
    /// older than this are rejected as stale.
    pub last_event_at: Option<OffsetDateTime>,
    pub jobs_created_this_month: i64,
    pub last_counter_reset_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    /// Optimistic concurrency guard; every phase persist bumps it
    pub version: i64,
}

impl Subscription {
    /// Signup-time subscription: trial starting now
    pub fn new_trial(tenant_id: Uuid, plan_id: Uuid, now: OffsetDateTime, trial_days: i64) -> Self {
        let trial_ends_at = now + Duration::days(trial_days);
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            plan_id,
            phase: Phase::Trial { trial_ends_at },
            trial_ends_at: Some(trial_ends_at),
            external_customer_ref: None,
            external_subscription_ref: None,
            last_event_at: None,
            jobs_created_this_month: 0,
            last_counter_reset_at: now,
            created_at: now,
            version: 0,
        }
    }

    /// Custom-plan activation: active immediately, no trial
    pub fn new_active(tenant_id: Uuid, plan_id: Uuid, now: OffsetDateTime, cycle_days: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            plan_id,
            phase: Phase::Active {
                period_start: now,
                period_end: now + Duration::days(cycle_days),
            },
            trial_ends_at: None,
            external_customer_ref: None,
            external_subscription_ref: None,
            last_event_at: None,
            jobs_created_this_month: 0,
            last_counter_reset_at: now,
            created_at: now,
            version: 0,
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.phase.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const CYCLE: i64 = 30;

    fn day(n: i64) -> OffsetDateTime {
        datetime!(2025-01-01 00:00 UTC) + Duration::days(n)
    }

    fn trial_phase() -> Phase {
        Phase::Trial {
            trial_ends_at: day(7),
        }
    }

    fn apply(phase: &Phase, event: &LifecycleEvent, now: OffsetDateTime) -> Phase {
        match evaluate(phase, event, now, CYCLE) {
            Transition::Changed { phase, .. } => phase,
            Transition::NoChange => phase.clone(),
        }
    }

    #[test]
    fn trial_payment_activates_with_thirty_day_period() {
        let next = apply(&trial_phase(), &LifecycleEvent::PaymentSucceeded, day(3));
        assert_eq!(
            next,
            Phase::Active {
                period_start: day(3),
                period_end: day(33),
            }
        );
    }

    #[test]
    fn activation_resets_counters_and_notifies() {
        let result = evaluate(&trial_phase(), &LifecycleEvent::PaymentSucceeded, day(3), CYCLE);
        let Transition::Changed { effects, .. } = result else {
            panic!("expected a transition");
        };
        assert!(effects.contains(&SideEffect::ResetCounters));
        assert!(effects.iter().any(|e| matches!(
            e,
            SideEffect::Notify {
                from: SubscriptionStatus::Trial,
                to: SubscriptionStatus::Active,
                ..
            }
        )));
    }

    #[test]
    fn trial_expires_only_after_deadline() {
        assert_eq!(
            evaluate(&trial_phase(), &LifecycleEvent::Tick, day(6), CYCLE),
            Transition::NoChange
        );
        let next = apply(&trial_phase(), &LifecycleEvent::Tick, day(8));
        assert_eq!(next.status(), SubscriptionStatus::Expired);
    }

    #[test]
    fn payment_failure_carries_period_end_into_past_due() {
        let active = Phase::Active {
            period_start: day(0),
            period_end: day(30),
        };
        let next = apply(&active, &LifecycleEvent::PaymentFailed, day(10));
        assert_eq!(
            next,
            Phase::PastDue {
                period_end: day(30),
                payment_failed_at: day(10),
            }
        );
    }

    #[test]
    fn grace_grant_applies_only_from_past_due() {
        let grant = LifecycleEvent::GraceGranted {
            days: 5,
            reason: "payment dispute pending".into(),
        };
        let past_due = Phase::PastDue {
            period_end: day(30),
            payment_failed_at: day(10),
        };
        let next = apply(&past_due, &grant, day(12));
        assert_eq!(
            next,
            Phase::GracePeriod {
                grace_ends_at: day(17),
                granted_days: 5,
            }
        );

        let active = Phase::Active {
            period_start: day(0),
            period_end: day(30),
        };
        assert_eq!(evaluate(&active, &grant, day(12), CYCLE), Transition::NoChange);
    }

    #[test]
    fn grace_expiry_moves_to_expired() {
        let grace = Phase::GracePeriod {
            grace_ends_at: day(17),
            granted_days: 5,
        };
        assert_eq!(
            evaluate(&grace, &LifecycleEvent::Tick, day(17), CYCLE),
            Transition::NoChange
        );
        let next = apply(&grace, &LifecycleEvent::Tick, day(18));
        assert_eq!(next.status(), SubscriptionStatus::Expired);
    }

    #[test]
    fn suspend_cancels_any_live_state_with_reason() {
        let suspend = LifecycleEvent::Suspended {
            reason: "fraud review".into(),
        };
        for phase in [
            trial_phase(),
            Phase::Active {
                period_start: day(0),
                period_end: day(30),
            },
            Phase::PastDue {
                period_end: day(30),
                payment_failed_at: day(10),
            },
            Phase::GracePeriod {
                grace_ends_at: day(17),
                granted_days: 5,
            },
        ] {
            let next = apply(&phase, &suspend, day(20));
            assert_eq!(
                next,
                Phase::Canceled {
                    ended_at: day(20),
                    suspension_reason: Some("fraud review".into()),
                }
            );
        }
    }

    #[test]
    fn terminal_states_ignore_everything() {
        let canceled = Phase::Canceled {
            ended_at: day(5),
            suspension_reason: None,
        };
        let expired = Phase::Expired { expired_at: day(8) };
        let events = [
            LifecycleEvent::PaymentSucceeded,
            LifecycleEvent::PaymentFailed,
            LifecycleEvent::SubscriptionCanceled,
            LifecycleEvent::SubscriptionRenewed,
            LifecycleEvent::Suspended {
                reason: "again".into(),
            },
            LifecycleEvent::Tick,
        ];
        for event in &events {
            assert_eq!(evaluate(&canceled, event, day(99), CYCLE), Transition::NoChange);
            assert_eq!(evaluate(&expired, event, day(99), CYCLE), Transition::NoChange);
        }
    }

    #[test]
    fn explicit_events_never_apply_expiry() {
        // Trial long past its deadline: a failure notice does not expire it,
        // only a tick does.
        let stale_trial = trial_phase();
        assert_eq!(
            evaluate(&stale_trial, &LifecycleEvent::PaymentFailed, day(40), CYCLE),
            Transition::NoChange
        );
        let next = apply(&stale_trial, &LifecycleEvent::Tick, day(40));
        assert_eq!(next.status(), SubscriptionStatus::Expired);
    }

    #[test]
    fn fold_over_ordered_events_is_deterministic() {
        let events = [
            (LifecycleEvent::PaymentSucceeded, day(3)),
            (LifecycleEvent::PaymentFailed, day(20)),
            (
                LifecycleEvent::GraceGranted {
                    days: 7,
                    reason: "card expired".into(),
                },
                day(21),
            ),
            (LifecycleEvent::PaymentSucceeded, day(24)),
        ];

        let fold = |start: Phase| {
            events
                .iter()
                .fold(start, |phase, (event, at)| apply(&phase, event, *at))
        };

        let first = fold(trial_phase());
        let second = fold(trial_phase());
        assert_eq!(first, second);
        assert_eq!(
            first,
            Phase::Active {
                period_start: day(24),
                period_end: day(54),
            }
        );
    }

    #[test]
    fn renewal_extends_active_period() {
        let active = Phase::Active {
            period_start: day(0),
            period_end: day(30),
        };
        let next = apply(&active, &LifecycleEvent::SubscriptionRenewed, day(29));
        assert_eq!(
            next,
            Phase::Active {
                period_start: day(29),
                period_end: day(59),
            }
        );
    }
}
