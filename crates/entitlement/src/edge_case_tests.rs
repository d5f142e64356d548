// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Entitlement Engine
//!
//! Exercises boundary conditions and race conditions in:
//! - Concurrent usage metering against plan limits
//! - Out-of-order and duplicate billing event delivery
//! - Lifecycle sweeps and monthly counter resets
//! - Fail-closed gating under storage outages
//! - Grace period and suspension flows

use std::sync::Arc;

use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::event::{BillingEvent, BillingEventKind};
use crate::gate::{Decision, DenyReason, ResourceKind};
use crate::notify::CollectingSink;
use crate::plan::{JobLimit, Plan};
use crate::reconciler::ApplyOutcome;
use crate::store::{EntitlementStore, MemoryStore};
use crate::subscription::SubscriptionStatus;
use crate::EntitlementEngine;

fn day(n: i64) -> OffsetDateTime {
    datetime!(2025-03-01 00:00 UTC) + Duration::days(n)
}

struct Harness {
    store: MemoryStore,
    sink: Arc<CollectingSink>,
    engine: Arc<EntitlementEngine>,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let sink = Arc::new(CollectingSink::new());
    let engine = Arc::new(EntitlementEngine::new(
        Arc::new(store.clone()),
        sink.clone(),
        EngineConfig::default(),
    ));
    Harness {
        store,
        sink,
        engine,
    }
}

impl Harness {
    async fn plan(&self, job_limit: JobLimit, member_limit: u32) -> Plan {
        let plan = Plan::standard("Growth", 9900, job_limit, member_limit);
        self.store.insert_plan(&plan).await.unwrap();
        plan
    }

    /// Tenant on a trial started at `day(0)`
    async fn trial_tenant(&self, job_limit: JobLimit) -> Uuid {
        let plan = self.plan(job_limit, 10).await;
        let tenant = Uuid::new_v4();
        self.engine
            .start_trial_at(tenant, plan.id, day(0))
            .await
            .unwrap();
        tenant
    }

    /// Tenant activated by a payment at `at`
    async fn active_tenant(&self, job_limit: JobLimit, at: OffsetDateTime) -> Uuid {
        let tenant = self.trial_tenant(job_limit).await;
        let event = BillingEvent::new(
            format!("evt-activate-{tenant}"),
            tenant,
            BillingEventKind::PaymentSucceeded,
            at,
        );
        self.engine.reconciler().apply(&event).await.unwrap();
        tenant
    }

    async fn status(&self, tenant: Uuid) -> SubscriptionStatus {
        self.store
            .current_subscription(tenant)
            .await
            .unwrap()
            .unwrap()
            .status()
    }
}

mod concurrent_metering {
    use super::*;
    use tokio::sync::Barrier;

    // =========================================================================
    // 20 tasks race for 5 job slots - exactly 5 may win, never more
    // =========================================================================
    #[tokio::test]
    async fn concurrent_job_grants_never_exceed_limit() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;

        let barrier = Arc::new(Barrier::new(20));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let engine = h.engine.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.gate().authorize(tenant, ResourceKind::Job).await
            }));
        }

        let mut allowed = 0;
        let mut limit_denials = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Decision::Allow(_) => allowed += 1,
                Decision::Deny(DenyReason::LimitReached { limit, .. }) => {
                    assert_eq!(limit, 5);
                    limit_denials += 1;
                }
                other => panic!("unexpected decision: {other:?}"),
            }
        }
        assert_eq!(allowed, 5, "exactly the plan limit may be granted");
        assert_eq!(limit_denials, 15);

        let sub = h.store.current_subscription(tenant).await.unwrap().unwrap();
        assert_eq!(sub.jobs_created_this_month, 5);
    }

    // =========================================================================
    // Concurrent sweeps racing on the monthly reset - it applies exactly once
    // =========================================================================
    #[tokio::test]
    async fn monthly_reset_applies_exactly_once() {
        let h = harness();
        let tenant = h.active_tenant(JobLimit::Limited(10), day(0)).await;
        for _ in 0..3 {
            assert!(h
                .engine
                .gate()
                .authorize(tenant, ResourceKind::Job)
                .await
                .is_allowed());
        }

        let next_month = datetime!(2025-04-02 00:00 UTC);
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = h.store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.reset_counter_if_due(tenant, next_month).await.unwrap()
            }));
        }

        let mut resets = 0;
        for handle in handles {
            if handle.await.unwrap() {
                resets += 1;
            }
        }
        assert_eq!(resets, 1, "only one sweep performs the reset");

        let sub = h.store.current_subscription(tenant).await.unwrap().unwrap();
        assert_eq!(sub.jobs_created_this_month, 0);
    }

    // =========================================================================
    // A released reservation returns its slot at the limit boundary
    // =========================================================================
    #[tokio::test]
    async fn released_slot_becomes_grantable_again() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(1)).await;

        let Decision::Allow(reservation) =
            h.engine.gate().authorize(tenant, ResourceKind::Job).await
        else {
            panic!("first grant should succeed");
        };
        assert!(matches!(
            h.engine.gate().authorize(tenant, ResourceKind::Job).await,
            Decision::Deny(DenyReason::LimitReached { limit: 1, current: 1 })
        ));

        // Job creation aborted downstream; the slot must come back
        h.engine.gate().release(&reservation).await.unwrap();
        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());
    }

    // =========================================================================
    // A committed reservation keeps the slot burned
    // =========================================================================
    #[tokio::test]
    async fn committed_slot_stays_consumed() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(1)).await;

        let Decision::Allow(reservation) =
            h.engine.gate().authorize(tenant, ResourceKind::Job).await
        else {
            panic!("first grant should succeed");
        };
        h.engine.gate().commit(&reservation).await.unwrap();
        // Release after commit is a no-op
        h.engine.gate().release(&reservation).await.unwrap();

        assert!(matches!(
            h.engine.gate().authorize(tenant, ResourceKind::Job).await,
            Decision::Deny(DenyReason::LimitReached { .. })
        ));
    }

    // =========================================================================
    // Limit reached, then a new calendar month - counter resets, grants resume
    // =========================================================================
    #[tokio::test]
    async fn limit_clears_on_month_rollover() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;
        for _ in 0..5 {
            assert!(h
                .engine
                .gate()
                .authorize(tenant, ResourceKind::Job)
                .await
                .is_allowed());
        }
        assert!(!h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());

        let rolled = h
            .store
            .reset_counter_if_due(tenant, datetime!(2025-04-01 00:05 UTC))
            .await
            .unwrap();
        assert!(rolled);

        match h.engine.gate().authorize(tenant, ResourceKind::Job).await {
            Decision::Allow(reservation) => assert_eq!(reservation.remaining, Some(4)),
            other => panic!("expected a grant after reset, got {other:?}"),
        }
    }

    // =========================================================================
    // Unlimited plans report no remaining count and never hit the limit
    // =========================================================================
    #[tokio::test]
    async fn unlimited_plan_always_grants() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Unlimited).await;
        for _ in 0..50 {
            match h.engine.gate().authorize(tenant, ResourceKind::Job).await {
                Decision::Allow(reservation) => assert_eq!(reservation.remaining, None),
                other => panic!("unlimited plan denied: {other:?}"),
            }
        }
    }
}

mod event_reconciliation {
    use super::*;

    // =========================================================================
    // Same event id delivered twice - second delivery is a no-op duplicate
    // =========================================================================
    #[tokio::test]
    async fn duplicate_event_is_ignored() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;
        let event = BillingEvent::new(
            "evt-1",
            tenant,
            BillingEventKind::PaymentSucceeded,
            day(3),
        );

        let first = h.engine.reconciler().apply(&event).await.unwrap();
        assert_eq!(
            first,
            ApplyOutcome::Applied {
                from: SubscriptionStatus::Trial,
                to: SubscriptionStatus::Active,
            }
        );

        let before = h.store.current_subscription(tenant).await.unwrap().unwrap();
        let second = h.engine.reconciler().apply(&event).await.unwrap();
        assert_eq!(second, ApplyOutcome::Duplicate);
        let after = h.store.current_subscription(tenant).await.unwrap().unwrap();
        assert_eq!(before, after, "duplicate must not touch the subscription");
    }

    // =========================================================================
    // Full out-of-order scenario: activate day 3, expire day 34, then a
    // late failure from day 32 arrives - it is stale and changes nothing
    // =========================================================================
    #[tokio::test]
    async fn late_event_older_than_watermark_is_stale() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;

        let payment =
            BillingEvent::new("evt-pay", tenant, BillingEventKind::PaymentSucceeded, day(3));
        h.engine.reconciler().apply(&payment).await.unwrap();
        assert_eq!(h.status(tenant).await, SubscriptionStatus::Active);

        // Period ran out at day 33; the day 34 sweep expires it
        let summary = h.engine.scheduler().run_once(day(34)).await.unwrap();
        assert_eq!(summary.expired_periods, 1);
        assert_eq!(h.status(tenant).await, SubscriptionStatus::Expired);

        // A failure from before the expiry arrives late
        let late =
            BillingEvent::new("evt-late", tenant, BillingEventKind::PaymentFailed, day(32));
        let outcome = h.engine.reconciler().apply(&late).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(h.status(tenant).await, SubscriptionStatus::Expired);

        // The stale event is recorded, so its redelivery is a duplicate
        let redelivered = h.engine.reconciler().apply(&late).await.unwrap();
        assert_eq!(redelivered, ApplyOutcome::Duplicate);
    }

    // =========================================================================
    // Valid event with no applicable transition is recorded as processed
    // =========================================================================
    #[tokio::test]
    async fn no_transition_event_still_deduplicates() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;

        // A failure during trial changes nothing
        let event =
            BillingEvent::new("evt-noop", tenant, BillingEventKind::PaymentFailed, day(2));
        assert_eq!(
            h.engine.reconciler().apply(&event).await.unwrap(),
            ApplyOutcome::NoTransition
        );
        assert_eq!(h.status(tenant).await, SubscriptionStatus::Trial);
        assert_eq!(
            h.engine.reconciler().apply(&event).await.unwrap(),
            ApplyOutcome::Duplicate
        );
    }

    // =========================================================================
    // Activation zeroes the counter: usage burned in trial does not carry
    // into the first paid cycle
    // =========================================================================
    #[tokio::test]
    async fn activation_starts_a_fresh_counter_cycle() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(3)).await;
        for _ in 0..3 {
            assert!(h
                .engine
                .gate()
                .authorize(tenant, ResourceKind::Job)
                .await
                .is_allowed());
        }

        let payment =
            BillingEvent::new("evt-pay", tenant, BillingEventKind::PaymentSucceeded, day(3));
        h.engine.reconciler().apply(&payment).await.unwrap();

        let sub = h.store.current_subscription(tenant).await.unwrap().unwrap();
        assert_eq!(sub.jobs_created_this_month, 0);
        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());
    }

    // =========================================================================
    // Unknown tenant - the event surfaces NotFound instead of vanishing
    // =========================================================================
    #[tokio::test]
    async fn event_for_unknown_tenant_errors() {
        let h = harness();
        let event = BillingEvent::new(
            "evt-ghost",
            Uuid::new_v4(),
            BillingEventKind::PaymentSucceeded,
            day(1),
        );
        let err = h.engine.reconciler().apply(&event).await.unwrap_err();
        assert!(matches!(err, crate::EntitlementError::NotFound(_)));
    }

    // =========================================================================
    // Lifecycle transitions emit notifications; silent ones do not
    // =========================================================================
    #[tokio::test]
    async fn transitions_emit_notifications() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;

        let payment =
            BillingEvent::new("evt-pay", tenant, BillingEventKind::PaymentSucceeded, day(3));
        h.engine.reconciler().apply(&payment).await.unwrap();

        let delivered = h.sink.drain().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].from, SubscriptionStatus::Trial);
        assert_eq!(delivered[0].to, SubscriptionStatus::Active);

        // A renewal keeps the status and stays silent
        let renewal = BillingEvent::new(
            "evt-renew",
            tenant,
            BillingEventKind::SubscriptionRenewed,
            day(20),
        );
        h.engine.reconciler().apply(&renewal).await.unwrap();
        assert!(h.sink.drain().await.is_empty());
    }
}

mod lifecycle_sweeps {
    use super::*;

    // =========================================================================
    // Sweeping twice at the same instant - the second pass changes nothing
    // =========================================================================
    #[tokio::test]
    async fn sweep_is_idempotent() {
        let h = harness();
        let expired_trial = h.trial_tenant(JobLimit::Limited(5)).await;
        let still_active = h.active_tenant(JobLimit::Limited(5), day(3)).await;

        let first = h.engine.scheduler().run_once(day(8)).await.unwrap();
        assert_eq!(first.scanned, 2);
        assert_eq!(first.expired_trials, 1);
        assert_eq!(h.status(expired_trial).await, SubscriptionStatus::Expired);
        assert_eq!(h.status(still_active).await, SubscriptionStatus::Active);

        let second = h.engine.scheduler().run_once(day(8)).await.unwrap();
        assert_eq!(second.scanned, 1, "terminal rows drop out of the sweep");
        assert_eq!(second.expired_trials, 0);
        assert_eq!(second.counters_reset, 0);
    }

    // =========================================================================
    // Expiry fires strictly after the deadline, not at it
    // =========================================================================
    #[tokio::test]
    async fn sweep_at_exact_deadline_does_not_expire() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;

        let at_deadline = h.engine.scheduler().run_once(day(7)).await.unwrap();
        assert_eq!(at_deadline.expired_trials, 0);
        assert_eq!(h.status(tenant).await, SubscriptionStatus::Trial);

        let past_deadline = h
            .engine
            .scheduler()
            .run_once(day(7) + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(past_deadline.expired_trials, 1);
    }

    // =========================================================================
    // Month rollover inside a paid period - the sweep resets the counter
    // without touching the subscription
    // =========================================================================
    #[tokio::test]
    async fn sweep_resets_counters_across_month_boundary() {
        let h = harness();
        // Payment on day 28 pushes the period well into April
        let tenant = h.active_tenant(JobLimit::Limited(5), day(28)).await;
        for _ in 0..2 {
            assert!(h
                .engine
                .gate()
                .authorize(tenant, ResourceKind::Job)
                .await
                .is_allowed());
        }

        let summary = h
            .engine
            .scheduler()
            .run_once(datetime!(2025-04-03 00:00 UTC))
            .await
            .unwrap();
        assert_eq!(summary.expired_periods, 0);
        assert_eq!(summary.counters_reset, 1);

        let sub = h.store.current_subscription(tenant).await.unwrap().unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Active);
        assert_eq!(sub.jobs_created_this_month, 0);
    }

    // =========================================================================
    // Expired-this-sweep tenants get no counter reset; entitlement is gone
    // =========================================================================
    #[tokio::test]
    async fn expired_tenant_gets_no_reset() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;
        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());

        let summary = h
            .engine
            .scheduler()
            .run_once(datetime!(2025-04-03 00:00 UTC))
            .await
            .unwrap();
        assert_eq!(summary.expired_trials, 1);
        assert_eq!(summary.counters_reset, 0);

        let sub = h.store.current_subscription(tenant).await.unwrap().unwrap();
        assert_eq!(sub.jobs_created_this_month, 1, "counter left as-is");
    }
}

mod entitlement_gate {
    use super::*;

    // =========================================================================
    // Storage outage - the gate denies rather than guessing
    // =========================================================================
    #[tokio::test]
    async fn gate_fails_closed_when_storage_is_down() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Unlimited).await;
        h.store.set_unavailable(true);

        let decision = h.engine.gate().authorize(tenant, ResourceKind::Job).await;
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::TemporarilyUnavailable)
        );

        h.store.set_unavailable(false);
        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());
    }

    // =========================================================================
    // No subscription at all - denied, not crashed
    // =========================================================================
    #[tokio::test]
    async fn unknown_tenant_is_denied() {
        let h = harness();
        let decision = h
            .engine
            .gate()
            .authorize(Uuid::new_v4(), ResourceKind::Job)
            .await;
        assert_eq!(decision, Decision::Deny(DenyReason::NoActiveSubscription));
    }

    // =========================================================================
    // Member seats are a guard against the live roster count
    // =========================================================================
    #[tokio::test]
    async fn member_limit_tracks_the_roster() {
        let h = harness();
        let plan = h.plan(JobLimit::Unlimited, 2).await;
        let tenant = Uuid::new_v4();
        h.engine
            .start_trial_at(tenant, plan.id, day(0))
            .await
            .unwrap();

        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Member)
            .await
            .is_allowed());
        h.store.record_member_added(tenant).await;
        h.store.record_member_added(tenant).await;

        assert_eq!(
            h.engine.gate().authorize(tenant, ResourceKind::Member).await,
            Decision::Deny(DenyReason::LimitReached {
                limit: 2,
                current: 2
            })
        );

        // Deactivating a member frees the seat
        h.store.record_member_removed(tenant).await;
        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Member)
            .await
            .is_allowed());
    }

    // =========================================================================
    // Deny reasons per status: past_due and canceled read as no active
    // subscription, expired as expired
    // =========================================================================
    #[tokio::test]
    async fn deny_reason_matches_status() {
        let h = harness();
        let tenant = h.active_tenant(JobLimit::Unlimited, day(3)).await;

        let failed =
            BillingEvent::new("evt-fail", tenant, BillingEventKind::PaymentFailed, day(10));
        h.engine.reconciler().apply(&failed).await.unwrap();
        assert_eq!(
            h.engine.gate().authorize(tenant, ResourceKind::Job).await,
            Decision::Deny(DenyReason::NoActiveSubscription)
        );

        h.engine.scheduler().run_once(day(40)).await.unwrap();
        assert_eq!(h.status(tenant).await, SubscriptionStatus::Expired);
        assert_eq!(
            h.engine.gate().authorize(tenant, ResourceKind::Job).await,
            Decision::Deny(DenyReason::SubscriptionExpired)
        );
    }
}

mod grace_and_admin {
    use super::*;

    // =========================================================================
    // Past-due tenant regains access through a grace grant, loses it again
    // when the grace window expires
    // =========================================================================
    #[tokio::test]
    async fn grace_grant_restores_access_until_expiry() {
        let h = harness();
        let tenant = h.active_tenant(JobLimit::Limited(5), day(3)).await;

        let failed =
            BillingEvent::new("evt-fail", tenant, BillingEventKind::PaymentFailed, day(10));
        h.engine.reconciler().apply(&failed).await.unwrap();
        assert!(!h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());

        let sub = h
            .engine
            .admin()
            .grant_grace_period_at(tenant, Some(5), "payment dispute pending", day(11))
            .await
            .unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::GracePeriod);
        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());

        h.engine.scheduler().run_once(day(17)).await.unwrap();
        assert_eq!(h.status(tenant).await, SubscriptionStatus::Expired);
        assert!(!h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());
    }

    // =========================================================================
    // Grace on a non-past-due tenant is rejected as an invalid transition
    // =========================================================================
    #[tokio::test]
    async fn grace_grant_requires_past_due() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;
        let err = h
            .engine
            .admin()
            .grant_grace_period_at(tenant, None, "goodwill", day(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::EntitlementError::InvalidTransition { .. }
        ));
    }

    // =========================================================================
    // Suspension cancels immediately from any live state, with the reason
    // on the record and in the notification
    // =========================================================================
    #[tokio::test]
    async fn suspension_cancels_with_reason() {
        let h = harness();
        let tenant = h.active_tenant(JobLimit::Limited(5), day(3)).await;
        h.sink.drain().await;

        let sub = h
            .engine
            .admin()
            .suspend_at(tenant, "fraud review", day(5))
            .await
            .unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Canceled);

        let delivered = h.sink.drain().await;
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].reason.contains("fraud review"));
        assert!(!h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());
    }

    // =========================================================================
    // Custom plan swap-in on a live subscription raises the limit in place
    // =========================================================================
    #[tokio::test]
    async fn custom_plan_applies_to_live_subscription() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(1)).await;
        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());
        assert!(!h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());

        let (plan, sub) = h
            .engine
            .admin()
            .apply_custom_plan(
                tenant,
                crate::CustomPlanParams {
                    name: "Enterprise Custom".into(),
                    monthly_price_cents: 49900,
                    job_limit: JobLimit::Limited(100),
                    member_limit: 50,
                    features: vec!["priority_support".into()],
                },
            )
            .await
            .unwrap();
        assert!(plan.is_custom);
        assert_eq!(plan.custom_owner_tenant_id, Some(tenant));
        assert_eq!(sub.plan_id, plan.id);
        assert_eq!(sub.status(), SubscriptionStatus::Trial, "status unchanged");

        assert!(h
            .engine
            .gate()
            .authorize(tenant, ResourceKind::Job)
            .await
            .is_allowed());
    }

    // =========================================================================
    // Resubscribe after expiry: new active row, old one kept as history,
    // no second trial
    // =========================================================================
    #[tokio::test]
    async fn resubscribe_after_expiry_starts_active() {
        let h = harness();
        let tenant = h.trial_tenant(JobLimit::Limited(5)).await;
        h.engine.scheduler().run_once(day(8)).await.unwrap();
        assert_eq!(h.status(tenant).await, SubscriptionStatus::Expired);

        let plan = h.plan(JobLimit::Limited(20), 10).await;
        let sub = h
            .engine
            .resubscribe_at(tenant, plan.id, day(10))
            .await
            .unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Active);
        assert!(sub.trial_ends_at.is_none());
        assert_eq!(h.store.all_subscriptions().await.unwrap().len(), 2);
    }
}

mod invariants {
    use super::*;

    // =========================================================================
    // A full lifecycle run leaves the stored state consistent
    // =========================================================================
    #[tokio::test]
    async fn checks_pass_after_normal_operation() {
        let h = harness();
        let tenant = h.active_tenant(JobLimit::Limited(5), day(3)).await;
        for _ in 0..5 {
            assert!(h
                .engine
                .gate()
                .authorize(tenant, ResourceKind::Job)
                .await
                .is_allowed());
        }
        h.engine.scheduler().run_once(day(20)).await.unwrap();

        let summary = h.engine.invariants().run_all_checks().await.unwrap();
        assert!(summary.healthy, "violations: {:?}", summary.violations);
        assert_eq!(summary.checks_run, 4);
    }

    // =========================================================================
    // A counter pushed past the plan cap is flagged as critical
    // =========================================================================
    #[tokio::test]
    async fn over_limit_counter_is_flagged() {
        let h = harness();
        let plan = h.plan(JobLimit::Limited(2), 10).await;
        let tenant = Uuid::new_v4();
        let mut sub = crate::Subscription::new_trial(tenant, plan.id, day(0), 7);
        sub.jobs_created_this_month = 99;
        h.store.insert_subscription(&sub).await.unwrap();

        let summary = h.engine.invariants().run_all_checks().await.unwrap();
        assert!(!summary.healthy);
        assert!(summary
            .violations
            .iter()
            .any(|v| v.invariant == "counter_within_plan_limit"
                && v.severity == crate::ViolationSeverity::Critical));
    }
}
