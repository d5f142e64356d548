//! Durable entitlement state
//!
//! The store is the only component touching persistent storage. Both
//! backends honor the same contract: every mutation of a tenant's
//! subscription row is a single conditional update, so no two concurrent
//! writers can both believe they performed the authoritative transition or
//! the authoritative increment.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgEntitlementStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EntitlementResult;
use crate::event::{BillingEvent, ProcessedOutcome};
use crate::plan::Plan;
use crate::subscription::{Phase, Subscription};
use crate::usage::ReserveOutcome;

/// One guarded phase persist. Applied atomically with the optional counter
/// reset and processed-event marker: either everything lands or nothing
/// does.
#[derive(Debug, Clone)]
pub struct TransitionUpdate {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    /// Version the caller observed; the update fails with `Conflict` if the
    /// row has moved on.
    pub expected_version: i64,
    pub phase: Phase,
    /// New ordering watermark, normally the event's `occurred_at` or the
    /// sweep time for synthetic ticks.
    pub last_event_at: OffsetDateTime,
    /// Zero the monthly job counter in the same statement
    pub reset_counters: bool,
    /// Replace the plan (admin custom-plan application)
    pub new_plan_id: Option<Uuid>,
    /// Billing event whose processed marker must land with the transition
    pub processed_event: Option<BillingEvent>,
}

impl TransitionUpdate {
    pub fn for_subscription(sub: &Subscription, phase: Phase, last_event_at: OffsetDateTime) -> Self {
        Self {
            subscription_id: sub.id,
            tenant_id: sub.tenant_id,
            expected_version: sub.version,
            phase,
            last_event_at,
            reset_counters: false,
            new_plan_id: None,
            processed_event: None,
        }
    }
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    // --- Plan catalog ---

    async fn insert_plan(&self, plan: &Plan) -> EntitlementResult<()>;

    async fn plan(&self, plan_id: Uuid) -> EntitlementResult<Plan>;

    // --- Subscriptions ---

    /// Insert a new subscription. Fails with `AlreadySubscribed` when the
    /// tenant already holds a live one.
    async fn insert_subscription(&self, sub: &Subscription) -> EntitlementResult<()>;

    /// The tenant's most recent subscription, live or terminal
    async fn current_subscription(&self, tenant_id: Uuid)
        -> EntitlementResult<Option<Subscription>>;

    /// Every subscription in a live status, for scheduler sweeps
    async fn live_subscriptions(&self) -> EntitlementResult<Vec<Subscription>>;

    /// Every subscription including terminal history, for invariant checks
    async fn all_subscriptions(&self) -> EntitlementResult<Vec<Subscription>>;

    /// Apply a guarded phase transition. Returns the updated row, or
    /// `Conflict` when `expected_version` lost the race.
    async fn persist_transition(&self, update: TransitionUpdate)
        -> EntitlementResult<Subscription>;

    // --- Billing event dedup ---

    /// Outcome previously recorded for this event id, if any
    async fn processed_outcome(&self, event_id: &str)
        -> EntitlementResult<Option<ProcessedOutcome>>;

    /// Record an event as processed without a transition (stale or
    /// no-transition outcomes). Returns false when the id was already
    /// recorded by another writer.
    async fn mark_event_processed(
        &self,
        event: &BillingEvent,
        outcome: ProcessedOutcome,
    ) -> EntitlementResult<bool>;

    // --- Usage counters ---

    /// Atomic increment-if-below-limit against the monthly job counter.
    /// On grant, an open reservation row keyed by `reservation_id` is
    /// written in the same unit so the slot can later be committed or
    /// released.
    async fn try_reserve_job_slot(
        &self,
        tenant_id: Uuid,
        reservation_id: Uuid,
    ) -> EntitlementResult<ReserveOutcome>;

    /// Finalize an open reservation; the increment stands
    async fn commit_reservation(&self, reservation_id: Uuid) -> EntitlementResult<()>;

    /// Return an open reservation's slot. Decrements exactly once; a second
    /// release of the same reservation is a no-op.
    async fn release_reservation(&self, reservation_id: Uuid) -> EntitlementResult<()>;

    /// Monthly reset, guarded by a conditional update on
    /// `last_counter_reset_at`: concurrent callers apply it exactly once
    /// per tenant per cycle. Returns whether this call performed the reset.
    async fn reset_counter_if_due(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> EntitlementResult<bool>;

    // --- Member roster ---

    /// Live count of active members, recomputed from the roster
    async fn active_member_count(&self, tenant_id: Uuid) -> EntitlementResult<i64>;
}
