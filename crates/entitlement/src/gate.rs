//! Entitlement gate
//!
//! The single call site metered actions use before mutating domain data.
//! Job grants are two-phase: the caller commits the reservation alongside
//! its own write, or releases it on failure so an aborted job creation
//! does not burn a slot. Member grants are a plain guard.
//!
//! Fails closed: if the store is unreachable the answer is a denial, never
//! a silent grant.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EntitlementResult;
use crate::store::EntitlementStore;
use crate::subscription::SubscriptionStatus;
use crate::usage::ReserveOutcome;

/// Metered resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Job,
    Member,
}

/// Why an authorization was denied. Each maps to a distinct user-facing
/// message in the calling handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    NoActiveSubscription,
    SubscriptionExpired,
    LimitReached { limit: i64, current: i64 },
    TemporarilyUnavailable,
}

/// A provisional grant of one unit of a metered resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub resource: ResourceKind,
    /// Allowance left after this grant; `None` on unlimited plans and for
    /// member grants
    pub remaining: Option<i64>,
}

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow(Reservation),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

pub struct EntitlementGate {
    store: Arc<dyn EntitlementStore>,
}

impl EntitlementGate {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// May this tenant consume one unit of `resource` right now?
    ///
    /// Storage failures are swallowed into `Deny(TemporarilyUnavailable)`;
    /// this path must never grant on error.
    pub async fn authorize(&self, tenant_id: Uuid, resource: ResourceKind) -> Decision {
        match self.authorize_inner(tenant_id, resource).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    resource = ?resource,
                    error = %e,
                    "Entitlement check failed, denying"
                );
                Decision::Deny(DenyReason::TemporarilyUnavailable)
            }
        }
    }

    async fn authorize_inner(
        &self,
        tenant_id: Uuid,
        resource: ResourceKind,
    ) -> EntitlementResult<Decision> {
        let Some(sub) = self.store.current_subscription(tenant_id).await? else {
            return Ok(Decision::Deny(DenyReason::NoActiveSubscription));
        };
        match sub.status() {
            SubscriptionStatus::Expired => {
                return Ok(Decision::Deny(DenyReason::SubscriptionExpired))
            }
            SubscriptionStatus::Canceled | SubscriptionStatus::PastDue => {
                return Ok(Decision::Deny(DenyReason::NoActiveSubscription))
            }
            _ => {}
        }

        match resource {
            ResourceKind::Job => {
                let reservation_id = Uuid::new_v4();
                match self
                    .store
                    .try_reserve_job_slot(tenant_id, reservation_id)
                    .await?
                {
                    ReserveOutcome::Granted { remaining } => {
                        Ok(Decision::Allow(Reservation {
                            id: reservation_id,
                            tenant_id,
                            resource: ResourceKind::Job,
                            remaining,
                        }))
                    }
                    ReserveOutcome::LimitReached { limit, current } => {
                        Ok(Decision::Deny(DenyReason::LimitReached { limit, current }))
                    }
                    // The subscription changed between the status check and
                    // the reservation; deny rather than assume.
                    ReserveOutcome::NoActiveSubscription => {
                        Ok(Decision::Deny(DenyReason::NoActiveSubscription))
                    }
                }
            }
            ResourceKind::Member => {
                let plan = self.store.plan(sub.plan_id).await?;
                let limit = i64::from(plan.member_limit);
                let current = self.store.active_member_count(tenant_id).await?;
                if current < limit {
                    // Guard only: member creation is low-frequency and the
                    // roster's own constraints guarantee final uniqueness.
                    Ok(Decision::Allow(Reservation {
                        id: Uuid::new_v4(),
                        tenant_id,
                        resource: ResourceKind::Member,
                        remaining: Some(limit - current - 1),
                    }))
                } else {
                    Ok(Decision::Deny(DenyReason::LimitReached { limit, current }))
                }
            }
        }
    }

    /// Finalize a grant; the caller's own write succeeded
    pub async fn commit(&self, reservation: &Reservation) -> EntitlementResult<()> {
        match reservation.resource {
            ResourceKind::Job => self.store.commit_reservation(reservation.id).await,
            ResourceKind::Member => Ok(()),
        }
    }

    /// Return a grant; the caller's own write failed or was abandoned
    pub async fn release(&self, reservation: &Reservation) -> EntitlementResult<()> {
        match reservation.resource {
            ResourceKind::Job => self.store.release_reservation(reservation.id).await,
            ResourceKind::Member => Ok(()),
        }
    }
}
