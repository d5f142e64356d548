//! Error types for the entitlement engine
//!
//! Denials from the gate and business outcomes like `LimitReached` are not
//! errors; they are regular return values. This enum covers the failure
//! taxonomy only.

use uuid::Uuid;

/// Result alias used throughout the engine
pub type EntitlementResult<T> = Result<T, EntitlementError>;

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    /// No subscription exists for the tenant
    #[error("No subscription found for tenant {0}")]
    NotFound(Uuid),

    /// Plan referenced by a subscription is missing from the catalog
    #[error("Plan {0} not found")]
    PlanNotFound(Uuid),

    /// A concurrent writer won the conditional update. The caller retries
    /// the whole operation; it must never assume the write happened.
    #[error("Concurrent update conflict for tenant {0}")]
    Conflict(Uuid),

    /// Billing event is older than the last event applied to the
    /// subscription. Recorded, never retried.
    #[error("Billing event {event_id} is stale (occurred before last applied event)")]
    Stale { event_id: String },

    /// Billing event was already processed. Recorded, never retried.
    #[error("Billing event {event_id} already processed")]
    Duplicate { event_id: String },

    /// The requested state-machine event does not apply to the current
    /// subscription state (e.g. admin action on a terminal subscription).
    #[error("Invalid transition for tenant {tenant_id}: {reason}")]
    InvalidTransition { tenant_id: Uuid, reason: String },

    /// A tenant already holds a live subscription
    #[error("Tenant {0} already has a live subscription")]
    AlreadySubscribed(Uuid),

    /// Storage unreachable or retry budget exhausted. The gate fails closed
    /// on this: callers see a denial, never a silent grant.
    #[error("Entitlement storage temporarily unavailable")]
    TemporarilyUnavailable,

    /// Underlying storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for EntitlementError {
    fn from(err: sqlx::Error) -> Self {
        EntitlementError::Storage(err.to_string())
    }
}

impl EntitlementError {
    /// Whether a caller-side retry of the whole operation can succeed.
    ///
    /// `Stale` and `Duplicate` are terminal by construction; retrying them
    /// is a no-op.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EntitlementError::Conflict(_))
    }
}
