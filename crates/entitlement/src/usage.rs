//! Usage counter semantics
//!
//! The monthly job counter is mutated only through the store's conditional
//! increment-if-below-limit and the guarded monthly reset; both are single
//! atomic statements, never read-then-write. This module holds the outcome
//! types and the pure calendar logic those primitives share.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Outcome of a conditional job-slot reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReserveOutcome {
    /// The counter was incremented; `remaining` is `None` for unlimited plans
    Granted { remaining: Option<i64> },
    /// Counter already at the plan cap; nothing was mutated
    LimitReached { limit: i64, current: i64 },
    /// Tenant has no subscription in an entitled status
    NoActiveSubscription,
}

/// Whether a monthly reset is due: `now` has crossed into a later calendar
/// month (UTC) than the one `last_reset` falls in.
pub fn reset_is_due(last_reset: OffsetDateTime, now: OffsetDateTime) -> bool {
    let last = (last_reset.year(), last_reset.month() as u8);
    let current = (now.year(), now.month() as u8);
    current > last
}
