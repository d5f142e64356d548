//! Normalized billing events
//!
//! The webhook adapter (out of scope here) verifies and normalizes raw
//! processor payloads into `BillingEvent` before handing them to the
//! reconciler. Events are immutable facts: once stored they are only ever
//! marked processed, never deleted.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::subscription::LifecycleEvent;

/// Kind of normalized processor event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventKind {
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionCanceled,
    SubscriptionRenewed,
}

impl BillingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventKind::PaymentSucceeded => "payment_succeeded",
            BillingEventKind::PaymentFailed => "payment_failed",
            BillingEventKind::SubscriptionCanceled => "subscription_canceled",
            BillingEventKind::SubscriptionRenewed => "subscription_renewed",
        }
    }

    pub fn to_lifecycle_event(self) -> LifecycleEvent {
        match self {
            BillingEventKind::PaymentSucceeded => LifecycleEvent::PaymentSucceeded,
            BillingEventKind::PaymentFailed => LifecycleEvent::PaymentFailed,
            BillingEventKind::SubscriptionCanceled => LifecycleEvent::SubscriptionCanceled,
            BillingEventKind::SubscriptionRenewed => LifecycleEvent::SubscriptionRenewed,
        }
    }
}

impl std::fmt::Display for BillingEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An external billing fact handed to the reconciler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    /// Globally unique processor event id, used for deduplication
    pub event_id: String,
    pub tenant_id: Uuid,
    pub kind: BillingEventKind,
    pub occurred_at: OffsetDateTime,
    /// Raw normalized payload, kept for audit
    pub payload: serde_json::Value,
}

impl BillingEvent {
    pub fn new(
        event_id: impl Into<String>,
        tenant_id: Uuid,
        kind: BillingEventKind,
        occurred_at: OffsetDateTime,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            tenant_id,
            kind,
            occurred_at,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Result recorded against a processed event id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedOutcome {
    /// The event caused a persisted transition
    Applied,
    /// The event was valid but changed nothing
    NoTransition,
    /// The event was older than the last applied event and was rejected
    Stale,
}

impl ProcessedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedOutcome::Applied => "applied",
            ProcessedOutcome::NoTransition => "no_transition",
            ProcessedOutcome::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(ProcessedOutcome::Applied),
            "no_transition" => Some(ProcessedOutcome::NoTransition),
            "stale" => Some(ProcessedOutcome::Stale),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessedOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
