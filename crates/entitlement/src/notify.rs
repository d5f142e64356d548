//! Lifecycle notification intents
//!
//! On every status change the engine emits an intent describing the
//! transition. Delivery (email, in-app, webhooks to the tenant) is owned by
//! the external notification subsystem; the engine never sends anything
//! itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::subscription::{SideEffect, SubscriptionStatus};

/// One emitted transition, consumed by the notification subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleNotification {
    pub tenant_id: Uuid,
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
    pub reason: String,
    pub at: OffsetDateTime,
}

/// Consumer seam for lifecycle notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: LifecycleNotification);
}

/// Default sink: structured log line per transition. The log stream is
/// tailed by the notification subsystem in deployments without a queue.
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn deliver(&self, n: LifecycleNotification) {
        tracing::info!(
            tenant_id = %n.tenant_id,
            from = %n.from,
            to = %n.to,
            reason = %n.reason,
            at = %n.at,
            "Subscription lifecycle transition"
        );
    }
}

/// In-memory sink that records every notification; used by tests and
/// single-process setups that drain it themselves.
#[derive(Default)]
pub struct CollectingSink {
    delivered: Mutex<Vec<LifecycleNotification>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<LifecycleNotification> {
        std::mem::take(&mut *self.delivered.lock().await)
    }

    pub async fn delivered(&self) -> Vec<LifecycleNotification> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for CollectingSink {
    async fn deliver(&self, n: LifecycleNotification) {
        self.delivered.lock().await.push(n);
    }
}

/// Forward the `Notify` intents from a transition's side effects
pub(crate) async fn forward_effects(
    sink: &Arc<dyn NotificationSink>,
    tenant_id: Uuid,
    at: OffsetDateTime,
    effects: &[SideEffect],
) {
    for effect in effects {
        if let SideEffect::Notify { from, to, reason } = effect {
            sink.deliver(LifecycleNotification {
                tenant_id,
                from: *from,
                to: *to,
                reason: reason.clone(),
                at,
            })
            .await;
        }
    }
}
