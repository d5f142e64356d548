//! Runnable entitlement invariants
//!
//! Non-destructive consistency checks that can be run after any mutation,
//! sweep, or event replay. Each check reads through the store trait so it
//! covers both backends.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EntitlementResult;
use crate::plan::JobLimit;
use crate::store::EntitlementStore;

/// Result of one failed invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected
    pub tenant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - tenants may be over- or under-entitled right now
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of one checker run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct InvariantChecker {
    store: Arc<dyn EntitlementStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_live_subscription",
            "counter_within_plan_limit",
            "counter_nonnegative",
            "reset_marker_not_in_future",
        ]
    }

    /// Run every check and summarize
    pub async fn run_all_checks(&self) -> EntitlementResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        let checks = Self::available_checks();
        for name in &checks {
            violations.extend(self.run_check(name).await?);
        }

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: checks.len(),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    pub async fn run_check(&self, name: &str) -> EntitlementResult<Vec<InvariantViolation>> {
        match name {
            "single_live_subscription" => self.check_single_live_subscription().await,
            "counter_within_plan_limit" => self.check_counter_within_plan_limit().await,
            "counter_nonnegative" => self.check_counter_nonnegative().await,
            "reset_marker_not_in_future" => self.check_reset_marker_not_in_future().await,
            _ => Ok(vec![]),
        }
    }

    /// At most one live subscription per tenant. Two live rows means
    /// double-billing and ambiguous entitlement.
    async fn check_single_live_subscription(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let mut live_counts: HashMap<Uuid, usize> = HashMap::new();
        for sub in self.store.all_subscriptions().await? {
            if sub.status().is_live() {
                *live_counts.entry(sub.tenant_id).or_insert(0) += 1;
            }
        }
        Ok(live_counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(tenant_id, count)| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                tenant_ids: vec![tenant_id],
                description: format!("Tenant has {count} live subscriptions (expected at most 1)"),
                context: serde_json::json!({ "live_count": count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// The monthly job counter never exceeds the plan cap. A breach means
    /// the conditional increment was bypassed somewhere.
    async fn check_counter_within_plan_limit(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for sub in self.store.all_subscriptions().await? {
            if !sub.status().is_live() {
                continue;
            }
            let plan = self.store.plan(sub.plan_id).await?;
            if let JobLimit::Limited(limit) = plan.job_limit {
                if sub.jobs_created_this_month > i64::from(limit) {
                    violations.push(InvariantViolation {
                        invariant: "counter_within_plan_limit".to_string(),
                        tenant_ids: vec![sub.tenant_id],
                        description: format!(
                            "Job counter {} exceeds plan '{}' limit {}",
                            sub.jobs_created_this_month, plan.name, limit
                        ),
                        context: serde_json::json!({
                            "jobs_created_this_month": sub.jobs_created_this_month,
                            "job_limit": limit,
                            "plan_id": plan.id,
                        }),
                        severity: ViolationSeverity::Critical,
                    });
                }
            }
        }
        Ok(violations)
    }

    /// Releases must never drive the counter below zero
    async fn check_counter_nonnegative(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .all_subscriptions()
            .await?
            .into_iter()
            .filter(|sub| sub.jobs_created_this_month < 0)
            .map(|sub| InvariantViolation {
                invariant: "counter_nonnegative".to_string(),
                tenant_ids: vec![sub.tenant_id],
                description: format!(
                    "Job counter is negative ({})",
                    sub.jobs_created_this_month
                ),
                context: serde_json::json!({
                    "jobs_created_this_month": sub.jobs_created_this_month,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A reset marker in the future would suppress the next cycle's reset
    async fn check_reset_marker_not_in_future(
        &self,
    ) -> EntitlementResult<Vec<InvariantViolation>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .store
            .all_subscriptions()
            .await?
            .into_iter()
            .filter(|sub| sub.last_counter_reset_at > now)
            .map(|sub| InvariantViolation {
                invariant: "reset_marker_not_in_future".to_string(),
                tenant_ids: vec![sub.tenant_id],
                description: "last_counter_reset_at is in the future".to_string(),
                context: serde_json::json!({
                    "last_counter_reset_at": sub.last_counter_reset_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
