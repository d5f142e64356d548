//! Plan catalog types
//!
//! Plans are immutable catalog entries, read-only to the engine. Admin
//! tooling creates them; `apply_custom_plan` inserts tenant-owned custom
//! plans through the same store path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monthly job-posting allowance for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum JobLimit {
    /// At most this many job postings per calendar month
    Limited(u32),
    /// No cap on monthly job postings
    Unlimited,
}

impl JobLimit {
    /// Whether `current` uses of the allowance leave room for one more
    pub fn permits(&self, current: i64) -> bool {
        match self {
            JobLimit::Unlimited => true,
            JobLimit::Limited(limit) => current < i64::from(*limit),
        }
    }

    /// Remaining allowance after `current` uses, `None` when unlimited
    pub fn remaining(&self, current: i64) -> Option<i64> {
        match self {
            JobLimit::Unlimited => None,
            JobLimit::Limited(limit) => Some((i64::from(*limit) - current).max(0)),
        }
    }

    /// Numeric cap for reporting, `None` when unlimited
    pub fn cap(&self) -> Option<i64> {
        match self {
            JobLimit::Unlimited => None,
            JobLimit::Limited(limit) => Some(i64::from(*limit)),
        }
    }
}

/// Immutable catalog entry describing what a subscription entitles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    /// Display name, e.g. "Growth"
    pub name: String,
    pub monthly_price_cents: i64,
    /// Job postings allowed per calendar month
    pub job_limit: JobLimit,
    /// Active team members allowed (always at least 1)
    pub member_limit: u32,
    /// Feature slugs enabled on this plan
    pub features: Vec<String>,
    /// Tenant-specific plan created by admin tooling
    pub is_custom: bool,
    /// Owning tenant for custom plans
    pub custom_owner_tenant_id: Option<Uuid>,
}

impl Plan {
    /// Standard catalog plan
    pub fn standard(
        name: impl Into<String>,
        monthly_price_cents: i64,
        job_limit: JobLimit,
        member_limit: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            monthly_price_cents,
            job_limit,
            member_limit: member_limit.max(1),
            features: Vec::new(),
            is_custom: false,
            custom_owner_tenant_id: None,
        }
    }

    /// Tenant-owned custom plan
    pub fn custom(
        owner_tenant_id: Uuid,
        name: impl Into<String>,
        monthly_price_cents: i64,
        job_limit: JobLimit,
        member_limit: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            monthly_price_cents,
            job_limit,
            member_limit: member_limit.max(1),
            features: Vec::new(),
            is_custom: true,
            custom_owner_tenant_id: Some(owner_tenant_id),
        }
    }

    pub fn with_features(mut self, features: Vec<String>) -> Self {
        self.features = features;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_permits_below_cap_only() {
        let limit = JobLimit::Limited(5);
        assert!(limit.permits(0));
        assert!(limit.permits(4));
        assert!(!limit.permits(5));
        assert!(!limit.permits(6));
    }

    #[test]
    fn unlimited_always_permits() {
        assert!(JobLimit::Unlimited.permits(i64::MAX - 1));
        assert_eq!(JobLimit::Unlimited.remaining(1_000_000), None);
    }

    #[test]
    fn remaining_never_negative() {
        assert_eq!(JobLimit::Limited(3).remaining(7), Some(0));
        assert_eq!(JobLimit::Limited(3).remaining(1), Some(2));
    }

    #[test]
    fn member_limit_floor_is_one() {
        let plan = Plan::standard("Solo", 0, JobLimit::Limited(1), 0);
        assert_eq!(plan.member_limit, 1);
    }
}
